use burn::{
    module::Module,
    nn::{LayerNorm, LayerNormConfig},
    prelude::Backend,
    tensor::{Bool, Tensor},
};

use super::{
    attention::{LayerMemory, SelfAttention, SelfAttentionConfig},
    residual::{Residual, ResidualKind},
    util::{FeedForward, FeedForwardConfig},
    MemoryTransformerXlConfig,
};

/// One attention + feed-forward layer. Each sublayer sees a LayerNorm'ed
/// input and is merged back into the raw input by its residual strategy.
#[derive(Module, Debug)]
pub struct Block<B: Backend> {
    /// 1-indexed position in the stack.
    pub layer_num: usize,
    attn_norm: LayerNorm<B>,
    attn: SelfAttention<B>,
    attn_residual: Residual<B>,
    ff_norm: LayerNorm<B>,
    ff: FeedForward<B>,
    ff_residual: Residual<B>,
}

#[derive(Clone, Debug)]
pub struct BlockConfig {
    model_config: MemoryTransformerXlConfig,
    layer_num: usize,
}

impl BlockConfig {
    pub fn new(model_config: MemoryTransformerXlConfig, layer_num: usize) -> Self {
        Self {
            model_config,
            layer_num,
        }
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Block<B> {
        let config = &self.model_config;
        let dim = config.dim;
        let residual = ResidualKind::from_flags(config.gru_gated_residual, config.mogrify_gru);

        Block {
            layer_num: self.layer_num,
            attn_norm: LayerNormConfig::new(dim).init(device),
            attn: SelfAttentionConfig::new(dim)
                .with_heads(config.heads)
                .with_attn_dropout(config.attn_dropout)
                .with_dropout(config.attn_layer_dropout)
                .with_memory_dropout(config.memory_attn_dropout)
                .with_one_kv_head(config.one_kv_head)
                .init(device),
            attn_residual: residual.init(dim, device),
            ff_norm: LayerNormConfig::new(dim).init(device),
            ff: FeedForwardConfig::new(dim)
                .with_mult(config.ff_mult)
                .with_dropout(config.ff_dropout)
                .with_glu(config.ff_glu)
                .init(device),
            ff_residual: residual.init(dim, device),
        }
    }
}

impl<B: Backend> Block<B> {
    /// # Parameters
    /// - `x`: `[batch_size, seq_len, dim]`
    /// - `memory`: this layer's memory slice, empty for layers without memory.
    /// - `pos_emb`: `[num_heads, window, head_dim]`
    /// - `input_mask`: `[batch_size, seq_len]`
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        memory: LayerMemory<B>,
        pos_emb: Option<&Tensor<B, 3>>,
        input_mask: Option<&Tensor<B, 2, Bool>>,
    ) -> Tensor<B, 3> {
        let hidden_states = self.attn.forward(
            self.attn_norm.forward(x.clone()),
            memory,
            pos_emb,
            input_mask,
        );
        let x = self.attn_residual.merge(hidden_states, x);

        let hidden_states = self.ff.forward(self.ff_norm.forward(x.clone()));
        self.ff_residual.merge(hidden_states, x)
    }
}
