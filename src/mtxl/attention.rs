use burn::{
    config::Config,
    module::Module,
    nn::{Dropout, DropoutConfig, Linear, LinearConfig},
    prelude::Backend,
    tensor::{activation::softmax, Bool, Tensor, TensorData},
};

use super::util::{cat_nonempty, max_neg_value, relative_shift};

/// One layer's slice of the carried memory.
///
/// Each tensor is `[batch_size, len, dim]`; `None` stands for an empty memory.
#[derive(Clone, Debug)]
pub struct LayerMemory<B: Backend> {
    pub long: Option<Tensor<B, 3>>,
    pub short: Option<Tensor<B, 3>>,
}

impl<B: Backend> LayerMemory<B> {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            long: None,
            short: None,
        }
    }

    /// Total number of memory positions, long and short together.
    #[must_use]
    pub fn len(&self) -> usize {
        let len = |t: &Option<Tensor<B, 3>>| t.as_ref().map_or(0, |t| t.dims()[1]);
        len(&self.long) + len(&self.short)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Long memory followed by short memory along the sequence axis.
    fn concat(self) -> Option<Tensor<B, 3>> {
        cat_nonempty(self.long.into_iter().chain(self.short).collect(), 1)
    }
}

#[derive(Config, Debug)]
pub struct SelfAttentionConfig {
    dim: usize,
    #[config(default = 8)]
    heads: usize,
    /// Dropout on the attention weights.
    #[config(default = 0.0)]
    attn_dropout: f64,
    /// Dropout on the projected output.
    #[config(default = 0.0)]
    dropout: f64,
    /// Dropout on the memory segment of the key/value input.
    #[config(default = 0.0)]
    memory_dropout: f64,
    #[config(default = false)]
    one_kv_head: bool,
}

#[derive(Module, Debug)]
pub struct SelfAttention<B: Backend> {
    to_q: Linear<B>,
    to_kv: Linear<B>,
    to_out: Linear<B>,
    attn_dropout: Dropout,
    dropout: Dropout,
    memory_dropout: Dropout,
    heads: usize,
    head_dim: usize,
    /// Width of one of key or value: `head_dim` with a shared head, `dim` otherwise.
    kv_dim: usize,
}

impl SelfAttentionConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> SelfAttention<B> {
        let head_dim = self.dim / self.heads;
        let kv_dim = if self.one_kv_head { head_dim } else { self.dim };

        SelfAttention {
            to_q: LinearConfig::new(self.dim, self.dim)
                .with_bias(false)
                .init(device),
            to_kv: LinearConfig::new(self.dim, kv_dim * 2)
                .with_bias(false)
                .init(device),
            to_out: LinearConfig::new(self.dim, self.dim).init(device),
            attn_dropout: DropoutConfig::new(self.attn_dropout).init(),
            dropout: DropoutConfig::new(self.dropout).init(),
            memory_dropout: DropoutConfig::new(self.memory_dropout).init(),
            heads: self.heads,
            head_dim,
            kv_dim,
        }
    }
}

impl<B: Backend> SelfAttention<B> {
    /// Attends from the current step over `[long memory, short memory, x]`.
    ///
    /// # Parameters
    /// - `x`: `[batch_size, seq_len, dim]`
    /// - `memory`: this layer's memory slice, read only.
    /// - `pos_emb`: relative position bias `[num_heads, window, head_dim]`,
    ///   where `window` is at least the key length. The last key-length
    ///   positions are used.
    /// - `input_mask`: `[batch_size, seq_len]`, `true` marks a valid token.
    ///
    /// Returns `[batch_size, seq_len, dim]`.
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        memory: LayerMemory<B>,
        pos_emb: Option<&Tensor<B, 3>>,
        input_mask: Option<&Tensor<B, 2, Bool>>,
    ) -> Tensor<B, 3> {
        let [batch_size, seq_len, dim] = x.dims();

        let (attn, v) = self.weights_and_values(x, memory, pos_emb, input_mask);
        let attn = self.attn_dropout.forward(attn);

        // [B, H, T, head_dim] -> [B, T, H * head_dim]
        let out = attn
            .matmul(v)
            .swap_dims(1, 2)
            .reshape([batch_size, seq_len, dim]);

        self.dropout.forward(self.to_out.forward(out))
    }

    /// Post-softmax attention weights, `[batch_size, num_heads, seq_len, mem_len + seq_len]`.
    pub fn attention_weights(
        &self,
        x: Tensor<B, 3>,
        memory: LayerMemory<B>,
        pos_emb: Option<&Tensor<B, 3>>,
        input_mask: Option<&Tensor<B, 2, Bool>>,
    ) -> Tensor<B, 4> {
        self.weights_and_values(x, memory, pos_emb, input_mask).0
    }

    fn weights_and_values(
        &self,
        x: Tensor<B, 3>,
        memory: LayerMemory<B>,
        pos_emb: Option<&Tensor<B, 3>>,
        input_mask: Option<&Tensor<B, 2, Bool>>,
    ) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let [batch_size, seq_len, _dim] = x.dims();
        let device = x.device();
        let mem_len = memory.len();
        let scale = (self.head_dim as f64).powf(-0.5);

        let q = self.to_q.forward(x.clone());

        let kv_input = match memory.concat() {
            Some(mem) => Tensor::cat(vec![self.memory_dropout.forward(mem), x], 1),
            None => x,
        };
        let kv_len = kv_input.dims()[1];
        let kv = self.to_kv.forward(kv_input);
        let k = kv.clone().narrow(2, 0, self.kv_dim);
        let v = kv.narrow(2, self.kv_dim, self.kv_dim);

        // [B, N, H * head_dim] -> [B, H, N, head_dim]
        let split_heads = |t: Tensor<B, 3>, len: usize| {
            t.reshape([batch_size, len, self.kv_dim / self.head_dim, self.head_dim])
                .swap_dims(1, 2)
        };
        let q = q
            .reshape([batch_size, seq_len, self.heads, self.head_dim])
            .swap_dims(1, 2);
        let (mut k, mut v) = (split_heads(k, kv_len), split_heads(v, kv_len));
        if k.dims()[1] == 1 && self.heads > 1 {
            k = k.repeat_dim(1, self.heads);
            v = v.repeat_dim(1, self.heads);
        }

        let mut dots = q.clone().matmul(k.swap_dims(2, 3)) * scale;

        if let Some(pos_emb) = pos_emb {
            let [heads, window, head_dim] = pos_emb.dims();
            debug_assert!(window >= kv_len, "position bias shorter than the context");

            let pos = pos_emb
                .clone()
                .slice([0..heads, (window - kv_len)..window, 0..head_dim])
                .unsqueeze_dim::<4>(0)
                .repeat_dim(0, batch_size)
                .swap_dims(2, 3);
            let pos_dots = q.matmul(pos) * scale;
            dots = dots + relative_shift(pos_dots);
        }

        let mask_value = max_neg_value::<B>();

        if let Some(input_mask) = input_mask {
            let invalid = self.invalid_pairs(input_mask, mem_len);
            dots = dots.mask_fill(invalid, mask_value);
        }

        let causal = causal_mask::<B>(seq_len, mem_len, &device)
            .reshape([1, 1, seq_len, kv_len])
            .repeat_dim(0, batch_size)
            .repeat_dim(1, self.heads);
        dots = dots.mask_fill(causal, mask_value);

        (softmax(dots, 3), v)
    }

    /// Pairs where either the query or the current-step key is an invalid token.
    /// Memory keys are never masked here.
    ///
    /// Returns `[batch_size, num_heads, seq_len, mem_len + seq_len]`.
    fn invalid_pairs(&self, input_mask: &Tensor<B, 2, Bool>, mem_len: usize) -> Tensor<B, 4, Bool> {
        let [batch_size, seq_len] = input_mask.dims();
        let valid = input_mask.clone().float();

        // Outer product of the validity vector with itself.
        let pairs = valid
            .clone()
            .reshape([batch_size, seq_len, 1])
            .matmul(valid.reshape([batch_size, 1, seq_len]));

        let pairs = if mem_len > 0 {
            let memory = Tensor::ones([batch_size, seq_len, mem_len], &pairs.device());
            Tensor::cat(vec![memory, pairs], 2)
        } else {
            pairs
        };

        pairs
            .equal_elem(0.0)
            .reshape([batch_size, 1, seq_len, mem_len + seq_len])
            .repeat_dim(1, self.heads)
    }
}

/// `true` where query `q` may not see key `k`: every memory position is
/// visible, current-step keys only up to and including the query itself.
///
/// Returns `[seq_len, mem_len + seq_len]`.
pub fn causal_mask<B: Backend>(
    seq_len: usize,
    mem_len: usize,
    device: &B::Device,
) -> Tensor<B, 2, Bool> {
    let kv_len = mem_len + seq_len;
    let data: Vec<bool> = (0..seq_len)
        .flat_map(|q| (0..kv_len).map(move |k| k > q + mem_len))
        .collect();

    Tensor::from_data(TensorData::new(data, [seq_len, kv_len]), device)
}
