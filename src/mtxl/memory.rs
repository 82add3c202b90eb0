use burn::{
    config::Config,
    module::{Module, Param},
    nn::Initializer,
    prelude::Backend,
    tensor::{activation::softmax, Tensor},
};

use super::{
    attention::LayerMemory,
    util::{keep_last, layer_norm, project},
    MemoryGradientFlow,
};

/// Recurrent state carried from one step to the next.
///
/// Both tensors are `[num_memory_layers, batch_size, len, dim]`.
#[derive(Clone, Debug)]
pub struct Memory<B: Backend> {
    /// The most recent pre-attention hidden states, at most `mem_len` of them.
    pub short: Tensor<B, 4>,
    /// `lmem_len` compressed memory vectors.
    pub long: Tensor<B, 4>,
}

impl<B: Backend> Memory<B> {
    pub fn new(short: Tensor<B, 4>, long: Tensor<B, 4>) -> Self {
        Self { short, long }
    }

    /// Detach the memory from the computational graph
    #[must_use]
    pub fn detach(self) -> Self {
        Self {
            short: self.short.detach(),
            long: self.long.detach(),
        }
    }

    #[must_use]
    pub fn num_slots(&self) -> usize {
        self.short.dims()[0]
    }

    #[must_use]
    pub fn short_len(&self) -> usize {
        self.short.dims()[2]
    }

    #[must_use]
    pub fn long_len(&self) -> usize {
        self.long.dims()[2]
    }

    /// `[batch_size, mem_len, dim]` for one memory layer, `None` while empty.
    pub fn short_slot(&self, slot: usize) -> Option<Tensor<B, 3>> {
        slot_of(&self.short, slot)
    }

    /// `[batch_size, lmem_len, dim]` for one memory layer, `None` while empty.
    pub fn long_slot(&self, slot: usize) -> Option<Tensor<B, 3>> {
        slot_of(&self.long, slot)
    }

    /// The memory slice read by the `slot`-th memory layer.
    pub fn layer(&self, slot: usize) -> LayerMemory<B> {
        LayerMemory {
            long: self.long_slot(slot),
            short: self.short_slot(slot),
        }
    }
}

/// `[slots, batch, len, dim]` -> `[batch, len, dim]` for one slot, `None` if `len` is zero.
fn slot_of<B: Backend>(t: &Tensor<B, 4>, slot: usize) -> Option<Tensor<B, 3>> {
    let [_, batch_size, len, dim] = t.dims();
    (len > 0).then(|| {
        t.clone()
            .narrow(0, slot, 1)
            .reshape([batch_size, len, dim])
    })
}

#[derive(Config, Debug)]
pub struct MemoryAttentionNetworkConfig {
    dim: usize,
    num_memory_layers: usize,
    mem_len: usize,
    lmem_len: usize,
    #[config(default = 8)]
    heads: usize,
    #[config(default = 1e-5)]
    epsilon: f64,
    #[config(default = "MemoryGradientFlow::Truncated")]
    gradient: MemoryGradientFlow,
    #[config(default = "Initializer::Normal{mean:0.0, std:1.0}")]
    pub initializer: Initializer,
}

/// Rewrites the long-term memory with linear attention over
/// `[normalized long memory, short memory, hiddens]` and shifts the short-term
/// memory as a FIFO.
#[derive(Module, Debug)]
pub struct MemoryAttentionNetwork<B: Backend> {
    /// Long-term memory used on the first step: [num_memory_layers, 1, lmem_len, dim]
    pub init_lmem: Param<Tensor<B, 4>>,
    /// [dim, dim]
    pub to_q: Param<Tensor<B, 2>>,
    /// [dim, 2 * dim]
    pub to_kv: Param<Tensor<B, 2>>,
    /// [dim, dim]
    pub to_out: Param<Tensor<B, 2>>,
    /// Rezero gate on the update, starts at zero: [1]
    pub gate: Param<Tensor<B, 1>>,
    heads: usize,
    head_dim: usize,
    mem_len: usize,
    epsilon: f64,
    /// Detach incoming memory and the returned long-term memory.
    truncated: bool,
}

impl MemoryAttentionNetworkConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> MemoryAttentionNetwork<B> {
        let dim = self.dim;

        MemoryAttentionNetwork {
            init_lmem: Initializer::Zeros.init(
                [self.num_memory_layers, 1, self.lmem_len, dim],
                device,
            ),
            to_q: self.initializer.init([dim, dim], device),
            to_kv: self.initializer.init([dim, 2 * dim], device),
            to_out: self.initializer.init([dim, dim], device),
            gate: Initializer::Zeros.init([1], device),
            heads: self.heads,
            head_dim: dim / self.heads,
            mem_len: self.mem_len,
            epsilon: self.epsilon,
            truncated: self.gradient == MemoryGradientFlow::Truncated,
        }
    }
}

impl<B: Backend> MemoryAttentionNetwork<B> {
    /// Computes the next memory.
    ///
    /// # Parameters
    /// - `long`: `[slots, batch_size, lmem_len, dim]`, `None` on the first step.
    /// - `short`: `[slots, batch_size, mem_len', dim]`, `None` when nothing is remembered yet.
    /// - `hiddens`: `[slots, batch_size, seq_len, dim]`, pre-attention hidden
    ///   states of the memory layers. Always detached before use.
    pub fn forward(
        &self,
        long: Option<Tensor<B, 4>>,
        short: Option<Tensor<B, 4>>,
        hiddens: Tensor<B, 4>,
    ) -> Memory<B> {
        let hiddens = hiddens.detach();
        let [slots, batch_size, _seq_len, _dim] = hiddens.dims();

        let (long, short) = if self.truncated {
            (long.map(Tensor::detach), short.map(Tensor::detach))
        } else {
            (long, short)
        };

        let long = long
            .filter(|long| long.dims()[2] > 0)
            .unwrap_or_else(|| {
                tracing::debug!(slots, batch_size, "initializing long-term memory");
                self.init_lmem.val().repeat_dim(1, batch_size)
            });
        let short = short.filter(|short| short.dims()[2] > 0);

        let update = self.linear_attention(long.clone(), short.clone(), hiddens.clone());
        let next_long = update * self.gate.val().reshape([1, 1, 1, 1]) + long;
        let next_long = if self.truncated {
            next_long.detach()
        } else {
            next_long
        };

        let next_short = match short {
            Some(short) => Tensor::cat(vec![short, hiddens], 2),
            None => hiddens,
        };
        let next_short = keep_last(next_short, 2, self.mem_len).detach();

        Memory::new(next_short, next_long)
    }

    /// The ungated update for the long-term memory, same shape as `long`.
    fn linear_attention(
        &self,
        long: Tensor<B, 4>,
        short: Option<Tensor<B, 4>>,
        hiddens: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let [slots, batch_size, lmem_len, dim] = long.dims();
        let (heads, head_dim) = (self.heads, self.head_dim);

        let normed = layer_norm(long, self.epsilon);
        let q = project(normed.clone(), self.to_q.val());

        let mut kv_parts = vec![normed];
        kv_parts.extend(short);
        kv_parts.push(hiddens);
        let kv_input = Tensor::cat(kv_parts, 2);
        let kv_len = kv_input.dims()[2];

        let kv = project(kv_input, self.to_kv.val());
        let k = kv.clone().narrow(3, 0, dim);
        let v = kv.narrow(3, dim, dim);

        // [M, B, N, H * head_dim] -> [M * B, H, N, head_dim]
        let split_heads = |t: Tensor<B, 4>, len: usize| {
            t.reshape([slots * batch_size, len, heads, head_dim])
                .swap_dims(1, 2)
        };
        let scale = (head_dim as f64).powf(-0.25);
        let q = split_heads(q, lmem_len) * scale;
        let k = split_heads(k, kv_len) * scale;
        let v = split_heads(v, kv_len);

        // Queries normalized over features, keys over positions.
        let q = softmax(q, 3);
        let k = softmax(k, 2);

        // [M * B, H, head_dim, head_dim], independent of the sequence length
        let context = k.swap_dims(2, 3).matmul(v);
        let out = q
            .matmul(context)
            .swap_dims(1, 2)
            .reshape([slots, batch_size, lmem_len, dim]);

        project(out, self.to_out.val())
    }
}
