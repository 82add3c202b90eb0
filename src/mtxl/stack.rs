use burn::{
    module::{Ignored, Module},
    prelude::Backend,
    tensor::{Bool, Tensor},
};

use super::{
    attention::LayerMemory,
    block::{Block, BlockConfig},
    memory::Memory,
    MemoryTransformerXlConfig,
};

/// The depth-ordered layers, with the memory layers flagged.
#[derive(Module, Debug)]
pub struct LayerStack<B: Backend> {
    pub layers: Vec<Block<B>>,
    /// One entry per layer, `true` for memory layers.
    uses_memory: Ignored<Vec<bool>>,
}

/// Result of one pass through the stack.
#[derive(Debug)]
pub struct StackOutput<B: Backend> {
    /// `[batch_size, seq_len, dim]`
    pub hidden_states: Tensor<B, 3>,
    /// Pre-attention hidden states of every memory layer in layer order,
    /// `[num_memory_layers, batch_size, seq_len, dim]`.
    pub hiddens: Tensor<B, 4>,
}

impl MemoryTransformerXlConfig {
    pub fn init_stack<B: Backend>(&self, device: &B::Device) -> LayerStack<B> {
        let memory_layers = self.memory_layers();

        LayerStack {
            layers: (1..=self.depth)
                .map(|layer_num| BlockConfig::new(self.clone(), layer_num).init(device))
                .collect(),
            uses_memory: Ignored(
                (1..=self.depth)
                    .map(|layer_num| memory_layers.contains(&layer_num))
                    .collect(),
            ),
        }
    }
}

impl<B: Backend> LayerStack<B> {
    #[must_use]
    pub fn num_memory_layers(&self) -> usize {
        self.uses_memory.iter().filter(|&&used| used).count()
    }

    /// Runs every layer in order.
    ///
    /// Memory layers consume the next slot of `short` and `long` in turn, each
    /// through its own cursor, and record their input before attention.
    ///
    /// # Parameters
    /// - `x`: `[batch_size, seq_len, dim]`
    /// - `memory`: `[num_memory_layers, batch_size, len, dim]` tensors; `None` on the first step.
    /// - `pos_emb`: `[num_heads, window, head_dim]`
    /// - `input_mask`: `[batch_size, seq_len]`
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        memory: Option<&Memory<B>>,
        pos_emb: Option<&Tensor<B, 3>>,
        input_mask: Option<&Tensor<B, 2, Bool>>,
    ) -> StackOutput<B> {
        let mut hidden_states = x;
        let mut hiddens = Vec::with_capacity(self.num_memory_layers());
        let mut short_cursor = 0;
        let mut long_cursor = 0;

        for (layer, &uses_memory) in self.layers.iter().zip(self.uses_memory.iter()) {
            let layer_memory = match (uses_memory, memory) {
                (true, Some(memory)) => {
                    let slice = LayerMemory {
                        long: memory.long_slot(long_cursor),
                        short: memory.short_slot(short_cursor),
                    };
                    short_cursor += 1;
                    long_cursor += 1;
                    slice
                }
                _ => LayerMemory::empty(),
            };

            if uses_memory {
                hiddens.push(hidden_states.clone());
            }

            tracing::trace!(
                layer = layer.layer_num,
                uses_memory,
                memory_len = layer_memory.len(),
                "running layer"
            );
            hidden_states = layer.forward(hidden_states, layer_memory, pos_emb, input_mask);
        }

        StackOutput {
            hidden_states,
            hiddens: Tensor::stack(hiddens, 0),
        }
    }
}
