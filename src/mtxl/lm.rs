use std::sync::Arc;

use burn::{
    module::{Ignored, Module, Param},
    nn::{Embedding, EmbeddingConfig, Initializer, Linear, LinearConfig},
    prelude::Backend,
    tensor::{Bool, Int, Tensor},
};

use super::{
    error::ModelError,
    memory::{Memory, MemoryAttentionNetwork, MemoryAttentionNetworkConfig},
    stack::LayerStack,
    MemoryGradientFlow, MemoryTransformerXlConfig,
};

#[derive(Module, Debug)]
pub struct MemoryTransformerXl<B: Backend> {
    pub config: Ignored<Arc<MemoryTransformerXlConfig>>,
    pub token_emb: Embedding<B>,
    /// Only present when `emb_dim != dim`.
    pub to_model_dim: Option<Linear<B>>,
    /// Relative position bias shared by every layer: [num_heads, max_context_len, head_dim]
    pub pos_emb: Param<Tensor<B, 3>>,
    pub stack: LayerStack<B>,
    pub memory_network: MemoryAttentionNetwork<B>,
    /// Only present when `emb_dim != dim`.
    pub from_model_dim: Option<Linear<B>>,
    pub to_logits: Linear<B>,
}

impl MemoryTransformerXlConfig {
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> Result<MemoryTransformerXl<B>, ModelError> {
        self.validate()?;

        let (dim, emb_dim) = (self.dim, self.emb_dim());
        let adapt = |d_in: usize, d_out: usize| {
            (emb_dim != dim).then(|| LinearConfig::new(d_in, d_out).init(device))
        };

        tracing::debug!(
            dim,
            emb_dim,
            depth = self.depth,
            heads = self.heads,
            seq_len = self.seq_len,
            mem_len = self.mem_len(),
            lmem_len = self.lmem_len(),
            memory_layers = ?self.memory_layers(),
            "initializing memory transformer-xl"
        );

        Ok(MemoryTransformerXl {
            config: Ignored(Arc::new(self.clone())),
            token_emb: EmbeddingConfig::new(self.num_tokens, emb_dim).init(device),
            to_model_dim: adapt(emb_dim, dim),
            pos_emb: Initializer::Zeros.init(
                [self.heads, self.max_context_len(), self.head_dim()],
                device,
            ),
            stack: self.init_stack(device),
            memory_network: MemoryAttentionNetworkConfig::new(
                dim,
                self.num_memory_layers(),
                self.mem_len(),
                self.lmem_len(),
            )
            .with_heads(self.heads)
            .with_gradient(self.memory_gradient)
            .init(device),
            from_model_dim: adapt(dim, emb_dim),
            to_logits: LinearConfig::new(emb_dim, self.num_tokens).init(device),
        })
    }
}

impl<B: Backend> MemoryTransformerXl<B> {
    /// Runs one step.
    ///
    /// # Parameters
    /// - `tokens`: `[batch_size, seq_len]` with `seq_len` at most the configured maximum.
    /// - `memory`: the memory returned by the previous step, `None` on the first step.
    /// - `mask`: `[batch_size, seq_len]`, `true` marks a valid token.
    ///
    /// Returns the logits `[batch_size, seq_len, num_tokens]` and the memory
    /// to pass into the next step.
    pub fn forward(
        &self,
        tokens: Tensor<B, 2, Int>,
        memory: Option<Memory<B>>,
        mask: Option<Tensor<B, 2, Bool>>,
    ) -> Result<(Tensor<B, 3>, Memory<B>), ModelError> {
        let config = &self.config;
        let [batch_size, seq_len] = tokens.dims();

        if seq_len == 0 {
            return Err(ModelError::EmptySequence);
        }
        if seq_len > config.seq_len {
            return Err(ModelError::SequenceTooLong {
                len: seq_len,
                max: config.seq_len,
            });
        }
        if let Some(mask) = &mask {
            if mask.dims() != [batch_size, seq_len] {
                return Err(ModelError::MaskShapeMismatch {
                    actual: mask.dims(),
                    expected: [batch_size, seq_len],
                });
            }
        }
        if let Some(memory) = &memory {
            self.check_memory(memory, batch_size)?;
        }

        let memory = match config.memory_gradient {
            MemoryGradientFlow::Truncated => memory.map(Memory::detach),
            MemoryGradientFlow::Carried => memory,
        };

        let mut x = self.token_emb.forward(tokens);
        if let Some(to_model_dim) = &self.to_model_dim {
            x = to_model_dim.forward(x);
        }

        let (short_len, long_len) = memory
            .as_ref()
            .map_or((0, 0), |memory| (memory.short_len(), memory.long_len()));
        let pos_emb = self.pos_emb.val().slice([
            0..config.heads,
            (config.seq_len - seq_len)..(config.seq_len + short_len + long_len),
            0..config.head_dim(),
        ]);

        tracing::debug!(batch_size, seq_len, short_len, long_len, "memory transformer-xl step");

        let out = self
            .stack
            .forward(x, memory.as_ref(), Some(&pos_emb), mask.as_ref());

        let mut hidden_states = out.hidden_states;
        if let Some(from_model_dim) = &self.from_model_dim {
            hidden_states = from_model_dim.forward(hidden_states);
        }
        let logits = self.to_logits.forward(hidden_states);

        let (short, long) = match memory {
            Some(Memory { short, long }) => (Some(short), Some(long)),
            None => (None, None),
        };
        let next_memory = self.memory_network.forward(long, short, out.hiddens);

        Ok((logits, next_memory))
    }

    fn check_memory(&self, memory: &Memory<B>, batch_size: usize) -> Result<(), ModelError> {
        let config = &self.config;
        let expected_slots = self.stack.num_memory_layers();

        for (kind, tensor) in [("short-term", &memory.short), ("long-term", &memory.long)] {
            let [slots, batch, _len, dim] = tensor.dims();
            if slots != expected_slots {
                return Err(ModelError::MemorySlotMismatch {
                    kind,
                    actual: slots,
                    expected: expected_slots,
                });
            }
            if batch != batch_size {
                return Err(ModelError::MemoryBatchMismatch {
                    kind,
                    actual: batch,
                    expected: batch_size,
                });
            }
            if dim != config.dim {
                return Err(ModelError::MemoryDimMismatch {
                    actual: dim,
                    expected: config.dim,
                });
            }
        }

        if memory.short_len() > config.mem_len() {
            return Err(ModelError::MemoryTooLong {
                actual: memory.short_len(),
                max: config.mem_len(),
            });
        }
        let long_len = memory.long_len();
        if long_len != 0 && long_len != config.lmem_len() {
            return Err(ModelError::LongMemoryLength {
                actual: long_len,
                expected: config.lmem_len(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mtxl::util::tests::{assert_data_close, to_vec, TestBackend};
    use burn::{
        backend::Autodiff,
        tensor::{Distribution, TensorData},
    };

    type TestAutodiffBackend = Autodiff<TestBackend>;

    fn tokens<B: Backend>(batch_size: usize, seq_len: usize) -> Tensor<B, 2, Int> {
        let data = (0..batch_size * seq_len)
            .map(|i| (i * 7 % 100) as i64)
            .collect::<Vec<_>>();
        Tensor::from_data(
            TensorData::new(data, [batch_size, seq_len]),
            &Default::default(),
        )
    }

    #[test]
    fn first_step_shapes() {
        let model = MemoryTransformerXlConfig::tiny(100)
            .init::<TestBackend>(&Default::default())
            .unwrap();

        let (logits, memory) = model.forward(tokens(2, 8), None, None).unwrap();

        assert_eq!(logits.dims(), [2, 8, 100]);
        assert_eq!(memory.short.dims(), [2, 2, 8, 32]);
        assert_eq!(memory.long.dims(), [2, 2, 4, 32]);
        assert!(to_vec(logits).iter().all(|v| v.is_finite()));
    }

    #[test]
    fn rejects_long_sequences() {
        let model = MemoryTransformerXlConfig::tiny(100)
            .init::<TestBackend>(&Default::default())
            .unwrap();

        let err = model.forward(tokens(1, 9), None, None).unwrap_err();

        assert_eq!(err, ModelError::SequenceTooLong { len: 9, max: 8 });
    }

    #[test]
    fn rejects_empty_sequences() {
        let model = MemoryTransformerXlConfig::tiny(100)
            .init::<TestBackend>(&Default::default())
            .unwrap();
        let (_, memory) = model.forward(tokens(2, 8), None, None).unwrap();

        assert_eq!(
            model.forward(tokens(2, 0), None, None).unwrap_err(),
            ModelError::EmptySequence
        );
        assert_eq!(
            model.forward(tokens(2, 0), Some(memory), None).unwrap_err(),
            ModelError::EmptySequence
        );
    }

    #[test]
    fn init_rejects_invalid_config() {
        let err = MemoryTransformerXlConfig::tiny(100)
            .with_heads(5)
            .init::<TestBackend>(&Default::default())
            .unwrap_err();

        assert_eq!(err, ModelError::HeadsDoNotDivideDim { dim: 32, heads: 5 });
    }

    #[test]
    fn memory_lengths_stay_bounded_across_steps() {
        let model = MemoryTransformerXlConfig::tiny(100)
            .init::<TestBackend>(&Default::default())
            .unwrap();

        let mut memory = None;
        let mut seen = 0;
        for step_len in [8, 3, 8, 5] {
            let (logits, next) = model.forward(tokens(2, step_len), memory, None).unwrap();
            seen += step_len;

            assert_eq!(logits.dims(), [2, step_len, 100]);
            assert_eq!(next.short_len(), seen.min(8));
            assert_eq!(next.long_len(), 4);
            assert_eq!(next.num_slots(), 2);
            memory = Some(next);
        }
    }

    #[test]
    fn same_inputs_give_same_outputs() {
        let model = MemoryTransformerXlConfig::tiny(100)
            .init::<TestBackend>(&Default::default())
            .unwrap();
        let (first_a, memory) = model.forward(tokens(2, 8), None, None).unwrap();
        let (first_b, _) = model.forward(tokens(2, 8), None, None).unwrap();
        assert_eq!(to_vec(first_a), to_vec(first_b));

        let (logits_a, memory_a) = model
            .forward(tokens(2, 5), Some(memory.clone()), None)
            .unwrap();
        let (logits_b, memory_b) = model.forward(tokens(2, 5), Some(memory), None).unwrap();

        assert_eq!(to_vec(logits_a), to_vec(logits_b));
        assert_eq!(to_vec(memory_a.short), to_vec(memory_b.short));
        assert_eq!(to_vec(memory_a.long), to_vec(memory_b.long));
    }

    #[test]
    fn short_step_matches_prefix_of_full_step() {
        let device = Default::default();
        let mut model = MemoryTransformerXlConfig::tiny(100)
            .init::<TestBackend>(&device)
            .unwrap();
        model.pos_emb = Param::from_tensor(Tensor::random(
            [4, 20, 8],
            Distribution::Normal(0.0, 1.0),
            &device,
        ));

        let (_, memory) = model.forward(tokens(2, 8), None, None).unwrap();
        let full = tokens::<TestBackend>(2, 8);
        let prefix = full.clone().slice([0..2, 0..3]);

        // Relative offsets do not depend on the step length, so the first
        // three positions see identical context either way.
        for memory in [None, Some(memory)] {
            let (full_logits, _) = model
                .forward(full.clone(), memory.clone(), None)
                .unwrap();
            let (prefix_logits, _) = model.forward(prefix.clone(), memory, None).unwrap();

            assert_data_close(
                &to_vec(full_logits.slice([0..2, 0..3, 0..100])),
                &to_vec(prefix_logits),
                1e-4,
                1e-4,
                "prefix logits",
            );
        }
    }

    #[test]
    fn adapts_embedding_dimension() {
        let model = MemoryTransformerXlConfig::tiny(50)
            .with_emb_dim(Some(16))
            .init::<TestBackend>(&Default::default())
            .unwrap();

        let (logits, memory) = model.forward(tokens(1, 4), None, None).unwrap();

        assert!(model.to_model_dim.is_some());
        assert_eq!(logits.dims(), [1, 4, 50]);
        assert_eq!(memory.short.dims(), [2, 1, 4, 32]);
    }

    #[test]
    fn partial_memory_layers() {
        let model = MemoryTransformerXlConfig::new(100, 32, 8, 3)
            .with_heads(4)
            .with_lmem_len(Some(4))
            .with_memory_layers(Some(vec![2]))
            .init::<TestBackend>(&Default::default())
            .unwrap();

        let (_, memory) = model.forward(tokens(2, 8), None, None).unwrap();
        let (logits, memory) = model.forward(tokens(2, 8), Some(memory), None).unwrap();

        assert_eq!(logits.dims(), [2, 8, 100]);
        assert_eq!(memory.short.dims(), [1, 2, 8, 32]);
        assert_eq!(memory.long.dims(), [1, 2, 4, 32]);
    }

    #[test]
    fn rejects_mismatched_memory() {
        let device = Default::default();
        let model = MemoryTransformerXlConfig::tiny(100)
            .init::<TestBackend>(&device)
            .unwrap();

        let wrong_slots = Memory::new(
            Tensor::zeros([3, 2, 8, 32], &device),
            Tensor::zeros([3, 2, 4, 32], &device),
        );
        assert_eq!(
            model.forward(tokens(2, 8), Some(wrong_slots), None).unwrap_err(),
            ModelError::MemorySlotMismatch {
                kind: "short-term",
                actual: 3,
                expected: 2
            }
        );

        let too_long = Memory::new(
            Tensor::zeros([2, 2, 9, 32], &device),
            Tensor::zeros([2, 2, 4, 32], &device),
        );
        assert_eq!(
            model.forward(tokens(2, 8), Some(too_long), None).unwrap_err(),
            ModelError::MemoryTooLong { actual: 9, max: 8 }
        );

        let wrong_batch = Memory::new(
            Tensor::zeros([2, 1, 8, 32], &device),
            Tensor::zeros([2, 1, 4, 32], &device),
        );
        assert_eq!(
            model.forward(tokens(2, 8), Some(wrong_batch), None).unwrap_err(),
            ModelError::MemoryBatchMismatch {
                kind: "short-term",
                actual: 1,
                expected: 2
            }
        );
    }

    #[test]
    fn rejects_mismatched_mask() {
        let device = Default::default();
        let model = MemoryTransformerXlConfig::tiny(100)
            .init::<TestBackend>(&device)
            .unwrap();
        let mask = Tensor::<TestBackend, 2, Bool>::from_data(
            TensorData::new(vec![true; 6], [1, 6]),
            &device,
        );

        assert_eq!(
            model.forward(tokens(1, 8), None, Some(mask)).unwrap_err(),
            ModelError::MaskShapeMismatch {
                actual: [1, 6],
                expected: [1, 8]
            }
        );
    }

    #[test]
    fn truncated_memory_receives_no_gradient() {
        let device = Default::default();
        let model = MemoryTransformerXlConfig::tiny(100)
            .init::<TestAutodiffBackend>(&device)
            .unwrap();
        let short = Tensor::<TestAutodiffBackend, 4>::random(
            [2, 2, 8, 32],
            Distribution::Default,
            &device,
        )
        .require_grad();
        let long = Tensor::<TestAutodiffBackend, 4>::random(
            [2, 2, 4, 32],
            Distribution::Default,
            &device,
        )
        .require_grad();

        let (logits, _) = model
            .forward(tokens(2, 8), Some(Memory::new(short.clone(), long.clone())), None)
            .unwrap();
        let grads = logits.sum().backward();

        assert!(short.grad(&grads).is_none());
        assert!(long.grad(&grads).is_none());
        assert!(model.token_emb.weight.grad(&grads).is_some());
        // Nothing upstream of the memory network sees the loss in this mode.
        assert!(model.memory_network.gate.grad(&grads).is_none());
        assert!(model.memory_network.init_lmem.grad(&grads).is_none());
    }

    #[test]
    fn carried_memory_reaches_memory_network() {
        let device = Default::default();
        let model = MemoryTransformerXlConfig::tiny(100)
            .with_memory_gradient(MemoryGradientFlow::Carried)
            .init::<TestAutodiffBackend>(&device)
            .unwrap();

        let (_, memory) = model.forward(tokens(2, 8), None, None).unwrap();
        assert!(!memory.short.is_require_grad());

        let (logits, _) = model.forward(tokens(2, 8), Some(memory), None).unwrap();
        let grads = logits.sum().backward();

        assert!(model.memory_network.gate.grad(&grads).is_some());
        assert!(model.memory_network.init_lmem.grad(&grads).is_some());
    }
}
