use burn::config::Config;

use self::error::ModelError;

pub mod attention;
pub mod block;
pub mod error;
pub mod lm;
pub mod memory;
pub mod residual;
pub mod stack;
pub mod util;

/// How gradients are allowed to travel through the carried memory.
#[allow(clippy::expl_impl_clone_on_copy)]
#[derive(Config, Debug, PartialEq, Eq, Copy)]
pub enum MemoryGradientFlow {
    /// Incoming memory is detached before it is read and both returned
    /// tensors are detached. Backpropagation never leaves the current step.
    ///
    /// No loss reaches the memory network, so `init_lmem`, its projections
    /// and its gate keep their initial values and the long-term memory stays
    /// at zero. Use [`MemoryGradientFlow::Carried`] to train the long-term tier.
    Truncated,
    /// The returned long-term memory keeps its graph, so the next step's loss
    /// reaches the memory network and the previous long-term value.
    /// Short-term memory is always detached.
    /// The caller bounds the window with [`memory::Memory::detach`].
    Carried,
}

/// Configuration for the Memory Transformer-XL model.
#[allow(clippy::struct_excessive_bools)]
#[derive(Config, Debug)]
pub struct MemoryTransformerXlConfig {
    /// Vocabulary size.
    pub num_tokens: usize,
    /// The model dimension.
    pub dim: usize,
    /// Maximum number of tokens per step.
    pub seq_len: usize,
    /// Number of attention + feed-forward layers.
    pub depth: usize,
    /// Token embedding size. Defaults to `dim`.
    #[config(default = "None")]
    pub emb_dim: Option<usize>,
    /// 1-indexed layers that read and feed the memory. Defaults to every layer.
    #[config(default = "None")]
    pub memory_layers: Option<Vec<usize>>,
    /// Short-term memory length. Defaults to `seq_len`.
    #[config(default = "None")]
    pub mem_len: Option<usize>,
    /// Long-term memory length. Defaults to the short-term memory length.
    #[config(default = "None")]
    pub lmem_len: Option<usize>,
    #[config(default = 8)]
    pub heads: usize,
    /// Merge sublayer outputs through a GRU cell instead of adding them.
    #[config(default = false)]
    pub gru_gated_residual: bool,
    /// Run a mogrifier over the GRU inputs. Only used with `gru_gated_residual`.
    #[config(default = false)]
    pub mogrify_gru: bool,
    /// Dropout on the attention weights.
    #[config(default = 0.0)]
    pub attn_dropout: f64,
    /// Dropout on the attention output.
    #[config(default = 0.0)]
    pub attn_layer_dropout: f64,
    #[config(default = 0.0)]
    pub ff_dropout: f64,
    /// Dropout on the memory segment of the key/value input.
    #[config(default = 0.0)]
    pub memory_attn_dropout: f64,
    /// Feed-forward expansion factor.
    #[config(default = 4)]
    pub ff_mult: usize,
    #[config(default = false)]
    pub ff_glu: bool,
    /// Share a single key/value head across all query heads.
    #[config(default = false)]
    pub one_kv_head: bool,
    #[config(default = "MemoryGradientFlow::Truncated")]
    pub memory_gradient: MemoryGradientFlow,
}

impl MemoryTransformerXlConfig {
    #[must_use]
    pub fn tiny(num_tokens: usize) -> Self {
        Self::new(num_tokens, 32, 8, 2)
            .with_heads(4)
            .with_lmem_len(Some(4))
    }

    #[must_use]
    pub fn small(num_tokens: usize) -> Self {
        Self::new(num_tokens, 256, 128, 6)
            .with_heads(8)
            .with_mem_len(Some(256))
            .with_lmem_len(Some(64))
            .with_memory_layers(Some(vec![4, 5, 6]))
    }

    #[must_use]
    pub fn head_dim(&self) -> usize {
        self.dim / self.heads
    }

    #[must_use]
    pub fn emb_dim(&self) -> usize {
        self.emb_dim.unwrap_or(self.dim)
    }

    #[must_use]
    pub fn mem_len(&self) -> usize {
        self.mem_len.unwrap_or(self.seq_len)
    }

    #[must_use]
    pub fn lmem_len(&self) -> usize {
        self.lmem_len.unwrap_or_else(|| self.mem_len())
    }

    /// The 1-indexed memory layers, in the order given.
    #[must_use]
    pub fn memory_layers(&self) -> Vec<usize> {
        self.memory_layers
            .clone()
            .unwrap_or_else(|| (1..=self.depth).collect())
    }

    #[must_use]
    pub fn num_memory_layers(&self) -> usize {
        self.memory_layers().len()
    }

    /// Length of the relative position bias: enough for a full step attending
    /// over full short and long memories.
    #[must_use]
    pub fn max_context_len(&self) -> usize {
        self.seq_len + self.mem_len() + self.lmem_len()
    }

    /// Checks the construction invariants.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.heads == 0 {
            return Err(ModelError::ZeroHeads);
        }
        if self.dim % self.heads != 0 {
            return Err(ModelError::HeadsDoNotDivideDim {
                dim: self.dim,
                heads: self.heads,
            });
        }
        if self.depth == 0 {
            return Err(ModelError::ZeroDepth);
        }

        let memory_layers = self.memory_layers();
        if memory_layers.is_empty() {
            return Err(ModelError::NoMemoryLayers);
        }
        if let Some(&layer) = memory_layers
            .iter()
            .find(|&&layer| layer == 0 || layer > self.depth)
        {
            return Err(ModelError::InvalidMemoryLayer {
                layer,
                depth: self.depth,
            });
        }

        if self.mem_len() < self.seq_len {
            return Err(ModelError::ShortMemoryTooShort {
                mem_len: self.mem_len(),
                seq_len: self.seq_len,
            });
        }
        if self.lmem_len() == 0 {
            return Err(ModelError::EmptyLongMemory);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve_from_seq_len() {
        let config = MemoryTransformerXlConfig::new(100, 64, 16, 3);

        assert_eq!(config.emb_dim(), 64);
        assert_eq!(config.mem_len(), 16);
        assert_eq!(config.lmem_len(), 16);
        assert_eq!(config.memory_layers(), vec![1, 2, 3]);
        assert_eq!(config.max_context_len(), 48);
        assert_eq!(config.head_dim(), 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn long_memory_defaults_to_short_memory_length() {
        let config = MemoryTransformerXlConfig::new(100, 64, 16, 3).with_mem_len(Some(24));

        assert_eq!(config.lmem_len(), 24);
        assert_eq!(config.max_context_len(), 64);
    }

    #[test]
    fn rejects_indivisible_heads() {
        let config = MemoryTransformerXlConfig::new(100, 30, 8, 2).with_heads(4);

        assert_eq!(
            config.validate(),
            Err(ModelError::HeadsDoNotDivideDim { dim: 30, heads: 4 })
        );
    }

    #[test]
    fn rejects_zero_heads() {
        let config = MemoryTransformerXlConfig::new(100, 32, 8, 2).with_heads(0);

        assert_eq!(config.validate(), Err(ModelError::ZeroHeads));
    }

    #[test]
    fn rejects_out_of_range_memory_layers() {
        let zero = MemoryTransformerXlConfig::tiny(100).with_memory_layers(Some(vec![0, 1]));
        assert_eq!(
            zero.validate(),
            Err(ModelError::InvalidMemoryLayer { layer: 0, depth: 2 })
        );

        let past_end = MemoryTransformerXlConfig::tiny(100).with_memory_layers(Some(vec![1, 3]));
        assert_eq!(
            past_end.validate(),
            Err(ModelError::InvalidMemoryLayer { layer: 3, depth: 2 })
        );

        let empty = MemoryTransformerXlConfig::tiny(100).with_memory_layers(Some(vec![]));
        assert_eq!(empty.validate(), Err(ModelError::NoMemoryLayers));
    }

    #[test]
    fn rejects_short_memory_below_seq_len() {
        let config = MemoryTransformerXlConfig::tiny(100).with_mem_len(Some(4));

        assert_eq!(
            config.validate(),
            Err(ModelError::ShortMemoryTooShort {
                mem_len: 4,
                seq_len: 8
            })
        );
    }

    #[test]
    fn rejects_empty_long_memory() {
        let config = MemoryTransformerXlConfig::tiny(100).with_lmem_len(Some(0));

        assert_eq!(config.validate(), Err(ModelError::EmptyLongMemory));
    }

    #[test]
    fn presets_are_valid() {
        assert!(MemoryTransformerXlConfig::tiny(100).validate().is_ok());
        assert!(MemoryTransformerXlConfig::small(100).validate().is_ok());
    }
}
