/// Precondition violations raised at construction or at the start of a step.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    #[error("number of attention heads must be positive")]
    ZeroHeads,
    #[error("dimension {dim} must be divisible by the number of heads {heads}")]
    HeadsDoNotDivideDim { dim: usize, heads: usize },
    #[error("depth must be at least one layer")]
    ZeroDepth,
    #[error("at least one memory layer must be designated")]
    NoMemoryLayers,
    #[error("memory layer {layer} is invalid, layers are numbered 1 to {depth}")]
    InvalidMemoryLayer { layer: usize, depth: usize },
    #[error(
        "length of short-term memory {mem_len} should be at least the sequence length {seq_len}"
    )]
    ShortMemoryTooShort { mem_len: usize, seq_len: usize },
    #[error("length of long-term memory must be positive")]
    EmptyLongMemory,
    #[error("input contains no tokens")]
    EmptySequence,
    #[error(
        "input contains a sequence length {len} that is greater than the designated maximum sequence length {max}"
    )]
    SequenceTooLong { len: usize, max: usize },
    #[error("{kind} memory has {actual} slots but the model has {expected} memory layers")]
    MemorySlotMismatch {
        kind: &'static str,
        actual: usize,
        expected: usize,
    },
    #[error("{kind} memory has batch size {actual} but the input has batch size {expected}")]
    MemoryBatchMismatch {
        kind: &'static str,
        actual: usize,
        expected: usize,
    },
    #[error("short-term memory holds {actual} entries, more than the configured {max}")]
    MemoryTooLong { actual: usize, max: usize },
    #[error("long-term memory holds {actual} entries, expected 0 or {expected}")]
    LongMemoryLength { actual: usize, expected: usize },
    #[error("memory has feature size {actual} but the model dimension is {expected}")]
    MemoryDimMismatch { actual: usize, expected: usize },
    #[error("input mask has shape {actual:?} but the input has shape {expected:?}")]
    MaskShapeMismatch {
        actual: [usize; 2],
        expected: [usize; 2],
    },
}
