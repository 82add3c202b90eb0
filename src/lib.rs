#![warn(clippy::pedantic)]
#![allow(
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::doc_markdown,
    clippy::cast_precision_loss,
    clippy::module_name_repetitions,
    clippy::too_many_lines
)]

//! Memory Transformer-XL
//!
//! A Transformer-XL style language model with two tiers of recurrent memory:
//! - a short-term FIFO cache of recent pre-attention hidden states, and
//! - a compressed long-term memory rewritten each step by linear attention.
//!
//! The model is stateless across calls. Every step returns a fresh
//! [`Memory`] which the caller feeds back into the next step.

pub mod mtxl;

pub use mtxl::{
    error::ModelError,
    lm::MemoryTransformerXl,
    memory::{Memory, MemoryAttentionNetwork},
    MemoryGradientFlow, MemoryTransformerXlConfig,
};

#[cfg(feature = "wgpu")]
pub type DefaultBackend = burn::backend::Wgpu;

#[cfg(not(feature = "wgpu"))]
pub type DefaultBackend = burn::backend::NdArray;

pub type DefaultAutodiffBackend = burn::backend::Autodiff<DefaultBackend>;
