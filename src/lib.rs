//! # OmniMod
//!
//! Multimodal (vision + audio + language) embedding fusion for causal
//! language models.
//!
//! ## Overview
//!
//! OmniMod turns image, audio and text inputs into a single embedding
//! sequence a language model can be trained on or generate from:
//!
//! - Prompt wrapping with `<ImageHere>` placeholders and appended audio
//! - Multi-turn conversation tokenization with masked question turns
//! - Input/answer splicing and `-100` label assembly for the causal-LM loss
//! - Embedding-conditioned generation and answer clean-up
//! - Multiple-choice scoring by per-candidate loss
//! - LLM-as-judge grading of generated answers
//!
//! ## Architecture
//!
//! - `data` - Samples and batch collation
//! - `model` - Encoder and language model capabilities, tokenizer, `OmniModel`
//! - `fusion` - Prompt wrapping, conversation tokenization, sequence assembly
//! - `training` - Masked causal-LM loss
//! - `generation` - Generation config, sampling decoder, answer post-processing
//! - `evaluation` - Candidate ranking and multiple-choice metrics
//! - `judge` - LLM judge pipeline
//! - `cli` - Command-line interface

pub mod cli;
pub mod data;
pub mod error;
pub mod evaluation;
pub mod fusion;
pub mod generation;
pub mod judge;
pub mod model;
pub mod training;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use anyhow::{Error, Result};
pub use data::{Sample, SampleBatch, SampleKind, SampleText};
pub use error::FusionError;
pub use generation::GenerationConfig;
pub use model::{OmniConfig, OmniModel};
