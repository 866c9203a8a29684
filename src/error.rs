//! Validation errors raised while assembling multimodal inputs
//!
//! Everything else (shape mismatches from candle, I/O, HTTP) travels as a plain
//! `anyhow::Error`. These variants are the ones callers are expected to match on,
//! via `err.downcast_ref::<FusionError>()`.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FusionError {
    #[error(
        "Unmatched numbers of image placeholders and images in example {example}: \
         {placeholders} placeholder(s), {images} image(s)"
    )]
    PlaceholderMismatch {
        example: usize,
        placeholders: usize,
        images: usize,
    },

    #[error("Image input requires accompanying text containing {placeholder}")]
    MissingText { placeholder: String },

    #[error("Batch mismatch for {what}: expected {expected}, got {actual}")]
    BatchMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Nothing to condition on: no prompt text, image or audio embeddings")]
    EmptyConditioning,

    #[error("Invalid sample: {0}")]
    InvalidSample(String),
}

impl FusionError {
    /// Check a per-example count against the batch size
    pub fn check_batch(what: &'static str, expected: usize, actual: usize) -> Result<(), Self> {
        if expected == actual {
            Ok(())
        } else {
            Err(Self::BatchMismatch {
                what,
                expected,
                actual,
            })
        }
    }
}
