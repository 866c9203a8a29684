//! Training objective
//!
//! The multimodal model only needs a language-modeling loss over the fused
//! sequence; batching and optimization belong to the caller.
//!
//! - `loss` - shifted cross-entropy with [`Reduction`] control

pub mod loss;

pub use loss::{causal_lm_loss, Reduction};
