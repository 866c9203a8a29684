//! Model assembly: external capabilities and the multimodal model built on them
//!
//! The vision encoder, audio encoder, language model and tokenizer are opaque
//! components. This module fixes their input/output contracts and wires them
//! together in [`OmniModel`].

mod config;
mod omni;
mod tokenizer;

pub use config::{OmniConfig, PromptPool};
pub use omni::{OmniModel, PreparedEmbeddings};
pub use tokenizer::{BatchEncodedInput, PaddingSide, SpecialTokens, TextTokenizer, TokenizerWrapper};

use anyhow::Result;
use candle_core::{Device, Tensor};

use crate::generation::GenerationConfig;
use crate::training::Reduction;

/// Image encoder producing patch embeddings
pub trait VisionEncoder {
    /// Encode a batch of images
    ///
    /// # Arguments
    /// * `images` - Preprocessed images [batch, ...]
    ///
    /// # Returns
    /// * `(embeddings [batch, patches, hidden], attention_mask [batch, patches])`
    fn encode(&self, images: &Tensor) -> Result<(Tensor, Tensor)>;
}

/// Audio encoder producing one embedding (or a short sequence) per clip
pub trait AudioEncoder {
    /// Encode a batch of audio clips
    ///
    /// # Returns
    /// * `(embeddings [batch, hidden] or [batch, seq, hidden], attention_mask)`
    fn encode(&self, audio: &Tensor) -> Result<(Tensor, Tensor)>;
}

/// Causal language model driven by input embeddings
pub trait LanguageModel {
    /// Look up token embeddings: `[..., seq]` ids to `[..., seq, hidden]`
    fn embed_tokens(&self, token_ids: &Tensor) -> Result<Tensor>;

    /// Compute the language-modeling loss
    ///
    /// # Arguments
    /// * `inputs_embeds` - [batch, seq, hidden]
    /// * `attention_mask` - [batch, seq]
    /// * `labels` - [batch, seq] `i64`, `-100` for ignored positions
    /// * `reduction` - scalar mean or one value per example
    fn forward(
        &self,
        inputs_embeds: &Tensor,
        attention_mask: &Tensor,
        labels: &Tensor,
        reduction: Reduction,
    ) -> Result<Tensor>;

    /// Autoregressively decode new tokens after left-padded input embeddings
    fn generate(
        &self,
        inputs_embeds: &Tensor,
        attention_mask: &Tensor,
        config: &GenerationConfig,
    ) -> Result<Vec<Vec<u32>>>;

    /// Get the device this model is on
    fn device(&self) -> &Device;
}
