//! Tokenizer capability and the HuggingFace tokenizer wrapper
//!
//! Fusion code only talks to [`TextTokenizer`], so tests can swap in a
//! deterministic word-level tokenizer.

use anyhow::{anyhow, Result};
use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokenizers::Tokenizer;

/// Which side of a sequence receives padding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaddingSide {
    Left,
    #[default]
    Right,
}

/// Text tokenizer owned by the language model
pub trait TextTokenizer {
    /// Encode a single text into token IDs
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>>;

    /// Decode token IDs back to text
    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String>;

    fn pad_token_id(&self) -> u32;

    fn bos_token_id(&self) -> u32;

    fn eos_token_id(&self) -> u32;

    /// Literal beginning-of-sequence token, prepended to conversation questions
    fn bos_token(&self) -> &str;

    /// Encode a batch, truncating each row to `max_length` and padding to the longest row
    fn encode_batch(
        &self,
        texts: &[String],
        add_special_tokens: bool,
        max_length: Option<usize>,
        side: PaddingSide,
    ) -> Result<BatchEncodedInput> {
        let mut rows = Vec::with_capacity(texts.len());
        for text in texts {
            let mut ids = self.encode(text, add_special_tokens)?;
            if let Some(max_length) = max_length {
                ids.truncate(max_length);
            }
            rows.push(ids);
        }

        let batch_size = rows.len();
        let seq_len = rows.iter().map(Vec::len).max().unwrap_or(0);
        let pad = self.pad_token_id();

        let mut input_ids = Vec::with_capacity(batch_size * seq_len);
        let mut attention_mask = Vec::with_capacity(batch_size * seq_len);
        for ids in &rows {
            let padding = seq_len - ids.len();
            match side {
                PaddingSide::Right => {
                    input_ids.extend_from_slice(ids);
                    input_ids.extend(std::iter::repeat(pad).take(padding));
                    attention_mask.extend(std::iter::repeat(1).take(ids.len()));
                    attention_mask.extend(std::iter::repeat(0).take(padding));
                }
                PaddingSide::Left => {
                    input_ids.extend(std::iter::repeat(pad).take(padding));
                    input_ids.extend_from_slice(ids);
                    attention_mask.extend(std::iter::repeat(0).take(padding));
                    attention_mask.extend(std::iter::repeat(1).take(ids.len()));
                }
            }
        }

        Ok(BatchEncodedInput {
            input_ids,
            attention_mask,
            batch_size,
            seq_len,
        })
    }
}

/// Special token strings looked up in the vocabulary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecialTokens {
    pub bos: String,
    pub eos: String,
    /// Falls back to `eos` when the vocabulary has no dedicated pad token
    pub pad: Option<String>,
}

impl Default for SpecialTokens {
    fn default() -> Self {
        Self {
            bos: "<s>".to_string(),
            eos: "</s>".to_string(),
            pad: None,
        }
    }
}

/// Wrapper around HuggingFace tokenizer
pub struct TokenizerWrapper {
    tokenizer: Tokenizer,
    special: SpecialTokens,
    bos_id: u32,
    eos_id: u32,
    pad_id: u32,
}

impl TokenizerWrapper {
    /// Load tokenizer from a `tokenizer.json` file with LLaMA-style special tokens
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_file_with_special_tokens(path, SpecialTokens::default())
    }

    pub fn from_file_with_special_tokens(
        path: impl AsRef<Path>,
        special: SpecialTokens,
    ) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(path.as_ref())
            .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;
        Self::new(tokenizer, special)
    }

    /// Wrap an already constructed tokenizer
    pub fn new(tokenizer: Tokenizer, special: SpecialTokens) -> Result<Self> {
        let lookup = |token: &str| {
            tokenizer
                .token_to_id(token)
                .ok_or_else(|| anyhow!("Special token {:?} not found in vocabulary", token))
        };

        let bos_id = lookup(&special.bos)?;
        let eos_id = lookup(&special.eos)?;
        let pad_id = match &special.pad {
            Some(pad) => lookup(pad)?,
            None => {
                tracing::debug!("No pad token configured, padding with eos ({})", eos_id);
                eos_id
            }
        };

        Ok(Self {
            tokenizer,
            special,
            bos_id,
            eos_id,
            pad_id,
        })
    }
}

impl TextTokenizer for TokenizerWrapper {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, add_special_tokens)
            .map_err(|e| anyhow!("Tokenization failed: {}", e))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.tokenizer
            .decode(ids, skip_special_tokens)
            .map_err(|e| anyhow!("Decoding failed: {}", e))
    }

    fn pad_token_id(&self) -> u32 {
        self.pad_id
    }

    fn bos_token_id(&self) -> u32 {
        self.bos_id
    }

    fn eos_token_id(&self) -> u32 {
        self.eos_id
    }

    fn bos_token(&self) -> &str {
        &self.special.bos
    }
}

/// Batch encoded input
#[derive(Debug, Clone)]
pub struct BatchEncodedInput {
    /// Flattened token IDs [batch_size * seq_len]
    pub input_ids: Vec<u32>,
    /// Flattened attention mask
    pub attention_mask: Vec<u32>,
    /// Batch size
    pub batch_size: usize,
    /// Sequence length (after padding)
    pub seq_len: usize,
}

impl BatchEncodedInput {
    /// Convert to `u32` tensors [batch_size, seq_len]
    pub fn to_tensors(&self, device: &Device) -> Result<(Tensor, Tensor)> {
        let shape = (self.batch_size, self.seq_len);
        let input_ids = Tensor::from_vec(self.input_ids.clone(), shape, device)?;
        let attention_mask = Tensor::from_vec(self.attention_mask.clone(), shape, device)?;
        Ok((input_ids, attention_mask))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    const TOKENIZER_JSON: &str = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": {"<unk>": 0, "<s>": 1, "</s>": 2, "hello": 3, "world": 4},
            "unk_token": "<unk>"
        }
    }"#;

    fn wrapper(special: SpecialTokens) -> Result<TokenizerWrapper> {
        let tokenizer = Tokenizer::from_str(TOKENIZER_JSON).map_err(|e| anyhow!("{}", e))?;
        TokenizerWrapper::new(tokenizer, special)
    }

    #[test]
    fn test_special_token_resolution() {
        let tokenizer = wrapper(SpecialTokens::default()).unwrap();
        assert_eq!(tokenizer.bos_token_id(), 1);
        assert_eq!(tokenizer.eos_token_id(), 2);
        // no pad token configured
        assert_eq!(tokenizer.pad_token_id(), 2);
        assert_eq!(tokenizer.bos_token(), "<s>");
    }

    #[test]
    fn test_missing_special_token_fails() {
        let special = SpecialTokens {
            pad: Some("<pad>".to_string()),
            ..Default::default()
        };
        assert!(wrapper(special).is_err());
    }

    #[test]
    fn test_encode_words() {
        let tokenizer = wrapper(SpecialTokens::default()).unwrap();
        assert_eq!(tokenizer.encode("hello world", false).unwrap(), vec![3, 4]);
        assert!(tokenizer.encode("", false).unwrap().is_empty());
    }

    #[test]
    fn test_encode_batch_padding_sides() {
        let tokenizer = wrapper(SpecialTokens::default()).unwrap();
        let texts = vec!["hello world".to_string(), "world".to_string()];

        let right = tokenizer
            .encode_batch(&texts, false, None, PaddingSide::Right)
            .unwrap();
        assert_eq!(right.seq_len, 2);
        assert_eq!(right.input_ids, vec![3, 4, 4, 2]);
        assert_eq!(right.attention_mask, vec![1, 1, 1, 0]);

        let left = tokenizer
            .encode_batch(&texts, false, None, PaddingSide::Left)
            .unwrap();
        assert_eq!(left.input_ids, vec![3, 4, 2, 4]);
        assert_eq!(left.attention_mask, vec![1, 1, 0, 1]);
    }

    #[test]
    fn test_encode_batch_truncates() {
        let tokenizer = wrapper(SpecialTokens::default()).unwrap();
        let batch = tokenizer
            .encode_batch(&["hello world hello".to_string()], false, Some(2), PaddingSide::Right)
            .unwrap();
        assert_eq!(batch.input_ids, vec![3, 4]);

        let (ids, mask) = batch.to_tensors(&Device::Cpu).unwrap();
        assert_eq!(ids.dims(), &[1, 2]);
        assert_eq!(mask.to_vec2::<u32>().unwrap(), vec![vec![1, 1]]);
    }
}
