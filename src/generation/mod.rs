//! Answer generation
//!
//! - `config` - decoding parameters
//! - `sampler` - greedy/nucleus decoding driven by input embeddings
//!
//! Generated token ids are turned into answers by [`clean_answer`], which
//! strips chat markers the language model tends to echo.

pub mod config;
pub mod sampler;

pub use config::GenerationConfig;
pub use sampler::{decode_from_embeddings, CausalLm, CausalLmHead};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::model::TextTokenizer;

/// Literal markers removed from decoded answers; an empty marker is skipped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnswerMarkers {
    /// Removed wherever it appears
    pub bos: String,
    /// Text after the first occurrence is dropped
    pub eos: String,
    /// Only text after the last occurrence is kept
    pub instruction_close: String,
}

impl Default for AnswerMarkers {
    fn default() -> Self {
        Self {
            bos: "<s>".to_string(),
            eos: "</s>".to_string(),
            instruction_close: "[/INST]".to_string(),
        }
    }
}

/// Decode generated ids into a clean answer
///
/// A leading BOS id is dropped before decoding with special tokens skipped.
pub fn clean_answer(
    tokenizer: &dyn TextTokenizer,
    tokens: &[u32],
    markers: &AnswerMarkers,
) -> Result<String> {
    let tokens = match tokens.split_first() {
        Some((&first, rest)) if first == tokenizer.bos_token_id() => rest,
        _ => tokens,
    };
    let text = tokenizer.decode(tokens, true)?;
    Ok(strip_markers(&text, markers))
}

pub(crate) fn strip_markers(text: &str, markers: &AnswerMarkers) -> String {
    let mut text = text;
    if !markers.eos.is_empty() {
        text = text.split(markers.eos.as_str()).next().unwrap_or_default();
    }
    let mut text = if markers.bos.is_empty() {
        text.to_string()
    } else {
        text.replace(markers.bos.as_str(), "")
    };
    if !markers.instruction_close.is_empty() {
        if let Some(pos) = text.rfind(markers.instruction_close.as_str()) {
            text = text[pos + markers.instruction_close.len()..].to_string();
        }
    }
    text.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;

    #[test]
    fn test_strip_markers() {
        let markers = AnswerMarkers::default();
        assert_eq!(strip_markers("  a cat </s> junk", &markers), "a cat");
        assert_eq!(strip_markers("<s>[INST] q [/INST] x [/INST] dog", &markers), "dog");
        assert_eq!(strip_markers("plain", &markers), "plain");

        let none = AnswerMarkers {
            bos: String::new(),
            eos: String::new(),
            instruction_close: String::new(),
        };
        assert_eq!(strip_markers(" <s>a</s>b ", &none), "<s>a</s>b");
    }

    #[test]
    fn test_clean_answer_drops_leading_bos() {
        let tok = WordTokenizer::standard();
        let tokens = [BOS_ID, tok.id("[INST]"), tok.id("what"), tok.id("[/INST]"), tok.id("cat"), EOS_ID];
        let answer = clean_answer(&tok, &tokens, &AnswerMarkers::default()).unwrap();
        assert_eq!(answer, "cat");

        let tokens = [tok.id("a"), tok.id("dog")];
        let answer = clean_answer(&tok, &tokens, &AnswerMarkers::default()).unwrap();
        assert_eq!(answer, "a dog");
    }
}
