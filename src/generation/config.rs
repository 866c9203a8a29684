//! Decoding parameters for answer generation

use serde::{Deserialize, Serialize};

/// Sampling parameters for autoregressive decoding
///
/// Defaults decode greedily for up to 20 tokens and stop on token id 2
/// (`</s>` in LLaMA vocabularies).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Beam width; only 1 is supported by the built-in decoder
    pub num_beams: usize,

    /// Maximum new tokens to generate
    pub max_new_tokens: usize,

    /// Stop tokens are suppressed until this many tokens were generated
    pub min_length: usize,

    /// Top-p (nucleus sampling) threshold, used when `do_sample` is set
    pub top_p: f32,

    /// Repetition penalty (1.0 = no penalty)
    pub repetition_penalty: f32,

    /// Beam-search length penalty, kept for config compatibility
    pub length_penalty: f32,

    /// Temperature, used when `do_sample` is set
    pub temperature: f32,

    /// Sample instead of taking the argmax
    pub do_sample: bool,

    /// Generation stops once one of these tokens is produced
    pub stop_words_ids: Vec<u32>,

    /// Random seed for reproducibility (None = fixed default)
    pub seed: Option<u64>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            num_beams: 1,
            max_new_tokens: 20,
            min_length: 1,
            top_p: 0.9,
            repetition_penalty: 1.0,
            length_penalty: 1.0,
            temperature: 1.0,
            do_sample: false,
            stop_words_ids: vec![2],
            seed: None,
        }
    }
}

impl GenerationConfig {
    /// Greedy decoding (deterministic)
    pub fn greedy() -> Self {
        Self::default()
    }

    /// Nucleus sampling with the given temperature
    pub fn sampling(temperature: f32) -> Self {
        Self {
            do_sample: true,
            temperature,
            ..Default::default()
        }
    }

    pub fn with_max_new_tokens(mut self, max_tokens: usize) -> Self {
        self.max_new_tokens = max_tokens;
        self
    }

    pub fn with_min_length(mut self, min_length: usize) -> Self {
        self.min_length = min_length;
        self
    }

    pub fn with_num_beams(mut self, num_beams: usize) -> Self {
        self.num_beams = num_beams;
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }

    pub fn with_repetition_penalty(mut self, penalty: f32) -> Self {
        self.repetition_penalty = penalty;
        self
    }

    pub fn with_stop_words(mut self, ids: Vec<u32>) -> Self {
        self.stop_words_ids = ids;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}
