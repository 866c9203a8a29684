//! Configuration for multimodal model assembly

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

use crate::generation::AnswerMarkers;

/// Settings for embedding fusion and target construction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OmniConfig {
    /// Maximum answer tokens kept as regression targets
    pub max_txt_len: usize,

    /// Maximum conditioning (prompt + media) positions per example
    pub max_context_len: usize,

    /// Appended to every answer before tokenization
    pub end_sym: String,

    /// Instruction template with a single `{}` slot; empty means no templating
    pub prompt_template: String,

    /// Apply `prompt_template` to single-turn instructions as well
    pub chat_template: bool,

    /// Candidate instructions used when a sample carries none
    pub prompt_list: Vec<String>,

    /// Seed for picking from `prompt_list` (None = entropy)
    pub prompt_seed: Option<u64>,

    /// Marker replaced by one image's patch embeddings
    pub image_placeholder: String,

    /// Markers stripped from generated text
    pub markers: AnswerMarkers,
}

impl Default for OmniConfig {
    fn default() -> Self {
        Self {
            max_txt_len: 32,
            max_context_len: 3800,
            end_sym: "\n".to_string(),
            prompt_template: String::new(),
            chat_template: false,
            prompt_list: Vec::new(),
            prompt_seed: None,
            image_placeholder: "<ImageHere>".to_string(),
            markers: AnswerMarkers::default(),
        }
    }
}

impl OmniConfig {
    /// Load config from a JSON file; missing fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    /// Save config as pretty JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), json)
            .with_context(|| format!("Failed to write config file: {:?}", path.as_ref()))?;
        Ok(())
    }

    pub fn with_max_txt_len(mut self, max_txt_len: usize) -> Self {
        self.max_txt_len = max_txt_len;
        self
    }

    pub fn with_max_context_len(mut self, max_context_len: usize) -> Self {
        self.max_context_len = max_context_len;
        self
    }

    pub fn with_end_sym(mut self, end_sym: &str) -> Self {
        self.end_sym = end_sym.to_string();
        self
    }

    pub fn with_prompt_template(mut self, template: &str) -> Self {
        self.prompt_template = template.to_string();
        self
    }

    pub fn with_chat_template(mut self, enable: bool) -> Self {
        self.chat_template = enable;
        self
    }

    pub fn with_prompt_list(mut self, prompts: Vec<String>, seed: Option<u64>) -> Self {
        self.prompt_list = prompts;
        self.prompt_seed = seed;
        self
    }

    /// Fill the template's `{}` slot with `text`
    pub fn apply_template(&self, text: &str) -> String {
        if self.prompt_template.is_empty() {
            text.to_string()
        } else {
            self.prompt_template.replacen("{}", text, 1)
        }
    }
}

/// Candidate instruction list with a seeded random picker
pub struct PromptPool {
    prompts: Vec<String>,
    rng: Mutex<StdRng>,
}

impl PromptPool {
    pub fn new(prompts: Vec<String>, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            prompts,
            rng: Mutex::new(rng),
        }
    }

    pub fn from_config(config: &OmniConfig) -> Self {
        Self::new(config.prompt_list.clone(), config.prompt_seed)
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }

    /// Pick one instruction uniformly at random
    pub fn choose(&self) -> Result<Option<String>> {
        let mut rng = self
            .rng
            .lock()
            .map_err(|e| anyhow::anyhow!("Prompt RNG lock poisoned: {}", e))?;
        Ok(self.prompts.choose(&mut *rng).cloned())
    }
}
