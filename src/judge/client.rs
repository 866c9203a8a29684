//! OpenAI-compatible chat completion client

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::prompt::ChatMessage;

/// Environment variable consulted when no key file is given
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Anything that can answer a chat-completion request
pub trait ChatBackend {
    /// Send `messages` and return the assistant reply text
    fn complete(&self, messages: &[ChatMessage], model: &str, temperature: f32) -> Result<String>;
}

/// Blocking client for `POST {base_url}/chat/completions`
pub struct OpenAiClient {
    client: reqwest::blocking::Client,
    base_url: String,
    api_key: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    content: Option<String>,
}

impl OpenAiClient {
    pub fn new(base_url: &str, api_key: String) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

impl ChatBackend for OpenAiClient {
    fn complete(&self, messages: &[ChatMessage], model: &str, temperature: f32) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let request = ChatRequest {
            model,
            messages,
            temperature,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .context(format!("Failed to reach {}", url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            bail!("Chat completion failed: HTTP {}: {}", status, body);
        }

        let parsed: ChatResponse = response
            .json()
            .context("Failed to parse chat completion response")?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| anyhow!("Chat completion returned no content"))
    }
}

/// Read the API key from `key_name` in a JSON key file, or from `OPENAI_API_KEY`
pub fn resolve_api_key(key_file: Option<&Path>, key_name: &str) -> Result<String> {
    if let Some(path) = key_file {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read API key file: {:?}", path))?;
        let keys: serde_json::Value = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse API key file: {:?}", path))?;
        return keys
            .get(key_name)
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| anyhow!("Key {:?} not found in {:?}", key_name, path));
    }

    std::env::var(API_KEY_ENV)
        .map_err(|_| anyhow!("No API key file given and {} is not set", API_KEY_ENV))
}
