//! LLM-as-judge grading of generated answers
//!
//! Each record holds a question, a ground-truth answer and a model
//! prediction. A chat model grades the prediction on a 0-3 rubric and the
//! graded records are appended to an output JSON file.

pub mod client;
pub mod prompt;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{error, info};

pub use client::{resolve_api_key, ChatBackend, OpenAiClient};
pub use prompt::{build_messages, parse_evaluation, ChatMessage};

/// One prediction to be graded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeInput {
    pub image_id: serde_json::Value,
    pub text_question: String,
    pub ground_truth: String,
    pub predict: String,
}

impl JudgeInput {
    /// Convert one raw input record
    pub fn from_record(record: &serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(record.clone())?)
    }
}

/// The judge's verdict, kept as the judge wrote it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    pub evaluation: String,
    pub score: serde_json::Value,
}

impl Evaluation {
    /// The score as an integer on the 0-3 rubric, if it is one
    ///
    /// Numeric strings such as `"2"` are accepted.
    pub fn rubric_score(&self) -> Option<u8> {
        let score = match &self.score {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => s.trim().parse::<u64>().ok(),
            _ => None,
        }?;
        u8::try_from(score).ok().filter(|s| *s <= prompt::MAX_SCORE)
    }
}

/// Input record with its verdict attached
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgedRecord {
    #[serde(flatten)]
    pub input: JudgeInput,
    pub evaluation: Evaluation,
}

/// Judge settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeConfig {
    pub model: String,
    pub temperature: f32,
    pub base_url: String,
    /// JSON file holding API keys; falls back to `OPENAI_API_KEY` when unset
    pub api_key_file: Option<PathBuf>,
    pub api_key_name: String,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            temperature: 0.1,
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_file: None,
            api_key_name: "openai".to_string(),
        }
    }
}

/// Outcome of a grading run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JudgeSummary {
    pub processed: usize,
    pub failed: usize,
    pub mean_score: Option<f64>,
}

impl JudgeSummary {
    fn from_records(records: &[JudgedRecord], failed: usize) -> Self {
        let scores: Vec<f64> = records
            .iter()
            .filter_map(|r| r.evaluation.rubric_score())
            .map(f64::from)
            .collect();
        let mean_score =
            (!scores.is_empty()).then(|| scores.iter().sum::<f64>() / scores.len() as f64);
        Self {
            processed: records.len(),
            failed,
            mean_score,
        }
    }
}

impl std::fmt::Display for JudgeSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.mean_score {
            Some(mean) => write!(
                f,
                "Graded {} records ({} failed) | Mean score: {:.3}",
                self.processed, self.failed, mean
            ),
            None => write!(f, "Graded {} records ({} failed)", self.processed, self.failed),
        }
    }
}

/// Grades predictions through a [`ChatBackend`]
pub struct Judge<B: ChatBackend> {
    backend: B,
    config: JudgeConfig,
}

impl Judge<OpenAiClient> {
    /// Judge backed by the OpenAI-compatible endpoint named in `config`
    pub fn from_config(config: JudgeConfig) -> Result<Self> {
        let api_key = resolve_api_key(config.api_key_file.as_deref(), &config.api_key_name)?;
        let backend = OpenAiClient::new(&config.base_url, api_key)?;
        Ok(Self::new(backend, config))
    }
}

impl<B: ChatBackend> Judge<B> {
    pub fn new(backend: B, config: JudgeConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &JudgeConfig {
        &self.config
    }

    /// Grade a single prediction
    pub fn evaluate(&self, input: &JudgeInput) -> Result<Evaluation> {
        let messages = build_messages(input);
        let reply = self
            .backend
            .complete(&messages, &self.config.model, self.config.temperature)?;
        parse_evaluation(&reply)
    }

    /// Grade every input record in order
    ///
    /// A record that is malformed or fails to grade is logged with its
    /// `image_id` and skipped.
    pub fn run(&self, inputs: &[serde_json::Value]) -> (Vec<JudgedRecord>, usize) {
        let mut records = Vec::with_capacity(inputs.len());
        let mut failed = 0;

        for (i, record) in inputs.iter().enumerate() {
            let graded = JudgeInput::from_record(record)
                .and_then(|input| self.evaluate(&input).map(|evaluation| (input, evaluation)));
            match graded {
                Ok((input, evaluation)) => {
                    info!(
                        "[{}/{}] image_id={} score={}",
                        i + 1,
                        inputs.len(),
                        input.image_id,
                        evaluation.score
                    );
                    records.push(JudgedRecord { input, evaluation });
                }
                Err(e) => {
                    let image_id = record.get("image_id").unwrap_or(&serde_json::Value::Null);
                    error!("Error processing image_id {}: {:#}", image_id, e);
                    failed += 1;
                }
            }
        }

        (records, failed)
    }

    /// Grade `input_path` and append the results to `output_path`
    ///
    /// Existing records in the output file are kept. The file is written once,
    /// after every input has been graded.
    pub fn run_files(&self, input_path: &Path, output_path: &Path) -> Result<JudgeSummary> {
        let inputs = load_inputs(input_path)?;
        let mut existing = load_existing(output_path)?;
        info!(
            "Loaded {} inputs, {} existing results",
            inputs.len(),
            existing.len()
        );

        let (records, failed) = self.run(&inputs);
        let summary = JudgeSummary::from_records(&records, failed);

        existing.extend(
            records
                .into_iter()
                .map(serde_json::to_value)
                .collect::<std::result::Result<Vec<_>, _>>()?,
        );
        save_records(output_path, &existing)?;
        info!("Saved {} results to {:?}", existing.len(), output_path);

        Ok(summary)
    }
}

/// Read the JSON array of input records; each record is validated when graded
pub fn load_inputs(path: &Path) -> Result<Vec<serde_json::Value>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read input file: {:?}", path))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse input file: {:?}", path))
}

/// Previously written results, or an empty list when the file does not exist
fn load_existing(path: &Path) -> Result<Vec<serde_json::Value>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read output file: {:?}", path))?;
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&content).with_context(|| format!("Failed to parse output file: {:?}", path))
}

fn save_records(path: &Path, records: &[serde_json::Value]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }
    }

    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    records.serialize(&mut ser)?;
    std::fs::write(path, buf).with_context(|| format!("Failed to write output file: {:?}", path))
}
