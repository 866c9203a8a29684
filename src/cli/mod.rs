//! Command-line interface
//!
//! Provides the CLI commands exposed by the `omnimod` binary.

use crate::judge::{Judge, JudgeConfig, JudgeSummary};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Execute the judge command
pub fn judge(
    input: String,
    output: String,
    model: String,
    base_url: String,
    temperature: f32,
    api_key_file: Option<String>,
    api_key_name: String,
) -> Result<JudgeSummary> {
    tracing::info!("Starting LLM judge");
    tracing::info!("  Input: {}", input);
    tracing::info!("  Output: {}", output);
    tracing::info!("  Model: {}", model);
    tracing::info!("  Base URL: {}", base_url);
    tracing::info!("  Temperature: {}", temperature);

    let input_path = Path::new(&input);
    if !input_path.is_file() {
        anyhow::bail!("Input file does not exist: {}", input);
    }

    let config = JudgeConfig {
        model,
        temperature,
        base_url,
        api_key_file: api_key_file.map(PathBuf::from),
        api_key_name,
    };
    let judge = Judge::from_config(config).context("Failed to initialize judge")?;

    let summary = judge.run_files(input_path, Path::new(&output))?;
    tracing::info!("{}", summary);
    Ok(summary)
}
