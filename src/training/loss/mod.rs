//! Loss functions for causal language modeling
//!
//! Includes:
//! - Next-token cross-entropy with ignored label positions
//! - Per-example reduction used to score answer candidates

use anyhow::{bail, Result};
use candle_core::{DType, Tensor, D};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::fusion::IGNORE_INDEX;

/// How token losses are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reduction {
    /// Single scalar: mean over every kept token in the batch
    #[default]
    Mean,
    /// One value per example: mean over that example's kept tokens
    None,
}

impl FromStr for Reduction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "mean" => Ok(Self::Mean),
            "none" => Ok(Self::None),
            other => bail!("Unknown reduction: {} (expected mean or none)", other),
        }
    }
}

impl fmt::Display for Reduction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mean => write!(f, "mean"),
            Self::None => write!(f, "none"),
        }
    }
}

/// Shifted next-token cross-entropy
///
/// Position `t` predicts `labels[t + 1]`; labels equal to [`IGNORE_INDEX`]
/// contribute nothing. An example with no kept label scores 0.
///
/// # Arguments
/// * `logits` - [batch, seq, vocab]
/// * `labels` - [batch, seq] `i64`
/// * `reduction` - scalar mean or per-example mean
///
/// # Returns
/// * Scalar tensor for [`Reduction::Mean`], `[batch]` for [`Reduction::None`]
pub fn causal_lm_loss(logits: &Tensor, labels: &Tensor, reduction: Reduction) -> Result<Tensor> {
    let (batch_size, seq_len, _vocab) = logits.dims3()?;
    let device = logits.device();
    if labels.dims() != [batch_size, seq_len] {
        bail!(
            "Labels shape {:?} does not match logits shape {:?}",
            labels.dims(),
            logits.dims()
        );
    }

    if seq_len < 2 {
        return zero_loss(batch_size, reduction, device);
    }
    let steps = seq_len - 1;

    let labels: Vec<Vec<i64>> = labels.to_dtype(DType::I64)?.to_vec2()?;
    let mut indices = Vec::with_capacity(batch_size * steps);
    let mut weights = Vec::with_capacity(batch_size * steps);
    for row in &labels {
        for &label in &row[1..] {
            if label == IGNORE_INDEX {
                indices.push(0u32);
                weights.push(0f32);
            } else {
                indices.push(label as u32);
                weights.push(1f32);
            }
        }
    }
    let indices = Tensor::from_vec(indices, (batch_size, steps, 1), device)?;
    let weights = Tensor::from_vec(weights, (batch_size, steps), device)?;

    // Predictions for positions 0..seq-1
    let shift_logits = logits.narrow(1, 0, steps)?.to_dtype(DType::F32)?;
    let log_probs = candle_nn::ops::log_softmax(&shift_logits, D::Minus1)?;
    let token_nll = log_probs.gather(&indices, 2)?.squeeze(2)?.neg()?;
    let token_nll = (token_nll * &weights)?;

    match reduction {
        Reduction::Mean => {
            let count = weights.sum_all()?.to_scalar::<f32>()?.max(1.0);
            Ok((token_nll.sum_all()? / count as f64)?)
        }
        Reduction::None => {
            let counts = weights.sum(1)?.clamp(1.0, f64::MAX)?;
            Ok(token_nll.sum(1)?.div(&counts)?)
        }
    }
}

fn zero_loss(batch_size: usize, reduction: Reduction, device: &candle_core::Device) -> Result<Tensor> {
    Ok(match reduction {
        Reduction::Mean => Tensor::new(0f32, device)?,
        Reduction::None => Tensor::zeros(batch_size, DType::F32, device)?,
    })
}
