//! Answer tokenization and label assembly

use anyhow::Result;
use candle_core::{DType, Device, Tensor};

use super::IGNORE_INDEX;
use crate::error::FusionError;
use crate::model::{PaddingSide, TextTokenizer};

/// Tokenized regression text (the answers the model learns to produce)
#[derive(Debug, Clone)]
pub struct RegressTargets {
    /// `[batch, len]` `u32`, right padded
    pub token_ids: Tensor,
    /// `[batch, len]` `u32`
    pub attention_mask: Tensor,
    /// `[batch, len]` `i64`, [`IGNORE_INDEX`] where no loss is taken
    pub targets: Tensor,
}

impl RegressTargets {
    pub fn batch_size(&self) -> Result<usize> {
        Ok(self.token_ids.dim(0)?)
    }

    pub fn seq_len(&self) -> Result<usize> {
        Ok(self.token_ids.dim(1)?)
    }
}

/// Tokenize single-turn answers
///
/// Each answer gets `end_sym` appended, is encoded without special tokens and
/// truncated to `max_txt_len`. Pad positions are excluded from the targets.
pub fn tokenize_answers(
    tokenizer: &dyn TextTokenizer,
    answers: &[String],
    end_sym: &str,
    max_txt_len: usize,
    device: &Device,
) -> Result<RegressTargets> {
    let texts: Vec<String> = answers
        .iter()
        .map(|answer| format!("{}{}", answer, end_sym))
        .collect();
    let batch = tokenizer.encode_batch(&texts, false, Some(max_txt_len), PaddingSide::Right)?;

    let pad = tokenizer.pad_token_id();
    let targets: Vec<i64> = batch
        .input_ids
        .iter()
        .map(|&id| if id == pad { IGNORE_INDEX } else { id as i64 })
        .collect();

    let (token_ids, attention_mask) = batch.to_tensors(device)?;
    let targets = Tensor::from_vec(targets, (batch.batch_size, batch.seq_len), device)?;
    Ok(RegressTargets {
        token_ids,
        attention_mask,
        targets,
    })
}

/// Place per-example answer targets into a full-length label tensor
///
/// The model input is `[BOS] ++ conditioning[..len] ++ answer ++ padding`, so
/// the answer targets of example `i` land at `input_lens[i] + 1`. Every other
/// position is [`IGNORE_INDEX`].
///
/// # Arguments
/// * `part_targets` - `[batch, answer_len]` `i64`
/// * `input_lens` - attended conditioning length per example
/// * `total_len` - sequence length of the final model input
pub fn assemble_targets(
    part_targets: &Tensor,
    input_lens: &[usize],
    total_len: usize,
) -> Result<Tensor> {
    let part: Vec<Vec<i64>> = part_targets.to_dtype(DType::I64)?.to_vec2()?;
    FusionError::check_batch("input lengths", part.len(), input_lens.len())?;

    let mut labels = vec![IGNORE_INDEX; part.len() * total_len];
    for (i, (row, &len)) in part.iter().zip(input_lens.iter()).enumerate() {
        let start = len + 1;
        if start + row.len() > total_len {
            return Err(FusionError::InvalidSample(format!(
                "answer targets of example {} end at {} past sequence length {}",
                i,
                start + row.len(),
                total_len
            ))
            .into());
        }
        let offset = i * total_len + start;
        labels[offset..offset + row.len()].copy_from_slice(row);
    }

    Ok(Tensor::from_vec(
        labels,
        (part.len(), total_len),
        part_targets.device(),
    )?)
}
