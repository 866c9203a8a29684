//! Embedding fusion and target construction
//!
//! Turns per-example text, image and audio embeddings into the batched,
//! padded tensors a causal language model consumes:
//!
//! - `prompt` - interleave text segments with image/audio embeddings at placeholders
//! - `conversation` - multi-turn answer/question token sequences with masked labels
//! - `concat` - splice answer embeddings after the real conditioning content
//! - `targets` - single-turn answer tokenization and final label assembly
//!
//! Conventions shared by every function here:
//! - embeddings are `[batch, seq, hidden]`, attention masks `[batch, seq]` in `u32`
//! - training tensors are right padded, generation tensors left padded
//! - labels are `i64` with [`IGNORE_INDEX`] marking positions excluded from the loss

pub mod concat;
pub mod conversation;
pub mod prompt;
pub mod targets;

pub use concat::{concat_input_output, SplicedSequence};
pub use conversation::ConversationTokenizer;
pub use prompt::{ImageEmbeds, PromptWrapper};
pub use targets::{assemble_targets, tokenize_answers, RegressTargets};

use anyhow::Result;
use candle_core::{DType, IndexOp, Tensor};

/// Label value skipped by the loss
pub const IGNORE_INDEX: i64 = -100;

/// Batched embeddings with their attention mask
#[derive(Debug, Clone)]
pub struct EmbeddingSequence {
    /// `[batch, seq, hidden]`
    pub embeds: Tensor,
    /// `[batch, seq]`, 1 for real content, 0 for padding
    pub atts: Tensor,
}

impl EmbeddingSequence {
    pub fn new(embeds: Tensor, atts: Tensor) -> Self {
        Self { embeds, atts }
    }

    pub fn batch_size(&self) -> Result<usize> {
        Ok(self.embeds.dim(0)?)
    }

    pub fn seq_len(&self) -> Result<usize> {
        Ok(self.embeds.dim(1)?)
    }

    /// Number of attended positions per example
    pub fn true_lengths(&self) -> Result<Vec<usize>> {
        mask_lengths(&self.atts)
    }
}

/// Sum each row of an attention mask
pub(crate) fn mask_lengths(atts: &Tensor) -> Result<Vec<usize>> {
    let batch_size = atts.dim(0)?;
    let atts = atts.to_dtype(DType::U32)?;
    let mut lengths = Vec::with_capacity(batch_size);
    for i in 0..batch_size {
        let len = atts.i(i)?.sum_all()?.to_scalar::<u32>()?;
        lengths.push(len as usize);
    }
    Ok(lengths)
}

/// Concatenate `[len, hidden]` pieces along the sequence axis, skipping empty ones
///
/// Returns `None` when every piece is empty.
pub(crate) fn cat_sequence(pieces: &[Tensor]) -> Result<Option<Tensor>> {
    let non_empty: Vec<&Tensor> = pieces
        .iter()
        .filter(|t| t.dims().first().copied().unwrap_or(0) > 0)
        .collect();
    match non_empty.len() {
        0 => Ok(None),
        1 => Ok(Some(non_empty[0].clone())),
        _ => Ok(Some(Tensor::cat(&non_empty, 0)?)),
    }
}

/// Right-pad per-example `[len_i, hidden]` sequences into one batch
///
/// The batch length is the longest sequence capped at `max_len`. Each example
/// keeps its first `min(len_i, max_len)` positions; the rest is filled with
/// `pad_embed` (`[hidden]`) and masked out.
pub(crate) fn pad_right(
    sequences: &[Tensor],
    pad_embed: &Tensor,
    max_len: usize,
) -> Result<EmbeddingSequence> {
    let hidden = pad_embed.dim(0)?;
    let device = pad_embed.device();
    let lengths = sequences
        .iter()
        .map(|s| s.dim(0))
        .collect::<candle_core::Result<Vec<_>>>()?;
    let batch_len = lengths.iter().copied().max().unwrap_or(0).min(max_len);
    let batch_size = sequences.len();

    let mut mask = vec![0u32; batch_size * batch_len];
    if batch_len == 0 {
        let embeds = Tensor::zeros((batch_size, 0, hidden), pad_embed.dtype(), device)?;
        let atts = Tensor::from_vec(mask, (batch_size, 0), device)?;
        return Ok(EmbeddingSequence::new(embeds, atts));
    }

    let mut rows = Vec::with_capacity(batch_size);
    for (i, (seq, &len)) in sequences.iter().zip(lengths.iter()).enumerate() {
        let keep = len.min(batch_len);
        let mut pieces = Vec::with_capacity(2);
        if keep > 0 {
            pieces.push(seq.narrow(0, 0, keep)?.to_dtype(pad_embed.dtype())?);
        }
        if keep < batch_len {
            pieces.push(
                pad_embed
                    .unsqueeze(0)?
                    .broadcast_as((batch_len - keep, hidden))?
                    .contiguous()?,
            );
        }
        // batch_len > 0 guarantees at least one piece
        let row = cat_sequence(&pieces)?.ok_or_else(|| anyhow::anyhow!("empty padded row"))?;
        rows.push(row);
        mask[i * batch_len..i * batch_len + keep].fill(1);
    }

    let embeds = Tensor::stack(&rows, 0)?;
    let atts = Tensor::from_vec(mask, (batch_size, batch_len), device)?;
    Ok(EmbeddingSequence::new(embeds, atts))
}

/// Left-pad per-example `[len_i, hidden]` sequences with zeros
///
/// Content is right-aligned so the last position of every row is the last real
/// token, which is what autoregressive decoding continues from.
pub(crate) fn pad_left(sequences: &[Tensor]) -> Result<EmbeddingSequence> {
    let first = sequences
        .first()
        .ok_or_else(|| anyhow::anyhow!("cannot pad an empty batch"))?;
    let (_, hidden) = first.dims2()?;
    let dtype = first.dtype();
    let device = first.device();
    let lengths = sequences
        .iter()
        .map(|s| s.dim(0))
        .collect::<candle_core::Result<Vec<_>>>()?;
    let batch_len = lengths.iter().copied().max().unwrap_or(0);
    let batch_size = sequences.len();

    let mut rows = Vec::with_capacity(batch_size);
    let mut mask = vec![0u32; batch_size * batch_len];
    for (i, (seq, &len)) in sequences.iter().zip(lengths.iter()).enumerate() {
        let mut pieces = Vec::with_capacity(2);
        if len < batch_len {
            pieces.push(Tensor::zeros((batch_len - len, hidden), dtype, device)?);
        }
        pieces.push(seq.to_dtype(dtype)?);
        let row = match cat_sequence(&pieces)? {
            Some(row) => row,
            None => Tensor::zeros((0, hidden), dtype, device)?,
        };
        rows.push(row);
        mask[(i + 1) * batch_len - len..(i + 1) * batch_len].fill(1);
    }

    let embeds = Tensor::stack(&rows, 0)?;
    let atts = Tensor::from_vec(mask, (batch_size, batch_len), device)?;
    Ok(EmbeddingSequence::new(embeds, atts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn seq(values: &[f32], hidden: usize) -> Tensor {
        let rows: Vec<f32> = values
            .iter()
            .flat_map(|v| std::iter::repeat(*v).take(hidden))
            .collect();
        Tensor::from_vec(rows, (values.len(), hidden), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_pad_right_fills_tail_with_pad_embedding() {
        let pad = Tensor::new(&[-1f32, -1.0], &Device::Cpu).unwrap();
        let batch = pad_right(&[seq(&[1.0, 2.0, 3.0], 2), seq(&[4.0], 2)], &pad, 16).unwrap();

        assert_eq!(batch.embeds.dims(), &[2, 3, 2]);
        let atts: Vec<Vec<u32>> = batch.atts.to_vec2().unwrap();
        assert_eq!(atts, vec![vec![1, 1, 1], vec![1, 0, 0]]);

        let embeds: Vec<Vec<Vec<f32>>> = batch.embeds.to_vec3().unwrap();
        assert_eq!(embeds[1][0], vec![4.0, 4.0]);
        assert_eq!(embeds[1][1], vec![-1.0, -1.0]);
        assert_eq!(embeds[1][2], vec![-1.0, -1.0]);
    }

    #[test]
    fn test_pad_right_truncates_to_max_len() {
        let pad = Tensor::new(&[0f32], &Device::Cpu).unwrap();
        let batch = pad_right(&[seq(&[1.0, 2.0, 3.0, 4.0], 1), seq(&[5.0], 1)], &pad, 2).unwrap();

        let embeds: Vec<Vec<Vec<f32>>> = batch.embeds.to_vec3().unwrap();
        assert_eq!(embeds[0], vec![vec![1.0], vec![2.0]]);
        assert_eq!(batch.true_lengths().unwrap(), vec![2, 1]);
    }

    #[test]
    fn test_pad_left_right_aligns_content() {
        let batch = pad_left(&[seq(&[1.0], 1), seq(&[2.0, 3.0, 4.0], 1)]).unwrap();

        let atts: Vec<Vec<u32>> = batch.atts.to_vec2().unwrap();
        assert_eq!(atts, vec![vec![0, 0, 1], vec![1, 1, 1]]);
        let embeds: Vec<Vec<Vec<f32>>> = batch.embeds.to_vec3().unwrap();
        assert_eq!(embeds[0], vec![vec![0.0], vec![0.0], vec![1.0]]);
    }

    #[test]
    fn test_cat_sequence_skips_empty_pieces() {
        let empty = Tensor::zeros((0, 2), DType::F32, &Device::Cpu).unwrap();
        let out = cat_sequence(&[empty.clone(), seq(&[1.0], 2), empty])
            .unwrap()
            .unwrap();
        assert_eq!(out.dims(), &[1, 2]);

        let none = cat_sequence(&[Tensor::zeros((0, 2), DType::F32, &Device::Cpu).unwrap()]).unwrap();
        assert!(none.is_none());
    }
}
