//! Splice answer embeddings into right-padded conditioning embeddings

use anyhow::Result;
use candle_core::{IndexOp, Tensor};

use super::{cat_sequence, mask_lengths, EmbeddingSequence};
use crate::error::FusionError;

/// Conditioning and answer embeddings joined per example
#[derive(Debug, Clone)]
pub struct SplicedSequence {
    /// `[batch, cond_len + out_len, hidden]`
    pub embeds: Tensor,
    /// `[batch, cond_len + out_len]`
    pub atts: Tensor,
    /// Attended conditioning length per example, where the answer starts
    pub input_lens: Vec<usize>,
}

/// Insert each example's output right after its real conditioning content
///
/// For example `i` with `len = sum(input.atts[i])` the result is
/// `input[..len] ++ output ++ input[len..]`, so conditioning padding moves
/// behind the answer and the sequence length is unchanged.
pub fn concat_input_output(
    input: &EmbeddingSequence,
    output_embeds: &Tensor,
    output_atts: &Tensor,
) -> Result<SplicedSequence> {
    let batch_size = input.batch_size()?;
    FusionError::check_batch("output embeddings", batch_size, output_embeds.dim(0)?)?;
    FusionError::check_batch("output attention mask", batch_size, output_atts.dim(0)?)?;

    let input_lens = mask_lengths(&input.atts)?;
    let output_embeds = output_embeds.to_dtype(input.embeds.dtype())?;
    let output_atts = output_atts.to_dtype(input.atts.dtype())?;

    let mut embeds = Vec::with_capacity(batch_size);
    let mut atts = Vec::with_capacity(batch_size);
    for (i, &len) in input_lens.iter().enumerate() {
        let in_embeds = input.embeds.i(i)?;
        let in_atts = input.atts.i(i)?;
        let tail = in_embeds.dim(0)? - len;

        let embed_pieces = [
            in_embeds.narrow(0, 0, len)?,
            output_embeds.i(i)?,
            in_embeds.narrow(0, len, tail)?,
        ];
        let att_pieces = [
            in_atts.narrow(0, 0, len)?,
            output_atts.i(i)?,
            in_atts.narrow(0, len, tail)?,
        ];

        let row_embeds = cat_sequence(&embed_pieces)?;
        let row_atts = cat_sequence(&att_pieces)?;
        match (row_embeds, row_atts) {
            (Some(e), Some(a)) => {
                embeds.push(e);
                atts.push(a);
            }
            _ => {
                return Err(FusionError::InvalidSample(format!(
                    "example {} has neither conditioning nor output positions",
                    i
                ))
                .into())
            }
        }
    }

    Ok(SplicedSequence {
        embeds: Tensor::stack(&embeds, 0)?,
        atts: Tensor::stack(&atts, 0)?,
        input_lens,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use candle_core::{DType, Device};

    fn batch(rows: &[&[f32]]) -> Tensor {
        let rows: Vec<Tensor> = rows.iter().map(|r| constant_rows(r)).collect();
        Tensor::stack(&rows, 0).unwrap()
    }

    #[test]
    fn test_output_follows_real_content() {
        let input = EmbeddingSequence::new(
            batch(&[&[1.0, 2.0, 0.0], &[3.0, 0.0, 0.0]]),
            Tensor::new(&[[1u32, 1, 0], [1, 0, 0]], &Device::Cpu).unwrap(),
        );
        let out_embeds = batch(&[&[7.0, 8.0], &[9.0, 0.0]]);
        let out_atts = Tensor::new(&[[1u32, 1], [1, 0]], &Device::Cpu).unwrap();

        let spliced = concat_input_output(&input, &out_embeds, &out_atts).unwrap();

        assert_eq!(spliced.input_lens, vec![2, 1]);
        assert_eq!(
            first_channel(&spliced.embeds),
            vec![vec![1.0, 2.0, 7.0, 8.0, 0.0], vec![3.0, 9.0, 0.0, 0.0, 0.0]]
        );
        assert_eq!(
            spliced.atts.to_vec2::<u32>().unwrap(),
            vec![vec![1, 1, 1, 1, 0], vec![1, 1, 0, 0, 0]]
        );
    }

    #[test]
    fn test_empty_conditioning_keeps_output() {
        let input = EmbeddingSequence::new(
            Tensor::zeros((1, 0, HIDDEN), DType::F32, &Device::Cpu).unwrap(),
            Tensor::zeros((1, 0), DType::U32, &Device::Cpu).unwrap(),
        );
        let out_embeds = batch(&[&[7.0, 8.0]]);
        let out_atts = Tensor::ones((1, 2), DType::U32, &Device::Cpu).unwrap();

        let spliced = concat_input_output(&input, &out_embeds, &out_atts).unwrap();
        assert_eq!(spliced.input_lens, vec![0]);
        assert_eq!(first_channel(&spliced.embeds), vec![vec![7.0, 8.0]]);
    }

    #[test]
    fn test_batch_mismatch() {
        let input = EmbeddingSequence::new(
            batch(&[&[1.0]]),
            Tensor::ones((1, 1), DType::U32, &Device::Cpu).unwrap(),
        );
        let out_embeds = batch(&[&[7.0], &[8.0]]);
        let out_atts = Tensor::ones((2, 1), DType::U32, &Device::Cpu).unwrap();
        assert!(concat_input_output(&input, &out_embeds, &out_atts).is_err());
    }
}
