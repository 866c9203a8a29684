//! Embedding-driven autoregressive decoder
//!
//! [`CausalLm`] turns any model that can embed tokens and score a sequence of
//! embeddings ([`CausalLmHead`]) into a full [`LanguageModel`]: the loss comes
//! from [`causal_lm_loss`] and generation from [`decode_from_embeddings`].

use anyhow::{bail, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_transformers::generation::LogitsProcessor;

use super::GenerationConfig;
use crate::model::LanguageModel;
use crate::training::{causal_lm_loss, Reduction};

/// Minimal causal LM surface: token embeddings and logits over embeddings
pub trait CausalLmHead {
    /// `[..., seq]` ids to `[..., seq, hidden]`
    fn embed_tokens(&self, token_ids: &Tensor) -> Result<Tensor>;

    /// Logits `[batch, seq, vocab]` for `[batch, seq, hidden]` inputs
    fn logits(&self, inputs_embeds: &Tensor, attention_mask: &Tensor) -> Result<Tensor>;

    fn device(&self) -> &Device;
}

/// Language model built from a [`CausalLmHead`]
pub struct CausalLm<M> {
    head: M,
}

impl<M: CausalLmHead> CausalLm<M> {
    pub fn new(head: M) -> Self {
        Self { head }
    }

    pub fn head(&self) -> &M {
        &self.head
    }
}

impl<M: CausalLmHead> LanguageModel for CausalLm<M> {
    fn embed_tokens(&self, token_ids: &Tensor) -> Result<Tensor> {
        self.head.embed_tokens(token_ids)
    }

    fn forward(
        &self,
        inputs_embeds: &Tensor,
        attention_mask: &Tensor,
        labels: &Tensor,
        reduction: Reduction,
    ) -> Result<Tensor> {
        let logits = self.head.logits(inputs_embeds, attention_mask)?;
        causal_lm_loss(&logits, labels, reduction)
    }

    fn generate(
        &self,
        inputs_embeds: &Tensor,
        attention_mask: &Tensor,
        config: &GenerationConfig,
    ) -> Result<Vec<Vec<u32>>> {
        decode_from_embeddings(&self.head, inputs_embeds, attention_mask, config)
    }

    fn device(&self) -> &Device {
        self.head.device()
    }
}

/// Decode new tokens after left-padded input embeddings
///
/// Every step recomputes logits over the whole sequence, samples one token
/// per example and appends its embedding. An example stops after emitting a
/// stop token; the loop ends when all examples stopped or `max_new_tokens`
/// is reached.
///
/// # Returns
/// * Generated token ids per example, stop token included
pub fn decode_from_embeddings<M: CausalLmHead + ?Sized>(
    head: &M,
    inputs_embeds: &Tensor,
    attention_mask: &Tensor,
    config: &GenerationConfig,
) -> Result<Vec<Vec<u32>>> {
    if config.num_beams > 1 {
        bail!(
            "Beam search is not supported (num_beams = {}); use num_beams = 1",
            config.num_beams
        );
    }
    if (config.length_penalty - 1.0).abs() > f32::EPSILON {
        tracing::warn!(
            "length_penalty = {} has no effect without beam search",
            config.length_penalty
        );
    }

    let (batch_size, context_len, _) = inputs_embeds.dims3()?;
    if context_len == 0 {
        bail!("Cannot decode from an empty context");
    }
    let device = head.device();

    let seed = config.seed.unwrap_or(42);
    let temperature = if config.do_sample && config.temperature > 0.0 {
        Some(config.temperature as f64)
    } else {
        None
    };
    let top_p = if config.do_sample && config.top_p < 1.0 {
        Some(config.top_p as f64)
    } else {
        None
    };
    let mut logits_processor = LogitsProcessor::new(seed, temperature, top_p);

    let filler = config.stop_words_ids.first().copied().unwrap_or(0);
    let mut embeds = inputs_embeds.clone();
    let mut mask = attention_mask.to_dtype(DType::U32)?;
    let mut outputs: Vec<Vec<u32>> = vec![Vec::new(); batch_size];
    let mut finished = vec![false; batch_size];

    for step in 0..config.max_new_tokens {
        let logits = head.logits(&embeds, &mask)?;
        let seq_len = logits.dim(1)?;
        let last = logits.i((.., seq_len - 1, ..))?.to_dtype(DType::F32)?;

        let mut next_tokens = Vec::with_capacity(batch_size);
        for (b, generated) in outputs.iter_mut().enumerate() {
            if finished[b] {
                next_tokens.push(filler);
                continue;
            }

            let mut row = last.i(b)?;
            if config.repetition_penalty != 1.0 {
                row = apply_repetition_penalty(&row, generated, config.repetition_penalty)?;
            }
            if generated.len() < config.min_length {
                row = suppress_tokens(&row, &config.stop_words_ids)?;
            }

            let token = logits_processor.sample(&row)?;
            generated.push(token);
            if config.stop_words_ids.contains(&token) {
                finished[b] = true;
            }
            next_tokens.push(token);
        }

        if finished.iter().all(|&f| f) {
            tracing::debug!("Generation stopped after {} steps: stop token", step + 1);
            break;
        }

        let next_ids = Tensor::new(next_tokens.as_slice(), device)?.unsqueeze(1)?;
        let next_embeds = head.embed_tokens(&next_ids)?.to_dtype(embeds.dtype())?;
        embeds = Tensor::cat(&[&embeds, &next_embeds], 1)?;
        let ones = Tensor::ones((batch_size, 1), DType::U32, device)?;
        mask = Tensor::cat(&[&mask, &ones], 1)?;
    }

    Ok(outputs)
}

/// Apply repetition penalty
fn apply_repetition_penalty(logits: &Tensor, tokens: &[u32], penalty: f32) -> Result<Tensor> {
    let mut logits_vec: Vec<f32> = logits.to_vec1()?;

    for &token in tokens {
        let idx = token as usize;
        if idx < logits_vec.len() {
            if logits_vec[idx] > 0.0 {
                logits_vec[idx] /= penalty;
            } else {
                logits_vec[idx] *= penalty;
            }
        }
    }

    Ok(Tensor::new(&logits_vec[..], logits.device())?)
}

/// Set the given token logits to -inf
fn suppress_tokens(logits: &Tensor, tokens: &[u32]) -> Result<Tensor> {
    let mut logits_vec: Vec<f32> = logits.to_vec1()?;
    for &token in tokens {
        if let Some(value) = logits_vec.get_mut(token as usize) {
            *value = f32::NEG_INFINITY;
        }
    }
    Ok(Tensor::new(&logits_vec[..], logits.device())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;

    fn prompt(batch: usize, len: usize) -> (Tensor, Tensor) {
        let embeds = Tensor::ones((batch, len, HIDDEN), DType::F32, &Device::Cpu).unwrap();
        let mask = Tensor::ones((batch, len), DType::U32, &Device::Cpu).unwrap();
        (embeds, mask)
    }

    #[test]
    fn test_stops_on_stop_token() {
        let lm = CausalLm::new(ScriptedHead::new(vec![5, 6, EOS_ID, 7]));
        let (embeds, mask) = prompt(1, 2);

        let out = lm
            .generate(&embeds, &mask, &GenerationConfig::default())
            .unwrap();
        assert_eq!(out, vec![vec![5, 6, EOS_ID]]);
    }

    #[test]
    fn test_respects_max_new_tokens() {
        let lm = CausalLm::new(ScriptedHead::new(vec![5; 10]));
        let (embeds, mask) = prompt(2, 3);

        let config = GenerationConfig::default().with_max_new_tokens(3);
        let out = lm.generate(&embeds, &mask, &config).unwrap();
        assert_eq!(out, vec![vec![5, 5, 5], vec![5, 5, 5]]);
    }

    #[test]
    fn test_min_length_suppresses_stop_token() {
        let lm = CausalLm::new(ScriptedHead::new(vec![EOS_ID, 7, EOS_ID]));
        let (embeds, mask) = prompt(1, 1);

        let config = GenerationConfig::default().with_min_length(2);
        let out = lm.generate(&embeds, &mask, &config).unwrap();
        assert_eq!(out[0].len(), 3);
        assert_ne!(out[0][0], EOS_ID);
        assert_eq!(out[0][1], 7);
        assert_eq!(out[0][2], EOS_ID);
    }

    #[test]
    fn test_beam_search_is_rejected() {
        let lm = CausalLm::new(ScriptedHead::new(vec![EOS_ID]));
        let (embeds, mask) = prompt(1, 1);

        let config = GenerationConfig::default().with_num_beams(4);
        assert!(lm.generate(&embeds, &mask, &config).is_err());
    }

    #[test]
    fn test_empty_context_is_rejected() {
        let lm = CausalLm::new(ScriptedHead::new(vec![5]));
        let (embeds, mask) = prompt(1, 0);

        let err = lm
            .generate(&embeds, &mask, &GenerationConfig::default())
            .unwrap_err();
        assert!(err.to_string().contains("empty context"));
    }

    #[test]
    fn test_forward_uses_shifted_loss() {
        let lm = CausalLm::new(TableHead::new());
        let ids = Tensor::new(&[[5u32, 6]], &Device::Cpu).unwrap();
        let embeds = lm.embed_tokens(&ids).unwrap();
        let mask = Tensor::ones((1, 2), DType::U32, &Device::Cpu).unwrap();

        // table logits favor the highest vocabulary rows, so a high label scores better
        let low = Tensor::new(&[[-100i64, 0]], &Device::Cpu).unwrap();
        let high = Tensor::new(&[[-100i64, (VOCAB - 1) as i64]], &Device::Cpu).unwrap();
        let low = lm.forward(&embeds, &mask, &low, Reduction::Mean).unwrap();
        let high = lm.forward(&embeds, &mask, &high, Reduction::Mean).unwrap();
        assert!(high.to_scalar::<f32>().unwrap() < low.to_scalar::<f32>().unwrap());
    }

    #[test]
    fn test_repetition_penalty() {
        let logits = Tensor::new(&[2f32, -2.0, 1.0], &Device::Cpu).unwrap();
        let out: Vec<f32> = apply_repetition_penalty(&logits, &[0, 1], 2.0)
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(out, vec![1.0, -4.0, 1.0]);

        let out: Vec<f32> = suppress_tokens(&logits, &[2, 99]).unwrap().to_vec1().unwrap();
        assert_eq!(out[2], f32::NEG_INFINITY);
    }
}
