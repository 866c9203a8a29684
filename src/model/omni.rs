//! Multimodal model: fuse image/audio embeddings into a causal language model
//!
//! `OmniModel` owns the external components and implements the three entry
//! points built on the fusion primitives:
//!
//! - [`OmniModel::forward`] - training loss over conditioning + answer
//! - [`OmniModel::generate`] - answer decoding from left-padded contexts
//! - [`OmniModel::multi_select`] - rank answer candidates by loss

use anyhow::{anyhow, Result};
use candle_core::{DType, IndexOp, Tensor};

use super::{AudioEncoder, LanguageModel, OmniConfig, PromptPool, TextTokenizer, VisionEncoder};
use crate::data::{SampleBatch, SampleKind};
use crate::error::FusionError;
use crate::evaluation::rank_candidates;
use crate::fusion::prompt::split_audio;
use crate::fusion::{
    assemble_targets, concat_input_output, pad_left, tokenize_answers, ConversationTokenizer,
    EmbeddingSequence, ImageEmbeds, PromptWrapper, RegressTargets,
};
use crate::generation::{clean_answer, GenerationConfig};
use crate::training::Reduction;

/// Conditioning and answer embeddings for one batch
#[derive(Debug, Clone)]
pub struct PreparedEmbeddings {
    /// Right-padded prompt + media embeddings
    pub cond: EmbeddingSequence,
    /// `[batch, answer_len, hidden]`
    pub regress_embeds: Tensor,
    /// `[batch, answer_len]`
    pub regress_atts: Tensor,
    /// `[batch, answer_len]` `i64`
    pub targets: Tensor,
}

pub struct OmniModel {
    language_model: Box<dyn LanguageModel>,
    tokenizer: Box<dyn TextTokenizer>,
    vision_encoder: Option<Box<dyn VisionEncoder>>,
    audio_encoder: Option<Box<dyn AudioEncoder>>,
    config: OmniConfig,
    prompts: PromptPool,
}

impl OmniModel {
    pub fn new(
        config: OmniConfig,
        language_model: Box<dyn LanguageModel>,
        tokenizer: Box<dyn TextTokenizer>,
    ) -> Self {
        let prompts = PromptPool::from_config(&config);
        tracing::info!(
            "Multimodal model ready: max_txt_len={}, max_context_len={}, {} candidate prompts",
            config.max_txt_len,
            config.max_context_len,
            config.prompt_list.len()
        );
        Self {
            language_model,
            tokenizer,
            vision_encoder: None,
            audio_encoder: None,
            config,
            prompts,
        }
    }

    pub fn with_vision_encoder(mut self, encoder: Box<dyn VisionEncoder>) -> Self {
        self.vision_encoder = Some(encoder);
        self
    }

    pub fn with_audio_encoder(mut self, encoder: Box<dyn AudioEncoder>) -> Self {
        self.audio_encoder = Some(encoder);
        self
    }

    pub fn config(&self) -> &OmniConfig {
        &self.config
    }

    pub fn language_model(&self) -> &dyn LanguageModel {
        self.language_model.as_ref()
    }

    pub fn tokenizer(&self) -> &dyn TextTokenizer {
        self.tokenizer.as_ref()
    }

    fn wrapper(&self) -> PromptWrapper<'_> {
        PromptWrapper::new(
            self.language_model.as_ref(),
            self.tokenizer.as_ref(),
            &self.config.image_placeholder,
            self.config.max_context_len,
        )
    }

    /// Encode `[batch, ...]` images into `[batch, patches, hidden]`
    fn encode_images(&self, images: &Tensor) -> Result<ImageEmbeds> {
        let encoder = self
            .vision_encoder
            .as_ref()
            .ok_or_else(|| anyhow!("Image input requires a vision encoder"))?;
        let (embeds, atts) = encoder.encode(images)?;
        Ok(ImageEmbeds::new(embeds, atts))
    }

    /// Encode `[batch, frames, ...]` images into `[batch, frames, patches, hidden]`
    fn encode_image_train(&self, images: &Tensor, lengths: &[usize]) -> Result<ImageEmbeds> {
        let dims = images.dims().to_vec();
        if dims.len() < 2 {
            return Err(FusionError::InvalidSample(format!(
                "image train needs [batch, frames, ...] images, got {:?}",
                dims
            ))
            .into());
        }
        let (batch_size, frames) = (dims[0], dims[1]);
        FusionError::check_batch("image train lengths", batch_size, lengths.len())?;

        let mut flat_shape = vec![batch_size * frames];
        flat_shape.extend_from_slice(&dims[2..]);
        let encoded = self.encode_images(&images.reshape(flat_shape)?)?;

        let (_, patches, hidden) = encoded.embeds.dims3()?;
        let embeds = encoded.embeds.reshape((batch_size, frames, patches, hidden))?;
        let atts = encoded.atts.reshape((batch_size, frames * patches))?;
        tracing::debug!(
            "Image train: {} examples x {} frames x {} patches",
            batch_size,
            frames,
            patches
        );
        Ok(ImageEmbeds::new(embeds, atts).with_lengths(lengths.to_vec()))
    }

    fn encode_audio(&self, audio: &Tensor) -> Result<Tensor> {
        let encoder = self
            .audio_encoder
            .as_ref()
            .ok_or_else(|| anyhow!("Audio input requires an audio encoder"))?;
        let (embeds, _atts) = encoder.encode(audio)?;
        Ok(embeds)
    }

    /// Explicit instructions, or one random prompt from the pool shared by the batch
    fn resolve_instructions(
        &self,
        explicit: Option<&Vec<String>>,
        batch_size: usize,
    ) -> Result<Option<Vec<String>>> {
        let instructions = match explicit {
            Some(list) => Some(list.clone()),
            None => self.prompts.choose()?.map(|p| vec![p; batch_size]),
        };
        Ok(instructions.map(|list| {
            if self.config.chat_template {
                list.iter().map(|i| self.config.apply_template(i)).collect()
            } else {
                list
            }
        }))
    }

    /// Build conditioning and answer embeddings for a batch
    pub fn prepare_embedding(&self, batch: &SampleBatch) -> Result<PreparedEmbeddings> {
        let device = self.language_model.device().clone();
        let audio = batch
            .audio
            .as_ref()
            .map(|a| self.encode_audio(a))
            .transpose()?;
        let wrapper = self.wrapper();

        let (cond, regress) = match &batch.kind {
            SampleKind::Conversation {
                questions,
                answers,
                connect_syms,
            } => {
                FusionError::check_batch("conversation answers", questions.len(), answers.len())?;
                FusionError::check_batch("connect symbols", questions.len(), connect_syms.len())?;
                if audio.is_some() {
                    tracing::warn!("Audio is not used for conversation samples");
                }
                let image = batch
                    .images
                    .as_ref()
                    .map(|i| self.encode_images(i))
                    .transpose()?;

                let mut conv_q = Vec::with_capacity(questions.len());
                let mut conv_a = Vec::with_capacity(answers.len());
                for ((q, a), sym) in questions.iter().zip(answers).zip(connect_syms) {
                    conv_q.push(
                        q.split(sym.as_str())
                            .map(|turn| self.config.apply_template(turn))
                            .collect::<Vec<_>>(),
                    );
                    conv_a.push(a.split(sym.as_str()).map(String::from).collect::<Vec<_>>());
                }

                let first: Vec<String> = conv_q.iter().map(|turns| turns[0].clone()).collect();
                let cond = wrapper.wrap(image.as_ref(), None, Some(first.as_slice()))?;
                let regress = ConversationTokenizer::new(
                    self.tokenizer.as_ref(),
                    &self.config.end_sym,
                    self.config.max_txt_len,
                )
                .tokenize(&conv_q, &conv_a, &device)?;
                (cond, regress)
            }
            SampleKind::Instruction {
                instructions,
                answers,
            } => {
                let image = batch
                    .images
                    .as_ref()
                    .map(|i| self.encode_images(i))
                    .transpose()?;
                let instructions = self.resolve_instructions(instructions.as_ref(), answers.len())?;
                let cond = wrapper.wrap(image.as_ref(), audio.as_ref(), instructions.as_deref())?;
                (cond, self.tokenize_answers(answers)?)
            }
            SampleKind::ImageTrain {
                instructions,
                answers,
                lengths,
            } => {
                let images = batch.images.as_ref().ok_or_else(|| {
                    FusionError::InvalidSample("image train batch has no images".to_string())
                })?;
                let image = self.encode_image_train(images, lengths)?;
                let instructions = self.resolve_instructions(instructions.as_ref(), answers.len())?;
                let cond = wrapper.wrap(Some(&image), audio.as_ref(), instructions.as_deref())?;
                (cond, self.tokenize_answers(answers)?)
            }
        };

        FusionError::check_batch("answers", cond.batch_size()?, regress.batch_size()?)?;
        let regress_embeds = self.language_model.embed_tokens(&regress.token_ids)?;

        Ok(PreparedEmbeddings {
            cond,
            regress_embeds,
            regress_atts: regress.attention_mask,
            targets: regress.targets,
        })
    }

    fn tokenize_answers(&self, answers: &[String]) -> Result<RegressTargets> {
        tokenize_answers(
            self.tokenizer.as_ref(),
            answers,
            &self.config.end_sym,
            self.config.max_txt_len,
            self.language_model.device(),
        )
    }

    /// Language-modeling loss of the answers given their conditioning
    ///
    /// The model input is `[BOS] ++ cond[..len] ++ answer ++ padding`; only the
    /// answer tokens carry labels.
    pub fn forward(&self, batch: &SampleBatch, reduction: Reduction) -> Result<Tensor> {
        let prepared = self.prepare_embedding(batch)?;
        let spliced = concat_input_output(
            &prepared.cond,
            &prepared.regress_embeds,
            &prepared.regress_atts,
        )?;

        let device = self.language_model.device();
        let batch_size = spliced.embeds.dim(0)?;
        let bos = Tensor::full(self.tokenizer.bos_token_id(), (batch_size, 1), device)?;
        let bos_embeds = self
            .language_model
            .embed_tokens(&bos)?
            .to_dtype(spliced.embeds.dtype())?;
        let bos_atts = if prepared.cond.seq_len()? > 0 {
            prepared.cond.atts.narrow(1, 0, 1)?
        } else {
            Tensor::ones((batch_size, 1), DType::U32, device)?
        };
        let bos_atts = bos_atts.to_dtype(spliced.atts.dtype())?;

        let inputs_embeds = Tensor::cat(&[&bos_embeds, &spliced.embeds], 1)?;
        let attention_mask = Tensor::cat(&[&bos_atts, &spliced.atts], 1)?;
        let targets = assemble_targets(&prepared.targets, &spliced.input_lens, inputs_embeds.dim(1)?)?;

        tracing::debug!(
            "Forward: batch={}, seq_len={}, input_lens={:?}, reduction={}",
            batch_size,
            inputs_embeds.dim(1)?,
            spliced.input_lens,
            reduction
        );

        self.language_model
            .forward(&inputs_embeds, &attention_mask, &targets, reduction)
    }

    /// Generate one answer per prompt
    ///
    /// # Arguments
    /// * `images` - `[batch, ...]`, one image per prompt (optional)
    /// * `audios` - `[batch, ...]` audio clips (optional)
    /// * `texts` - Prompts with one image placeholder each when images are given
    pub fn generate(
        &self,
        images: Option<&Tensor>,
        audios: Option<&Tensor>,
        texts: Option<&[String]>,
        config: &GenerationConfig,
    ) -> Result<Vec<String>> {
        if images.is_some() && texts.is_none() {
            return Err(FusionError::MissingText {
                placeholder: self.config.image_placeholder.clone(),
            }
            .into());
        }

        let image = images.map(|i| self.encode_images(i)).transpose()?;
        let audio = audios
            .map(|a| self.encode_audio(a))
            .transpose()?
            .map(|a| split_audio(&a))
            .transpose()?;

        let prompts: Vec<String> = match (texts, &audio) {
            (Some(texts), _) => texts.to_vec(),
            (None, Some(audio)) => vec![String::new(); audio.len()],
            (None, None) => return Err(FusionError::EmptyConditioning.into()),
        };
        let batch_size = prompts.len();
        if let Some(image) = &image {
            FusionError::check_batch("images", batch_size, image.batch_size()?)?;
        }
        if let Some(audio) = &audio {
            FusionError::check_batch("audio clips", batch_size, audio.len())?;
        }

        let wrapper = self.wrapper();
        let mut contexts = Vec::with_capacity(batch_size);
        for (i, prompt) in prompts.iter().enumerate() {
            let image_list = match &image {
                Some(image) => vec![image.embeds.i(i)?],
                None => Vec::new(),
            };
            let audio_clip = audio.as_ref().map(|a| &a[i]);
            let context = wrapper.context_embedding(i, prompt, &image_list, audio_clip)?;
            if context.dim(0)? == 0 {
                return Err(FusionError::EmptyConditioning.into());
            }
            contexts.push(context);
        }

        let context = pad_left(&contexts)?;
        tracing::debug!(
            "Generate: batch={}, context_len={}, max_new_tokens={}",
            batch_size,
            context.seq_len()?,
            config.max_new_tokens
        );
        let outputs = self
            .language_model
            .generate(&context.embeds, &context.atts, config)?;

        outputs
            .iter()
            .map(|tokens| clean_answer(self.tokenizer.as_ref(), tokens, &self.config.markers))
            .collect()
    }

    /// Rank answer candidates for each example by per-example loss
    ///
    /// # Arguments
    /// * `candidates` - `candidates[c][i]` is candidate `c` for example `i`
    /// * `num_cand` - Number of valid candidates per example (optional)
    ///
    /// # Returns
    /// * Per example, candidate indices from most to least likely
    pub fn multi_select(
        &self,
        images: Option<&Tensor>,
        texts: &[String],
        candidates: &[Vec<String>],
        num_cand: Option<&[usize]>,
    ) -> Result<Vec<Vec<usize>>> {
        let mut losses = Vec::with_capacity(candidates.len());
        for answers in candidates {
            let batch = SampleBatch::instruction(
                images.cloned(),
                None,
                Some(texts.to_vec()),
                answers.clone(),
            );
            let loss: Vec<f32> = self
                .forward(&batch, Reduction::None)?
                .to_dtype(DType::F32)?
                .to_vec1()?;
            losses.push(loss);
        }
        rank_candidates(&losses, num_cand)
    }
}
