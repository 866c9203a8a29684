//! Prompt wrapping: interleave text with image and audio embeddings
//!
//! A prompt such as `"<Img><ImageHere></Img> What is shown?"` is split on the
//! image placeholder. Each text segment is embedded with the language model's
//! token table and one image's patch embeddings are spliced in at every
//! placeholder. Audio embeddings, when present, follow the final text segment.
//! Prompts without images are embedded as plain text.

use anyhow::Result;
use candle_core::{IndexOp, Tensor};

use super::{cat_sequence, pad_right, EmbeddingSequence};
use crate::error::FusionError;
use crate::model::{LanguageModel, PaddingSide, TextTokenizer};

/// Encoded images for one batch
///
/// `embeds` is either `[batch, patches, hidden]` (one image per example) or
/// `[batch, frames, patches, hidden]` for image trains such as sampled video
/// frames. `lengths` optionally limits how many frames each example uses.
#[derive(Debug, Clone)]
pub struct ImageEmbeds {
    pub embeds: Tensor,
    pub atts: Tensor,
    pub lengths: Option<Vec<usize>>,
}

impl ImageEmbeds {
    pub fn new(embeds: Tensor, atts: Tensor) -> Self {
        Self {
            embeds,
            atts,
            lengths: None,
        }
    }

    pub fn with_lengths(mut self, lengths: Vec<usize>) -> Self {
        self.lengths = Some(lengths);
        self
    }

    pub fn batch_size(&self) -> Result<usize> {
        Ok(self.embeds.dim(0)?)
    }

    /// Flattened `[images * patches, hidden]` sequence for one example,
    /// with the patch count per image and the number of images it holds
    fn example(&self, index: usize) -> Result<(Tensor, usize, usize)> {
        let frames = match self.embeds.rank() {
            3 => self.embeds.i(index)?.unsqueeze(0)?,
            4 => self.embeds.i(index)?,
            rank => {
                return Err(FusionError::InvalidSample(format!(
                    "image embeddings must be rank 3 or 4, got rank {}",
                    rank
                ))
                .into())
            }
        };
        let (frame_count, patches, hidden) = frames.dims3()?;

        let images = match &self.lengths {
            Some(lengths) => {
                let length = *lengths.get(index).ok_or(FusionError::BatchMismatch {
                    what: "image lengths",
                    expected: self.batch_size()?,
                    actual: lengths.len(),
                })?;
                if length > frame_count {
                    return Err(FusionError::InvalidSample(format!(
                        "example {} claims {} frames but only {} were encoded",
                        index, length, frame_count
                    ))
                    .into());
                }
                length
            }
            None => frame_count,
        };

        let flat = frames
            .reshape((frame_count * patches, hidden))?
            .narrow(0, 0, images * patches)?;
        Ok((flat, patches, images))
    }

    /// Whether the batch can be returned as-is without re-padding
    fn is_plain_batch(&self) -> bool {
        self.embeds.rank() == 3 && self.lengths.is_none()
    }
}

/// Split `[batch, hidden]` or `[batch, seq, hidden]` audio embeddings into per-example sequences
pub(crate) fn split_audio(audio: &Tensor) -> Result<Vec<Tensor>> {
    let batch_size = audio.dim(0)?;
    let mut sequences = Vec::with_capacity(batch_size);
    for i in 0..batch_size {
        let clip = audio.i(i)?;
        let clip = match clip.rank() {
            1 => clip.unsqueeze(0)?,
            2 => clip,
            rank => {
                return Err(FusionError::InvalidSample(format!(
                    "audio embeddings must be rank 2 or 3, got rank {}",
                    rank + 1
                ))
                .into())
            }
        };
        sequences.push(clip);
    }
    Ok(sequences)
}

/// Builds conditioning embeddings from prompts and media embeddings
pub struct PromptWrapper<'a> {
    language_model: &'a dyn LanguageModel,
    tokenizer: &'a dyn TextTokenizer,
    placeholder: &'a str,
    max_context_len: usize,
}

impl<'a> PromptWrapper<'a> {
    pub fn new(
        language_model: &'a dyn LanguageModel,
        tokenizer: &'a dyn TextTokenizer,
        placeholder: &'a str,
        max_context_len: usize,
    ) -> Self {
        Self {
            language_model,
            tokenizer,
            placeholder,
            max_context_len,
        }
    }

    /// Wrap a batch into right-padded conditioning embeddings
    ///
    /// # Arguments
    /// * `image` - Encoded images (optional)
    /// * `audio` - Audio embeddings `[batch, hidden]` or `[batch, seq, hidden]` (optional);
    ///   unused when prompts come without images
    /// * `prompts` - One prompt per example, or a single prompt shared by the batch
    ///
    /// # Returns
    /// * Embeddings `[batch, len, hidden]` and mask `[batch, len]`, `len <= max_context_len`
    ///   whenever images are involved
    pub fn wrap(
        &self,
        image: Option<&ImageEmbeds>,
        audio: Option<&Tensor>,
        prompts: Option<&[String]>,
    ) -> Result<EmbeddingSequence> {
        let prompts = match prompts {
            Some(prompts) if !prompts.is_empty() => prompts,
            _ => return self.wrap_media(image, audio),
        };
        let Some(image) = image else {
            if audio.is_some() {
                tracing::warn!("Audio is not used when prompts come without images");
            }
            return self.wrap_text(prompts);
        };

        let batch_size = image.batch_size()?;
        let audio = audio.map(split_audio).transpose()?;
        if let Some(audio) = &audio {
            FusionError::check_batch("audio embeddings", batch_size, audio.len())?;
        }
        let prompts: Vec<&str> = if prompts.len() == 1 {
            vec![prompts[0].as_str(); batch_size]
        } else {
            FusionError::check_batch("prompts", batch_size, prompts.len())?;
            prompts.iter().map(String::as_str).collect()
        };

        let pad_embed = self.pad_embedding()?;
        let mut sequences = Vec::with_capacity(batch_size);
        for (i, prompt) in prompts.iter().enumerate() {
            let segments: Vec<&str> = prompt.split(self.placeholder).collect();
            let placeholders = segments.len() - 1;
            let (image_seq, patches, available) = image.example(i)?;
            let image_seq = image_seq.to_dtype(pad_embed.dtype())?;
            if placeholders != available {
                return Err(FusionError::PlaceholderMismatch {
                    example: i,
                    placeholders,
                    images: available,
                }
                .into());
            }

            let mut pieces = Vec::with_capacity(2 * segments.len() + 1);
            for (k, segment) in segments[..placeholders].iter().enumerate() {
                pieces.extend(self.embed_text(segment, false)?);
                pieces.push(image_seq.narrow(0, k * patches, patches)?);
            }
            pieces.extend(self.embed_text(segments[placeholders], false)?);
            if let Some(audio) = &audio {
                pieces.push(audio[i].to_dtype(pad_embed.dtype())?);
            }

            sequences.push(self.join(&pieces, &pad_embed)?);
        }

        tracing::debug!(
            "Wrapped {} prompts, lengths: {:?}",
            sequences.len(),
            sequences.iter().map(|s| s.dims()[0]).collect::<Vec<_>>()
        );

        pad_right(&sequences, &pad_embed, self.max_context_len)
    }

    /// No prompt: concatenate image and audio embeddings per example
    fn wrap_media(
        &self,
        image: Option<&ImageEmbeds>,
        audio: Option<&Tensor>,
    ) -> Result<EmbeddingSequence> {
        match (image, audio) {
            (Some(image), None) if image.is_plain_batch() => {
                Ok(EmbeddingSequence::new(image.embeds.clone(), image.atts.clone()))
            }
            (None, None) => Err(FusionError::EmptyConditioning.into()),
            (image, audio) => {
                let pad_embed = self.pad_embedding()?;
                let audio = audio.map(split_audio).transpose()?;
                let batch_size = match image {
                    Some(image) => image.batch_size()?,
                    None => audio.as_ref().map_or(0, Vec::len),
                };
                if let Some(audio) = &audio {
                    FusionError::check_batch("audio embeddings", batch_size, audio.len())?;
                }

                let mut sequences = Vec::with_capacity(batch_size);
                for i in 0..batch_size {
                    let mut pieces = Vec::with_capacity(2);
                    if let Some(image) = image {
                        pieces.push(image.example(i)?.0.to_dtype(pad_embed.dtype())?);
                    }
                    if let Some(audio) = &audio {
                        pieces.push(audio[i].to_dtype(pad_embed.dtype())?);
                    }
                    sequences.push(self.join(&pieces, &pad_embed)?);
                }
                pad_right(&sequences, &pad_embed, self.max_context_len)
            }
        }
    }

    /// Prompts without media: plain right-padded token embeddings
    fn wrap_text(&self, prompts: &[String]) -> Result<EmbeddingSequence> {
        let batch = self
            .tokenizer
            .encode_batch(prompts, false, None, PaddingSide::Right)?;
        let (input_ids, atts) = batch.to_tensors(self.language_model.device())?;
        let embeds = self.language_model.embed_tokens(&input_ids)?;
        Ok(EmbeddingSequence::new(embeds, atts))
    }

    /// Build one unpadded context embedding for generation
    ///
    /// Images are looked up by position: the k-th placeholder takes `images[k]`
    /// (`[patches, hidden]`). Only the first text segment gets special tokens.
    ///
    /// # Returns
    /// * `[len, hidden]`
    pub fn context_embedding(
        &self,
        example: usize,
        prompt: &str,
        images: &[Tensor],
        audio: Option<&Tensor>,
    ) -> Result<Tensor> {
        let segments: Vec<&str> = prompt.split(self.placeholder).collect();
        if segments.len() != images.len() + 1 {
            return Err(FusionError::PlaceholderMismatch {
                example,
                placeholders: segments.len() - 1,
                images: images.len(),
            }
            .into());
        }

        let pad_embed = self.pad_embedding()?;
        let mut pieces = Vec::with_capacity(2 * segments.len() + 1);
        for (k, segment) in segments.iter().enumerate() {
            pieces.extend(self.embed_text(segment, k == 0)?);
            if let Some(image) = images.get(k) {
                pieces.push(image.to_dtype(pad_embed.dtype())?);
            }
        }
        if let Some(audio) = audio {
            pieces.push(audio.to_dtype(pad_embed.dtype())?);
        }
        self.join(&pieces, &pad_embed)
    }

    /// Embed a text segment, `None` when it tokenizes to nothing
    fn embed_text(&self, text: &str, add_special_tokens: bool) -> Result<Option<Tensor>> {
        let ids = self.tokenizer.encode(text, add_special_tokens)?;
        if ids.is_empty() {
            return Ok(None);
        }
        let ids = Tensor::new(ids.as_slice(), self.language_model.device())?;
        Ok(Some(self.language_model.embed_tokens(&ids)?))
    }

    /// Embedding of the pad token, `[hidden]`
    pub(crate) fn pad_embedding(&self) -> Result<Tensor> {
        let ids = Tensor::new(&[self.tokenizer.pad_token_id()], self.language_model.device())?;
        Ok(self.language_model.embed_tokens(&ids)?.squeeze(0)?)
    }

    fn join(&self, pieces: &[Tensor], pad_embed: &Tensor) -> Result<Tensor> {
        match cat_sequence(pieces)? {
            Some(seq) => Ok(seq),
            None => Ok(Tensor::zeros(
                (0, pad_embed.dim(0)?),
                pad_embed.dtype(),
                pad_embed.device(),
            )?),
        }
    }
}
