//! Deterministic test doubles for the external model components
//!
//! Embedding row `k` of the fake language model is filled with the value `k`,
//! so a fused sequence can be read back as the token IDs (or image/audio marker
//! values) it was built from.

use anyhow::Result;
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::Embedding;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::generation::{CausalLm, CausalLmHead, GenerationConfig};
use crate::model::{AudioEncoder, LanguageModel, TextTokenizer, VisionEncoder};
use crate::training::Reduction;

pub const HIDDEN: usize = 4;
pub const VOCAB: usize = 64;

pub const PAD_ID: u32 = 0;
pub const BOS_ID: u32 = 1;
pub const EOS_ID: u32 = 2;
pub const UNK_ID: u32 = 3;
pub const NEWLINE_ID: u32 = 4;

const SPECIALS: [&str; 5] = ["<pad>", "<s>", "</s>", "<unk>", "\n"];

/// Whitespace word-level tokenizer with a fixed vocabulary
pub struct WordTokenizer {
    vocab: Vec<String>,
}

impl WordTokenizer {
    pub fn new(words: &[&str]) -> Self {
        let vocab = SPECIALS
            .iter()
            .chain(words.iter())
            .map(|w| w.to_string())
            .collect();
        Self { vocab }
    }

    /// Default vocabulary used across fusion tests
    pub fn standard() -> Self {
        Self::new(&[
            "describe", "what", "is", "this", "a", "cat", "dog", "yes", "no", "and", "the",
            "image", "[INST]", "[/INST]", "answer", "why", "because",
        ])
    }

    pub fn id(&self, word: &str) -> u32 {
        self.vocab
            .iter()
            .position(|w| w == word)
            .map(|i| i as u32)
            .unwrap_or(UNK_ID)
    }

    pub fn ids(&self, text: &str) -> Vec<u32> {
        self.encode(text, false).unwrap()
    }
}

impl TextTokenizer for WordTokenizer {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
        let spaced = text
            .replace("</s>", " </s> ")
            .replace("<s>", " <s> ")
            .replace('\n', " \n ");
        let mut ids = Vec::new();
        if add_special_tokens {
            ids.push(BOS_ID);
        }
        ids.extend(
            spaced
                .split(' ')
                .filter(|w| !w.is_empty())
                .map(|w| self.id(w)),
        );
        Ok(ids)
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        let words: Vec<&str> = ids
            .iter()
            .filter(|&&id| !(skip_special_tokens && id <= EOS_ID))
            .map(|&id| {
                self.vocab
                    .get(id as usize)
                    .map(String::as_str)
                    .unwrap_or("<unk>")
            })
            .collect();
        Ok(words.join(" "))
    }

    fn pad_token_id(&self) -> u32 {
        PAD_ID
    }

    fn bos_token_id(&self) -> u32 {
        BOS_ID
    }

    fn eos_token_id(&self) -> u32 {
        EOS_ID
    }

    fn bos_token(&self) -> &str {
        "<s>"
    }
}

/// Embedding table whose row `k` is `[k; HIDDEN]`
pub fn value_embedding() -> Embedding {
    let values: Vec<f32> = (0..VOCAB)
        .flat_map(|k| std::iter::repeat(k as f32).take(HIDDEN))
        .collect();
    let table = Tensor::from_vec(values, (VOCAB, HIDDEN), &Device::Cpu).unwrap();
    Embedding::new(table, HIDDEN)
}

/// `[rows, HIDDEN]` tensor with every entry of row `i` equal to `values[i]`
pub fn constant_rows(values: &[f32]) -> Tensor {
    let data: Vec<f32> = values
        .iter()
        .flat_map(|v| std::iter::repeat(*v).take(HIDDEN))
        .collect();
    Tensor::from_vec(data, (values.len(), HIDDEN), &Device::Cpu).unwrap()
}

/// Read back the first hidden unit of every position: `[batch, seq, hidden]` to `[batch][seq]`
pub fn first_channel(embeds: &Tensor) -> Vec<Vec<f32>> {
    embeds
        .to_dtype(DType::F32)
        .unwrap()
        .to_vec3::<f32>()
        .unwrap()
        .into_iter()
        .map(|row| row.into_iter().map(|v| v[0]).collect())
        .collect()
}

/// Vision encoder that treats its input as precomputed `[batch, patches, hidden]` features
pub struct IdentityVision;

impl VisionEncoder for IdentityVision {
    fn encode(&self, images: &Tensor) -> Result<(Tensor, Tensor)> {
        let (batch, patches, _) = images.dims3()?;
        let atts = Tensor::ones((batch, patches), DType::U32, images.device())?;
        Ok((images.clone(), atts))
    }
}

/// Audio encoder that passes `[batch, hidden]` clip embeddings through
pub struct IdentityAudio;

impl AudioEncoder for IdentityAudio {
    fn encode(&self, audio: &Tensor) -> Result<(Tensor, Tensor)> {
        let batch = audio.dim(0)?;
        let atts = Tensor::ones((batch, 1), DType::U32, audio.device())?;
        Ok((audio.clone(), atts))
    }
}

/// Head whose logits score each vocabulary entry by its dot product with the input
pub struct TableHead {
    embedding: Embedding,
    device: Device,
}

impl TableHead {
    pub fn new() -> Self {
        Self {
            embedding: value_embedding(),
            device: Device::Cpu,
        }
    }
}

impl CausalLmHead for TableHead {
    fn embed_tokens(&self, token_ids: &Tensor) -> Result<Tensor> {
        Ok(self.embedding.forward(token_ids)?)
    }

    fn logits(&self, inputs_embeds: &Tensor, _attention_mask: &Tensor) -> Result<Tensor> {
        let table = self.embedding.embeddings().t()?;
        Ok(inputs_embeds.broadcast_matmul(&table)?)
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

/// Head that emits a fixed token sequence, one token per decoding step
pub struct ScriptedHead {
    embedding: Embedding,
    script: Vec<u32>,
    calls: Mutex<usize>,
    device: Device,
}

impl ScriptedHead {
    pub fn new(script: Vec<u32>) -> Self {
        Self {
            embedding: value_embedding(),
            script,
            calls: Mutex::new(0),
            device: Device::Cpu,
        }
    }
}

impl CausalLmHead for ScriptedHead {
    fn embed_tokens(&self, token_ids: &Tensor) -> Result<Tensor> {
        Ok(self.embedding.forward(token_ids)?)
    }

    fn logits(&self, inputs_embeds: &Tensor, _attention_mask: &Tensor) -> Result<Tensor> {
        let (batch, seq_len, _) = inputs_embeds.dims3()?;
        let mut calls = self.calls.lock().unwrap();
        let token = self.script.get(*calls).copied().unwrap_or(EOS_ID) as usize;
        *calls += 1;

        let mut logits = vec![0f32; batch * seq_len * VOCAB];
        for b in 0..batch {
            let offset = (b * seq_len + seq_len - 1) * VOCAB;
            logits[offset + token] = 10.0;
        }
        Ok(Tensor::from_vec(logits, (batch, seq_len, VOCAB), &self.device)?)
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

/// Tensors passed to one `LanguageModel::forward` call
#[derive(Debug, Clone)]
pub struct ForwardCall {
    pub inputs_embeds: Tensor,
    pub attention_mask: Tensor,
    pub labels: Tensor,
    pub reduction: Reduction,
}

/// Shared view of the calls a [`RecordingLm`] received
#[derive(Clone, Default)]
pub struct CallLog {
    pub forward: Arc<Mutex<Vec<ForwardCall>>>,
    pub generate: Arc<Mutex<Vec<(Tensor, Tensor)>>>,
}

impl CallLog {
    pub fn last_forward(&self) -> ForwardCall {
        self.forward.lock().unwrap().last().cloned().unwrap()
    }

    pub fn last_generate(&self) -> (Tensor, Tensor) {
        self.generate.lock().unwrap().last().cloned().unwrap()
    }

    pub fn forward_count(&self) -> usize {
        self.forward.lock().unwrap().len()
    }
}

/// Language model that records its inputs and can replay scripted outputs
pub struct RecordingLm {
    inner: CausalLm<TableHead>,
    log: CallLog,
    scripted_losses: Mutex<VecDeque<Vec<f32>>>,
    scripted_outputs: Mutex<Option<Vec<Vec<u32>>>>,
}

impl RecordingLm {
    pub fn new() -> Self {
        Self {
            inner: CausalLm::new(TableHead::new()),
            log: CallLog::default(),
            scripted_losses: Mutex::new(VecDeque::new()),
            scripted_outputs: Mutex::new(None),
        }
    }

    /// Each forward call pops one per-example loss vector
    pub fn with_losses(self, losses: Vec<Vec<f32>>) -> Self {
        *self.scripted_losses.lock().unwrap() = losses.into();
        self
    }

    pub fn with_outputs(self, outputs: Vec<Vec<u32>>) -> Self {
        *self.scripted_outputs.lock().unwrap() = Some(outputs);
        self
    }

    pub fn log(&self) -> CallLog {
        self.log.clone()
    }

    pub fn last_forward(&self) -> ForwardCall {
        self.log.last_forward()
    }
}

impl LanguageModel for RecordingLm {
    fn embed_tokens(&self, token_ids: &Tensor) -> Result<Tensor> {
        self.inner.embed_tokens(token_ids)
    }

    fn forward(
        &self,
        inputs_embeds: &Tensor,
        attention_mask: &Tensor,
        labels: &Tensor,
        reduction: Reduction,
    ) -> Result<Tensor> {
        self.log.forward.lock().unwrap().push(ForwardCall {
            inputs_embeds: inputs_embeds.clone(),
            attention_mask: attention_mask.clone(),
            labels: labels.clone(),
            reduction,
        });
        if let Some(losses) = self.scripted_losses.lock().unwrap().pop_front() {
            let n = losses.len();
            return Ok(Tensor::from_vec(losses, n, &Device::Cpu)?);
        }
        self.inner
            .forward(inputs_embeds, attention_mask, labels, reduction)
    }

    fn generate(
        &self,
        inputs_embeds: &Tensor,
        attention_mask: &Tensor,
        config: &GenerationConfig,
    ) -> Result<Vec<Vec<u32>>> {
        self.log
            .generate
            .lock()
            .unwrap()
            .push((inputs_embeds.clone(), attention_mask.clone()));
        if let Some(outputs) = self.scripted_outputs.lock().unwrap().clone() {
            return Ok(outputs);
        }
        self.inner.generate(inputs_embeds, attention_mask, config)
    }

    fn device(&self) -> &Device {
        self.inner.device()
    }
}
