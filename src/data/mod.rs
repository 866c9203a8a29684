//! Training and inference samples
//!
//! A [`Sample`] is one example with optional image and audio tensors and the
//! text it is trained on. [`SampleBatch::collate`] stacks a list of samples
//! into the batched form the model consumes, with the text side expressed as
//! a [`SampleKind`] so each kind gets its own assembly path.

use anyhow::Result;
use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::FusionError;

/// Text side of a single sample
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SampleText {
    /// Multi-turn exchange; turns are joined with `connect_sym`
    Conversation {
        questions: String,
        answers: String,
        connect_sym: String,
    },
    /// Single-turn instruction (or a random prompt when absent) and answer
    Instruction {
        instruction: Option<String>,
        answer: String,
    },
    /// Several frames of one clip, `length` of which are referenced by the instruction
    ImageTrain {
        instruction: Option<String>,
        answer: String,
        length: usize,
    },
}

/// One training or inference unit
#[derive(Debug, Clone)]
pub struct Sample {
    /// Preprocessed image `[...]`, or `[frames, ...]` for image trains
    pub image: Option<Tensor>,
    /// Preprocessed audio clip
    pub audio: Option<Tensor>,
    pub text: SampleText,
}

impl Sample {
    pub fn new(text: SampleText) -> Self {
        Self {
            image: None,
            audio: None,
            text,
        }
    }

    /// Instruction sample with an explicit instruction
    pub fn instruction(instruction: &str, answer: &str) -> Self {
        Self::new(SampleText::Instruction {
            instruction: Some(instruction.to_string()),
            answer: answer.to_string(),
        })
    }

    /// Answer-only sample; the instruction is drawn from the prompt list
    pub fn caption(answer: &str) -> Self {
        Self::new(SampleText::Instruction {
            instruction: None,
            answer: answer.to_string(),
        })
    }

    pub fn conversation(questions: &str, answers: &str, connect_sym: &str) -> Self {
        Self::new(SampleText::Conversation {
            questions: questions.to_string(),
            answers: answers.to_string(),
            connect_sym: connect_sym.to_string(),
        })
    }

    pub fn with_image(mut self, image: Tensor) -> Self {
        self.image = Some(image);
        self
    }

    pub fn with_audio(mut self, audio: Tensor) -> Self {
        self.audio = Some(audio);
        self
    }
}

/// Batched text side, one entry per example
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SampleKind {
    Conversation {
        questions: Vec<String>,
        answers: Vec<String>,
        connect_syms: Vec<String>,
    },
    Instruction {
        instructions: Option<Vec<String>>,
        answers: Vec<String>,
    },
    ImageTrain {
        instructions: Option<Vec<String>>,
        answers: Vec<String>,
        lengths: Vec<usize>,
    },
}

impl SampleKind {
    fn name(&self) -> &'static str {
        match self {
            Self::Conversation { .. } => "conversation",
            Self::Instruction { .. } => "instruction",
            Self::ImageTrain { .. } => "image train",
        }
    }
}

/// A collated batch of samples
#[derive(Debug, Clone)]
pub struct SampleBatch {
    /// `[batch, ...]`, or `[batch, frames, ...]` for image trains
    pub images: Option<Tensor>,
    pub audio: Option<Tensor>,
    pub kind: SampleKind,
}

impl SampleBatch {
    /// Instruction batch from already stacked tensors
    pub fn instruction(
        images: Option<Tensor>,
        audio: Option<Tensor>,
        instructions: Option<Vec<String>>,
        answers: Vec<String>,
    ) -> Self {
        Self {
            images,
            audio,
            kind: SampleKind::Instruction {
                instructions,
                answers,
            },
        }
    }

    /// Number of examples
    pub fn len(&self) -> usize {
        match &self.kind {
            SampleKind::Conversation { answers, .. }
            | SampleKind::Instruction { answers, .. }
            | SampleKind::ImageTrain { answers, .. } => answers.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stack samples into one batch
    ///
    /// All samples must share one [`SampleText`] variant. Images (and audio)
    /// must be present on every sample or on none. Instructions are likewise
    /// all present or all absent.
    pub fn collate(samples: &[Sample]) -> Result<Self> {
        let first = samples
            .first()
            .ok_or_else(|| FusionError::InvalidSample("cannot collate an empty batch".to_string()))?;

        let images = stack_optional(samples.iter().map(|s| s.image.as_ref()), "image")?;
        let audio = stack_optional(samples.iter().map(|s| s.audio.as_ref()), "audio")?;

        let mut kind = match &first.text {
            SampleText::Conversation { .. } => SampleKind::Conversation {
                questions: Vec::with_capacity(samples.len()),
                answers: Vec::with_capacity(samples.len()),
                connect_syms: Vec::with_capacity(samples.len()),
            },
            SampleText::Instruction { instruction, .. } => SampleKind::Instruction {
                instructions: instruction.as_ref().map(|_| Vec::with_capacity(samples.len())),
                answers: Vec::with_capacity(samples.len()),
            },
            SampleText::ImageTrain { instruction, .. } => SampleKind::ImageTrain {
                instructions: instruction.as_ref().map(|_| Vec::with_capacity(samples.len())),
                answers: Vec::with_capacity(samples.len()),
                lengths: Vec::with_capacity(samples.len()),
            },
        };

        for (i, sample) in samples.iter().enumerate() {
            match (&mut kind, &sample.text) {
                (
                    SampleKind::Conversation {
                        questions,
                        answers,
                        connect_syms,
                    },
                    SampleText::Conversation {
                        questions: q,
                        answers: a,
                        connect_sym,
                    },
                ) => {
                    questions.push(q.clone());
                    answers.push(a.clone());
                    connect_syms.push(connect_sym.clone());
                }
                (
                    SampleKind::Instruction {
                        instructions,
                        answers,
                    },
                    SampleText::Instruction {
                        instruction,
                        answer,
                    },
                ) => {
                    push_instruction(instructions, instruction.as_ref(), i)?;
                    answers.push(answer.clone());
                }
                (
                    SampleKind::ImageTrain {
                        instructions,
                        answers,
                        lengths,
                    },
                    SampleText::ImageTrain {
                        instruction,
                        answer,
                        length,
                    },
                ) => {
                    push_instruction(instructions, instruction.as_ref(), i)?;
                    answers.push(answer.clone());
                    lengths.push(*length);
                }
                (kind, _) => {
                    return Err(FusionError::InvalidSample(format!(
                        "sample {} does not match the {} batch",
                        i,
                        kind.name()
                    ))
                    .into())
                }
            }
        }

        Ok(Self {
            images,
            audio,
            kind,
        })
    }
}

fn push_instruction(
    instructions: &mut Option<Vec<String>>,
    instruction: Option<&String>,
    index: usize,
) -> Result<()> {
    match (instructions, instruction) {
        (Some(list), Some(instruction)) => list.push(instruction.clone()),
        (None, None) => {}
        _ => {
            return Err(FusionError::InvalidSample(format!(
                "sample {} mixes explicit and missing instructions",
                index
            ))
            .into())
        }
    }
    Ok(())
}

fn stack_optional<'a>(
    tensors: impl Iterator<Item = Option<&'a Tensor>>,
    what: &str,
) -> Result<Option<Tensor>> {
    let tensors: Vec<Option<&Tensor>> = tensors.collect();
    let present: Vec<&Tensor> = tensors.iter().flatten().copied().collect();
    if present.is_empty() {
        return Ok(None);
    }
    if present.len() != tensors.len() {
        return Err(FusionError::InvalidSample(format!(
            "{} present on {} of {} samples",
            what,
            present.len(),
            tensors.len()
        ))
        .into());
    }
    Ok(Some(Tensor::stack(&present, 0)?))
}
