//! Multi-turn conversation targets
//!
//! The first question of a conversation is part of the conditioning prompt, so
//! the token sequence starts with the first answer and then alternates
//! `question, answer` for the remaining turns. Only answer tokens are learned.

use anyhow::Result;
use candle_core::{Device, Tensor};

use super::{RegressTargets, IGNORE_INDEX};
use crate::error::FusionError;
use crate::model::TextTokenizer;

pub struct ConversationTokenizer<'a> {
    tokenizer: &'a dyn TextTokenizer,
    end_sym: &'a str,
    max_txt_len: usize,
}

impl<'a> ConversationTokenizer<'a> {
    pub fn new(tokenizer: &'a dyn TextTokenizer, end_sym: &'a str, max_txt_len: usize) -> Self {
        Self {
            tokenizer,
            end_sym,
            max_txt_len,
        }
    }

    /// Tokenize a batch of conversations
    ///
    /// # Arguments
    /// * `questions` - Per example, the questions in turn order
    /// * `answers` - Per example, one answer per question
    ///
    /// # Returns
    /// * Right-padded ids (pad id), targets ([`IGNORE_INDEX`] on question and pad
    ///   positions) and mask (`ids != pad`), truncated to `max_txt_len`
    pub fn tokenize(
        &self,
        questions: &[Vec<String>],
        answers: &[Vec<String>],
        device: &Device,
    ) -> Result<RegressTargets> {
        FusionError::check_batch("conversation answers", questions.len(), answers.len())?;

        let mut rows = Vec::with_capacity(questions.len());
        for (turn_q, turn_a) in questions.iter().zip(answers.iter()) {
            rows.push(self.tokenize_one(turn_q, turn_a)?);
        }

        let longest = rows.iter().map(|(ids, _)| ids.len()).max().unwrap_or(0);
        let max_len = longest.min(self.max_txt_len);
        let pad = self.tokenizer.pad_token_id();
        let batch_size = rows.len();

        let mut token_ids = vec![pad; batch_size * max_len];
        let mut targets = vec![IGNORE_INDEX; batch_size * max_len];
        for (i, (ids, labels)) in rows.iter().enumerate() {
            let len = ids.len().min(max_len);
            let offset = i * max_len;
            token_ids[offset..offset + len].copy_from_slice(&ids[..len]);
            targets[offset..offset + len].copy_from_slice(&labels[..len]);
        }
        let attention_mask: Vec<u32> = token_ids.iter().map(|&id| (id != pad) as u32).collect();

        let shape = (batch_size, max_len);
        Ok(RegressTargets {
            token_ids: Tensor::from_vec(token_ids, shape, device)?,
            attention_mask: Tensor::from_vec(attention_mask, shape, device)?,
            targets: Tensor::from_vec(targets, shape, device)?,
        })
    }

    fn tokenize_one(&self, questions: &[String], answers: &[String]) -> Result<(Vec<u32>, Vec<i64>)> {
        if questions.len() != answers.len() {
            return Err(FusionError::InvalidSample(format!(
                "conversation has {} questions but {} answers",
                questions.len(),
                answers.len()
            ))
            .into());
        }

        let bos = self.tokenizer.bos_token();
        let mut ids = Vec::new();
        let mut labels = Vec::new();
        for (turn, answer) in answers.iter().enumerate() {
            if turn > 0 {
                let question = format!("{}{}", bos, questions[turn]);
                let q_ids = self.tokenizer.encode(&question, false)?;
                labels.extend(std::iter::repeat(IGNORE_INDEX).take(q_ids.len()));
                ids.extend(q_ids);
            }
            let answer = format!("{}{}", answer, self.end_sym);
            let a_ids = self.tokenizer.encode(&answer, false)?;
            labels.extend(a_ids.iter().map(|&id| id as i64));
            ids.extend(a_ids);
        }
        Ok((ids, labels))
    }
}
