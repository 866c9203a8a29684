//! Grading rubric and judge reply parsing

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{Evaluation, JudgeInput};

pub const SYSTEM_PROMPT: &str =
    "You are a helpful assistant that evaluates predictions in medical analysis.";

pub const EVALUATION_RUBRIC: &str = r#"
Task:

You are given a question, a ground truth, and a prediction in medical analysis. Evaluate the text-based model prediction for its relevance, accuracy, and alignment with the ground truth.

Scoring: Assign a score from 0 to 3 based on the following criteria:

    0: Completely Incorrect: The prediction does not answer the question, is off-topic, or is entirely unrelated to the ground truth.
    1: Significantly Incorrect: The prediction attempts to answer the question but does not match the ground truth in terms of understanding, terminology, or core explanation.
    2: Partially Incorrect: The prediction directly answers the question and provides an explanation. Both the answer and the explanation reflect a reasonable understanding of the main idea, though they contain minor irrelevant or incorrect information.
    3: Fully Correct: The prediction completely aligns with the ground truth, providing both a clear answer and a well-reasoned explanation.

Output structure:
{
    "evaluation": Provide a concise justification sentence explaining why you rated the score.
    "score": score
}
"#;

/// Highest score on the rubric
pub const MAX_SCORE: u8 = 3;

/// One chat-completion message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: &str) -> Self {
        Self {
            role: "system".to_string(),
            content: content.to_string(),
        }
    }

    pub fn user(content: String) -> Self {
        Self {
            role: "user".to_string(),
            content,
        }
    }
}

/// System + user messages asking the judge to grade one prediction
pub fn build_messages(input: &JudgeInput) -> Vec<ChatMessage> {
    let user = format!(
        "Question: {}\nGround Truth: {}\nPrediction: {}\nEvaluation metrics: {}",
        input.text_question, input.ground_truth, input.predict, EVALUATION_RUBRIC
    );
    vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(user)]
}

/// Parse the judge's JSON reply, tolerating a surrounding markdown code fence
///
/// The reply is kept as the judge wrote it. A score that is not an integer
/// on the rubric is logged, not rejected.
pub fn parse_evaluation(content: &str) -> Result<Evaluation> {
    let json = strip_code_fence(content);
    let evaluation: Evaluation = serde_json::from_str(json)
        .with_context(|| format!("Judge reply is not a valid evaluation: {}", content.trim()))?;

    if evaluation.rubric_score().is_none() {
        warn!("Judge score {} is off the 0-{} rubric", evaluation.score, MAX_SCORE);
    }
    Ok(evaluation)
}

fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // drop an optional language tag on the opening fence line
    let rest = match rest.find('\n') {
        Some(pos) => &rest[pos + 1..],
        None => rest,
    };
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> JudgeInput {
        JudgeInput {
            image_id: serde_json::json!("img_001"),
            text_question: "Is there a fracture?".to_string(),
            ground_truth: "Yes, in the left radius.".to_string(),
            predict: "Yes.".to_string(),
        }
    }

    #[test]
    fn test_build_messages() {
        let messages = build_messages(&input());
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[0].content, SYSTEM_PROMPT);
        assert_eq!(messages[1].role, "user");
        assert!(messages[1].content.starts_with("Question: Is there a fracture?"));
        assert!(messages[1].content.contains("Ground Truth: Yes, in the left radius."));
        assert!(messages[1].content.contains("Prediction: Yes."));
        assert!(messages[1].content.contains("3: Fully Correct"));
    }

    #[test]
    fn test_parse_plain_json() {
        let eval = parse_evaluation(r#"{"evaluation": "Matches.", "score": 3}"#).unwrap();
        assert_eq!(eval.evaluation, "Matches.");
        assert_eq!(eval.score, serde_json::json!(3));
        assert_eq!(eval.rubric_score(), Some(3));
    }

    #[test]
    fn test_parse_fenced_json_with_string_score() {
        let reply = "```json\n{\"evaluation\": \"Partly right.\", \"score\": \"2\"}\n```";
        let eval = parse_evaluation(reply).unwrap();
        assert_eq!(eval.score, serde_json::json!("2"));
        assert_eq!(eval.rubric_score(), Some(2));
    }

    #[test]
    fn test_off_rubric_scores_are_kept() {
        let eval = parse_evaluation(r#"{"evaluation": "x", "score": 5}"#).unwrap();
        assert_eq!(eval.score, serde_json::json!(5));
        assert_eq!(eval.rubric_score(), None);

        let eval = parse_evaluation(r#"{"evaluation": "x", "score": 1.5}"#).unwrap();
        assert_eq!(eval.rubric_score(), None);
    }

    #[test]
    fn test_parse_rejects_malformed_replies() {
        assert!(parse_evaluation("The prediction is fine.").is_err());
        assert!(parse_evaluation(r#"{"score": 1}"#).is_err());
        assert!(parse_evaluation(r#"{"evaluation": "x"}"#).is_err());
    }
}
