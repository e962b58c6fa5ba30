//! Transcript scoring through an injected judge.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::runtime::call_with_timeout;
use crate::error::{KyroMemResult, ValidationError};

use super::Transcript;

/// Failures reported by a judge.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum JudgeError {
    /// Judge did not answer in time.
    #[error("judge timed out after {duration_ms}ms")]
    Timeout {
        /// Configured timeout.
        duration_ms: u64,
    },

    /// Judge is unreachable or not configured.
    #[error("judge unavailable: {0}")]
    Unavailable(String),

    /// Judge returned a score outside [0, 1] or not a number.
    #[error("judge returned invalid score {score}")]
    InvalidScore {
        /// The rejected score.
        score: f32,
    },

    /// Any other judge failure.
    #[error("judge failed: {0}")]
    Failed(String),
}

/// A judge's verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Judgement {
    /// Quality in [0, 1].
    pub score: f32,
    /// Free-text explanation.
    pub rationale: String,
}

/// Narrow interface to an external LLM judge.
pub trait Judge: Send + Sync {
    /// Scores the rendered `prompt`.
    ///
    /// # Errors
    ///
    /// Returns `JudgeError` when the judge fails.
    fn judge(&self, prompt: &str) -> Result<Judgement, JudgeError>;

    /// Short judge name for logs.
    fn name(&self) -> &str {
        "judge"
    }
}

/// Wraps a judge so every call is bounded by a timeout.
#[derive(Clone)]
pub struct TimedJudge {
    inner: Arc<dyn Judge>,
    timeout: Duration,
}

impl TimedJudge {
    /// Wraps `inner` with `timeout`.
    #[must_use]
    pub fn new(inner: Arc<dyn Judge>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

impl Judge for TimedJudge {
    fn judge(&self, prompt: &str) -> Result<Judgement, JudgeError> {
        let inner = Arc::clone(&self.inner);
        let prompt = prompt.to_string();
        call_with_timeout(self.timeout, move || inner.judge(&prompt)).unwrap_or_else(|_| {
            Err(JudgeError::Timeout {
                duration_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
            })
        })
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

/// Baseline and candidate scored against the same reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    /// Verdict on the baseline.
    pub baseline: Judgement,
    /// Verdict on the candidate.
    pub candidate: Judgement,
    /// `candidate.score - baseline.score`.
    pub delta: f32,
}

impl Comparison {
    /// True if the candidate scored strictly higher.
    #[must_use]
    pub fn improved(&self) -> bool {
        self.delta > 0.0
    }
}

/// Scores transcripts with a [`Judge`].
#[derive(Clone)]
pub struct ScoringEngine {
    judge: Arc<dyn Judge>,
}

impl std::fmt::Debug for ScoringEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScoringEngine")
            .field("judge", &self.judge.name())
            .finish()
    }
}

impl ScoringEngine {
    /// Creates a scoring engine around `judge`.
    #[must_use]
    pub fn new(judge: Arc<dyn Judge>) -> Self {
        Self { judge }
    }

    /// Renders the judge prompt for `transcript`.
    #[must_use]
    pub fn prompt(transcript: &Transcript, reference: Option<&str>) -> String {
        let mut prompt = String::from(
            "Rate how well the assistant handled the conversation below on a scale from 0 to 1.\n",
        );
        if let Some(title) = &transcript.title {
            let _ = writeln!(prompt, "Conversation: {title}");
        }
        if let Some(reference) = reference {
            let _ = writeln!(prompt, "\nReference answer:\n{reference}");
        }
        prompt.push_str("\nTranscript:\n");
        prompt.push_str(&transcript.render());
        prompt
    }

    /// Scores one transcript.
    ///
    /// # Errors
    ///
    /// - `Validation` for an empty transcript
    /// - `Judge` when the judge fails or returns a score that is not a finite
    ///   number in [0, 1]
    pub fn score(&self, transcript: &Transcript, reference: Option<&str>) -> KyroMemResult<Judgement> {
        if transcript.is_empty() {
            return Err(ValidationError::MissingField {
                field: "transcript".to_string(),
            }
            .into());
        }

        let judgement = self.judge.judge(&Self::prompt(transcript, reference))?;
        if !judgement.score.is_finite() || !(0.0..=1.0).contains(&judgement.score) {
            return Err(JudgeError::InvalidScore { score: judgement.score }.into());
        }

        tracing::debug!(
            judge = self.judge.name(),
            conversation = %transcript.conversation_id,
            score = judgement.score,
            "scored transcript"
        );
        Ok(judgement)
    }

    /// Scores both transcripts and reports the delta.
    ///
    /// # Errors
    ///
    /// See [`ScoringEngine::score`].
    pub fn compare(
        &self,
        baseline: &Transcript,
        candidate: &Transcript,
        reference: Option<&str>,
    ) -> KyroMemResult<Comparison> {
        let baseline = self.score(baseline, reference)?;
        let candidate = self.score(candidate, reference)?;
        let delta = candidate.score - baseline.score;
        Ok(Comparison {
            baseline,
            candidate,
            delta,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityId, MessageRole};
    use crate::error::MemError;
    use crate::replay::TranscriptTurn;
    use chrono::Utc;

    /// Scores by transcript length so tests can steer the verdict.
    struct LengthJudge;

    impl Judge for LengthJudge {
        fn judge(&self, prompt: &str) -> Result<Judgement, JudgeError> {
            let turns = prompt.lines().filter(|l| l.starts_with('[')).count();
            #[allow(clippy::cast_precision_loss)]
            let score = (turns as f32 / 10.0).min(1.0);
            Ok(Judgement {
                score,
                rationale: format!("{turns} turns"),
            })
        }
    }

    struct Fixed(f32);

    impl Judge for Fixed {
        fn judge(&self, _prompt: &str) -> Result<Judgement, JudgeError> {
            Ok(Judgement {
                score: self.0,
                rationale: String::new(),
            })
        }
    }

    struct Slow;

    impl Judge for Slow {
        fn judge(&self, _prompt: &str) -> Result<Judgement, JudgeError> {
            std::thread::sleep(Duration::from_millis(200));
            Ok(Judgement {
                score: 1.0,
                rationale: String::new(),
            })
        }
    }

    fn transcript(turns: usize) -> Transcript {
        Transcript {
            conversation_id: EntityId::new(),
            branch: "main".to_string(),
            title: None,
            grounded_on: None,
            turns: (0..turns)
                .map(|i| TranscriptTurn {
                    message_id: EntityId::new(),
                    sequence: u32::try_from(i).unwrap(),
                    role: MessageRole::User,
                    content: format!("turn {i}"),
                    tool_calls: None,
                    created_at: Utc::now(),
                    grounding: Vec::new(),
                })
                .collect(),
        }
    }

    #[test]
    fn prompt_includes_reference_and_turns() {
        let prompt = ScoringEngine::prompt(&transcript(2), Some("staging"));
        assert!(prompt.contains("Reference answer:\nstaging"));
        assert!(prompt.contains("[user] turn 1"));
    }

    #[test]
    fn compare_reports_delta() {
        let engine = ScoringEngine::new(Arc::new(LengthJudge));
        let cmp = engine.compare(&transcript(2), &transcript(5), None).unwrap();
        assert!((cmp.delta - 0.3).abs() < 1e-5);
        assert!(cmp.improved());
    }

    #[test]
    fn rejects_out_of_range_scores_and_empty_transcripts() {
        let engine = ScoringEngine::new(Arc::new(Fixed(1.5)));
        let err = engine.score(&transcript(1), None).unwrap_err();
        assert!(matches!(err, MemError::Judge(JudgeError::InvalidScore { .. })));

        let nan = ScoringEngine::new(Arc::new(Fixed(f32::NAN)));
        assert!(nan.score(&transcript(1), None).is_err());

        assert!(engine.score(&transcript(0), None).unwrap_err().is_validation());
    }

    #[test]
    fn timed_judge_times_out() {
        let judge = TimedJudge::new(Arc::new(Slow), Duration::from_millis(10));
        let engine = ScoringEngine::new(Arc::new(judge));
        let err = engine.score(&transcript(1), None).unwrap_err();
        assert!(matches!(err, MemError::Judge(JudgeError::Timeout { duration_ms: 10 })));
        assert!(err.is_retryable());
    }
}
