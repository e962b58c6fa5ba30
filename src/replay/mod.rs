//! Evaluation tooling: conversation replay, judge scoring and semantic diff.
//!
//! Nothing in this module writes to the store. Scoring is the only part that
//! performs external I/O, through the injected [`Judge`].

mod diff;
mod scoring;
mod transcript;

pub use diff::{DiffConfig, DiffEntry, DiffItem, DiffStatus, SemanticDiff, SemanticDiffEngine};
pub use scoring::{Comparison, Judge, JudgeError, Judgement, ScoringEngine, TimedJudge};
pub use transcript::{GroundingMatch, ReplayConfig, ReplayDefaults, ReplayEngine, Transcript, TranscriptTurn};
