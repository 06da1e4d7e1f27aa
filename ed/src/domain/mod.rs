//! Domain types for Edison
//!
//! Experiments, rubrics, prompt versions, datasets, model and judge
//! configurations, iterations with their state machine, outputs, judgments,
//! suggestions, reviews, and the cost ledger. All persisted types implement
//! the EdisonStore `Record` trait.

mod cost;
mod dataset;
mod experiment;
mod id;
mod iteration;
mod judgment;
mod model;
mod prompt;
mod report;
mod suggestion;

pub use cost::CostRecord;
pub use dataset::{Case, Dataset, DatasetKind};
pub use experiment::{Criterion, Experiment, Rubric, SafetyConfig, ScoreScale, StopRules, WEIGHT_SUM_TOLERANCE};
pub use id::generate_id;
pub use iteration::{Iteration, IterationStatus, ModelRun, ModelRunStatus, Output, OutputStatus};
pub use judgment::{Judgment, JudgmentTarget, PairWinner, Verdict};
pub use model::{JudgeConfig, JudgeMode, ModelConfig, SamplingParams};
pub use prompt::{Creator, FewShotExample, PromptVersion};
pub use report::{FinalReport, ModelRankingEntry};
pub use suggestion::{Review, ReviewDecision, Suggestion, SuggestionStatus};

// Re-export store types for convenience
pub use edisonstore::{Filter, FilterOp, IndexValue, Record, Store, now_ms};
