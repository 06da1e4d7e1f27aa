//! Iteration, ModelRun, and Output domain types
//!
//! The iteration status enum carries the legal-transition table; every status
//! write goes through [`Iteration::transition_to`], which fails loudly on an
//! illegal edge.

use std::collections::HashMap;

use edisonstore::{IndexValue, Record, now_ms};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::id::generate_id;
use crate::error::{EdisonError, Result};
use crate::safety::SafetyFlags;

/// Iteration lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationStatus {
    Pending,
    Executing,
    Judging,
    Aggregating,
    Refining,
    Reviewing,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for IterationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Executing => "executing",
            Self::Judging => "judging",
            Self::Aggregating => "aggregating",
            Self::Refining => "refining",
            Self::Reviewing => "reviewing",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl IterationStatus {
    /// Whether this is a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Legal-transition table
    ///
    /// Failure is reachable from every active phase (unrecoverable internal
    /// errors and iteration deadlines demote in place); everything else
    /// follows the phase order strictly.
    pub fn can_transition_to(&self, next: IterationStatus) -> bool {
        use IterationStatus::*;
        match (self, next) {
            (Pending, Executing) | (Pending, Cancelled) | (Pending, Failed) => true,
            (Executing, Judging) | (Executing, Paused) | (Executing, Failed) | (Executing, Cancelled) => true,
            (Judging, Aggregating) | (Judging, Paused) | (Judging, Cancelled) | (Judging, Failed) => true,
            (Aggregating, Refining) | (Aggregating, Completed) | (Aggregating, Failed) => true,
            (Refining, Reviewing) | (Refining, Completed) | (Refining, Failed) => true,
            (Reviewing, Completed) | (Reviewing, Failed) => true,
            (Paused, Executing) | (Paused, Judging) | (Paused, Cancelled) | (Paused, Failed) => true,
            _ => false,
        }
    }
}

/// One complete pass of execute -> judge -> aggregate -> refine -> review
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Iteration {
    pub id: String,
    pub experiment_id: String,
    /// Monotone per experiment, 1-indexed
    pub number: u32,
    /// The frozen prompt version under test
    pub prompt_version_id: String,
    pub status: IterationStatus,
    pub scheduled_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    /// Aggregated metrics blob, persisted after the aggregation phase
    #[serde(default)]
    pub metrics: Option<serde_json::Value>,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub updated_at: i64,
}

impl Iteration {
    pub fn new(experiment_id: impl Into<String>, number: u32, prompt_version_id: impl Into<String>) -> Self {
        let experiment_id = experiment_id.into();
        let now = now_ms();
        Self {
            id: generate_id("iter", &format!("{experiment_id}-{number}")),
            experiment_id,
            number,
            prompt_version_id: prompt_version_id.into(),
            status: IterationStatus::Pending,
            scheduled_at: now,
            started_at: None,
            finished_at: None,
            metrics: None,
            stop_reason: None,
            last_error: None,
            updated_at: now,
        }
    }

    /// Transition to `next`, failing loudly on an illegal edge
    pub fn transition_to(&mut self, next: IterationStatus) -> Result<()> {
        debug!(id = %self.id, from = %self.status, to = %next, "Iteration::transition_to");
        if !self.status.can_transition_to(next) {
            return Err(EdisonError::Conflict(format!(
                "illegal iteration transition {} -> {} ({})",
                self.status, next, self.id
            )));
        }
        if self.status == IterationStatus::Pending && next == IterationStatus::Executing {
            self.started_at = Some(now_ms());
        }
        if next.is_terminal() {
            self.finished_at = Some(now_ms());
        }
        self.status = next;
        self.updated_at = now_ms();
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn set_metrics(&mut self, metrics: serde_json::Value) {
        self.metrics = Some(metrics);
        self.updated_at = now_ms();
    }

    pub fn set_stop_reason(&mut self, reason: impl Into<String>) {
        self.stop_reason = Some(reason.into());
        self.updated_at = now_ms();
    }

    pub fn set_error(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
        self.updated_at = now_ms();
    }
}

impl Record for Iteration {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "iterations"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert(
            "experiment_id".to_string(),
            IndexValue::String(self.experiment_id.clone()),
        );
        fields.insert("status".to_string(), IndexValue::String(self.status.to_string()));
        fields.insert(
            "terminal".to_string(),
            IndexValue::Boolean(self.status.is_terminal()),
        );
        fields
    }
}

/// ModelRun lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelRunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for ModelRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl ModelRunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One candidate model's pass over the dataset within an iteration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRun {
    pub id: String,
    pub iteration_id: String,
    pub model_config_id: String,
    pub dataset_id: String,
    pub status: ModelRunStatus,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_usd: f64,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub updated_at: i64,
}

impl ModelRun {
    pub fn new(
        iteration_id: impl Into<String>,
        model_config_id: impl Into<String>,
        dataset_id: impl Into<String>,
    ) -> Self {
        let iteration_id = iteration_id.into();
        let model_config_id = model_config_id.into();
        let now = now_ms();
        Self {
            id: generate_id("run", &model_config_id),
            iteration_id,
            model_config_id,
            dataset_id: dataset_id.into(),
            status: ModelRunStatus::Pending,
            prompt_tokens: 0,
            completion_tokens: 0,
            cost_usd: 0.0,
            last_error: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        }
    }

    pub fn set_status(&mut self, status: ModelRunStatus) {
        if status == ModelRunStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now_ms());
        }
        if status.is_terminal() {
            self.finished_at = Some(now_ms());
        }
        self.status = status;
        self.updated_at = now_ms();
    }

    /// Accumulate token and cost counters from a completed case
    pub fn add_usage(&mut self, prompt_tokens: u64, completion_tokens: u64, cost_usd: f64) {
        self.prompt_tokens += prompt_tokens;
        self.completion_tokens += completion_tokens;
        self.cost_usd += cost_usd;
        self.updated_at = now_ms();
    }
}

impl Record for ModelRun {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "model_runs"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert(
            "iteration_id".to_string(),
            IndexValue::String(self.iteration_id.clone()),
        );
        fields.insert("status".to_string(), IndexValue::String(self.status.to_string()));
        fields
    }

    fn unique_key(&self) -> Option<String> {
        Some(format!("run:{}:{}", self.iteration_id, self.model_config_id))
    }
}

/// Terminal disposition of a single case execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStatus {
    Completed,
    Skipped,
    Failed,
}

impl std::fmt::Display for OutputStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Completed => "completed",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// One model response for one case
///
/// Write-once after the execute phase; the unique key makes replayed
/// execute jobs idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Output {
    pub id: String,
    pub model_run_id: String,
    pub iteration_id: String,
    pub case_id: String,
    pub model_config_id: String,
    pub status: OutputStatus,
    /// Prompt after template substitution
    pub rendered_prompt: String,
    pub text: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub latency_ms: u64,
    pub finish_reason: String,
    #[serde(default)]
    pub safety: Option<SafetyFlags>,
    /// Why a case was skipped or failed; None for completed outputs
    #[serde(default)]
    pub skip_reason: Option<String>,
    pub created_at: i64,
}

impl Output {
    pub fn output_key(iteration_id: &str, case_id: &str, model_config_id: &str) -> String {
        format!("out:{iteration_id}:{case_id}:{model_config_id}")
    }

    /// Whether this output participates in aggregation
    pub fn scoreable(&self, block_violations: bool) -> bool {
        if self.status != OutputStatus::Completed {
            return false;
        }
        if block_violations && self.safety.as_ref().is_some_and(|f| f.any()) {
            return false;
        }
        true
    }
}

impl Record for Output {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.created_at
    }

    fn collection_name() -> &'static str {
        "outputs"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert(
            "iteration_id".to_string(),
            IndexValue::String(self.iteration_id.clone()),
        );
        fields.insert(
            "model_run_id".to_string(),
            IndexValue::String(self.model_run_id.clone()),
        );
        fields.insert("status".to_string(), IndexValue::String(self.status.to_string()));
        fields
    }

    fn unique_key(&self) -> Option<String> {
        Some(Self::output_key(&self.iteration_id, &self.case_id, &self.model_config_id))
    }
}
