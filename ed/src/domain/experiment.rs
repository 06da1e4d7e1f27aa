//! Experiment, rubric, and stop-rule domain types

use std::collections::HashMap;
use std::collections::HashSet;

use edisonstore::{IndexValue, Record, now_ms};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::id::generate_id;
use crate::error::{EdisonError, Result};

/// Tolerance allowed on the rubric weight sum
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-2;

/// Integer score bounds for a criterion
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ScoreScale {
    pub min: i64,
    pub max: i64,
}

impl ScoreScale {
    /// Map a raw score into [0, 1]
    pub fn normalize(&self, score: i64) -> f64 {
        let clamped = score.clamp(self.min, self.max);
        (clamped - self.min) as f64 / (self.max - self.min) as f64
    }

    /// Whether a score falls inside the bounds
    pub fn contains(&self, score: i64) -> bool {
        score >= self.min && score <= self.max
    }
}

/// One weighted scoring criterion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Criterion {
    pub name: String,
    pub description: String,
    pub weight: f64,
    pub scale: ScoreScale,
}

/// Ordered list of criteria; weights must sum to 1.0 (±1e-2)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rubric {
    pub criteria: Vec<Criterion>,
}

impl Rubric {
    /// Validate the rubric invariants before persistence
    pub fn validate(&self) -> Result<()> {
        debug!(criteria = self.criteria.len(), "Rubric::validate");
        if self.criteria.len() < 2 || self.criteria.len() > 10 {
            return Err(EdisonError::Validation(format!(
                "rubric must have 2-10 criteria, got {}",
                self.criteria.len()
            )));
        }

        let mut names = HashSet::new();
        for criterion in &self.criteria {
            if criterion.name.is_empty() || criterion.name.len() > 50 {
                return Err(EdisonError::Validation(format!(
                    "criterion name must be 1-50 chars: {:?}",
                    criterion.name
                )));
            }
            if !names.insert(criterion.name.as_str()) {
                return Err(EdisonError::Validation(format!(
                    "duplicate criterion name: {}",
                    criterion.name
                )));
            }
            if criterion.weight < 0.0 {
                return Err(EdisonError::Validation(format!(
                    "criterion {} has negative weight",
                    criterion.name
                )));
            }
            if criterion.scale.max <= criterion.scale.min {
                return Err(EdisonError::Validation(format!(
                    "criterion {} scale must satisfy max > min",
                    criterion.name
                )));
            }
        }

        let sum: f64 = self.criteria.iter().map(|c| c.weight).sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(EdisonError::Validation(format!(
                "criterion weights must sum to 1.0 (±{WEIGHT_SUM_TOLERANCE}), got {sum:.4}"
            )));
        }
        Ok(())
    }

    /// Look up a criterion by name
    pub fn criterion(&self, name: &str) -> Option<&Criterion> {
        self.criteria.iter().find(|c| c.name == name)
    }
}

/// Stop rules evaluated around each iteration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopRules {
    /// Hard cap on iteration count
    pub max_iterations: u32,

    /// Composite delta (as a fraction of the previous score) below which an
    /// iteration counts toward convergence
    pub min_delta_threshold: f64,

    /// Number of consecutive below-threshold deltas that triggers a stop
    pub convergence_window: u32,

    /// Budget cap in USD over the spend window; None disables the budget gate
    pub max_budget_usd: Option<f64>,

    /// Fraction of the budget at which a one-shot cost alert fires
    pub alert_threshold: f64,

    /// Stop when the refiner produced no valid suggestion this iteration
    pub stop_if_no_refinement: bool,
}

impl Default for StopRules {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            min_delta_threshold: 0.02,
            convergence_window: 3,
            max_budget_usd: None,
            alert_threshold: 0.8,
            stop_if_no_refinement: false,
        }
    }
}

impl StopRules {
    /// Validate bounds; alert threshold outside [0.5, 1.0] is rejected
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(EdisonError::Validation("max_iterations must be positive".into()));
        }
        if self.convergence_window == 0 {
            return Err(EdisonError::Validation("convergence_window must be positive".into()));
        }
        if self.min_delta_threshold < 0.0 {
            return Err(EdisonError::Validation(
                "min_delta_threshold must be non-negative".into(),
            ));
        }
        if let Some(budget) = self.max_budget_usd
            && budget <= 0.0
        {
            return Err(EdisonError::Validation("max_budget_usd must be positive".into()));
        }
        if !(0.5..=1.0).contains(&self.alert_threshold) {
            return Err(EdisonError::Validation(format!(
                "alert_threshold must be within [0.5, 1.0], got {}",
                self.alert_threshold
            )));
        }
        Ok(())
    }
}

/// Per-experiment safety toggles
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Exclude flagged outputs from aggregation and pairwise matchups
    pub block_violations: bool,

    /// Run provider-native moderation when a moderation key is configured
    #[serde(default)]
    pub use_provider_moderation: bool,

    /// Run the external toxicity service when configured
    #[serde(default)]
    pub use_toxicity_service: bool,
}

/// A prompt-improvement experiment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub id: String,
    pub project_id: String,
    pub objective: String,
    pub rubric: Rubric,
    pub stop_rules: StopRules,
    pub safety: SafetyConfig,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Experiment {
    pub fn new(project_id: impl Into<String>, objective: impl Into<String>, rubric: Rubric) -> Self {
        let objective = objective.into();
        let now = now_ms();
        Self {
            id: generate_id("exp", &objective),
            project_id: project_id.into(),
            objective,
            rubric,
            stop_rules: StopRules::default(),
            safety: SafetyConfig::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_stop_rules(mut self, stop_rules: StopRules) -> Self {
        self.stop_rules = stop_rules;
        self
    }

    pub fn with_safety(mut self, safety: SafetyConfig) -> Self {
        self.safety = safety;
        self
    }

    /// Validate the whole experiment configuration
    pub fn validate(&self) -> Result<()> {
        debug!(id = %self.id, "Experiment::validate");
        if self.objective.trim().is_empty() {
            return Err(EdisonError::Validation("objective must not be empty".into()));
        }
        self.rubric.validate()?;
        self.stop_rules.validate()?;
        Ok(())
    }
}

impl Record for Experiment {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "experiments"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("project_id".to_string(), IndexValue::String(self.project_id.clone()));
        fields
    }
}
