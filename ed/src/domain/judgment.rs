//! Judgment domain types
//!
//! A judgment targets either a single output (pointwise) or an unordered
//! pair of outputs on the same case (pairwise). The unique key makes judge
//! jobs idempotent per (judge config x target); the pair key is
//! order-insensitive so swapped replays collide.

use std::collections::{BTreeMap, HashMap};

use edisonstore::{IndexValue, Record, now_ms};
use serde::{Deserialize, Serialize};

use super::id::generate_id;
use crate::safety::SafetyFlags;

/// What a judgment scored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum JudgmentTarget {
    Pointwise { output_id: String },
    Pairwise { output_a: String, output_b: String },
}

impl JudgmentTarget {
    /// Order-insensitive key for a pair of output IDs
    pub fn pair_key(a: &str, b: &str) -> String {
        if a <= b {
            format!("{a}|{b}")
        } else {
            format!("{b}|{a}")
        }
    }

    /// Idempotency key for a pointwise judgment
    pub fn pointwise_unique_key(output_id: &str, judge_config_id: &str) -> String {
        format!("jp:{output_id}:{judge_config_id}")
    }

    /// Idempotency key for a pairwise judgment (order-insensitive)
    pub fn pairwise_unique_key(output_a: &str, output_b: &str, judge_config_id: &str) -> String {
        format!("jw:{}:{}", Self::pair_key(output_a, output_b), judge_config_id)
    }
}

/// Winner of a pairwise comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairWinner {
    A,
    B,
    Tie,
}

/// Verdict payload, shaped by the judge mode
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "shape")]
pub enum Verdict {
    Pointwise {
        /// Criterion name -> integer score within the criterion scale
        scores: BTreeMap<String, i64>,
        /// Criterion name -> short rationale
        rationales: BTreeMap<String, String>,
    },
    Pairwise {
        winner: PairWinner,
        reasons: Vec<String>,
        score_a: f64,
        score_b: f64,
    },
    /// Parse failure after the reformulation retry; excluded from aggregation
    Invalid { error: String },
}

impl Verdict {
    pub fn is_valid(&self) -> bool {
        !matches!(self, Self::Invalid { .. })
    }
}

/// One judge's verdict on one target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Judgment {
    pub id: String,
    pub iteration_id: String,
    pub judge_config_id: String,
    pub target: JudgmentTarget,
    pub verdict: Verdict,
    #[serde(default)]
    pub safety: SafetyFlags,
    pub created_at: i64,
}

impl Judgment {
    pub fn pointwise(
        iteration_id: impl Into<String>,
        judge_config_id: impl Into<String>,
        output_id: impl Into<String>,
        verdict: Verdict,
    ) -> Self {
        Self {
            id: generate_id("judg", ""),
            iteration_id: iteration_id.into(),
            judge_config_id: judge_config_id.into(),
            target: JudgmentTarget::Pointwise {
                output_id: output_id.into(),
            },
            verdict,
            safety: SafetyFlags::default(),
            created_at: now_ms(),
        }
    }

    pub fn pairwise(
        iteration_id: impl Into<String>,
        judge_config_id: impl Into<String>,
        output_a: impl Into<String>,
        output_b: impl Into<String>,
        verdict: Verdict,
    ) -> Self {
        Self {
            id: generate_id("judg", ""),
            iteration_id: iteration_id.into(),
            judge_config_id: judge_config_id.into(),
            target: JudgmentTarget::Pairwise {
                output_a: output_a.into(),
                output_b: output_b.into(),
            },
            verdict,
            safety: SafetyFlags::default(),
            created_at: now_ms(),
        }
    }

    pub fn with_safety(mut self, safety: SafetyFlags) -> Self {
        self.safety = safety;
        self
    }

    /// Whether the verdict shape matches the target shape
    pub fn shape_consistent(&self) -> bool {
        match (&self.target, &self.verdict) {
            (JudgmentTarget::Pointwise { .. }, Verdict::Pointwise { .. }) => true,
            (JudgmentTarget::Pairwise { .. }, Verdict::Pairwise { .. }) => true,
            (_, Verdict::Invalid { .. }) => true,
            _ => false,
        }
    }
}

impl Record for Judgment {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.created_at
    }

    fn collection_name() -> &'static str {
        "judgments"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert(
            "iteration_id".to_string(),
            IndexValue::String(self.iteration_id.clone()),
        );
        fields.insert(
            "judge_config_id".to_string(),
            IndexValue::String(self.judge_config_id.clone()),
        );
        fields.insert("valid".to_string(), IndexValue::Boolean(self.verdict.is_valid()));
        fields
    }

    fn unique_key(&self) -> Option<String> {
        let key = match &self.target {
            JudgmentTarget::Pointwise { output_id } => {
                JudgmentTarget::pointwise_unique_key(output_id, &self.judge_config_id)
            }
            JudgmentTarget::Pairwise { output_a, output_b } => {
                JudgmentTarget::pairwise_unique_key(output_a, output_b, &self.judge_config_id)
            }
        };
        Some(key)
    }
}
