//! Judge wire contracts
//!
//! Strict JSON with a single wrapping markdown fence stripped before
//! parsing. There is no repair beyond fence stripping: a response that
//! does not parse gets one reformulation retry upstream, then becomes an
//! INVALID judgment excluded from aggregation.

use std::collections::BTreeMap;

use serde::Deserialize;
use tracing::debug;

use crate::domain::{PairWinner, Rubric};
use crate::safety::SafetyFlags;

/// Fixed judge sampling for reproducibility
pub const JUDGE_TEMPERATURE: f64 = 0.3;
pub const JUDGE_SEED: u64 = 42;

/// Strip a single wrapping markdown code fence, if present
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("json", "JSON", ...) on the opening fence line
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => return trimmed,
    };
    match body.rfind("```") {
        Some(close) => body[..close].trim(),
        None => trimmed,
    }
}

/// Parsed pointwise verdict
#[derive(Debug, Clone, PartialEq)]
pub struct PointwiseVerdict {
    pub scores: BTreeMap<String, i64>,
    pub rationales: BTreeMap<String, String>,
    pub safety_flags: SafetyFlags,
}

#[derive(Debug, Deserialize)]
struct PointwiseWire {
    scores: BTreeMap<String, i64>,
    #[serde(default)]
    rationales: BTreeMap<String, String>,
    #[serde(rename = "safetyFlags", default)]
    safety_flags: SafetyFlagsWire,
}

#[derive(Debug, Default, Deserialize)]
struct SafetyFlagsWire {
    #[serde(rename = "policyViolation", default)]
    policy_violation: bool,
    #[serde(rename = "piiDetected", default)]
    pii_detected: bool,
    #[serde(rename = "toxicContent", default)]
    toxic_content: bool,
    #[serde(rename = "jailbreakAttempt", default)]
    jailbreak_attempt: bool,
}

impl From<SafetyFlagsWire> for SafetyFlags {
    fn from(wire: SafetyFlagsWire) -> Self {
        Self {
            policy_violation: wire.policy_violation,
            pii_detected: wire.pii_detected,
            toxic_content: wire.toxic_content,
            jailbreak_attempt: wire.jailbreak_attempt,
        }
    }
}

/// Parse a pointwise judge response against the rubric
///
/// Unknown criterion keys are dropped; missing criterion keys are logged and
/// contribute worst-case zeros at aggregation time.
pub fn parse_pointwise(text: &str, rubric: &Rubric) -> Result<PointwiseVerdict, String> {
    let cleaned = strip_code_fences(text);
    let wire: PointwiseWire =
        serde_json::from_str(cleaned).map_err(|e| format!("pointwise verdict is not valid JSON: {e}"))?;

    let mut scores = BTreeMap::new();
    let mut rationales = BTreeMap::new();
    for criterion in &rubric.criteria {
        match wire.scores.get(&criterion.name) {
            Some(&score) => {
                if !criterion.scale.contains(score) {
                    return Err(format!(
                        "score {} for criterion '{}' is outside [{}, {}]",
                        score, criterion.name, criterion.scale.min, criterion.scale.max
                    ));
                }
                scores.insert(criterion.name.clone(), score);
            }
            None => {
                debug!(criterion = %criterion.name, "judge omitted criterion score");
            }
        }
        if let Some(rationale) = wire.rationales.get(&criterion.name) {
            rationales.insert(criterion.name.clone(), rationale.clone());
        }
    }

    if scores.is_empty() {
        return Err("pointwise verdict scored no rubric criterion".to_string());
    }

    Ok(PointwiseVerdict {
        scores,
        rationales,
        safety_flags: wire.safety_flags.into(),
    })
}

/// Parsed pairwise verdict
#[derive(Debug, Clone, PartialEq)]
pub struct PairwiseVerdict {
    pub winner: PairWinner,
    pub reasons: Vec<String>,
    pub score_a: f64,
    pub score_b: f64,
}

#[derive(Debug, Deserialize)]
struct PairwiseWire {
    winner: String,
    #[serde(default)]
    reasons: Vec<String>,
    #[serde(default)]
    scores: PairScoresWire,
}

#[derive(Debug, Default, Deserialize)]
struct PairScoresWire {
    #[serde(rename = "A", default)]
    a: f64,
    #[serde(rename = "B", default)]
    b: f64,
}

/// Parse a pairwise judge response
pub fn parse_pairwise(text: &str) -> Result<PairwiseVerdict, String> {
    let cleaned = strip_code_fences(text);
    let wire: PairwiseWire =
        serde_json::from_str(cleaned).map_err(|e| format!("pairwise verdict is not valid JSON: {e}"))?;

    let winner = match wire.winner.as_str() {
        "A" => PairWinner::A,
        "B" => PairWinner::B,
        "tie" => PairWinner::Tie,
        other => return Err(format!("winner must be \"A\", \"B\", or \"tie\", got {other:?}")),
    };

    Ok(PairwiseVerdict {
        winner,
        reasons: wire.reasons,
        score_a: wire.scores.a,
        score_b: wire.scores.b,
    })
}
