//! Suggestion and Review domain types

use std::collections::HashMap;

use edisonstore::{IndexValue, Record, now_ms};
use serde::{Deserialize, Serialize};

use super::id::generate_id;

/// Lifecycle of a refiner suggestion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionStatus {
    Pending,
    Applied,
    Rejected,
    Invalid,
}

impl std::fmt::Display for SuggestionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Applied => "applied",
            Self::Rejected => "rejected",
            Self::Invalid => "invalid",
        };
        write!(f, "{s}")
    }
}

/// A refiner-produced unified diff awaiting human decision
///
/// Suggestions never mutate the prompt DAG themselves; only an approved
/// review applies one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Suggestion {
    pub id: String,
    pub iteration_id: String,
    pub parent_prompt_version_id: String,
    /// Unified diff against the parent prompt body
    pub diff: String,
    /// Refiner's explanatory note
    pub note: String,
    pub status: SuggestionStatus,
    /// Outputs that motivated the refinement
    #[serde(default)]
    pub exemplar_output_ids: Vec<String>,
    #[serde(default)]
    pub invalid_reason: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Suggestion {
    pub fn pending(
        iteration_id: impl Into<String>,
        parent_prompt_version_id: impl Into<String>,
        diff: impl Into<String>,
        note: impl Into<String>,
        exemplar_output_ids: Vec<String>,
    ) -> Self {
        let now = now_ms();
        Self {
            id: generate_id("sugg", ""),
            iteration_id: iteration_id.into(),
            parent_prompt_version_id: parent_prompt_version_id.into(),
            diff: diff.into(),
            note: note.into(),
            status: SuggestionStatus::Pending,
            exemplar_output_ids,
            invalid_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn invalid(
        iteration_id: impl Into<String>,
        parent_prompt_version_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        let now = now_ms();
        Self {
            id: generate_id("sugg", ""),
            iteration_id: iteration_id.into(),
            parent_prompt_version_id: parent_prompt_version_id.into(),
            diff: String::new(),
            note: String::new(),
            status: SuggestionStatus::Invalid,
            exemplar_output_ids: Vec::new(),
            invalid_reason: Some(reason.into()),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_status(&mut self, status: SuggestionStatus) {
        self.status = status;
        self.updated_at = now_ms();
    }
}

impl Record for Suggestion {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "suggestions"
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
}

/// Reviewer decision on a suggestion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approve,
    Reject,
    Edit,
}

/// A human review of a suggestion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Review {
    pub id: String,
    pub suggestion_id: String,
    pub reviewer: String,
    pub decision: ReviewDecision,
    /// Replacement diff when the decision is Edit
    #[serde(default)]
    pub edited_diff: Option<String>,
    #[serde(default)]
    pub notes: String,
    pub created_at: i64,
}

impl Review {
    pub fn new(suggestion_id: impl Into<String>, reviewer: impl Into<String>, decision: ReviewDecision) -> Self {
        Self {
            id: generate_id("rev", ""),
            suggestion_id: suggestion_id.into(),
            reviewer: reviewer.into(),
            decision,
            edited_diff: None,
            notes: String::new(),
            created_at: now_ms(),
        }
    }

    pub fn with_edited_diff(mut self, diff: impl Into<String>) -> Self {
        self.edited_diff = Some(diff.into());
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }
}

impl Record for Review {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.created_at
    }

    fn collection_name() -> &'static str {
        "reviews"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert(
            "suggestion_id".to_string(),
            IndexValue::String(self.suggestion_id.clone()),
        );
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_suggestion() {
        let sugg = Suggestion::pending("iter-1", "pv-1", "--- a\n+++ b\n", "tighten wording", vec!["o1".into()]);
        assert_eq!(sugg.status, SuggestionStatus::Pending);
        assert!(sugg.invalid_reason.is_none());
        assert_eq!(sugg.exemplar_output_ids, vec!["o1".to_string()]);
    }

    #[test]
    fn test_invalid_suggestion_carries_reason() {
        let sugg = Suggestion::invalid("iter-1", "pv-1", "deletion run too long");
        assert_eq!(sugg.status, SuggestionStatus::Invalid);
        assert_eq!(sugg.invalid_reason.as_deref(), Some("deletion run too long"));
        assert!(sugg.diff.is_empty());
    }

    #[test]
    fn test_review_builder() {
        let review = Review::new("sugg-1", "alex", ReviewDecision::Edit)
            .with_edited_diff("--- a\n+++ b\n")
            .with_notes("smaller change");
        assert_eq!(review.decision, ReviewDecision::Edit);
        assert!(review.edited_diff.is_some());
    }
}
