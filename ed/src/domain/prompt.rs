//! PromptVersion - immutable prompt snapshots forming a parent-linked DAG

use std::collections::{BTreeSet, HashMap};

use edisonstore::{IndexValue, Record, now_ms};
use serde::{Deserialize, Serialize};

use super::id::generate_id;
use crate::render::extract_variables;

/// Who authored a prompt version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Creator {
    Human,
    Refiner,
}

/// A few-shot example attached to a prompt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FewShotExample {
    pub input: String,
    pub output: String,
}

/// An immutable snapshot of a prompt under test
///
/// Versions are monotone positive integers per experiment and form a DAG via
/// the parent pointer. Instances are never mutated after creation; a
/// refinement always appends a new version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptVersion {
    pub id: String,
    pub experiment_id: String,
    pub version: u32,
    pub parent_id: Option<String>,
    pub body: String,
    #[serde(default)]
    pub system_preamble: Option<String>,
    #[serde(default)]
    pub few_shot: Vec<FewShotExample>,
    #[serde(default)]
    pub tool_schema: Option<serde_json::Value>,
    pub changelog: String,
    pub created_by: Creator,
    pub is_production: bool,
    pub created_at: i64,
}

impl PromptVersion {
    /// Create the seed version (version 1, no parent)
    pub fn seed(experiment_id: impl Into<String>, body: impl Into<String>) -> Self {
        let experiment_id = experiment_id.into();
        Self {
            id: generate_id("pv", &format!("{experiment_id}-v1")),
            experiment_id,
            version: 1,
            parent_id: None,
            body: body.into(),
            system_preamble: None,
            few_shot: Vec::new(),
            tool_schema: None,
            changelog: "seed prompt".to_string(),
            created_by: Creator::Human,
            is_production: false,
            created_at: now_ms(),
        }
    }

    /// Create a child version derived from this one
    pub fn child(&self, body: impl Into<String>, changelog: impl Into<String>, created_by: Creator) -> Self {
        Self {
            id: generate_id("pv", &format!("{}-v{}", self.experiment_id, self.version + 1)),
            experiment_id: self.experiment_id.clone(),
            version: self.version + 1,
            parent_id: Some(self.id.clone()),
            body: body.into(),
            system_preamble: self.system_preamble.clone(),
            few_shot: self.few_shot.clone(),
            tool_schema: self.tool_schema.clone(),
            changelog: changelog.into(),
            created_by,
            is_production: false,
            created_at: now_ms(),
        }
    }

    pub fn with_system_preamble(mut self, preamble: impl Into<String>) -> Self {
        self.system_preamble = Some(preamble.into());
        self
    }

    /// Template variables (`{{name}}`) appearing in the body
    pub fn template_variables(&self) -> BTreeSet<String> {
        extract_variables(&self.body)
    }
}

impl Record for PromptVersion {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.created_at
    }

    fn collection_name() -> &'static str {
        "prompt_versions"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert(
            "experiment_id".to_string(),
            IndexValue::String(self.experiment_id.clone()),
        );
        fields.insert("version".to_string(), IndexValue::Integer(self.version as i64));
        fields.insert("is_production".to_string(), IndexValue::Boolean(self.is_production));
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_version() {
        let seed = PromptVersion::seed("exp-1", "Echo: {{x}}");
        assert_eq!(seed.version, 1);
        assert!(seed.parent_id.is_none());
        assert_eq!(seed.created_by, Creator::Human);
    }

    #[test]
    fn test_child_increments_version_and_links_parent() {
        let seed = PromptVersion::seed("exp-1", "Echo: {{x}}");
        let child = seed.child("Echo loudly: {{x}}", "louder", Creator::Refiner);
        assert_eq!(child.version, 2);
        assert_eq!(child.parent_id.as_deref(), Some(seed.id.as_str()));
        assert_eq!(child.experiment_id, seed.experiment_id);
        assert_eq!(child.created_by, Creator::Refiner);
    }

    #[test]
    fn test_template_variables() {
        let version = PromptVersion::seed("exp-1", "Translate {{text}} into {{language}}. Keep {{text}} intact.");
        let vars = version.template_variables();
        assert_eq!(vars.len(), 2);
        assert!(vars.contains("text"));
        assert!(vars.contains("language"));
    }

    #[test]
    fn test_versions_strictly_increase_along_chain() {
        let mut current = PromptVersion::seed("exp-1", "v1");
        for i in 2..=6 {
            let next = current.child(format!("v{i}"), "step", Creator::Refiner);
            assert!(next.version > current.version);
            current = next;
        }
        assert_eq!(current.version, 6);
    }
}
