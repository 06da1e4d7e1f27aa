//! Dataset and test-case domain types

use std::collections::{BTreeMap, HashMap};

use edisonstore::{IndexValue, Record, now_ms};
use serde::{Deserialize, Serialize};

use super::id::generate_id;
use crate::error::{EdisonError, Result};

/// Where a dataset came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    Golden,
    Synthetic,
    Adversarial,
}

/// One test case: template variable bindings plus optional expectations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Case {
    pub id: String,
    /// Variable name -> value, substituted into the prompt body
    pub input: BTreeMap<String, String>,
    #[serde(default)]
    pub expected: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Difficulty 1 (easy) through 5 (hard)
    pub difficulty: u8,
}

impl Case {
    pub fn new(input: BTreeMap<String, String>) -> Self {
        Self {
            id: generate_id("case", ""),
            input,
            expected: None,
            tags: Vec::new(),
            difficulty: 3,
        }
    }

    pub fn with_expected(mut self, expected: impl Into<String>) -> Self {
        self.expected = Some(expected.into());
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_difficulty(mut self, difficulty: u8) -> Self {
        self.difficulty = difficulty;
        self
    }

    /// Character count used for length-bucket facets
    pub fn length_chars(&self) -> usize {
        let input_len: usize = self.input.values().map(|v| v.len()).sum();
        input_len + self.expected.as_deref().map_or(0, str::len)
    }
}

/// An ordered set of cases
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub id: String,
    pub project_id: String,
    pub kind: DatasetKind,
    pub cases: Vec<Case>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Dataset {
    pub fn new(project_id: impl Into<String>, kind: DatasetKind, cases: Vec<Case>) -> Self {
        let now = now_ms();
        Self {
            id: generate_id("ds", ""),
            project_id: project_id.into(),
            kind,
            cases,
            created_at: now,
            updated_at: now,
        }
    }

    /// Validate case difficulty bounds and non-emptiness of inputs
    pub fn validate(&self) -> Result<()> {
        for case in &self.cases {
            if !(1..=5).contains(&case.difficulty) {
                return Err(EdisonError::Validation(format!(
                    "case {} difficulty must be 1-5, got {}",
                    case.id, case.difficulty
                )));
            }
        }
        Ok(())
    }

    pub fn case(&self, case_id: &str) -> Option<&Case> {
        self.cases.iter().find(|c| c.id == case_id)
    }
}

impl Record for Dataset {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "datasets"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("project_id".to_string(), IndexValue::String(self.project_id.clone()));
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn case_with(input: &[(&str, &str)]) -> Case {
        Case::new(
            input
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_case_length_chars() {
        let case = case_with(&[("x", "hello")]).with_expected("world!");
        assert_eq!(case.length_chars(), 5 + 6);
    }

    #[test]
    fn test_dataset_validate_difficulty() {
        let mut ds = Dataset::new("proj-1", DatasetKind::Golden, vec![case_with(&[("x", "hi")])]);
        assert!(ds.validate().is_ok());

        ds.cases[0].difficulty = 0;
        assert!(ds.validate().is_err());

        ds.cases[0].difficulty = 6;
        assert!(ds.validate().is_err());
    }

    #[test]
    fn test_dataset_lookup() {
        let ds = Dataset::new(
            "proj-1",
            DatasetKind::Synthetic,
            vec![case_with(&[("x", "a")]), case_with(&[("x", "b")])],
        );
        let id = ds.cases[1].id.clone();
        assert_eq!(ds.case(&id).unwrap().input["x"], "b");
        assert!(ds.case("missing").is_none());
    }
}
