//! Append-only cost ledger

use std::collections::HashMap;

use edisonstore::{IndexValue, Record, now_ms};
use serde::{Deserialize, Serialize};

use super::id::generate_id;

/// One provider charge, appended after each non-cached call
///
/// Records are append-only; budget checks read windowed sums over them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostRecord {
    pub id: String,
    pub project_id: String,
    pub provider: String,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub amount_usd: f64,
    pub created_at: i64,
}

impl CostRecord {
    pub fn new(
        project_id: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
        prompt_tokens: u64,
        completion_tokens: u64,
        amount_usd: f64,
    ) -> Self {
        Self {
            id: generate_id("cost", ""),
            project_id: project_id.into(),
            provider: provider.into(),
            model: model.into(),
            prompt_tokens,
            completion_tokens,
            amount_usd,
            created_at: now_ms(),
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

impl Record for CostRecord {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.created_at
    }

    fn collection_name() -> &'static str {
        "cost_records"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("project_id".to_string(), IndexValue::String(self.project_id.clone()));
        fields.insert("provider".to_string(), IndexValue::String(self.provider.clone()));
        fields
    }
}
