//! Final report emitted when an experiment run completes

use serde::{Deserialize, Serialize};

/// One model's standing in the final ranking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRankingEntry {
    pub model_config_id: String,
    pub provider: String,
    pub model: String,
    pub mean_composite: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
    pub cost_usd: f64,
}

/// The terminal summary of an experiment run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalReport {
    pub best_prompt_version_id: String,
    pub composite_score: f64,
    pub per_model_ranking: Vec<ModelRankingEntry>,
    pub total_cost_usd: f64,
    pub total_tokens: u64,
    pub iterations_run: u32,
    pub stop_reason: String,
    pub recommendations: Vec<String>,
}
