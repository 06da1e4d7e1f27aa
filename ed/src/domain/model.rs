//! Candidate-model and judge-model configuration

use std::collections::HashMap;

use edisonstore::{IndexValue, Record, now_ms};
use serde::{Deserialize, Serialize};

use super::id::generate_id;

/// Sampling parameters forwarded to the provider
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SamplingParams {
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub frequency_penalty: Option<f64>,
    #[serde(default)]
    pub presence_penalty: Option<f64>,
    #[serde(default)]
    pub stop: Vec<String>,
    #[serde(default)]
    pub seed: Option<u64>,
}

/// A candidate model under evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    pub experiment_id: String,
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub params: SamplingParams,
    pub active: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ModelConfig {
    pub fn new(experiment_id: impl Into<String>, provider: impl Into<String>, model: impl Into<String>) -> Self {
        let provider = provider.into();
        let model = model.into();
        let now = now_ms();
        Self {
            id: generate_id("mc", &format!("{provider}-{model}")),
            experiment_id: experiment_id.into(),
            provider,
            model,
            params: SamplingParams::default(),
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_params(mut self, params: SamplingParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.params.temperature = Some(temperature);
        self
    }
}

impl Record for ModelConfig {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "model_configs"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert(
            "experiment_id".to_string(),
            IndexValue::String(self.experiment_id.clone()),
        );
        fields.insert("active".to_string(), IndexValue::Boolean(self.active));
        fields
    }
}

/// How a judge scores outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JudgeMode {
    Pointwise,
    Pairwise,
}

impl std::fmt::Display for JudgeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pointwise => write!(f, "pointwise"),
            Self::Pairwise => write!(f, "pairwise"),
        }
    }
}

/// A judge model configuration
///
/// Judges always run with fixed sampling (temperature 0.3, seed 42) for
/// reproducibility; there are no per-judge sampling knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeConfig {
    pub id: String,
    pub experiment_id: String,
    pub mode: JudgeMode,
    pub provider: String,
    pub model: String,
    pub active: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl JudgeConfig {
    pub fn new(
        experiment_id: impl Into<String>,
        mode: JudgeMode,
        provider: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        let provider = provider.into();
        let model = model.into();
        let now = now_ms();
        Self {
            id: generate_id("jc", &format!("{mode}-{provider}-{model}")),
            experiment_id: experiment_id.into(),
            mode,
            provider,
            model,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Record for JudgeConfig {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "judge_configs"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert(
            "experiment_id".to_string(),
            IndexValue::String(self.experiment_id.clone()),
        );
        fields.insert("mode".to_string(), IndexValue::String(self.mode.to_string()));
        fields.insert("active".to_string(), IndexValue::Boolean(self.active));
        fields
    }
}
