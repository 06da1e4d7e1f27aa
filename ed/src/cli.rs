//! Command-line interface types
//!
//! The CLI is the in-repo driver for experiment runs: it loads a YAML
//! experiment file, persists the domain records, and hands off to the
//! experiment manager. The HTTP transport binding lives outside this crate.

use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::Deserialize;

use crate::domain::{
    Case, Criterion, Dataset, DatasetKind, Experiment, JudgeConfig, JudgeMode, ModelConfig, PromptVersion, Rubric,
    SafetyConfig, SamplingParams, ScoreScale, StopRules,
};
use crate::error::{EdisonError, Result};

/// Edison - iterative prompt refinement workbench
#[derive(Debug, Parser)]
#[command(name = "ed", version, about)]
pub struct Cli {
    /// Path to the config file (defaults to the user config directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run an experiment from a YAML experiment file
    Run {
        /// Experiment definition file
        experiment_file: PathBuf,

        /// Approve every refiner suggestion without prompting
        #[arg(long)]
        auto_approve: bool,
    },

    /// Validate an experiment file and print diagnostics
    Validate {
        /// Experiment definition file
        experiment_file: PathBuf,
    },

    /// Print the final report for a stored experiment
    Report {
        /// Experiment record ID
        experiment_id: String,
    },

    /// Generate synthetic dataset cases for an experiment file
    Generate {
        /// Experiment definition file
        experiment_file: PathBuf,

        /// Number of cases to generate
        #[arg(long, default_value_t = 10)]
        count: usize,
    },
}

// === Experiment file format ===

#[derive(Debug, Deserialize)]
pub struct CriterionSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub weight: f64,
    pub min: i64,
    pub max: i64,
}

#[derive(Debug, Deserialize)]
pub struct ModelSpec {
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub params: SamplingParams,
}

#[derive(Debug, Deserialize)]
pub struct JudgeSpec {
    pub provider: String,
    pub model: String,
    pub mode: JudgeMode,
}

#[derive(Debug, Deserialize)]
pub struct CaseSpec {
    pub input: BTreeMap<String, String>,
    #[serde(default)]
    pub expected: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_difficulty")]
    pub difficulty: u8,
}

fn default_difficulty() -> u8 {
    3
}

fn default_dataset_kind() -> DatasetKind {
    DatasetKind::Golden
}

/// One YAML file defining a complete experiment
#[derive(Debug, Deserialize)]
pub struct ExperimentFile {
    pub project: String,
    pub objective: String,
    pub rubric: Vec<CriterionSpec>,
    pub prompt: String,
    #[serde(default)]
    pub system_preamble: Option<String>,
    #[serde(default)]
    pub stop_rules: StopRules,
    #[serde(default)]
    pub safety: SafetyConfig,
    pub models: Vec<ModelSpec>,
    pub judges: Vec<JudgeSpec>,
    #[serde(default = "default_dataset_kind")]
    pub dataset_kind: DatasetKind,
    pub dataset: Vec<CaseSpec>,
}

/// Everything `run` persists before starting the loop
pub struct LoadedExperiment {
    pub experiment: Experiment,
    pub seed_prompt: PromptVersion,
    pub model_configs: Vec<ModelConfig>,
    pub judge_configs: Vec<JudgeConfig>,
    pub dataset: Dataset,
}

impl ExperimentFile {
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| EdisonError::Validation(format!("cannot read {}: {e}", path.display())))?;
        serde_yaml::from_str(&content)
            .map_err(|e| EdisonError::Validation(format!("invalid experiment file {}: {e}", path.display())))
    }

    /// Build the domain records; validation happens on the built records
    pub fn into_domain(self) -> Result<LoadedExperiment> {
        let rubric = Rubric {
            criteria: self
                .rubric
                .into_iter()
                .map(|spec| Criterion {
                    name: spec.name,
                    description: spec.description,
                    weight: spec.weight,
                    scale: ScoreScale {
                        min: spec.min,
                        max: spec.max,
                    },
                })
                .collect(),
        };

        let experiment = Experiment::new(self.project.clone(), self.objective, rubric)
            .with_stop_rules(self.stop_rules)
            .with_safety(self.safety);
        experiment.validate()?;

        let mut seed_prompt = PromptVersion::seed(&experiment.id, self.prompt);
        if let Some(preamble) = self.system_preamble {
            seed_prompt = seed_prompt.with_system_preamble(preamble);
        }

        let model_configs = self
            .models
            .into_iter()
            .map(|spec| ModelConfig::new(&experiment.id, spec.provider, spec.model).with_params(spec.params))
            .collect();

        let judge_configs = self
            .judges
            .into_iter()
            .map(|spec| JudgeConfig::new(&experiment.id, spec.mode, spec.provider, spec.model))
            .collect();

        let cases = self
            .dataset
            .into_iter()
            .map(|spec| {
                let mut case = Case::new(spec.input).with_tags(spec.tags).with_difficulty(spec.difficulty);
                if let Some(expected) = spec.expected {
                    case = case.with_expected(expected);
                }
                case
            })
            .collect();
        let dataset = Dataset::new(self.project, self.dataset_kind, cases);
        dataset.validate()?;

        Ok(LoadedExperiment {
            experiment,
            seed_prompt,
            model_configs,
            judge_configs,
            dataset,
        })
    }
}
