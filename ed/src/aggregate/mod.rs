//! Aggregator - composite scores, confidence intervals, facets, win rates
//!
//! Composite per output: `Σ w_i · normalize(score_i)` over the rubric,
//! scaled by 10 for display. A criterion no valid judgment scored
//! contributes zero (worst case). Aggregation reads a consistent snapshot
//! of outputs and judgments taken by the state manager.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

mod bootstrap;
mod delta;
mod facets;
mod winrate;

pub use bootstrap::{DEFAULT_RESAMPLES, bootstrap_ci, bootstrap_ci_with_rng};
pub use delta::{DELTA_EPSILON, Delta, converged, delta};
pub use facets::{FacetBreakdown, facet_breakdown, length_bucket};
pub use winrate::{WinRateCell, WinRateMatrix, win_rate_matrix};

use crate::domain::{
    Dataset, Experiment, Judgment, JudgmentTarget, ModelConfig, ModelRankingEntry, ModelRun, Output, Rubric, Verdict,
};

/// Display multiplier applied to the normalized composite
pub const DISPLAY_SCALE: f64 = 10.0;

/// Aggregated metrics for one model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub model_config_id: String,
    pub provider: String,
    pub model: String,
    pub mean_composite: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
    pub per_criterion_means: BTreeMap<String, f64>,
    pub cost_usd: f64,
    pub output_count: usize,
    /// Model-run creation time, the final ranking tie-break
    pub run_created_at: i64,
}

impl ModelMetrics {
    pub fn ranking_entry(&self) -> ModelRankingEntry {
        ModelRankingEntry {
            model_config_id: self.model_config_id.clone(),
            provider: self.provider.clone(),
            model: self.model.clone(),
            mean_composite: self.mean_composite,
            ci_lower: self.ci_lower,
            ci_upper: self.ci_upper,
            cost_usd: self.cost_usd,
        }
    }
}

/// The full aggregation result persisted on the iteration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationMetrics {
    pub composite: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
    /// Ranked best-first: composite desc, cost asc, run creation asc
    pub per_model: Vec<ModelMetrics>,
    pub facets: FacetBreakdown,
    pub win_rates: WinRateMatrix,
    pub scored_outputs: usize,
}

impl IterationMetrics {
    pub fn best_model(&self) -> Option<&ModelMetrics> {
        self.per_model.first()
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Composite score for one output from the valid pointwise judgments that
/// target it
pub fn composite_for_output(output_id: &str, judgments: &[Judgment], rubric: &Rubric) -> f64 {
    let mut total = 0.0;
    for criterion in &rubric.criteria {
        let mut sum = 0.0;
        let mut count = 0usize;
        for judgment in judgments {
            let JudgmentTarget::Pointwise { output_id: target } = &judgment.target else {
                continue;
            };
            if target.as_str() != output_id {
                continue;
            }
            let Verdict::Pointwise { scores, .. } = &judgment.verdict else {
                continue;
            };
            if let Some(&score) = scores.get(&criterion.name) {
                sum += criterion.scale.normalize(score);
                count += 1;
            }
        }
        // Missing criterion contributes zero
        if count > 0 {
            total += criterion.weight * (sum / count as f64);
        }
    }
    total * DISPLAY_SCALE
}

/// Metrics computation over one iteration's snapshot
pub struct Aggregator {
    resamples: usize,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self {
            resamples: DEFAULT_RESAMPLES,
        }
    }
}

impl Aggregator {
    pub fn new(resamples: usize) -> Self {
        Self { resamples }
    }

    pub fn aggregate(
        &self,
        experiment: &Experiment,
        dataset: &Dataset,
        model_configs: &[ModelConfig],
        model_runs: &[ModelRun],
        outputs: &[Output],
        judgments: &[Judgment],
    ) -> IterationMetrics {
        let block = experiment.safety.block_violations;
        let scoreable: Vec<&Output> = outputs.iter().filter(|o| o.scoreable(block)).collect();
        debug!(
            total = outputs.len(),
            scoreable = scoreable.len(),
            "aggregating iteration outputs"
        );

        let composites: Vec<(&Output, f64)> = scoreable
            .iter()
            .map(|o| (*o, composite_for_output(&o.id, judgments, &experiment.rubric)))
            .collect();

        let all_scores: Vec<f64> = composites.iter().map(|(_, c)| *c).collect();
        let composite = mean(&all_scores);
        let (ci_lower, ci_upper) = bootstrap_ci(&all_scores, self.resamples);

        let mut per_model: Vec<ModelMetrics> = model_configs
            .iter()
            .map(|config| self.model_metrics(config, model_runs, &composites, judgments, &experiment.rubric))
            .collect();
        per_model.sort_by(|a, b| {
            b.mean_composite
                .partial_cmp(&a.mean_composite)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.cost_usd.partial_cmp(&b.cost_usd).unwrap_or(std::cmp::Ordering::Equal))
                .then_with(|| a.run_created_at.cmp(&b.run_created_at))
        });

        let scored_cases: Vec<(&crate::domain::Case, f64)> = composites
            .iter()
            .filter_map(|(output, composite)| dataset.case(&output.case_id).map(|case| (case, *composite)))
            .collect();

        IterationMetrics {
            composite,
            ci_lower,
            ci_upper,
            per_model,
            facets: facet_breakdown(&scored_cases),
            win_rates: win_rate_matrix(outputs, judgments),
            scored_outputs: scoreable.len(),
        }
    }

    fn model_metrics(
        &self,
        config: &ModelConfig,
        model_runs: &[ModelRun],
        composites: &[(&Output, f64)],
        judgments: &[Judgment],
        rubric: &Rubric,
    ) -> ModelMetrics {
        let run = model_runs.iter().find(|r| r.model_config_id == config.id);
        let model_scores: Vec<f64> = composites
            .iter()
            .filter(|(output, _)| output.model_config_id == config.id)
            .map(|(_, composite)| *composite)
            .collect();
        let (ci_lower, ci_upper) = bootstrap_ci(&model_scores, self.resamples);

        let mut per_criterion_means = BTreeMap::new();
        for criterion in &rubric.criteria {
            let mut sum = 0.0;
            let mut count = 0usize;
            for (output, _) in composites.iter().filter(|(o, _)| o.model_config_id == config.id) {
                for judgment in judgments {
                    let JudgmentTarget::Pointwise { output_id } = &judgment.target else {
                        continue;
                    };
                    let Verdict::Pointwise { scores, .. } = &judgment.verdict else {
                        continue;
                    };
                    if output_id == &output.id
                        && let Some(&score) = scores.get(&criterion.name)
                    {
                        sum += score as f64;
                        count += 1;
                    }
                }
            }
            if count > 0 {
                per_criterion_means.insert(criterion.name.clone(), sum / count as f64);
            }
        }

        ModelMetrics {
            model_config_id: config.id.clone(),
            provider: config.provider.clone(),
            model: config.model.clone(),
            mean_composite: mean(&model_scores),
            ci_lower,
            ci_upper,
            per_criterion_means,
            cost_usd: run.map_or(0.0, |r| r.cost_usd),
            output_count: model_scores.len(),
            run_created_at: run.map_or(i64::MAX, |r| r.created_at),
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Case, Criterion, DatasetKind, ScoreScale};
    use edisonstore::now_ms;
    use std::collections::BTreeMap as Map;

    fn experiment() -> Experiment {
        Experiment::new(
            "proj-1",
            "objective",
            Rubric {
                criteria: vec![
                    Criterion {
                        name: "accuracy".to_string(),
                        description: String::new(),
                        weight: 0.7,
                        scale: ScoreScale { min: 0, max: 5 },
                    },
                    Criterion {
                        name: "clarity".to_string(),
                        description: String::new(),
                        weight: 0.3,
                        scale: ScoreScale { min: 0, max: 10 },
                    },
                ],
            },
        )
    }

    fn output(id: &str, case_id: &str, model: &str) -> Output {
        Output {
            id: id.to_string(),
            model_run_id: format!("run-{model}"),
            iteration_id: "i1".to_string(),
            case_id: case_id.to_string(),
            model_config_id: model.to_string(),
            status: crate::domain::OutputStatus::Completed,
            rendered_prompt: String::new(),
            text: String::new(),
            prompt_tokens: 0,
            completion_tokens: 0,
            latency_ms: 0,
            finish_reason: "stop".to_string(),
            safety: None,
            skip_reason: None,
            created_at: now_ms(),
        }
    }

    fn pointwise(output_id: &str, scores: &[(&str, i64)]) -> Judgment {
        Judgment::pointwise(
            "i1",
            "jc1",
            output_id,
            Verdict::Pointwise {
                scores: scores.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
                rationales: Map::new(),
            },
        )
    }

    #[test]
    fn test_composite_weighted_and_scaled() {
        let judgments = vec![pointwise("o1", &[("accuracy", 5), ("clarity", 5)])];
        let composite = composite_for_output("o1", &judgments, &experiment().rubric);
        // accuracy: 0.7 * 1.0; clarity: 0.3 * 0.5; total 0.85 * 10
        assert!((composite - 8.5).abs() < 1e-9);
    }

    #[test]
    fn test_missing_criterion_contributes_zero() {
        let judgments = vec![pointwise("o1", &[("accuracy", 5)])];
        let composite = composite_for_output("o1", &judgments, &experiment().rubric);
        assert!((composite - 7.0).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_judgments_are_excluded() {
        let judgments = vec![
            Judgment::pointwise(
                "i1",
                "jc1",
                "o1",
                Verdict::Invalid {
                    error: "bad".to_string(),
                },
            ),
            pointwise("o1", &[("accuracy", 5), ("clarity", 10)]),
        ];
        let composite = composite_for_output("o1", &judgments, &experiment().rubric);
        assert!((composite - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_multiple_judges_average() {
        let judgments = vec![
            pointwise("o1", &[("accuracy", 5), ("clarity", 10)]),
            pointwise("o1", &[("accuracy", 0), ("clarity", 0)]),
        ];
        let composite = composite_for_output("o1", &judgments, &experiment().rubric);
        assert!((composite - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_aggregate_ranking_tie_break_by_cost() {
        let exp = experiment();
        let case = Case::new(Map::from([("x".to_string(), "hi".to_string())]));
        let dataset = Dataset::new("proj-1", DatasetKind::Golden, vec![case.clone()]);

        let config_a = ModelConfig::new(&exp.id, "mock", "model-a");
        let config_b = ModelConfig::new(&exp.id, "mock", "model-b");

        let mut run_a = ModelRun::new("i1", &config_a.id, &dataset.id);
        run_a.cost_usd = 0.50;
        let mut run_b = ModelRun::new("i1", &config_b.id, &dataset.id);
        run_b.cost_usd = 0.10;

        let output_a = output("oa", &case.id, &config_a.id);
        let output_b = output("ob", &case.id, &config_b.id);
        // Identical composites; cheaper model should rank first
        let judgments = vec![
            pointwise("oa", &[("accuracy", 4), ("clarity", 8)]),
            pointwise("ob", &[("accuracy", 4), ("clarity", 8)]),
        ];

        let metrics = Aggregator::new(100).aggregate(
            &exp,
            &dataset,
            &[config_a.clone(), config_b.clone()],
            &[run_a, run_b],
            &[output_a, output_b],
            &judgments,
        );

        assert_eq!(metrics.per_model.len(), 2);
        assert_eq!(metrics.best_model().unwrap().model_config_id, config_b.id);
    }

    #[test]
    fn test_aggregate_excludes_blocked_outputs() {
        let mut exp = experiment();
        exp.safety.block_violations = true;
        let case = Case::new(Map::from([("x".to_string(), "hi".to_string())]));
        let dataset = Dataset::new("proj-1", DatasetKind::Golden, vec![case.clone()]);
        let config = ModelConfig::new(&exp.id, "mock", "m1");
        let run = ModelRun::new("i1", &config.id, &dataset.id);

        let clean = output("oc", &case.id, &config.id);
        let mut flagged = output("of", &case.id, &config.id);
        flagged.safety = Some(crate::safety::SafetyFlags {
            pii_detected: true,
            ..Default::default()
        });

        let judgments = vec![
            pointwise("oc", &[("accuracy", 5), ("clarity", 10)]),
            pointwise("of", &[("accuracy", 0), ("clarity", 0)]),
        ];

        let metrics = Aggregator::new(100).aggregate(
            &exp,
            &dataset,
            std::slice::from_ref(&config),
            &[run],
            &[clean, flagged],
            &judgments,
        );

        assert_eq!(metrics.scored_outputs, 1);
        assert!((metrics.composite - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_ci_bounds_ordered() {
        let exp = experiment();
        let case = Case::new(Map::from([("x".to_string(), "hi".to_string())]));
        let dataset = Dataset::new("proj-1", DatasetKind::Golden, vec![case.clone()]);
        let config = ModelConfig::new(&exp.id, "mock", "m1");
        let run = ModelRun::new("i1", &config.id, &dataset.id);

        let outputs = vec![output("o1", &case.id, &config.id), output("o2", &case.id, &config.id)];
        let judgments = vec![
            pointwise("o1", &[("accuracy", 2), ("clarity", 4)]),
            pointwise("o2", &[("accuracy", 5), ("clarity", 9)]),
        ];

        let metrics =
            Aggregator::new(200).aggregate(&exp, &dataset, std::slice::from_ref(&config), &[run], &outputs, &judgments);
        assert!(metrics.ci_lower <= metrics.composite);
        assert!(metrics.composite <= metrics.ci_upper);
    }
}
