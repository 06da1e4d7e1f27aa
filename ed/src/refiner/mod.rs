//! Refiner - proposes a bounded unified-diff refinement of the prompt
//!
//! Targets the two weakest rubric criteria, shows the model the worst
//! failing exemplars, and demands a strict `<diff>`/`<note>` response. The
//! diff is validated before a PENDING suggestion is staged; the refiner
//! never touches the prompt DAG itself - only an approved review does.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

mod diff;

pub use diff::{DiffError, DiffLimits, diff_between, validate_and_apply};

use crate::domain::{Experiment, Judgment, JudgmentTarget, Output, PromptVersion, Suggestion, Verdict};
use crate::error::Result;
use crate::provider::{ChatMessage, ChatOptions, ProviderAdapter};

/// Refiner tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefinerConfig {
    pub provider: String,
    pub model: String,
    /// Outputs in this bottom quantile of weak-criteria scores become
    /// exemplars
    pub exemplar_quantile: f64,
    pub max_exemplars: usize,
    pub temperature: f64,
    #[serde(default)]
    pub limits: DiffLimits,
}

impl Default for RefinerConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o".to_string(),
            exemplar_quantile: 0.2,
            max_exemplars: 3,
            temperature: 0.2,
            limits: DiffLimits::default(),
        }
    }
}

/// A failing exemplar handed to the refiner model
#[derive(Debug, Clone)]
struct Exemplar {
    output_id: String,
    rendered_prompt: String,
    text: String,
    scores: BTreeMap<String, i64>,
    rationales: BTreeMap<String, String>,
    weak_mean: f64,
}

/// The refinement engine
pub struct Refiner {
    config: RefinerConfig,
}

impl Refiner {
    pub fn new(config: RefinerConfig) -> Self {
        Self { config }
    }

    pub fn limits(&self) -> &DiffLimits {
        &self.config.limits
    }

    pub fn provider(&self) -> &str {
        &self.config.provider
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Produce a suggestion for this iteration
    ///
    /// Returns a PENDING suggestion on success or an INVALID one when the
    /// model's diff fails validation twice. Provider failures propagate.
    pub async fn refine(
        &self,
        adapter: &ProviderAdapter,
        experiment: &Experiment,
        prompt_version: &PromptVersion,
        outputs: &[Output],
        judgments: &[Judgment],
        iteration_id: &str,
    ) -> Result<Suggestion> {
        let weak = weak_criteria(experiment, outputs, judgments);
        debug!(?weak, "refiner targeting weakest criteria");

        let exemplars = self.select_exemplars(&weak, outputs, judgments);
        let exemplar_ids: Vec<String> = exemplars.iter().map(|e| e.output_id.clone()).collect();
        let prompt = build_refiner_prompt(experiment, prompt_version, &weak, &exemplars);

        let options = ChatOptions::default().with_temperature(self.config.temperature);

        let mut last_error = String::new();
        // One retry per iteration, never more
        for attempt in 0..2 {
            let attempt_prompt = if attempt == 0 {
                prompt.clone()
            } else {
                format!("{prompt}\n\nYour previous diff was rejected: {last_error}. Propose a smaller, cleaner edit.")
            };
            let response = adapter.chat(&[ChatMessage::user(&attempt_prompt)], &options).await?;
            match self.parse_and_validate(&response.text, &prompt_version.body) {
                Ok((diff_text, note)) => {
                    debug!(attempt, "refiner produced a valid diff");
                    return Ok(Suggestion::pending(
                        iteration_id,
                        &prompt_version.id,
                        diff_text,
                        note,
                        exemplar_ids,
                    ));
                }
                Err(error) => {
                    warn!(attempt, %error, "refiner response rejected");
                    last_error = error;
                }
            }
        }

        Ok(Suggestion::invalid(iteration_id, &prompt_version.id, last_error))
    }

    fn parse_and_validate(&self, response: &str, old_body: &str) -> std::result::Result<(String, String), String> {
        let (diff_text, note) = extract_contract(response)?;
        validate_and_apply(&diff_text, old_body, &self.config.limits).map_err(|e| e.to_string())?;
        Ok((diff_text, note))
    }

    fn select_exemplars(&self, weak: &[String], outputs: &[Output], judgments: &[Judgment]) -> Vec<Exemplar> {
        let mut exemplars: Vec<Exemplar> = outputs
            .iter()
            .filter_map(|output| {
                let (scores, rationales) = scores_for_output(&output.id, judgments);
                if scores.is_empty() {
                    return None;
                }
                let weak_scores: Vec<f64> = weak.iter().filter_map(|c| scores.get(c).map(|&s| s as f64)).collect();
                if weak_scores.is_empty() {
                    return None;
                }
                Some(Exemplar {
                    output_id: output.id.clone(),
                    rendered_prompt: output.rendered_prompt.clone(),
                    text: output.text.clone(),
                    weak_mean: weak_scores.iter().sum::<f64>() / weak_scores.len() as f64,
                    scores,
                    rationales,
                })
            })
            .collect();

        exemplars.sort_by(|a, b| a.weak_mean.partial_cmp(&b.weak_mean).unwrap_or(std::cmp::Ordering::Equal));

        // Keep the bottom quantile, at least one, at most max_exemplars
        let quantile_count = ((exemplars.len() as f64) * self.config.exemplar_quantile).ceil() as usize;
        let keep = quantile_count.clamp(1, self.config.max_exemplars).min(exemplars.len());
        exemplars.truncate(keep);
        exemplars
    }
}

/// The two criteria with the lowest mean score across scored outputs
fn weak_criteria(experiment: &Experiment, outputs: &[Output], judgments: &[Judgment]) -> Vec<String> {
    let mut means: Vec<(String, f64)> = experiment
        .rubric
        .criteria
        .iter()
        .map(|criterion| {
            let mut sum = 0.0;
            let mut count = 0usize;
            for output in outputs {
                let (scores, _) = scores_for_output(&output.id, judgments);
                if let Some(&score) = scores.get(&criterion.name) {
                    sum += criterion.scale.normalize(score);
                    count += 1;
                }
            }
            let mean = if count == 0 { 0.0 } else { sum / count as f64 };
            (criterion.name.clone(), mean)
        })
        .collect();

    means.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
    means.into_iter().take(2).map(|(name, _)| name).collect()
}

fn scores_for_output(output_id: &str, judgments: &[Judgment]) -> (BTreeMap<String, i64>, BTreeMap<String, String>) {
    let mut merged_scores = BTreeMap::new();
    let mut merged_rationales = BTreeMap::new();
    for judgment in judgments {
        let JudgmentTarget::Pointwise { output_id: target } = &judgment.target else {
            continue;
        };
        if target.as_str() != output_id {
            continue;
        }
        if let Verdict::Pointwise { scores, rationales } = &judgment.verdict {
            for (criterion, &score) in scores {
                merged_scores.entry(criterion.clone()).or_insert(score);
            }
            for (criterion, rationale) in rationales {
                merged_rationales.entry(criterion.clone()).or_insert_with(|| rationale.clone());
            }
        }
    }
    (merged_scores, merged_rationales)
}

/// Extract the strict `<diff>`/`<note>` contract
///
/// Exactly one `<diff>` block (tags on their own lines) and exactly one
/// `<note>` block; anything else is rejected.
fn extract_contract(response: &str) -> std::result::Result<(String, String), String> {
    let diff = extract_block(response, "diff")?;
    let note = extract_block(response, "note")?;
    Ok((diff, note))
}

fn extract_block(response: &str, tag: &str) -> std::result::Result<String, String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");

    let open_count = response.lines().filter(|line| line.trim() == open).count();
    let close_count = response.lines().filter(|line| line.trim() == close).count();
    if open_count != 1 || close_count != 1 {
        return Err(format!(
            "response must contain exactly one <{tag}> block on its own lines (found {open_count} open, {close_count} close)"
        ));
    }

    let mut collected: Vec<&str> = Vec::new();
    let mut inside = false;
    for line in response.lines() {
        let trimmed = line.trim();
        if trimmed == open {
            inside = true;
            continue;
        }
        if trimmed == close {
            if !inside {
                return Err(format!("</{tag}> appears before <{tag}>"));
            }
            let mut body = collected.join("\n");
            if !body.is_empty() {
                body.push('\n');
            }
            return Ok(body);
        }
        if inside {
            collected.push(line);
        }
    }
    Err(format!("<{tag}> block never closed"))
}

fn build_refiner_prompt(
    experiment: &Experiment,
    prompt_version: &PromptVersion,
    weak: &[String],
    exemplars: &[Exemplar],
) -> String {
    let rubric = experiment
        .rubric
        .criteria
        .iter()
        .map(|c| {
            format!(
                "- {} (weight {:.2}, scale {}..{}): {}",
                c.name, c.weight, c.scale.min, c.scale.max, c.description
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    let mut exemplar_text = String::new();
    for (index, exemplar) in exemplars.iter().enumerate() {
        let scores = exemplar
            .scores
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(", ");
        let rationales = exemplar
            .rationales
            .iter()
            .map(|(k, v)| format!("  {k}: {v}"))
            .collect::<Vec<_>>()
            .join("\n");
        exemplar_text.push_str(&format!(
            "\nExemplar {n}:\nInput:\n{input}\nOutput:\n{output}\nScores: {scores}\nRationales:\n{rationales}\n",
            n = index + 1,
            input = exemplar.rendered_prompt,
            output = exemplar.text,
        ));
    }

    format!(
        "You improve prompts for language models.\n\
         Objective: {}\n\n\
         Rubric:\n{}\n\n\
         The current prompt (file prompt.txt):\n\
         ----------------------------------------\n\
         {}\n\
         ----------------------------------------\n\n\
         The prompt scores worst on: {}.\n\
         Failing exemplars:\n{}\n\
         Propose a SMALL, surgical edit to prompt.txt that improves the weak criteria.\n\
         Keep every {{{{variable}}}} placeholder. Do not rewrite the whole prompt.\n\n\
         Respond with exactly one <diff> block containing a unified diff against prompt.txt,\n\
         and exactly one <note> block explaining the change:\n\
         <diff>\n--- a/prompt.txt\n+++ b/prompt.txt\n@@ ... @@\n...\n</diff>\n<note>\nWhy this helps.\n</note>",
        experiment.objective,
        rubric,
        prompt_version.body,
        weak.join(", "),
        exemplar_text,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Criterion, Rubric, ScoreScale};
    use crate::provider::{
        BreakerConfig, BreakerRegistry, BucketConfig, BucketRegistry, CacheConfig, MockClient, PricingTable,
        ProviderAdapter, ProviderInfra, ResponseCache, RetryPolicy,
    };
    use edisonstore::now_ms;
    use std::sync::Arc;
    use std::time::Duration;

    fn experiment() -> Experiment {
        Experiment::new(
            "proj-1",
            "answer concisely",
            Rubric {
                criteria: vec![
                    Criterion {
                        name: "accuracy".to_string(),
                        description: String::new(),
                        weight: 0.4,
                        scale: ScoreScale { min: 0, max: 5 },
                    },
                    Criterion {
                        name: "brevity".to_string(),
                        description: String::new(),
                        weight: 0.3,
                        scale: ScoreScale { min: 0, max: 5 },
                    },
                    Criterion {
                        name: "tone".to_string(),
                        description: String::new(),
                        weight: 0.3,
                        scale: ScoreScale { min: 0, max: 5 },
                    },
                ],
            },
        )
    }

    fn output(id: &str) -> Output {
        Output {
            id: id.to_string(),
            model_run_id: "r1".to_string(),
            iteration_id: "i1".to_string(),
            case_id: "c1".to_string(),
            model_config_id: "m1".to_string(),
            status: crate::domain::OutputStatus::Completed,
            rendered_prompt: "rendered".to_string(),
            text: "an answer".to_string(),
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
                rationales: BTreeMap::new(),
            },
        )
    }

    fn adapter_with(replies: Vec<crate::provider::mock::MockReply>) -> ProviderAdapter {
        let infra = Arc::new(ProviderInfra {
            breakers: BreakerRegistry::new(BreakerConfig::default()),
            buckets: BucketRegistry::new(BucketConfig {
                capacity: 100.0,
                refill_per_sec: 100.0,
            }),
            cache: ResponseCache::new(CacheConfig::default()),
            pricing: PricingTable::builtin(),
            retry: RetryPolicy::default(),
            deadline: Duration::from_secs(5),
        });
        ProviderAdapter::new(Arc::new(MockClient::scripted("refiner", replies)), infra)
    }

    fn prompt_body() -> String {
        (1..=8)
            .map(|n| format!("Instruction {n}: handle {{{{x}}}} carefully."))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn good_response(old: &str) -> String {
        let new = old.replace("Instruction 2", "Short instruction 2");
        format!("<diff>\n{}</diff>\n<note>\nTightened instruction 2.\n</note>", diff_between(old, &new))
    }

    #[test]
    fn test_weak_criteria_selection() {
        let outputs = vec![output("o1"), output("o2")];
        let judgments = vec![
            pointwise("o1", &[("accuracy", 5), ("brevity", 1), ("tone", 3)]),
            pointwise("o2", &[("accuracy", 4), ("brevity", 2), ("tone", 2)]),
        ];
        let weak = weak_criteria(&experiment(), &outputs, &judgments);
        assert_eq!(weak, vec!["brevity".to_string(), "tone".to_string()]);
    }

    #[test]
    fn test_extract_contract() {
        let response = "<diff>\n--- a/prompt.txt\n+++ b/prompt.txt\n</diff>\n<note>\nExplanation here.\n</note>";
        let (diff, note) = extract_contract(response).unwrap();
        assert!(diff.contains("--- a/prompt.txt"));
        assert_eq!(note, "Explanation here.\n");
    }

    #[test]
    fn test_extract_contract_rejects_duplicates() {
        let response = "<diff>\nx\n</diff>\n<diff>\ny\n</diff>\n<note>\nz\n</note>";
        assert!(extract_contract(response).is_err());
    }

    #[test]
    fn test_extract_contract_rejects_missing_note() {
        let response = "<diff>\nx\n</diff>";
        assert!(extract_contract(response).is_err());
    }

    #[test]
    fn test_extract_contract_rejects_inline_tags() {
        let response = "<diff>x</diff>\n<note>y</note>";
        assert!(extract_contract(response).is_err());
    }

    #[tokio::test]
    async fn test_refine_produces_pending_suggestion() {
        let body = prompt_body();
        let adapter = adapter_with(vec![Ok(good_response(&body))]);
        let refiner = Refiner::new(RefinerConfig::default());

        let mut version = PromptVersion::seed("exp-1", body);
        version.id = "pv-1".to_string();
        let outputs = vec![output("o1")];
        let judgments = vec![pointwise("o1", &[("accuracy", 4), ("brevity", 1), ("tone", 2)])];

        let suggestion = refiner
            .refine(&adapter, &experiment(), &version, &outputs, &judgments, "i1")
            .await
            .unwrap();

        assert_eq!(suggestion.status, crate::domain::SuggestionStatus::Pending);
        assert_eq!(suggestion.parent_prompt_version_id, "pv-1");
        assert_eq!(suggestion.exemplar_output_ids, vec!["o1".to_string()]);
        assert!(suggestion.note.contains("Tightened"));
        // The staged diff still applies
        assert!(validate_and_apply(&suggestion.diff, &version.body, &DiffLimits::default()).is_ok());
    }

    #[tokio::test]
    async fn test_refine_retries_once_then_invalid() {
        let adapter = adapter_with(vec![
            Ok("no contract here".to_string()),
            Ok("still no contract".to_string()),
        ]);
        let refiner = Refiner::new(RefinerConfig::default());

        let version = PromptVersion::seed("exp-1", prompt_body());
        let outputs = vec![output("o1")];
        let judgments = vec![pointwise("o1", &[("accuracy", 3), ("brevity", 1), ("tone", 2)])];

        let suggestion = refiner
            .refine(&adapter, &experiment(), &version, &outputs, &judgments, "i1")
            .await
            .unwrap();
        assert_eq!(suggestion.status, crate::domain::SuggestionStatus::Invalid);
        assert!(suggestion.invalid_reason.is_some());
    }

    #[tokio::test]
    async fn test_refine_recovers_on_retry() {
        let body = prompt_body();
        let adapter = adapter_with(vec![Ok("garbage".to_string()), Ok(good_response(&body))]);
        let refiner = Refiner::new(RefinerConfig::default());

        let version = PromptVersion::seed("exp-1", body);
        let outputs = vec![output("o1")];
        let judgments = vec![pointwise("o1", &[("accuracy", 3), ("brevity", 1), ("tone", 2)])];

        let suggestion = refiner
            .refine(&adapter, &experiment(), &version, &outputs, &judgments, "i1")
            .await
            .unwrap();
        assert_eq!(suggestion.status, crate::domain::SuggestionStatus::Pending);
    }

    #[test]
    fn test_exemplar_selection_bottom_quantile() {
        let refiner = Refiner::new(RefinerConfig {
            max_exemplars: 2,
            ..Default::default()
        });
        let outputs: Vec<Output> = (0..5).map(|n| output(&format!("o{n}"))).collect();
        let judgments: Vec<Judgment> = (0..5)
            .map(|n| pointwise(&format!("o{n}"), &[("accuracy", 5), ("brevity", n as i64), ("tone", 3)]))
            .collect();

        let weak = vec!["brevity".to_string()];
        let exemplars = refiner.select_exemplars(&weak, &outputs, &judgments);
        // Worst brevity first
        assert_eq!(exemplars[0].output_id, "o0");
        assert!(exemplars.len() <= 2);
    }
}
