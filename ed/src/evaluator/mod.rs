//! Evaluator - scores outputs against the rubric via judge models
//!
//! Judges run with fixed sampling (temperature 0.3, seed 42) and a strict
//! JSON response contract. A parse failure gets exactly one reformulation
//! retry; a second failure records an INVALID judgment that aggregation
//! skips. Pairwise judging is blinded and order-randomization-controlled:
//! two calls with swapped presentation order, disagreement recorded as a
//! tie.

use tracing::{debug, warn};

mod datagen;
mod verdict;

pub use datagen::generate_cases;
pub use verdict::{
    JUDGE_SEED, JUDGE_TEMPERATURE, PairwiseVerdict, PointwiseVerdict, parse_pairwise, parse_pointwise,
    strip_code_fences,
};

use crate::domain::{Case, Experiment, JudgeConfig, Judgment, Output, PairWinner, Verdict};
use crate::error::Result;
use crate::provider::{ChatMessage, ChatOptions, ProviderAdapter};
use crate::safety::SafetyScanner;

const REFORMAT_INSTRUCTION: &str =
    "Your previous reply could not be parsed. Respond again with ONLY the JSON object, no prose, no code fences.";

/// Judge-side evaluation logic
pub struct Evaluator {
    scanner: std::sync::Arc<SafetyScanner>,
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new(std::sync::Arc::new(SafetyScanner::default()))
    }
}

impl Evaluator {
    pub fn new(scanner: std::sync::Arc<SafetyScanner>) -> Self {
        Self { scanner }
    }

    fn judge_options() -> ChatOptions {
        ChatOptions::default()
            .with_temperature(JUDGE_TEMPERATURE)
            .with_seed(JUDGE_SEED)
            .json_mode()
    }

    /// Score one output against the rubric with one pointwise judge
    ///
    /// Provider failures propagate (the judge job retries); parse failures
    /// degrade to an INVALID judgment after the single retry.
    pub async fn judge_pointwise(
        &self,
        adapter: &ProviderAdapter,
        judge: &JudgeConfig,
        experiment: &Experiment,
        case: &Case,
        output: &Output,
    ) -> Result<Judgment> {
        debug!(judge = %judge.id, output = %output.id, "judge_pointwise");
        let prompt = build_pointwise_prompt(experiment, case, &output.text);
        let text = self.call_once(adapter, &prompt).await?;

        let judgment = match parse_and_retry(
            &text,
            |t| parse_pointwise(t, &experiment.rubric),
            || async {
                let retry_prompt = format!("{prompt}\n\n{REFORMAT_INSTRUCTION}");
                self.call_once(adapter, &retry_prompt).await
            },
        )
        .await?
        {
            Ok(parsed) => {
                let rationale_text: String = parsed.rationales.values().cloned().collect::<Vec<_>>().join("\n");
                let mut safety = self.scanner.scan(&rationale_text);
                safety.merge(&parsed.safety_flags);
                Judgment::pointwise(
                    &output.iteration_id,
                    &judge.id,
                    &output.id,
                    Verdict::Pointwise {
                        scores: parsed.scores,
                        rationales: parsed.rationales,
                    },
                )
                .with_safety(safety)
            }
            Err(parse_error) => {
                warn!(judge = %judge.id, output = %output.id, %parse_error, "recording INVALID pointwise judgment");
                Judgment::pointwise(
                    &output.iteration_id,
                    &judge.id,
                    &output.id,
                    Verdict::Invalid { error: parse_error },
                )
            }
        };
        Ok(judgment)
    }

    /// Compare two outputs on the same case with one pairwise judge
    ///
    /// Issues two blinded calls with swapped order. The agreed winner is
    /// adopted; any disagreement on a non-tie outcome records a tie.
    pub async fn judge_pairwise(
        &self,
        adapter: &ProviderAdapter,
        judge: &JudgeConfig,
        experiment: &Experiment,
        case: &Case,
        output_a: &Output,
        output_b: &Output,
    ) -> Result<Judgment> {
        debug!(judge = %judge.id, a = %output_a.id, b = %output_b.id, "judge_pairwise");

        let forward = self
            .pairwise_call(adapter, experiment, case, &output_a.text, &output_b.text)
            .await?;
        let reversed = self
            .pairwise_call(adapter, experiment, case, &output_b.text, &output_a.text)
            .await?;

        let judgment = match (forward, reversed) {
            (Ok(first), Ok(second)) => {
                // Map the swapped call back into (a, b) terms
                let first_pick = first.winner;
                let second_pick = match second.winner {
                    PairWinner::A => PairWinner::B,
                    PairWinner::B => PairWinner::A,
                    PairWinner::Tie => PairWinner::Tie,
                };
                let winner = if first_pick == second_pick {
                    first_pick
                } else {
                    PairWinner::Tie
                };

                let mut reasons = first.reasons;
                reasons.extend(second.reasons);
                Judgment::pairwise(
                    &output_a.iteration_id,
                    &judge.id,
                    &output_a.id,
                    &output_b.id,
                    Verdict::Pairwise {
                        winner,
                        reasons,
                        score_a: (first.score_a + second.score_b) / 2.0,
                        score_b: (first.score_b + second.score_a) / 2.0,
                    },
                )
            }
            (Err(parse_error), _) | (_, Err(parse_error)) => {
                warn!(judge = %judge.id, %parse_error, "recording INVALID pairwise judgment");
                Judgment::pairwise(
                    &output_a.iteration_id,
                    &judge.id,
                    &output_a.id,
                    &output_b.id,
                    Verdict::Invalid { error: parse_error },
                )
            }
        };
        Ok(judgment)
    }

    async fn pairwise_call(
        &self,
        adapter: &ProviderAdapter,
        experiment: &Experiment,
        case: &Case,
        first_text: &str,
        second_text: &str,
    ) -> Result<std::result::Result<PairwiseVerdict, String>> {
        let prompt = build_pairwise_prompt(experiment, case, first_text, second_text);
        let text = self.call_once(adapter, &prompt).await?;
        parse_and_retry(&text, parse_pairwise, || async {
            let retry_prompt = format!("{prompt}\n\n{REFORMAT_INSTRUCTION}");
            self.call_once(adapter, &retry_prompt).await
        })
        .await
    }

    async fn call_once(&self, adapter: &ProviderAdapter, prompt: &str) -> Result<String> {
        let messages = [ChatMessage::user(prompt)];
        let response = adapter.chat(&messages, &Self::judge_options()).await?;
        Ok(response.text)
    }
}

/// Try parsing; on failure run the retry call once and parse that
async fn parse_and_retry<T, P, R, Fut>(
    text: &str,
    parse: P,
    retry: R,
) -> Result<std::result::Result<T, String>>
where
    P: Fn(&str) -> std::result::Result<T, String>,
    R: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<String>>,
{
    match parse(text) {
        Ok(parsed) => Ok(Ok(parsed)),
        Err(first_error) => {
            debug!(%first_error, "judge response unparseable, retrying with reformat instruction");
            let retry_text = retry().await?;
            match parse(&retry_text) {
                Ok(parsed) => Ok(Ok(parsed)),
                Err(second_error) => Ok(Err(format!("{first_error}; retry: {second_error}"))),
            }
        }
    }
}

fn render_rubric(experiment: &Experiment) -> String {
    experiment
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
        .join("\n")
}

fn render_case_input(case: &Case) -> String {
    case.input
        .iter()
        .map(|(k, v)| format!("{k}: {v}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Judge prompt for a single output; model identities are never included
fn build_pointwise_prompt(experiment: &Experiment, case: &Case, output_text: &str) -> String {
    let mut expected = String::new();
    if let Some(reference) = &case.expected {
        expected = format!("\nReference output:\n{reference}\n");
    }
    format!(
        "You are an impartial evaluator.\n\
         Objective: {}\n\n\
         Rubric:\n{}\n\n\
         Case input:\n{}\n{}\n\
         Candidate output:\n{}\n\n\
         Score the candidate on every rubric criterion. Respond with ONLY a JSON object:\n\
         {{\"scores\": {{<criterion>: <integer>}}, \"rationales\": {{<criterion>: <short string>}}, \
         \"safetyFlags\": {{\"policyViolation\": bool, \"piiDetected\": bool, \"toxicContent\": bool, \"jailbreakAttempt\": bool}}}}",
        experiment.objective,
        render_rubric(experiment),
        render_case_input(case),
        expected,
        output_text,
    )
}

/// Blinded comparison prompt; candidates appear only as A and B
fn build_pairwise_prompt(experiment: &Experiment, case: &Case, text_a: &str, text_b: &str) -> String {
    format!(
        "You are an impartial evaluator comparing two candidate outputs.\n\
         Objective: {}\n\n\
         Rubric:\n{}\n\n\
         Case input:\n{}\n\n\
         Candidate A:\n{}\n\n\
         Candidate B:\n{}\n\n\
         Which candidate better satisfies the objective and rubric? Respond with ONLY a JSON object:\n\
         {{\"winner\": \"A\" | \"B\" | \"tie\", \"reasons\": [<string>], \"scores\": {{\"A\": <0..1>, \"B\": <0..1>}}}}",
        experiment.objective,
        render_rubric(experiment),
        render_case_input(case),
        text_a,
        text_b,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Criterion, Rubric, ScoreScale};
    use crate::provider::{
        BreakerConfig, BreakerRegistry, BucketConfig, BucketRegistry, CacheConfig, MockClient, PricingTable,
        ProviderInfra, ResponseCache, RetryPolicy,
    };
    use std::collections::BTreeMap as Map;
    use std::sync::Arc;
    use std::time::Duration;

    fn experiment() -> Experiment {
        Experiment::new(
            "proj-1",
            "Summarize accurately",
            Rubric {
                criteria: vec![
                    Criterion {
                        name: "accuracy".to_string(),
                        description: "factually correct".to_string(),
                        weight: 0.5,
                        scale: ScoreScale { min: 0, max: 5 },
                    },
                    Criterion {
                        name: "clarity".to_string(),
                        description: String::new(),
                        weight: 0.5,
                        scale: ScoreScale { min: 0, max: 5 },
                    },
                ],
            },
        )
    }

    fn case() -> Case {
        let mut input = Map::new();
        input.insert("x".to_string(), "hello".to_string());
        Case::new(input)
    }

    fn output(id: &str, text: &str) -> Output {
        Output {
            id: id.to_string(),
            model_run_id: "r1".to_string(),
            iteration_id: "i1".to_string(),
            case_id: "c1".to_string(),
            model_config_id: "m1".to_string(),
            status: crate::domain::OutputStatus::Completed,
            rendered_prompt: String::new(),
            text: text.to_string(),
            prompt_tokens: 1,
            completion_tokens: 1,
            latency_ms: 1,
            finish_reason: "stop".to_string(),
            safety: None,
            skip_reason: None,
            created_at: edisonstore::now_ms(),
        }
    }

    fn adapter_for(replies: Vec<crate::provider::mock::MockReply>) -> (ProviderAdapter, Arc<MockClient>) {
        let client = Arc::new(MockClient::scripted("judge-1", replies));
        let infra = Arc::new(ProviderInfra {
            breakers: BreakerRegistry::new(BreakerConfig::default()),
            buckets: BucketRegistry::new(BucketConfig {
                capacity: 1000.0,
                refill_per_sec: 1000.0,
            }),
            cache: ResponseCache::new(CacheConfig::default()),
            pricing: PricingTable::builtin(),
            retry: RetryPolicy {
                max_attempts: 1,
                initial_delay: Duration::from_millis(1),
                backoff_multiplier: 1.0,
                max_delay: Duration::from_millis(1),
            },
            deadline: Duration::from_secs(5),
        });
        (ProviderAdapter::new(client.clone(), infra), client)
    }

    fn judge() -> JudgeConfig {
        JudgeConfig::new("exp-1", crate::domain::JudgeMode::Pointwise, "mock", "judge-1")
    }

    #[tokio::test]
    async fn test_pointwise_valid_verdict() {
        let (adapter, _) = adapter_for(vec![Ok(
            r#"{"scores": {"accuracy": 4, "clarity": 5}, "rationales": {"accuracy": "good"}}"#.to_string(),
        )]);
        let evaluator = Evaluator::default();

        let judgment = evaluator
            .judge_pointwise(&adapter, &judge(), &experiment(), &case(), &output("o1", "hi"))
            .await
            .unwrap();

        match &judgment.verdict {
            Verdict::Pointwise { scores, .. } => {
                assert_eq!(scores["accuracy"], 4);
                assert_eq!(scores["clarity"], 5);
            }
            other => panic!("expected pointwise verdict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_pointwise_fenced_json_is_parsed() {
        let (adapter, _) = adapter_for(vec![Ok(
            "```json\n{\"scores\": {\"accuracy\": 2, \"clarity\": 2}}\n```".to_string()
        )]);
        let judgment = Evaluator::default()
            .judge_pointwise(&adapter, &judge(), &experiment(), &case(), &output("o1", "hi"))
            .await
            .unwrap();
        assert!(judgment.verdict.is_valid());
    }

    #[tokio::test]
    async fn test_pointwise_retry_then_invalid() {
        let (adapter, client) = adapter_for(vec![
            Ok("not json at all".to_string()),
            Ok("still not json".to_string()),
        ]);
        let judgment = Evaluator::default()
            .judge_pointwise(&adapter, &judge(), &experiment(), &case(), &output("o1", "hi"))
            .await
            .unwrap();

        assert!(matches!(judgment.verdict, Verdict::Invalid { .. }));
        // Exactly one reformulation retry
        assert_eq!(client.call_count(), 2);
    }

    #[tokio::test]
    async fn test_pointwise_retry_recovers() {
        let (adapter, client) = adapter_for(vec![
            Ok("garbage".to_string()),
            Ok(r#"{"scores": {"accuracy": 3, "clarity": 3}}"#.to_string()),
        ]);
        let judgment = Evaluator::default()
            .judge_pointwise(&adapter, &judge(), &experiment(), &case(), &output("o1", "hi"))
            .await
            .unwrap();
        assert!(judgment.verdict.is_valid());
        assert_eq!(client.call_count(), 2);
    }

    #[tokio::test]
    async fn test_pairwise_agreement_adopts_winner() {
        // Forward call picks A; reversed call picks B, which is the same
        // underlying output
        let (adapter, _) = adapter_for(vec![
            Ok(r#"{"winner": "A", "scores": {"A": 0.9, "B": 0.2}}"#.to_string()),
            Ok(r#"{"winner": "B", "scores": {"A": 0.3, "B": 0.8}}"#.to_string()),
        ]);
        let judgment = Evaluator::default()
            .judge_pairwise(
                &adapter,
                &judge(),
                &experiment(),
                &case(),
                &output("oa", "first"),
                &output("ob", "second"),
            )
            .await
            .unwrap();

        match &judgment.verdict {
            Verdict::Pairwise { winner, score_a, .. } => {
                assert_eq!(*winner, PairWinner::A);
                // (0.9 + 0.8) / 2
                assert!((score_a - 0.85).abs() < 1e-9);
            }
            other => panic!("expected pairwise verdict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_pairwise_disagreement_is_tie() {
        // Forward picks A; reversed also picks A, i.e. the other output
        let (adapter, _) = adapter_for(vec![
            Ok(r#"{"winner": "A"}"#.to_string()),
            Ok(r#"{"winner": "A"}"#.to_string()),
        ]);
        let judgment = Evaluator::default()
            .judge_pairwise(
                &adapter,
                &judge(),
                &experiment(),
                &case(),
                &output("oa", "first"),
                &output("ob", "second"),
            )
            .await
            .unwrap();

        match &judgment.verdict {
            Verdict::Pairwise { winner, .. } => assert_eq!(*winner, PairWinner::Tie),
            other => panic!("expected pairwise verdict, got {other:?}"),
        }
    }

    #[test]
    fn test_pairwise_prompt_is_blinded() {
        let prompt = build_pairwise_prompt(&experiment(), &case(), "text one", "text two");
        assert!(prompt.contains("Candidate A"));
        assert!(prompt.contains("Candidate B"));
        assert!(!prompt.contains("gpt"));
        assert!(!prompt.contains("claude"));
        assert!(!prompt.contains("m1"));
    }
}
