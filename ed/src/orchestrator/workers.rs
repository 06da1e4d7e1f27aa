//! Execute and judge job handlers
//!
//! Each phase hands a context to a worker pool; the handlers are idempotent
//! (replays detect the existing output/judgment and ack) and cooperative
//! (control flag checked at case boundaries only).

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use edisonstore::now_ms;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::control::{ControlFlag, ControlSignal};
use crate::domain::{
    Case, Dataset, Experiment, JudgeConfig, JudgmentTarget, ModelConfig, Output, OutputStatus, PromptVersion,
    generate_id,
};
use crate::error::EdisonError;
use crate::evaluator::Evaluator;
use crate::events::IterationEmitter;
use crate::provider::{ChatMessage, ChatOptions, ChatResponse, ProviderAdapter};
use crate::render::PromptRenderer;
use crate::safety::SafetyScanner;
use crate::scheduler::{Job, JobOutcome};
use crate::state::StateManager;
use std::sync::Arc;

/// Execute-run job payload: one case against one model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutePayload {
    pub model_run_id: String,
    pub model_config_id: String,
    pub case_id: String,
}

/// Judge job payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JudgePayload {
    Pointwise {
        output_id: String,
        judge_config_id: String,
    },
    Pairwise {
        output_a: String,
        output_b: String,
        case_id: String,
        judge_config_id: String,
    },
}

/// Per-run accounting accumulated off the hot path and persisted once at
/// phase reconciliation
#[derive(Debug, Default, Clone)]
pub struct RunTally {
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub total: usize,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_usd: f64,
}

impl RunTally {
    pub fn settled(&self) -> usize {
        self.completed + self.skipped + self.failed
    }
}

/// Shared context for execute-run workers
pub struct ExecuteContext {
    pub state: StateManager,
    pub experiment: Experiment,
    pub prompt: PromptVersion,
    pub dataset: Dataset,
    /// model_config_id -> (config, adapter)
    pub adapters: HashMap<String, (ModelConfig, ProviderAdapter)>,
    pub renderer: PromptRenderer,
    pub scanner: Arc<SafetyScanner>,
    pub emitter: IterationEmitter,
    pub control: Arc<ControlFlag>,
    pub iteration_id: String,
    pub tallies: Mutex<HashMap<String, RunTally>>,
    /// Runs aborted by a permanent provider failure
    pub aborted_runs: Mutex<HashSet<String>>,
}

impl ExecuteContext {
    pub fn init_tally(&self, model_run_id: &str, total: usize) {
        let mut tallies = self.tallies.lock().unwrap_or_else(|e| e.into_inner());
        tallies.insert(
            model_run_id.to_string(),
            RunTally {
                total,
                ..Default::default()
            },
        );
    }

    pub fn tally_snapshot(&self) -> HashMap<String, RunTally> {
        self.tallies.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_aborted(&self, model_run_id: &str) -> bool {
        self.aborted_runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(model_run_id)
    }

    fn abort_run(&self, model_run_id: &str) {
        self.aborted_runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(model_run_id.to_string());
    }

    fn bump(&self, model_run_id: &str, status: OutputStatus, response: Option<(&ChatResponse, f64)>) {
        let mut tallies = self.tallies.lock().unwrap_or_else(|e| e.into_inner());
        let tally = tallies.entry(model_run_id.to_string()).or_default();
        match status {
            OutputStatus::Completed => tally.completed += 1,
            OutputStatus::Skipped => tally.skipped += 1,
            OutputStatus::Failed => tally.failed += 1,
        }
        if let Some((response, cost)) = response {
            tally.prompt_tokens += response.prompt_tokens;
            tally.completion_tokens += response.completion_tokens;
            tally.cost_usd += cost;
        }
        let settled = tally.settled();
        let total = tally.total;
        drop(tallies);
        self.emitter.run_progress(model_run_id, settled, total);
    }

    fn bump_replayed(&self, model_run_id: &str, existing: &Output) {
        let mut tallies = self.tallies.lock().unwrap_or_else(|e| e.into_inner());
        let tally = tallies.entry(model_run_id.to_string()).or_default();
        match existing.status {
            OutputStatus::Completed => tally.completed += 1,
            OutputStatus::Skipped => tally.skipped += 1,
            OutputStatus::Failed => tally.failed += 1,
        }
        tally.prompt_tokens += existing.prompt_tokens;
        tally.completion_tokens += existing.completion_tokens;
        let settled = tally.settled();
        let total = tally.total;
        drop(tallies);
        self.emitter.run_progress(model_run_id, settled, total);
    }

    /// One execute-run job
    pub async fn handle(&self, job: Job) -> JobOutcome {
        let payload: ExecutePayload = match serde_json::from_value(job.payload.clone()) {
            Ok(payload) => payload,
            Err(e) => return JobOutcome::Fatal(format!("malformed execute payload: {e}")),
        };

        // Cooperative cancellation at the case boundary; idempotency makes
        // the skipped work safe to replay on resume
        if self.control.signal() != ControlSignal::Run {
            debug!(case_id = %payload.case_id, "execute worker observed pause/cancel, leaving case for resume");
            return JobOutcome::Done;
        }

        match self
            .state
            .get_output(&self.iteration_id, &payload.case_id, &payload.model_config_id)
            .await
        {
            Ok(Some(existing)) => {
                debug!(case_id = %payload.case_id, "output already persisted, replay acknowledged");
                // Restore the stored counters so resumed runs tally fully
                self.bump_replayed(&payload.model_run_id, &existing);
                return JobOutcome::Done;
            }
            Ok(None) => {}
            Err(e) => return JobOutcome::Retry(e.to_string()),
        }

        if self.is_aborted(&payload.model_run_id) {
            return self
                .record_nonresult(&payload, OutputStatus::Skipped, "model run aborted")
                .await;
        }

        let Some(case) = self.dataset.case(&payload.case_id) else {
            return JobOutcome::Fatal(format!("case {} not in dataset", payload.case_id));
        };
        let Some((config, adapter)) = self.adapters.get(&payload.model_config_id) else {
            return JobOutcome::Fatal(format!("no adapter for model config {}", payload.model_config_id));
        };

        let rendered = match self.renderer.render(&self.prompt.body, &case.input) {
            Ok(rendered) => rendered,
            Err(e) => {
                warn!(case_id = %case.id, error = %e, "case skipped: template rendering failed");
                return self.record_nonresult(&payload, OutputStatus::Skipped, &e.to_string()).await;
            }
        };

        let messages = build_messages(&self.prompt, &rendered);
        let options = chat_options(config);

        match adapter.chat(&messages, &options).await {
            Ok(response) => {
                let cost = match adapter.cost_of(&response) {
                    Ok(cost) => cost,
                    Err(e) => return JobOutcome::Fatal(e.to_string()),
                };
                let flags = self.scanner.scan(&response.text);
                let output = Output {
                    id: generate_id("out", &case.id),
                    model_run_id: payload.model_run_id.clone(),
                    iteration_id: self.iteration_id.clone(),
                    case_id: case.id.clone(),
                    model_config_id: config.id.clone(),
                    status: OutputStatus::Completed,
                    rendered_prompt: rendered,
                    text: response.text.clone(),
                    prompt_tokens: response.prompt_tokens,
                    completion_tokens: response.completion_tokens,
                    latency_ms: response.latency_ms,
                    finish_reason: response.finish_reason.to_string(),
                    safety: Some(flags),
                    skip_reason: None,
                    created_at: now_ms(),
                };
                let cost_record = crate::domain::CostRecord::new(
                    &self.experiment.project_id,
                    &config.provider,
                    &config.model,
                    response.prompt_tokens,
                    response.completion_tokens,
                    cost,
                );
                // Cache hits carry no cost record
                let cost_ref = (!response.cached).then_some(&cost_record);
                if let Err(e) = self.state.insert_output(&output, cost_ref).await {
                    return JobOutcome::Retry(e.to_string());
                }
                self.bump(&payload.model_run_id, OutputStatus::Completed, Some((&response, cost)));
                JobOutcome::Done
            }
            Err(provider_error) => {
                let error: EdisonError = provider_error.into();
                if error.is_retryable() {
                    return JobOutcome::Retry(error.to_string());
                }
                match &error {
                    EdisonError::AuthFailure(_) | EdisonError::ProviderPermanent(_) => {
                        warn!(run = %payload.model_run_id, error = %error, "permanent provider failure, aborting model run");
                        self.abort_run(&payload.model_run_id);
                        self.record_nonresult(&payload, OutputStatus::Failed, &error.to_string())
                            .await
                    }
                    _ => JobOutcome::Fatal(error.to_string()),
                }
            }
        }
    }

    /// Record a Skipped or Failed output so case accounting stays exact
    pub async fn record_nonresult(&self, payload: &ExecutePayload, status: OutputStatus, reason: &str) -> JobOutcome {
        let output = Output {
            id: generate_id("out", &payload.case_id),
            model_run_id: payload.model_run_id.clone(),
            iteration_id: self.iteration_id.clone(),
            case_id: payload.case_id.clone(),
            model_config_id: payload.model_config_id.clone(),
            status,
            rendered_prompt: String::new(),
            text: String::new(),
            prompt_tokens: 0,
            completion_tokens: 0,
            latency_ms: 0,
            finish_reason: "none".to_string(),
            safety: None,
            skip_reason: Some(reason.to_string()),
            created_at: now_ms(),
        };
        if let Err(e) = self.state.insert_output(&output, None).await {
            return JobOutcome::Retry(e.to_string());
        }
        self.bump(&payload.model_run_id, status, None);
        JobOutcome::Done
    }
}

/// System preamble and few-shot examples wrap the rendered case prompt
fn build_messages(prompt: &PromptVersion, rendered: &str) -> Vec<ChatMessage> {
    let mut messages = Vec::new();
    if let Some(preamble) = &prompt.system_preamble {
        messages.push(ChatMessage::system(preamble));
    }
    for example in &prompt.few_shot {
        messages.push(ChatMessage::user(&example.input));
        messages.push(ChatMessage::assistant(&example.output));
    }
    messages.push(ChatMessage::user(rendered));
    messages
}

fn chat_options(config: &ModelConfig) -> ChatOptions {
    ChatOptions {
        temperature: config.params.temperature,
        max_tokens: config.params.max_tokens,
        top_p: config.params.top_p,
        frequency_penalty: config.params.frequency_penalty,
        presence_penalty: config.params.presence_penalty,
        seed: config.params.seed,
        stop: config.params.stop.clone(),
        ..Default::default()
    }
}

/// Shared context for judge workers
pub struct JudgeContext {
    pub state: StateManager,
    pub experiment: Experiment,
    pub dataset: Dataset,
    /// judge_config_id -> (config, adapter)
    pub adapters: HashMap<String, (JudgeConfig, ProviderAdapter)>,
    /// output id -> output (completed outputs of this iteration)
    pub outputs: HashMap<String, Output>,
    pub evaluator: Arc<Evaluator>,
    pub emitter: IterationEmitter,
    pub control: Arc<ControlFlag>,
    pub settled: AtomicUsize,
    pub total: usize,
}

impl JudgeContext {
    fn case_for(&self, output: &Output) -> Option<&Case> {
        self.dataset.case(&output.case_id)
    }

    fn bump(&self) {
        let settled = self.settled.fetch_add(1, Ordering::SeqCst) + 1;
        self.emitter.judge_progress(settled, self.total);
    }

    /// One judge job, pointwise or pairwise
    pub async fn handle(&self, job: Job) -> JobOutcome {
        let payload: JudgePayload = match serde_json::from_value(job.payload.clone()) {
            Ok(payload) => payload,
            Err(e) => return JobOutcome::Fatal(format!("malformed judge payload: {e}")),
        };

        if self.control.signal() != ControlSignal::Run {
            return JobOutcome::Done;
        }

        let result = match &payload {
            JudgePayload::Pointwise {
                output_id,
                judge_config_id,
            } => self.handle_pointwise(output_id, judge_config_id).await,
            JudgePayload::Pairwise {
                output_a,
                output_b,
                judge_config_id,
                ..
            } => self.handle_pairwise(output_a, output_b, judge_config_id).await,
        };

        match result {
            Ok(()) => {
                self.bump();
                JobOutcome::Done
            }
            Err(error) if error.is_retryable() => JobOutcome::Retry(error.to_string()),
            Err(error) => JobOutcome::Fatal(error.to_string()),
        }
    }

    async fn handle_pointwise(&self, output_id: &str, judge_config_id: &str) -> crate::error::Result<()> {
        let key = JudgmentTarget::pointwise_unique_key(output_id, judge_config_id);
        if self.state.judgment_exists(&key).await? {
            debug!(output_id, judge_config_id, "judgment already persisted, replay acknowledged");
            return Ok(());
        }

        let (judge, adapter) = self
            .adapters
            .get(judge_config_id)
            .ok_or_else(|| EdisonError::NotFound(format!("judge adapter {judge_config_id}")))?;
        let output = self
            .outputs
            .get(output_id)
            .ok_or_else(|| EdisonError::NotFound(format!("output {output_id}")))?;
        let case = self
            .case_for(output)
            .ok_or_else(|| EdisonError::NotFound(format!("case {}", output.case_id)))?;

        let judgment = self
            .evaluator
            .judge_pointwise(adapter, judge, &self.experiment, case, output)
            .await?;
        self.state.insert_judgment(&judgment).await?;
        Ok(())
    }

    async fn handle_pairwise(&self, output_a: &str, output_b: &str, judge_config_id: &str) -> crate::error::Result<()> {
        let key = JudgmentTarget::pairwise_unique_key(output_a, output_b, judge_config_id);
        if self.state.judgment_exists(&key).await? {
            return Ok(());
        }

        let (judge, adapter) = self
            .adapters
            .get(judge_config_id)
            .ok_or_else(|| EdisonError::NotFound(format!("judge adapter {judge_config_id}")))?;
        let first = self
            .outputs
            .get(output_a)
            .ok_or_else(|| EdisonError::NotFound(format!("output {output_a}")))?;
        let second = self
            .outputs
            .get(output_b)
            .ok_or_else(|| EdisonError::NotFound(format!("output {output_b}")))?;
        let case = self
            .case_for(first)
            .ok_or_else(|| EdisonError::NotFound(format!("case {}", first.case_id)))?;

        let judgment = self
            .evaluator
            .judge_pairwise(adapter, judge, &self.experiment, case, first, second)
            .await?;
        self.state.insert_judgment(&judgment).await?;
        Ok(())
    }
}
