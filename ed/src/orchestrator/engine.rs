//! IterationEngine - drives one iteration through its phases
//!
//! PENDING -> EXECUTING -> JUDGING -> AGGREGATING -> REFINING -> REVIEWING,
//! with pause/resume at case boundaries and cancellation anywhere between
//! phases. Every status write goes through the store first; events are
//! published only after the commit succeeds.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;

use edisonstore::now_ms;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::control::{ControlFlag, ControlSignal};
use super::workers::{ExecuteContext, ExecutePayload, JudgeContext, JudgePayload};
use crate::aggregate::{Aggregator, IterationMetrics};
use crate::budget::{CostAlertGate, SPEND_WINDOW_MS, StopDecision, StopReason, post_iteration_gate};
use crate::domain::{
    CostRecord, Dataset, Experiment, Iteration, IterationStatus, JudgeConfig, JudgeMode, ModelConfig, ModelRun,
    ModelRunStatus, Output, OutputStatus, PromptVersion,
};
use crate::error::{EdisonError, Result};
use crate::evaluator::Evaluator;
use crate::events::{EdisonEvent, EventBus, IterationEmitter};
use crate::provider::{ProviderAdapter, ProviderRegistry, UsageSink};
use crate::refiner::Refiner;
use crate::render::PromptRenderer;
use crate::safety::SafetyScanner;
use crate::scheduler::{EnqueueOptions, JobQueue, Priority, QueueKind, SchedulerConfig, WorkerPool};
use crate::state::StateManager;

/// How an engine run ended
#[derive(Debug)]
pub enum IterationOutcome {
    /// Terminal COMPLETED; `stop` is the stop rule that fired, if any
    Completed {
        stop: Option<StopReason>,
        metrics: Option<IterationMetrics>,
    },
    /// REVIEWING: a suggestion awaits a human decision
    AwaitingReview { suggestion_id: String },
    Paused,
    Cancelled,
    Failed { reason: String },
}

/// Everything an engine run needs
pub struct EngineParams {
    pub iteration_id: String,
    pub experiment: Experiment,
    pub prompt_version: PromptVersion,
    pub dataset: Dataset,
    pub model_configs: Vec<ModelConfig>,
    pub judge_configs: Vec<JudgeConfig>,
    pub state: StateManager,
    pub registry: Arc<ProviderRegistry>,
    pub bus: Arc<EventBus>,
    pub scheduler: SchedulerConfig,
    pub refiner: Option<Arc<Refiner>>,
    pub scanner: Arc<SafetyScanner>,
    pub control: Arc<ControlFlag>,
    pub alert: Arc<CostAlertGate>,
    /// Optional iteration-wide deadline
    pub deadline: Option<Duration>,
}

/// Writes sink usage into the cost ledger off the call path
struct LedgerUsageSink {
    project_id: String,
    tx: mpsc::UnboundedSender<CostRecord>,
}

impl UsageSink for LedgerUsageSink {
    fn record(&self, provider: &str, model: &str, prompt_tokens: u64, completion_tokens: u64, amount_usd: f64) {
        let record = CostRecord::new(
            &self.project_id,
            provider,
            model,
            prompt_tokens,
            completion_tokens,
            amount_usd,
        );
        let _ = self.tx.send(record);
    }
}

enum PhaseExit {
    Continue,
    Paused,
    Cancelled,
    AllRunsFailed,
}

/// The per-iteration orchestration engine
pub struct IterationEngine {
    iteration_id: String,
    experiment: Experiment,
    prompt_version: PromptVersion,
    dataset: Dataset,
    model_configs: Vec<ModelConfig>,
    judge_configs: Vec<JudgeConfig>,
    state: StateManager,
    registry: Arc<ProviderRegistry>,
    emitter: IterationEmitter,
    bus: Arc<EventBus>,
    evaluator: Arc<Evaluator>,
    aggregator: Aggregator,
    refiner: Option<Arc<Refiner>>,
    scanner: Arc<SafetyScanner>,
    scheduler: SchedulerConfig,
    control: Arc<ControlFlag>,
    alert: Arc<CostAlertGate>,
    deadline: Option<Duration>,
    usage_tx: mpsc::UnboundedSender<CostRecord>,
    _usage_drain: tokio::task::JoinHandle<()>,
}

impl IterationEngine {
    pub fn new(params: EngineParams) -> Self {
        let emitter = params.bus.emitter_for(&params.iteration_id);
        let (usage_tx, mut usage_rx) = mpsc::unbounded_channel::<CostRecord>();
        let drain_state = params.state.clone();
        let usage_drain = tokio::spawn(async move {
            while let Some(record) = usage_rx.recv().await {
                if let Err(e) = drain_state.append_cost(&record).await {
                    warn!(error = %e, "failed to append usage cost record");
                }
            }
        });

        Self {
            iteration_id: params.iteration_id,
            experiment: params.experiment,
            prompt_version: params.prompt_version,
            dataset: params.dataset,
            model_configs: params.model_configs,
            judge_configs: params.judge_configs,
            state: params.state,
            registry: params.registry,
            emitter,
            bus: params.bus,
            evaluator: Arc::new(Evaluator::new(params.scanner.clone())),
            aggregator: Aggregator::default(),
            refiner: params.refiner,
            scanner: params.scanner,
            scheduler: params.scheduler,
            control: params.control,
            alert: params.alert,
            deadline: params.deadline,
            usage_tx,
            _usage_drain: usage_drain,
        }
    }

    pub fn control(&self) -> Arc<ControlFlag> {
        self.control.clone()
    }

    /// Run the iteration to its next resting point
    ///
    /// Resting points: a terminal status, REVIEWING, or PAUSED. Call again
    /// after a resume to continue from persisted state.
    pub async fn run(&self) -> Result<IterationOutcome> {
        info!(iteration_id = %self.iteration_id, "iteration engine starting");
        let outcome = match self.deadline {
            Some(deadline) => match tokio::time::timeout(deadline, self.run_phases()).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    // Stop dispatching further jobs for this iteration
                    self.control.cancel();
                    return self.fail("deadline exceeded").await;
                }
            },
            None => self.run_phases().await,
        };

        match outcome {
            Ok(outcome) => Ok(outcome),
            Err(error) => {
                warn!(iteration_id = %self.iteration_id, %error, "iteration engine failed");
                self.fail(&error.to_string()).await
            }
        }
    }

    async fn fail(&self, reason: &str) -> Result<IterationOutcome> {
        // Best effort: the iteration may already be terminal
        match self.state.transition_iteration(&self.iteration_id, IterationStatus::Failed).await {
            Ok((from, mut iteration)) => {
                iteration.set_error(reason);
                self.state.update_iteration(&iteration).await?;
                self.emitter.status_changed(from, IterationStatus::Failed);
                self.emitter.error(reason, false);
                self.emitter.completed(IterationStatus::Failed, None);
            }
            Err(e) => debug!(error = %e, "could not demote iteration to failed"),
        }
        Ok(IterationOutcome::Failed {
            reason: reason.to_string(),
        })
    }

    async fn transition(&self, to: IterationStatus) -> Result<Iteration> {
        let (from, iteration) = self.state.transition_iteration(&self.iteration_id, to).await?;
        self.emitter.status_changed(from, to);
        Ok(iteration)
    }

    async fn run_phases(&self) -> Result<IterationOutcome> {
        let iteration = self.state.get_iteration_required(&self.iteration_id).await?;

        let mut status = match iteration.status {
            IterationStatus::Pending => {
                let iteration = self.transition(IterationStatus::Executing).await?;
                self.emitter.started(&self.experiment.id, iteration.number);
                IterationStatus::Executing
            }
            IterationStatus::Paused => {
                let target = if self.execute_work_remaining().await? {
                    IterationStatus::Executing
                } else {
                    IterationStatus::Judging
                };
                self.transition(target).await?;
                target
            }
            other => {
                return Err(EdisonError::Conflict(format!(
                    "iteration {} cannot run from status {other}",
                    self.iteration_id
                )));
            }
        };

        if status == IterationStatus::Executing {
            match self.execute_phase().await? {
                PhaseExit::Continue => {
                    self.transition(IterationStatus::Judging).await?;
                    status = IterationStatus::Judging;
                }
                PhaseExit::Paused => {
                    self.transition(IterationStatus::Paused).await?;
                    return Ok(IterationOutcome::Paused);
                }
                PhaseExit::Cancelled => return self.cancel().await,
                PhaseExit::AllRunsFailed => {
                    return self.fail("all model runs failed").await;
                }
            }
        }

        if status == IterationStatus::Judging {
            match self.judge_phase().await? {
                PhaseExit::Continue => {
                    self.transition(IterationStatus::Aggregating).await?;
                }
                PhaseExit::Paused => {
                    self.transition(IterationStatus::Paused).await?;
                    return Ok(IterationOutcome::Paused);
                }
                PhaseExit::Cancelled => return self.cancel().await,
                PhaseExit::AllRunsFailed => unreachable!("judge phase never reports run failures"),
            }
        }

        let metrics = self.aggregate_phase().await?;

        if self.control.signal() == ControlSignal::Cancel {
            return self.cancel().await;
        }

        // Stop rules evaluable before refinement (the no-refinement rule
        // cannot fire yet)
        let spend = self.current_spend().await?;
        let history = self.composite_history().await?;
        let decision = post_iteration_gate(
            &self.experiment.stop_rules,
            self.current_number().await?,
            spend,
            &history,
            true,
        );

        if self.refiner.is_none() || matches!(decision, StopDecision::Stop(_)) {
            let stop = match decision {
                StopDecision::Stop(reason) => Some(reason),
                StopDecision::Continue => None,
            };
            return self.complete(stop, Some(metrics)).await;
        }

        self.refine_phase(metrics).await
    }

    async fn cancel(&self) -> Result<IterationOutcome> {
        let iteration = self.transition(IterationStatus::Cancelled).await?;
        self.emitter.completed(iteration.status, None);
        info!(iteration_id = %self.iteration_id, "iteration cancelled");
        Ok(IterationOutcome::Cancelled)
    }

    async fn complete(&self, stop: Option<StopReason>, metrics: Option<IterationMetrics>) -> Result<IterationOutcome> {
        let reason_text = match stop {
            Some(reason) => reason.as_str().to_string(),
            None => "refiner_not_configured".to_string(),
        };
        let (from, mut iteration) = self
            .state
            .transition_iteration(&self.iteration_id, IterationStatus::Completed)
            .await?;
        iteration.set_stop_reason(&reason_text);
        self.state.update_iteration(&iteration).await?;
        self.emitter.status_changed(from, IterationStatus::Completed);
        self.emitter.completed(IterationStatus::Completed, Some(reason_text));
        Ok(IterationOutcome::Completed { stop, metrics })
    }

    async fn current_number(&self) -> Result<u32> {
        Ok(self.state.get_iteration_required(&self.iteration_id).await?.number)
    }

    async fn current_spend(&self) -> Result<f64> {
        self.state
            .spend_since(&self.experiment.project_id, now_ms() - SPEND_WINDOW_MS)
            .await
    }

    /// Composite scores of this experiment's iterations, ascending
    async fn composite_history(&self) -> Result<Vec<f64>> {
        let history = self.state.iteration_history(&self.experiment.id).await?;
        Ok(history
            .iter()
            .filter_map(|iteration| iteration.metrics.as_ref())
            .filter_map(|metrics| metrics.get("composite").and_then(|v| v.as_f64()))
            .collect())
    }

    async fn execute_work_remaining(&self) -> Result<bool> {
        let outputs = self.state.list_outputs(&self.iteration_id).await?;
        let expected = self.model_configs.len() * self.dataset.cases.len();
        Ok(outputs.len() < expected)
    }

    // === Execute phase ===

    async fn execute_phase(&self) -> Result<PhaseExit> {
        debug!(iteration_id = %self.iteration_id, "execute phase starting");

        let mut runs: HashMap<String, ModelRun> = HashMap::new();
        let mut adapters: HashMap<String, (ModelConfig, ProviderAdapter)> = HashMap::new();
        for config in &self.model_configs {
            let mut run = ModelRun::new(&self.iteration_id, &config.id, &self.dataset.id);
            run.set_status(ModelRunStatus::Running);
            let run = self.state.upsert_model_run(&run).await?;
            runs.insert(config.id.clone(), run);

            let adapter = self.registry.adapter(&config.provider, &config.model)?;
            adapters.insert(config.id.clone(), (config.clone(), adapter));
        }

        let ctx = Arc::new(ExecuteContext {
            state: self.state.clone(),
            experiment: self.experiment.clone(),
            prompt: self.prompt_version.clone(),
            dataset: self.dataset.clone(),
            adapters,
            renderer: PromptRenderer::new(),
            scanner: self.scanner.clone(),
            emitter: self.emitter.clone(),
            control: self.control.clone(),
            iteration_id: self.iteration_id.clone(),
            tallies: std::sync::Mutex::new(HashMap::new()),
            aborted_runs: std::sync::Mutex::new(Default::default()),
        });

        let queue = Arc::new(JobQueue::new(QueueKind::ExecuteRun, self.scheduler.retry.clone()));
        for (config_id, run) in &runs {
            ctx.init_tally(&run.id, self.dataset.cases.len());
            for case in &self.dataset.cases {
                let payload = ExecutePayload {
                    model_run_id: run.id.clone(),
                    model_config_id: config_id.clone(),
                    case_id: case.id.clone(),
                };
                queue.enqueue(
                    serde_json::to_value(&payload).map_err(|e| EdisonError::internal(e.to_string()))?,
                    EnqueueOptions {
                        priority: Priority::Normal,
                        dedup_key: Some(format!("exec:{}:{}", run.id, case.id)),
                        ..Default::default()
                    },
                );
            }
        }

        let pool = {
            let ctx = ctx.clone();
            WorkerPool::spawn(
                queue.clone(),
                self.scheduler.concurrency_for(QueueKind::ExecuteRun),
                move |job| {
                    let ctx = ctx.clone();
                    async move { ctx.handle(job).await }
                },
            )
        };
        queue.wait_idle().await;
        queue.close();
        pool.shutdown().await;

        // Retry-exhausted jobs surface as per-case failures; the run
        // continues its other cases
        for dead in queue.dead_letters() {
            if let Ok(payload) = serde_json::from_value::<ExecutePayload>(dead.job.payload.clone()) {
                let _ = ctx
                    .record_nonresult(&payload, OutputStatus::Failed, &dead.last_error)
                    .await;
            }
        }

        match self.control.signal() {
            ControlSignal::Cancel => return Ok(PhaseExit::Cancelled),
            ControlSignal::Pause => return Ok(PhaseExit::Paused),
            ControlSignal::Run => {}
        }

        // Finalize runs from the tallies
        let tallies = ctx.tally_snapshot();
        let mut any_completed = false;
        for run in runs.values() {
            let mut run = run.clone();
            let tally = tallies.get(&run.id).cloned().unwrap_or_default();
            run.add_usage(tally.prompt_tokens, tally.completion_tokens, tally.cost_usd);
            let status = if ctx.is_aborted(&run.id) || tally.completed == 0 {
                ModelRunStatus::Failed
            } else {
                ModelRunStatus::Completed
            };
            run.set_status(status);
            self.state.update_model_run(&run).await?;
            self.emitter.run_completed(&run.id, status);
            any_completed |= status == ModelRunStatus::Completed;
        }

        if !any_completed {
            return Ok(PhaseExit::AllRunsFailed);
        }
        Ok(PhaseExit::Continue)
    }

    // === Judge phase ===

    async fn judge_phase(&self) -> Result<PhaseExit> {
        debug!(iteration_id = %self.iteration_id, "judge phase starting");

        let outputs = self.state.list_outputs(&self.iteration_id).await?;
        let completed: Vec<&Output> = outputs.iter().filter(|o| o.status == OutputStatus::Completed).collect();

        let sink: Arc<dyn UsageSink> = Arc::new(LedgerUsageSink {
            project_id: self.experiment.project_id.clone(),
            tx: self.usage_tx.clone(),
        });

        let mut adapters: HashMap<String, (JudgeConfig, ProviderAdapter)> = HashMap::new();
        for judge in &self.judge_configs {
            let adapter = self
                .registry
                .adapter(&judge.provider, &judge.model)?
                .with_usage_sink(sink.clone());
            adapters.insert(judge.id.clone(), (judge.clone(), adapter));
        }

        let queue = Arc::new(JobQueue::new(QueueKind::JudgeOutputs, self.scheduler.retry.clone()));
        let mut total = 0usize;

        for judge in &self.judge_configs {
            match judge.mode {
                JudgeMode::Pointwise => {
                    for output in &completed {
                        let payload = JudgePayload::Pointwise {
                            output_id: output.id.clone(),
                            judge_config_id: judge.id.clone(),
                        };
                        if queue
                            .enqueue(
                                serde_json::to_value(&payload).map_err(|e| EdisonError::internal(e.to_string()))?,
                                EnqueueOptions {
                                    dedup_key: Some(format!("jp:{}:{}", output.id, judge.id)),
                                    ..Default::default()
                                },
                            )
                            .is_some()
                        {
                            total += 1;
                        }
                    }
                }
                JudgeMode::Pairwise => {
                    // Blocked outputs never enter pairwise matchups
                    let block = self.experiment.safety.block_violations;
                    let mut by_case: HashMap<&str, Vec<&Output>> = HashMap::new();
                    for output in &completed {
                        if output.scoreable(block) {
                            by_case.entry(output.case_id.as_str()).or_default().push(*output);
                        }
                    }
                    for (case_id, case_outputs) in &by_case {
                        for i in 0..case_outputs.len() {
                            for j in (i + 1)..case_outputs.len() {
                                let payload = JudgePayload::Pairwise {
                                    output_a: case_outputs[i].id.clone(),
                                    output_b: case_outputs[j].id.clone(),
                                    case_id: case_id.to_string(),
                                    judge_config_id: judge.id.clone(),
                                };
                                let key = crate::domain::JudgmentTarget::pairwise_unique_key(
                                    &case_outputs[i].id,
                                    &case_outputs[j].id,
                                    &judge.id,
                                );
                                if queue
                                    .enqueue(
                                        serde_json::to_value(&payload)
                                            .map_err(|e| EdisonError::internal(e.to_string()))?,
                                        EnqueueOptions {
                                            dedup_key: Some(key),
                                            ..Default::default()
                                        },
                                    )
                                    .is_some()
                                {
                                    total += 1;
                                }
                            }
                        }
                    }
                }
            }
        }

        let ctx = Arc::new(JudgeContext {
            state: self.state.clone(),
            experiment: self.experiment.clone(),
            dataset: self.dataset.clone(),
            adapters,
            outputs: completed.iter().map(|o| (o.id.clone(), (*o).clone())).collect(),
            evaluator: self.evaluator.clone(),
            emitter: self.emitter.clone(),
            control: self.control.clone(),
            settled: AtomicUsize::new(0),
            total,
        });

        let pool = {
            let ctx = ctx.clone();
            WorkerPool::spawn(
                queue.clone(),
                self.scheduler.concurrency_for(QueueKind::JudgeOutputs),
                move |job| {
                    let ctx = ctx.clone();
                    async move { ctx.handle(job).await }
                },
            )
        };
        queue.wait_idle().await;
        queue.close();
        pool.shutdown().await;

        for dead in queue.dead_letters() {
            warn!(job_id = dead.job.id, error = %dead.last_error, "judge job dead-lettered");
        }

        match self.control.signal() {
            ControlSignal::Cancel => Ok(PhaseExit::Cancelled),
            ControlSignal::Pause => Ok(PhaseExit::Paused),
            ControlSignal::Run => Ok(PhaseExit::Continue),
        }
    }

    // === Aggregate phase ===

    async fn aggregate_phase(&self) -> Result<IterationMetrics> {
        debug!(iteration_id = %self.iteration_id, "aggregate phase starting");

        let outputs = self.state.list_outputs(&self.iteration_id).await?;
        let judgments = self.state.list_judgments(&self.iteration_id).await?;
        let runs = self.state.list_model_runs(&self.iteration_id).await?;

        let metrics = self.aggregator.aggregate(
            &self.experiment,
            &self.dataset,
            &self.model_configs,
            &runs,
            &outputs,
            &judgments,
        );

        let mut iteration = self.state.get_iteration_required(&self.iteration_id).await?;
        iteration.set_metrics(metrics.to_value());
        self.state.update_iteration(&iteration).await?;
        self.emitter.aggregate_completed(metrics.to_value());

        // One-shot cost alert, non-blocking
        let spend = self.current_spend().await?;
        if let Some((spend_usd, budget_usd)) = self.alert.check(&self.experiment.stop_rules, spend) {
            self.bus.emit(EdisonEvent::CostAlert {
                project_id: self.experiment.project_id.clone(),
                spend_usd,
                budget_usd,
            });
        }

        Ok(metrics)
    }

    // === Refine phase ===

    async fn refine_phase(&self, metrics: IterationMetrics) -> Result<IterationOutcome> {
        self.transition(IterationStatus::Refining).await?;
        let refiner = self.refiner.as_ref().ok_or_else(|| EdisonError::internal("refine phase without refiner"))?;

        let sink: Arc<dyn UsageSink> = Arc::new(LedgerUsageSink {
            project_id: self.experiment.project_id.clone(),
            tx: self.usage_tx.clone(),
        });
        let adapter = self
            .registry
            .adapter(refiner.provider(), refiner.model())?
            .with_usage_sink(sink);

        let outputs = self.state.list_outputs(&self.iteration_id).await?;
        let judgments = self.state.list_judgments(&self.iteration_id).await?;

        let suggestion = match refiner
            .refine(
                &adapter,
                &self.experiment,
                &self.prompt_version,
                &outputs,
                &judgments,
                &self.iteration_id,
            )
            .await
        {
            Ok(suggestion) => suggestion,
            Err(error) => {
                // Provider failure during refinement degrades to an invalid
                // suggestion; aggregated results are preserved
                warn!(error = %error, "refiner call failed");
                crate::domain::Suggestion::invalid(&self.iteration_id, &self.prompt_version.id, error.to_string())
            }
        };
        self.state.create_suggestion(&suggestion).await?;

        if suggestion.status == crate::domain::SuggestionStatus::Pending {
            self.transition(IterationStatus::Reviewing).await?;
            self.emitter.refine_completed(&suggestion.id);
            return Ok(IterationOutcome::AwaitingReview {
                suggestion_id: suggestion.id,
            });
        }

        // Invalid suggestion: stop or await a manual edit
        if self.experiment.stop_rules.stop_if_no_refinement {
            return self.complete(Some(StopReason::NoRefinement), Some(metrics)).await;
        }
        self.transition(IterationStatus::Reviewing).await?;
        self.emitter.refine_completed(&suggestion.id);
        Ok(IterationOutcome::AwaitingReview {
            suggestion_id: suggestion.id,
        })
    }
}
