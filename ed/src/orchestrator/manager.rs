//! ExperimentManager - runs iterations until a stop rule or review ends the
//! experiment
//!
//! One manager per experiment run. It owns the lock lifecycle and the
//! heartbeat task, drives each iteration through an [`IterationEngine`],
//! waits out human reviews, applies approved diffs as new prompt versions,
//! and assembles the final report.

use std::sync::Arc;
use std::time::Duration;

use edisonstore::now_ms;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::control::ControlFlag;
use super::engine::{EngineParams, IterationEngine, IterationOutcome};
use super::lock::{ExperimentLockManager, LockConfig};
use crate::aggregate::IterationMetrics;
use crate::budget::{CostAlertGate, SPEND_WINDOW_MS, StopDecision, StopReason, post_iteration_gate, pre_iteration_gate};
use crate::domain::{
    Creator, Experiment, FinalReport, Iteration, IterationStatus, JudgeConfig, ModelConfig, PromptVersion, Review,
    ReviewDecision, SuggestionStatus,
};
use crate::error::{EdisonError, Result};
use crate::events::EventBus;
use crate::provider::ProviderRegistry;
use crate::refiner::{Refiner, RefinerConfig, validate_and_apply};
use crate::safety::SafetyScanner;
use crate::scheduler::SchedulerConfig;
use crate::state::StateManager;

/// Token assumptions used for the pre-gate cost estimate
const ESTIMATED_PROMPT_TOKENS: u64 = 800;
const ESTIMATED_COMPLETION_TOKENS: u64 = 400;

/// Handle for submitting reviews from outside the manager
#[derive(Clone)]
pub struct ReviewHandle {
    tx: mpsc::UnboundedSender<Review>,
}

impl ReviewHandle {
    pub fn submit(&self, review: Review) -> Result<()> {
        self.tx
            .send(review)
            .map_err(|_| EdisonError::Conflict("experiment run is no longer accepting reviews".to_string()))
    }
}

/// Manager construction parameters
pub struct ManagerParams {
    pub state: StateManager,
    pub registry: Arc<ProviderRegistry>,
    pub bus: Arc<EventBus>,
    pub scheduler: SchedulerConfig,
    pub refiner: Option<RefinerConfig>,
    pub scanner: Arc<SafetyScanner>,
    pub lock_config: LockConfig,
    pub deadline: Option<Duration>,
}

/// Drives a whole experiment run
pub struct ExperimentManager {
    state: StateManager,
    registry: Arc<ProviderRegistry>,
    bus: Arc<EventBus>,
    scheduler: SchedulerConfig,
    refiner: Option<Arc<Refiner>>,
    scanner: Arc<SafetyScanner>,
    locks: ExperimentLockManager,
    control: Arc<ControlFlag>,
    alert: Arc<CostAlertGate>,
    deadline: Option<Duration>,
    holder: String,
    review_tx: mpsc::UnboundedSender<Review>,
    review_rx: mpsc::UnboundedReceiver<Review>,
}

impl ExperimentManager {
    pub fn new(params: ManagerParams) -> Self {
        let (review_tx, review_rx) = mpsc::unbounded_channel();
        let locks = ExperimentLockManager::new(params.state.clone(), params.lock_config);
        Self {
            state: params.state,
            registry: params.registry,
            bus: params.bus,
            scheduler: params.scheduler,
            refiner: params.refiner.map(|config| Arc::new(Refiner::new(config))),
            scanner: params.scanner,
            locks,
            control: Arc::new(ControlFlag::new()),
            alert: Arc::new(CostAlertGate::new()),
            deadline: params.deadline,
            holder: format!("edison-{}", std::process::id()),
            review_tx,
            review_rx,
        }
    }

    pub fn control(&self) -> Arc<ControlFlag> {
        self.control.clone()
    }

    pub fn review_handle(&self) -> ReviewHandle {
        ReviewHandle {
            tx: self.review_tx.clone(),
        }
    }

    /// Run the experiment until a stop rule, cancellation, or failure
    pub async fn run_experiment(&mut self, experiment_id: &str, dataset_id: &str) -> Result<FinalReport> {
        let experiment = self.state.get_experiment_required(experiment_id).await?;
        experiment.validate()?;
        let dataset = self.state.get_dataset_required(dataset_id).await?;
        let model_configs = self.state.list_active_model_configs(experiment_id).await?;
        let judge_configs = self.state.list_active_judge_configs(experiment_id).await?;
        if model_configs.is_empty() {
            return Err(EdisonError::Validation("experiment has no active model configs".to_string()));
        }
        if judge_configs.is_empty() {
            return Err(EdisonError::Validation("experiment has no active judge configs".to_string()));
        }
        let mut prompt_version = self
            .state
            .latest_prompt_version(experiment_id)
            .await?
            .ok_or_else(|| EdisonError::Validation("experiment has no seed prompt version".to_string()))?;

        loop {
            let number = self.state.iteration_history(experiment_id).await?.len() as u32 + 1;

            // Pre-iteration gate
            let spend = self.spend(&experiment).await?;
            let estimate = self.estimate_iteration_cost(&model_configs, &judge_configs, dataset.cases.len())?;
            let missing = self.missing_credentials(&model_configs, &judge_configs);
            match pre_iteration_gate(
                &experiment.stop_rules,
                spend,
                estimate,
                &missing,
                dataset.cases.len(),
            ) {
                Ok(()) => {}
                Err(error @ EdisonError::BudgetExceeded { .. }) if number > 1 => {
                    info!(%error, "budget gate stopped the experiment");
                    return self.build_report(&experiment, StopReason::BudgetExhausted.as_str()).await;
                }
                Err(error) => return Err(error),
            }

            self.locks.acquire(experiment_id, &self.holder).await?;

            // Reuse a resumable iteration (recovery) or create a fresh one
            let iteration = match self.resumable_iteration(experiment_id).await? {
                Some(existing) => existing,
                None => {
                    let fresh = Iteration::new(experiment_id, number, &prompt_version.id);
                    self.state.create_iteration(&fresh).await?;
                    fresh
                }
            };
            // Freeze the version actually under test
            prompt_version = self.state.get_prompt_version_required(&iteration.prompt_version_id).await?;

            let heartbeat = self.spawn_heartbeat(experiment_id);
            let engine = IterationEngine::new(EngineParams {
                iteration_id: iteration.id.clone(),
                experiment: experiment.clone(),
                prompt_version: prompt_version.clone(),
                dataset: dataset.clone(),
                model_configs: model_configs.clone(),
                judge_configs: judge_configs.clone(),
                state: self.state.clone(),
                registry: self.registry.clone(),
                bus: self.bus.clone(),
                scheduler: self.scheduler.clone(),
                refiner: self.refiner.clone(),
                scanner: self.scanner.clone(),
                control: self.control.clone(),
                alert: self.alert.clone(),
                deadline: self.deadline,
            });

            let outcome = self.drive_engine(&engine).await;
            heartbeat.abort();
            let outcome = outcome?;

            match outcome {
                IterationOutcome::Completed { stop, .. } => {
                    self.locks.release(experiment_id, &self.holder).await?;
                    let reason = stop.map_or("refiner_not_configured", |reason| reason.as_str());
                    return self.build_report(&experiment, reason).await;
                }
                IterationOutcome::Cancelled => {
                    self.locks.release(experiment_id, &self.holder).await?;
                    return self.build_report(&experiment, "cancelled").await;
                }
                IterationOutcome::Failed { reason } => {
                    self.locks.release(experiment_id, &self.holder).await?;
                    warn!(%reason, "iteration failed; partial results are preserved");
                    return self.build_report(&experiment, "failed").await;
                }
                IterationOutcome::Paused => {
                    // drive_engine resumes pauses; reaching here means the
                    // control flag is still paused and the caller gave up
                    self.locks.release(experiment_id, &self.holder).await?;
                    return Err(EdisonError::Conflict("iteration left paused".to_string()));
                }
                IterationOutcome::AwaitingReview { suggestion_id } => {
                    let next = self
                        .handle_review(&experiment, &iteration, &prompt_version, &suggestion_id)
                        .await?;
                    self.locks.release(experiment_id, &self.holder).await?;
                    match next {
                        ReviewOutcome::NextIteration(new_version) => {
                            prompt_version = new_version;
                            continue;
                        }
                        ReviewOutcome::Stop(reason) => {
                            return self.build_report(&experiment, &reason).await;
                        }
                    }
                }
            }
        }
    }

    /// Run the engine, transparently resuming through pauses
    async fn drive_engine(&self, engine: &IterationEngine) -> Result<IterationOutcome> {
        loop {
            let outcome = engine.run().await?;
            if matches!(outcome, IterationOutcome::Paused) {
                debug!("iteration paused, waiting for resume");
                self.control.wait_unpaused().await;
                continue;
            }
            return Ok(outcome);
        }
    }

    async fn resumable_iteration(&self, experiment_id: &str) -> Result<Option<Iteration>> {
        let open = self.state.list_nonterminal_iterations().await?;
        Ok(open.into_iter().find(|iteration| {
            iteration.experiment_id == experiment_id
                && matches!(iteration.status, IterationStatus::Pending | IterationStatus::Paused)
        }))
    }

    fn spawn_heartbeat(&self, experiment_id: &str) -> tokio::task::JoinHandle<()> {
        let locks = self.locks.clone();
        let experiment_id = experiment_id.to_string();
        let holder = self.holder.clone();
        let interval = Duration::from_millis(self.locks.config().heartbeat_interval_ms.max(100) as u64);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = locks.heartbeat(&experiment_id, &holder).await {
                    warn!(error = %e, "lock heartbeat failed");
                    return;
                }
            }
        })
    }

    async fn spend(&self, experiment: &Experiment) -> Result<f64> {
        self.state
            .spend_since(&experiment.project_id, now_ms() - SPEND_WINDOW_MS)
            .await
    }

    fn missing_credentials(&self, model_configs: &[ModelConfig], judge_configs: &[JudgeConfig]) -> Vec<String> {
        let mut missing = Vec::new();
        let mut seen = std::collections::HashSet::new();
        let providers = model_configs
            .iter()
            .map(|c| c.provider.as_str())
            .chain(judge_configs.iter().map(|c| c.provider.as_str()))
            .chain(self.refiner.iter().map(|r| r.provider()));
        for provider in providers {
            if seen.insert(provider.to_string()) && !self.registry.has_credential(provider) {
                missing.push(provider.to_string());
            }
        }
        missing
    }

    /// Rough per-iteration cost estimate; unknown model ids are fatal here,
    /// before any job is enqueued
    fn estimate_iteration_cost(
        &self,
        model_configs: &[ModelConfig],
        judge_configs: &[JudgeConfig],
        case_count: usize,
    ) -> Result<f64> {
        let pricing = self.registry.pricing();
        let mut estimate = 0.0;
        for config in model_configs {
            estimate += case_count as f64
                * pricing.estimate_cost(
                    &config.provider,
                    &config.model,
                    ESTIMATED_PROMPT_TOKENS,
                    ESTIMATED_COMPLETION_TOKENS,
                )?;
        }
        for judge in judge_configs {
            // Each judge scores every model's outputs
            estimate += (case_count * model_configs.len()) as f64
                * pricing.estimate_cost(
                    &judge.provider,
                    &judge.model,
                    ESTIMATED_PROMPT_TOKENS,
                    ESTIMATED_COMPLETION_TOKENS,
                )?;
        }
        Ok(estimate)
    }

    // === Review handling ===

    async fn handle_review(
        &mut self,
        experiment: &Experiment,
        iteration: &Iteration,
        _current_version: &PromptVersion,
        suggestion_id: &str,
    ) -> Result<ReviewOutcome> {
        info!(suggestion_id, "awaiting human review");
        let review = self.await_review(suggestion_id).await?;
        self.state.create_review(&review).await?;

        let mut suggestion = self.state.get_suggestion_required(suggestion_id).await?;
        let parent = self
            .state
            .get_prompt_version_required(&suggestion.parent_prompt_version_id)
            .await?;

        let diff_text = match (&review.decision, &review.edited_diff) {
            (ReviewDecision::Reject, _) => None,
            (ReviewDecision::Edit, Some(edited)) => Some(edited.clone()),
            (ReviewDecision::Edit, None) => None,
            (ReviewDecision::Approve, _) if suggestion.status == SuggestionStatus::Pending => {
                Some(suggestion.diff.clone())
            }
            // Approving an INVALID suggestion without an edit has nothing to
            // apply
            (ReviewDecision::Approve, _) => None,
        };

        let limits = self
            .refiner
            .as_ref()
            .map(|r| r.limits().clone())
            .unwrap_or_default();

        let applied = diff_text.and_then(|diff| match validate_and_apply(&diff, &parent.body, &limits) {
            Ok(new_body) => Some((diff, new_body)),
            Err(error) => {
                warn!(%error, "reviewed diff failed validation");
                None
            }
        });

        match applied {
            Some((_, new_body)) => {
                suggestion.set_status(SuggestionStatus::Applied);
                self.state.update_suggestion(&suggestion).await?;

                let changelog = if suggestion.note.is_empty() {
                    review.notes.clone()
                } else {
                    suggestion.note.clone()
                };
                let child = parent.child(new_body, changelog, Creator::Refiner);
                self.state.create_prompt_version(&child).await?;

                self.complete_reviewed_iteration(&iteration.id, None).await?;

                // Post-approval stop check decides whether a new iteration
                // starts
                let spend = self.spend(experiment).await?;
                let history = self.composite_history(&experiment.id).await?;
                let decision =
                    post_iteration_gate(&experiment.stop_rules, iteration.number, spend, &history, true);
                match decision {
                    StopDecision::Stop(reason) => Ok(ReviewOutcome::Stop(reason.as_str().to_string())),
                    StopDecision::Continue => Ok(ReviewOutcome::NextIteration(child)),
                }
            }
            None => {
                suggestion.set_status(SuggestionStatus::Rejected);
                self.state.update_suggestion(&suggestion).await?;
                self.complete_reviewed_iteration(&iteration.id, Some("review_rejected")).await?;
                Ok(ReviewOutcome::Stop("review_rejected".to_string()))
            }
        }
    }

    async fn complete_reviewed_iteration(&self, iteration_id: &str, stop_reason: Option<&str>) -> Result<()> {
        let (from, mut iteration) = self
            .state
            .transition_iteration(iteration_id, IterationStatus::Completed)
            .await?;
        if let Some(reason) = stop_reason {
            iteration.set_stop_reason(reason);
            self.state.update_iteration(&iteration).await?;
        }
        let emitter = self.bus.emitter_for(iteration_id);
        emitter.status_changed(from, IterationStatus::Completed);
        emitter.completed(IterationStatus::Completed, stop_reason.map(str::to_string));
        Ok(())
    }

    async fn await_review(&mut self, suggestion_id: &str) -> Result<Review> {
        loop {
            let review = self
                .review_rx
                .recv()
                .await
                .ok_or_else(|| EdisonError::Conflict("review channel closed".to_string()))?;
            if review.suggestion_id == suggestion_id {
                return Ok(review);
            }
            warn!(got = %review.suggestion_id, expected = suggestion_id, "ignoring review for another suggestion");
        }
    }

    async fn composite_history(&self, experiment_id: &str) -> Result<Vec<f64>> {
        let history = self.state.iteration_history(experiment_id).await?;
        Ok(history
            .iter()
            .filter_map(|iteration| iteration.metrics.as_ref())
            .filter_map(|metrics| metrics.get("composite").and_then(|v| v.as_f64()))
            .collect())
    }

    // === Final report ===

    async fn build_report(&self, experiment: &Experiment, stop_reason: &str) -> Result<FinalReport> {
        let report = build_final_report(&self.state, experiment, stop_reason).await?;
        info!(stop_reason, iterations = report.iterations_run, "experiment run finished");
        Ok(report)
    }
}

/// Assemble the final report from persisted state
///
/// Also used by the `report` CLI command after the fact.
pub async fn build_final_report(state: &StateManager, experiment: &Experiment, stop_reason: &str) -> Result<FinalReport> {
    let history = state.iteration_history(&experiment.id).await?;
    let last_metrics: Option<IterationMetrics> = history
        .iter()
        .rev()
        .filter_map(|iteration| iteration.metrics.clone())
        .find_map(|value| serde_json::from_value(value).ok());

    let best_prompt_version_id = state
        .latest_prompt_version(&experiment.id)
        .await?
        .map(|version| version.id)
        .unwrap_or_default();

    let (total_tokens, total_cost_usd) = state.project_totals(&experiment.project_id).await?;
    let iterations_run = history.iter().filter(|iteration| iteration.is_terminal()).count() as u32;

    let mut report = FinalReport {
        best_prompt_version_id,
        composite_score: last_metrics.as_ref().map_or(0.0, |m| m.composite),
        per_model_ranking: last_metrics
            .as_ref()
            .map(|m| m.per_model.iter().map(|model| model.ranking_entry()).collect())
            .unwrap_or_default(),
        total_cost_usd,
        total_tokens,
        iterations_run,
        stop_reason: stop_reason.to_string(),
        recommendations: Vec::new(),
    };
    if let Some(metrics) = &last_metrics {
        report.recommendations = recommendations(metrics, stop_reason);
    }
    Ok(report)
}

enum ReviewOutcome {
    NextIteration(PromptVersion),
    Stop(String),
}

/// Human-readable follow-ups derived from the final metrics
fn recommendations(metrics: &IterationMetrics, stop_reason: &str) -> Vec<String> {
    let mut recommendations = Vec::new();

    if let Some((tag, mean)) = metrics
        .facets
        .by_tag
        .iter()
        .min_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
    {
        recommendations.push(format!(
            "Cases tagged '{tag}' score lowest (mean {mean:.2}); consider targeting them in the next objective"
        ));
    }
    if let Some((difficulty, mean)) = metrics
        .facets
        .by_difficulty
        .iter()
        .min_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
    {
        recommendations.push(format!(
            "Difficulty-{difficulty} cases are the weakest bucket (mean {mean:.2})"
        ));
    }
    if let Some(best) = metrics.best_model() {
        recommendations.push(format!(
            "{}/{} ranks first at composite {:.2}",
            best.provider, best.model, best.mean_composite
        ));
    }
    if stop_reason == "converged" {
        recommendations.push("Scores have converged; expanding the dataset may reveal further headroom".to_string());
    }
    recommendations
}
