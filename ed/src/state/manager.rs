//! StateManager - owns the record store
//!
//! All persistence flows through this facade. Access is serialized through a
//! single async mutex, which also gives aggregation its consistent snapshot:
//! every read performed under one lock acquisition observes one store state.
//!
//! The domain invariants the durable layer enforces live here:
//! - one non-terminal iteration per experiment
//! - idempotent output/judgment inserts via unique keys
//! - monotone prompt versions, at most one production version
//! - judgment shape matches the judge config's mode

use std::path::Path;
use std::sync::Arc;

use edisonstore::{Filter, IndexValue, Record, Store, UpsertOutcome};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::domain::{
    CostRecord, Dataset, Experiment, Iteration, IterationStatus, JudgeConfig, JudgeMode, Judgment, JudgmentTarget,
    ModelConfig, ModelRun, Output, PromptVersion, Review, Suggestion,
};
use crate::error::{EdisonError, Result};

/// Shared handle to the persistent state
#[derive(Clone)]
pub struct StateManager {
    store: Arc<Mutex<Store>>,
}

impl StateManager {
    /// Open or create the store at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let store = Store::open(path.as_ref())?;
        info!(path = %path.as_ref().display(), "StateManager opened");
        Ok(Self {
            store: Arc::new(Mutex::new(store)),
        })
    }

    /// In-memory store for tests
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            store: Arc::new(Mutex::new(Store::open_in_memory()?)),
        })
    }

    /// Run a closure against the locked store (extension point for
    /// store-backed records owned by other modules, e.g. the experiment
    /// lock)
    pub async fn with_store<T>(
        &self,
        f: impl FnOnce(&mut Store) -> edisonstore::Result<T> + Send,
    ) -> Result<T> {
        let mut store = self.store.lock().await;
        f(&mut store).map_err(EdisonError::from)
    }

    // === Experiments and configuration ===

    pub async fn create_experiment(&self, experiment: &Experiment) -> Result<()> {
        experiment.validate()?;
        let mut store = self.store.lock().await;
        store.create(experiment)?;
        Ok(())
    }

    pub async fn get_experiment(&self, id: &str) -> Result<Option<Experiment>> {
        let store = self.store.lock().await;
        Ok(store.get(id)?)
    }

    pub async fn get_experiment_required(&self, id: &str) -> Result<Experiment> {
        self.get_experiment(id)
            .await?
            .ok_or_else(|| EdisonError::NotFound(format!("experiment {id}")))
    }

    pub async fn create_dataset(&self, dataset: &Dataset) -> Result<()> {
        dataset.validate()?;
        let mut store = self.store.lock().await;
        store.create(dataset)?;
        Ok(())
    }

    pub async fn get_dataset_required(&self, id: &str) -> Result<Dataset> {
        let store = self.store.lock().await;
        store
            .get(id)?
            .ok_or_else(|| EdisonError::NotFound(format!("dataset {id}")))
    }

    pub async fn create_model_config(&self, config: &ModelConfig) -> Result<()> {
        let mut store = self.store.lock().await;
        store.create(config)?;
        Ok(())
    }

    pub async fn list_active_model_configs(&self, experiment_id: &str) -> Result<Vec<ModelConfig>> {
        let store = self.store.lock().await;
        Ok(store.list(&[
            Filter::eq("experiment_id", IndexValue::String(experiment_id.to_string())),
            Filter::eq("active", IndexValue::Boolean(true)),
        ])?)
    }

    pub async fn get_model_config_required(&self, id: &str) -> Result<ModelConfig> {
        let store = self.store.lock().await;
        store
            .get(id)?
            .ok_or_else(|| EdisonError::NotFound(format!("model config {id}")))
    }

    pub async fn create_judge_config(&self, config: &JudgeConfig) -> Result<()> {
        let mut store = self.store.lock().await;
        store.create(config)?;
        Ok(())
    }

    pub async fn list_active_judge_configs(&self, experiment_id: &str) -> Result<Vec<JudgeConfig>> {
        let store = self.store.lock().await;
        Ok(store.list(&[
            Filter::eq("experiment_id", IndexValue::String(experiment_id.to_string())),
            Filter::eq("active", IndexValue::Boolean(true)),
        ])?)
    }

    // === Prompt versions ===

    /// Append a prompt version
    ///
    /// Enforces the monotone-version invariant (`version == max + 1` within
    /// the experiment) and the single-production invariant.
    pub async fn create_prompt_version(&self, version: &PromptVersion) -> Result<()> {
        let mut store = self.store.lock().await;
        let experiment_filter = Filter::eq("experiment_id", IndexValue::String(version.experiment_id.clone()));

        let existing: Vec<PromptVersion> = store.list(std::slice::from_ref(&experiment_filter))?;
        let max_version = existing.iter().map(|v| v.version).max().unwrap_or(0);
        if version.version != max_version + 1 {
            return Err(EdisonError::IntegrityViolation(format!(
                "prompt version must be {} for experiment {}, got {}",
                max_version + 1,
                version.experiment_id,
                version.version
            )));
        }
        if version.is_production && existing.iter().any(|v| v.is_production) {
            return Err(EdisonError::IntegrityViolation(format!(
                "experiment {} already has a production prompt version",
                version.experiment_id
            )));
        }
        if let Some(parent_id) = &version.parent_id {
            let parent: PromptVersion = store
                .get(parent_id)?
                .ok_or_else(|| EdisonError::NotFound(format!("parent prompt version {parent_id}")))?;
            if parent.version >= version.version {
                return Err(EdisonError::IntegrityViolation(format!(
                    "prompt version {} does not increase over parent version {}",
                    version.version, parent.version
                )));
            }
        }

        store.create(version)?;
        debug!(id = version.id(), version = version.version, "prompt version appended");
        Ok(())
    }

    pub async fn get_prompt_version_required(&self, id: &str) -> Result<PromptVersion> {
        let store = self.store.lock().await;
        store
            .get(id)?
            .ok_or_else(|| EdisonError::NotFound(format!("prompt version {id}")))
    }

    pub async fn latest_prompt_version(&self, experiment_id: &str) -> Result<Option<PromptVersion>> {
        let store = self.store.lock().await;
        let mut versions: Vec<PromptVersion> = store.list(&[Filter::eq(
            "experiment_id",
            IndexValue::String(experiment_id.to_string()),
        )])?;
        versions.sort_by_key(|v| v.version);
        Ok(versions.pop())
    }

    // === Iterations ===

    /// Create an iteration, enforcing the single-active-iteration invariant
    pub async fn create_iteration(&self, iteration: &Iteration) -> Result<()> {
        let mut store = self.store.lock().await;
        let open: Vec<Iteration> = store.list(&[
            Filter::eq("experiment_id", IndexValue::String(iteration.experiment_id.clone())),
            Filter::eq("terminal", IndexValue::Boolean(false)),
        ])?;
        if let Some(active) = open.first() {
            return Err(EdisonError::Conflict(format!(
                "experiment {} already has non-terminal iteration {}",
                iteration.experiment_id,
                active.id()
            )));
        }
        store.create(iteration)?;
        Ok(())
    }

    pub async fn update_iteration(&self, iteration: &Iteration) -> Result<()> {
        let mut store = self.store.lock().await;
        store.update(iteration)?;
        Ok(())
    }

    pub async fn get_iteration_required(&self, id: &str) -> Result<Iteration> {
        let store = self.store.lock().await;
        store
            .get(id)?
            .ok_or_else(|| EdisonError::NotFound(format!("iteration {id}")))
    }

    /// Load, legality-check, persist, and return the transitioned iteration
    /// along with the status it left
    pub async fn transition_iteration(&self, id: &str, next: IterationStatus) -> Result<(IterationStatus, Iteration)> {
        let mut store = self.store.lock().await;
        let mut iteration: Iteration = store
            .get(id)?
            .ok_or_else(|| EdisonError::NotFound(format!("iteration {id}")))?;
        let from = iteration.status;
        iteration.transition_to(next)?;
        store.update(&iteration)?;
        Ok((from, iteration))
    }

    pub async fn list_nonterminal_iterations(&self) -> Result<Vec<Iteration>> {
        let store = self.store.lock().await;
        Ok(store.list(&[Filter::eq("terminal", IndexValue::Boolean(false))])?)
    }

    /// All iterations of an experiment ordered by number
    pub async fn iteration_history(&self, experiment_id: &str) -> Result<Vec<Iteration>> {
        let store = self.store.lock().await;
        let mut iterations: Vec<Iteration> = store.list(&[Filter::eq(
            "experiment_id",
            IndexValue::String(experiment_id.to_string()),
        )])?;
        iterations.sort_by_key(|i| i.number);
        Ok(iterations)
    }

    // === Model runs ===

    /// Insert a model run if its (iteration, config) slot is empty
    pub async fn upsert_model_run(&self, run: &ModelRun) -> Result<ModelRun> {
        let mut store = self.store.lock().await;
        match store.upsert(run)? {
            UpsertOutcome::Inserted => Ok(run.clone()),
            UpsertOutcome::Kept => {
                let key = run.unique_key().unwrap_or_default();
                let existing: Option<ModelRun> = store.get_by_unique(&key)?;
                existing.ok_or_else(|| EdisonError::internal("upsert kept a model run that cannot be read back"))
            }
        }
    }

    pub async fn update_model_run(&self, run: &ModelRun) -> Result<()> {
        let mut store = self.store.lock().await;
        store.update(run)?;
        Ok(())
    }

    pub async fn list_model_runs(&self, iteration_id: &str) -> Result<Vec<ModelRun>> {
        let store = self.store.lock().await;
        let mut runs: Vec<ModelRun> = store.list(&[Filter::eq(
            "iteration_id",
            IndexValue::String(iteration_id.to_string()),
        )])?;
        runs.sort_by_key(|r| r.created_at);
        Ok(runs)
    }

    // === Outputs ===

    /// Idempotently insert an output, appending the cost record in the same
    /// transaction when the insert actually happens
    pub async fn insert_output(&self, output: &Output, cost: Option<&CostRecord>) -> Result<UpsertOutcome> {
        let mut store = self.store.lock().await;
        store.in_txn(|store| {
            let outcome = store.upsert(output)?;
            if outcome == UpsertOutcome::Inserted
                && let Some(cost) = cost
            {
                store.create(cost)?;
            }
            Ok(outcome)
        })
        .map_err(EdisonError::from)
    }

    pub async fn output_exists(&self, iteration_id: &str, case_id: &str, model_config_id: &str) -> Result<bool> {
        Ok(self.get_output(iteration_id, case_id, model_config_id).await?.is_some())
    }

    pub async fn get_output(
        &self,
        iteration_id: &str,
        case_id: &str,
        model_config_id: &str,
    ) -> Result<Option<Output>> {
        let store = self.store.lock().await;
        let key = Output::output_key(iteration_id, case_id, model_config_id);
        Ok(store.get_by_unique::<Output>(&key)?)
    }

    pub async fn list_outputs(&self, iteration_id: &str) -> Result<Vec<Output>> {
        let store = self.store.lock().await;
        let mut outputs: Vec<Output> = store.list(&[Filter::eq(
            "iteration_id",
            IndexValue::String(iteration_id.to_string()),
        )])?;
        outputs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(outputs)
    }

    // === Judgments ===

    /// Idempotently insert a judgment, enforcing mode/shape consistency
    pub async fn insert_judgment(&self, judgment: &Judgment) -> Result<UpsertOutcome> {
        if !judgment.shape_consistent() {
            return Err(EdisonError::IntegrityViolation(format!(
                "judgment {} verdict shape does not match its target",
                judgment.id()
            )));
        }
        let mut store = self.store.lock().await;
        let judge: JudgeConfig = store
            .get(&judgment.judge_config_id)?
            .ok_or_else(|| EdisonError::NotFound(format!("judge config {}", judgment.judge_config_id)))?;
        let target_mode = match &judgment.target {
            JudgmentTarget::Pointwise { .. } => JudgeMode::Pointwise,
            JudgmentTarget::Pairwise { .. } => JudgeMode::Pairwise,
        };
        if judge.mode != target_mode {
            return Err(EdisonError::IntegrityViolation(format!(
                "judgment targets {target_mode} but judge {} is {}",
                judge.id(),
                judge.mode
            )));
        }
        Ok(store.upsert(judgment)?)
    }

    /// Whether a judgment with this idempotency key already exists
    pub async fn judgment_exists(&self, unique_key: &str) -> Result<bool> {
        let store = self.store.lock().await;
        Ok(store.get_by_unique::<Judgment>(unique_key)?.is_some())
    }

    /// Consistent snapshot of an iteration's judgments
    pub async fn list_judgments(&self, iteration_id: &str) -> Result<Vec<Judgment>> {
        let store = self.store.lock().await;
        Ok(store.list(&[Filter::eq(
            "iteration_id",
            IndexValue::String(iteration_id.to_string()),
        )])?)
    }

    // === Suggestions and reviews ===

    pub async fn create_suggestion(&self, suggestion: &Suggestion) -> Result<()> {
        let mut store = self.store.lock().await;
        store.create(suggestion)?;
        Ok(())
    }

    pub async fn update_suggestion(&self, suggestion: &Suggestion) -> Result<()> {
        let mut store = self.store.lock().await;
        store.update(suggestion)?;
        Ok(())
    }

    pub async fn get_suggestion_required(&self, id: &str) -> Result<Suggestion> {
        let store = self.store.lock().await;
        store
            .get(id)?
            .ok_or_else(|| EdisonError::NotFound(format!("suggestion {id}")))
    }

    pub async fn list_suggestions(&self, iteration_id: &str) -> Result<Vec<Suggestion>> {
        let store = self.store.lock().await;
        Ok(store.list(&[Filter::eq(
            "iteration_id",
            IndexValue::String(iteration_id.to_string()),
        )])?)
    }

    pub async fn create_review(&self, review: &Review) -> Result<()> {
        let mut store = self.store.lock().await;
        store.create(review)?;
        Ok(())
    }

    // === Cost ledger ===

    pub async fn append_cost(&self, record: &CostRecord) -> Result<()> {
        let mut store = self.store.lock().await;
        store.create(record)?;
        Ok(())
    }

    /// Windowed USD spend for a project
    pub async fn spend_since(&self, project_id: &str, since_ms: i64) -> Result<f64> {
        let store = self.store.lock().await;
        let records: Vec<CostRecord> = store.list(&[Filter::eq(
            "project_id",
            IndexValue::String(project_id.to_string()),
        )])?;
        Ok(records
            .iter()
            .filter(|r| r.created_at >= since_ms)
            .map(|r| r.amount_usd)
            .sum())
    }

    /// Lifetime token and USD totals for a project
    pub async fn project_totals(&self, project_id: &str) -> Result<(u64, f64)> {
        let store = self.store.lock().await;
        let records: Vec<CostRecord> = store.list(&[Filter::eq(
            "project_id",
            IndexValue::String(project_id.to_string()),
        )])?;
        let tokens = records.iter().map(CostRecord::total_tokens).sum();
        let usd = records.iter().map(|r| r.amount_usd).sum();
        Ok((tokens, usd))
    }

    // === Snapshot ===

    /// Current iteration + model-run state, serialized for the SSE snapshot
    pub async fn iteration_snapshot(&self, iteration_id: &str) -> Result<(serde_json::Value, Vec<serde_json::Value>)> {
        let store = self.store.lock().await;
        let iteration: Iteration = store
            .get(iteration_id)?
            .ok_or_else(|| EdisonError::NotFound(format!("iteration {iteration_id}")))?;
        let runs: Vec<ModelRun> = store.list(&[Filter::eq(
            "iteration_id",
            IndexValue::String(iteration_id.to_string()),
        )])?;
        let iteration_json = serde_json::to_value(&iteration).map_err(|e| EdisonError::internal(e.to_string()))?;
        let run_json = runs
            .iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| EdisonError::internal(e.to_string()))?;
        Ok((iteration_json, run_json))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Creator, Criterion, Rubric, ScoreScale, Verdict};
    use std::collections::BTreeMap;

    fn rubric() -> Rubric {
        Rubric {
            criteria: vec![
                Criterion {
                    name: "quality".to_string(),
                    description: String::new(),
                    weight: 0.5,
                    scale: ScoreScale { min: 0, max: 5 },
                },
                Criterion {
                    name: "tone".to_string(),
                    description: String::new(),
                    weight: 0.5,
                    scale: ScoreScale { min: 0, max: 5 },
                },
            ],
        }
    }

    async fn seeded_state() -> (StateManager, Experiment) {
        let state = StateManager::open_in_memory().unwrap();
        let experiment = Experiment::new("proj-1", "improve summaries", rubric());
        state.create_experiment(&experiment).await.unwrap();
        (state, experiment)
    }

    #[tokio::test]
    async fn test_single_active_iteration_invariant() {
        let (state, experiment) = seeded_state().await;

        let first = Iteration::new(&experiment.id, 1, "pv-1");
        state.create_iteration(&first).await.unwrap();

        let second = Iteration::new(&experiment.id, 2, "pv-1");
        let result = state.create_iteration(&second).await;
        assert!(matches!(result, Err(EdisonError::Conflict(_))));

        // Terminal first iteration unblocks the second
        let mut done = first.clone();
        done.transition_to(IterationStatus::Cancelled).unwrap();
        state.update_iteration(&done).await.unwrap();
        state.create_iteration(&second).await.unwrap();
    }

    #[tokio::test]
    async fn test_prompt_version_monotonicity() {
        let (state, experiment) = seeded_state().await;

        let seed = PromptVersion::seed(&experiment.id, "Echo: {{x}}");
        state.create_prompt_version(&seed).await.unwrap();

        // Version 3 when 2 is expected
        let mut skipped = seed.child("v-skip", "skip", Creator::Refiner);
        skipped.version = 3;
        let result = state.create_prompt_version(&skipped).await;
        assert!(matches!(result, Err(EdisonError::IntegrityViolation(_))));

        let proper = seed.child("v2", "next", Creator::Refiner);
        state.create_prompt_version(&proper).await.unwrap();

        let latest = state.latest_prompt_version(&experiment.id).await.unwrap().unwrap();
        assert_eq!(latest.version, 2);
    }

    #[tokio::test]
    async fn test_single_production_version() {
        let (state, experiment) = seeded_state().await;

        let mut seed = PromptVersion::seed(&experiment.id, "v1");
        seed.is_production = true;
        state.create_prompt_version(&seed).await.unwrap();

        let mut child = seed.child("v2", "next", Creator::Human);
        child.is_production = true;
        let result = state.create_prompt_version(&child).await;
        assert!(matches!(result, Err(EdisonError::IntegrityViolation(_))));
    }

    #[tokio::test]
    async fn test_output_insert_is_idempotent_with_cost() {
        let (state, experiment) = seeded_state().await;
        let iteration = Iteration::new(&experiment.id, 1, "pv-1");
        state.create_iteration(&iteration).await.unwrap();

        let output = Output {
            id: "o1".to_string(),
            model_run_id: "r1".to_string(),
            iteration_id: iteration.id.clone(),
            case_id: "c1".to_string(),
            model_config_id: "m1".to_string(),
            status: crate::domain::OutputStatus::Completed,
            rendered_prompt: "Echo: hi".to_string(),
            text: "hi".to_string(),
            prompt_tokens: 2,
            completion_tokens: 1,
            latency_ms: 5,
            finish_reason: "stop".to_string(),
            safety: None,
            skip_reason: None,
            created_at: now_ms(),
        };
        let cost = CostRecord::new("proj-1", "mock", "m1", 2, 1, 0.0);

        let first = state.insert_output(&output, Some(&cost)).await.unwrap();
        assert_eq!(first, UpsertOutcome::Inserted);

        // Replay with a different record id but the same business key
        let mut replay = output.clone();
        replay.id = "o1-replayed".to_string();
        let replay_cost = CostRecord::new("proj-1", "mock", "m1", 2, 1, 0.0);
        let second = state.insert_output(&replay, Some(&replay_cost)).await.unwrap();
        assert_eq!(second, UpsertOutcome::Kept);

        // Exactly one output, exactly one cost record
        let outputs = state.list_outputs(&iteration.id).await.unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].id, "o1");
        let (_, usd) = state.project_totals("proj-1").await.unwrap();
        assert_eq!(usd, 0.0);
        let spend = state.spend_since("proj-1", 0).await.unwrap();
        assert_eq!(spend, 0.0);
    }

    #[tokio::test]
    async fn test_judgment_mode_mismatch_rejected() {
        let (state, experiment) = seeded_state().await;
        let judge = JudgeConfig::new(&experiment.id, JudgeMode::Pointwise, "mock", "m1");
        state.create_judge_config(&judge).await.unwrap();

        let pairwise = Judgment::pairwise(
            "iter-1",
            &judge.id,
            "o1",
            "o2",
            Verdict::Pairwise {
                winner: crate::domain::PairWinner::Tie,
                reasons: vec![],
                score_a: 0.5,
                score_b: 0.5,
            },
        );
        let result = state.insert_judgment(&pairwise).await;
        assert!(matches!(result, Err(EdisonError::IntegrityViolation(_))));

        let mut scores = BTreeMap::new();
        scores.insert("quality".to_string(), 4);
        let pointwise = Judgment::pointwise(
            "iter-1",
            &judge.id,
            "o1",
            Verdict::Pointwise {
                scores,
                rationales: BTreeMap::new(),
            },
        );
        assert_eq!(
            state.insert_judgment(&pointwise).await.unwrap(),
            UpsertOutcome::Inserted
        );
        // Replay is kept, not duplicated
        assert_eq!(state.insert_judgment(&pointwise).await.unwrap(), UpsertOutcome::Kept);
    }

    #[tokio::test]
    async fn test_spend_window() {
        let (state, _) = seeded_state().await;

        let mut old = CostRecord::new("proj-1", "openai", "gpt-4o", 100, 100, 0.30);
        old.created_at = now_ms() - 120_000;
        state.append_cost(&old).await.unwrap();
        state
            .append_cost(&CostRecord::new("proj-1", "openai", "gpt-4o", 100, 100, 0.60))
            .await
            .unwrap();

        let all = state.spend_since("proj-1", 0).await.unwrap();
        assert!((all - 0.90).abs() < 1e-9);

        let recent = state.spend_since("proj-1", now_ms() - 60_000).await.unwrap();
        assert!((recent - 0.60).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_iteration_snapshot() {
        let (state, experiment) = seeded_state().await;
        let iteration = Iteration::new(&experiment.id, 1, "pv-1");
        state.create_iteration(&iteration).await.unwrap();
        state
            .upsert_model_run(&ModelRun::new(&iteration.id, "mc-1", "ds-1"))
            .await
            .unwrap();

        let (iteration_json, runs) = state.iteration_snapshot(&iteration.id).await.unwrap();
        assert_eq!(iteration_json["id"], iteration.id);
        assert_eq!(runs.len(), 1);
    }
}
