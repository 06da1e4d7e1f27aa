//! Event bus - single-writer publish, multi-subscriber fanout
//!
//! The orchestrator is the only publisher per iteration; subscribers (SSE
//! streams, the JSONL logger, tests) receive every event via a tokio
//! broadcast channel. The bus is not a durable log: a lagging subscriber
//! loses old events and recovers from persisted state.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::debug;

use super::types::EdisonEvent;
use crate::domain::{IterationStatus, ModelRunStatus};

/// Default channel capacity (events)
pub const DEFAULT_CHANNEL_CAPACITY: usize = 4096;

/// Central event bus for iteration progress
pub struct EventBus {
    tx: broadcast::Sender<EdisonEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Emit an event to all subscribers
    ///
    /// Fire-and-forget: no subscribers is fine, and a full channel drops the
    /// oldest events.
    pub fn emit(&self, event: EdisonEvent) {
        debug!(event_type = event.event_type(), "EventBus::emit");
        let _ = self.tx.send(event);
    }

    /// Subscribe to all events emitted after this call
    pub fn subscribe(&self) -> broadcast::Receiver<EdisonEvent> {
        self.tx.subscribe()
    }

    /// Create an emitter bound to one iteration
    pub fn emitter_for(&self, iteration_id: impl Into<String>) -> IterationEmitter {
        IterationEmitter {
            tx: self.tx.clone(),
            iteration_id: iteration_id.into(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

/// Cheap-to-clone handle for emitting events for one iteration
#[derive(Clone)]
pub struct IterationEmitter {
    tx: broadcast::Sender<EdisonEvent>,
    iteration_id: String,
}

impl IterationEmitter {
    pub fn iteration_id(&self) -> &str {
        &self.iteration_id
    }

    pub fn emit(&self, event: EdisonEvent) {
        debug!(event_type = event.event_type(), "IterationEmitter::emit");
        let _ = self.tx.send(event);
    }

    pub fn started(&self, experiment_id: &str, number: u32) {
        self.emit(EdisonEvent::IterationStarted {
            iteration_id: self.iteration_id.clone(),
            experiment_id: experiment_id.to_string(),
            number,
        });
    }

    pub fn status_changed(&self, from: IterationStatus, to: IterationStatus) {
        self.emit(EdisonEvent::StatusChanged {
            iteration_id: self.iteration_id.clone(),
            from,
            to,
        });
    }

    pub fn run_progress(&self, model_run_id: &str, completed: usize, total: usize) {
        self.emit(EdisonEvent::RunProgress {
            iteration_id: self.iteration_id.clone(),
            model_run_id: model_run_id.to_string(),
            completed,
            total,
        });
    }

    pub fn run_completed(&self, model_run_id: &str, status: ModelRunStatus) {
        self.emit(EdisonEvent::RunCompleted {
            iteration_id: self.iteration_id.clone(),
            model_run_id: model_run_id.to_string(),
            status,
        });
    }

    pub fn judge_progress(&self, completed: usize, total: usize) {
        self.emit(EdisonEvent::JudgeProgress {
            iteration_id: self.iteration_id.clone(),
            completed,
            total,
        });
    }

    pub fn aggregate_completed(&self, metrics: serde_json::Value) {
        self.emit(EdisonEvent::AggregateCompleted {
            iteration_id: self.iteration_id.clone(),
            metrics,
        });
    }

    pub fn refine_completed(&self, suggestion_id: &str) {
        self.emit(EdisonEvent::RefineCompleted {
            iteration_id: self.iteration_id.clone(),
            suggestion_id: suggestion_id.to_string(),
        });
    }

    pub fn error(&self, message: &str, recoverable: bool) {
        self.emit(EdisonEvent::Error {
            iteration_id: self.iteration_id.clone(),
            message: message.to_string(),
            recoverable,
        });
    }

    pub fn completed(&self, status: IterationStatus, stop_reason: Option<String>) {
        self.emit(EdisonEvent::IterationCompleted {
            iteration_id: self.iteration_id.clone(),
            status,
            stop_reason,
        });
    }
}

/// Create an event bus wrapped in an Arc for shared ownership
pub fn create_event_bus() -> Arc<EventBus> {
    Arc::new(EventBus::with_default_capacity())
}
