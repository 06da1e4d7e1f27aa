//! Event vocabulary for iteration progress streaming

use serde::{Deserialize, Serialize};

use crate::domain::{IterationStatus, ModelRunStatus};

/// Events published by the orchestrator, one stream per iteration
///
/// Ordering guarantee: a `status:changed(A -> B)` event strictly precedes
/// any event that could only occur in state B, because the orchestrator
/// publishes only after the underlying store commit succeeds.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EdisonEvent {
    #[serde(rename = "iteration:started")]
    IterationStarted {
        iteration_id: String,
        experiment_id: String,
        number: u32,
    },

    #[serde(rename = "status:changed")]
    StatusChanged {
        iteration_id: String,
        from: IterationStatus,
        to: IterationStatus,
    },

    #[serde(rename = "run:progress")]
    RunProgress {
        iteration_id: String,
        model_run_id: String,
        completed: usize,
        total: usize,
    },

    #[serde(rename = "run:completed")]
    RunCompleted {
        iteration_id: String,
        model_run_id: String,
        status: ModelRunStatus,
    },

    #[serde(rename = "judge:progress")]
    JudgeProgress {
        iteration_id: String,
        completed: usize,
        total: usize,
    },

    #[serde(rename = "aggregate:completed")]
    AggregateCompleted {
        iteration_id: String,
        metrics: serde_json::Value,
    },

    #[serde(rename = "refine:completed")]
    RefineCompleted {
        iteration_id: String,
        suggestion_id: String,
    },

    #[serde(rename = "cost:alert")]
    CostAlert {
        project_id: String,
        spend_usd: f64,
        budget_usd: f64,
    },

    #[serde(rename = "error")]
    Error {
        iteration_id: String,
        message: String,
        recoverable: bool,
    },

    #[serde(rename = "iteration:completed")]
    IterationCompleted {
        iteration_id: String,
        status: IterationStatus,
        stop_reason: Option<String>,
    },

    /// Sent first on every new subscription so clients converge without
    /// polling
    #[serde(rename = "snapshot")]
    Snapshot {
        iteration: serde_json::Value,
        model_runs: Vec<serde_json::Value>,
    },
}

impl EdisonEvent {
    /// The wire tag of this event
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::IterationStarted { .. } => "iteration:started",
            Self::StatusChanged { .. } => "status:changed",
            Self::RunProgress { .. } => "run:progress",
            Self::RunCompleted { .. } => "run:completed",
            Self::JudgeProgress { .. } => "judge:progress",
            Self::AggregateCompleted { .. } => "aggregate:completed",
            Self::RefineCompleted { .. } => "refine:completed",
            Self::CostAlert { .. } => "cost:alert",
            Self::Error { .. } => "error",
            Self::IterationCompleted { .. } => "iteration:completed",
            Self::Snapshot { .. } => "snapshot",
        }
    }

    /// The iteration this event belongs to, if any
    pub fn iteration_id(&self) -> Option<&str> {
        match self {
            Self::IterationStarted { iteration_id, .. }
            | Self::StatusChanged { iteration_id, .. }
            | Self::RunProgress { iteration_id, .. }
            | Self::RunCompleted { iteration_id, .. }
            | Self::JudgeProgress { iteration_id, .. }
            | Self::AggregateCompleted { iteration_id, .. }
            | Self::RefineCompleted { iteration_id, .. }
            | Self::Error { iteration_id, .. }
            | Self::IterationCompleted { iteration_id, .. } => Some(iteration_id),
            Self::CostAlert { .. } | Self::Snapshot { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_tags_use_colon_names() {
        let event = EdisonEvent::IterationStarted {
            iteration_id: "i1".to_string(),
            experiment_id: "e1".to_string(),
            number: 1,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "iteration:started");

        let event = EdisonEvent::CostAlert {
            project_id: "p1".to_string(),
            spend_usd: 0.8,
            budget_usd: 1.0,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "cost:alert");
    }

    #[test]
    fn test_round_trip() {
        let event = EdisonEvent::RunProgress {
            iteration_id: "i1".to_string(),
            model_run_id: "r1".to_string(),
            completed: 3,
            total: 50,
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: EdisonEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event_type(), "run:progress");
        assert_eq!(back.iteration_id(), Some("i1"));
    }

    #[test]
    fn test_snapshot_has_no_iteration_id() {
        let event = EdisonEvent::Snapshot {
            iteration: serde_json::json!({}),
            model_runs: vec![],
        };
        assert!(event.iteration_id().is_none());
    }
}
