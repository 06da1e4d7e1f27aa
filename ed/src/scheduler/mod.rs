//! Job queue and worker pools
//!
//! Durable task dispatch for the phase families. Queues are in-process;
//! exactly-once business semantics come from idempotent upserts at the
//! store, so at-least-once delivery here is acceptable.

use serde::{Deserialize, Serialize};

mod queue;
mod worker;

pub use queue::{DeadJob, EnqueueOptions, Job, JobOutcome, JobQueue, Priority, QueueKind, QueueRetryConfig};
pub use worker::WorkerPool;

/// Per-queue worker concurrency
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub execute_concurrency: usize,
    pub judge_concurrency: usize,
    pub safety_concurrency: usize,
    pub generate_concurrency: usize,
    #[serde(default)]
    pub retry: QueueRetryConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            execute_concurrency: 4,
            judge_concurrency: 4,
            safety_concurrency: 2,
            generate_concurrency: 1,
            retry: QueueRetryConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Worker count for a queue family
    pub fn concurrency_for(&self, kind: QueueKind) -> usize {
        match kind {
            QueueKind::ExecuteRun => self.execute_concurrency,
            QueueKind::JudgeOutputs => self.judge_concurrency,
            QueueKind::SafetyScan => self.safety_concurrency,
            QueueKind::GenerateDataset => self.generate_concurrency,
            // Aggregation and refinement are single-flight phases
            QueueKind::AggregateScores | QueueKind::RefinePrompt => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concurrency_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.concurrency_for(QueueKind::ExecuteRun), 4);
        assert_eq!(config.concurrency_for(QueueKind::AggregateScores), 1);
        assert_eq!(config.concurrency_for(QueueKind::RefinePrompt), 1);
    }
}
