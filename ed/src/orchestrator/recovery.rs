//! Crash recovery
//!
//! On process start, every non-terminal iteration is inspected. Iterations
//! whose lock heartbeat has lapsed are either parked in PAUSED (execute and
//! judge phases resume through idempotent re-enqueueing) or demoted to
//! FAILED (the short single-flight phases, which re-running needs no
//! partial state for). Iterations whose lock is still live belong to
//! another process and are left alone.

use edisonstore::now_ms;
use tracing::{info, warn};

use super::lock::ExperimentLockManager;
use crate::domain::IterationStatus;
use crate::error::Result;
use crate::state::StateManager;

/// What recovery decided for one iteration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Ready to be picked up and resumed
    Resumable { iteration_id: String },
    /// Demoted to FAILED
    Demoted { iteration_id: String, reason: String },
    /// Waiting on a human review; nothing to do
    AwaitingReview { iteration_id: String },
    /// Another live process holds the lock
    HeldElsewhere { iteration_id: String },
}

/// Scan and repair non-terminal iterations
pub async fn recover(state: &StateManager, locks: &ExperimentLockManager) -> Result<Vec<RecoveryAction>> {
    let mut actions = Vec::new();
    let open = state.list_nonterminal_iterations().await?;
    info!(count = open.len(), "recovery scan over non-terminal iterations");

    for iteration in open {
        let lock = locks.current(&iteration.experiment_id).await?;
        let lapsed = match &lock {
            None => true,
            Some(lock) => locks.is_lapsed(lock, now_ms()),
        };

        let action = match iteration.status {
            IterationStatus::Reviewing => RecoveryAction::AwaitingReview {
                iteration_id: iteration.id.clone(),
            },
            IterationStatus::Pending | IterationStatus::Paused => RecoveryAction::Resumable {
                iteration_id: iteration.id.clone(),
            },
            IterationStatus::Executing | IterationStatus::Judging => {
                if lapsed {
                    // Park at the case boundary; idempotent re-enqueueing
                    // fills in the missing outputs/judgments on resume
                    state.transition_iteration(&iteration.id, IterationStatus::Paused).await?;
                    RecoveryAction::Resumable {
                        iteration_id: iteration.id.clone(),
                    }
                } else {
                    RecoveryAction::HeldElsewhere {
                        iteration_id: iteration.id.clone(),
                    }
                }
            }
            IterationStatus::Aggregating | IterationStatus::Refining => {
                if lapsed {
                    let reason = format!("crashed during {}", iteration.status);
                    warn!(iteration_id = %iteration.id, %reason, "demoting iteration to failed");
                    let (_, mut failed) = state
                        .transition_iteration(&iteration.id, IterationStatus::Failed)
                        .await?;
                    failed.set_error(&reason);
                    state.update_iteration(&failed).await?;
                    RecoveryAction::Demoted {
                        iteration_id: iteration.id.clone(),
                        reason,
                    }
                } else {
                    RecoveryAction::HeldElsewhere {
                        iteration_id: iteration.id.clone(),
                    }
                }
            }
            // Terminal states never appear in the non-terminal listing
            IterationStatus::Completed | IterationStatus::Failed | IterationStatus::Cancelled => continue,
        };
        actions.push(action);
    }

    Ok(actions)
}
