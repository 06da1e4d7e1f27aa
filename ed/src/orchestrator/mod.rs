//! Iteration orchestration
//!
//! The top-level state machine: [`IterationEngine`] drives a single
//! iteration through its phases, [`ExperimentManager`] chains iterations
//! across reviews and stop rules, [`ExperimentLockManager`] guards each
//! experiment with a TTL+heartbeat lock, and [`recover`] repairs
//! non-terminal iterations after a crash.

mod control;
mod engine;
mod lock;
mod manager;
mod recovery;
mod workers;

pub use control::{ControlFlag, ControlSignal};
pub use engine::{EngineParams, IterationEngine, IterationOutcome};
pub use lock::{ExperimentLock, ExperimentLockManager, LockConfig};
pub use manager::{ExperimentManager, ManagerParams, ReviewHandle, build_final_report};
pub use recovery::{RecoveryAction, recover};
pub use workers::{ExecutePayload, JudgePayload};
