//! Per-experiment advisory lock with TTL and heartbeats
//!
//! Only the lock holder may transition an iteration's state machine. The
//! lock row lives in the store; release is idempotent and happens on any
//! terminal transition or on TTL expiry. Re-acquisition after TTL expiry
//! additionally requires that the prior holder's heartbeat has been absent
//! for at least twice the heartbeat interval.

use std::collections::HashMap;

use edisonstore::{IndexValue, Record, now_ms};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{EdisonError, Result};
use crate::state::StateManager;

/// Lock tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    pub ttl_ms: i64,
    pub heartbeat_interval_ms: i64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 60 * 60 * 1000,
            heartbeat_interval_ms: 10_000,
        }
    }
}

/// The persisted lock row; record id is the experiment id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentLock {
    pub id: String,
    pub holder: String,
    pub acquired_at: i64,
    pub heartbeat_at: i64,
    pub updated_at: i64,
}

impl Record for ExperimentLock {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "experiment_locks"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("holder".to_string(), IndexValue::String(self.holder.clone()));
        fields
    }
}

/// Lock operations over the store
#[derive(Clone)]
pub struct ExperimentLockManager {
    state: StateManager,
    config: LockConfig,
}

impl ExperimentLockManager {
    pub fn new(state: StateManager, config: LockConfig) -> Self {
        Self { state, config }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Whether a lock row is stale enough to steal
    pub fn is_lapsed(&self, lock: &ExperimentLock, now: i64) -> bool {
        let ttl_expired = now - lock.acquired_at >= self.config.ttl_ms;
        let heartbeat_absent = now - lock.heartbeat_at >= 2 * self.config.heartbeat_interval_ms;
        ttl_expired && heartbeat_absent
    }

    /// Acquire (or re-enter) the lock for an experiment
    pub async fn acquire(&self, experiment_id: &str, holder: &str) -> Result<()> {
        let experiment_id = experiment_id.to_string();
        let holder = holder.to_string();
        let config = self.config.clone();
        self.state
            .with_store(move |store| {
                store.in_txn(|store| {
                    let now = now_ms();
                    let existing: Option<ExperimentLock> = store.get(&experiment_id)?;
                    match existing {
                        None => {
                            store.create(&ExperimentLock {
                                id: experiment_id.clone(),
                                holder: holder.clone(),
                                acquired_at: now,
                                heartbeat_at: now,
                                updated_at: now,
                            })?;
                            debug!(experiment_id = %experiment_id, holder = %holder, "lock acquired");
                            Ok(None)
                        }
                        Some(lock) if lock.holder == holder => {
                            // Re-entrant refresh
                            store.update(&ExperimentLock {
                                heartbeat_at: now,
                                updated_at: now,
                                ..lock
                            })?;
                            Ok(None)
                        }
                        Some(lock) => {
                            let ttl_expired = now - lock.acquired_at >= config.ttl_ms;
                            let heartbeat_absent = now - lock.heartbeat_at >= 2 * config.heartbeat_interval_ms;
                            if ttl_expired && heartbeat_absent {
                                warn!(experiment_id = %experiment_id, stale_holder = %lock.holder, "stealing lapsed lock");
                                store.update(&ExperimentLock {
                                    id: experiment_id.clone(),
                                    holder: holder.clone(),
                                    acquired_at: now,
                                    heartbeat_at: now,
                                    updated_at: now,
                                })?;
                                Ok(None)
                            } else {
                                Ok(Some(lock.holder))
                            }
                        }
                    }
                })
            })
            .await
            .and_then(|held_by| match held_by {
                None => Ok(()),
                Some(holder) => Err(EdisonError::LockHeld { holder }),
            })
    }

    /// Refresh the holder's heartbeat
    pub async fn heartbeat(&self, experiment_id: &str, holder: &str) -> Result<()> {
        let experiment_id = experiment_id.to_string();
        let holder = holder.to_string();
        self.state
            .with_store(move |store| {
                let now = now_ms();
                let existing: Option<ExperimentLock> = store.get(&experiment_id)?;
                match existing {
                    Some(lock) if lock.holder == holder => {
                        store.update(&ExperimentLock {
                            heartbeat_at: now,
                            updated_at: now,
                            ..lock
                        })?;
                        Ok(true)
                    }
                    _ => Ok(false),
                }
            })
            .await
            .and_then(|refreshed| {
                if refreshed {
                    Ok(())
                } else {
                    Err(EdisonError::LockHeld {
                        holder: "unknown".to_string(),
                    })
                }
            })
    }

    /// Idempotent release; only the holder's row is removed
    pub async fn release(&self, experiment_id: &str, holder: &str) -> Result<()> {
        let experiment_id = experiment_id.to_string();
        let holder = holder.to_string();
        self.state
            .with_store(move |store| {
                let existing: Option<ExperimentLock> = store.get(&experiment_id)?;
                if let Some(lock) = existing
                    && lock.holder == holder
                {
                    store.delete::<ExperimentLock>(&experiment_id)?;
                    info!(experiment_id = %experiment_id, "lock released");
                }
                Ok(())
            })
            .await
    }

    /// Current lock row, if any
    pub async fn current(&self, experiment_id: &str) -> Result<Option<ExperimentLock>> {
        let experiment_id = experiment_id.to_string();
        self.state.with_store(move |store| store.get(&experiment_id)).await
    }
}
