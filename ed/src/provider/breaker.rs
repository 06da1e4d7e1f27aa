//! Per-(provider, model) circuit breakers
//!
//! CLOSED -> OPEN after `failure_threshold` consecutive failures; OPEN for
//! `open_timeout`, then a single HALF_OPEN probe; `success_threshold`
//! consecutive successes close the breaker, one failure re-opens it.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::error::ProviderError;

/// Breaker thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    #[serde(with = "super::retry::duration_ms", rename = "open_timeout_ms")]
    pub open_timeout: Duration,
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

#[derive(Debug)]
enum BreakerState {
    Closed {
        consecutive_failures: u32,
    },
    Open {
        until: Instant,
    },
    HalfOpen {
        consecutive_successes: u32,
        probe_in_flight: bool,
    },
}

/// Registry of breakers keyed by (provider, model)
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<(String, String), BreakerState>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Gate a call: errors with `CircuitOpen` when the breaker is open, or
    /// when a half-open probe is already in flight
    pub fn preflight(&self, provider: &str, model: &str) -> Result<(), ProviderError> {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        let state = breakers
            .entry((provider.to_string(), model.to_string()))
            .or_insert(BreakerState::Closed {
                consecutive_failures: 0,
            });

        match state {
            BreakerState::Closed { .. } => Ok(()),
            BreakerState::Open { until } => {
                if Instant::now() >= *until {
                    debug!(provider, model, "breaker open timeout elapsed, allowing probe");
                    *state = BreakerState::HalfOpen {
                        consecutive_successes: 0,
                        probe_in_flight: true,
                    };
                    Ok(())
                } else {
                    Err(ProviderError::CircuitOpen {
                        provider: provider.to_string(),
                        model: model.to_string(),
                    })
                }
            }
            BreakerState::HalfOpen { probe_in_flight, .. } => {
                if *probe_in_flight {
                    Err(ProviderError::CircuitOpen {
                        provider: provider.to_string(),
                        model: model.to_string(),
                    })
                } else {
                    *probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Record a successful call
    pub fn record_success(&self, provider: &str, model: &str) {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        let Some(state) = breakers.get_mut(&(provider.to_string(), model.to_string())) else {
            return;
        };
        match state {
            BreakerState::Closed { consecutive_failures } => {
                *consecutive_failures = 0;
            }
            BreakerState::HalfOpen {
                consecutive_successes,
                probe_in_flight,
            } => {
                *consecutive_successes += 1;
                *probe_in_flight = false;
                if *consecutive_successes >= self.config.success_threshold {
                    debug!(provider, model, "breaker closing after successful probes");
                    *state = BreakerState::Closed {
                        consecutive_failures: 0,
                    };
                }
            }
            BreakerState::Open { .. } => {}
        }
    }

    /// Record a failed call
    pub fn record_failure(&self, provider: &str, model: &str) {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        let state = breakers
            .entry((provider.to_string(), model.to_string()))
            .or_insert(BreakerState::Closed {
                consecutive_failures: 0,
            });
        match state {
            BreakerState::Closed { consecutive_failures } => {
                *consecutive_failures += 1;
                if *consecutive_failures >= self.config.failure_threshold {
                    warn!(provider, model, failures = *consecutive_failures, "circuit breaker opening");
                    *state = BreakerState::Open {
                        until: Instant::now() + self.config.open_timeout,
                    };
                }
            }
            BreakerState::HalfOpen { .. } => {
                warn!(provider, model, "probe failed, circuit breaker re-opening");
                *state = BreakerState::Open {
                    until: Instant::now() + self.config.open_timeout,
                };
            }
            BreakerState::Open { .. } => {}
        }
    }

    /// Whether the breaker for this key is currently open
    pub fn is_open(&self, provider: &str, model: &str) -> bool {
        let breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        matches!(
            breakers.get(&(provider.to_string(), model.to_string())),
            Some(BreakerState::Open { until }) if Instant::now() < *until
        )
    }
}
