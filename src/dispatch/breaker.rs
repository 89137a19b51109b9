//! Per-model circuit breakers shared by every dispatch client.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::error::DispatchError;

use super::message::ModelId;

/// Breaker state for one model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls pass through.
    Closed {
        /// Timeouts, disconnects and full queues since the last answer.
        consecutive_failures: u32,
    },
    /// Calls are rejected without being sent.
    Open {
        /// End of the cooldown.
        until: Instant,
    },
    /// Cooldown elapsed; calls are let through until one succeeds or fails.
    HalfOpen,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self::Closed {
            consecutive_failures: 0,
        }
    }
}

/// Circuit breakers keyed by model identifier.
#[derive(Debug)]
pub struct CircuitBreakers {
    threshold: u32,
    cooldown: Duration,
    states: Mutex<HashMap<ModelId, BreakerState>>,
}

impl CircuitBreakers {
    /// Breakers that open after `threshold` consecutive failures and stay open
    /// for `cooldown`.
    #[must_use]
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Current state of `model`'s breaker.
    #[must_use]
    pub fn state(&self, model: ModelId) -> BreakerState {
        self.states
            .lock()
            .map(|states| states.get(&model).copied().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Rejects the call if `model`'s circuit is open.
    pub fn check(&self, model: ModelId) -> Result<(), DispatchError> {
        let Ok(mut states) = self.states.lock() else {
            return Ok(());
        };
        let state = states.entry(model).or_default();
        match *state {
            BreakerState::Open { until } if Instant::now() < until => {
                Err(DispatchError::CircuitOpen { model })
            }
            BreakerState::Open { .. } => {
                info!(%model, "circuit half-open");
                *state = BreakerState::HalfOpen;
                Ok(())
            }
            BreakerState::Closed { .. } | BreakerState::HalfOpen => Ok(()),
        }
    }

    /// Closes the circuit for `model`.
    pub fn record_success(&self, model: ModelId) {
        if let Ok(mut states) = self.states.lock() {
            let state = states.entry(model).or_default();
            if *state == BreakerState::HalfOpen {
                info!(%model, "circuit closed");
            }
            *state = BreakerState::default();
        }
    }

    /// Counts an infrastructure failure, opening the circuit at the threshold
    /// or straight away from half-open.
    pub fn record_failure(&self, model: ModelId) {
        let Ok(mut states) = self.states.lock() else {
            return;
        };
        let state = states.entry(model).or_default();
        let next = match *state {
            BreakerState::Closed {
                consecutive_failures,
            } if consecutive_failures + 1 < self.threshold => BreakerState::Closed {
                consecutive_failures: consecutive_failures + 1,
            },
            BreakerState::Open { until } => BreakerState::Open { until },
            BreakerState::Closed { .. } | BreakerState::HalfOpen => {
                warn!(%model, cooldown_ms = self.cooldown.as_millis() as u64, "circuit opened");
                BreakerState::Open {
                    until: Instant::now() + self.cooldown,
                }
            }
        };
        *state = next;
    }
}
