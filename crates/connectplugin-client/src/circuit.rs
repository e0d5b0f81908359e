//! Consecutive-failure circuit breaker for host calls.
//!
//! Closed until `failure_threshold` consecutive failures, then open for
//! `open_interval`. The first call after the interval probes half-open:
//! success closes the circuit, failure re-opens it.

use std::time::{Duration, Instant};

use connectplugin_core::Error;
use parking_lot::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a half-open probe.
    pub open_interval: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
enum State {
    Closed { consecutive_failures: u32 },
    Open { until: Instant },
    HalfOpen,
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    /// Gate one call. `Unavailable` while the circuit is open.
    pub fn check(&self) -> Result<(), Error> {
        let mut state = self.state.lock();
        match &*state {
            State::Closed { .. } | State::HalfOpen => Ok(()),
            State::Open { until } => {
                if Instant::now() >= *until {
                    debug!("[Circuit] Half-open probe");
                    *state = State::HalfOpen;
                    Ok(())
                } else {
                    Err(Error::Unavailable("circuit open".into()))
                }
            }
        }
    }

    pub fn on_success(&self) {
        let mut state = self.state.lock();
        *state = State::Closed {
            consecutive_failures: 0,
        };
    }

    pub fn on_failure(&self) {
        let mut state = self.state.lock();
        let next = match &*state {
            State::Closed {
                consecutive_failures,
            } => {
                let failures = consecutive_failures + 1;
                if failures >= self.config.failure_threshold {
                    warn!(
                        failures,
                        open_secs = self.config.open_interval.as_secs(),
                        "[Circuit] Opening circuit"
                    );
                    State::Open {
                        until: Instant::now() + self.config.open_interval,
                    }
                } else {
                    State::Closed {
                        consecutive_failures: failures,
                    }
                }
            }
            // A failed probe re-opens for a full interval.
            State::HalfOpen | State::Open { .. } => State::Open {
                until: Instant::now() + self.config.open_interval,
            },
        };
        *state = next;
    }

    /// Whether the circuit currently refuses calls.
    pub fn is_open(&self) -> bool {
        matches!(&*self.state.lock(), State::Open { until } if Instant::now() < *until)
    }
}
