//! Fail-fast guard around database calls.
//!
//! The breaker sits between the repository and the connection pool. After
//! `failure_threshold` consecutive failures it opens and every call fails
//! immediately with [`Error::CircuitBreakerOpen`]; once `recovery_timeout`
//! has passed it admits exactly one probe, and that probe's outcome decides
//! whether the circuit closes again or stays open.

use crate::errors::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Sliding window over which call metrics are kept.
const METRICS_WINDOW: Duration = Duration::from_secs(60);

/// State of the circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation; calls pass through.
    Closed,
    /// Failing fast; calls are rejected.
    Open,
    /// One probe is admitted to test recovery.
    HalfOpen,
}

/// Point-in-time snapshot of breaker metrics.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerMetrics {
    /// Current circuit state.
    pub state: CircuitState,
    /// Consecutive failures since the last success.
    pub consecutive_failures: u32,
    /// Calls recorded in the sliding window.
    pub window_calls: usize,
    /// Percentage of windowed calls that failed.
    pub window_failure_rate_pct: f64,
    /// When the last failure happened, if any.
    pub last_failure_at: Option<DateTime<Utc>>,
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    probe_in_flight: bool,
    // (success, when) pairs, pruned to METRICS_WINDOW on every touch
    window: VecDeque<(bool, Instant)>,
}

/// Fail-fast wrapper around an unreliable dependency.
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a breaker that opens after `failure_threshold` consecutive
    /// failures and admits a recovery probe after `recovery_timeout`.
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            recovery_timeout,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                last_failure_at: None,
                probe_in_flight: false,
                window: VecDeque::new(),
            }),
        }
    }

    /// Run `op` under the breaker.
    ///
    /// Success resets the consecutive-failure count and closes a half-open
    /// circuit; failure increments it and opens the circuit at the
    /// threshold. While open, calls fail with [`Error::CircuitBreakerOpen`]
    /// without touching the dependency.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.admit()?;

        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(error) => {
                self.record_failure();
                Err(error)
            }
        }
    }

    /// Current circuit state.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Snapshot of the breaker's metrics. Prunes the sliding window.
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let mut inner = self.inner.lock();
        Self::prune_window(&mut inner.window);

        let window_calls = inner.window.len();
        let failures = inner.window.iter().filter(|(ok, _)| !ok).count();
        let window_failure_rate_pct = if window_calls == 0 {
            0.0
        } else {
            failures as f64 * 100.0 / window_calls as f64
        };

        CircuitBreakerMetrics {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            window_calls,
            window_failure_rate_pct,
            last_failure_at: inner.last_failure_at,
        }
    }

    fn admit(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::prune_window(&mut inner.window);

        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed > self.recovery_timeout {
                    debug!("circuit breaker admitting recovery probe");
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    Ok(())
                } else {
                    Err(Error::CircuitBreakerOpen {
                        retry_after: self.recovery_timeout.saturating_sub(elapsed),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(Error::CircuitBreakerOpen {
                        retry_after: Duration::ZERO,
                    })
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.window.push_back((true, Instant::now()));
        inner.consecutive_failures = 0;
        inner.probe_in_flight = false;
        if inner.state != CircuitState::Closed {
            debug!("circuit breaker closed after successful probe");
            inner.state = CircuitState::Closed;
        }
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.window.push_back((false, Instant::now()));
        inner.consecutive_failures += 1;
        inner.last_failure = Some(Instant::now());
        inner.last_failure_at = Some(Utc::now());
        inner.probe_in_flight = false;

        match inner.state {
            CircuitState::HalfOpen => {
                warn!("circuit breaker reopened, recovery probe failed");
                inner.state = CircuitState::Open;
            }
            CircuitState::Closed if inner.consecutive_failures >= self.failure_threshold => {
                warn!(
                    failures = inner.consecutive_failures,
                    "circuit breaker opened"
                );
                inner.state = CircuitState::Open;
            }
            _ => {}
        }
    }

    fn prune_window(window: &mut VecDeque<(bool, Instant)>) {
        let now = Instant::now();
        while let Some((_, at)) = window.front() {
            if now.duration_since(*at) > METRICS_WINDOW {
                window.pop_front();
            } else {
                break;
            }
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("failure_threshold", &self.failure_threshold)
            .field("recovery_timeout", &self.recovery_timeout)
            .field("state", &self.state())
            .finish()
    }
}
