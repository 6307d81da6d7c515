//! Adaptive reconciliation scheduling.
//!
//! The scheduler stretches the cycle interval when recovery is struggling
//! or the queue is quiet, and tightens it when stuck jobs are actually
//! being found. The interval never leaves `[max(5s, base/4), base * 4]`.

use std::time::Duration;

const GROW_FACTOR: f64 = 1.5;
const SHRINK_FACTOR: f64 = 0.8;
const LOW_SUCCESS_RATE: f64 = 0.8;
const EMPTY_CYCLES_BEFORE_BACKOFF: u32 = 3;
const MIN_INTERVAL_FLOOR: Duration = Duration::from_secs(5);

/// Computes the next reconciliation interval from each cycle's outcome.
#[derive(Debug, Clone)]
pub struct AdaptiveScheduler {
    base: Duration,
    min: Duration,
    max: Duration,
    current: Duration,
    consecutive_empty: u32,
    adaptive: bool,
}

impl AdaptiveScheduler {
    /// Create a scheduler around `base`. When `adaptive` is false the
    /// interval stays pinned at `base`.
    pub fn new(base: Duration, adaptive: bool) -> Self {
        Self {
            base,
            min: MIN_INTERVAL_FLOOR.max(base / 4),
            max: base * 4,
            current: base,
            consecutive_empty: 0,
            adaptive,
        }
    }

    /// The interval to sleep before the next cycle.
    pub fn interval(&self) -> Duration {
        self.current
    }

    /// Feed one cycle's outcome.
    ///
    /// `success_rate` is re-enqueued over to-re-enqueue, `1.0` when nothing
    /// needed re-enqueueing. Rules apply in order: a struggling broker
    /// (low success rate) always backs off; otherwise empty cycles back
    /// off gradually and productive cycles tighten the loop.
    pub fn record_cycle(&mut self, found_stuck_jobs: usize, success_rate: f64) {
        if !self.adaptive {
            return;
        }

        if success_rate < LOW_SUCCESS_RATE {
            self.current = clamp(self.current.mul_f64(GROW_FACTOR), self.min, self.max);
            return;
        }

        if found_stuck_jobs == 0 {
            self.consecutive_empty += 1;
            if self.consecutive_empty >= EMPTY_CYCLES_BEFORE_BACKOFF {
                self.current = clamp(self.current.mul_f64(GROW_FACTOR), self.min, self.max);
            }
        } else {
            self.consecutive_empty = 0;
            self.current = clamp(self.current.mul_f64(SHRINK_FACTOR), self.min, self.max);
        }
    }

    /// The configured base interval.
    pub fn base(&self) -> Duration {
        self.base
    }
}

fn clamp(value: Duration, min: Duration, max: Duration) -> Duration {
    value.max(min).min(max)
}
