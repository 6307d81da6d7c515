//! Periodic stuck-job recovery.
//!
//! One reconciler exists per queue per process. It owns a single-shot
//! timer that is rescheduled after every cycle with whatever interval the
//! adaptive scheduler currently recommends, plus a little jitter so a
//! fleet of restarted processes does not harvest in lockstep. Cycles are
//! strictly serial; after three consecutive failures the reconciler
//! quarantines itself until [`Reconciler::force_run`] clears it.

use crate::adapter::QueueAdapter;
use crate::config::ReconciliationConfig;
use crate::errors::{Error, Result};
use crate::repository::Repository;
use crate::scheduler::AdaptiveScheduler;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

const MAX_CONSECUTIVE_FAILURES: u32 = 3;
const MAX_JITTER: Duration = Duration::from_millis(500);

/// Periodic recovery loop for one queue.
pub struct Reconciler {
    repository: Arc<Repository>,
    adapter: Arc<dyn QueueAdapter>,
    config: ReconciliationConfig,
    scheduler: Mutex<AdaptiveScheduler>,
    consecutive_failures: AtomicU32,
    cycle_running: AtomicBool,
    stopped: AtomicBool,
    stop_signal: Notify,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Reconciler {
    /// Build a reconciler over the repository and adapter for one queue.
    pub fn new(
        repository: Arc<Repository>,
        adapter: Arc<dyn QueueAdapter>,
        config: ReconciliationConfig,
    ) -> Self {
        let scheduler = AdaptiveScheduler::new(config.interval(), config.adaptive_scheduling);
        Self {
            repository,
            adapter,
            config,
            scheduler: Mutex::new(scheduler),
            consecutive_failures: AtomicU32::new(0),
            cycle_running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            stop_signal: Notify::new(),
            task: Mutex::new(None),
        }
    }

    /// Schedule the first cycle one base interval from now. Does nothing
    /// when reconciliation is disabled or the loop is already running.
    pub fn start(self: &Arc<Self>) {
        if !self.config.enabled {
            info!(queue = %self.adapter.queue_name(), "reconciliation disabled by configuration");
            return;
        }

        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        self.stopped.store(false, Ordering::Relaxed);

        let this = Arc::clone(self);
        let span = info_span!("reconciler", queue = %self.adapter.queue_name());
        *task = Some(tokio::spawn(
            async move { this.run_loop().await }.instrument(span),
        ));
        info!(queue = %self.adapter.queue_name(), "reconciler started");
    }

    /// Cancel the pending timer. An in-flight cycle is allowed to finish.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
        self.stop_signal.notify_waiters();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(error) = task.await {
                warn!(%error, "reconciler task ended abnormally");
            }
        }
    }

    /// Clear the failure quarantine and run one cycle immediately.
    pub async fn force_run(&self) -> Result<()> {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.run_cycle().await
    }

    /// Whether the reconciler is currently skipping work after repeated
    /// failures.
    pub fn is_quarantined(&self) -> bool {
        self.consecutive_failures.load(Ordering::Relaxed) >= MAX_CONSECUTIVE_FAILURES
    }

    async fn run_loop(&self) {
        loop {
            let delay = self.scheduler.lock().interval() + jitter();
            tokio::select! {
                _ = self.stop_signal.notified() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            if self.stopped.load(Ordering::Relaxed) {
                break;
            }

            if let Err(error) = self.run_cycle().await {
                warn!(%error, "reconciliation cycle failed");
            }
        }
        debug!("reconciler loop exited");
    }

    /// Run one cycle, guaranteed not to overlap another.
    async fn run_cycle(&self) -> Result<()> {
        if self
            .cycle_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("cycle already in flight, skipping");
            return Ok(());
        }

        let result = self.cycle_guarded().await;
        self.cycle_running.store(false, Ordering::Release);
        result
    }

    async fn cycle_guarded(&self) -> Result<()> {
        if self.is_quarantined() {
            warn!(
                failures = self.consecutive_failures.load(Ordering::Relaxed),
                "reconciler quarantined after repeated failures, skipping cycle"
            );
            return Ok(());
        }

        let span = info_span!("reconcile", queue = %self.adapter.queue_name());
        match self.reconcile_once().instrument(span).await {
            Ok((found, success_rate)) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                self.scheduler.lock().record_cycle(found, success_rate);
                Ok(())
            }
            Err(error) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                error!(%error, failures, "reconciliation cycle errored");
                Err(Error::reconciliation_caused_by(
                    "reconciliation cycle failed",
                    error,
                ))
            }
        }
    }

    /// Harvest stuck rows and hand the survivors to the adapter, spaced by
    /// the configured rate limit. Returns the total found and the
    /// re-enqueue success rate.
    async fn reconcile_once(&self) -> Result<(usize, f64)> {
        let harvest = self
            .repository
            .get_and_mark_stuck_jobs(
                self.adapter.queue_name(),
                self.config.stuck_threshold(),
                self.config.batch_size,
                self.config.use_heartbeat,
            )
            .await?;

        let found = harvest.total_found();
        if found == 0 {
            trace!("no stuck jobs found");
            return Ok((0, 1.0));
        }

        info!(
            found,
            dead = harvest.dead_ids.len(),
            to_reenqueue = harvest.to_reenqueue.len(),
            "recovering stuck jobs"
        );

        let spacing = self.config.reenqueue_spacing();
        let mut resolved = 0usize;
        for (index, record) in harvest.to_reenqueue.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(spacing).await;
            }
            match self.adapter.re_enqueue(record).await {
                // A skip means another agent progressed the job; the
                // record no longer needs recovery either way.
                Ok(_) => resolved += 1,
                Err(error) => {
                    warn!(job.id = %record.job_id, %error, "re-enqueue failed");
                }
            }
        }

        let success_rate = if harvest.to_reenqueue.is_empty() {
            1.0
        } else {
            resolved as f64 / harvest.to_reenqueue.len() as f64
        };

        Ok((found, success_rate))
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("queue", &self.adapter.queue_name())
            .field(
                "consecutive_failures",
                &self.consecutive_failures.load(Ordering::Relaxed),
            )
            .finish()
    }
}

fn jitter() -> Duration {
    let millis = rand::thread_rng().gen_range(0..=MAX_JITTER.as_millis() as u64);
    Duration::from_millis(millis)
}
