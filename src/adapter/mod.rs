//! Queue adapters: the broker-specific surface of the guard.
//!
//! An adapter is the wrapper the host constructs around its queue's Redis
//! connection. It intercepts submission (every submit is observed and
//! mirrored), consumes the broker's lifecycle events, and performs the
//! atomic broker-side re-enqueue during recovery. One adapter variant
//! exists per broker family; they share validation, event handling and the
//! submit-path error policy through [`AdapterCore`].

mod bee;
mod bull;
mod bullmq;

pub use bee::BeeAdapter;
pub use bull::BullAdapter;
pub use bullmq::BullMqAdapter;

use crate::config::Limits;
use crate::errors::{Error, Result};
use crate::repository::{NewJob, Repository};
use crate::schema::{JobRecord, JobStatus, QueueType};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Producer-facing options for one submission.
#[derive(Debug, Clone)]
pub struct SubmitOptions {
    /// Broker job kind. Ignored by Bee-Queue, which has no named jobs.
    pub name: Option<String>,
    /// JSON payload.
    pub data: Value,
    /// Failure budget for the job.
    pub max_attempts: i32,
}

impl SubmitOptions {
    /// Submit `data` with the default failure budget of 3.
    pub fn new(data: Value) -> Self {
        Self {
            name: None,
            data,
            max_attempts: 3,
        }
    }

    /// Set the broker job kind.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the failure budget.
    pub fn max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

/// A lifecycle transition reported by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    /// A worker picked the job up.
    Active {
        /// Broker job id.
        job_id: String,
    },
    /// The job finished successfully.
    Completed {
        /// Broker job id.
        job_id: String,
    },
    /// The job failed.
    Failed {
        /// Broker job id.
        job_id: String,
        /// Failure reason as reported by the broker.
        reason: String,
    },
}

/// Capability set every broker family implements.
#[async_trait]
pub trait QueueAdapter: Send + Sync {
    /// Broker family of this adapter.
    fn queue_type(&self) -> QueueType;

    /// The queue this adapter is attached to.
    fn queue_name(&self) -> &str;

    /// Enqueue a job on the broker and mirror it as `pending`.
    ///
    /// Validation failures surface to the caller; a database failure after
    /// a successful broker enqueue is logged and swallowed (the job runs
    /// either way).
    async fn submit(&self, options: SubmitOptions) -> Result<String>;

    /// Start consuming the broker's lifecycle events in the background.
    async fn attach_events(&self) -> Result<()>;

    /// Attempt to recover one stuck record: re-verify it, atomically remove
    /// it from the broker if still unprocessed, and re-submit it. Returns
    /// whether a re-enqueue actually happened.
    async fn re_enqueue(&self, record: &JobRecord) -> Result<bool>;

    /// Refresh the record's liveness signal. Failures are swallowed; a
    /// missed heartbeat only risks a premature stuck classification.
    async fn heartbeat(&self, job_id: &str);

    /// Detach from the broker: stop the event consumer and stop mirroring
    /// new submissions. Idempotent.
    async fn dispose(&self);
}

/// State and behavior shared by all adapter variants.
pub(crate) struct AdapterCore {
    pub(crate) repository: Arc<Repository>,
    pub(crate) queue_name: String,
    pub(crate) queue_type: QueueType,
    pub(crate) limits: Limits,
    disposed: AtomicBool,
    event_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl AdapterCore {
    pub(crate) fn new(
        repository: Arc<Repository>,
        queue_name: String,
        queue_type: QueueType,
        limits: Limits,
    ) -> Self {
        Self {
            repository,
            queue_name,
            queue_type,
            limits,
            disposed: AtomicBool::new(false),
            event_task: parking_lot::Mutex::new(None),
        }
    }

    /// Whether `dispose` has run. A disposed adapter still forwards
    /// submissions to the broker but no longer mirrors them, matching the
    /// decorator being removed.
    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Relaxed)
    }

    pub(crate) fn store_event_task(&self, task: JoinHandle<()>) {
        if let Some(previous) = self.event_task.lock().replace(task) {
            previous.abort();
        }
    }

    pub(crate) fn dispose(&self) {
        if self.disposed.swap(true, Ordering::Relaxed) {
            return;
        }
        if let Some(task) = self.event_task.lock().take() {
            task.abort();
        }
        debug!(queue = %self.queue_name, "adapter disposed");
    }

    /// Check producer input against the configured limits and return the
    /// serialized payload.
    pub(crate) fn validate_submit(&self, options: &SubmitOptions) -> Result<String> {
        if let Some(name) = &options.name {
            if name.len() > self.limits.max_job_name_length {
                return Err(Error::Validation(format!(
                    "job name is {} characters, limit is {}",
                    name.len(),
                    self.limits.max_job_name_length
                )));
            }
        }

        let serialized = serde_json::to_string(&options.data)
            .map_err(|e| Error::Validation(format!("job data is not serializable: {e}")))?;
        if serialized.len() > self.limits.max_job_data_size {
            return Err(Error::Validation(format!(
                "serialized job data is {} bytes, limit is {}",
                serialized.len(),
                self.limits.max_job_data_size
            )));
        }

        Ok(serialized)
    }

    /// Mirror a successful broker enqueue. Database failures are logged,
    /// never surfaced; the job already exists on the broker.
    pub(crate) async fn record_submission(
        &self,
        job_id: &str,
        name: Option<&str>,
        data: &Value,
        attempts: i32,
        max_attempts: i32,
    ) {
        let result = self
            .repository
            .insert_job(NewJob {
                queue_name: &self.queue_name,
                queue_type: self.queue_type,
                job_id,
                job_name: name,
                data,
                attempts,
                max_attempts,
            })
            .await;

        if let Err(error) = result {
            warn!(
                queue = %self.queue_name,
                job.id = %job_id,
                %error,
                "failed to mirror submitted job, it will run untracked until the next lifecycle event"
            );
        }
    }

    /// Apply one broker lifecycle event to the mirror. Errors are logged
    /// and never propagate into the broker's event loop.
    pub(crate) async fn apply_event(&self, event: JobEvent) {
        let result = match &event {
            JobEvent::Active { job_id } => self
                .repository
                .update_job_status(
                    &self.queue_name,
                    self.queue_type,
                    job_id,
                    JobStatus::Processing,
                )
                .await
                .map(|_| ()),
            JobEvent::Completed { job_id } => self
                .repository
                .update_job_status(
                    &self.queue_name,
                    self.queue_type,
                    job_id,
                    JobStatus::Completed,
                )
                .await
                .map(|_| ()),
            JobEvent::Failed { job_id, reason } => self
                .repository
                .update_job_error(&self.queue_name, self.queue_type, job_id, reason)
                .await
                .map(|_| ()),
        };

        if let Err(error) = result {
            warn!(
                queue = %self.queue_name,
                ?event,
                %error,
                "failed to apply broker event to mirror"
            );
        }
    }

    /// Re-verify a record before broker-side recovery. Another agent may
    /// have progressed the job since the harvest; only still-`stuck`
    /// records proceed.
    pub(crate) async fn verify_still_stuck(&self, record: &JobRecord) -> Result<bool> {
        let current = self
            .repository
            .get_job(&self.queue_name, self.queue_type, &record.job_id)
            .await?;

        match current {
            Some(current) if current.status == JobStatus::Stuck => Ok(true),
            Some(current) => {
                debug!(
                    job.id = %record.job_id,
                    status = %current.status,
                    "skipping re-enqueue, record progressed since harvest"
                );
                Ok(false)
            }
            None => {
                debug!(job.id = %record.job_id, "skipping re-enqueue, record vanished");
                Ok(false)
            }
        }
    }

    /// Delegate a worker heartbeat to the repository, swallowing failures.
    pub(crate) async fn heartbeat(&self, job_id: &str) {
        if let Err(error) = self
            .repository
            .update_heartbeat(&self.queue_name, self.queue_type, job_id)
            .await
        {
            debug!(job.id = %job_id, %error, "heartbeat not recorded");
        }
    }
}
