//! Database schema definitions.
//!
//! This module contains the record types mirrored into the
//! `jobguard_jobs` table and the status machine they move through.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Broker family a mirrored queue belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueType {
    /// Bull (v3) queues.
    Bull,
    /// BullMQ queues.
    #[serde(rename = "bullmq")]
    BullMq,
    /// Bee-Queue queues.
    Bee,
}

impl QueueType {
    /// The lowercase name stored in the `queue_type` column.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bull => "bull",
            Self::BullMq => "bullmq",
            Self::Bee => "bee",
        }
    }
}

impl fmt::Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bull" => Ok(Self::Bull),
            "bullmq" => Ok(Self::BullMq),
            "bee" => Ok(Self::Bee),
            other => Err(crate::Error::UnsupportedQueue(other.to_owned())),
        }
    }
}

/// Lifecycle state of a mirrored job.
///
/// `Completed`, `Failed` and `Dead` are terminal: a record never leaves
/// them, and a re-submitted job id creates a fresh record instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Accepted by the broker, not yet picked up by a worker.
    Pending,
    /// A worker is executing the job.
    Processing,
    /// The worker reported success.
    Completed,
    /// The worker reported a failure; the broker may still retry.
    Failed,
    /// The liveness signal went stale; the reconciler owns the record.
    Stuck,
    /// Retries exhausted. Nothing will run this record again.
    Dead,
}

impl JobStatus {
    /// The lowercase name stored in the `status` column.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stuck => "stuck",
            Self::Dead => "dead",
        }
    }

    /// Whether this status is terminal (append-only from here on).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Dead)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "stuck" => Ok(Self::Stuck),
            "dead" => Ok(Self::Dead),
            other => Err(crate::Error::Validation(format!(
                "unknown job status {other:?}"
            ))),
        }
    }
}

/// A mirrored job record in the `jobguard_jobs` table.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    /// Internal key, generated at insert.
    pub id: Uuid,
    /// Logical queue this job belongs to.
    pub queue_name: String,
    /// Broker family of the queue.
    pub queue_type: QueueType,
    /// Broker-assigned job identifier.
    pub job_id: String,
    /// Broker job kind. Absent for Bee-Queue, which has no named jobs.
    pub job_name: Option<String>,
    /// Arbitrary JSON payload.
    pub data: Value,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// Failures reported so far.
    pub attempts: i32,
    /// Failure budget taken from the producer options.
    pub max_attempts: i32,
    /// Last failure reason, sanitized before persisting.
    pub error_message: Option<String>,
    /// Set on insert.
    pub created_at: DateTime<Utc>,
    /// Bumped by a database trigger on any mutation.
    pub updated_at: DateTime<Utc>,
    /// Set when the record first enters `processing`.
    pub started_at: Option<DateTime<Utc>>,
    /// Set when the record enters any terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Last liveness ping from a worker, if any.
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Whether the record still has retry budget left.
    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

/// Per-status row counts for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatistics {
    /// Rows in `pending`.
    pub pending: i64,
    /// Rows in `processing`.
    pub processing: i64,
    /// Rows in `completed`.
    pub completed: i64,
    /// Rows in `failed`.
    pub failed: i64,
    /// Rows in `stuck`.
    pub stuck: i64,
    /// Rows in `dead`.
    pub dead: i64,
    /// All rows for the queue.
    pub total: i64,
}
