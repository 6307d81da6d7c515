//! The authoritative layer for all data operations.
//!
//! Every public method runs through the circuit breaker and maps rows into
//! [`JobRecord`]. Concurrency discipline lives in the SQL itself: the
//! upsert's `ON CONFLICT` clause is the partial unique index's twin, status
//! transitions guard against terminal rows in their `WHERE` clauses, and
//! the stuck-job harvest locks rows with `FOR UPDATE SKIP LOCKED` so
//! concurrent harvesters never overlap.

use crate::circuit_breaker::CircuitBreaker;
use crate::errors::Result;
use crate::sanitize::sanitize_error_message;
use crate::schema::{JobRecord, JobStatus, QueueStatistics, QueueType};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};
use uuid::Uuid;

const RECORD_COLUMNS: &str = "id, queue_name, queue_type, job_id, job_name, data, status, \
     attempts, max_attempts, error_message, created_at, updated_at, started_at, completed_at, \
     last_heartbeat";

/// Raw row shape; statuses arrive as text and are parsed on the way out.
#[derive(Debug, FromRow)]
struct JobRow {
    id: Uuid,
    queue_name: String,
    queue_type: String,
    job_id: String,
    job_name: Option<String>,
    data: Value,
    status: String,
    attempts: i32,
    max_attempts: i32,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    last_heartbeat: Option<DateTime<Utc>>,
}

impl JobRow {
    fn into_record(self) -> Result<JobRecord> {
        Ok(JobRecord {
            id: self.id,
            queue_name: self.queue_name,
            queue_type: QueueType::from_str(&self.queue_type)?,
            job_id: self.job_id,
            job_name: self.job_name,
            data: self.data,
            status: JobStatus::from_str(&self.status)?,
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            error_message: self.error_message,
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            last_heartbeat: self.last_heartbeat,
        })
    }
}

/// Parameters for [`Repository::insert_job`].
#[derive(Debug, Clone)]
pub struct NewJob<'a> {
    /// Logical queue name.
    pub queue_name: &'a str,
    /// Broker family.
    pub queue_type: QueueType,
    /// Broker-assigned job identifier.
    pub job_id: &'a str,
    /// Broker job kind, if the family has one.
    pub job_name: Option<&'a str>,
    /// JSON payload.
    pub data: &'a Value,
    /// Attempts already consumed. Zero for fresh submissions; the
    /// re-enqueue path passes the incremented count.
    pub attempts: i32,
    /// Failure budget.
    pub max_attempts: i32,
}

/// Result of one stuck-job harvest transaction.
#[derive(Debug, Default)]
pub struct StuckHarvest {
    /// Records with retry budget left, now marked `stuck`, to hand to the
    /// adapter for broker-side re-enqueue.
    pub to_reenqueue: Vec<JobRecord>,
    /// Records whose budget is exhausted, now marked `dead`.
    pub dead_ids: Vec<Uuid>,
}

impl StuckHarvest {
    /// Total rows the harvest touched.
    pub fn total_found(&self) -> usize {
        self.to_reenqueue.len() + self.dead_ids.len()
    }
}

/// All SQL operations over the `jobguard_jobs` table.
#[derive(Debug)]
pub struct Repository {
    pool: PgPool,
    breaker: Arc<CircuitBreaker>,
}

impl Repository {
    /// Create a repository over the given pool, guarded by `breaker`.
    pub fn new(pool: PgPool, breaker: Arc<CircuitBreaker>) -> Self {
        Self { pool, breaker }
    }

    /// The circuit breaker guarding this repository.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Upsert a record for a freshly submitted (or re-enqueued) job.
    ///
    /// Inserts with status `pending`. A conflicting *active* record is
    /// updated in place (latest data wins, status back to `pending`);
    /// terminal records never conflict thanks to the partial index, so a
    /// re-submitted job id starts a fresh row. Returns `None` in the
    /// degenerate case where the update guard did not match; callers treat
    /// that as "already done".
    pub async fn insert_job(&self, job: NewJob<'_>) -> Result<Option<JobRecord>> {
        self.breaker
            .execute(move || async move {
                let sql = format!(
                    r"
                    INSERT INTO jobguard_jobs
                        (queue_name, queue_type, job_id, job_name, data, status, attempts, max_attempts)
                    VALUES ($1, $2, $3, $4, $5, 'pending', $6, $7)
                    ON CONFLICT (queue_name, queue_type, job_id)
                        WHERE status NOT IN ('completed', 'failed', 'dead')
                    DO UPDATE SET
                        data = EXCLUDED.data,
                        job_name = EXCLUDED.job_name,
                        attempts = EXCLUDED.attempts,
                        max_attempts = EXCLUDED.max_attempts,
                        status = 'pending'
                    WHERE jobguard_jobs.status NOT IN ('completed', 'failed', 'dead')
                    RETURNING {RECORD_COLUMNS}
                    "
                );

                let row = sqlx::query_as::<_, JobRow>(&sql)
                    .bind(job.queue_name)
                    .bind(job.queue_type.as_str())
                    .bind(job.job_id)
                    .bind(job.job_name)
                    .bind(job.data)
                    .bind(job.attempts)
                    .bind(job.max_attempts)
                    .fetch_optional(&self.pool)
                    .await?;

                trace!(job.id = %job.job_id, "job record upserted");
                row.map(JobRow::into_record).transpose()
            })
            .await
    }

    /// Move the active record for a job to `status`.
    ///
    /// Entering `processing` stamps `started_at` (first time only) and
    /// seeds `last_heartbeat`; entering a terminal state stamps
    /// `completed_at`. Terminal records are never touched.
    pub async fn update_job_status(
        &self,
        queue_name: &str,
        queue_type: QueueType,
        job_id: &str,
        status: JobStatus,
    ) -> Result<Option<JobRecord>> {
        self.breaker
            .execute(move || async move {
                let sql = format!(
                    r"
                    UPDATE jobguard_jobs SET
                        status = $4,
                        started_at = CASE
                            WHEN $4 = 'processing' AND started_at IS NULL THEN NOW()
                            ELSE started_at
                        END,
                        last_heartbeat = CASE
                            WHEN $4 = 'processing' THEN NOW()
                            ELSE last_heartbeat
                        END,
                        completed_at = CASE
                            WHEN $4 IN ('completed', 'failed', 'dead') THEN NOW()
                            ELSE completed_at
                        END
                    WHERE queue_name = $1 AND queue_type = $2 AND job_id = $3
                      AND status NOT IN ('completed', 'failed', 'dead')
                    RETURNING {RECORD_COLUMNS}
                    "
                );

                let row = sqlx::query_as::<_, JobRow>(&sql)
                    .bind(queue_name)
                    .bind(queue_type.as_str())
                    .bind(job_id)
                    .bind(status.as_str())
                    .fetch_optional(&self.pool)
                    .await?;

                row.map(JobRow::into_record).transpose()
            })
            .await
    }

    /// Record a reported failure on the active record.
    ///
    /// Increments `attempts`, stores the sanitized error text, and computes
    /// the new status in SQL so a racing mutator cannot split the
    /// read-modify-write: `dead` once the budget is exhausted, `failed`
    /// otherwise.
    pub async fn update_job_error(
        &self,
        queue_name: &str,
        queue_type: QueueType,
        job_id: &str,
        error_message: &str,
    ) -> Result<Option<JobRecord>> {
        let sanitized = sanitize_error_message(error_message);
        self.breaker
            .execute(move || async move {
                let sql = format!(
                    r"
                    UPDATE jobguard_jobs SET
                        attempts = attempts + 1,
                        error_message = $4,
                        status = CASE
                            WHEN attempts + 1 >= max_attempts THEN 'dead'
                            ELSE 'failed'
                        END,
                        completed_at = NOW()
                    WHERE queue_name = $1 AND queue_type = $2 AND job_id = $3
                      AND status NOT IN ('completed', 'failed', 'dead')
                    RETURNING {RECORD_COLUMNS}
                    "
                );

                let row = sqlx::query_as::<_, JobRow>(&sql)
                    .bind(queue_name)
                    .bind(queue_type.as_str())
                    .bind(job_id)
                    .bind(&sanitized)
                    .fetch_optional(&self.pool)
                    .await?;

                row.map(JobRow::into_record).transpose()
            })
            .await
    }

    /// Refresh the liveness signal. Only `processing` records are touched;
    /// anything else is a silent no-op. Returns whether a row was updated.
    pub async fn update_heartbeat(
        &self,
        queue_name: &str,
        queue_type: QueueType,
        job_id: &str,
    ) -> Result<bool> {
        self.breaker
            .execute(move || async move {
                let result = sqlx::query(
                    r"
                    UPDATE jobguard_jobs SET last_heartbeat = NOW()
                    WHERE queue_name = $1 AND queue_type = $2 AND job_id = $3
                      AND status = 'processing'
                    ",
                )
                .bind(queue_name)
                .bind(queue_type.as_str())
                .bind(job_id)
                .execute(&self.pool)
                .await?;

                Ok(result.rows_affected() > 0)
            })
            .await
    }

    /// Harvest stuck jobs for one queue inside a single transaction.
    ///
    /// Selects up to `batch_size` `processing` rows whose liveness signal
    /// (heartbeat, falling back to `updated_at`) is older than `threshold`,
    /// oldest first, skipping rows locked by a concurrent harvester. All
    /// selected rows are marked `stuck`; those out of retry budget are
    /// immediately moved on to `dead`.
    pub async fn get_and_mark_stuck_jobs(
        &self,
        queue_name: &str,
        threshold: Duration,
        batch_size: i64,
        use_heartbeat: bool,
    ) -> Result<StuckHarvest> {
        self.breaker
            .execute(move || async move {
                let liveness = if use_heartbeat {
                    "COALESCE(last_heartbeat, updated_at)"
                } else {
                    "updated_at"
                };
                let sql = format!(
                    r"
                    SELECT {RECORD_COLUMNS} FROM jobguard_jobs
                    WHERE queue_name = $1 AND status = 'processing'
                      AND {liveness} < NOW() - ($2::bigint * INTERVAL '1 millisecond')
                    ORDER BY {liveness} ASC
                    LIMIT $3
                    FOR UPDATE SKIP LOCKED
                    "
                );

                let mut tx = self.pool.begin().await?;

                let rows = sqlx::query_as::<_, JobRow>(&sql)
                    .bind(queue_name)
                    .bind(threshold.as_millis() as i64)
                    .bind(batch_size)
                    .fetch_all(&mut *tx)
                    .await?;

                if rows.is_empty() {
                    tx.commit().await?;
                    return Ok(StuckHarvest::default());
                }

                let all_ids: Vec<Uuid> = rows.iter().map(|row| row.id).collect();
                sqlx::query("UPDATE jobguard_jobs SET status = 'stuck' WHERE id = ANY($1)")
                    .bind(&all_ids)
                    .execute(&mut *tx)
                    .await?;

                let harvest = partition_harvest(rows)?;

                if !harvest.dead_ids.is_empty() {
                    sqlx::query(
                        r"
                        UPDATE jobguard_jobs
                        SET status = 'dead', completed_at = NOW()
                        WHERE id = ANY($1)
                        ",
                    )
                    .bind(&harvest.dead_ids)
                    .execute(&mut *tx)
                    .await?;
                }

                tx.commit().await?;

                debug!(
                    queue = %queue_name,
                    to_reenqueue = harvest.to_reenqueue.len(),
                    dead = harvest.dead_ids.len(),
                    "stuck jobs harvested"
                );
                Ok(harvest)
            })
            .await
    }

    /// Set `status` on a set of records by internal id. Terminal records
    /// are skipped. Empty input is a no-op.
    pub async fn bulk_update_status(&self, ids: &[Uuid], status: JobStatus) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.breaker
            .execute(move || async move {
                let result = sqlx::query(
                    r"
                    UPDATE jobguard_jobs SET
                        status = $2,
                        completed_at = CASE
                            WHEN $2 IN ('completed', 'failed', 'dead') THEN NOW()
                            ELSE completed_at
                        END
                    WHERE id = ANY($1)
                      AND status NOT IN ('completed', 'failed', 'dead')
                    ",
                )
                .bind(ids.to_vec())
                .bind(status.as_str())
                .execute(&self.pool)
                .await?;

                Ok(result.rows_affected())
            })
            .await
    }

    /// Move a set of records to `dead` by internal id. Empty input is a
    /// no-op.
    pub async fn bulk_mark_dead(&self, ids: &[Uuid]) -> Result<u64> {
        self.bulk_update_status(ids, JobStatus::Dead).await
    }

    /// Delete terminal records whose `completed_at` is older than the
    /// retention window. Returns how many rows were removed.
    pub async fn delete_old_jobs(&self, retention_days: u32) -> Result<u64> {
        self.breaker
            .execute(move || async move {
                let result = sqlx::query(
                    r"
                    DELETE FROM jobguard_jobs
                    WHERE status IN ('completed', 'failed', 'dead')
                      AND completed_at < NOW() - ($1::bigint * INTERVAL '1 day')
                    ",
                )
                .bind(i64::from(retention_days))
                .execute(&self.pool)
                .await?;

                Ok(result.rows_affected())
            })
            .await
    }

    /// Per-status counts for one queue.
    pub async fn get_statistics(&self, queue_name: &str) -> Result<QueueStatistics> {
        self.breaker
            .execute(move || async move {
                let counts: Vec<(String, i64)> = sqlx::query_as(
                    "SELECT status, COUNT(*) FROM jobguard_jobs WHERE queue_name = $1 GROUP BY status",
                )
                .bind(queue_name)
                .fetch_all(&self.pool)
                .await?;

                let mut stats = QueueStatistics::default();
                for (status, count) in counts {
                    stats.total += count;
                    match JobStatus::from_str(&status)? {
                        JobStatus::Pending => stats.pending = count,
                        JobStatus::Processing => stats.processing = count,
                        JobStatus::Completed => stats.completed = count,
                        JobStatus::Failed => stats.failed = count,
                        JobStatus::Stuck => stats.stuck = count,
                        JobStatus::Dead => stats.dead = count,
                    }
                }
                Ok(stats)
            })
            .await
    }

    /// Latest record for a business key, whatever its status.
    pub async fn get_job(
        &self,
        queue_name: &str,
        queue_type: QueueType,
        job_id: &str,
    ) -> Result<Option<JobRecord>> {
        self.breaker
            .execute(move || async move {
                let sql = format!(
                    r"
                    SELECT {RECORD_COLUMNS} FROM jobguard_jobs
                    WHERE queue_name = $1 AND queue_type = $2 AND job_id = $3
                    ORDER BY created_at DESC
                    LIMIT 1
                    "
                );

                let row = sqlx::query_as::<_, JobRow>(&sql)
                    .bind(queue_name)
                    .bind(queue_type.as_str())
                    .bind(job_id)
                    .fetch_optional(&self.pool)
                    .await?;

                row.map(JobRow::into_record).transpose()
            })
            .await
    }
}

/// Split harvested rows into the re-enqueue set (budget left, reported as
/// `stuck`) and the dead set (budget exhausted).
fn partition_harvest(rows: Vec<JobRow>) -> Result<StuckHarvest> {
    let mut harvest = StuckHarvest::default();
    for row in rows {
        let mut record = row.into_record()?;
        record.status = JobStatus::Stuck;
        if record.has_attempts_left() {
            harvest.to_reenqueue.push(record);
        } else {
            harvest.dead_ids.push(record.id);
        }
    }
    Ok(harvest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(attempts: i32, max_attempts: i32) -> JobRow {
        JobRow {
            id: Uuid::new_v4(),
            queue_name: "q".into(),
            queue_type: "bull".into(),
            job_id: "1".into(),
            job_name: None,
            data: json!({}),
            status: "processing".into(),
            attempts,
            max_attempts,
            error_message: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            started_at: Some(Utc::now()),
            completed_at: None,
            last_heartbeat: None,
        }
    }

    #[test]
    fn harvest_partitions_by_attempt_budget() {
        let rows = vec![row(0, 3), row(2, 3), row(3, 3), row(5, 3)];
        let harvest = partition_harvest(rows).unwrap();
        assert_eq!(harvest.to_reenqueue.len(), 2);
        assert_eq!(harvest.dead_ids.len(), 2);
        assert_eq!(harvest.total_found(), 4);
        assert!(
            harvest
                .to_reenqueue
                .iter()
                .all(|r| r.status == JobStatus::Stuck)
        );
    }

    #[test]
    fn unknown_status_fails_decoding() {
        let mut bad = row(0, 3);
        bad.status = "zombie".into();
        assert!(bad.into_record().is_err());
    }
}
