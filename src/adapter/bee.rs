//! Adapter for Bee-Queue queues.
//!
//! Bee-Queue keeps all jobs for a queue in one hash at
//! `{prefix}:{queue}:jobs` (id → JSON payload) with waiting/active lists
//! and succeeded/failed sets alongside, and broadcasts events as JSON over
//! a single pub/sub channel.
//!
//! Bee cannot enqueue a job under an externally chosen id, so recovery
//! creates a *new* broker job and marks the old record `failed` rather
//! than `pending`; the active-uniqueness invariant stays intact. This is a
//! documented limitation of the Bee variant.

use super::{AdapterCore, JobEvent, QueueAdapter, SubmitOptions};
use crate::config::Limits;
use crate::errors::Result;
use crate::repository::Repository;
use crate::schema::{JobRecord, JobStatus, QueueType};
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::Script;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_PREFIX: &str = "bq";
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Deletes a job from Bee's store only while it is still unprocessed.
/// KEYS: jobs hash, succeeded set, failed set, waiting, active. ARGV: job id.
static REMOVE_IF_UNPROCESSED: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        if redis.call('HEXISTS', KEYS[1], ARGV[1]) == 0 then return 0 end
        if redis.call('SISMEMBER', KEYS[2], ARGV[1]) == 1 then return 0 end
        if redis.call('SISMEMBER', KEYS[3], ARGV[1]) == 1 then return 0 end
        redis.call('LREM', KEYS[4], 0, ARGV[1])
        redis.call('LREM', KEYS[5], 0, ARGV[1])
        redis.call('HDEL', KEYS[1], ARGV[1])
        return 1
        ",
    )
});

/// Bee-Queue's key layout under `{prefix}:{queue}`.
#[derive(Debug, Clone)]
struct BeeKeys {
    root: String,
}

impl BeeKeys {
    fn new(prefix: &str, queue: &str) -> Self {
        Self {
            root: format!("{prefix}:{queue}"),
        }
    }

    fn jobs(&self) -> String {
        format!("{}:jobs", self.root)
    }

    fn id_counter(&self) -> String {
        format!("{}:id", self.root)
    }

    fn waiting(&self) -> String {
        format!("{}:waiting", self.root)
    }

    fn active(&self) -> String {
        format!("{}:active", self.root)
    }

    fn succeeded(&self) -> String {
        format!("{}:succeeded", self.root)
    }

    fn failed(&self) -> String {
        format!("{}:failed", self.root)
    }

    fn events(&self) -> String {
        format!("{}:events", self.root)
    }
}

/// Sidecar adapter over a Bee-Queue queue's Redis store.
pub struct BeeAdapter {
    core: Arc<AdapterCore>,
    client: redis::Client,
    conn: ConnectionManager,
    keys: BeeKeys,
}

impl BeeAdapter {
    /// Connect to the queue's Redis endpoint.
    pub async fn connect(
        queue_name: &str,
        redis_url: &str,
        key_prefix: Option<&str>,
        repository: Arc<Repository>,
        limits: Limits,
    ) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        let keys = BeeKeys::new(key_prefix.unwrap_or(DEFAULT_PREFIX), queue_name);

        Ok(Self {
            core: Arc::new(AdapterCore::new(
                repository,
                queue_name.to_owned(),
                QueueType::Bee,
                limits,
            )),
            client,
            conn,
            keys,
        })
    }

    /// Allocate an id, store the job JSON and push it onto the waiting
    /// list. Returns the new broker id.
    async fn broker_enqueue(&self, payload: &str) -> Result<String> {
        let mut conn = self.conn.clone();
        let id: i64 = redis::cmd("INCR")
            .arg(self.keys.id_counter())
            .query_async(&mut conn)
            .await?;
        let job_id = id.to_string();

        let stored = serde_json::json!({ "data": payload, "options": {} }).to_string();

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("HSET")
            .arg(self.keys.jobs())
            .arg(&job_id)
            .arg(&stored);
        pipe.cmd("LPUSH").arg(self.keys.waiting()).arg(&job_id);
        let _: () = pipe.query_async(&mut conn).await?;

        Ok(job_id)
    }

    async fn remove_if_unprocessed(&self, job_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let invocation = {
            let mut inv = REMOVE_IF_UNPROCESSED.prepare_invoke();
            inv.key(self.keys.jobs())
                .key(self.keys.succeeded())
                .key(self.keys.failed())
                .key(self.keys.waiting())
                .key(self.keys.active())
                .arg(job_id);
            inv
        };

        let removed: redis::RedisResult<i32> = invocation.invoke_async(&mut conn).await;
        match removed {
            Ok(removed) => Ok(removed == 1),
            Err(error) => {
                warn!(
                    job.id = %job_id,
                    %error,
                    "atomic removal script failed, falling back to non-atomic removal"
                );
                self.remove_fallback(job_id).await
            }
        }
    }

    /// Non-atomic removal; same caveat as the Bull variant.
    async fn remove_fallback(&self, job_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();

        let exists: bool = redis::cmd("HEXISTS")
            .arg(self.keys.jobs())
            .arg(job_id)
            .query_async(&mut conn)
            .await?;
        if !exists {
            return Ok(false);
        }
        let succeeded: bool = redis::cmd("SISMEMBER")
            .arg(self.keys.succeeded())
            .arg(job_id)
            .query_async(&mut conn)
            .await?;
        let failed: bool = redis::cmd("SISMEMBER")
            .arg(self.keys.failed())
            .arg(job_id)
            .query_async(&mut conn)
            .await?;
        if succeeded || failed {
            return Ok(false);
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("LREM").arg(self.keys.waiting()).arg(0).arg(job_id);
        pipe.cmd("LREM").arg(self.keys.active()).arg(0).arg(job_id);
        pipe.cmd("HDEL").arg(self.keys.jobs()).arg(job_id);
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(true)
    }
}

#[async_trait]
impl QueueAdapter for BeeAdapter {
    fn queue_type(&self) -> QueueType {
        QueueType::Bee
    }

    fn queue_name(&self) -> &str {
        &self.core.queue_name
    }

    async fn submit(&self, options: SubmitOptions) -> Result<String> {
        // Bee has no named jobs; a provided name is still validated and
        // mirrored so the record is searchable.
        let payload = self.core.validate_submit(&options)?;

        let job_id = self.broker_enqueue(&payload).await?;

        if !self.core.is_disposed() {
            self.core
                .record_submission(
                    &job_id,
                    options.name.as_deref(),
                    &options.data,
                    0,
                    options.max_attempts,
                )
                .await;
        }

        Ok(job_id)
    }

    async fn attach_events(&self) -> Result<()> {
        let client = self.client.clone();
        let channel = self.keys.events();
        let core = self.core.clone();

        let task = tokio::spawn(async move {
            loop {
                let mut pubsub = match client.get_async_pubsub().await {
                    Ok(pubsub) => pubsub,
                    Err(error) => {
                        warn!(%error, "bee event subscription failed, retrying");
                        tokio::time::sleep(RECONNECT_DELAY).await;
                        continue;
                    }
                };
                if let Err(error) = pubsub.subscribe(&channel).await {
                    warn!(%error, "bee event subscribe failed, retrying");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }

                let mut messages = pubsub.into_on_message();
                while let Some(msg) = messages.next().await {
                    let Ok(payload) = msg.get_payload::<String>() else {
                        continue;
                    };
                    if let Some(event) = parse_event(&payload) {
                        core.apply_event(event).await;
                    }
                }

                if core.is_disposed() {
                    break;
                }
                warn!("bee event stream closed, reconnecting");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        });

        self.core.store_event_task(task);
        Ok(())
    }

    async fn re_enqueue(&self, record: &JobRecord) -> Result<bool> {
        if !self.core.verify_still_stuck(record).await? {
            return Ok(false);
        }

        if !self.remove_if_unprocessed(&record.job_id).await? {
            debug!(
                job.id = %record.job_id,
                "broker shows job processed or absent, skipping re-enqueue"
            );
            return Ok(false);
        }

        // The old record cannot go back to pending under a broker id that
        // no longer exists; close it out as failed.
        if let Err(error) = self
            .core
            .repository
            .update_job_status(
                &self.core.queue_name,
                QueueType::Bee,
                &record.job_id,
                JobStatus::Failed,
            )
            .await
        {
            warn!(job.id = %record.job_id, %error, "failed to close out stuck bee record");
        }

        let payload = serde_json::to_string(&record.data)
            .map_err(|e| crate::Error::Validation(format!("stored job data unserializable: {e}")))?;
        let new_id = self.broker_enqueue(&payload).await?;

        // The replacement keeps the consumed attempt budget.
        self.core
            .record_submission(
                &new_id,
                record.job_name.as_deref(),
                &record.data,
                record.attempts + 1,
                record.max_attempts,
            )
            .await;

        debug!(
            old.id = %record.job_id,
            new.id = %new_id,
            "job re-created on bee under a fresh id"
        );
        Ok(true)
    }

    async fn heartbeat(&self, job_id: &str) {
        self.core.heartbeat(job_id).await;
    }

    async fn dispose(&self) {
        self.core.dispose();
    }
}

/// Bee publishes `{"id": "...", "event": "...", "data": ...}` messages on
/// the queue's event channel.
fn parse_event(payload: &str) -> Option<JobEvent> {
    let value: serde_json::Value = serde_json::from_str(payload).ok()?;
    let job_id = match value.get("id")? {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        _ => return None,
    };

    match value.get("event")?.as_str()? {
        "started" => Some(JobEvent::Active { job_id }),
        "succeeded" => Some(JobEvent::Completed { job_id }),
        "failed" => {
            let reason = value
                .get("data")
                .map(|data| match data.as_str() {
                    Some(s) => s.to_owned(),
                    None => data.to_string(),
                })
                .unwrap_or_default();
            Some(JobEvent::Failed { job_id, reason })
        }
        _ => None,
    }
}
