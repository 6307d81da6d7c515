//! Adapter for BullMQ queues.
//!
//! BullMQ shares Bull's hash-per-job layout but broadcasts lifecycle
//! events over a Redis stream at `{prefix}:{queue}:events` instead of
//! pub/sub. Events are consumed through a dedicated subscriber connection
//! that is shut down when the adapter is disposed.

use super::{AdapterCore, JobEvent, QueueAdapter, SubmitOptions};
use crate::config::Limits;
use crate::errors::Result;
use crate::repository::Repository;
use crate::schema::{JobRecord, QueueType};
use async_trait::async_trait;
use redis::Script;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_PREFIX: &str = "bull";
const EVENT_BLOCK_MS: usize = 5_000;
const EVENT_BATCH: usize = 64;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Deletes a job from BullMQ's store only while it is still unprocessed.
/// KEYS: job hash, wait, active, prioritized, delayed, paused. ARGV: job id.
static REMOVE_IF_UNPROCESSED: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        if redis.call('EXISTS', KEYS[1]) == 0 then return 0 end
        if redis.call('HEXISTS', KEYS[1], 'finishedOn') == 1 then return 0 end
        if redis.call('HEXISTS', KEYS[1], 'failedReason') == 1 then return 0 end
        redis.call('LREM', KEYS[2], 0, ARGV[1])
        redis.call('LREM', KEYS[3], 0, ARGV[1])
        redis.call('ZREM', KEYS[4], ARGV[1])
        redis.call('ZREM', KEYS[5], ARGV[1])
        redis.call('LREM', KEYS[6], 0, ARGV[1])
        redis.call('DEL', KEYS[1])
        return 1
        ",
    )
});

/// BullMQ's key layout under `{prefix}:{queue}`.
#[derive(Debug, Clone)]
struct BullMqKeys {
    root: String,
}

impl BullMqKeys {
    fn new(prefix: &str, queue: &str) -> Self {
        Self {
            root: format!("{prefix}:{queue}"),
        }
    }

    fn job(&self, id: &str) -> String {
        format!("{}:{id}", self.root)
    }

    fn id_counter(&self) -> String {
        format!("{}:id", self.root)
    }

    fn wait(&self) -> String {
        format!("{}:wait", self.root)
    }

    fn active(&self) -> String {
        format!("{}:active", self.root)
    }

    fn prioritized(&self) -> String {
        format!("{}:prioritized", self.root)
    }

    fn delayed(&self) -> String {
        format!("{}:delayed", self.root)
    }

    fn paused(&self) -> String {
        format!("{}:paused", self.root)
    }

    fn events(&self) -> String {
        format!("{}:events", self.root)
    }
}

/// Sidecar adapter over a BullMQ queue's Redis store.
pub struct BullMqAdapter {
    core: Arc<AdapterCore>,
    client: redis::Client,
    conn: ConnectionManager,
    keys: BullMqKeys,
}

impl BullMqAdapter {
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
        let keys = BullMqKeys::new(key_prefix.unwrap_or(DEFAULT_PREFIX), queue_name);

        Ok(Self {
            core: Arc::new(AdapterCore::new(
                repository,
                queue_name.to_owned(),
                QueueType::BullMq,
                limits,
            )),
            client,
            conn,
            keys,
        })
    }

    /// Write the job hash, push it onto the wait list and announce it on
    /// the event stream, atomically.
    async fn broker_enqueue(
        &self,
        job_id: &str,
        name: Option<&str>,
        payload: &str,
        attempts_made: i32,
        max_attempts: i32,
    ) -> Result<()> {
        let opts = serde_json::json!({ "attempts": max_attempts }).to_string();
        let timestamp = chrono::Utc::now().timestamp_millis();

        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("HSET")
            .arg(self.keys.job(job_id))
            .arg("name")
            .arg(name.unwrap_or("__default__"))
            .arg("data")
            .arg(payload)
            .arg("opts")
            .arg(&opts)
            .arg("timestamp")
            .arg(timestamp)
            .arg("attemptsMade")
            .arg(attempts_made);
        pipe.cmd("LPUSH").arg(self.keys.wait()).arg(job_id);
        pipe.cmd("XADD")
            .arg(self.keys.events())
            .arg("*")
            .arg("event")
            .arg("waiting")
            .arg("jobId")
            .arg(job_id);
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn remove_if_unprocessed(&self, job_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let invocation = {
            let mut inv = REMOVE_IF_UNPROCESSED.prepare_invoke();
            inv.key(self.keys.job(job_id))
                .key(self.keys.wait())
                .key(self.keys.active())
                .key(self.keys.prioritized())
                .key(self.keys.delayed())
                .key(self.keys.paused())
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
        let job_key = self.keys.job(job_id);

        let exists: bool = redis::cmd("EXISTS")
            .arg(&job_key)
            .query_async(&mut conn)
            .await?;
        if !exists {
            return Ok(false);
        }
        let finished: bool = redis::cmd("HEXISTS")
            .arg(&job_key)
            .arg("finishedOn")
            .query_async(&mut conn)
            .await?;
        let failed: bool = redis::cmd("HEXISTS")
            .arg(&job_key)
            .arg("failedReason")
            .query_async(&mut conn)
            .await?;
        if finished || failed {
            return Ok(false);
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("LREM").arg(self.keys.wait()).arg(0).arg(job_id);
        pipe.cmd("LREM").arg(self.keys.active()).arg(0).arg(job_id);
        pipe.cmd("ZREM").arg(self.keys.prioritized()).arg(job_id);
        pipe.cmd("ZREM").arg(self.keys.delayed()).arg(job_id);
        pipe.cmd("LREM").arg(self.keys.paused()).arg(0).arg(job_id);
        pipe.cmd("DEL").arg(&job_key);
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(true)
    }
}

#[async_trait]
impl QueueAdapter for BullMqAdapter {
    fn queue_type(&self) -> QueueType {
        QueueType::BullMq
    }

    fn queue_name(&self) -> &str {
        &self.core.queue_name
    }

    async fn submit(&self, options: SubmitOptions) -> Result<String> {
        let payload = self.core.validate_submit(&options)?;

        let mut conn = self.conn.clone();
        let id: i64 = redis::cmd("INCR")
            .arg(self.keys.id_counter())
            .query_async(&mut conn)
            .await?;
        let job_id = id.to_string();

        self.broker_enqueue(
            &job_id,
            options.name.as_deref(),
            &payload,
            0,
            options.max_attempts,
        )
        .await?;

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
        let stream_key = self.keys.events();
        let core = self.core.clone();

        // The subscriber holds its own connection so a blocking XREAD never
        // contends with command traffic; dispose aborts the task, which
        // drops the connection with it.
        let task = tokio::spawn(async move {
            let options = StreamReadOptions::default()
                .block(EVENT_BLOCK_MS)
                .count(EVENT_BATCH);
            // Only events published after attachment are of interest.
            let mut last_id = "$".to_owned();

            loop {
                let mut subscriber = match client.get_multiplexed_async_connection().await {
                    Ok(conn) => conn,
                    Err(error) => {
                        warn!(%error, "bullmq event subscriber connection failed, retrying");
                        tokio::time::sleep(RECONNECT_DELAY).await;
                        continue;
                    }
                };

                loop {
                    let reply: StreamReadReply = match subscriber
                        .xread_options(&[stream_key.as_str()], &[last_id.as_str()], &options)
                        .await
                    {
                        Ok(reply) => reply,
                        Err(error) => {
                            warn!(%error, "bullmq event read failed, reconnecting");
                            tokio::time::sleep(RECONNECT_DELAY).await;
                            break;
                        }
                    };

                    for stream in reply.keys {
                        for entry in stream.ids {
                            last_id = entry.id.clone();
                            let event_name: Option<String> = entry.get("event");
                            let job_id: Option<String> = entry.get("jobId");
                            let (Some(event_name), Some(job_id)) = (event_name, job_id) else {
                                continue;
                            };
                            if let Some(event) = map_event(&event_name, job_id, &entry) {
                                core.apply_event(event).await;
                            }
                        }
                    }

                    if core.is_disposed() {
                        return;
                    }
                }
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

        let attempts = record.attempts + 1;
        let payload = serde_json::to_string(&record.data)
            .map_err(|e| crate::Error::Validation(format!("stored job data unserializable: {e}")))?;

        self.broker_enqueue(
            &record.job_id,
            record.job_name.as_deref(),
            &payload,
            attempts,
            record.max_attempts,
        )
        .await?;

        self.core
            .record_submission(
                &record.job_id,
                record.job_name.as_deref(),
                &record.data,
                attempts,
                record.max_attempts,
            )
            .await;

        debug!(job.id = %record.job_id, attempts, "job re-enqueued on bullmq");
        Ok(true)
    }

    async fn heartbeat(&self, job_id: &str) {
        self.core.heartbeat(job_id).await;
    }

    async fn dispose(&self) {
        self.core.dispose();
    }
}

fn map_event(
    event_name: &str,
    job_id: String,
    entry: &redis::streams::StreamId,
) -> Option<JobEvent> {
    match event_name {
        "active" => Some(JobEvent::Active { job_id }),
        "completed" => Some(JobEvent::Completed { job_id }),
        "failed" => {
            let reason: String = entry.get("failedReason").unwrap_or_default();
            Some(JobEvent::Failed { job_id, reason })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        let keys = BullMqKeys::new("bull", "exports");
        assert_eq!(keys.job("12"), "bull:exports:12");
        assert_eq!(keys.events(), "bull:exports:events");
        assert_eq!(keys.prioritized(), "bull:exports:prioritized");
    }

    #[test]
    fn unknown_events_are_ignored() {
        let entry = redis::streams::StreamId::default();
        assert_eq!(map_event("drained", "1".into(), &entry), None);
        assert_eq!(map_event("progress", "1".into(), &entry), None);
    }

    #[test]
    fn known_events_map_to_transitions() {
        let entry = redis::streams::StreamId::default();
        assert_eq!(
            map_event("active", "1".into(), &entry),
            Some(JobEvent::Active { job_id: "1".into() })
        );
        assert_eq!(
            map_event("completed", "1".into(), &entry),
            Some(JobEvent::Completed { job_id: "1".into() })
        );
        assert_eq!(
            map_event("failed", "1".into(), &entry),
            Some(JobEvent::Failed {
                job_id: "1".into(),
                reason: String::new()
            })
        );
    }
}
