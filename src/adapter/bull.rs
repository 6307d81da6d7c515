//! Adapter for Bull (v3) queues.
//!
//! Bull keeps each job in a hash at `{prefix}:{queue}:{id}` with its state
//! lists alongside, and broadcasts global lifecycle events over pub/sub
//! channels. The atomic re-enqueue check relies on the `finishedOn` and
//! `failedReason` hash fields Bull stamps on completion.

use super::{AdapterCore, JobEvent, QueueAdapter, SubmitOptions};
use crate::config::Limits;
use crate::errors::Result;
use crate::repository::Repository;
use crate::schema::{JobRecord, QueueType};
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::Script;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_PREFIX: &str = "bull";
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Deletes a job from Bull's store only while it is still unprocessed.
/// KEYS: job hash, wait, active, delayed, paused. ARGV: job id.
static REMOVE_IF_UNPROCESSED: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        if redis.call('EXISTS', KEYS[1]) == 0 then return 0 end
        if redis.call('HEXISTS', KEYS[1], 'finishedOn') == 1 then return 0 end
        if redis.call('HEXISTS', KEYS[1], 'failedReason') == 1 then return 0 end
        redis.call('LREM', KEYS[2], 0, ARGV[1])
        redis.call('LREM', KEYS[3], 0, ARGV[1])
        redis.call('ZREM', KEYS[4], ARGV[1])
        redis.call('LREM', KEYS[5], 0, ARGV[1])
        redis.call('DEL', KEYS[1])
        return 1
        ",
    )
});

/// Bull's key layout under `{prefix}:{queue}`.
#[derive(Debug, Clone)]
struct BullKeys {
    root: String,
}

impl BullKeys {
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

    fn delayed(&self) -> String {
        format!("{}:delayed", self.root)
    }

    fn paused(&self) -> String {
        format!("{}:paused", self.root)
    }

    fn global_event(&self, event: &str) -> String {
        format!("{}:global:{event}", self.root)
    }
}

/// Sidecar adapter over a Bull queue's Redis store.
pub struct BullAdapter {
    core: Arc<AdapterCore>,
    client: redis::Client,
    conn: ConnectionManager,
    keys: BullKeys,
}

impl BullAdapter {
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
        let keys = BullKeys::new(key_prefix.unwrap_or(DEFAULT_PREFIX), queue_name);

        Ok(Self {
            core: Arc::new(AdapterCore::new(
                repository,
                queue_name.to_owned(),
                QueueType::Bull,
                limits,
            )),
            client,
            conn,
            keys,
        })
    }

    /// Write the job hash and push it onto the wait list, atomically.
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
            .arg("data")
            .arg(payload)
            .arg("opts")
            .arg(&opts)
            .arg("timestamp")
            .arg(timestamp)
            .arg("attemptsMade")
            .arg(attempts_made);
        if let Some(name) = name {
            pipe.arg("name").arg(name);
        }
        pipe.cmd("LPUSH").arg(self.keys.wait()).arg(job_id);
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

    /// Non-atomic removal: read broker state, bail on any processed marker,
    /// then delete. A worker finishing between the check and the delete can
    /// cause one duplicate execution; at-least-once still holds.
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
        pipe.cmd("ZREM").arg(self.keys.delayed()).arg(job_id);
        pipe.cmd("LREM").arg(self.keys.paused()).arg(0).arg(job_id);
        pipe.cmd("DEL").arg(&job_key);
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(true)
    }
}

#[async_trait]
impl QueueAdapter for BullAdapter {
    fn queue_type(&self) -> QueueType {
        QueueType::Bull
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
        let keys = self.keys.clone();
        let core = self.core.clone();

        let task = tokio::spawn(async move {
            let channels = [
                keys.global_event("active"),
                keys.global_event("completed"),
                keys.global_event("failed"),
            ];
            loop {
                let mut pubsub = match client.get_async_pubsub().await {
                    Ok(pubsub) => pubsub,
                    Err(error) => {
                        warn!(%error, "bull event subscription failed, retrying");
                        tokio::time::sleep(RECONNECT_DELAY).await;
                        continue;
                    }
                };
                if let Err(error) = pubsub.subscribe(&channels[..]).await {
                    warn!(%error, "bull event subscribe failed, retrying");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }

                let mut messages = pubsub.into_on_message();
                while let Some(msg) = messages.next().await {
                    let Ok(payload) = msg.get_payload::<String>() else {
                        continue;
                    };
                    if let Some(event) = parse_event(&keys, msg.get_channel_name(), &payload) {
                        core.apply_event(event).await;
                    }
                }

                if core.is_disposed() {
                    break;
                }
                warn!("bull event stream closed, reconnecting");
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

        // Upsert flips the record back to pending with the bumped count.
        self.core
            .record_submission(
                &record.job_id,
                record.job_name.as_deref(),
                &record.data,
                attempts,
                record.max_attempts,
            )
            .await;

        debug!(job.id = %record.job_id, attempts, "job re-enqueued on bull");
        Ok(true)
    }

    async fn heartbeat(&self, job_id: &str) {
        self.core.heartbeat(job_id).await;
    }

    async fn dispose(&self) {
        self.core.dispose();
    }
}

/// Decode a pub/sub message into a lifecycle event. Failed events carry a
/// JSON payload with the reason; the other channels carry the bare job id.
fn parse_event(keys: &BullKeys, channel: &str, payload: &str) -> Option<JobEvent> {
    if channel == keys.global_event("active") {
        Some(JobEvent::Active {
            job_id: payload.to_owned(),
        })
    } else if channel == keys.global_event("completed") {
        Some(JobEvent::Completed {
            job_id: payload.to_owned(),
        })
    } else if channel == keys.global_event("failed") {
        let (job_id, reason) = parse_failed_payload(payload);
        Some(JobEvent::Failed { job_id, reason })
    } else {
        None
    }
}

fn parse_failed_payload(payload: &str) -> (String, String) {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) {
        if let Some(job_id) = value.get("jobId").and_then(|v| v.as_str()) {
            let reason = value
                .get("failedReason")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            return (job_id.to_owned(), reason.to_owned());
        }
    }
    (payload.to_owned(), String::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        let keys = BullKeys::new("bull", "emails");
        assert_eq!(keys.job("7"), "bull:emails:7");
        assert_eq!(keys.id_counter(), "bull:emails:id");
        assert_eq!(keys.wait(), "bull:emails:wait");
        assert_eq!(keys.global_event("failed"), "bull:emails:global:failed");
    }

    #[test]
    fn custom_prefix_is_respected() {
        let keys = BullKeys::new("myapp", "emails");
        assert_eq!(keys.wait(), "myapp:emails:wait");
    }

    #[test]
    fn parses_bare_and_json_failed_payloads() {
        let (id, reason) = parse_failed_payload("42");
        assert_eq!(id, "42");
        assert_eq!(reason, "");

        let (id, reason) =
            parse_failed_payload(r#"{"jobId":"42","failedReason":"worker crashed"}"#);
        assert_eq!(id, "42");
        assert_eq!(reason, "worker crashed");
    }

    #[test]
    fn event_parsing_matches_channels() {
        let keys = BullKeys::new("bull", "emails");
        let event = parse_event(&keys, "bull:emails:global:active", "3");
        assert_eq!(event, Some(JobEvent::Active { job_id: "3".into() }));
        assert_eq!(parse_event(&keys, "bull:other:global:active", "3"), None);
    }
}
