#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

use claims::{assert_none, assert_some};
use jobguard::adapter::{BeeAdapter, BullAdapter, BullMqAdapter};
use jobguard::{
    CircuitBreaker, Error, JobStatus, Limits, NewJob, QueueAdapter, QueueType, Repository,
    SubmitOptions, setup_database,
};
use serde_json::json;
use sqlx::PgPool;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use testcontainers_modules::redis::Redis;

/// Test utilities and common setup
mod test_utils {
    use super::*;
    use testcontainers::runners::AsyncRunner;

    pub(super) struct Stack {
        pub(super) pool: PgPool,
        pub(super) repository: Arc<Repository>,
        pub(super) redis_url: String,
        pub(super) redis: redis::Client,
        _postgres: ContainerAsync<Postgres>,
        _redis: ContainerAsync<Redis>,
    }

    pub(super) async fn setup() -> anyhow::Result<Stack> {
        let postgres = Postgres::default().start().await?;
        let pg_host = postgres.get_host().await?;
        let pg_port = postgres.get_host_port_ipv4(5432).await?;
        let connection_string =
            format!("postgresql://postgres:postgres@{pg_host}:{pg_port}/postgres");

        let pool = PgPool::connect(&connection_string).await?;
        setup_database(&pool).await?;

        let breaker = Arc::new(CircuitBreaker::new(50, Duration::from_secs(30)));
        let repository = Arc::new(Repository::new(pool.clone(), breaker));

        let redis_container = Redis::default().start().await?;
        let redis_host = redis_container.get_host().await?;
        let redis_port = redis_container.get_host_port_ipv4(6379).await?;
        let redis_url = format!("redis://{redis_host}:{redis_port}");
        let redis = redis::Client::open(redis_url.as_str())?;

        Ok(Stack {
            pool,
            repository,
            redis_url,
            redis,
            _postgres: postgres,
            _redis: redis_container,
        })
    }

    /// Poll `check` until it returns true or five seconds pass.
    pub(super) async fn eventually<F, Fut>(mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..50 {
            if check().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        false
    }

    /// Mirror a record and move it to `stuck`, as a harvest would.
    pub(super) async fn seed_stuck_record(
        pool: &PgPool,
        repository: &Repository,
        queue_type: QueueType,
        job_id: &str,
        attempts: i32,
    ) -> anyhow::Result<jobguard::JobRecord> {
        let data = json!({"seed": job_id});
        repository
            .insert_job(NewJob {
                queue_name: "qa",
                queue_type,
                job_id,
                job_name: None,
                data: &data,
                attempts,
                max_attempts: 3,
            })
            .await?;
        repository
            .update_job_status("qa", queue_type, job_id, JobStatus::Processing)
            .await?;
        sqlx::query(
            "UPDATE jobguard_jobs SET last_heartbeat = NOW() - INTERVAL '2 minutes'
             WHERE job_id = $1",
        )
        .bind(job_id)
        .execute(pool)
        .await?;
        let harvest = repository
            .get_and_mark_stuck_jobs("qa", Duration::from_secs(60), 100, true)
            .await?;
        let record = harvest
            .to_reenqueue
            .into_iter()
            .find(|r| r.job_id == job_id)
            .expect("seeded record should be harvested");
        Ok(record)
    }
}

#[tokio::test]
async fn bull_submit_enqueues_and_mirrors() -> anyhow::Result<()> {
    let stack = test_utils::setup().await?;
    let adapter = BullAdapter::connect(
        "qa",
        &stack.redis_url,
        None,
        stack.repository.clone(),
        Limits::default(),
    )
    .await?;

    let job_id = adapter
        .submit(SubmitOptions::new(json!({"n": 1})).name("send-email"))
        .await?;
    assert_eq!(job_id, "1");

    // Broker side: job hash and wait list entry.
    let mut conn = stack.redis.get_multiplexed_async_connection().await?;
    let wait: Vec<String> = redis::cmd("LRANGE")
        .arg("bull:qa:wait")
        .arg(0)
        .arg(-1)
        .query_async(&mut conn)
        .await?;
    assert_eq!(wait, vec!["1"]);
    let data: String = redis::cmd("HGET")
        .arg("bull:qa:1")
        .arg("data")
        .query_async(&mut conn)
        .await?;
    assert_eq!(data, r#"{"n":1}"#);

    // Mirror side: one pending record.
    let record = assert_some!(stack.repository.get_job("qa", QueueType::Bull, "1").await?);
    assert_eq!(record.status, JobStatus::Pending);
    assert_eq!(record.job_name.as_deref(), Some("send-email"));

    Ok(())
}

#[tokio::test]
async fn oversized_submissions_are_rejected_before_the_broker() -> anyhow::Result<()> {
    let stack = test_utils::setup().await?;
    let limits = Limits {
        max_job_data_size: 64,
        max_job_name_length: 10,
    };
    let adapter = BullAdapter::connect(
        "qa",
        &stack.redis_url,
        None,
        stack.repository.clone(),
        limits,
    )
    .await?;

    let long_name = "x".repeat(11);
    let err = adapter
        .submit(SubmitOptions::new(json!({})).name(long_name))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let big_payload = json!({"blob": "y".repeat(100)});
    let err = adapter.submit(SubmitOptions::new(big_payload)).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    // Nothing reached the broker or the mirror.
    let mut conn = stack.redis.get_multiplexed_async_connection().await?;
    let wait_len: i64 = redis::cmd("LLEN")
        .arg("bull:qa:wait")
        .query_async(&mut conn)
        .await?;
    assert_eq!(wait_len, 0);
    let stats = stack.repository.get_statistics("qa").await?;
    assert_eq!(stats.total, 0);

    Ok(())
}

#[tokio::test]
async fn bull_events_drive_the_mirror() -> anyhow::Result<()> {
    let stack = test_utils::setup().await?;
    let adapter = BullAdapter::connect(
        "qa",
        &stack.redis_url,
        None,
        stack.repository.clone(),
        Limits::default(),
    )
    .await?;

    let job_id = adapter.submit(SubmitOptions::new(json!({"n": 1}))).await?;
    adapter.attach_events().await?;

    // Publish until the subscriber (which attaches asynchronously) sees it.
    let mut conn = stack.redis.get_multiplexed_async_connection().await?;
    let repository = stack.repository.clone();
    let went_active = test_utils::eventually(|| {
        let mut conn = conn.clone();
        let repository = repository.clone();
        let job_id = job_id.clone();
        async move {
            let _: () = redis::cmd("PUBLISH")
                .arg("bull:qa:global:active")
                .arg(&job_id)
                .query_async(&mut conn)
                .await
                .unwrap();
            let record = repository
                .get_job("qa", QueueType::Bull, &job_id)
                .await
                .unwrap();
            record.is_some_and(|r| r.status == JobStatus::Processing)
        }
    })
    .await;
    assert!(went_active, "record never reached processing");

    // One failed event: attempts increment and the reason is recorded.
    let _: () = redis::cmd("PUBLISH")
        .arg("bull:qa:global:failed")
        .arg(format!(r#"{{"jobId":"{job_id}","failedReason":"worker crashed"}}"#))
        .query_async(&mut conn)
        .await?;

    let repository = stack.repository.clone();
    let failed = test_utils::eventually(|| {
        let repository = repository.clone();
        let job_id = job_id.clone();
        async move {
            let record = repository
                .get_job("qa", QueueType::Bull, &job_id)
                .await
                .unwrap();
            record.is_some_and(|r| r.status == JobStatus::Failed && r.attempts == 1)
        }
    })
    .await;
    assert!(failed, "record never reached failed");

    let record = assert_some!(stack.repository.get_job("qa", QueueType::Bull, &job_id).await?);
    assert_eq!(record.error_message.as_deref(), Some("worker crashed"));

    adapter.dispose().await;
    Ok(())
}

#[tokio::test]
async fn bull_re_enqueue_recovers_a_stuck_job() -> anyhow::Result<()> {
    let stack = test_utils::setup().await?;
    let adapter = BullAdapter::connect(
        "qa",
        &stack.redis_url,
        None,
        stack.repository.clone(),
        Limits::default(),
    )
    .await?;

    // The job exists on the broker (submitted, then picked up by a worker
    // that died: it sits in the active list).
    let job_id = adapter.submit(SubmitOptions::new(json!({"seed": "j"}))).await?;
    let mut conn = stack.redis.get_multiplexed_async_connection().await?;
    let _: () = redis::cmd("LREM")
        .arg("bull:qa:wait")
        .arg(0)
        .arg(&job_id)
        .query_async(&mut conn)
        .await?;
    let _: () = redis::cmd("LPUSH")
        .arg("bull:qa:active")
        .arg(&job_id)
        .query_async(&mut conn)
        .await?;

    // Mirror: processing, stale, harvested to stuck.
    stack
        .repository
        .update_job_status("qa", QueueType::Bull, &job_id, JobStatus::Processing)
        .await?;
    sqlx::query(
        "UPDATE jobguard_jobs SET last_heartbeat = NOW() - INTERVAL '2 minutes'
         WHERE job_id = $1",
    )
    .bind(&job_id)
    .execute(&stack.pool)
    .await?;
    let harvest = stack
        .repository
        .get_and_mark_stuck_jobs("qa", Duration::from_secs(60), 100, true)
        .await?;
    assert_eq!(harvest.to_reenqueue.len(), 1);

    let requeued = adapter.re_enqueue(&harvest.to_reenqueue[0]).await?;
    assert!(requeued);

    // Broker: out of active, back on wait, attempt count bumped.
    let active_len: i64 = redis::cmd("LLEN")
        .arg("bull:qa:active")
        .query_async(&mut conn)
        .await?;
    assert_eq!(active_len, 0);
    let wait: Vec<String> = redis::cmd("LRANGE")
        .arg("bull:qa:wait")
        .arg(0)
        .arg(-1)
        .query_async(&mut conn)
        .await?;
    assert_eq!(wait, vec![job_id.clone()]);
    let attempts_made: i32 = redis::cmd("HGET")
        .arg(format!("bull:qa:{job_id}"))
        .arg("attemptsMade")
        .query_async(&mut conn)
        .await?;
    assert_eq!(attempts_made, 1);

    // Mirror: pending again with the bumped count.
    let record = assert_some!(stack.repository.get_job("qa", QueueType::Bull, &job_id).await?);
    assert_eq!(record.status, JobStatus::Pending);
    assert_eq!(record.attempts, 1);

    Ok(())
}

#[tokio::test]
async fn re_enqueue_skips_records_that_progressed() -> anyhow::Result<()> {
    let stack = test_utils::setup().await?;
    let adapter = BullAdapter::connect(
        "qa",
        &stack.redis_url,
        None,
        stack.repository.clone(),
        Limits::default(),
    )
    .await?;

    let record =
        test_utils::seed_stuck_record(&stack.pool, &stack.repository, QueueType::Bull, "j1", 0)
            .await?;

    // A worker finished the job between harvest and recovery.
    stack
        .repository
        .update_job_status("qa", QueueType::Bull, "j1", JobStatus::Completed)
        .await?;

    let requeued = adapter.re_enqueue(&record).await?;
    assert!(!requeued);

    // Nothing was pushed to the broker.
    let mut conn = stack.redis.get_multiplexed_async_connection().await?;
    let wait_len: i64 = redis::cmd("LLEN")
        .arg("bull:qa:wait")
        .query_async(&mut conn)
        .await?;
    assert_eq!(wait_len, 0);

    Ok(())
}

#[tokio::test]
async fn re_enqueue_skips_jobs_the_broker_finished() -> anyhow::Result<()> {
    let stack = test_utils::setup().await?;
    let adapter = BullAdapter::connect(
        "qa",
        &stack.redis_url,
        None,
        stack.repository.clone(),
        Limits::default(),
    )
    .await?;

    let record =
        test_utils::seed_stuck_record(&stack.pool, &stack.repository, QueueType::Bull, "j1", 0)
            .await?;

    // Broker already stamped the job finished.
    let mut conn = stack.redis.get_multiplexed_async_connection().await?;
    let _: () = redis::cmd("HSET")
        .arg("bull:qa:j1")
        .arg("data")
        .arg("{}")
        .arg("finishedOn")
        .arg(1_700_000_000_000_i64)
        .query_async(&mut conn)
        .await?;

    let requeued = adapter.re_enqueue(&record).await?;
    assert!(!requeued);

    // The broker record was left untouched.
    let exists: bool = redis::cmd("EXISTS")
        .arg("bull:qa:j1")
        .query_async(&mut conn)
        .await?;
    assert!(exists);

    Ok(())
}

#[tokio::test]
async fn bullmq_submit_announces_on_the_event_stream() -> anyhow::Result<()> {
    let stack = test_utils::setup().await?;
    let adapter = BullMqAdapter::connect(
        "qb",
        &stack.redis_url,
        None,
        stack.repository.clone(),
        Limits::default(),
    )
    .await?;

    let job_id = adapter.submit(SubmitOptions::new(json!({"n": 2}))).await?;

    let mut conn = stack.redis.get_multiplexed_async_connection().await?;
    let stream_len: i64 = redis::cmd("XLEN")
        .arg("bull:qb:events")
        .query_async(&mut conn)
        .await?;
    assert_eq!(stream_len, 1);

    let record = assert_some!(stack.repository.get_job("qb", QueueType::BullMq, &job_id).await?);
    assert_eq!(record.status, JobStatus::Pending);

    Ok(())
}

#[tokio::test]
async fn bullmq_stream_events_drive_the_mirror() -> anyhow::Result<()> {
    let stack = test_utils::setup().await?;
    let adapter = BullMqAdapter::connect(
        "qb",
        &stack.redis_url,
        None,
        stack.repository.clone(),
        Limits::default(),
    )
    .await?;

    let job_id = adapter.submit(SubmitOptions::new(json!({"n": 2}))).await?;
    adapter.attach_events().await?;

    let mut conn = stack.redis.get_multiplexed_async_connection().await?;
    let repository = stack.repository.clone();
    let went_active = test_utils::eventually(|| {
        let mut conn = conn.clone();
        let repository = repository.clone();
        let job_id = job_id.clone();
        async move {
            let _: String = redis::cmd("XADD")
                .arg("bull:qb:events")
                .arg("*")
                .arg("event")
                .arg("active")
                .arg("jobId")
                .arg(&job_id)
                .query_async(&mut conn)
                .await
                .unwrap();
            let record = repository
                .get_job("qb", QueueType::BullMq, &job_id)
                .await
                .unwrap();
            record.is_some_and(|r| r.status == JobStatus::Processing)
        }
    })
    .await;
    assert!(went_active, "record never reached processing");

    let _: String = redis::cmd("XADD")
        .arg("bull:qb:events")
        .arg("*")
        .arg("event")
        .arg("completed")
        .arg("jobId")
        .arg(&job_id)
        .query_async(&mut conn)
        .await?;

    let repository = stack.repository.clone();
    let completed = test_utils::eventually(|| {
        let repository = repository.clone();
        let job_id = job_id.clone();
        async move {
            let record = repository
                .get_job("qb", QueueType::BullMq, &job_id)
                .await
                .unwrap();
            record.is_some_and(|r| r.status == JobStatus::Completed)
        }
    })
    .await;
    assert!(completed, "record never reached completed");

    adapter.dispose().await;
    Ok(())
}

#[tokio::test]
async fn bee_re_enqueue_creates_a_fresh_job_and_fails_the_old_record() -> anyhow::Result<()> {
    let stack = test_utils::setup().await?;
    let adapter = BeeAdapter::connect(
        "qc",
        &stack.redis_url,
        None,
        stack.repository.clone(),
        Limits::default(),
    )
    .await?;

    // Submit through the adapter so the broker hash exists, then simulate
    // the worker dying mid-flight.
    let old_id = adapter.submit(SubmitOptions::new(json!({"n": 3}))).await?;
    stack
        .repository
        .update_job_status("qc", QueueType::Bee, &old_id, JobStatus::Processing)
        .await?;
    sqlx::query(
        "UPDATE jobguard_jobs SET last_heartbeat = NOW() - INTERVAL '2 minutes'
         WHERE job_id = $1",
    )
    .bind(&old_id)
    .execute(&stack.pool)
    .await?;
    let harvest = stack
        .repository
        .get_and_mark_stuck_jobs("qc", Duration::from_secs(60), 100, true)
        .await?;
    assert_eq!(harvest.to_reenqueue.len(), 1);

    let requeued = adapter.re_enqueue(&harvest.to_reenqueue[0]).await?;
    assert!(requeued);

    // Old record is closed out as failed; Bee cannot reuse the id.
    let old = assert_some!(stack.repository.get_job("qc", QueueType::Bee, &old_id).await?);
    assert_eq!(old.status, JobStatus::Failed);

    // A fresh broker job and mirror record carry the work forward.
    let new_id = (old_id.parse::<i64>()? + 1).to_string();
    let new = assert_some!(stack.repository.get_job("qc", QueueType::Bee, &new_id).await?);
    assert_eq!(new.status, JobStatus::Pending);
    assert_eq!(new.attempts, 1);

    let mut conn = stack.redis.get_multiplexed_async_connection().await?;
    let stored: Option<String> = redis::cmd("HGET")
        .arg("bq:qc:jobs")
        .arg(&new_id)
        .query_async(&mut conn)
        .await?;
    assert_some!(stored);
    let old_stored: Option<String> = redis::cmd("HGET")
        .arg("bq:qc:jobs")
        .arg(&old_id)
        .query_async(&mut conn)
        .await?;
    assert_none!(old_stored);

    Ok(())
}

#[tokio::test]
async fn bee_events_drive_the_mirror() -> anyhow::Result<()> {
    let stack = test_utils::setup().await?;
    let adapter = BeeAdapter::connect(
        "qc",
        &stack.redis_url,
        None,
        stack.repository.clone(),
        Limits::default(),
    )
    .await?;

    let job_id = adapter.submit(SubmitOptions::new(json!({"n": 3}))).await?;
    adapter.attach_events().await?;

    let mut conn = stack.redis.get_multiplexed_async_connection().await?;
    let repository = stack.repository.clone();
    let succeeded = test_utils::eventually(|| {
        let mut conn = conn.clone();
        let repository = repository.clone();
        let job_id = job_id.clone();
        async move {
            let _: () = redis::cmd("PUBLISH")
                .arg("bq:qc:events")
                .arg(format!(r#"{{"id":"{job_id}","event":"succeeded","data":null}}"#))
                .query_async(&mut conn)
                .await
                .unwrap();
            let record = repository
                .get_job("qc", QueueType::Bee, &job_id)
                .await
                .unwrap();
            record.is_some_and(|r| r.status == JobStatus::Completed)
        }
    })
    .await;
    assert!(succeeded, "record never reached completed");

    adapter.dispose().await;
    Ok(())
}

#[tokio::test]
async fn dispose_stops_mirroring_but_not_the_broker() -> anyhow::Result<()> {
    let stack = test_utils::setup().await?;
    let adapter = BullAdapter::connect(
        "qa",
        &stack.redis_url,
        None,
        stack.repository.clone(),
        Limits::default(),
    )
    .await?;

    adapter.dispose().await;
    adapter.dispose().await; // idempotent

    let job_id = adapter.submit(SubmitOptions::new(json!({"n": 1}))).await?;

    // The broker still got the job; the mirror did not.
    let mut conn = stack.redis.get_multiplexed_async_connection().await?;
    let wait_len: i64 = redis::cmd("LLEN")
        .arg("bull:qa:wait")
        .query_async(&mut conn)
        .await?;
    assert_eq!(wait_len, 1);
    assert_none!(stack.repository.get_job("qa", QueueType::Bull, &job_id).await?);

    Ok(())
}
