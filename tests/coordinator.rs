#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

use claims::{assert_err, assert_some};
use jobguard::{
    CircuitState, Error, JobGuard, JobGuardConfig, JobStatus, QueueType, ReconciliationConfig,
    SubmitOptions,
};
use serde_json::json;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use testcontainers_modules::redis::Redis;

/// Test utilities and common setup
mod test_utils {
    use super::*;
    use testcontainers::runners::AsyncRunner;

    pub(super) struct Stack {
        pub(super) postgres_url: String,
        pub(super) redis_url: String,
        _postgres: ContainerAsync<Postgres>,
        _redis: ContainerAsync<Redis>,
    }

    pub(super) async fn setup() -> anyhow::Result<Stack> {
        let postgres = Postgres::default().start().await?;
        let pg_host = postgres.get_host().await?;
        let pg_port = postgres.get_host_port_ipv4(5432).await?;
        let postgres_url = format!("postgresql://postgres:postgres@{pg_host}:{pg_port}/postgres");

        let redis_container = Redis::default().start().await?;
        let redis_host = redis_container.get_host().await?;
        let redis_port = redis_container.get_host_port_ipv4(6379).await?;
        let redis_url = format!("redis://{redis_host}:{redis_port}");

        Ok(Stack {
            postgres_url,
            redis_url,
            _postgres: postgres,
            _redis: redis_container,
        })
    }

    pub(super) fn config(stack: &Stack, queue_type: QueueType) -> JobGuardConfig {
        JobGuardConfig::builder()
            .queue("emails", queue_type, stack.redis_url.as_str())
            .postgres_url(stack.postgres_url.as_str())
            .build()
            .expect("default configuration should validate")
    }
}

#[tokio::test]
async fn create_submit_stats_shutdown() -> anyhow::Result<()> {
    let stack = test_utils::setup().await?;
    let guard = JobGuard::create(test_utils::config(&stack, QueueType::Bull)).await?;

    let job_id = guard
        .submit(SubmitOptions::new(json!({"to": "user@example.com"})).name("send-email"))
        .await?;

    let stats = guard.stats().await?;
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.total, 1);

    // A heartbeat on a pending job is swallowed, not an error.
    guard.heartbeat(&job_id).await;

    assert_eq!(guard.circuit_metrics().state, CircuitState::Closed);
    assert!(guard.pool_stats().max >= 1);

    guard.shutdown().await;
    guard.shutdown().await; // idempotent

    Ok(())
}

#[tokio::test]
async fn invalid_threshold_is_rejected_at_create() -> anyhow::Result<()> {
    let stack = test_utils::setup().await?;

    let mut config = test_utils::config(&stack, QueueType::Bull);
    config.reconciliation = ReconciliationConfig {
        stuck_threshold_ms: 1_000,
        ..Default::default()
    };

    let err = assert_err!(JobGuard::create(config).await);
    assert!(matches!(err, Error::Reconciliation { .. }));

    Ok(())
}

#[tokio::test]
async fn forced_reconciliation_recovers_an_abandoned_job() -> anyhow::Result<()> {
    let stack = test_utils::setup().await?;
    let guard = JobGuard::create(test_utils::config(&stack, QueueType::Bull)).await?;

    let job_id = guard.submit(SubmitOptions::new(json!({"n": 1}))).await?;

    // A worker picked the job up and died: the mirror shows processing
    // with a stale heartbeat.
    let repository = guard.repository().clone();
    repository
        .update_job_status("emails", QueueType::Bull, &job_id, JobStatus::Processing)
        .await?;
    let pool = sqlx::PgPool::connect(&stack.postgres_url).await?;
    sqlx::query(
        "UPDATE jobguard_jobs SET last_heartbeat = NOW() - INTERVAL '10 minutes'
         WHERE job_id = $1",
    )
    .bind(&job_id)
    .execute(&pool)
    .await?;

    guard.force_reconciliation().await?;

    let record = assert_some!(
        repository
            .get_job("emails", QueueType::Bull, &job_id)
            .await?
    );
    assert_eq!(record.status, JobStatus::Pending);
    assert_eq!(record.attempts, 1);

    guard.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn bee_guard_round_trips() -> anyhow::Result<()> {
    let stack = test_utils::setup().await?;
    let guard = JobGuard::create(test_utils::config(&stack, QueueType::Bee)).await?;

    let job_id = guard.submit(SubmitOptions::new(json!({"n": 9}))).await?;
    let record = assert_some!(
        guard
            .repository()
            .get_job("emails", QueueType::Bee, &job_id)
            .await?
    );
    assert_eq!(record.status, JobStatus::Pending);

    guard.shutdown().await;
    Ok(())
}
