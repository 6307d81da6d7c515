#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod adapter;
mod circuit_breaker;
mod cleanup;
mod config;
mod connection;
mod coordinator;
mod errors;
mod logging;
mod reconciler;
mod repository;
mod sanitize;
/// Database schema definitions.
pub mod schema;
mod scheduler;

pub use self::adapter::{
    BeeAdapter, BullAdapter, BullMqAdapter, JobEvent, QueueAdapter, SubmitOptions,
};
pub use self::circuit_breaker::{CircuitBreaker, CircuitBreakerMetrics, CircuitState};
pub use self::config::{
    JobGuardConfig, JobGuardConfigBuilder, Limits, LoggingConfig, MIN_STUCK_THRESHOLD_MS,
    PersistenceConfig, PostgresConfig, PostgresSettings, QueueConfig, ReconciliationConfig,
};
pub use self::connection::{ConnectionManager, PoolStats};
pub use self::coordinator::JobGuard;
pub use self::errors::{Error, Result};
pub use self::logging::init_tracing;
pub use self::reconciler::Reconciler;
pub use self::repository::{NewJob, Repository, StuckHarvest};
pub use self::sanitize::sanitize_error_message;
pub use self::schema::{JobRecord, JobStatus, QueueStatistics, QueueType};
pub use self::scheduler::AdaptiveScheduler;

/// Provision the `jobguard_jobs` table, its indexes and the `updated_at`
/// trigger. Idempotent; safe to run on every startup.
pub async fn setup_database(pool: &sqlx::PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| Error::from(sqlx::Error::from(e)))?;
    Ok(())
}
