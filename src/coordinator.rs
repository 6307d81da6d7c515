//! The top-level facade wiring the pipeline together.
//!
//! `JobGuard::create` builds, in order: connection manager, circuit
//! breaker, repository, the adapter variant selected by the configured
//! queue type, the reconciler and the cleanup task. Shutdown tears the
//! same stack down in reverse and is idempotent.

use crate::adapter::{BeeAdapter, BullAdapter, BullMqAdapter, QueueAdapter, SubmitOptions};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerMetrics};
use crate::cleanup::CleanupTask;
use crate::config::JobGuardConfig;
use crate::connection::{ConnectionManager, PoolStats};
use crate::errors::Result;
use crate::reconciler::Reconciler;
use crate::repository::Repository;
use crate::schema::{QueueStatistics, QueueType};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::info;

/// Consecutive database failures before the breaker opens.
const BREAKER_FAILURE_THRESHOLD: u32 = 5;
/// How long the breaker stays open before admitting a probe.
const BREAKER_RECOVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Durable state tracking attached to one queue.
///
/// See the crate documentation for a usage example.
pub struct JobGuard {
    config: JobGuardConfig,
    connection: Arc<ConnectionManager>,
    repository: Arc<Repository>,
    adapter: Arc<dyn QueueAdapter>,
    reconciler: Arc<Reconciler>,
    cleanup: CleanupTask,
    shutdown: AtomicBool,
}

impl JobGuard {
    /// Validate the configuration, connect to both stores, provision the
    /// mirror table, attach the broker event consumer and start the
    /// background loops. Returns a ready instance.
    pub async fn create(config: JobGuardConfig) -> Result<Self> {
        config.validate()?;

        let connection = Arc::new(ConnectionManager::connect(&config.postgres).await?);
        connection.test_connection().await?;
        crate::setup_database(connection.pool()).await?;

        let breaker = Arc::new(CircuitBreaker::new(
            BREAKER_FAILURE_THRESHOLD,
            BREAKER_RECOVERY_TIMEOUT,
        ));
        let repository = Arc::new(Repository::new(connection.pool().clone(), breaker));

        let adapter = build_adapter(&config, Arc::clone(&repository)).await?;
        adapter.attach_events().await?;

        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&repository),
            Arc::clone(&adapter),
            config.reconciliation.clone(),
        ));
        reconciler.start();

        let cleanup = CleanupTask::spawn(Arc::clone(&repository), config.persistence.clone());

        info!(
            queue = %config.queue.name,
            queue_type = %config.queue.queue_type,
            "jobguard attached"
        );

        Ok(Self {
            config,
            connection,
            repository,
            adapter,
            reconciler,
            cleanup,
            shutdown: AtomicBool::new(false),
        })
    }

    /// Enqueue a job on the broker and mirror it. See
    /// [`QueueAdapter::submit`] for the failure policy.
    pub async fn submit(&self, options: SubmitOptions) -> Result<String> {
        self.connection.check_pool_health()?;
        self.adapter.submit(options).await
    }

    /// Per-status record counts for the attached queue.
    pub async fn stats(&self) -> Result<QueueStatistics> {
        self.connection.check_pool_health()?;
        self.repository.get_statistics(&self.config.queue.name).await
    }

    /// Run one reconciliation cycle now, clearing any failure quarantine.
    pub async fn force_reconciliation(&self) -> Result<()> {
        self.reconciler.force_run().await
    }

    /// Refresh a job's liveness signal. Failures are swallowed.
    pub async fn heartbeat(&self, job_id: &str) {
        self.adapter.heartbeat(job_id).await;
    }

    /// Snapshot of the circuit breaker guarding the database.
    pub fn circuit_metrics(&self) -> CircuitBreakerMetrics {
        self.repository.breaker().metrics()
    }

    /// Current connection-pool statistics.
    pub fn pool_stats(&self) -> PoolStats {
        self.connection.stats()
    }

    /// The repository backing this guard, for direct queries.
    pub fn repository(&self) -> &Arc<Repository> {
        &self.repository
    }

    /// Stop the background loops, detach from the broker and close the
    /// pool. Idempotent; in-flight database operations finish first.
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        self.reconciler.stop().await;
        self.cleanup.stop();
        self.adapter.dispose().await;
        self.connection.close().await;
        info!(queue = %self.config.queue.name, "jobguard detached");
    }
}

impl std::fmt::Debug for JobGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobGuard")
            .field("queue", &self.config.queue.name)
            .field("queue_type", &self.config.queue.queue_type)
            .field("shutdown", &self.shutdown.load(Ordering::SeqCst))
            .finish()
    }
}

async fn build_adapter(
    config: &JobGuardConfig,
    repository: Arc<Repository>,
) -> Result<Arc<dyn QueueAdapter>> {
    let queue = &config.queue;
    let prefix = queue.key_prefix.as_deref();

    Ok(match queue.queue_type {
        QueueType::Bull => Arc::new(
            BullAdapter::connect(
                &queue.name,
                &queue.redis_url,
                prefix,
                repository,
                config.limits,
            )
            .await?,
        ),
        QueueType::BullMq => Arc::new(
            BullMqAdapter::connect(
                &queue.name,
                &queue.redis_url,
                prefix,
                repository,
                config.limits,
            )
            .await?,
        ),
        QueueType::Bee => Arc::new(
            BeeAdapter::connect(
                &queue.name,
                &queue.redis_url,
                prefix,
                repository,
                config.limits,
            )
            .await?,
        ),
    })
}
