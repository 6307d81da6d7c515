//! Configuration surface of the coordinator.
//!
//! All sections deserialize with [`serde`] and carry defaults, so hosts can
//! describe only what they change. Construction-time validation lives in
//! [`JobGuardConfig::validate`]; the most important rule is the hard floor
//! on the stuck threshold, which keeps healthy jobs from being harvested.

use crate::errors::{Error, Result};
use crate::schema::QueueType;
use serde::Deserialize;
use std::time::Duration;

/// Hard floor for `stuck_threshold_ms`. Anything lower would classify
/// healthy jobs as stuck.
pub const MIN_STUCK_THRESHOLD_MS: u64 = 60_000;

/// Top-level configuration for [`JobGuard`](crate::JobGuard).
#[derive(Debug, Clone, Deserialize)]
pub struct JobGuardConfig {
    /// Which queue to attach to, and over which broker family.
    pub queue: QueueConfig,
    /// PostgreSQL endpoint and pool tuning.
    pub postgres: PostgresConfig,
    /// Reconciliation engine tuning.
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    /// Logging behavior.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Retention and cleanup of terminal rows.
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// Payload limits enforced on submit.
    #[serde(default)]
    pub limits: Limits,
}

impl JobGuardConfig {
    /// Start building a configuration.
    pub fn builder() -> JobGuardConfigBuilder {
        JobGuardConfigBuilder::default()
    }

    /// Check the configuration for values the runtime would misbehave on.
    pub fn validate(&self) -> Result<()> {
        if self.queue.name.is_empty() {
            return Err(Error::Validation("queue name must not be empty".into()));
        }
        if self.queue.name.len() > 100 {
            return Err(Error::Validation(
                "queue name must be at most 100 characters".into(),
            ));
        }
        if self.queue.redis_url.is_empty() {
            return Err(Error::Validation("broker redis url is required".into()));
        }
        if self.reconciliation.stuck_threshold_ms < MIN_STUCK_THRESHOLD_MS {
            return Err(Error::reconciliation(format!(
                "stuck_threshold_ms must be at least {MIN_STUCK_THRESHOLD_MS} (got {})",
                self.reconciliation.stuck_threshold_ms
            )));
        }
        if self.reconciliation.batch_size == 0 {
            return Err(Error::reconciliation("batch_size must be positive"));
        }
        if self.reconciliation.rate_limit_per_second == 0 {
            return Err(Error::reconciliation(
                "rate_limit_per_second must be positive",
            ));
        }
        Ok(())
    }
}

/// The queue the coordinator attaches to.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Logical queue name, at most 100 characters.
    pub name: String,
    /// Broker family of the queue.
    #[serde(rename = "type")]
    pub queue_type: QueueType,
    /// Redis endpoint the broker stores its jobs in.
    pub redis_url: String,
    /// Key prefix the broker was configured with. Defaults to the broker
    /// family's own default (`bull` for Bull/BullMQ, `bq` for Bee-Queue).
    #[serde(default)]
    pub key_prefix: Option<String>,
}

/// PostgreSQL endpoint: either a connection URL or structured settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PostgresConfig {
    /// A `postgres://` connection URL; pool tuning takes the defaults.
    Url(String),
    /// Structured settings including pool tuning.
    Settings(PostgresSettings),
}

/// Structured PostgreSQL settings.
#[derive(Debug, Clone, Deserialize)]
pub struct PostgresSettings {
    /// Host name.
    pub host: String,
    /// Port, default 5432.
    #[serde(default = "defaults::pg_port")]
    pub port: u16,
    /// Database name.
    pub database: String,
    /// User name.
    pub user: String,
    /// Password, if the server requires one.
    #[serde(default)]
    pub password: Option<String>,
    /// Fixed maximum of pooled connections.
    #[serde(default = "defaults::pool_max")]
    pub max_connections: u32,
    /// Idle connections are closed after this many seconds.
    #[serde(default = "defaults::idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Acquiring a connection fails after this many seconds.
    #[serde(default = "defaults::connection_timeout_secs")]
    pub connection_timeout_secs: u64,
    /// Server-side statement timeout in seconds.
    #[serde(default = "defaults::statement_timeout_secs")]
    pub statement_timeout_secs: u64,
}

impl PostgresConfig {
    /// Pool maximum for this configuration.
    pub fn max_connections(&self) -> u32 {
        match self {
            Self::Url(_) => defaults::pool_max(),
            Self::Settings(s) => s.max_connections,
        }
    }
}

/// Reconciliation engine tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    /// Whether the reconciler runs at all.
    pub enabled: bool,
    /// Base cycle interval in milliseconds. The adaptive scheduler keeps
    /// the effective interval within `[max(5s, base/4), base*4]`.
    pub interval_ms: u64,
    /// Liveness horizon in milliseconds; floor is 60 000.
    pub stuck_threshold_ms: u64,
    /// Rows harvested per cycle.
    pub batch_size: i64,
    /// Whether the interval adapts to cycle outcomes.
    pub adaptive_scheduling: bool,
    /// Upper bound on re-enqueues per second.
    pub rate_limit_per_second: u32,
    /// Whether `last_heartbeat` participates in the stuck query.
    pub use_heartbeat: bool,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 30_000,
            stuck_threshold_ms: 300_000,
            batch_size: 100,
            adaptive_scheduling: true,
            rate_limit_per_second: 20,
            use_heartbeat: true,
        }
    }
}

impl ReconciliationConfig {
    /// Base cycle interval as a [`Duration`].
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Liveness horizon as a [`Duration`].
    pub fn stuck_threshold(&self) -> Duration {
        Duration::from_millis(self.stuck_threshold_ms)
    }

    /// Spacing between consecutive re-enqueues.
    pub fn reenqueue_spacing(&self) -> Duration {
        Duration::from_millis(1000 / u64::from(self.rate_limit_per_second.max(1)))
    }
}

/// Logging behavior. The crate logs through [`tracing`]; these keys drive
/// the optional [`init_tracing`](crate::init_tracing) helper.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Whether the helper installs a subscriber at all.
    pub enabled: bool,
    /// Minimum level (`trace`..`error`).
    pub level: String,
    /// Tracing target prefix the crate logs under.
    pub prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: "info".into(),
            prefix: "jobguard".into(),
        }
    }
}

/// Retention and cleanup of terminal rows.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Terminal rows older than this many days are garbage-collected.
    pub retention_days: u32,
    /// Whether the cleanup timer runs.
    pub cleanup_enabled: bool,
    /// Cleanup cadence in milliseconds.
    pub cleanup_interval_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            retention_days: 7,
            cleanup_enabled: true,
            cleanup_interval_ms: 3_600_000,
        }
    }
}

impl PersistenceConfig {
    /// Cleanup cadence as a [`Duration`].
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

/// Payload limits enforced before a record is written.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Serialized payload cap in bytes.
    pub max_job_data_size: usize,
    /// Job name length cap in characters.
    pub max_job_name_length: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_job_data_size: 1_048_576,
            max_job_name_length: 255,
        }
    }
}

/// Builder for [`JobGuardConfig`].
#[derive(Debug, Default)]
pub struct JobGuardConfigBuilder {
    queue: Option<QueueConfig>,
    postgres: Option<PostgresConfig>,
    reconciliation: ReconciliationConfig,
    logging: LoggingConfig,
    persistence: PersistenceConfig,
    limits: Limits,
}

impl JobGuardConfigBuilder {
    /// Attach to the given queue over the given broker family.
    pub fn queue(
        mut self,
        name: impl Into<String>,
        queue_type: QueueType,
        redis_url: impl Into<String>,
    ) -> Self {
        self.queue = Some(QueueConfig {
            name: name.into(),
            queue_type,
            redis_url: redis_url.into(),
            key_prefix: None,
        });
        self
    }

    /// Override the broker key prefix.
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        if let Some(queue) = self.queue.as_mut() {
            queue.key_prefix = Some(prefix.into());
        }
        self
    }

    /// Point the mirror at this PostgreSQL URL.
    pub fn postgres_url(mut self, url: impl Into<String>) -> Self {
        self.postgres = Some(PostgresConfig::Url(url.into()));
        self
    }

    /// Use structured PostgreSQL settings instead of a URL.
    pub fn postgres_settings(mut self, settings: PostgresSettings) -> Self {
        self.postgres = Some(PostgresConfig::Settings(settings));
        self
    }

    /// Replace the reconciliation section.
    pub fn reconciliation(mut self, reconciliation: ReconciliationConfig) -> Self {
        self.reconciliation = reconciliation;
        self
    }

    /// Replace the logging section.
    pub fn logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = logging;
        self
    }

    /// Replace the persistence section.
    pub fn persistence(mut self, persistence: PersistenceConfig) -> Self {
        self.persistence = persistence;
        self
    }

    /// Replace the limits section.
    pub fn limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Validate and produce the configuration.
    pub fn build(self) -> Result<JobGuardConfig> {
        let queue = self
            .queue
            .ok_or_else(|| Error::Validation("queue configuration is required".into()))?;
        let postgres = self
            .postgres
            .ok_or_else(|| Error::Validation("postgres configuration is required".into()))?;

        let config = JobGuardConfig {
            queue,
            postgres,
            reconciliation: self.reconciliation,
            logging: self.logging,
            persistence: self.persistence,
            limits: self.limits,
        };
        config.validate()?;
        Ok(config)
    }
}

mod defaults {
    pub(super) fn pg_port() -> u16 {
        5432
    }

    pub(super) fn pool_max() -> u32 {
        10
    }

    pub(super) fn idle_timeout_secs() -> u64 {
        30
    }

    pub(super) fn connection_timeout_secs() -> u64 {
        2
    }

    pub(super) fn statement_timeout_secs() -> u64 {
        30
    }
}
