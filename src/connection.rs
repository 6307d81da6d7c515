//! Pooled PostgreSQL client with an exhaustion monitor.
//!
//! Wraps a [`sqlx::PgPool`] built from [`PostgresConfig`] and runs a small
//! background task that samples pool statistics every five seconds. Three
//! consecutive samples with zero idle connections and the pool at its fixed
//! maximum declare the pool critically exhausted; [`ConnectionManager::check_pool_health`]
//! fails until a later sample shows recovery.

use crate::config::{PostgresConfig, PostgresSettings};
use crate::errors::{Error, Result};
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const MONITOR_INTERVAL: Duration = Duration::from_secs(5);
const EXHAUSTED_SAMPLES_BEFORE_CRITICAL: u32 = 3;

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    /// Connections currently open.
    pub total: u32,
    /// Connections currently idle.
    pub idle: usize,
    /// Fixed pool maximum.
    pub max: u32,
}

/// Tracks consecutive exhausted samples and the critical flag transition.
#[derive(Debug, Default)]
struct ExhaustionTracker {
    consecutive_exhausted: u32,
}

impl ExhaustionTracker {
    /// Feed one sample; returns whether the pool is critically exhausted.
    fn observe(&mut self, stats: PoolStats) -> bool {
        if stats.idle == 0 && stats.total >= stats.max {
            self.consecutive_exhausted += 1;
        } else {
            self.consecutive_exhausted = 0;
        }
        self.consecutive_exhausted >= EXHAUSTED_SAMPLES_BEFORE_CRITICAL
    }
}

/// Pooled database client plus its health monitor.
pub struct ConnectionManager {
    pool: PgPool,
    max_connections: u32,
    critical: Arc<AtomicBool>,
    monitor: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Build the pool and start the monitor task.
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        let max_connections = config.max_connections();
        let (options, idle_timeout, acquire_timeout) = connect_parameters(config)?;

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .idle_timeout(idle_timeout)
            .acquire_timeout(acquire_timeout)
            .connect_with(options)
            .await?;

        let critical = Arc::new(AtomicBool::new(false));
        let monitor = spawn_monitor(pool.clone(), max_connections, critical.clone());

        Ok(Self {
            pool,
            max_connections,
            critical,
            monitor: parking_lot::Mutex::new(Some(monitor)),
        })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Current pool statistics.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            total: self.pool.size(),
            idle: self.pool.num_idle(),
            max: self.max_connections,
        }
    }

    /// Fails while the monitor considers the pool critically exhausted.
    pub fn check_pool_health(&self) -> Result<()> {
        if self.critical.load(Ordering::Relaxed) {
            return Err(Error::postgres(
                "connection pool critically exhausted, rejecting work until it recovers",
            ));
        }
        Ok(())
    }

    /// Explicit startup probe.
    pub async fn test_connection(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        debug!("database connection probe succeeded");
        Ok(())
    }

    /// Stop the monitor and close the pool.
    pub async fn close(&self) {
        if let Some(monitor) = self.monitor.lock().take() {
            monitor.abort();
        }
        self.pool.close().await;
        info!("database pool closed");
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("max_connections", &self.max_connections)
            .field("critical", &self.critical.load(Ordering::Relaxed))
            .finish()
    }
}

fn spawn_monitor(pool: PgPool, max: u32, critical: Arc<AtomicBool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(MONITOR_INTERVAL);
        ticker.tick().await; // immediate first tick carries no signal
        let mut tracker = ExhaustionTracker::default();

        loop {
            ticker.tick().await;

            let stats = PoolStats {
                total: pool.size(),
                idle: pool.num_idle(),
                max,
            };

            let exhausted = tracker.observe(stats);
            let was_critical = critical.swap(exhausted, Ordering::Relaxed);

            if exhausted && !was_critical {
                error!(
                    total = stats.total,
                    max = stats.max,
                    "connection pool critically exhausted"
                );
            } else if !exhausted && was_critical {
                info!("connection pool recovered from exhaustion");
            } else if stats.idle == 0 && stats.total >= max {
                warn!(
                    total = stats.total,
                    max = stats.max,
                    "connection pool has no idle connections"
                );
            }
        }
    })
}

fn connect_parameters(config: &PostgresConfig) -> Result<(PgConnectOptions, Duration, Duration)> {
    match config {
        PostgresConfig::Url(url) => {
            let options =
                PgConnectOptions::from_str(url)?.options([("statement_timeout", "30000")]);
            Ok((options, Duration::from_secs(30), Duration::from_secs(2)))
        }
        PostgresConfig::Settings(settings) => {
            let PostgresSettings {
                host,
                port,
                database,
                user,
                password,
                idle_timeout_secs,
                connection_timeout_secs,
                statement_timeout_secs,
                ..
            } = settings;

            let mut options = PgConnectOptions::new()
                .host(host)
                .port(*port)
                .database(database)
                .username(user)
                .options([(
                    "statement_timeout",
                    (statement_timeout_secs * 1000).to_string(),
                )]);
            if let Some(password) = password {
                options = options.password(password);
            }

            Ok((
                options,
                Duration::from_secs(*idle_timeout_secs),
                Duration::from_secs(*connection_timeout_secs),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(total: u32, idle: usize, max: u32) -> PoolStats {
        PoolStats { total, idle, max }
    }

    #[test]
    fn three_exhausted_samples_trip_the_tracker() {
        let mut tracker = ExhaustionTracker::default();
        assert!(!tracker.observe(stats(10, 0, 10)));
        assert!(!tracker.observe(stats(10, 0, 10)));
        assert!(tracker.observe(stats(10, 0, 10)));
    }

    #[test]
    fn recovery_resets_the_tracker() {
        let mut tracker = ExhaustionTracker::default();
        assert!(!tracker.observe(stats(10, 0, 10)));
        assert!(!tracker.observe(stats(10, 0, 10)));
        // One healthy sample clears the streak.
        assert!(!tracker.observe(stats(10, 3, 10)));
        assert!(!tracker.observe(stats(10, 0, 10)));
        assert!(!tracker.observe(stats(10, 0, 10)));
        assert!(tracker.observe(stats(10, 0, 10)));
    }

    #[test]
    fn partial_pools_are_not_exhausted() {
        let mut tracker = ExhaustionTracker::default();
        for _ in 0..10 {
            assert!(!tracker.observe(stats(4, 0, 10)));
        }
    }

    #[test]
    fn url_config_produces_connect_options() {
        let config = PostgresConfig::Url("postgres://user@localhost:5433/jobs".into());
        let (options, idle, acquire) = connect_parameters(&config).unwrap();
        assert_eq!(options.get_host(), "localhost");
        assert_eq!(options.get_port(), 5433);
        assert_eq!(idle, Duration::from_secs(30));
        assert_eq!(acquire, Duration::from_secs(2));
    }

    #[test]
    fn invalid_url_is_a_postgres_error() {
        let config = PostgresConfig::Url("not a url".into());
        let err = connect_parameters(&config).unwrap_err();
        assert!(matches!(err, Error::PostgresConnection { .. }));
    }
}
