//! Retention cleanup of terminal rows.
//!
//! A single task per process deletes completed/failed/dead rows older than
//! the retention window on a fixed cadence. Three consecutive failures
//! disable the timer until the process restarts; a broken database should
//! not be hammered hourly forever.

use crate::config::PersistenceConfig;
use crate::repository::Repository;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Handle to the background cleanup task.
pub(crate) struct CleanupTask {
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CleanupTask {
    /// Spawn the cleanup loop, or an inert handle when cleanup is disabled.
    pub(crate) fn spawn(repository: Arc<Repository>, config: PersistenceConfig) -> Self {
        if !config.cleanup_enabled {
            info!("retention cleanup disabled by configuration");
            return Self {
                task: Mutex::new(None),
            };
        }

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.cleanup_interval());
            ticker.tick().await; // the immediate first tick
            let mut consecutive_failures = 0u32;

            loop {
                ticker.tick().await;

                match repository.delete_old_jobs(config.retention_days).await {
                    Ok(deleted) => {
                        consecutive_failures = 0;
                        if deleted > 0 {
                            info!(deleted, "expired job records removed");
                        } else {
                            debug!("no expired job records to remove");
                        }
                    }
                    Err(err) => {
                        consecutive_failures += 1;
                        error!(
                            %err,
                            failures = consecutive_failures,
                            "retention cleanup failed"
                        );
                        if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                            error!("retention cleanup disabled until process restart");
                            break;
                        }
                    }
                }
            }
        });

        Self {
            task: Mutex::new(Some(task)),
        }
    }

    /// Cancel the timer.
    pub(crate) fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}
