//! Optional tracing initialization for hosts without their own subscriber.

use crate::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Install a formatting subscriber honoring the logging configuration.
///
/// `RUST_LOG` takes precedence when set. Installing twice (or alongside a
/// host subscriber) is harmless; the second attempt is ignored.
pub fn init_tracing(config: &LoggingConfig) {
    if !config.enabled {
        return;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{}={}", config.prefix, config.level)));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
