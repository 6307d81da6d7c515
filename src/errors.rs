use std::time::Duration;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure kinds surfaced to callers.
///
/// The variants deliberately separate "the database is overloaded"
/// (`CircuitBreakerOpen`), "the database is unreachable"
/// (`PostgresConnection`) and "you gave us something we cannot accept"
/// (`Validation`, `UnsupportedQueue`), so callers can pick a retry policy
/// per kind.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The circuit breaker guarding the database is open; calls fail fast
    /// until the recovery timeout elapses. Back off instead of retrying
    /// immediately.
    #[error("circuit breaker is open, database calls are failing fast (retry after {retry_after:?})")]
    CircuitBreakerOpen {
        /// How long until the breaker admits a probe again.
        retry_after: Duration,
    },

    /// Connectivity or pool-exhaustion failure on the PostgreSQL side.
    #[error("postgres error: {message}")]
    PostgresConnection {
        /// What failed.
        message: String,
        /// The driver error, when one exists (pool-exhaustion checks have
        /// none).
        #[source]
        source: Option<sqlx::Error>,
    },

    /// A broker-side (Redis) command failed.
    #[error("broker error: {0}")]
    Broker(#[from] redis::RedisError),

    /// Adapter selection failed; fatal at construction.
    #[error("unsupported queue type: {0}")]
    UnsupportedQueue(String),

    /// An error escaped from a reconciliation cycle, or the reconciler was
    /// configured with invalid parameters.
    #[error("reconciliation error: {message}")]
    Reconciliation {
        /// Human-readable description of what went wrong.
        message: String,
        /// The underlying failure, when one exists.
        #[source]
        cause: Option<Box<Error>>,
    },

    /// Payload too large, job name too long, or payload unserializable.
    #[error("validation error: {0}")]
    Validation(String),
}

impl From<sqlx::Error> for Error {
    fn from(source: sqlx::Error) -> Self {
        Self::PostgresConnection {
            message: source.to_string(),
            source: Some(source),
        }
    }
}

impl Error {
    /// Build a [`Error::PostgresConnection`] with no driver error behind it.
    pub(crate) fn postgres(message: impl Into<String>) -> Self {
        Self::PostgresConnection {
            message: message.into(),
            source: None,
        }
    }

    /// Build a [`Error::Reconciliation`] without an underlying cause.
    pub(crate) fn reconciliation(message: impl Into<String>) -> Self {
        Self::Reconciliation {
            message: message.into(),
            cause: None,
        }
    }

    /// Build a [`Error::Reconciliation`] wrapping the error that escaped
    /// from a cycle.
    pub(crate) fn reconciliation_caused_by(message: impl Into<String>, cause: Error) -> Self {
        Self::Reconciliation {
            message: message.into(),
            cause: Some(Box::new(cause)),
        }
    }
}
