//! Error types for the folio harvesting engine.

use thiserror::Error;

/// Result type alias using folio's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for folio operations.
///
/// Upstream failures come in two flavors with very different handling:
/// transient errors are retried within the current page and then absorbed
/// (the job ends `partial`, the gap detector picks the target up later),
/// while permanent errors abort only the offending partition. Persistence
/// and configuration errors are fatal to the running job.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Upstream call failed but may succeed on retry (timeout, rate limit, 5xx)
    #[error("Transient upstream error: {0}")]
    UpstreamTransient(String),

    /// Upstream rejected the query outright (malformed query, 4xx)
    #[error("Permanent upstream error: {0}")]
    UpstreamPermanent(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Harvest target not found
    #[error("Harvest target not found: {0}")]
    TargetNotFound(uuid::Uuid),

    /// Job queue error
    #[error("Job error: {0}")]
    Job(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether a failed upstream call may succeed if retried with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::UpstreamTransient(_))
    }

    /// Whether this error must abort the current job invocation.
    ///
    /// Upstream failures are absorbed by the executor (logged, the job ends
    /// `partial`); everything else surfaces to the scheduler as a job failure.
    pub fn is_fatal_to_job(&self) -> bool {
        !matches!(
            self,
            Error::UpstreamTransient(_) | Error::UpstreamPermanent(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            return Error::UpstreamTransient(e.to_string());
        }
        match e.status() {
            Some(status) if status.as_u16() == 429 || status.is_server_error() => {
                Error::UpstreamTransient(e.to_string())
            }
            Some(_) => Error::UpstreamPermanent(e.to_string()),
            None => Error::UpstreamTransient(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_error_display_transient() {
        let err = Error::UpstreamTransient("rate limited".to_string());
        assert_eq!(err.to_string(), "Transient upstream error: rate limited");
    }

    #[test]
    fn test_error_display_permanent() {
        let err = Error::UpstreamPermanent("malformed query".to_string());
        assert_eq!(err.to_string(), "Permanent upstream error: malformed query");
    }

    #[test]
    fn test_error_display_target_not_found() {
        let id = Uuid::nil();
        let err = Error::TargetNotFound(id);
        assert_eq!(err.to_string(), format!("Harvest target not found: {}", id));
    }

    #[test]
    fn test_error_display_config() {
        let err = Error::Config("bad partition scheme".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: bad partition scheme"
        );
    }

    #[test]
    fn test_transient_is_retryable() {
        assert!(Error::UpstreamTransient("timeout".into()).is_retryable());
    }

    #[test]
    fn test_permanent_is_not_retryable() {
        assert!(!Error::UpstreamPermanent("bad query".into()).is_retryable());
    }

    #[test]
    fn test_io_is_not_retryable() {
        let err = Error::Io(std::io::Error::other("disk"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_upstream_errors_are_not_fatal_to_job() {
        assert!(!Error::UpstreamTransient("timeout".into()).is_fatal_to_job());
        assert!(!Error::UpstreamPermanent("bad query".into()).is_fatal_to_job());
    }

    #[test]
    fn test_persistence_and_config_errors_are_fatal_to_job() {
        assert!(Error::Config("missing target".into()).is_fatal_to_job());
        assert!(Error::TargetNotFound(Uuid::nil()).is_fatal_to_job());
        assert!(Error::Internal("oops".into()).is_fatal_to_job());
        let db = Error::Database(sqlx::Error::PoolClosed);
        assert!(db.is_fatal_to_job());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let err: Error = json_err.into();
        match err {
            Error::Serialization(msg) => assert!(!msg.is_empty()),
            _ => panic!("Expected Serialization error"),
        }
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<Error>();
        assert_sync::<Error>();
    }

    #[test]
    fn test_result_type_ok() {
        fn get_result() -> Result<i32> {
            Ok(42)
        }
        assert_eq!(get_result().unwrap(), 42);
    }
}
