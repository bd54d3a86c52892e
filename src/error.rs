use thiserror::Error;

/// Domain-significant error kinds surfaced across the store, job worker,
/// and external interfaces. Ad-hoc call sites still use `anyhow::Result`;
/// this enum exists for the kinds callers need to match on (see
/// `src/ipc/mod.rs::classify_error`).
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("active session-runner job already exists for session {session_id}")]
    ActiveJobExists { session_id: String },

    #[error("context limit: {0}")]
    ContextLimit(String),

    #[error("resume failed: {0}")]
    ResumeFailed(String),

    #[error("timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("no longer answerable: {0}")]
    NoLongerAnswerable(String),
}

/// Transient vs. terminal classification for subprocess failures
/// (SPEC_FULL.md §4.6 / spec.md §4.6).
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("overloaded")]
    Overloaded,

    #[error("rate limited")]
    RateLimited,

    #[error("service unavailable")]
    ServiceUnavailable,

    #[error("unauthorized")]
    Unauthorized,

    #[error("context limit: {0}")]
    ContextLimit(String),

    #[error("resume failed: {0}")]
    ResumeFailed(String),

    #[error("timeout")]
    Timeout,

    #[error("cancelled")]
    Cancelled,

    #[error("executable not found: {0}")]
    ExecutableNotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DriverError {
    /// Transient driver errors are retried by the job queue up to
    /// `max_attempts` with fixed backoff; everything else is terminal.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            DriverError::Overloaded | DriverError::RateLimited | DriverError::ServiceUnavailable
        )
    }
}
