//! Core error taxonomy.
//!
//! Every fallible core operation returns [`CoreError`]. The variants map
//! one-to-one onto the externally visible error kinds: validation failures
//! and state-machine violations surface to the caller and are never retried
//! or replicated; transient failures are retried by the RPC and sync layers;
//! fatal errors quiesce the owning component.

use std::fmt;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CoreError {
    /// Caller-supplied data rejected (bad coordinates, empty id, out-of-range battery).
    #[error("validation error: {0}")]
    Validation(String),

    /// State-machine precondition violated (e.g. pausing a PENDING mission).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Entity absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// No free UAV for dispatch, subscriber cap reached, queue full.
    #[error("capacity exhausted: {0}")]
    CapacityExhausted(String),

    /// RPC timeout, connection error, repository temporary failure.
    #[error("transient error: {0}")]
    Transient(String),

    /// Persistent-state corruption or impossible invariant violation.
    /// The affected component enters a quiescent state.
    #[error("fatal error: {0}")]
    Fatal(String),
}

impl CoreError {
    /// Stable kind identifier carried in API responses and logs.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::CapacityExhausted(_) => ErrorKind::CapacityExhausted,
            Self::Transient(_) => ErrorKind::Transient,
            Self::Fatal(_) => ErrorKind::Fatal,
        }
    }

    /// Only transient errors are eligible for automatic retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Validation,
    InvalidState,
    NotFound,
    CapacityExhausted,
    Transient,
    Fatal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION",
            Self::InvalidState => "INVALID_STATE",
            Self::NotFound => "NOT_FOUND",
            Self::CapacityExhausted => "CAPACITY_EXHAUSTED",
            Self::Transient => "TRANSIENT",
            Self::Fatal => "FATAL",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<sled::Error> for CoreError {
    fn from(err: sled::Error) -> Self {
        match err {
            // A corrupted tree is unrecoverable without operator intervention.
            sled::Error::Corruption { .. } | sled::Error::Unsupported(_) => {
                Self::Fatal(format!("storage corruption: {err}"))
            }
            other => Self::Transient(format!("storage error: {other}")),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation(format!("serialization error: {err}"))
    }
}
