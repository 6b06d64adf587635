//! Error types for provider operations.

use thiserror::Error;

/// Errors produced by the orchestration core and its handler operations.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// A required request field is missing or malformed.
    #[error("validation error: {0}")]
    Validation(String),
    /// No token record matches the given access identifier.
    #[error("unknown token")]
    UnknownToken,
    /// An update cycle already holds the lock and the lock is not stale.
    #[error("already processing")]
    AlreadyProcessing,
    /// The account credentials must be refreshed before updating again.
    #[error("token requires a refresh")]
    RequireRefresh,
    /// Token store failure.
    #[error("store error: {0}")]
    Store(String),
    /// Durable queue failure.
    #[error("queue error: {0}")]
    Queue(String),
    /// Malformed or unexpected message on a worker channel.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// A worker process could not be started.
    #[error("spawn error: {0}")]
    Spawn(String),
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A task job names a type no worker is registered for.
    #[error("unknown task type: {0}")]
    UnknownTaskType(String),
    /// Uncaught error inside a worker process.
    #[error("worker fault: {0}")]
    Fault(String),
}

impl ProviderError {
    /// HTTP status the handler layer answers with for this error.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::UnknownToken => 404,
            Self::AlreadyProcessing => 429,
            Self::RequireRefresh => 428,
            Self::Store(_)
            | Self::Queue(_)
            | Self::Protocol(_)
            | Self::Spawn(_)
            | Self::InvalidConfig(_)
            | Self::UnknownTaskType(_)
            | Self::Fault(_) => 500,
        }
    }
}

/// Failure reported by integrator-supplied code.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    /// The external account rejected our credentials.
    #[error("credential error: {0}")]
    Credential(String),
    /// Any other failure; retried per the job's own policy.
    #[error("{0}")]
    Transient(String),
}

impl TaskError {
    /// Build a transient error from anything displayable.
    pub fn transient(err: impl std::fmt::Display) -> Self {
        Self::Transient(err.to_string())
    }

    /// Whether this failure must flip the token into `RequireRefresh`.
    #[must_use]
    pub const fn is_credential(&self) -> bool {
        matches!(self, Self::Credential(_))
    }
}

impl From<ProviderError> for TaskError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::RequireRefresh => Self::Credential(err.to_string()),
            other => Self::Transient(other.to_string()),
        }
    }
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_handler_contract() {
        assert_eq!(ProviderError::Validation("x".into()).status_code(), 400);
        assert_eq!(ProviderError::UnknownToken.status_code(), 404);
        assert_eq!(ProviderError::AlreadyProcessing.status_code(), 429);
        assert_eq!(ProviderError::RequireRefresh.status_code(), 428);
        assert_eq!(ProviderError::Queue("down".into()).status_code(), 500);
    }

    #[test]
    fn credential_classification() {
        assert!(TaskError::Credential("revoked".into()).is_credential());
        assert!(!TaskError::transient("timeout").is_credential());
        assert!(TaskError::from(ProviderError::RequireRefresh).is_credential());
        assert!(!TaskError::from(ProviderError::Store("io".into())).is_credential());
    }
}
