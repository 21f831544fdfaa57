//! Error taxonomy shared by every service and worker in the engine.

use thiserror::Error;

/// A backend call failed. Carries the provider type so callers can tell
/// which backend misbehaved without downcasting the cause.
#[derive(Debug, Error)]
#[error("{provider_type} provider error: {message}")]
pub struct ProviderError {
    pub provider_type: String,
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ProviderError {
    pub fn new(provider_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            provider_type: provider_type.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source<E>(provider_type: impl Into<String>, message: impl Into<String>, source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            provider_type: provider_type.into(),
            message: message.into(),
            source: Some(source.into()),
        }
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad input. Never retried.
    #[error("{0}")]
    Validation(String),

    /// Missing file, folder, provider, session or job.
    #[error("{0} not found")]
    NotFound(String),

    /// Virtual path collision.
    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Raised from inside a transfer when its cancellation flag is set.
    #[error("Transfer cancelled")]
    TransferCancelled,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    pub fn validation(message: impl Into<String>) -> Self {
        EngineError::Validation(message.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        EngineError::NotFound(what.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        EngineError::Conflict(message.into())
    }

    /// Whether the job queue should schedule another attempt after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Provider(_) | EngineError::Internal(_))
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "VALIDATION_ERROR",
            EngineError::NotFound(_) => "NOT_FOUND",
            EngineError::Conflict(_) => "CONFLICT",
            EngineError::Provider(_) => "PROVIDER_ERROR",
            EngineError::TransferCancelled => "TRANSFER_CANCELLED",
            EngineError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Internal(e.into())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(!EngineError::validation("bad").is_retryable());
        assert!(!EngineError::not_found("File").is_retryable());
        assert!(!EngineError::conflict("taken").is_retryable());
        assert!(!EngineError::TransferCancelled.is_retryable());
        assert!(EngineError::from(ProviderError::new("local", "disk full")).is_retryable());
        assert!(EngineError::from(anyhow::anyhow!("db locked")).is_retryable());
    }

    #[test]
    fn test_provider_error_display_and_source() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "connection reset");
        let err = ProviderError::with_source("webdav", "PUT failed", io);
        assert_eq!(err.to_string(), "webdav provider error: PUT failed");
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(EngineError::from(err).code(), "PROVIDER_ERROR");
    }

    #[test]
    fn test_not_found_message() {
        assert_eq!(EngineError::not_found("Upload session").to_string(), "Upload session not found");
    }
}
