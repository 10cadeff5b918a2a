//! Cloud provider error types

use crate::classify::{ErrorClass, classify};
use thiserror::Error;

/// Cloud provider errors
#[derive(Error, Debug)]
pub enum CloudError {
    /// Free-text error returned by the provider API
    #[error("API error: {0}")]
    ApiError(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("State file error: {0}")]
    StateError(String),

    #[error("Lock acquisition failed: {0}")]
    LockError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CloudError {
    /// Classify this error into the closed taxonomy the engine acts on.
    ///
    /// Provider messages are matched against the phrase table. Timeouts are
    /// transient and local failures are never retried by class.
    pub fn class(&self) -> ErrorClass {
        match self {
            CloudError::ApiError(msg) => classify(msg),
            CloudError::Timeout(_) => ErrorClass::Transient,
            CloudError::InvalidConfig(_)
            | CloudError::StateError(_)
            | CloudError::LockError(_)
            | CloudError::Io(_)
            | CloudError::Json(_) => ErrorClass::Other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.class() == ErrorClass::NotFound
    }

    pub fn is_already_exists(&self) -> bool {
        self.class() == ErrorClass::AlreadyExists
    }
}

pub type Result<T> = std::result::Result<T, CloudError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structured_variants() {
        assert_eq!(
            CloudError::Timeout("listNetworks".into()).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            CloudError::InvalidConfig("x".into()).class(),
            ErrorClass::Other
        );
    }

    #[test]
    fn test_api_error_is_classified_by_message() {
        let err = CloudError::ApiError(
            "There is already a firewall rule specified for protocol tcp".into(),
        );
        assert!(err.is_already_exists());

        let err = CloudError::ApiError("No match found for net-a".into());
        assert!(err.is_not_found());

        let err = CloudError::LockError("No match found".into());
        assert!(!err.is_not_found());
    }
}
