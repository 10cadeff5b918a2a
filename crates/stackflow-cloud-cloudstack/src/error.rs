//! CloudStack provider error types

use stackflow_cloud::CloudError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CloudStackError {
    #[error("cmk not found. Please install CloudMonkey: https://github.com/apache/cloudstack-cloudmonkey")]
    CmkNotFound,

    #[error("section {0} not found")]
    SectionNotFound(String),

    #[error("cloud-config error: {0}")]
    CloudConfig(String),

    #[error("cmk command failed: {0}")]
    CommandFailed(String),

    #[error("cmk command timed out after {0}s")]
    Timeout(u64),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("Config error: {0}")]
    ConfigError(#[from] config::ConfigError),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<CloudStackError> for CloudError {
    fn from(err: CloudStackError) -> Self {
        match err {
            // provider text, classified downstream
            CloudStackError::CommandFailed(msg) => CloudError::ApiError(msg),
            CloudStackError::Timeout(secs) => CloudError::Timeout(format!("{}s", secs)),
            CloudStackError::CmkNotFound
            | CloudStackError::SectionNotFound(_)
            | CloudStackError::CloudConfig(_)
            | CloudStackError::ConfigError(_) => CloudError::InvalidConfig(err.to_string()),
            CloudStackError::JsonError(e) => CloudError::Json(e),
            CloudStackError::IoError(e) => CloudError::Io(e),
            CloudStackError::UnexpectedResponse(msg) => CloudError::ApiError(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, CloudStackError>;

#[cfg(test)]
mod tests {
    use super::*;
    use stackflow_cloud::ErrorClass;

    #[test]
    fn test_command_failure_keeps_provider_message() {
        let err: CloudError =
            CloudStackError::CommandFailed("Error: No match found for net-a".into()).into();
        assert_eq!(err.class(), ErrorClass::NotFound);
    }

    #[test]
    fn test_timeout_is_transient() {
        let err: CloudError = CloudStackError::Timeout(30).into();
        assert_eq!(err.class(), ErrorClass::Transient);
    }

    #[test]
    fn test_section_not_found_message() {
        let err = CloudStackError::SectionNotFound("Global".into());
        assert_eq!(err.to_string(), "section Global not found");
    }
}
