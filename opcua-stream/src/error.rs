//! Error types for the opcua-stream crate.

use opcua_api::{ApiError, StatusCode};

/// Errors raised by subscription and publish operations.
///
/// Per-item failures are not errors at this level; they are recorded on the
/// item's status and the surrounding operation still succeeds.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Invalid configuration or desired-state model provided
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The operation needs a server-side subscription that does not exist
    #[error("Subscription not created: {0}")]
    NotCreated(String),

    /// The operation is not valid in the current item or subscription state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A session service call failed as a whole
    #[error("Service error: {0}")]
    Service(#[from] ApiError),

    /// The server rejected the subscription-level request
    #[error("Bad status {status} for {operation}")]
    BadStatus {
        /// Service that returned the status
        operation: &'static str,
        /// Returned status
        status: StatusCode,
    },

    /// An error occurred during shutdown
    #[error("Shutdown error: {0}")]
    ShutdownError(String),
}

impl StreamError {
    /// Status code of a failed service call, if this error came from one
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            StreamError::Service(e) => Some(e.status_code()),
            StreamError::BadStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Convenience type alias for Results using StreamError.
pub type Result<T> = std::result::Result<T, StreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_error_display() {
        let error = StreamError::Configuration("keep alive count is 0".to_string());
        assert_eq!(error.to_string(), "Configuration error: keep alive count is 0");

        let error = StreamError::NotCreated("sub1".to_string());
        assert_eq!(error.to_string(), "Subscription not created: sub1");

        let error = StreamError::BadStatus {
            operation: "SetPublishingMode",
            status: StatusCode::BAD_SUBSCRIPTION_ID_INVALID,
        };
        assert_eq!(
            error.to_string(),
            "Bad status BadSubscriptionIdInvalid for SetPublishingMode"
        );
    }

    #[test]
    fn test_error_conversion_from_api_error() {
        let api_error = ApiError::fault(StatusCode::BAD_SESSION_CLOSED);
        let stream_error: StreamError = api_error.into();

        match &stream_error {
            StreamError::Service(e) => {
                assert_eq!(e.status_code(), StatusCode::BAD_SESSION_CLOSED);
            }
            _ => panic!("Expected Service variant"),
        }
        assert_eq!(
            stream_error.status_code(),
            Some(StatusCode::BAD_SESSION_CLOSED)
        );
        assert_eq!(StreamError::NotCreated("x".into()).status_code(), None);
    }
}
