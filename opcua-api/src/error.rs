use thiserror::Error;

use crate::types::StatusCode;

/// Errors returned by a [`Session`](crate::Session) call
///
/// The engine never looks at transport details; it only needs to know which
/// status code a failed call maps to so it can tell transient failures from
/// the terminal session errors that stop the publish pipeline.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ApiError {
    /// Service fault returned by the server
    ///
    /// The server processed the request and rejected it as a whole with the
    /// given service result.
    #[error("Service fault: {status} ({reason})")]
    ServiceFault {
        /// Service result reported by the server
        status: StatusCode,
        /// Diagnostic text, may be empty
        reason: String,
    },

    /// Network communication error
    ///
    /// The secure channel dropped or the request never reached the server.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// The request did not complete within the operation timeout
    #[error("Request timed out")]
    Timeout,

    /// The server answered with a response the client cannot use
    ///
    /// Covers result lists whose length does not match the request.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl ApiError {
    /// Create a service fault without diagnostic text
    pub fn fault(status: StatusCode) -> Self {
        Self::ServiceFault {
            status,
            reason: String::new(),
        }
    }

    /// The status code this error maps to
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::ServiceFault { status, .. } => *status,
            ApiError::NetworkError(_) => StatusCode::BAD_COMMUNICATION_ERROR,
            ApiError::Timeout => StatusCode::BAD_TIMEOUT,
            ApiError::InvalidResponse(_) => StatusCode::BAD_UNKNOWN_RESPONSE,
        }
    }
}

/// Type alias for results that can return an ApiError
pub type Result<T> = std::result::Result<T, ApiError>;
