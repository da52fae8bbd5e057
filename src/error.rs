//! Error types returned by this library

use http::StatusCode;

/// Errors observed by the dispatch core
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// I/O-level failure without an HTTP response (connection refused or reset,
    /// timeout, DNS lookup failure)
    #[error("network error during request: {0}")]
    Network(String),
    /// Remote returned a retryable status (the 5xx family, plus 408)
    #[error("remote returned retryable status {0}")]
    ServerError(StatusCode),
    /// Remote rejected the request with a non-retryable status
    #[error("remote rejected request with status {0}")]
    ClientError(StatusCode),
    /// Request descriptors failed validation at construction
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Executor was shut down and can no longer accept work
    #[error("executor is shut down")]
    ExecutorShutdown,
    /// Response body limit was reached while collecting a response
    #[error("response body limit was reached")]
    ResponseBodyLimit,
    /// Body serialization or response decoding failed
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub(crate) fn other<T>(error: T) -> Self
    where
        T: Into<anyhow::Error>,
    {
        Error::Other(error.into())
    }

    /// Returns true if this failure is worth retrying: a retryable HTTP status
    /// or an I/O-level error with no response at all.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network(_) | Error::ServerError(_))
    }
}

/// Classify an HTTP status into the matching error kind.
///
/// The 5xx family and 408 (request timeout) are considered transient, every
/// other non-success status is permanent.
pub fn status_error(status: StatusCode) -> Error {
    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        Error::ServerError(status)
    } else {
        Error::ClientError(status)
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}
