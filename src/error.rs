//! Query and change feed error types.

use http::StatusCode;
use std::time::Duration;
use thiserror::Error;

/// Sub-status sent alongside 410 when a partition key range has been split.
pub const SUB_STATUS_PARTITION_KEY_RANGE_GONE: u32 = 1002;

/// Error codes surfaced by the query core and its transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Transient errors
    Throttled,
    ServiceUnavailable,
    RequestTimeout,

    // Topology signals
    PartitionKeyRangeGone,

    // Fatal request errors
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    PartitionKeyRangeNotFound,
    Conflict,
    RetriesExhausted,
    InternalError,

    // Caller misconfiguration
    CrossPartitionQueryDisabled,
    InvalidOptions,
    InvalidCollectionLink,
    InvalidContinuation,
    TopologyChanged,
}

/// How the core reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retried by the executor with backoff.
    Transient,
    /// Handled by re-resolving the affected range.
    PartitionSplit,
    /// Propagated to the caller; the iterator stays resumable.
    Fatal,
    /// Propagated to the caller; terminal for the iterator.
    Configuration,
}

impl ErrorCode {
    /// Returns the string representation of the error code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Throttled => "Throttled",
            ErrorCode::ServiceUnavailable => "ServiceUnavailable",
            ErrorCode::RequestTimeout => "RequestTimeout",
            ErrorCode::PartitionKeyRangeGone => "PartitionKeyRangeGone",
            ErrorCode::BadRequest => "BadRequest",
            ErrorCode::Unauthorized => "Unauthorized",
            ErrorCode::Forbidden => "Forbidden",
            ErrorCode::NotFound => "NotFound",
            ErrorCode::PartitionKeyRangeNotFound => "PartitionKeyRangeNotFound",
            ErrorCode::Conflict => "Conflict",
            ErrorCode::RetriesExhausted => "RetriesExhausted",
            ErrorCode::InternalError => "InternalError",
            ErrorCode::CrossPartitionQueryDisabled => "CrossPartitionQueryDisabled",
            ErrorCode::InvalidOptions => "InvalidOptions",
            ErrorCode::InvalidCollectionLink => "InvalidCollectionLink",
            ErrorCode::InvalidContinuation => "InvalidContinuation",
            ErrorCode::TopologyChanged => "TopologyChanged",
        }
    }

    /// Returns the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            ErrorCode::BadRequest
            | ErrorCode::CrossPartitionQueryDisabled
            | ErrorCode::InvalidOptions
            | ErrorCode::InvalidCollectionLink
            | ErrorCode::InvalidContinuation
            | ErrorCode::TopologyChanged => StatusCode::BAD_REQUEST,

            // 401 Unauthorized
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,

            // 403 Forbidden
            ErrorCode::Forbidden => StatusCode::FORBIDDEN,

            // 404 Not Found
            ErrorCode::NotFound | ErrorCode::PartitionKeyRangeNotFound => StatusCode::NOT_FOUND,

            // 408 Request Timeout
            ErrorCode::RequestTimeout => StatusCode::REQUEST_TIMEOUT,

            // 409 Conflict
            ErrorCode::Conflict => StatusCode::CONFLICT,

            // 410 Gone
            ErrorCode::PartitionKeyRangeGone => StatusCode::GONE,

            // 429 Too Many Requests
            ErrorCode::Throttled | ErrorCode::RetriesExhausted => StatusCode::TOO_MANY_REQUESTS,

            // 500 Internal Server Error
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,

            // 503 Service Unavailable
            ErrorCode::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Returns the sub-status code that accompanies the status, if any.
    pub fn sub_status(&self) -> Option<u32> {
        match self {
            ErrorCode::PartitionKeyRangeGone => Some(SUB_STATUS_PARTITION_KEY_RANGE_GONE),
            _ => None,
        }
    }

    /// Returns how the core handles this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ErrorCode::Throttled | ErrorCode::ServiceUnavailable | ErrorCode::RequestTimeout => {
                ErrorKind::Transient
            }
            ErrorCode::PartitionKeyRangeGone => ErrorKind::PartitionSplit,
            ErrorCode::CrossPartitionQueryDisabled
            | ErrorCode::InvalidOptions
            | ErrorCode::InvalidCollectionLink
            | ErrorCode::InvalidContinuation
            | ErrorCode::TopologyChanged => ErrorKind::Configuration,
            _ => ErrorKind::Fatal,
        }
    }

    /// Returns the default message for this error code.
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::Throttled => "Request rate is large. More Request Units may be needed.",
            ErrorCode::ServiceUnavailable => "The service is currently unavailable.",
            ErrorCode::RequestTimeout => "The request timed out.",
            ErrorCode::PartitionKeyRangeGone => "The target partition key range is gone.",
            ErrorCode::PartitionKeyRangeNotFound => "The specified partition key range does not exist.",
            ErrorCode::NotFound => "The specified resource does not exist.",
            ErrorCode::CrossPartitionQueryDisabled => {
                "Cross partition query is required but disabled. Set enable_cross_partition_query \
                 to true or provide a partition key."
            }
            ErrorCode::InvalidContinuation => "The continuation token is malformed.",
            ErrorCode::TopologyChanged => {
                "The continuation token refers to partition key ranges that no longer exist."
            }
            ErrorCode::RetriesExhausted => "The request failed after exhausting all retries.",
            ErrorCode::InternalError => "An internal error occurred.",
            _ => "An error occurred while processing the request.",
        }
    }
}

/// Query error with code and message.
#[derive(Debug, Clone, Error)]
#[error("{code:?}: {message}")]
pub struct QueryError {
    pub code: ErrorCode,
    pub message: String,
    pub activity_id: Option<String>,
    /// Server-provided backoff hint for throttled requests.
    pub retry_after: Option<Duration>,
}

impl QueryError {
    /// Creates a new error with the given code and default message.
    pub fn new(code: ErrorCode) -> Self {
        Self {
            message: code.default_message().to_string(),
            code,
            activity_id: None,
            retry_after: None,
        }
    }

    /// Creates a new error with a custom message.
    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            activity_id: None,
            retry_after: None,
        }
    }

    /// Sets the activity ID of the failed request.
    pub fn with_activity_id(mut self, activity_id: impl Into<String>) -> Self {
        self.activity_id = Some(activity_id.into());
        self
    }

    /// Sets the server backoff hint.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.code.kind()
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    pub fn is_partition_split(&self) -> bool {
        self.kind() == ErrorKind::PartitionSplit
    }

    pub fn is_configuration(&self) -> bool {
        self.kind() == ErrorKind::Configuration
    }

    pub fn status_code(&self) -> StatusCode {
        self.code.status_code()
    }
}

/// Result type alias for query operations.
pub type QueryResult<T> = Result<T, QueryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_signal_is_gone_with_sub_status() {
        let err = QueryError::new(ErrorCode::PartitionKeyRangeGone);
        assert_eq!(err.status_code(), StatusCode::GONE);
        assert_eq!(err.code.sub_status(), Some(1002));
        assert!(err.is_partition_split());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_error_kinds() {
        assert!(QueryError::new(ErrorCode::Throttled).is_transient());
        assert!(QueryError::new(ErrorCode::CrossPartitionQueryDisabled).is_configuration());
        assert_eq!(ErrorCode::RetriesExhausted.kind(), ErrorKind::Fatal);
    }
}
