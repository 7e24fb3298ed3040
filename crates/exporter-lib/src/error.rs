//! Error types for the collection engine

use thiserror::Error;

/// Result of a single management-API call
pub type ApiResult<T> = Result<T, ApiError>;

/// Classification of management-API failures
///
/// Only the codes the engine makes decisions on get their own variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorCode {
    /// Operation not valid in the domain's current state (e.g. it stopped)
    OperationInvalid,
    /// Domain no longer exists
    NoDomain,
    /// Call not supported by this driver or hypervisor
    NoSupport,
    /// Connection is closed or could not be established
    NoConnection,
    /// Invalid argument, e.g. an unknown device name
    InvalidArgument,
    /// Response could not be decoded
    Parse,
    /// Anything else reported by the API
    Other,
}

/// Failure reported by the management API
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} ({code:?})")]
pub struct ApiError {
    pub code: ApiErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ApiErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn operation_invalid(message: impl Into<String>) -> Self {
        Self::new(ApiErrorCode::OperationInvalid, message)
    }

    pub fn no_connection(message: impl Into<String>) -> Self {
        Self::new(ApiErrorCode::NoConnection, message)
    }

    pub fn no_support(message: impl Into<String>) -> Self {
        Self::new(ApiErrorCode::NoSupport, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ApiErrorCode::Other, message)
    }

    /// True when the failure only means the domain stopped (or vanished)
    /// between the state check and the detailed query.
    pub fn is_domain_gone(&self) -> bool {
        matches!(
            self.code,
            ApiErrorCode::OperationInvalid | ApiErrorCode::NoDomain
        )
    }
}

/// Failure of one collector unit (one collector for one domain, or one
/// host-level collection)
#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("{operation} failed for domain {domain} ({uuid}): {source}")]
    Domain {
        domain: String,
        uuid: String,
        operation: &'static str,
        #[source]
        source: ApiError,
    },

    #[error("collection timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("collection task aborted: {0}")]
    Task(String),
}

/// Failures that abort a whole scrape
#[derive(Error, Debug, Clone)]
pub enum ScrapeError {
    #[error("connection to {uri} unavailable after {attempts} attempt(s): {source}")]
    ConnectionUnavailable {
        uri: String,
        attempts: u32,
        #[source]
        source: ApiError,
    },

    #[error("failed to enumerate domains: {0}")]
    EnumerationFailed(#[source] ApiError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_gone_classification() {
        assert!(ApiError::operation_invalid("domain is not running").is_domain_gone());
        assert!(ApiError::new(ApiErrorCode::NoDomain, "no such domain").is_domain_gone());
        assert!(!ApiError::other("internal error").is_domain_gone());
        assert!(!ApiError::no_support("not supported").is_domain_gone());
    }

    #[test]
    fn test_collector_error_carries_context() {
        let err = CollectorError::Domain {
            domain: "alpha".into(),
            uuid: "0000-1111".into(),
            operation: "memory stats",
            source: ApiError::other("boom"),
        };
        let text = err.to_string();
        assert!(text.contains("alpha"));
        assert!(text.contains("0000-1111"));
        assert!(text.contains("memory stats"));
    }
}
