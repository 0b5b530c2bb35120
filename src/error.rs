//! Error types for the mutation pipeline.
//!
//! Two layers:
//! - [`RemoteError`] is what comes back from the remote data store. It is
//!   classified once into an [`ErrorKind`] from structured status codes and
//!   travels with the failed mutation as its `last_error`.
//! - [`PipelineError`] covers local failures: journal I/O, corruption and
//!   invalid queue transitions.

use crate::types::MutationId;
use crate::undo::UndoError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Classified failure kind for a remote call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Network,
    Timeout,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    Validation,
    RateLimit,
    ServerError,
    Offline,
    Unknown,
}

impl ErrorKind {
    /// Classify an HTTP-style status code.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => ErrorKind::Unauthorized,
            403 => ErrorKind::Forbidden,
            404 => ErrorKind::NotFound,
            408 | 504 => ErrorKind::Timeout,
            409 | 412 => ErrorKind::Conflict,
            400 | 422 => ErrorKind::Validation,
            429 => ErrorKind::RateLimit,
            500..=599 => ErrorKind::ServerError,
            _ => ErrorKind::Unknown,
        }
    }

    /// Classify a wire error code such as `"CONFLICT"` or `"RATE_LIMIT"`.
    pub fn from_code(code: &str) -> Self {
        match code {
            "NETWORK" => ErrorKind::Network,
            "TIMEOUT" => ErrorKind::Timeout,
            "UNAUTHORIZED" => ErrorKind::Unauthorized,
            "FORBIDDEN" => ErrorKind::Forbidden,
            "NOT_FOUND" => ErrorKind::NotFound,
            "CONFLICT" => ErrorKind::Conflict,
            "VALIDATION" => ErrorKind::Validation,
            "RATE_LIMIT" => ErrorKind::RateLimit,
            "SERVER_ERROR" | "UPDATE_FAILED" => ErrorKind::ServerError,
            "OFFLINE" => ErrorKind::Offline,
            _ => ErrorKind::Unknown,
        }
    }

    /// Wire code for this kind.
    pub fn as_code(&self) -> &'static str {
        match self {
            ErrorKind::Network => "NETWORK",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Unauthorized => "UNAUTHORIZED",
            ErrorKind::Forbidden => "FORBIDDEN",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::RateLimit => "RATE_LIMIT",
            ErrorKind::ServerError => "SERVER_ERROR",
            ErrorKind::Offline => "OFFLINE",
            ErrorKind::Unknown => "UNKNOWN",
        }
    }

    /// Transient failures: resubmitting the same payload may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::ServerError | ErrorKind::Offline
        )
    }

    /// The caller must reload the entity and resubmit with fresh data.
    pub fn requires_reload(&self) -> bool {
        matches!(
            self,
            ErrorKind::Conflict | ErrorKind::NotFound | ErrorKind::Validation
        )
    }

    /// The session is no longer valid; escalate beyond the pipeline.
    pub fn requires_reauth(&self) -> bool {
        matches!(self, ErrorKind::Unauthorized)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_code())
    }
}

/// A classified remote failure with a human-readable message.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn offline() -> Self {
        Self::new(ErrorKind::Offline, "remote store is unreachable")
    }

    pub fn not_found(table: &str, record_id: &str) -> Self {
        Self::new(
            ErrorKind::NotFound,
            format!("{}/{} does not exist", table, record_id),
        )
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimit, message)
    }

    /// Build from an HTTP-style status code.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::from_status(status), message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Main error type for local pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Mutation not found: {0}")]
    MutationNotFound(MutationId),

    #[error("Mutation {id} is {status}, expected {expected}")]
    InvalidTransition {
        id: MutationId,
        status: &'static str,
        expected: &'static str,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Invalid journal format: {0}")]
    InvalidFormat(String),

    #[error("Journal is locked by another process")]
    Locked,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid audit record: {0}")]
    InvalidAudit(String),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Undo(#[from] UndoError),
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        PipelineError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for PipelineError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        PipelineError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for PipelineError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        PipelineError::Deserialization(e.to_string())
    }
}

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(ErrorKind::from_status(404), ErrorKind::NotFound);
        assert_eq!(ErrorKind::from_status(409), ErrorKind::Conflict);
        assert_eq!(ErrorKind::from_status(429), ErrorKind::RateLimit);
        assert_eq!(ErrorKind::from_status(503), ErrorKind::ServerError);
        assert_eq!(ErrorKind::from_status(504), ErrorKind::Timeout);
        assert_eq!(ErrorKind::from_status(418), ErrorKind::Unknown);
    }

    #[test]
    fn test_code_roundtrip() {
        for kind in [
            ErrorKind::Network,
            ErrorKind::Timeout,
            ErrorKind::Unauthorized,
            ErrorKind::Forbidden,
            ErrorKind::NotFound,
            ErrorKind::Conflict,
            ErrorKind::Validation,
            ErrorKind::RateLimit,
            ErrorKind::ServerError,
            ErrorKind::Offline,
            ErrorKind::Unknown,
        ] {
            assert_eq!(ErrorKind::from_code(kind.as_code()), kind);
        }
        assert_eq!(ErrorKind::from_code("UPDATE_FAILED"), ErrorKind::ServerError);
    }

    #[test]
    fn test_retry_policy() {
        assert!(ErrorKind::Network.is_retryable());
        assert!(ErrorKind::Offline.is_retryable());
        assert!(!ErrorKind::Conflict.is_retryable());
        assert!(ErrorKind::Conflict.requires_reload());
        assert!(!ErrorKind::RateLimit.is_retryable());
        assert!(!ErrorKind::RateLimit.requires_reload());
        assert!(ErrorKind::Unauthorized.requires_reauth());
    }

    #[test]
    fn test_remote_error_display() {
        let err = RemoteError::not_found("students", "s-1");
        assert_eq!(err.to_string(), "NOT_FOUND: students/s-1 does not exist");
    }
}
