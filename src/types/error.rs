//! Unified error types for the relay
//!
//! Errors are serializable so an outer layer can hand them to a client
//! unchanged. Connectivity problems are kept apart from "nothing found" so
//! callers can answer with a retryable status instead of an empty body.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Relay error type for the session, pipeline and façade
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "message")]
pub enum RelayError {
    /// Session could not be established or was lost mid-operation.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The mail server rejected the compiled search or a folder selection.
    #[error("Query rejected by mail server: {0}")]
    Query(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Request timed out after {0}s")]
    Timeout(u64),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl RelayError {
    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RelayError::Connection(_) | RelayError::Timeout(_))
    }
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::Io(err.to_string())
    }
}

impl From<toml::de::Error> for RelayError {
    fn from(err: toml::de::Error) -> Self {
        RelayError::Config(err.to_string())
    }
}

impl From<rusqlite::Error> for RelayError {
    fn from(err: rusqlite::Error) -> Self {
        RelayError::Database(err.to_string())
    }
}

impl From<r2d2::Error> for RelayError {
    fn from(err: r2d2::Error) -> Self {
        RelayError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Parse(err.to_string())
    }
}

/// Result type alias using RelayError
pub type Result<T> = std::result::Result<T, RelayError>;
