//! Error type definitions for the EPG linker
//!
//! This module defines the error hierarchy used by the fetcher, the parsers
//! and the storage layer. Source failures and storage failures are kept in
//! separate enums so callers can decide on retry behaviour without string
//! matching.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level application error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Failures fetching, validating or parsing provider content
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    /// Failures reading or writing the relational store
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Validation errors on caller input
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Resource not found errors
    #[error("Not found: {resource} with id {id}")]
    NotFound { resource: String, id: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Source handling specific errors
#[derive(Error, Debug)]
pub enum SourceError {
    /// Network, timeout or HTTP status failure talking to a provider
    #[error("Connection error: {url} - {message}")]
    Connection { url: String, message: String },

    /// Fetched content is missing the marker for its declared kind
    #[error("Invalid payload: expected {expected} - {message}")]
    InvalidPayload { expected: String, message: String },

    /// Document structure is not what the parser understands
    #[error("Invalid format: {message}")]
    InvalidFormat { message: String },

    /// Content is structurally valid but empty or malformed
    #[error("Parse error: {source_type} - {message}")]
    Parse { source_type: String, message: String },
}

/// Storage layer specific errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// Query execution failures
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A batch write failed; earlier batches stay committed
    #[error("Batch {batch} aborted after {committed} rows committed: {message}")]
    BatchAborted {
        batch: usize,
        committed: usize,
        message: String,
    },

    /// Migration failures
    #[error("Migration failed: {name} - {message}")]
    Migration { name: String, message: String },

    /// JSON column encoding failures
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored value could not be decoded
    #[error("Corrupt row in {table}: {message}")]
    CorruptRow { table: String, message: String },
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(StorageError::Database(err))
    }
}

/// Structured failure payload handed to callers instead of a raw error chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailurePayload {
    pub success: bool,
    pub message: String,
}

/// Convenience methods for creating common error types
impl AppError {
    /// Create a validation error with a custom message
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a not found error for a specific resource
    pub fn not_found<R: Into<String>, I: Into<String>>(resource: R, id: I) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Only connection failures are worth retrying with the same source
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Source(SourceError::Connection { .. }))
    }

    /// Rows already committed before a batch write aborted, if this is one
    pub fn committed_rows(&self) -> Option<usize> {
        match self {
            Self::Storage(StorageError::BatchAborted { committed, .. }) => Some(*committed),
            _ => None,
        }
    }

    pub fn to_failure(&self) -> FailurePayload {
        FailurePayload {
            success: false,
            message: self.to_string(),
        }
    }
}

impl SourceError {
    /// Create a connection error
    pub fn connection<U: Into<String>, M: Into<String>>(url: U, message: M) -> Self {
        Self::Connection {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<U: Into<String>>(url: U, secs: u64) -> Self {
        Self::Connection {
            url: url.into(),
            message: format!("timed out after {secs}s"),
        }
    }

    /// Create an invalid payload error
    pub fn invalid_payload<E: Into<String>, M: Into<String>>(expected: E, message: M) -> Self {
        Self::InvalidPayload {
            expected: expected.into(),
            message: message.into(),
        }
    }

    /// Create an invalid format error
    pub fn invalid_format<M: Into<String>>(message: M) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Create a parse error
    pub fn parse_error<S: Into<String>, M: Into<String>>(source_type: S, message: M) -> Self {
        Self::Parse {
            source_type: source_type.into(),
            message: message.into(),
        }
    }

    /// Map a reqwest failure onto a connection error for `url`
    pub fn from_reqwest(url: &str, err: reqwest::Error, timeout_secs: u64) -> Self {
        if err.is_timeout() {
            Self::timeout(url, timeout_secs)
        } else {
            Self::connection(url, err.to_string())
        }
    }
}

impl StorageError {
    pub fn corrupt_row<T: Into<String>, M: Into<String>>(table: T, message: M) -> Self {
        Self::CorruptRow {
            table: table.into(),
            message: message.into(),
        }
    }
}
