//! Error types for hackcrawl.
//!
//! Library crates use [`HackCrawlError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

use crate::types::{RecordKind, RecordState};

/// Top-level error type for all hackcrawl operations.
#[derive(Debug, thiserror::Error)]
pub enum HackCrawlError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Timeout, transport failure or non-success status from the source.
    /// Retried with backoff.
    #[error("transient source error: {0}")]
    Transient(String),

    /// Unparseable payload or a record missing its identity.
    #[error("malformed response: {message}")]
    Malformed { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// A unique-key or ownership constraint rejected a write.
    #[error("store conflict: {0}")]
    Conflict(String),

    /// A state change that is not the next linear step.
    #[error("invalid {kind} state transition for {id}: {from} -> {to}")]
    InvalidTransition {
        kind: RecordKind,
        id: String,
        from: RecordState,
        to: RecordState,
    },

    /// A record that was expected to exist is missing.
    #[error("{kind} not found: {id}")]
    NotFound { kind: RecordKind, id: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// The run was cancelled between record boundaries.
    #[error("crawl cancelled")]
    Cancelled,
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, HackCrawlError>;

impl HackCrawlError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a transient (retryable) error from any displayable message.
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Create a malformed-response error from any displayable message.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed {
            message: msg.into(),
        }
    }

    /// Create a storage error from any displayable message.
    pub fn storage(msg: impl std::fmt::Display) -> Self {
        Self::Storage(msg.to_string())
    }

    /// Create a conflict error from any displayable message.
    pub fn conflict(msg: impl std::fmt::Display) -> Self {
        Self::Conflict(msg.to_string())
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Whether this error must abort the whole run rather than a single
    /// record or page.
    pub fn is_run_fatal(&self) -> bool {
        matches!(
            self,
            Self::Storage(_) | Self::Config { .. } | Self::Io { .. } | Self::Cancelled
        )
    }
}
