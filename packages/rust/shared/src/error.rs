//! Error types for siteport.
//!
//! Library crates use [`SiteportError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! Failures of external collaborators are classified separately by
//! [`CollaboratorError`] so the pipeline can decide between retrying,
//! degrading, routing to the gap report, or failing the session.

use std::path::PathBuf;

use crate::types::Decision;

/// Top-level error type for all siteport operations.
#[derive(Debug, thiserror::Error)]
pub enum SiteportError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (out-of-range score, malformed blueprint, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// JSON encoding/decoding of persisted state failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// An external collaborator call failed.
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    /// The session was cancelled; in-flight results were discarded.
    #[error("session cancelled")]
    Cancelled,

    /// A review decision conflicts with the decision already recorded.
    #[error("decision rejected for item {item_id}: already decided as {current}, cannot change to {requested}")]
    DecisionRejected {
        item_id: String,
        current: Decision,
        requested: Decision,
    },

    /// A review decision referenced an item that is not in the gap report.
    #[error("gap report has no item {0}")]
    UnknownItem(String),

    /// Requested entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A state-machine transition that the current session state forbids.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// A conditional write lost to a concurrent writer.
    #[error("concurrent update: {0}")]
    Conflict(String),

    /// A spawned worker task panicked or was aborted.
    #[error("background task failed: {0}")]
    Task(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, SiteportError>;

impl SiteportError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
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

    /// Whether retrying the failed operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Collaborator(e) if e.is_transient())
    }
}

impl From<serde_json::Error> for SiteportError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Collaborator errors
// ---------------------------------------------------------------------------

/// Failure classes reported by external collaborators.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollaboratorError {
    /// Timeout, rate limit, or a temporary upstream failure. Retried with backoff.
    #[error("transient collaborator failure in {operation}: {message}")]
    Transient { operation: String, message: String },

    /// The payload failed structural checks. Never retried with the same payload.
    #[error("payload rejected: {reason}")]
    ValidationRejected { reason: String },

    /// The scoring renderer cannot run. Loops stop early with best-effort results.
    #[error("scoring unavailable: {0}")]
    Unavailable(String),

    /// Collaborator could not be reached during precondition checks.
    #[error("collaborator unreachable: {0}")]
    Unreachable(String),

    /// The collaborator answered with something we could not interpret.
    #[error("collaborator protocol error: {0}")]
    Protocol(String),
}

impl CollaboratorError {
    /// Create a transient error for the named operation.
    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a validation rejection.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::ValidationRejected {
            reason: reason.into(),
        }
    }

    /// Whether the failure is worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}
