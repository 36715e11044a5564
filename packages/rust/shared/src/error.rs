//! Error types for the core logic engine.
//!
//! Library crates use [`CoreLogicError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all core logic operations.
#[derive(Debug, thiserror::Error)]
pub enum CoreLogicError {
    /// Configuration loading/validation error, or a required capability
    /// (store, distiller) is unavailable at startup.
    #[error("config error: {message}")]
    Config { message: String },

    /// A referenced domain, version, or job does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Malformed input, rejected before any state mutation.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Distiller invocation failed (transport, quota, malformed output).
    #[error("provider error: {0}")]
    Provider(String),

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// The active version moved underneath a commit.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A job was asked to make a transition its current status forbids.
    #[error("job {job_id} cannot transition from {from} to {to}")]
    InvalidTransition {
        job_id: String,
        from: String,
        to: String,
    },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Serialization or deserialization error.
    #[error("parse error: {message}")]
    Parse { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, CoreLogicError>;

impl CoreLogicError {
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

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a not-found error for the given entity kind and identifier.
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error reports a missing entity.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<serde_json::Error> for CoreLogicError {
    fn from(e: serde_json::Error) -> Self {
        Self::parse(e.to_string())
    }
}
