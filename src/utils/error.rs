//! Centralized error types for tidygram
//!
//! Library code returns `CleanerError`; the binary and the config loader
//! wrap it with `anyhow` for context.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CleanerError {
    /// IO errors with path context
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Snapshot store failures for one user
    #[error("Persistence failed for user {user_id}: {message}")]
    Persistence { user_id: i64, message: String },

    /// Caller passed something the engine does not understand
    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },
}

impl CleanerError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn persistence(user_id: i64, message: impl Into<String>) -> Self {
        Self::Persistence {
            user_id,
            message: message.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Level at which this error is logged when it is swallowed.
    pub fn severity(&self) -> tracing::Level {
        match self {
            CleanerError::Config { .. } => tracing::Level::ERROR,
            CleanerError::InvalidInput { .. } => tracing::Level::ERROR,
            CleanerError::Persistence { .. } => tracing::Level::WARN,
            CleanerError::Serialization { .. } => tracing::Level::WARN,
            CleanerError::Io { .. } => tracing::Level::WARN,
        }
    }
}

pub type Result<T> = std::result::Result<T, CleanerError>;

impl From<serde_json::Error> for CleanerError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}
