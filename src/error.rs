//! Error types for trace configuration, lifecycle and lookups
//!
//! Per-event decode and correlation failures never surface here; they are
//! resolved to a sentinel value or a dropped event at the callback boundary.

use thiserror::Error;

/// Errors reported synchronously to the caller of a lifecycle, configuration
/// or lookup operation
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("Trace session '{session}' is already running; stop it before enabling sources")]
    AlreadyRunning { session: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Missing identifier: {0}")]
    MissingIdentifier(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Trace backend failed during {operation}: {message}")]
    Backend { operation: String, message: String },

    #[error("Failed to launch {program}: {message}")]
    Launch { program: String, message: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TraceError {
    pub(crate) fn backend(operation: &str, message: impl ToString) -> Self {
        Self::Backend {
            operation: operation.to_string(),
            message: message.to_string(),
        }
    }

    pub(crate) fn launch(program: &str, message: impl ToString) -> Self {
        Self::Launch {
            program: program.to_string(),
            message: message.to_string(),
        }
    }
}

/// Result type for krabtrace library operations
pub type Result<T> = std::result::Result<T, TraceError>;
