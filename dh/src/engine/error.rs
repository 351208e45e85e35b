//! Engine error types

use thiserror::Error;

/// Errors reported by a container engine client
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("Engine unreachable: {0}")]
    Unreachable(String),

    #[error("Engine busy: {0}")]
    Busy(String),

    #[error("No such container: {0}")]
    NotFound(String),

    #[error("Engine API error {status}: {message}")]
    Api { status: u16, message: String },
}

impl EngineError {
    /// Check if this error may clear up on its own
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Unreachable(_) => true,
            EngineError::Busy(_) => true,
            EngineError::Api { status, .. } => *status >= 500,
            EngineError::NotFound(_) => false,
        }
    }
}
