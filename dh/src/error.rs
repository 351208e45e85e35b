//! Operation error types
//!
//! Every error surfaced by the dispatcher, pool and cache carries a stable
//! [`ErrorKind`] plus a human-readable message. Callers (chat layer, web API)
//! decide how to format them.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::EngineError;

/// Stable error classification exposed to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ContainerNotFound,
    PoolExhausted,
    Saturated,
    ContainerBusy,
    Timeout,
    EngineUnreachable,
    InvalidAction,
    InvalidSchedule,
    Cancelled,
    Engine,
    ShuttingDown,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ContainerNotFound => "container_not_found",
            Self::PoolExhausted => "pool_exhausted",
            Self::Saturated => "saturated",
            Self::ContainerBusy => "container_busy",
            Self::Timeout => "timeout",
            Self::EngineUnreachable => "engine_unreachable",
            Self::InvalidAction => "invalid_action",
            Self::InvalidSchedule => "invalid_schedule",
            Self::Cancelled => "cancelled",
            Self::Engine => "engine",
            Self::ShuttingDown => "shutting_down",
        };
        write!(f, "{}", s)
    }
}

/// Errors that can occur while submitting or executing an operation
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OpError {
    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Connection pool exhausted after waiting {0:?}")]
    PoolExhausted(Duration),

    #[error("Dispatcher queue saturated ({capacity} requests queued)")]
    Saturated { capacity: usize },

    #[error("Container {0} is busy with another operation")]
    ContainerBusy(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Container engine unreachable: {0}")]
    EngineUnreachable(String),

    #[error("Invalid action: {0}")]
    InvalidAction(String),

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Request {0} was cancelled")]
    Cancelled(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Dispatcher is shutting down")]
    ShuttingDown,
}

impl OpError {
    /// Stable kind for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            OpError::ContainerNotFound(_) => ErrorKind::ContainerNotFound,
            OpError::PoolExhausted(_) => ErrorKind::PoolExhausted,
            OpError::Saturated { .. } => ErrorKind::Saturated,
            OpError::ContainerBusy(_) => ErrorKind::ContainerBusy,
            OpError::Timeout(_) => ErrorKind::Timeout,
            OpError::EngineUnreachable(_) => ErrorKind::EngineUnreachable,
            OpError::InvalidAction(_) => ErrorKind::InvalidAction,
            OpError::InvalidSchedule(_) => ErrorKind::InvalidSchedule,
            OpError::Cancelled(_) => ErrorKind::Cancelled,
            OpError::Engine(_) => ErrorKind::Engine,
            OpError::ShuttingDown => ErrorKind::ShuttingDown,
        }
    }

    /// Check if the dispatcher should retry this error locally
    pub fn is_retryable(&self) -> bool {
        matches!(self, OpError::PoolExhausted(_) | OpError::EngineUnreachable(_))
    }

    /// Check if this is a fail-fast capacity signal
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            OpError::PoolExhausted(_) | OpError::Saturated { .. } | OpError::ContainerBusy(_)
        )
    }

    /// Check if trying again later could succeed
    ///
    /// Covers capacity signals and an unreachable engine. Timeouts are excluded
    /// because the engine call may have gone through.
    pub fn is_transient(&self) -> bool {
        self.is_capacity() || matches!(self, OpError::EngineUnreachable(_))
    }
}

impl From<EngineError> for OpError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NotFound(id) => OpError::ContainerNotFound(id),
            EngineError::Unreachable(msg) | EngineError::Busy(msg) => OpError::EngineUnreachable(msg),
            EngineError::Api { status, message } if status >= 500 => {
                OpError::EngineUnreachable(format!("{}: {}", status, message))
            }
            EngineError::Api { status, message } => OpError::Engine(format!("{}: {}", status, message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(OpError::ContainerNotFound("web".into()).kind(), ErrorKind::ContainerNotFound);
        assert_eq!(OpError::Saturated { capacity: 4 }.kind(), ErrorKind::Saturated);
        assert_eq!(OpError::Timeout(Duration::from_secs(5)).kind(), ErrorKind::Timeout);
        assert_eq!(OpError::ShuttingDown.kind(), ErrorKind::ShuttingDown);
    }

    #[test]
    fn test_is_retryable() {
        assert!(OpError::PoolExhausted(Duration::from_secs(1)).is_retryable());
        assert!(OpError::EngineUnreachable("socket closed".into()).is_retryable());

        assert!(!OpError::ContainerNotFound("web".into()).is_retryable());
        assert!(!OpError::InvalidAction("explode".into()).is_retryable());
        assert!(!OpError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!OpError::Saturated { capacity: 1 }.is_retryable());
    }

    #[test]
    fn test_capacity_and_transient() {
        assert!(OpError::Saturated { capacity: 1 }.is_capacity());
        assert!(OpError::ContainerBusy("db".into()).is_capacity());
        assert!(!OpError::EngineUnreachable("x".into()).is_capacity());

        assert!(OpError::EngineUnreachable("x".into()).is_transient());
        assert!(!OpError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!OpError::Engine("400: bad".into()).is_transient());
    }

    #[test]
    fn test_from_engine_error() {
        let err: OpError = EngineError::NotFound("abc".into()).into();
        assert_eq!(err, OpError::ContainerNotFound("abc".into()));

        let err: OpError = EngineError::Api {
            status: 502,
            message: "bad gateway".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::EngineUnreachable);

        let err: OpError = EngineError::Api {
            status: 400,
            message: "bad request".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Engine);
    }

    #[test]
    fn test_kind_serde() {
        let json = serde_json::to_string(&ErrorKind::ContainerBusy).unwrap();
        assert_eq!(json, "\"container_busy\"");
        assert_eq!(ErrorKind::PoolExhausted.to_string(), "pool_exhausted");
    }
}
