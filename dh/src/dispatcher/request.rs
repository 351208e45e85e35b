//! Operation request and result types

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::ContainerStatus;
use crate::error::{ErrorKind, OpError};

/// Action that can be requested against a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Status,
    Start,
    Stop,
    Restart,
    Logs,
}

impl Action {
    /// Start, stop and restart change container state
    pub fn is_mutating(&self) -> bool {
        matches!(self, Self::Start | Self::Stop | Self::Restart)
    }

    /// Whether the outcome of this action says something about container status
    pub fn refreshes_cache(&self) -> bool {
        !matches!(self, Self::Logs)
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Status => write!(f, "status"),
            Self::Start => write!(f, "start"),
            Self::Stop => write!(f, "stop"),
            Self::Restart => write!(f, "restart"),
            Self::Logs => write!(f, "logs"),
        }
    }
}

impl std::str::FromStr for Action {
    type Err = OpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "status" => Ok(Self::Status),
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "restart" => Ok(Self::Restart),
            "logs" => Ok(Self::Logs),
            _ => Err(OpError::InvalidAction(s.to_string())),
        }
    }
}

/// Who submitted a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    #[default]
    User,
    Scheduler,
}

/// Lifecycle of a request inside the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Queued,
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Queued | Self::Running)
    }
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// One unit of work against one container
#[derive(Debug, Clone)]
pub struct OperationRequest {
    pub id: String,
    pub container: String,
    pub action: Action,
    pub submitted_at: DateTime<Utc>,
    pub timeout: Duration,
    pub origin: Origin,
    /// Line count for the logs action; dispatcher default when unset
    pub log_tail: Option<usize>,
}

impl OperationRequest {
    pub fn new(container: impl Into<String>, action: Action, timeout: Duration) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            container: container.into(),
            action,
            submitted_at: Utc::now(),
            timeout,
            origin: Origin::User,
            log_tail: None,
        }
    }

    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_log_tail(mut self, tail: usize) -> Self {
        self.log_tail = Some(tail);
        self
    }
}

/// What came back from the engine on success
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// `captured_at` is when the engine answered the inspect
    Status {
        status: ContainerStatus,
        captured_at: DateTime<Utc>,
    },
    Logs(String),
}

/// Result delivered to the submitter
#[derive(Debug, Clone)]
pub struct OperationResult {
    pub request_id: String,
    pub container: String,
    pub action: Action,
    pub origin: Origin,
    pub success: bool,
    pub state: RequestState,
    /// Container status after the action, when the action reports one
    pub status: Option<ContainerStatus>,
    pub captured_at: Option<DateTime<Utc>>,
    /// Log output for the logs action
    pub output: Option<String>,
    pub message: String,
    pub duration: Duration,
    pub attempts: u32,
    pub error: Option<OpError>,
}

impl OperationResult {
    /// Successful completion
    pub fn completed(request: &OperationRequest, outcome: Outcome, duration: Duration, attempts: u32) -> Self {
        let (status, captured_at, output, message) = match outcome {
            Outcome::Status { status, captured_at } => {
                let message = format!("{} {}: {}", request.action, request.container, status.state);
                (Some(status), Some(captured_at), None, message)
            }
            Outcome::Logs(text) => {
                let message = format!("fetched logs for {}", request.container);
                (None, None, Some(text), message)
            }
        };
        Self {
            request_id: request.id.clone(),
            container: request.container.clone(),
            action: request.action,
            origin: request.origin,
            success: true,
            state: RequestState::Completed,
            status,
            captured_at,
            output,
            message,
            duration,
            attempts,
            error: None,
        }
    }

    /// Any non-successful terminal state
    pub fn failed(request: &OperationRequest, error: OpError, duration: Duration, attempts: u32) -> Self {
        let state = match &error {
            OpError::Timeout(_) => RequestState::TimedOut,
            OpError::Cancelled(_) | OpError::ShuttingDown => RequestState::Cancelled,
            _ => RequestState::Failed,
        };
        Self {
            request_id: request.id.clone(),
            container: request.container.clone(),
            action: request.action,
            origin: request.origin,
            success: false,
            state,
            status: None,
            captured_at: None,
            output: None,
            message: error.to_string(),
            duration,
            attempts,
            error: Some(error),
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind())
    }

    /// Split into the success value or the error
    pub fn into_result(self) -> Result<OperationResult, OpError> {
        match self.error.clone() {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}
