//! Schedule and task store errors

use thiserror::Error;

use crate::error::ErrorKind;

/// Invalid schedule details
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("invalid cron expression '{expression}': {reason}")]
    Cron { expression: String, reason: String },

    #[error("invalid time '{0}', expected HH:MM")]
    Time(String),

    #[error("invalid date-time '{0}', expected YYYY-MM-DD HH:MM")]
    DateTime(String),

    #[error("invalid weekday '{0}'")]
    Weekday(String),

    #[error("day of month must be 1-31, got {0}")]
    DayOfMonth(u32),

    #[error("day {day} is out of range for month {month}")]
    Day { month: u32, day: u32 },

    #[error("month must be 1-12, got {0}")]
    Month(u32),

    #[error("unknown timezone '{0}'")]
    Timezone(String),

    #[error("unknown cycle '{0}'")]
    UnknownCycle(String),

    #[error("cycle '{cycle}' requires {field}")]
    MissingField { cycle: String, field: &'static str },

    #[error("one-shot time {0} is not in the future")]
    InPast(String),

    #[error("schedule '{0}' never fires")]
    NeverFires(String),

    #[error("action '{0}' cannot be scheduled")]
    Action(String),
}

/// Task store failures
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task not found: {0}")]
    NotFound(String),

    #[error("task id prefix '{0}' matches more than one task")]
    AmbiguousId(String),

    #[error("unknown container: {0}")]
    UnknownContainer(String),

    #[error(transparent)]
    Invalid(#[from] ScheduleError),

    #[error("task store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("task store is corrupt: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// Closest operation error kind, for callers that report one
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Invalid(_) => Some(ErrorKind::InvalidSchedule),
            Self::UnknownContainer(_) => Some(ErrorKind::ContainerNotFound),
            _ => None,
        }
    }
}
