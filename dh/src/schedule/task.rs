//! Scheduled task model

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::dispatcher::{Action, OperationResult};
use crate::error::ErrorKind;

use super::cycle::{Cycle, resolve_local};
use super::error::ScheduleError;

/// Outcome of the most recent run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastRun {
    pub ran_at: DateTime<Utc>,
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl LastRun {
    pub fn from_result(result: &OperationResult, ran_at: DateTime<Utc>) -> Self {
        Self {
            ran_at,
            success: result.success,
            message: result.message.clone(),
            error_kind: result.error_kind(),
        }
    }
}

/// A persisted, time-triggered container action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    pub container: String,
    pub action: Action,
    pub cycle: Cycle,
    pub timezone: Tz,
    /// Unset while inactive
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_run: Option<LastRun>,
    pub is_active: bool,
    /// Consecutive transient failures of a one-shot task
    #[serde(default)]
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledTask {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.next_run_at.is_some_and(|t| t <= now)
    }

    /// Inactive one-shot task whose time has passed
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match &self.cycle {
            Cycle::Once { at } => !self.is_active && resolve_local(self.timezone, *at).is_none_or(|t| t <= now),
            _ => false,
        }
    }

    pub fn short_id(&self) -> &str {
        self.id.get(..8).unwrap_or(&self.id)
    }
}

/// Fields for a new task
#[derive(Debug, Clone)]
pub struct NewTask {
    pub container: String,
    pub action: Action,
    pub cycle: Cycle,
    pub timezone: Tz,
}

/// Partial edit of a task; unset fields are kept
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub container: Option<String>,
    pub action: Option<Action>,
    pub cycle: Option<Cycle>,
    pub timezone: Option<Tz>,
}

impl TaskUpdate {
    pub fn is_empty(&self) -> bool {
        self.container.is_none() && self.action.is_none() && self.cycle.is_none() && self.timezone.is_none()
    }
}

/// Which tasks `list_tasks` returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskFilter {
    #[default]
    All,
    Active,
    Inactive,
    Expired,
}

impl TaskFilter {
    pub fn matches(&self, task: &ScheduledTask, now: DateTime<Utc>) -> bool {
        match self {
            Self::All => true,
            Self::Active => task.is_active,
            Self::Inactive => !task.is_active,
            Self::Expired => task.is_expired(now),
        }
    }
}

impl fmt::Display for TaskFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::All => "all",
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Expired => "expired",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for TaskFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "all" => Ok(Self::All),
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            "expired" => Ok(Self::Expired),
            _ => Err(format!("unknown filter '{}', expected all, active, inactive or expired", s)),
        }
    }
}

/// Actions a task may run; logs have no one to read them
pub fn check_schedulable(action: Action) -> Result<(), ScheduleError> {
    match action {
        Action::Logs => Err(ScheduleError::Action(action.to_string())),
        _ => Ok(()),
    }
}
