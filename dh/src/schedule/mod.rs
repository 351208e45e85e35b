//! Scheduled container actions
//!
//! Tasks are persisted by [`TaskStore`] and evaluated by [`TaskScheduler`] on
//! a fixed poll interval. Due tasks go through the dispatcher like any other
//! request, marked with the scheduler origin.

mod core;
mod cron;
mod cycle;
mod error;
mod notifier;
mod store;
mod task;

pub use core::{TaskScheduler, TickReport, apply_outcome};
pub use cron::CronExpr;
pub use cycle::{Cycle, days_in_month, parse_datetime, parse_time, parse_timezone, parse_weekday, resolve_local};
pub use error::{ScheduleError, StoreError};
pub use notifier::{LogNotifier, Notifier};
pub use store::TaskStore;
pub use task::{LastRun, NewTask, ScheduledTask, TaskFilter, TaskUpdate, check_schedulable};
