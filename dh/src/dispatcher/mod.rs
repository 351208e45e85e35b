//! Operation dispatcher
//!
//! Runs container actions with a global concurrency limit, per-container
//! exclusion for mutating actions, per-request timeouts and bounded retries.

mod cooldown;
mod core;
mod request;

pub use core::{Dispatcher, DispatcherStats, QueueEntry, QueueState};
pub use cooldown::CooldownMap;
pub use request::{Action, OperationRequest, OperationResult, Origin, Outcome, RequestState};
