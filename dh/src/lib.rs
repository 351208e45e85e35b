//! Dockhand - container operations core for chat bridges
//!
//! Dockhand sits between a chat bridge and a container engine. Chat commands
//! and scheduled tasks both submit operations on named containers; the core
//! makes sure those operations never overload the engine, never interleave on
//! one container and never hang a caller.
//!
//! # Core Concepts
//!
//! - **Bounded engine access**: a fixed pool of engine handles shared by all work
//! - **One mutation per container**: start, stop and restart are serialized with a cooldown
//! - **Cached status**: reads are served from a TTL cache with stale-while-refresh
//! - **Scheduled actions**: once and recurring tasks in any IANA timezone
//!
//! # Modules
//!
//! - [`engine`] - Engine client seam, Docker implementation and test double
//! - [`pool`] - Connection pool of engine handles
//! - [`dispatcher`] - Operation queue, workers and per-container exclusion
//! - [`cache`] - Container status cache
//! - [`schedule`] - Scheduled tasks, cron parsing and persistence
//! - [`runtime`] - Wiring and external surface
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod cache;
pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod pool;
pub mod retry;
pub mod runtime;
pub mod schedule;

// Re-export commonly used types
pub use cache::{CacheEntry, StatusCache, StatusStore, TickSummary};
pub use config::{BusyPolicy, Config, ConfigStore, ContainerRef};
pub use dispatcher::{
    Action, Dispatcher, DispatcherStats, OperationRequest, OperationResult, Origin, Outcome, QueueEntry, QueueState,
    RequestState,
};
pub use engine::{ContainerState, ContainerStatus, DockerConnector, EngineClient, EngineConnector, EngineError};
pub use error::{ErrorKind, OpError};
pub use pool::{ConnectionPool, PoolConfig, PoolStats, PooledHandle};
pub use runtime::Runtime;
pub use schedule::{
    CronExpr, Cycle, LogNotifier, NewTask, Notifier, ScheduleError, ScheduledTask, StoreError, TaskFilter,
    TaskScheduler, TaskStore, TaskUpdate, TickReport,
};
