//! Container engine seam
//!
//! The engine's wire protocol is owned by the client library; this module
//! only defines the narrow surface the dispatcher needs and a Docker
//! implementation of it. [`testing`] provides a scriptable in-process engine.

use std::sync::Arc;

use async_trait::async_trait;

mod docker;
mod error;
mod status;
pub mod testing;

pub use docker::{DockerClient, DockerConnector};
pub use error::EngineError;
pub use status::{ContainerState, ContainerStatus};

/// One live handle to the container engine
#[async_trait]
pub trait EngineClient: Send + Sync {
    /// Check that the engine answers
    async fn ping(&self) -> Result<(), EngineError>;

    /// Read the current status of a container
    async fn inspect(&self, engine_id: &str) -> Result<ContainerStatus, EngineError>;

    async fn start(&self, engine_id: &str) -> Result<(), EngineError>;

    async fn stop(&self, engine_id: &str) -> Result<(), EngineError>;

    async fn restart(&self, engine_id: &str) -> Result<(), EngineError>;

    /// Fetch the last `tail` lines of stdout and stderr
    async fn logs(&self, engine_id: &str, tail: usize) -> Result<String, EngineError>;
}

/// Factory for engine handles, used by the connection pool
#[async_trait]
pub trait EngineConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn EngineClient>, EngineError>;
}
