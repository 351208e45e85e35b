//! Docker engine client backed by bollard

use std::sync::Arc;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{InspectContainerOptions, LogsOptions, StartContainerOptions};
use bollard::errors::Error as BollardError;
use futures::StreamExt;
use tracing::{debug, info, warn};

use super::{ContainerState, ContainerStatus, EngineClient, EngineConnector, EngineError};

/// Default request timeout for the Docker socket, in seconds
const DOCKER_TIMEOUT_SECS: u64 = 120;

/// Creates Docker handles on demand
pub struct DockerConnector {
    socket: Option<String>,
}

impl DockerConnector {
    /// Connect through `socket`, or the platform default when `None`
    pub fn new(socket: Option<String>) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl EngineConnector for DockerConnector {
    async fn connect(&self) -> Result<Arc<dyn EngineClient>, EngineError> {
        debug!(socket = ?self.socket, "DockerConnector::connect: called");
        let docker = match &self.socket {
            Some(path) => Docker::connect_with_socket(path, DOCKER_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION),
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(|e| EngineError::Unreachable(e.to_string()))?;

        let client = DockerClient::new(docker);
        client.ping().await?;

        info!(socket = ?self.socket, "Connected to Docker engine");
        Ok(Arc::new(client))
    }
}

/// A single Docker connection
pub struct DockerClient {
    docker: Docker,
}

impl DockerClient {
    fn new(docker: Docker) -> Self {
        Self { docker }
    }
}

/// Map a bollard error onto the engine taxonomy
fn map_error(engine_id: &str, err: BollardError) -> EngineError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => EngineError::NotFound(engine_id.to_string()),
        BollardError::DockerResponseServerError {
            status_code: 409,
            message,
        } => EngineError::Busy(message),
        BollardError::DockerResponseServerError { status_code, message } => EngineError::Api {
            status: status_code,
            message,
        },
        BollardError::RequestTimeoutError => EngineError::Unreachable("request timed out".to_string()),
        other => EngineError::Unreachable(other.to_string()),
    }
}

/// Start/stop report 304 when the container is already in the requested state
fn ignore_not_modified(engine_id: &str, result: Result<(), BollardError>) -> Result<(), EngineError> {
    match result {
        Ok(()) => Ok(()),
        Err(BollardError::DockerResponseServerError { status_code: 304, .. }) => {
            debug!(%engine_id, "container already in requested state");
            Ok(())
        }
        Err(e) => Err(map_error(engine_id, e)),
    }
}

#[async_trait]
impl EngineClient for DockerClient {
    async fn ping(&self) -> Result<(), EngineError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| EngineError::Unreachable(e.to_string()))
    }

    async fn inspect(&self, engine_id: &str) -> Result<ContainerStatus, EngineError> {
        debug!(%engine_id, "DockerClient::inspect: called");
        let info = self
            .docker
            .inspect_container(engine_id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_error(engine_id, e))?;

        let state = info.state.unwrap_or_default();
        let parsed = state
            .status
            .map(|s| s.to_string())
            .and_then(|s| s.parse::<ContainerState>().ok())
            .unwrap_or_else(|| {
                warn!(%engine_id, "engine reported no usable state");
                ContainerState::Unknown
            });

        Ok(ContainerStatus {
            state: parsed,
            health: state
                .health
                .and_then(|h| h.status)
                .map(|s| s.to_string())
                .filter(|s| !s.is_empty()),
            started_at: state.started_at,
            image: info.config.and_then(|c| c.image),
        })
    }

    async fn start(&self, engine_id: &str) -> Result<(), EngineError> {
        debug!(%engine_id, "DockerClient::start: called");
        let result = self
            .docker
            .start_container(engine_id, None::<StartContainerOptions<String>>)
            .await;
        ignore_not_modified(engine_id, result)
    }

    async fn stop(&self, engine_id: &str) -> Result<(), EngineError> {
        debug!(%engine_id, "DockerClient::stop: called");
        let result = self.docker.stop_container(engine_id, None).await;
        ignore_not_modified(engine_id, result)
    }

    async fn restart(&self, engine_id: &str) -> Result<(), EngineError> {
        debug!(%engine_id, "DockerClient::restart: called");
        self.docker
            .restart_container(engine_id, None)
            .await
            .map_err(|e| map_error(engine_id, e))
    }

    async fn logs(&self, engine_id: &str, tail: usize) -> Result<String, EngineError> {
        debug!(%engine_id, tail, "DockerClient::logs: called");
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        };

        let mut stream = self.docker.logs(engine_id, Some(options));
        let mut output = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| map_error(engine_id, e))?;
            output.push_str(&chunk.to_string());
        }
        Ok(output)
    }
}
