//! Runtime: owns every component and exposes the bridge's external surface

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use eyre::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, StatusCache, StatusStore};
use crate::config::{Config, ConfigStore};
use crate::dispatcher::{Action, Dispatcher, OperationRequest, OperationResult, QueueEntry, QueueState};
use crate::engine::EngineConnector;
use crate::error::OpError;
use crate::pool::{ConnectionPool, PoolConfig, PoolStats};
use crate::schedule::{NewTask, Notifier, ScheduledTask, StoreError, TaskFilter, TaskScheduler, TaskStore, TaskUpdate};

/// How long shutdown waits for checked-out engine handles
const POOL_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Base delay between engine connection attempts
const CONNECT_BACKOFF: Duration = Duration::from_millis(100);

/// The assembled bridge core
///
/// Construction must happen inside a Tokio runtime: the dispatcher spawns its
/// workers immediately. Background loops (cache ticker and scheduler) start
/// only when [`Runtime::start_background`] is called.
pub struct Runtime {
    config: ConfigStore,
    pool: Arc<ConnectionPool>,
    dispatcher: Arc<Dispatcher>,
    cache: StatusCache,
    tasks: Arc<TaskStore>,
    scheduler: Arc<TaskScheduler>,
    shutdown_tx: watch::Sender<bool>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    pub fn new(
        config: Config,
        connector: Arc<dyn EngineConnector>,
        tasks: TaskStore,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        debug!(containers = config.containers.len(), "Runtime::new: called");
        config.validate()?;

        let pool = Arc::new(ConnectionPool::new(
            connector,
            PoolConfig {
                size: config.engine.pool_size,
                connect_retries: config.engine.connect_retries,
                connect_backoff: CONNECT_BACKOFF,
            },
        ));
        let config = ConfigStore::new(config);
        let statuses = Arc::new(StatusStore::new());
        let dispatcher = Dispatcher::start(config.clone(), pool.clone(), statuses.clone());
        let cache = StatusCache::new(statuses, dispatcher.clone(), config.clone());
        let tasks = Arc::new(tasks);
        let scheduler = Arc::new(TaskScheduler::new(
            tasks.clone(),
            dispatcher.clone(),
            config.clone(),
            notifier,
        ));
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            pool,
            dispatcher,
            cache,
            tasks,
            scheduler,
            shutdown_tx,
            background: Mutex::new(Vec::new()),
        })
    }

    /// Start the cache ticker and the scheduler loop
    pub fn start_background(&self) {
        debug!("Runtime::start_background: called");
        let mut background = self.background.lock().unwrap_or_else(|e| e.into_inner());
        if !background.is_empty() {
            debug!("Runtime::start_background: already running");
            return;
        }

        background.push(tokio::spawn(self.cache.clone().run(self.shutdown_tx.subscribe())));

        let scheduler = self.scheduler.clone();
        let shutdown = self.shutdown_tx.subscribe();
        background.push(tokio::spawn(async move { scheduler.run(shutdown).await }));

        info!("Background loops started");
    }

    /// Run one action against a container and wait for its result
    ///
    /// `timeout` defaults to the configured execution timeout.
    pub async fn submit_operation(
        &self,
        container: &str,
        action: Action,
        timeout: Option<Duration>,
    ) -> Result<OperationResult, OpError> {
        debug!(%container, %action, ?timeout, "Runtime::submit_operation: called");
        let timeout = timeout.unwrap_or_else(|| self.config.snapshot().dispatcher.default_timeout());
        self.dispatcher
            .submit(OperationRequest::new(container, action, timeout))
            .await
    }

    /// Last `tail` log lines of a container
    pub async fn logs(&self, container: &str, tail: Option<usize>, timeout: Option<Duration>) -> Result<String, OpError> {
        debug!(%container, ?tail, "Runtime::logs: called");
        let config = self.config.snapshot();
        let timeout = timeout.unwrap_or_else(|| config.dispatcher.default_timeout());
        let mut request = OperationRequest::new(container, Action::Logs, timeout);
        if let Some(tail) = tail {
            request = request.with_log_tail(tail);
        }
        let result = self.dispatcher.submit(request).await?;
        Ok(result.output.unwrap_or_default())
    }

    pub async fn get_status(&self, container: &str, allow_stale: bool) -> Result<CacheEntry, OpError> {
        self.cache.get(container, allow_stale).await
    }

    /// Cancel a queued request
    pub async fn cancel(&self, request_id: &str) -> bool {
        self.dispatcher.cancel(request_id).await
    }

    pub async fn create_task(&self, new: NewTask) -> Result<ScheduledTask, StoreError> {
        self.tasks.create_task(new, &self.config.snapshot(), Utc::now()).await
    }

    pub async fn get_task(&self, id: &str) -> Result<ScheduledTask, StoreError> {
        self.tasks.get_task(id).await
    }

    pub async fn list_tasks(&self, filter: TaskFilter) -> Vec<ScheduledTask> {
        self.tasks.list_tasks(filter, Utc::now()).await
    }

    pub async fn update_task(&self, id: &str, update: TaskUpdate) -> Result<ScheduledTask, StoreError> {
        self.tasks
            .update_task(id, update, &self.config.snapshot(), Utc::now())
            .await
    }

    pub async fn delete_task(&self, id: &str) -> Result<ScheduledTask, StoreError> {
        self.tasks.delete_task(id).await
    }

    pub async fn set_task_active(&self, id: &str, active: bool) -> Result<ScheduledTask, StoreError> {
        self.tasks.set_task_active(id, active, Utc::now()).await
    }

    /// Current configuration snapshot
    pub fn config(&self) -> Arc<Config> {
        self.config.snapshot()
    }

    /// Swap in a new configuration
    ///
    /// Pool size and worker count are fixed at startup; changes to them are
    /// logged and take effect on restart.
    pub fn reload(&self, config: Config) -> Result<()> {
        debug!("Runtime::reload: called");
        let current = self.config.snapshot();
        if config.engine.pool_size != current.engine.pool_size {
            warn!(
                from = current.engine.pool_size,
                to = config.engine.pool_size,
                "engine.pool-size changes need a restart"
            );
        }
        if config.dispatcher.max_concurrency > current.dispatcher.max_concurrency {
            warn!(
                from = current.dispatcher.max_concurrency,
                to = config.dispatcher.max_concurrency,
                "Raising dispatcher.max-concurrency needs a restart"
            );
        }
        self.config.reload(config)
    }

    pub async fn queue_state(&self) -> QueueState {
        self.dispatcher.queue_state().await
    }

    /// Running requests, longest first, then the queue in FIFO order
    pub async fn queue_details(&self) -> Vec<QueueEntry> {
        self.dispatcher.queue_details().await
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn cache(&self) -> &StatusCache {
        &self.cache
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    pub fn tasks(&self) -> &Arc<TaskStore> {
        &self.tasks
    }

    /// Stop background loops, then the dispatcher, then drain the pool
    pub async fn shutdown(&self) {
        info!("Shutting down");
        self.shutdown_tx.send_replace(true);

        let background = std::mem::take(&mut *self.background.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in background {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background loop ended abnormally");
            }
        }

        self.dispatcher.shutdown().await;

        let left = self.pool.shutdown(POOL_DRAIN_TIMEOUT).await;
        if left > 0 {
            warn!(left, "Engine handles still in use at shutdown");
        }
        info!("Shutdown complete");
    }
}
