//! Dockhand configuration types, loading and live snapshots

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

/// Main Dockhand configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level used when `--log-level` is not given
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,

    /// Container engine connection settings
    pub engine: EngineConfig,

    /// Containers this process may operate on
    pub containers: Vec<ContainerRef>,

    /// Operation dispatcher limits
    pub dispatcher: DispatcherConfig,

    /// Status cache policy
    pub cache: CacheConfig,

    /// Scheduled task settings
    pub scheduler: SchedulerConfig,
}

impl Config {
    /// Validate configuration before use
    pub fn validate(&self) -> Result<()> {
        if self.engine.pool_size == 0 {
            return Err(eyre::eyre!("engine.pool-size must be at least 1"));
        }
        if self.dispatcher.max_concurrency == 0 {
            return Err(eyre::eyre!("dispatcher.max-concurrency must be at least 1"));
        }
        if self.dispatcher.queue_capacity == 0 {
            return Err(eyre::eyre!("dispatcher.queue-capacity must be at least 1"));
        }
        if self.cache.ttl_seconds == 0 {
            return Err(eyre::eyre!("cache.ttl-seconds must be at least 1"));
        }
        if self.cache.refresh_interval_seconds == 0 {
            return Err(eyre::eyre!("cache.refresh-interval-seconds must be at least 1"));
        }
        if self.scheduler.poll_interval_seconds == 0 {
            return Err(eyre::eyre!("scheduler.poll-interval-seconds must be at least 1"));
        }

        let mut seen = HashSet::new();
        for container in &self.containers {
            if container.name.trim().is_empty() {
                return Err(eyre::eyre!("container name must not be empty"));
            }
            if !seen.insert(container.name.as_str()) {
                return Err(eyre::eyre!("duplicate container name: {}", container.name));
            }
        }
        Ok(())
    }

    /// Look up a configured container by name
    pub fn container(&self, name: &str) -> Option<&ContainerRef> {
        self.containers.iter().find(|c| c.name == name)
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .dockhand.yml
        let local_config = PathBuf::from(".dockhand.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/dockhand/dockhand.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("dockhand").join("dockhand.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read only the log level, before logging is initialised
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        let path = config_path.cloned().unwrap_or_else(|| PathBuf::from(".dockhand.yml"));
        let content = fs::read_to_string(path).ok()?;
        let config: Self = serde_yaml::from_str(&content).ok()?;
        config.log_level
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// A container the bridge is allowed to act on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRef {
    /// Unique name used by chat commands and scheduled tasks
    pub name: String,

    /// Identifier understood by the engine; defaults to `name`
    #[serde(rename = "engine-id", default, skip_serializing_if = "Option::is_none")]
    pub engine_id: Option<String>,
}

impl ContainerRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            engine_id: None,
        }
    }

    pub fn with_engine_id(mut self, engine_id: impl Into<String>) -> Self {
        self.engine_id = Some(engine_id.into());
        self
    }

    pub fn engine_id(&self) -> &str {
        self.engine_id.as_deref().unwrap_or(&self.name)
    }
}

/// Container engine connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Engine socket path; platform default when unset
    pub socket: Option<String>,

    /// Number of pooled engine handles (fixed at startup)
    #[serde(rename = "pool-size")]
    pub pool_size: usize,

    /// How long `acquire` waits for a free handle
    #[serde(rename = "acquire-timeout-ms")]
    pub acquire_timeout_ms: u64,

    /// Retries when creating a new handle fails
    #[serde(rename = "connect-retries")]
    pub connect_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            socket: None,
            pool_size: 4,
            acquire_timeout_ms: 2_000,
            connect_retries: 3,
        }
    }
}

impl EngineConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// What to do with a mutating request whose container is busy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicy {
    /// Wait in the queue until the container token is free
    #[default]
    Queue,
    /// Fail immediately with `ContainerBusy`
    Reject,
}

/// Operation dispatcher limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Maximum operations running at once
    #[serde(rename = "max-concurrency")]
    pub max_concurrency: usize,

    /// Maximum queued operations before `Saturated`
    #[serde(rename = "queue-capacity")]
    pub queue_capacity: usize,

    /// Extra queue slots only scheduler-issued requests may use
    #[serde(rename = "scheduler-reserve")]
    pub scheduler_reserve: usize,

    /// Minimum gap between mutating actions on one container
    #[serde(rename = "cooldown-seconds")]
    pub cooldown_seconds: u64,

    #[serde(rename = "busy-policy")]
    pub busy_policy: BusyPolicy,

    /// Execution timeout when the caller does not give one
    #[serde(rename = "default-timeout-ms")]
    pub default_timeout_ms: u64,

    /// Longest a request may wait in the queue
    #[serde(rename = "queue-timeout-ms")]
    pub queue_timeout_ms: u64,

    /// Retries for transient failures
    #[serde(rename = "max-retries")]
    pub max_retries: u32,

    /// Base delay for exponential backoff
    #[serde(rename = "retry-backoff-ms")]
    pub retry_backoff_ms: u64,

    /// Lines returned by the logs action
    #[serde(rename = "logs-tail")]
    pub logs_tail: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 3,
            queue_capacity: 32,
            scheduler_reserve: 4,
            cooldown_seconds: 5,
            busy_policy: BusyPolicy::Queue,
            default_timeout_ms: 30_000,
            queue_timeout_ms: 60_000,
            max_retries: 2,
            retry_backoff_ms: 250,
            logs_tail: 100,
        }
    }
}

impl DispatcherConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_seconds)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Status cache policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// How long a fetched status counts as fresh
    #[serde(rename = "ttl-seconds")]
    pub ttl_seconds: u64,

    /// How long past its TTL an entry may still be served as stale
    #[serde(rename = "grace-seconds")]
    pub grace_seconds: u64,

    /// Background refresh period
    #[serde(rename = "refresh-interval-seconds")]
    pub refresh_interval_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 30,
            grace_seconds: 120,
            refresh_interval_seconds: 15,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_seconds)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_seconds)
    }
}

/// Scheduled task settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How often due tasks are scanned
    #[serde(rename = "poll-interval-seconds")]
    pub poll_interval_seconds: u64,

    /// Where scheduled tasks are persisted
    #[serde(rename = "tasks-file")]
    pub tasks_file: Option<PathBuf>,

    /// Attempts a one-shot task gets when dispatch keeps failing transiently
    #[serde(rename = "once-retry-limit")]
    pub once_retry_limit: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 60,
            tasks_file: None,
            once_retry_limit: 3,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    /// Configured tasks file, or `<data dir>/dockhand/tasks.json`
    pub fn tasks_path(&self) -> PathBuf {
        self.tasks_file.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("dockhand")
                .join("tasks.json")
        })
    }
}

/// Holder of the current configuration snapshot
///
/// Readers take an `Arc<Config>` at the start of a decision and use it
/// throughout; `reload` swaps in a whole new snapshot.
#[derive(Clone)]
pub struct ConfigStore {
    tx: Arc<watch::Sender<Arc<Config>>>,
}

impl ConfigStore {
    pub fn new(config: Config) -> Self {
        debug!(containers = config.containers.len(), "ConfigStore::new: called");
        let (tx, _rx) = watch::channel(Arc::new(config));
        Self { tx: Arc::new(tx) }
    }

    /// Current immutable snapshot
    pub fn snapshot(&self) -> Arc<Config> {
        self.tx.borrow().clone()
    }

    /// Validate and atomically replace the snapshot
    pub fn reload(&self, config: Config) -> Result<()> {
        debug!("ConfigStore::reload: called");
        config.validate()?;
        self.tx.send_replace(Arc::new(config));
        info!("Configuration reloaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.dispatcher.max_concurrency, 3);
        assert_eq!(config.engine.pool_size, 4);
        assert_eq!(config.scheduler.poll_interval_seconds, 60);
        assert_eq!(config.dispatcher.busy_policy, BusyPolicy::Queue);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_config() {
        let yaml = r#"
log-level: debug

engine:
  socket: /run/user/1000/docker.sock
  pool-size: 2
  acquire-timeout-ms: 500

containers:
  - name: web
    engine-id: web-1
  - name: db

dispatcher:
  max-concurrency: 5
  queue-capacity: 10
  cooldown-seconds: 0
  busy-policy: reject

cache:
  ttl-seconds: 10
  grace-seconds: 20

scheduler:
  poll-interval-seconds: 90
  tasks-file: /tmp/tasks.json
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert_eq!(config.engine.pool_size, 2);
        assert_eq!(config.engine.acquire_timeout(), Duration::from_millis(500));
        assert_eq!(config.containers.len(), 2);
        assert_eq!(config.container("web").unwrap().engine_id(), "web-1");
        assert_eq!(config.container("db").unwrap().engine_id(), "db");
        assert_eq!(config.dispatcher.max_concurrency, 5);
        assert_eq!(config.dispatcher.busy_policy, BusyPolicy::Reject);
        assert_eq!(config.cache.grace(), Duration::from_secs(20));
        assert_eq!(config.scheduler.tasks_path(), PathBuf::from("/tmp/tasks.json"));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let yaml = r#"
dispatcher:
  max-concurrency: 8
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.dispatcher.max_concurrency, 8);
        assert_eq!(config.dispatcher.queue_capacity, 32);
        assert_eq!(config.cache.ttl_seconds, 30);
        assert!(config.containers.is_empty());
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let config = Config {
            containers: vec![ContainerRef::new("web"), ContainerRef::new("web")],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let mut config = Config::default();
        config.dispatcher.max_concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_store_reload_swaps_snapshot() {
        let store = ConfigStore::new(Config::default());
        let before = store.snapshot();

        let mut next = Config::default();
        next.containers.push(ContainerRef::new("web"));
        store.reload(next).unwrap();

        // Old snapshot is untouched, new readers see the new one
        assert!(before.containers.is_empty());
        assert!(store.snapshot().container("web").is_some());
    }

    #[test]
    fn test_store_reload_rejects_invalid() {
        let store = ConfigStore::new(Config::default());
        let mut bad = Config::default();
        bad.engine.pool_size = 0;

        assert!(store.reload(bad).is_err());
        assert_eq!(store.snapshot().engine.pool_size, 4);
    }
}
