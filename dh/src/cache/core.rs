//! Status cache with TTL, grace and background refresh

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{Config, ConfigStore};
use crate::dispatcher::{Action, Dispatcher, OperationRequest};
use crate::error::OpError;

use super::entry::{CacheEntry, StatusStore};

/// Outcome of one ticker pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub refreshed: usize,
    pub failed: usize,
    pub evicted: usize,
}

/// Last-known container status, refreshed through the dispatcher
#[derive(Clone)]
pub struct StatusCache {
    store: Arc<StatusStore>,
    dispatcher: Arc<Dispatcher>,
    config: ConfigStore,
    /// Containers with a background refresh in flight
    refreshing: Arc<Mutex<HashSet<String>>>,
}

impl StatusCache {
    pub fn new(store: Arc<StatusStore>, dispatcher: Arc<Dispatcher>, config: ConfigStore) -> Self {
        Self {
            store,
            dispatcher,
            config,
            refreshing: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn store(&self) -> &Arc<StatusStore> {
        &self.store
    }

    /// Status of one container
    ///
    /// A fresh entry is returned as is. With `allow_stale`, an entry still
    /// within its grace window is returned flagged stale while one background
    /// refresh runs. Anything else refreshes synchronously.
    pub async fn get(&self, container: &str, allow_stale: bool) -> Result<CacheEntry, OpError> {
        debug!(%container, allow_stale, "StatusCache::get: called");
        let config = self.config.snapshot();
        if config.container(container).is_none() {
            return Err(OpError::ContainerNotFound(container.to_string()));
        }

        let now = Utc::now();
        let grace = config.cache.grace();

        if let Some(entry) = self.store.get(container) {
            if entry.is_fresh(now) {
                debug!(%container, "StatusCache::get: fresh hit");
                return Ok(entry);
            }
            if entry.is_expired(now) {
                self.store.mark_stale(container);
            }
            if allow_stale && entry.within_grace(now, grace) {
                debug!(%container, "StatusCache::get: serving stale, refreshing in background");
                self.spawn_refresh(container);
                return Ok(entry.into_stale());
            }
        }

        match self.refresh(container, &config).await {
            Ok(entry) => Ok(entry),
            Err(err) => {
                if allow_stale {
                    if let Some(entry) = self.store.get(container) {
                        if entry.within_grace(Utc::now(), grace) {
                            warn!(%container, error = %err, "Refresh failed, serving stale status");
                            return Ok(entry.into_stale());
                        }
                    }
                }
                Err(err)
            }
        }
    }

    /// Fetch status through the dispatcher; the dispatcher records it
    async fn refresh(&self, container: &str, config: &Config) -> Result<CacheEntry, OpError> {
        debug!(%container, "StatusCache::refresh: called");
        let request = OperationRequest::new(container, Action::Status, config.dispatcher.default_timeout());
        self.dispatcher.submit(request).await?;
        self.store
            .get(container)
            .ok_or_else(|| OpError::Engine(format!("no status recorded for {}", container)))
    }

    /// One background refresh per container at a time
    fn spawn_refresh(&self, container: &str) {
        {
            let mut refreshing = self.refreshing.lock().unwrap_or_else(|e| e.into_inner());
            if !refreshing.insert(container.to_string()) {
                debug!(%container, "StatusCache::spawn_refresh: already in flight");
                return;
            }
        }

        let cache = self.clone();
        let container = container.to_string();
        tokio::spawn(async move {
            let config = cache.config.snapshot();
            if let Err(e) = cache.refresh(&container, &config).await {
                warn!(%container, error = %e, "Background status refresh failed");
            }
            cache
                .refreshing
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&container);
        });
    }

    /// Drop entries for unconfigured containers and entries past TTL + grace
    pub fn evict(&self, config: &Config) -> usize {
        let now = Utc::now();
        let grace = config.cache.grace();
        let evicted = self
            .store
            .retain(|entry| config.container(&entry.container).is_some() && entry.within_grace(now, grace));
        if evicted > 0 {
            debug!(evicted, "StatusCache::evict: dropped entries");
        }
        evicted
    }

    /// Refresh every configured container, then evict
    pub async fn tick(&self) -> TickSummary {
        debug!("StatusCache::tick: called");
        let config = self.config.snapshot();
        let mut summary = TickSummary {
            evicted: self.evict(&config),
            ..Default::default()
        };

        // Bounded so a long container list cannot saturate the queue
        let names: Vec<String> = config.containers.iter().map(|c| c.name.clone()).collect();
        let results: Vec<_> = futures::stream::iter(names)
            .map(|name| {
                let cache = self.clone();
                let config = config.clone();
                async move { cache.refresh(&name, &config).await }
            })
            .buffer_unordered(config.dispatcher.max_concurrency.max(1))
            .collect()
            .await;

        for result in results {
            match result {
                Ok(_) => summary.refreshed += 1,
                Err(e) => {
                    debug!(error = %e, "StatusCache::tick: refresh failed");
                    summary.failed += 1;
                }
            }
        }

        summary.evicted += self.evict(&config);
        summary
    }

    /// Ticker loop; ends when `shutdown` flips or its sender goes away
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Status cache ticker started");
        loop {
            let summary = self.tick().await;
            debug!(?summary, "StatusCache::run: tick complete");

            let interval = self.config.snapshot().cache.refresh_interval();
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() || shutdown.has_changed().is_err() {
                break;
            }
        }
        info!("Status cache ticker stopped");
    }
}
