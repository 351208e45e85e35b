//! Fixed-size pool of container engine handles
//!
//! Handles are created lazily on first use and validated lazily: a handle
//! that failed is discarded instead of returned, and the slot it occupied is
//! refilled by the next `acquire`. Capacity therefore never drops below the
//! configured size while the backend is flaky.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::engine::{EngineClient, EngineConnector};
use crate::error::OpError;
use crate::retry::Backoff;

/// Pool settings, fixed at construction
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub size: usize,
    pub connect_retries: u32,
    pub connect_backoff: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 4,
            connect_retries: 3,
            connect_backoff: Duration::from_millis(100),
        }
    }
}

/// Point-in-time pool counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub size: usize,
    pub idle: usize,
    pub in_use: usize,
    pub created: u64,
    pub discarded: u64,
}

struct PoolShared {
    connector: Arc<dyn EngineConnector>,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Arc<dyn EngineClient>>>,
    in_use: AtomicUsize,
    created: AtomicU64,
    discarded: AtomicU64,
    closed: AtomicBool,
    returned: Notify,
}

/// Engine connection pool
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

/// A handle checked out of the pool
///
/// Dereferences to the engine client. Give it back with
/// [`ConnectionPool::release`]; dropping it without release discards the
/// underlying connection and frees the slot.
pub struct PooledHandle {
    client: Arc<dyn EngineClient>,
    released: bool,
    pool: Arc<PoolShared>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledHandle {
    type Target = dyn EngineClient;

    fn deref(&self) -> &Self::Target {
        self.client.as_ref()
    }
}

impl fmt::Debug for PooledHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledHandle").field("released", &self.released).finish_non_exhaustive()
    }
}

impl Drop for PooledHandle {
    fn drop(&mut self) {
        if !self.released {
            self.pool.discarded.fetch_add(1, Ordering::SeqCst);
            debug!("PooledHandle dropped without release, discarding");
        }
        self.pool.in_use.fetch_sub(1, Ordering::SeqCst);
        self.pool.returned.notify_waiters();
    }
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn EngineConnector>, config: PoolConfig) -> Self {
        debug!(?config, "ConnectionPool::new: called");
        let size = config.size.max(1);
        Self {
            shared: Arc::new(PoolShared {
                connector,
                permits: Arc::new(Semaphore::new(size)),
                config: PoolConfig { size, ..config },
                idle: Mutex::new(Vec::with_capacity(size)),
                in_use: AtomicUsize::new(0),
                created: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                returned: Notify::new(),
            }),
        }
    }

    /// Check out a handle, waiting at most `timeout` for a free slot
    pub async fn acquire(&self, timeout: Duration) -> Result<PooledHandle, OpError> {
        debug!(?timeout, "ConnectionPool::acquire: called");
        let permit = match tokio::time::timeout(timeout, self.shared.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                debug!("ConnectionPool::acquire: pool closed");
                return Err(OpError::ShuttingDown);
            }
            Err(_) => {
                debug!(?timeout, "ConnectionPool::acquire: exhausted");
                return Err(OpError::PoolExhausted(timeout));
            }
        };

        let idle = self.shared.idle.lock().unwrap_or_else(|e| e.into_inner()).pop();
        let client = match idle {
            Some(client) => client,
            // The permit is dropped on error, so a failed create frees its slot
            None => self.create().await?,
        };

        self.shared.in_use.fetch_add(1, Ordering::SeqCst);
        Ok(PooledHandle {
            client,
            released: false,
            pool: self.shared.clone(),
            _permit: permit,
        })
    }

    /// Return a healthy handle to the pool
    pub fn release(&self, mut handle: PooledHandle) {
        handle.released = true;
        if self.shared.closed.load(Ordering::SeqCst) {
            debug!("ConnectionPool::release: pool closed, dropping handle");
        } else {
            self.shared
                .idle
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(handle.client.clone());
        }
    }

    /// Drop a handle that errored; its slot is refilled on the next acquire
    pub fn discard(&self, handle: PooledHandle) {
        debug!("ConnectionPool::discard: called");
        drop(handle);
    }

    async fn create(&self) -> Result<Arc<dyn EngineClient>, OpError> {
        let backoff = Backoff::new(self.shared.config.connect_backoff);
        let mut attempt = 0;
        loop {
            match self.shared.connector.connect().await {
                Ok(client) => {
                    self.shared.created.fetch_add(1, Ordering::SeqCst);
                    debug!(attempt, "ConnectionPool::create: connected");
                    return Ok(client);
                }
                Err(e) if e.is_transient() && attempt < self.shared.config.connect_retries => {
                    let delay = backoff.delay(attempt);
                    warn!(error = %e, attempt, ?delay, "Engine connect failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(error = %e, attempt, "Engine connect failed");
                    return Err(e.into());
                }
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.shared.config.size,
            idle: self.shared.idle.lock().unwrap_or_else(|e| e.into_inner()).len(),
            in_use: self.shared.in_use.load(Ordering::SeqCst),
            created: self.shared.created.load(Ordering::SeqCst),
            discarded: self.shared.discarded.load(Ordering::SeqCst),
        }
    }

    /// Refuse new acquires and wait for checked-out handles to come back
    ///
    /// Returns the number of handles still out when `timeout` elapsed.
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        debug!(?timeout, "ConnectionPool::shutdown: called");
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.permits.close();
        self.shared.idle.lock().unwrap_or_else(|e| e.into_inner()).clear();

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let returned = self.shared.returned.notified();
            let in_use = self.shared.in_use.load(Ordering::SeqCst);
            if in_use == 0 {
                info!("Connection pool drained");
                return 0;
            }
            if tokio::time::timeout_at(deadline, returned).await.is_err() {
                let left = self.shared.in_use.load(Ordering::SeqCst);
                warn!(left, "Connection pool shutdown timed out with handles still in use");
                return left;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ContainerState;
    use crate::engine::testing::MockEngine;

    fn pool_with(engine: &MockEngine, size: usize) -> ConnectionPool {
        ConnectionPool::new(
            Arc::new(engine.clone()),
            PoolConfig {
                size,
                connect_retries: 2,
                connect_backoff: Duration::from_millis(1),
            },
        )
    }

    #[tokio::test]
    async fn test_handles_are_reused() {
        let engine = MockEngine::new().with_container("web", ContainerState::Running);
        let pool = pool_with(&engine, 2);

        let handle = pool.acquire(Duration::from_millis(50)).await.unwrap();
        handle.inspect("web").await.unwrap();
        pool.release(handle);

        let handle = pool.acquire(Duration::from_millis(50)).await.unwrap();
        pool.release(handle);

        assert_eq!(engine.connects(), 1);
        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.in_use, 0);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_error() {
        let engine = MockEngine::new();
        let pool = pool_with(&engine, 1);

        let _held = pool.acquire(Duration::from_millis(50)).await.unwrap();
        let err = pool.acquire(Duration::from_millis(20)).await.unwrap_err();

        assert!(matches!(err, OpError::PoolExhausted(_)));
    }

    #[tokio::test]
    async fn test_acquire_result_is_debuggable() {
        let engine = MockEngine::new();
        let pool = pool_with(&engine, 1);

        let held = pool.acquire(Duration::from_millis(50)).await;
        assert!(format!("{:?}", held).contains("PooledHandle"));

        let err = pool.acquire(Duration::from_millis(10)).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::PoolExhausted);
    }

    #[tokio::test]
    async fn test_waiter_gets_released_handle() {
        let engine = MockEngine::new();
        let pool = Arc::new(pool_with(&engine, 1));

        let held = pool.acquire(Duration::from_millis(50)).await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(Duration::from_secs(1)).await.is_ok() })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.release(held);

        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_discard_keeps_capacity() {
        let engine = MockEngine::new();
        let pool = pool_with(&engine, 1);

        let handle = pool.acquire(Duration::from_millis(50)).await.unwrap();
        pool.discard(handle);

        // Slot is refilled with a fresh connection
        let handle = pool.acquire(Duration::from_millis(50)).await.unwrap();
        pool.release(handle);

        let stats = pool.stats();
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.created, 2);
        assert_eq!(engine.connects(), 2);
    }

    #[tokio::test]
    async fn test_connect_retries_then_succeeds() {
        let engine = MockEngine::new();
        engine.fail_connects(2);
        let pool = pool_with(&engine, 1);

        let handle = pool.acquire(Duration::from_millis(50)).await;
        assert!(handle.is_ok());
        assert_eq!(engine.connects(), 3);
    }

    #[tokio::test]
    async fn test_connect_gives_up_and_frees_slot() {
        let engine = MockEngine::new();
        engine.fail_connects(10);
        let pool = pool_with(&engine, 1);

        let err = pool.acquire(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, OpError::EngineUnreachable(_)));
        assert_eq!(pool.stats().in_use, 0);

        engine.fail_connects(0);
        assert!(pool.acquire(Duration::from_millis(50)).await.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_handles() {
        let engine = MockEngine::new();
        let pool = Arc::new(pool_with(&engine, 2));

        let held = pool.acquire(Duration::from_millis(50)).await.unwrap();
        let releaser = {
            let pool = pool.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                pool.release(held);
            })
        };

        let left = pool.shutdown(Duration::from_secs(1)).await;
        releaser.await.unwrap();

        assert_eq!(left, 0);
        assert!(matches!(
            pool.acquire(Duration::from_millis(10)).await,
            Err(OpError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_reports_leftovers() {
        let engine = MockEngine::new();
        let pool = pool_with(&engine, 1);

        let _held = pool.acquire(Duration::from_millis(50)).await.unwrap();
        assert_eq!(pool.shutdown(Duration::from_millis(20)).await, 1);
    }
}
