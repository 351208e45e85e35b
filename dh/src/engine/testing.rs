//! Scriptable in-process engine for tests
//!
//! `MockEngine` is both the connector and the shared backend behind every
//! handle it creates. It records calls and tracks how many run at once, so
//! tests can assert on concurrency limits and per-container exclusion.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{ContainerState, ContainerStatus, EngineClient, EngineConnector, EngineError};

/// Operation names recorded by the mock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOp {
    Inspect,
    Start,
    Stop,
    Restart,
    Logs,
}

impl MockOp {
    fn is_mutating(&self) -> bool {
        matches!(self, Self::Start | Self::Stop | Self::Restart)
    }
}

/// A recorded engine call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub engine_id: String,
    pub op: MockOp,
}

#[derive(Default)]
struct MockState {
    containers: Mutex<HashMap<String, ContainerState>>,
    latency: Mutex<Duration>,
    container_latency: Mutex<HashMap<String, Duration>>,
    hung: Mutex<HashSet<String>>,
    failing_calls: AtomicU32,
    failing_connects: AtomicU32,
    connects: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    mutating: Mutex<HashSet<String>>,
    overlap: AtomicBool,
    calls: Mutex<Vec<MockCall>>,
}

/// In-process engine with scripted latency and failures
#[derive(Clone, Default)]
pub struct MockEngine {
    state: Arc<MockState>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a container in the given state
    pub fn with_container(self, engine_id: &str, state: ContainerState) -> Self {
        self.set_state(engine_id, state);
        self
    }

    pub fn set_state(&self, engine_id: &str, state: ContainerState) {
        self.state
            .containers
            .lock()
            .unwrap()
            .insert(engine_id.to_string(), state);
    }

    pub fn state_of(&self, engine_id: &str) -> Option<ContainerState> {
        self.state.containers.lock().unwrap().get(engine_id).copied()
    }

    /// Latency applied to every call
    pub fn set_latency(&self, latency: Duration) {
        *self.state.latency.lock().unwrap() = latency;
    }

    /// Latency applied to calls for one container, overriding the global one
    pub fn set_container_latency(&self, engine_id: &str, latency: Duration) {
        self.state
            .container_latency
            .lock()
            .unwrap()
            .insert(engine_id.to_string(), latency);
    }

    /// Calls for this container block until `release` is called
    pub fn hang(&self, engine_id: &str) {
        self.state.hung.lock().unwrap().insert(engine_id.to_string());
    }

    pub fn release(&self, engine_id: &str) {
        self.state.hung.lock().unwrap().remove(engine_id);
    }

    /// The next `n` calls fail with `Unreachable`
    pub fn fail_calls(&self, n: u32) {
        self.state.failing_calls.store(n, Ordering::SeqCst);
    }

    /// The next `n` connection attempts fail with `Unreachable`
    pub fn fail_connects(&self, n: u32) {
        self.state.failing_connects.store(n, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.state.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of calls observed running at once
    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }

    /// True if two mutating calls ever overlapped on one container
    pub fn mutating_overlap(&self) -> bool {
        self.state.overlap.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, engine_id: &str, op: MockOp) -> usize {
        self.state
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.engine_id == engine_id && c.op == op)
            .count()
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    async fn call(&self, engine_id: &str, op: MockOp) -> Result<(), EngineError> {
        self.state.calls.lock().unwrap().push(MockCall {
            engine_id: engine_id.to_string(),
            op,
        });

        let _guard = FlightGuard::enter(&self.state, engine_id, op);

        let latency = self
            .state
            .container_latency
            .lock()
            .unwrap()
            .get(engine_id)
            .copied()
            .unwrap_or_else(|| *self.state.latency.lock().unwrap());
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        while self.state.hung.lock().unwrap().contains(engine_id) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        if Self::take_failure(&self.state.failing_calls) {
            return Err(EngineError::Unreachable("scripted failure".to_string()));
        }

        if !self.state.containers.lock().unwrap().contains_key(engine_id) {
            return Err(EngineError::NotFound(engine_id.to_string()));
        }
        Ok(())
    }
}

/// Tracks in-flight counts for the duration of one call
struct FlightGuard<'a> {
    state: &'a MockState,
    engine_id: String,
    mutating: bool,
}

impl<'a> FlightGuard<'a> {
    fn enter(state: &'a MockState, engine_id: &str, op: MockOp) -> Self {
        let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        state.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let mutating = op.is_mutating();
        if mutating && !state.mutating.lock().unwrap().insert(engine_id.to_string()) {
            state.overlap.store(true, Ordering::SeqCst);
        }

        Self {
            state,
            engine_id: engine_id.to_string(),
            mutating,
        }
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.mutating {
            self.state.mutating.lock().unwrap().remove(&self.engine_id);
        }
    }
}

#[async_trait]
impl EngineConnector for MockEngine {
    async fn connect(&self) -> Result<Arc<dyn EngineClient>, EngineError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.state.failing_connects) {
            return Err(EngineError::Unreachable("scripted connect failure".to_string()));
        }
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl EngineClient for MockEngine {
    async fn ping(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn inspect(&self, engine_id: &str) -> Result<ContainerStatus, EngineError> {
        self.call(engine_id, MockOp::Inspect).await?;
        let state = self.state_of(engine_id).unwrap_or_default();
        Ok(ContainerStatus::new(state))
    }

    async fn start(&self, engine_id: &str) -> Result<(), EngineError> {
        self.call(engine_id, MockOp::Start).await?;
        self.set_state(engine_id, ContainerState::Running);
        Ok(())
    }

    async fn stop(&self, engine_id: &str) -> Result<(), EngineError> {
        self.call(engine_id, MockOp::Stop).await?;
        self.set_state(engine_id, ContainerState::Exited);
        Ok(())
    }

    async fn restart(&self, engine_id: &str) -> Result<(), EngineError> {
        self.call(engine_id, MockOp::Restart).await?;
        self.set_state(engine_id, ContainerState::Running);
        Ok(())
    }

    async fn logs(&self, engine_id: &str, tail: usize) -> Result<String, EngineError> {
        self.call(engine_id, MockOp::Logs).await?;
        Ok(format!("{} log lines from {}\n", tail, engine_id))
    }
}
