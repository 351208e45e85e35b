//! Dispatcher implementation

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex, Notify, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::cache::StatusStore;
use crate::config::{BusyPolicy, Config, ConfigStore};
use crate::engine::{EngineClient, EngineError};
use crate::error::OpError;
use crate::pool::{ConnectionPool, PooledHandle};
use crate::retry::Backoff;

use super::cooldown::{CooldownMap, deadline_after};
use super::request::{Action, OperationRequest, OperationResult, Origin, Outcome, RequestState};

/// A request waiting for a worker
struct Pending {
    request: OperationRequest,
    enqueued_at: Instant,
    reply: oneshot::Sender<OperationResult>,
}

/// A request a worker is executing
struct RunningEntry {
    container: String,
    action: Action,
    origin: Origin,
    started_at: Instant,
}

/// Dispatcher counters
#[derive(Debug, Default, Clone, Serialize)]
pub struct DispatcherStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub rejected: u64,
    pub retries: u64,
    pub peak_concurrent: usize,
    pub peak_queue_depth: usize,
}

/// Queue summary
#[derive(Debug, Clone, Serialize)]
pub struct QueueState {
    pub running: usize,
    pub queued: usize,
    pub cooldowns: usize,
    pub stats: DispatcherStats,
}

/// One queued or running request
#[derive(Debug, Clone, Serialize)]
pub struct QueueEntry {
    pub request_id: String,
    pub container: String,
    pub action: Action,
    pub origin: Origin,
    pub state: RequestState,
    pub waited: Duration,
}

/// Internal state protected by mutex
struct DispatcherInner {
    /// FIFO of waiting requests
    queue: VecDeque<Pending>,

    /// Requests currently executing, by request id
    running: HashMap<String, RunningEntry>,

    /// Per-container tokens for mutating actions
    cooldowns: CooldownMap,

    stats: DispatcherStats,

    shutting_down: bool,
}

struct Shared {
    config: ConfigStore,
    pool: Arc<ConnectionPool>,
    statuses: Arc<StatusStore>,
    inner: Mutex<DispatcherInner>,
    notify: Notify,
}

/// What a worker should do next
enum Next {
    Run(Pending),
    Wait(Option<Instant>),
    Exit,
}

/// How an execution ended
enum Execution {
    Finished(Result<Outcome, OpError>),
    /// Deadline passed; `detached` is true when an engine call is still in flight
    TimedOut { detached: bool },
}

/// Bounded-concurrency operation dispatcher
///
/// A fixed set of workers drains one FIFO queue. A worker always takes the
/// earliest queued request that may run: status requests always can, mutating
/// requests only when their container's token is free and out of cooldown.
/// That keeps mutating requests for one container in submission order without
/// parking a worker on a busy container.
pub struct Dispatcher {
    shared: Arc<Shared>,
    workers: StdMutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Create the dispatcher and spawn its workers
    ///
    /// The worker count comes from `max-concurrency` at startup. A reload can
    /// lower the effective limit; raising it past the startup value needs a
    /// restart.
    pub fn start(config: ConfigStore, pool: Arc<ConnectionPool>, statuses: Arc<StatusStore>) -> Arc<Self> {
        let worker_count = config.snapshot().dispatcher.max_concurrency.max(1);
        debug!(worker_count, "Dispatcher::start: called");

        let shared = Arc::new(Shared {
            config,
            pool,
            statuses,
            inner: Mutex::new(DispatcherInner {
                queue: VecDeque::new(),
                running: HashMap::new(),
                cooldowns: CooldownMap::new(),
                stats: DispatcherStats::default(),
                shutting_down: false,
            }),
            notify: Notify::new(),
        });

        let workers = (0..worker_count)
            .map(|worker| tokio::spawn(worker_loop(shared.clone(), worker)))
            .collect();

        info!(worker_count, "Dispatcher started");
        Arc::new(Self {
            shared,
            workers: StdMutex::new(workers),
        })
    }

    /// Submit and wait; every failure becomes `Err`
    pub async fn submit(&self, request: OperationRequest) -> Result<OperationResult, OpError> {
        self.execute(request).await.into_result()
    }

    /// Submit and wait; failures are folded into the result
    pub async fn execute(&self, request: OperationRequest) -> OperationResult {
        debug!(request_id = %request.id, container = %request.container, action = %request.action, "Dispatcher::execute: called");
        let started = Instant::now();
        let mut rx = match self.enqueue(request.clone()).await {
            Ok(rx) => rx,
            Err(err) => {
                debug!(request_id = %request.id, error = %err, "Dispatcher::execute: rejected at admission");
                return OperationResult::failed(&request, err, started.elapsed(), 0);
            }
        };

        // Workers only sweep the queue when idle, so the submitter enforces
        // its own queue timeout as well
        let queue_timeout = self.shared.config.snapshot().dispatcher.queue_timeout();
        tokio::select! {
            result = &mut rx => {
                return result.unwrap_or_else(|_| {
                    OperationResult::failed(&request, OpError::ShuttingDown, started.elapsed(), 0)
                });
            }
            _ = tokio::time::sleep(queue_timeout) => {}
        }

        let expired = {
            let mut inner = self.shared.inner.lock().await;
            let pending = inner
                .queue
                .iter()
                .position(|p| p.request.id == request.id)
                .and_then(|idx| inner.queue.remove(idx));
            if pending.is_some() {
                inner.stats.timed_out += 1;
            }
            pending
        };
        if expired.is_some() {
            warn!(request_id = %request.id, container = %request.container, "Request expired in queue");
            return OperationResult::failed(&request, OpError::Timeout(queue_timeout), started.elapsed(), 0);
        }

        // Already promoted to a worker
        rx.await
            .unwrap_or_else(|_| OperationResult::failed(&request, OpError::ShuttingDown, started.elapsed(), 0))
    }

    /// Admit a request to the queue without waiting for its result
    ///
    /// Admission never touches the engine pool.
    pub async fn enqueue(&self, request: OperationRequest) -> Result<oneshot::Receiver<OperationResult>, OpError> {
        debug!(request_id = %request.id, origin = ?request.origin, "Dispatcher::enqueue: called");
        let config = self.shared.config.snapshot();

        if config.container(&request.container).is_none() {
            debug!(container = %request.container, "Dispatcher::enqueue: unknown container");
            return Err(OpError::ContainerNotFound(request.container));
        }

        let mut inner = self.shared.inner.lock().await;
        if inner.shutting_down {
            return Err(OpError::ShuttingDown);
        }

        if request.action.is_mutating() && config.dispatcher.busy_policy == BusyPolicy::Reject {
            let queued_same = inner
                .queue
                .iter()
                .any(|p| p.request.container == request.container && p.request.action.is_mutating());
            if queued_same || !inner.cooldowns.is_available(&request.container, Instant::now()) {
                debug!(container = %request.container, "Dispatcher::enqueue: container busy, rejecting");
                inner.stats.rejected += 1;
                return Err(OpError::ContainerBusy(request.container));
            }
        }

        // Scheduler-issued requests may use the reserved headroom
        let limit = match request.origin {
            Origin::User => config.dispatcher.queue_capacity,
            Origin::Scheduler => config.dispatcher.queue_capacity + config.dispatcher.scheduler_reserve,
        };
        if inner.queue.len() >= limit {
            debug!(queued = inner.queue.len(), limit, "Dispatcher::enqueue: queue full");
            inner.stats.rejected += 1;
            return Err(OpError::Saturated { capacity: limit });
        }

        let (tx, rx) = oneshot::channel();
        inner.queue.push_back(Pending {
            request,
            enqueued_at: Instant::now(),
            reply: tx,
        });
        inner.stats.submitted += 1;
        inner.stats.peak_queue_depth = inner.stats.peak_queue_depth.max(inner.queue.len());
        drop(inner);

        self.shared.notify.notify_waiters();
        Ok(rx)
    }

    /// Remove a queued request; running requests cannot be cancelled
    pub async fn cancel(&self, request_id: &str) -> bool {
        debug!(%request_id, "Dispatcher::cancel: called");
        let mut inner = self.shared.inner.lock().await;

        if inner.running.contains_key(request_id) {
            debug!(%request_id, "Dispatcher::cancel: is running, cannot cancel");
            return false;
        }

        let Some(idx) = inner.queue.iter().position(|p| p.request.id == request_id) else {
            debug!(%request_id, "Dispatcher::cancel: not found in queue");
            return false;
        };
        let Some(pending) = inner.queue.remove(idx) else {
            return false;
        };
        inner.stats.cancelled += 1;
        drop(inner);

        let result = OperationResult::failed(
            &pending.request,
            OpError::Cancelled(pending.request.id.clone()),
            pending.enqueued_at.elapsed(),
            0,
        );
        let _ = pending.reply.send(result);
        debug!(%request_id, "Dispatcher::cancel: removed from queue");
        true
    }

    pub async fn queue_state(&self) -> QueueState {
        let inner = self.shared.inner.lock().await;
        QueueState {
            running: inner.running.len(),
            queued: inner.queue.len(),
            cooldowns: inner.cooldowns.len(),
            stats: inner.stats.clone(),
        }
    }

    /// Running requests first, then the queue in FIFO order
    pub async fn queue_details(&self) -> Vec<QueueEntry> {
        let inner = self.shared.inner.lock().await;
        let now = Instant::now();

        let mut running: Vec<_> = inner
            .running
            .iter()
            .map(|(id, r)| QueueEntry {
                request_id: id.clone(),
                container: r.container.clone(),
                action: r.action,
                origin: r.origin,
                state: RequestState::Running,
                waited: now - r.started_at,
            })
            .collect();
        running.sort_by(|a, b| b.waited.cmp(&a.waited));

        running
            .into_iter()
            .chain(inner.queue.iter().map(|p| QueueEntry {
                request_id: p.request.id.clone(),
                container: p.request.container.clone(),
                action: p.request.action,
                origin: p.request.origin,
                state: RequestState::Queued,
                waited: now - p.enqueued_at,
            }))
            .collect()
    }

    pub async fn stats(&self) -> DispatcherStats {
        self.shared.inner.lock().await.stats.clone()
    }

    /// Stop workers and cancel everything still queued
    ///
    /// Running requests finish first.
    pub async fn shutdown(&self) {
        debug!("Dispatcher::shutdown: called");
        let pending: Vec<Pending> = {
            let mut inner = self.shared.inner.lock().await;
            inner.shutting_down = true;
            inner.stats.cancelled += inner.queue.len() as u64;
            inner.queue.drain(..).collect()
        };

        for p in pending {
            let result = OperationResult::failed(&p.request, OpError::ShuttingDown, p.enqueued_at.elapsed(), 0);
            let _ = p.reply.send(result);
        }
        self.shared.notify.notify_waiters();

        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()));
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Dispatcher worker ended abnormally");
            }
        }
        info!("Dispatcher stopped");
    }
}

async fn worker_loop(shared: Arc<Shared>, worker: usize) {
    debug!(worker, "worker_loop: started");
    loop {
        // Registered before the state check so no wakeup is lost
        let notified = shared.notify.notified();

        let next = {
            let config = shared.config.snapshot();
            let mut inner = shared.inner.lock().await;
            take_next(&mut inner, &config, Instant::now())
        };

        match next {
            Next::Exit => break,
            Next::Run(pending) => shared.run(pending).await,
            Next::Wait(Some(at)) => {
                let _ = tokio::time::timeout_at(at, notified).await;
            }
            Next::Wait(None) => notified.await,
        }
    }
    debug!(worker, "worker_loop: exiting");
}

/// Pick the next runnable request, if any
fn take_next(inner: &mut DispatcherInner, config: &Config, now: Instant) -> Next {
    if inner.shutting_down {
        return Next::Exit;
    }

    let queue_timeout = config.dispatcher.queue_timeout();
    expire_queued(inner, queue_timeout, now);

    if inner.running.len() >= config.dispatcher.max_concurrency {
        return Next::Wait(None);
    }

    let position = inner
        .queue
        .iter()
        .position(|p| !p.request.action.is_mutating() || inner.cooldowns.is_available(&p.request.container, now));

    let Some(pending) = position.and_then(|idx| inner.queue.remove(idx)) else {
        let cooldown_wake = inner.cooldowns.next_expiry(now);
        let queue_wake = inner.queue.iter().map(|p| deadline_after(p.enqueued_at, queue_timeout)).min();
        let wake = match (cooldown_wake, queue_wake) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        return Next::Wait(wake);
    };

    let request = &pending.request;
    if request.action.is_mutating() {
        inner.cooldowns.try_acquire(&request.container, &request.id, now);
    }
    inner.running.insert(
        request.id.clone(),
        RunningEntry {
            container: request.container.clone(),
            action: request.action,
            origin: request.origin,
            started_at: now,
        },
    );
    inner.stats.peak_concurrent = inner.stats.peak_concurrent.max(inner.running.len());
    debug!(request_id = %request.id, running = inner.running.len(), "take_next: promoted from queue");
    Next::Run(pending)
}

/// Answer requests that waited longer than the queue timeout
fn expire_queued(inner: &mut DispatcherInner, queue_timeout: Duration, now: Instant) {
    if !inner.queue.iter().any(|p| deadline_after(p.enqueued_at, queue_timeout) <= now) {
        return;
    }

    let (expired, kept): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut inner.queue)
        .into_iter()
        .partition(|p| deadline_after(p.enqueued_at, queue_timeout) <= now);
    inner.queue = kept;

    for p in expired {
        warn!(request_id = %p.request.id, container = %p.request.container, "Request expired in queue");
        inner.stats.timed_out += 1;
        let result = OperationResult::failed(&p.request, OpError::Timeout(queue_timeout), now - p.enqueued_at, 0);
        let _ = p.reply.send(result);
    }
}

/// Run the engine side of an action on one handle
async fn perform(client: &dyn EngineClient, engine_id: &str, action: Action, tail: usize) -> Result<Outcome, EngineError> {
    match action {
        Action::Status => {}
        Action::Start => client.start(engine_id).await?,
        Action::Stop => client.stop(engine_id).await?,
        Action::Restart => client.restart(engine_id).await?,
        Action::Logs => return Ok(Outcome::Logs(client.logs(engine_id, tail).await?)),
    }
    let status = client.inspect(engine_id).await?;
    Ok(Outcome::Status {
        status,
        captured_at: Utc::now(),
    })
}

type EngineCall = JoinHandle<(PooledHandle, Result<Outcome, EngineError>)>;

impl Shared {
    /// Execute one request to a terminal state and reply to its submitter
    async fn run(self: &Arc<Self>, pending: Pending) {
        let Pending { request, reply, .. } = pending;
        let config = self.config.snapshot();
        let started = Instant::now();
        debug!(request_id = %request.id, container = %request.container, action = %request.action, "Shared::run: called");

        let (execution, attempts) = self.execute_with_retry(&request, &config, deadline_after(started, request.timeout)).await;
        let duration = started.elapsed();

        let mut detached = false;
        let result = match execution {
            Execution::Finished(Ok(outcome)) => OperationResult::completed(&request, outcome, duration, attempts),
            Execution::Finished(Err(err)) => OperationResult::failed(&request, err, duration, attempts),
            Execution::TimedOut { detached: in_flight } => {
                detached = in_flight;
                OperationResult::failed(&request, OpError::Timeout(request.timeout), duration, attempts)
            }
        };

        match result.state {
            RequestState::Completed => {
                info!(request_id = %request.id, container = %request.container, action = %request.action, ?duration, "Operation completed")
            }
            _ => {
                warn!(request_id = %request.id, container = %request.container, action = %request.action, state = %result.state, message = %result.message, "Operation did not complete")
            }
        }

        self.update_cache(&request, &result, &config);
        self.finish(&request, result.state, detached, &config).await;

        if reply.send(result).is_err() {
            debug!(request_id = %request.id, "Shared::run: submitter went away");
        }
    }

    async fn execute_with_retry(
        self: &Arc<Self>,
        request: &OperationRequest,
        config: &Config,
        deadline: Instant,
    ) -> (Execution, u32) {
        let Some(container) = config.container(&request.container) else {
            return (
                Execution::Finished(Err(OpError::ContainerNotFound(request.container.clone()))),
                0,
            );
        };
        let engine_id = container.engine_id().to_string();
        let backoff = Backoff::new(config.dispatcher.retry_backoff());

        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.attempt(request, &engine_id, config, deadline).await {
                Execution::Finished(Err(err)) if err.is_retryable() && attempts <= config.dispatcher.max_retries => {
                    let delay = backoff.delay(attempts - 1);
                    if deadline_after(Instant::now(), delay) >= deadline {
                        debug!(request_id = %request.id, "execute_with_retry: no time left for another attempt");
                        return (Execution::Finished(Err(err)), attempts);
                    }
                    warn!(request_id = %request.id, error = %err, attempts, ?delay, "Transient failure, retrying");
                    self.inner.lock().await.stats.retries += 1;
                    tokio::time::sleep(delay).await;
                }
                other => return (other, attempts),
            }
        }
    }

    async fn attempt(
        self: &Arc<Self>,
        request: &OperationRequest,
        engine_id: &str,
        config: &Config,
        deadline: Instant,
    ) -> Execution {
        let now = Instant::now();
        if now >= deadline {
            return Execution::TimedOut { detached: false };
        }

        let acquire_timeout = config.engine.acquire_timeout().min(deadline - now);
        let handle = match self.pool.acquire(acquire_timeout).await {
            Ok(handle) => handle,
            Err(OpError::PoolExhausted(_)) if Instant::now() >= deadline => {
                return Execution::TimedOut { detached: false };
            }
            Err(err) => return Execution::Finished(Err(err)),
        };

        // The engine client is not preemptible, so the call runs on its own task
        let action = request.action;
        let tail = request.log_tail.unwrap_or(config.dispatcher.logs_tail);
        let id = engine_id.to_string();
        let mut call: EngineCall = tokio::spawn(async move {
            let result = perform(&*handle, &id, action, tail).await;
            (handle, result)
        });

        match tokio::time::timeout_at(deadline, &mut call).await {
            Ok(Ok((handle, Ok(outcome)))) => {
                self.pool.release(handle);
                Execution::Finished(Ok(outcome))
            }
            Ok(Ok((handle, Err(err)))) => {
                if err.is_transient() {
                    self.pool.discard(handle);
                } else {
                    self.pool.release(handle);
                }
                Execution::Finished(Err(err.into()))
            }
            Ok(Err(join_err)) => {
                error!(request_id = %request.id, error = %join_err, "Engine call task failed");
                Execution::Finished(Err(OpError::Engine(format!("engine call aborted: {}", join_err))))
            }
            Err(_) => {
                warn!(request_id = %request.id, container = %request.container, "Engine call exceeded timeout, detaching");
                self.drain_detached(request, call);
                Execution::TimedOut { detached: true }
            }
        }
    }

    /// Wait out a timed-out engine call in the background
    ///
    /// Its result is ignored. The handle goes back to the pool and, for
    /// mutating actions, the container token is released only now.
    fn drain_detached(self: &Arc<Self>, request: &OperationRequest, call: EngineCall) {
        let shared = self.clone();
        let container = request.container.clone();
        let request_id = request.id.clone();
        let mutating = request.action.is_mutating();

        tokio::spawn(async move {
            match call.await {
                Ok((handle, Ok(_))) => {
                    debug!(%request_id, "drain_detached: late result ignored");
                    shared.pool.release(handle);
                }
                Ok((handle, Err(err))) => {
                    debug!(%request_id, error = %err, "drain_detached: late failure ignored");
                    if err.is_transient() {
                        shared.pool.discard(handle);
                    } else {
                        shared.pool.release(handle);
                    }
                }
                Err(join_err) => {
                    warn!(%request_id, error = %join_err, "drain_detached: engine call task failed");
                }
            }

            if mutating {
                let cooldown = shared.config.snapshot().dispatcher.cooldown();
                let mut inner = shared.inner.lock().await;
                inner.cooldowns.release(&container, &request_id, cooldown, Instant::now());
            }
            shared.notify.notify_waiters();
        });
    }

    fn update_cache(&self, request: &OperationRequest, result: &OperationResult, config: &Config) {
        if !request.action.refreshes_cache() {
            return;
        }
        match (result.state, &result.status) {
            (RequestState::Completed, Some(status)) => {
                let captured_at = result.captured_at.unwrap_or_else(Utc::now);
                self.statuses
                    .record_success(&request.container, status.clone(), captured_at, config.cache.ttl());
            }
            (RequestState::Failed | RequestState::TimedOut, _) => {
                self.statuses.mark_stale(&request.container);
            }
            _ => {}
        }
    }

    /// Leave the running set, release the token and wake workers
    async fn finish(&self, request: &OperationRequest, state: RequestState, detached: bool, config: &Config) {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        inner.running.remove(&request.id);

        if request.action.is_mutating() && !detached {
            inner
                .cooldowns
                .release(&request.container, &request.id, config.dispatcher.cooldown(), now);
        }
        inner.cooldowns.evict_idle(now);

        match state {
            RequestState::Completed => inner.stats.completed += 1,
            RequestState::TimedOut => inner.stats.timed_out += 1,
            RequestState::Cancelled => inner.stats.cancelled += 1,
            _ => inner.stats.failed += 1,
        }
        drop(inner);

        self.notify.notify_waiters();
    }
}
