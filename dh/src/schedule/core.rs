//! Task scheduler loop

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::config::{Config, ConfigStore};
use crate::dispatcher::{Dispatcher, OperationRequest, OperationResult, Origin};

use super::cycle::Cycle;
use super::notifier::Notifier;
use super::store::TaskStore;
use super::task::{LastRun, ScheduledTask};

/// Counts from one scheduler pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub due: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub deactivated: usize,
    pub store_errors: usize,
}

/// Runs due scheduled tasks through the dispatcher
pub struct TaskScheduler {
    store: Arc<TaskStore>,
    dispatcher: Arc<Dispatcher>,
    config: ConfigStore,
    notifier: Arc<dyn Notifier>,
}

impl TaskScheduler {
    pub fn new(store: Arc<TaskStore>, dispatcher: Arc<Dispatcher>, config: ConfigStore, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            store,
            dispatcher,
            config,
            notifier,
        }
    }

    /// Dispatch every task due at `now` and record the outcomes
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let config = self.config.snapshot();
        let due = self.store.due_tasks(now).await;
        let mut report = TickReport {
            due: due.len(),
            ..Default::default()
        };
        if due.is_empty() {
            return report;
        }
        debug!(count = due.len(), %now, "TaskScheduler::tick: dispatching due tasks");

        let results = futures::future::join_all(due.iter().map(|task| self.dispatch(task, &config))).await;

        let limit = config.scheduler.once_retry_limit;
        for (task, result) in due.iter().zip(results) {
            if result.success {
                report.succeeded += 1;
            } else {
                report.failed += 1;
            }

            match self
                .store
                .modify(&task.id, now, |t| apply_outcome(t, &result, now, limit))
                .await
            {
                Ok(updated) => {
                    if !updated.is_active {
                        report.deactivated += 1;
                    }
                    self.notifier.scheduled_run(&updated, &result).await;
                }
                Err(e) => {
                    error!(task_id = %task.id, error = %e, "Failed to record scheduled run");
                    report.store_errors += 1;
                }
            }
        }
        report
    }

    async fn dispatch(&self, task: &ScheduledTask, config: &Config) -> OperationResult {
        debug!(task_id = %task.id, container = %task.container, action = %task.action, "TaskScheduler::dispatch: called");
        let request = OperationRequest::new(task.container.clone(), task.action, config.dispatcher.default_timeout())
            .with_origin(Origin::Scheduler);
        self.dispatcher.execute(request).await
    }

    /// Poll loop; the interval is re-read from config before every wait
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Task scheduler started");
        loop {
            let report = self.tick(Utc::now()).await;
            if report.due > 0 {
                info!(
                    due = report.due,
                    succeeded = report.succeeded,
                    failed = report.failed,
                    deactivated = report.deactivated,
                    "Scheduler pass complete"
                );
            }

            let interval = self.config.snapshot().scheduler.poll_interval();
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() || shutdown.has_changed().is_err() {
                break;
            }
        }
        info!("Task scheduler stopped");
    }
}

/// Record a run on its task and compute what happens next
///
/// Recurring tasks always advance from `now`. A one-shot task stays due after
/// a capacity or connectivity failure until it has failed `once_retry_limit`
/// times; any other outcome deactivates it.
pub fn apply_outcome(task: &mut ScheduledTask, result: &OperationResult, now: DateTime<Utc>, once_retry_limit: u32) {
    task.last_run = Some(LastRun::from_result(result, now));

    // Disabled while the run was in flight
    if !task.is_active {
        debug!(task_id = %task.id, "apply_outcome: task disabled, not rescheduling");
        task.attempts = 0;
        task.next_run_at = None;
        return;
    }

    if let Cycle::Once { .. } = task.cycle {
        let transient = result.error.as_ref().is_some_and(|e| e.is_transient());
        if transient && task.attempts + 1 < once_retry_limit {
            task.attempts += 1;
            debug!(task_id = %task.id, attempts = task.attempts, "apply_outcome: one-shot task stays due");
            return;
        }
        task.attempts = if transient { task.attempts + 1 } else { 0 };
        task.is_active = false;
        task.next_run_at = None;
        return;
    }

    task.attempts = 0;
    task.next_run_at = task.cycle.next_after(now, task.timezone);
    if task.next_run_at.is_none() {
        info!(task_id = %task.id, "Schedule has no further runs, deactivating");
        task.is_active = false;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{NaiveTime, TimeDelta};
    use chrono_tz::Tz;

    use super::*;
    use crate::cache::StatusStore;
    use crate::config::ContainerRef;
    use crate::dispatcher::Action;
    use crate::engine::ContainerState;
    use crate::engine::testing::{MockEngine, MockOp};
    use crate::error::{ErrorKind, OpError};
    use crate::pool::{ConnectionPool, PoolConfig};
    use crate::schedule::task::NewTask;

    #[derive(Default)]
    struct RecordingNotifier {
        runs: Mutex<Vec<(String, bool)>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn scheduled_run(&self, task: &ScheduledTask, result: &OperationResult) {
            self.runs.lock().unwrap().push((task.id.clone(), result.success));
        }
    }

    struct Harness {
        engine: MockEngine,
        store: Arc<TaskStore>,
        notifier: Arc<RecordingNotifier>,
        scheduler: TaskScheduler,
        config: Arc<Config>,
    }

    fn harness() -> Harness {
        let engine = MockEngine::new().with_container("web", ContainerState::Running);
        let mut config = Config::default();
        config.containers = vec![ContainerRef::new("web"), ContainerRef::new("ghost")];
        config.dispatcher.cooldown_seconds = 0;
        config.dispatcher.max_retries = 0;
        let config_store = ConfigStore::new(config);

        let pool = Arc::new(ConnectionPool::new(Arc::new(engine.clone()), PoolConfig::default()));
        let dispatcher = Dispatcher::start(config_store.clone(), pool, Arc::new(StatusStore::new()));
        let store = Arc::new(TaskStore::in_memory());
        let notifier = Arc::new(RecordingNotifier::default());
        let scheduler = TaskScheduler::new(store.clone(), dispatcher, config_store.clone(), notifier.clone());

        Harness {
            engine,
            store,
            notifier,
            scheduler,
            config: config_store.snapshot(),
        }
    }

    fn new_task(container: &str, cycle: Cycle) -> NewTask {
        NewTask {
            container: container.to_string(),
            action: Action::Restart,
            cycle,
            timezone: Tz::UTC,
        }
    }

    fn result_with(error: Option<OpError>) -> OperationResult {
        let request = OperationRequest::new("web", Action::Restart, Duration::from_secs(1));
        match error {
            Some(err) => OperationResult::failed(&request, err, Duration::ZERO, 1),
            None => OperationResult::completed(
                &request,
                crate::dispatcher::Outcome::Status {
                    status: crate::engine::ContainerStatus::new(ContainerState::Running),
                    captured_at: Utc::now(),
                },
                Duration::ZERO,
                1,
            ),
        }
    }

    #[tokio::test]
    async fn test_due_daily_task_runs_and_advances() {
        let h = harness();
        let now = Utc::now();
        let daily = Cycle::Daily {
            time: NaiveTime::from_hms_opt(3, 0, 0).unwrap(),
        };
        let task = h.store.create_task(new_task("web", daily), &h.config, now).await.unwrap();
        let due_at = task.next_run_at.unwrap();

        // Not yet due
        assert_eq!(h.scheduler.tick(due_at - TimeDelta::seconds(1)).await.due, 0);

        let report = h.scheduler.tick(due_at).await;
        assert_eq!(report.due, 1);
        assert_eq!(report.succeeded, 1);
        assert_eq!(h.engine.calls_for("web", MockOp::Restart), 1);

        let task = h.store.get_task(&task.id).await.unwrap();
        assert_eq!(task.next_run_at, Some(due_at + TimeDelta::days(1)));
        assert!(task.last_run.unwrap().success);
        assert_eq!(h.notifier.runs.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_once_runs_exactly_once() {
        let h = harness();
        let now = Utc::now();
        let once = Cycle::Once {
            at: (now + TimeDelta::minutes(5)).naive_utc(),
        };
        let task = h.store.create_task(new_task("web", once), &h.config, now).await.unwrap();
        let due_at = task.next_run_at.unwrap();

        h.scheduler.tick(due_at).await;
        h.scheduler.tick(due_at + TimeDelta::minutes(1)).await;
        h.scheduler.tick(due_at + TimeDelta::hours(1)).await;

        assert_eq!(h.engine.calls_for("web", MockOp::Restart), 1);
        let task = h.store.get_task(&task.id).await.unwrap();
        assert!(!task.is_active);
        assert!(task.next_run_at.is_none());
    }

    #[tokio::test]
    async fn test_failed_recurring_task_still_advances() {
        let h = harness();
        let now = Utc::now();
        let hourly = Cycle::Cron {
            expression: "0 * * * *".parse().unwrap(),
        };
        // Configured but unknown to the engine
        let task = h.store.create_task(new_task("ghost", hourly), &h.config, now).await.unwrap();
        let due_at = task.next_run_at.unwrap();

        let report = h.scheduler.tick(due_at).await;
        assert_eq!(report.failed, 1);

        let task = h.store.get_task(&task.id).await.unwrap();
        assert!(task.is_active);
        assert_eq!(task.next_run_at, Some(due_at + TimeDelta::hours(1)));
        let last = task.last_run.unwrap();
        assert!(!last.success);
        assert_eq!(last.error_kind, Some(ErrorKind::ContainerNotFound));
        assert!(!h.notifier.runs.lock().unwrap()[0].1);
    }

    #[test]
    fn test_once_transient_failure_retried_up_to_limit() {
        let now = Utc::now();
        let mut task = ScheduledTask {
            id: "t1".to_string(),
            container: "web".to_string(),
            action: Action::Restart,
            cycle: Cycle::Once { at: now.naive_utc() },
            timezone: Tz::UTC,
            next_run_at: Some(now),
            last_run: None,
            is_active: true,
            attempts: 0,
            created_at: now,
            updated_at: now,
        };
        let busy = result_with(Some(OpError::Saturated { capacity: 32 }));

        apply_outcome(&mut task, &busy, now, 3);
        assert!(task.is_active);
        assert_eq!(task.next_run_at, Some(now));
        apply_outcome(&mut task, &busy, now, 3);
        assert!(task.is_active);
        apply_outcome(&mut task, &busy, now, 3);
        assert!(!task.is_active);
        assert_eq!(task.attempts, 3);
    }

    #[test]
    fn test_once_permanent_failure_deactivates() {
        let now = Utc::now();
        let mut task = ScheduledTask {
            id: "t1".to_string(),
            container: "web".to_string(),
            action: Action::Start,
            cycle: Cycle::Once { at: now.naive_utc() },
            timezone: Tz::UTC,
            next_run_at: Some(now),
            last_run: None,
            is_active: true,
            attempts: 0,
            created_at: now,
            updated_at: now,
        };

        apply_outcome(&mut task, &result_with(Some(OpError::Timeout(Duration::from_secs(1)))), now, 3);

        assert!(!task.is_active);
        assert_eq!(task.last_run.as_ref().unwrap().error_kind, Some(ErrorKind::Timeout));
    }

    #[test]
    fn test_recurring_success_resets_attempts() {
        let now = Utc::now();
        let mut task = ScheduledTask {
            id: "t1".to_string(),
            container: "web".to_string(),
            action: Action::Status,
            cycle: Cycle::Daily {
                time: NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
            },
            timezone: Tz::UTC,
            next_run_at: Some(now),
            last_run: None,
            is_active: true,
            attempts: 2,
            created_at: now,
            updated_at: now,
        };

        apply_outcome(&mut task, &result_with(None), now, 3);

        assert_eq!(task.attempts, 0);
        assert!(task.next_run_at.unwrap() > now);
    }

    #[tokio::test]
    async fn test_task_disabled_during_run_is_not_rescheduled() {
        let h = harness();
        let now = Utc::now();
        let daily = Cycle::Daily {
            time: NaiveTime::from_hms_opt(3, 0, 0).unwrap(),
        };
        let task = h.store.create_task(new_task("web", daily), &h.config, now).await.unwrap();
        let due_at = task.next_run_at.unwrap();
        h.engine.hang("web");

        let disable = async {
            while h.engine.in_flight() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            h.store.set_task_active(&task.id, false, due_at).await.unwrap();
            h.engine.release("web");
        };
        let (report, _) = tokio::join!(h.scheduler.tick(due_at), disable);

        assert_eq!(report.due, 1);
        let after = h.store.get_task(&task.id).await.unwrap();
        assert!(!after.is_active);
        assert_eq!(after.next_run_at, None);
        assert!(after.last_run.is_some());
        assert!(h.store.due_tasks(due_at + TimeDelta::days(2)).await.is_empty());
    }

    #[test]
    fn test_disabled_mid_run_stays_unscheduled() {
        let now = Utc::now();
        let mut task = ScheduledTask {
            id: "t1".to_string(),
            container: "web".to_string(),
            action: Action::Restart,
            cycle: Cycle::Daily {
                time: NaiveTime::from_hms_opt(3, 0, 0).unwrap(),
            },
            timezone: Tz::UTC,
            next_run_at: None,
            last_run: None,
            is_active: false,
            attempts: 1,
            created_at: now,
            updated_at: now,
        };

        apply_outcome(&mut task, &result_with(None), now, 3);

        assert!(!task.is_active);
        assert_eq!(task.next_run_at, None);
        assert!(task.last_run.as_ref().unwrap().success);

        // A one-shot task with a transient failure is not left due either
        task.cycle = Cycle::Once { at: now.naive_utc() };
        apply_outcome(&mut task, &result_with(Some(OpError::Saturated { capacity: 32 })), now, 3);
        assert_eq!(task.next_run_at, None);
        assert_eq!(task.attempts, 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let h = harness();
        let scheduler = Arc::new(h.scheduler);
        let (tx, rx) = watch::channel(false);

        let handle = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.run(rx).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
