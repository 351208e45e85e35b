//! JSON-file persistence for scheduled tasks

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::Config;

use super::cycle::Cycle;
use super::error::{ScheduleError, StoreError};
use super::task::{NewTask, ScheduledTask, TaskFilter, TaskUpdate, check_schedulable};

/// On-disk document
#[derive(Debug, Default, Serialize, Deserialize)]
struct TasksFile {
    tasks: Vec<ScheduledTask>,
}

/// Task store backed by a JSON file, or by memory only
///
/// All tasks are held in memory; every mutation rewrites the file through a
/// temporary file and a rename, under the store lock.
pub struct TaskStore {
    path: Option<PathBuf>,
    tasks: Mutex<Vec<ScheduledTask>>,
}

impl TaskStore {
    /// Open the store at `path`, starting empty if the file does not exist
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        debug!(?path, "TaskStore::open: called");

        let tasks = if fs::try_exists(&path).await? {
            let content = fs::read_to_string(&path).await?;
            if content.trim().is_empty() {
                Vec::new()
            } else {
                serde_json::from_str::<TasksFile>(&content)?.tasks
            }
        } else {
            debug!(?path, "TaskStore::open: no tasks file yet");
            Vec::new()
        };

        info!(path = %path.display(), count = tasks.len(), "Loaded scheduled tasks");
        Ok(Self {
            path: Some(path),
            tasks: Mutex::new(tasks),
        })
    }

    /// Store that never touches disk
    pub fn in_memory() -> Self {
        Self {
            path: None,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    async fn persist(&self, tasks: &[ScheduledTask]) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        debug!(?path, count = tasks.len(), "TaskStore::persist: called");

        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).await?;
        }

        let content = serde_json::to_string_pretty(&TasksFile { tasks: tasks.to_vec() })?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Index of the task whose id equals or uniquely starts with `id`
    fn find(tasks: &[ScheduledTask], id: &str) -> Result<usize, StoreError> {
        if let Some(idx) = tasks.iter().position(|t| t.id == id) {
            return Ok(idx);
        }
        let mut matches = tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| !id.is_empty() && t.id.starts_with(id));
        match (matches.next(), matches.next()) {
            (Some((idx, _)), None) => Ok(idx),
            (Some(_), Some(_)) => Err(StoreError::AmbiguousId(id.to_string())),
            _ => Err(StoreError::NotFound(id.to_string())),
        }
    }

    /// Checks shared by create and update; returns the first run time
    fn validate(task: &ScheduledTask, config: &Config, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, StoreError> {
        if config.container(&task.container).is_none() {
            return Err(StoreError::UnknownContainer(task.container.clone()));
        }
        check_schedulable(task.action)?;
        task.cycle.validate()?;

        if !task.is_active {
            return Ok(None);
        }
        match task.cycle.next_after(now, task.timezone) {
            Some(next) => Ok(Some(next)),
            None => match &task.cycle {
                Cycle::Once { at } => Err(ScheduleError::InPast(at.format("%Y-%m-%d %H:%M").to_string()).into()),
                other => Err(ScheduleError::NeverFires(other.to_string()).into()),
            },
        }
    }

    pub async fn create_task(&self, new: NewTask, config: &Config, now: DateTime<Utc>) -> Result<ScheduledTask, StoreError> {
        debug!(container = %new.container, action = %new.action, cycle = %new.cycle, "TaskStore::create_task: called");
        let mut task = ScheduledTask {
            id: uuid::Uuid::now_v7().to_string(),
            container: new.container,
            action: new.action,
            cycle: new.cycle,
            timezone: new.timezone,
            next_run_at: None,
            last_run: None,
            is_active: true,
            attempts: 0,
            created_at: now,
            updated_at: now,
        };
        task.next_run_at = Self::validate(&task, config, now)?;

        let mut tasks = self.tasks.lock().await;
        let mut next = tasks.clone();
        next.push(task.clone());
        self.persist(&next).await?;
        *tasks = next;

        info!(task_id = %task.id, container = %task.container, next_run_at = ?task.next_run_at, "Created scheduled task");
        Ok(task)
    }

    pub async fn get_task(&self, id: &str) -> Result<ScheduledTask, StoreError> {
        debug!(%id, "TaskStore::get_task: called");
        let tasks = self.tasks.lock().await;
        let idx = Self::find(&tasks, id)?;
        Ok(tasks[idx].clone())
    }

    /// Matching tasks ordered by next run, inactive tasks last
    pub async fn list_tasks(&self, filter: TaskFilter, now: DateTime<Utc>) -> Vec<ScheduledTask> {
        debug!(%filter, "TaskStore::list_tasks: called");
        let mut tasks: Vec<_> = self
            .tasks
            .lock()
            .await
            .iter()
            .filter(|t| filter.matches(t, now))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| match (a.next_run_at, b.next_run_at) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.created_at.cmp(&b.created_at),
        });
        tasks
    }

    /// Active tasks whose next run is at or before `now`
    pub async fn due_tasks(&self, now: DateTime<Utc>) -> Vec<ScheduledTask> {
        self.tasks
            .lock()
            .await
            .iter()
            .filter(|t| t.is_due(now))
            .cloned()
            .collect()
    }

    /// Apply an edit; an active task gets its next run recomputed
    pub async fn update_task(
        &self,
        id: &str,
        update: TaskUpdate,
        config: &Config,
        now: DateTime<Utc>,
    ) -> Result<ScheduledTask, StoreError> {
        debug!(%id, "TaskStore::update_task: called");
        self.modify_checked(id, now, |task| {
            if let Some(container) = update.container {
                task.container = container;
            }
            if let Some(action) = update.action {
                task.action = action;
            }
            if let Some(cycle) = update.cycle {
                task.cycle = cycle;
            }
            if let Some(timezone) = update.timezone {
                task.timezone = timezone;
            }
            task.attempts = 0;
            task.next_run_at = Self::validate(task, config, now)?;
            Ok(())
        })
        .await
    }

    pub async fn delete_task(&self, id: &str) -> Result<ScheduledTask, StoreError> {
        debug!(%id, "TaskStore::delete_task: called");
        let mut tasks = self.tasks.lock().await;
        let idx = Self::find(&tasks, id)?;

        let mut next = tasks.clone();
        let removed = next.remove(idx);
        self.persist(&next).await?;
        *tasks = next;

        info!(task_id = %removed.id, "Deleted scheduled task");
        Ok(removed)
    }

    /// Enable or disable a task
    ///
    /// Enabling recomputes the next run; a one-shot task whose time has
    /// passed cannot be enabled again.
    pub async fn set_task_active(&self, id: &str, active: bool, now: DateTime<Utc>) -> Result<ScheduledTask, StoreError> {
        debug!(%id, active, "TaskStore::set_task_active: called");
        self.modify_checked(id, now, |task| {
            if active {
                let next = task.cycle.next_after(now, task.timezone).ok_or_else(|| match &task.cycle {
                    Cycle::Once { at } => ScheduleError::InPast(at.format("%Y-%m-%d %H:%M").to_string()),
                    other => ScheduleError::NeverFires(other.to_string()),
                })?;
                task.is_active = true;
                task.next_run_at = Some(next);
                task.attempts = 0;
            } else {
                task.is_active = false;
                task.next_run_at = None;
            }
            Ok(())
        })
        .await
    }

    /// Apply `f` to one task and persist
    pub async fn modify<F>(&self, id: &str, now: DateTime<Utc>, f: F) -> Result<ScheduledTask, StoreError>
    where
        F: FnOnce(&mut ScheduledTask),
    {
        self.modify_checked(id, now, |task| {
            f(task);
            Ok(())
        })
        .await
    }

    async fn modify_checked<F>(&self, id: &str, now: DateTime<Utc>, f: F) -> Result<ScheduledTask, StoreError>
    where
        F: FnOnce(&mut ScheduledTask) -> Result<(), StoreError>,
    {
        let mut tasks = self.tasks.lock().await;
        let idx = Self::find(&tasks, id)?;

        let mut next = tasks.clone();
        f(&mut next[idx])?;
        next[idx].updated_at = now;
        let updated = next[idx].clone();

        self.persist(&next).await?;
        *tasks = next;
        Ok(updated)
    }

    pub async fn len(&self) -> usize {
        self.tasks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveTime, TimeDelta};
    use chrono_tz::Tz;
    use tempfile::TempDir;

    use super::*;
    use crate::config::ContainerRef;
    use crate::dispatcher::Action;
    use crate::schedule::cycle::parse_datetime;

    fn config() -> Config {
        Config {
            containers: vec![ContainerRef::new("web"), ContainerRef::new("db")],
            ..Default::default()
        }
    }

    fn daily(container: &str) -> NewTask {
        NewTask {
            container: container.to_string(),
            action: Action::Restart,
            cycle: Cycle::Daily {
                time: NaiveTime::from_hms_opt(4, 0, 0).unwrap(),
            },
            timezone: Tz::UTC,
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = TaskStore::in_memory();
        let now = Utc::now();

        let task = store.create_task(daily("web"), &config(), now).await.unwrap();

        assert!(task.is_active);
        assert!(task.next_run_at.unwrap() > now);
        assert_eq!(store.get_task(&task.id).await.unwrap(), task);
        assert_eq!(store.get_task(task.short_id()).await.unwrap().id, task.id);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid() {
        let store = TaskStore::in_memory();
        let now = Utc::now();

        let err = store.create_task(daily("ghost"), &config(), now).await.unwrap_err();
        assert!(matches!(err, StoreError::UnknownContainer(_)));

        let mut logs = daily("web");
        logs.action = Action::Logs;
        assert!(matches!(
            store.create_task(logs, &config(), now).await,
            Err(StoreError::Invalid(ScheduleError::Action(_)))
        ));

        let mut past = daily("web");
        past.cycle = Cycle::Once {
            at: parse_datetime("2020-01-01 00:00").unwrap(),
        };
        assert!(matches!(
            store.create_task(past, &config(), now).await,
            Err(StoreError::Invalid(ScheduleError::InPast(_)))
        ));

        let mut bad_day = daily("web");
        bad_day.cycle = Cycle::Monthly {
            day: 32,
            time: NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
        };
        assert!(store.create_task(bad_day, &config(), now).await.is_err());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_update_recomputes_next_run() {
        let store = TaskStore::in_memory();
        let now = Utc::now();
        let task = store.create_task(daily("web"), &config(), now).await.unwrap();

        let update = TaskUpdate {
            cycle: Some(Cycle::Weekly {
                weekday: chrono::Weekday::Sun,
                time: NaiveTime::from_hms_opt(4, 0, 0).unwrap(),
            }),
            ..Default::default()
        };
        let updated = store.update_task(&task.id, update, &config(), now).await.unwrap();

        assert_eq!(updated.cycle.name(), "weekly");
        assert_eq!(
            updated.next_run_at,
            updated.cycle.next_after(now, Tz::UTC)
        );
    }

    #[tokio::test]
    async fn test_update_rejected_leaves_task_unchanged() {
        let store = TaskStore::in_memory();
        let now = Utc::now();
        let task = store.create_task(daily("web"), &config(), now).await.unwrap();

        let update = TaskUpdate {
            container: Some("ghost".to_string()),
            ..Default::default()
        };
        assert!(store.update_task(&task.id, update, &config(), now).await.is_err());
        assert_eq!(store.get_task(&task.id).await.unwrap().container, "web");
    }

    #[tokio::test]
    async fn test_set_active() {
        let store = TaskStore::in_memory();
        let now = Utc::now();
        let task = store.create_task(daily("web"), &config(), now).await.unwrap();

        let disabled = store.set_task_active(&task.id, false, now).await.unwrap();
        assert!(!disabled.is_active);
        assert!(disabled.next_run_at.is_none());

        let enabled = store.set_task_active(&task.id, true, now).await.unwrap();
        assert!(enabled.is_active);
        assert!(enabled.next_run_at.is_some());
    }

    #[tokio::test]
    async fn test_expired_once_cannot_be_enabled() {
        let store = TaskStore::in_memory();
        let now = Utc::now();
        let mut new = daily("web");
        new.cycle = Cycle::Once {
            at: (now + TimeDelta::hours(1)).naive_utc(),
        };
        let task = store.create_task(new, &config(), now).await.unwrap();
        store.set_task_active(&task.id, false, now).await.unwrap();

        let later = now + TimeDelta::hours(2);
        let err = store.set_task_active(&task.id, true, later).await.unwrap_err();
        assert!(matches!(err, StoreError::Invalid(ScheduleError::InPast(_))));

        let expired = store.list_tasks(TaskFilter::Expired, later).await;
        assert_eq!(expired.len(), 1);
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let store = TaskStore::in_memory();
        let now = Utc::now();
        let a = store.create_task(daily("web"), &config(), now).await.unwrap();
        let b = store.create_task(daily("db"), &config(), now).await.unwrap();
        store.set_task_active(&b.id, false, now).await.unwrap();

        assert_eq!(store.list_tasks(TaskFilter::All, now).await.len(), 2);
        let active = store.list_tasks(TaskFilter::Active, now).await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, a.id);

        store.delete_task(&a.id).await.unwrap();
        assert!(matches!(store.get_task(&a.id).await, Err(StoreError::NotFound(_))));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_persists_across_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("tasks.json");
        let now = Utc::now();

        let id = {
            let store = TaskStore::open(&path).await.unwrap();
            store.create_task(daily("web"), &config(), now).await.unwrap().id
        };

        let reopened = TaskStore::open(&path).await.unwrap();
        let task = reopened.get_task(&id).await.unwrap();
        assert_eq!(task.container, "web");
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tasks.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(TaskStore::open(&path).await, Err(StoreError::Json(_))));
    }
}
