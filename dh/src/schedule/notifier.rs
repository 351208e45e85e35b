//! Outbound reporting of scheduled runs

use async_trait::async_trait;
use tracing::{info, warn};

use crate::dispatcher::OperationResult;

use super::task::ScheduledTask;

/// Told about every scheduled run once its outcome is recorded
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn scheduled_run(&self, task: &ScheduledTask, result: &OperationResult);
}

/// Notifier that writes outcomes to the log
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn scheduled_run(&self, task: &ScheduledTask, result: &OperationResult) {
        if result.success {
            info!(
                task_id = %task.id,
                container = %task.container,
                action = %task.action,
                next_run_at = ?task.next_run_at,
                "Scheduled run succeeded"
            );
        } else {
            warn!(
                task_id = %task.id,
                container = %task.container,
                action = %task.action,
                error_kind = ?result.error_kind(),
                message = %result.message,
                active = task.is_active,
                "Scheduled run failed"
            );
        }
    }
}
