use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::queue::{QueueError, QueuedTask};
use crate::schedule::ScheduleError;
use crate::storage::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("schedule error: {0}")]
    Schedule(#[from] ScheduleError),
    #[error("schedule {0} not found")]
    ScheduleNotFound(Uuid),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("task failed: {0}")]
    TaskFailed(String),
}

/// What happened to one claimed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskResult {
    Done,
    Retrying { retry_at: DateTime<Utc> },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    pub task: QueuedTask,
    pub result: TaskResult,
}

/// Retention windows applied by the cleanup sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepPolicy {
    pub resolved_retention: chrono::Duration,
    /// Age past a dose's due time after which its open escalation is timed out.
    pub unresolved_retention: chrono::Duration,
    pub finished_task_retention: chrono::Duration,
}

impl Default for SweepPolicy {
    fn default() -> Self {
        Self {
            resolved_retention: chrono::Duration::hours(1),
            unresolved_retention: chrono::Duration::days(2),
            finished_task_retention: chrono::Duration::days(1),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_states: usize,
    pub purged_states: usize,
    pub abandoned_tasks: usize,
    pub purged_tasks: usize,
}
