use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::storage::{format_datetime, StoreError};

mod sqlite;

pub use sqlite::SqliteTaskQueue;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("uuid parse error: {0}")]
    UuidParse(#[from] uuid::Error),
    #[error("task {0} not found")]
    NotFound(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    Reminders,
    Escalations,
}

impl QueueName {
    pub const ALL: [QueueName; 2] = [QueueName::Reminders, QueueName::Escalations];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Reminders => "reminders",
            QueueName::Escalations => "escalations",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskPayload {
    FireReminder {
        schedule_id: Uuid,
        dose_at: DateTime<Utc>,
    },
    AdvanceEscalation {
        schedule_id: Uuid,
        dose_at: DateTime<Utc>,
        /// Number of escalation checks already applied when this task was enqueued.
        step: u32,
    },
}

impl TaskPayload {
    pub fn queue(&self) -> QueueName {
        match self {
            TaskPayload::FireReminder { .. } => QueueName::Reminders,
            TaskPayload::AdvanceEscalation { .. } => QueueName::Escalations,
        }
    }

    pub fn schedule_id(&self) -> Uuid {
        match self {
            TaskPayload::FireReminder { schedule_id, .. }
            | TaskPayload::AdvanceEscalation { schedule_id, .. } => *schedule_id,
        }
    }

    pub fn dose_at(&self) -> DateTime<Utc> {
        match self {
            TaskPayload::FireReminder { dose_at, .. }
            | TaskPayload::AdvanceEscalation { dose_at, .. } => *dose_at,
        }
    }

    /// Deterministic identity: enqueueing the same key twice never yields two
    /// live tasks.
    pub fn task_key(&self) -> String {
        match self {
            TaskPayload::FireReminder {
                schedule_id,
                dose_at,
            } => format!("fire:{}:{}", schedule_id, format_datetime(*dose_at)),
            TaskPayload::AdvanceEscalation {
                schedule_id,
                dose_at,
                step,
            } => format!(
                "escalate:{}:{}:{}",
                schedule_id,
                format_datetime(*dose_at),
                step
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRequest {
    pub payload: TaskPayload,
    pub run_at: DateTime<Utc>,
    /// Cancellation generation of the schedule this request was derived under.
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedTask {
    pub id: Uuid,
    pub key: String,
    pub payload: TaskPayload,
    pub run_at: DateTime<Utc>,
    /// Delivery attempts including the current one.
    pub attempts: u32,
    pub generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Inserted,
    /// A live task with the same key already exists.
    Duplicate,
    /// The schedule was cancelled after this request's generation was read.
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Retrying {
        attempts: u32,
        retry_at: DateTime<Utc>,
    },
    Failed {
        attempts: u32,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: usize,
    pub active: usize,
    pub delayed: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub reminders: QueueCounts,
    pub escalations: QueueCounts,
}

impl QueueStats {
    pub fn for_queue(&self, queue: QueueName) -> &QueueCounts {
        match queue {
            QueueName::Reminders => &self.reminders,
            QueueName::Escalations => &self.escalations,
        }
    }

    pub(crate) fn for_queue_mut(&mut self, queue: QueueName) -> &mut QueueCounts {
        match queue {
            QueueName::Reminders => &mut self.reminders,
            QueueName::Escalations => &mut self.escalations,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// A `processing` task whose lease is older than this may be reclaimed.
    pub lease: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::seconds(5),
            max_delay: Duration::hours(1),
            lease: Duration::seconds(120),
        }
    }
}

impl RetryPolicy {
    /// `base * 2^(attempts - 1)`, capped at `max_delay`.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(20);
        let factor = 1i32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Durable delayed-task queue with at-least-once delivery.
pub trait TaskQueue: Send + Sync {
    fn generation(&self, schedule_id: Uuid) -> Result<u64, QueueError>;

    fn enqueue(
        &self,
        request: &TaskRequest,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome, QueueError>;

    /// Leases the earliest due task of `queue`, if any.
    fn claim_next(
        &self,
        queue: QueueName,
        now: DateTime<Utc>,
        worker_id: &str,
    ) -> Result<Option<QueuedTask>, QueueError>;

    fn mark_done(&self, id: &Uuid, now: DateTime<Utc>) -> Result<(), QueueError>;

    /// Schedules a retry with backoff, or marks the task failed once its
    /// attempts are exhausted.
    fn mark_failed(
        &self,
        id: &Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, QueueError>;

    /// Deletes every pending task of the schedule and bumps its generation so
    /// in-flight tasks cannot enqueue follow-ups. Returns the number removed.
    fn cancel_schedule(&self, schedule_id: Uuid) -> Result<usize, QueueError>;

    fn pending_for_schedule(&self, schedule_id: Uuid) -> Result<Vec<QueuedTask>, QueueError>;

    fn stats(&self, now: DateTime<Utc>) -> Result<QueueStats, QueueError>;

    /// Marks tasks whose lease expired with no attempts left as failed.
    fn fail_expired_leases(&self, now: DateTime<Utc>) -> Result<usize, QueueError>;

    /// Drops done/failed rows finished before `cutoff`.
    fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize, QueueError>;
}
