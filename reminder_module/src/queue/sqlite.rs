use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::PathBuf;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::storage::{datetime_from_millis, open_connection};

use super::{
    EnqueueOutcome, FailureOutcome, QueueError, QueueName, QueueStats, QueuedTask, RetryPolicy,
    TaskPayload, TaskQueue, TaskRequest,
};

const QUEUE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS reminder_tasks (
    id TEXT PRIMARY KEY,
    task_key TEXT NOT NULL UNIQUE,
    queue TEXT NOT NULL,
    schedule_id TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    generation INTEGER NOT NULL,
    status TEXT NOT NULL,
    run_at_ms INTEGER NOT NULL,
    created_at_ms INTEGER NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    locked_at_ms INTEGER,
    locked_by TEXT,
    finished_at_ms INTEGER,
    last_error TEXT
);

CREATE INDEX IF NOT EXISTS reminder_tasks_due_idx
    ON reminder_tasks(queue, status, run_at_ms);
CREATE INDEX IF NOT EXISTS reminder_tasks_schedule_idx
    ON reminder_tasks(schedule_id, status);

CREATE TABLE IF NOT EXISTS schedule_generations (
    schedule_id TEXT PRIMARY KEY,
    generation INTEGER NOT NULL
);
"#;

const TASK_COLUMNS: &str = "id, task_key, payload_json, run_at_ms, attempts, generation";

#[derive(Debug, Clone)]
pub struct SqliteTaskQueue {
    path: PathBuf,
    policy: RetryPolicy,
}

impl SqliteTaskQueue {
    pub fn new(path: impl Into<PathBuf>, policy: RetryPolicy) -> Result<Self, QueueError> {
        let queue = Self {
            path: path.into(),
            policy,
        };
        let _ = queue.open()?;
        Ok(queue)
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn open(&self) -> Result<Connection, QueueError> {
        Ok(open_connection(&self.path, QUEUE_SCHEMA)?)
    }
}

impl TaskQueue for SqliteTaskQueue {
    fn generation(&self, schedule_id: Uuid) -> Result<u64, QueueError> {
        let conn = self.open()?;
        select_generation(&conn, schedule_id)
    }

    fn enqueue(
        &self,
        request: &TaskRequest,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome, QueueError> {
        let payload = &request.payload;
        let schedule_id = payload.schedule_id();
        let key = payload.task_key();
        let payload_json = serde_json::to_string(payload)?;

        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = select_generation(&tx, schedule_id)?;
        if current != request.generation {
            tx.commit()?;
            debug!(
                "refusing stale task {} (generation {} != {})",
                key, request.generation, current
            );
            return Ok(EnqueueOutcome::Stale);
        }

        let existing: Option<String> = tx
            .query_row(
                "SELECT status FROM reminder_tasks WHERE task_key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        let outcome = match existing.as_deref() {
            None => {
                tx.execute(
                    "INSERT INTO reminder_tasks
                        (id, task_key, queue, schedule_id, payload_json, generation, status,
                         run_at_ms, created_at_ms, attempts)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?8, 0)",
                    params![
                        Uuid::new_v4().to_string(),
                        key,
                        payload.queue().as_str(),
                        schedule_id.to_string(),
                        payload_json,
                        request.generation as i64,
                        request.run_at.timestamp_millis(),
                        now.timestamp_millis(),
                    ],
                )?;
                EnqueueOutcome::Inserted
            }
            Some("done") | Some("failed") => {
                // A finished row keeps its key for dedupe until purged; a new
                // request for the same key replaces it.
                tx.execute(
                    "UPDATE reminder_tasks
                     SET id = ?2,
                         payload_json = ?3,
                         generation = ?4,
                         status = 'pending',
                         run_at_ms = ?5,
                         created_at_ms = ?6,
                         attempts = 0,
                         locked_at_ms = NULL,
                         locked_by = NULL,
                         finished_at_ms = NULL,
                         last_error = NULL
                     WHERE task_key = ?1",
                    params![
                        key,
                        Uuid::new_v4().to_string(),
                        payload_json,
                        request.generation as i64,
                        request.run_at.timestamp_millis(),
                        now.timestamp_millis(),
                    ],
                )?;
                EnqueueOutcome::Inserted
            }
            Some(_) => EnqueueOutcome::Duplicate,
        };
        tx.commit()?;
        Ok(outcome)
    }

    fn claim_next(
        &self,
        queue: QueueName,
        now: DateTime<Utc>,
        worker_id: &str,
    ) -> Result<Option<QueuedTask>, QueueError> {
        let now_ms = now.timestamp_millis();
        let lease_cutoff = now_ms - self.policy.lease.num_milliseconds();

        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let candidate = tx
            .query_row(
                &format!(
                    "SELECT {TASK_COLUMNS}
                     FROM reminder_tasks
                     WHERE queue = ?1
                       AND (
                         (status = 'pending' AND run_at_ms <= ?2)
                         OR (status = 'processing' AND locked_at_ms < ?3)
                       )
                       AND attempts < ?4
                     ORDER BY run_at_ms, created_at_ms
                     LIMIT 1"
                ),
                params![
                    queue.as_str(),
                    now_ms,
                    lease_cutoff,
                    i64::from(self.policy.max_attempts)
                ],
                RawTask::from_row,
            )
            .optional()?;

        let Some(raw) = candidate else {
            tx.commit()?;
            return Ok(None);
        };

        tx.execute(
            "UPDATE reminder_tasks
             SET status = 'processing',
                 locked_at_ms = ?2,
                 locked_by = ?3,
                 attempts = attempts + 1
             WHERE id = ?1",
            params![raw.id, now_ms, worker_id],
        )?;
        tx.commit()?;

        let mut task = raw.into_task()?;
        task.attempts += 1;
        Ok(Some(task))
    }

    fn mark_done(&self, id: &Uuid, now: DateTime<Utc>) -> Result<(), QueueError> {
        let conn = self.open()?;
        let updated = conn.execute(
            "UPDATE reminder_tasks
             SET status = 'done',
                 finished_at_ms = ?2,
                 locked_at_ms = NULL,
                 locked_by = NULL
             WHERE id = ?1",
            params![id.to_string(), now.timestamp_millis()],
        )?;
        if updated == 0 {
            // Cancelled or purged while running.
            debug!("task {} vanished before completion", id);
        }
        Ok(())
    }

    fn mark_failed(
        &self,
        id: &Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, QueueError> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let attempts: i64 = tx
            .query_row(
                "SELECT attempts FROM reminder_tasks WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(QueueError::NotFound(*id))?;
        let attempts = u32::try_from(attempts).unwrap_or(u32::MAX);

        let outcome = if attempts >= self.policy.max_attempts {
            tx.execute(
                "UPDATE reminder_tasks
                 SET status = 'failed',
                     finished_at_ms = ?2,
                     locked_at_ms = NULL,
                     locked_by = NULL,
                     last_error = ?3
                 WHERE id = ?1",
                params![id.to_string(), now.timestamp_millis(), error],
            )?;
            FailureOutcome::Failed { attempts }
        } else {
            let retry_at = now + self.policy.backoff(attempts);
            tx.execute(
                "UPDATE reminder_tasks
                 SET status = 'pending',
                     run_at_ms = ?2,
                     locked_at_ms = NULL,
                     locked_by = NULL,
                     last_error = ?3
                 WHERE id = ?1",
                params![id.to_string(), retry_at.timestamp_millis(), error],
            )?;
            FailureOutcome::Retrying { attempts, retry_at }
        };
        tx.commit()?;
        Ok(outcome)
    }

    fn cancel_schedule(&self, schedule_id: Uuid) -> Result<usize, QueueError> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let removed = tx.execute(
            "DELETE FROM reminder_tasks WHERE schedule_id = ?1 AND status = 'pending'",
            params![schedule_id.to_string()],
        )?;
        tx.execute(
            "INSERT INTO schedule_generations (schedule_id, generation) VALUES (?1, 1)
             ON CONFLICT(schedule_id) DO UPDATE SET generation = generation + 1",
            params![schedule_id.to_string()],
        )?;
        tx.commit()?;
        Ok(removed)
    }

    fn pending_for_schedule(&self, schedule_id: Uuid) -> Result<Vec<QueuedTask>, QueueError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS}
             FROM reminder_tasks
             WHERE schedule_id = ?1 AND status = 'pending'
             ORDER BY run_at_ms, created_at_ms"
        ))?;
        let rows = stmt.query_map(params![schedule_id.to_string()], RawTask::from_row)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?.into_task()?);
        }
        Ok(tasks)
    }

    fn stats(&self, now: DateTime<Utc>) -> Result<QueueStats, QueueError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT queue, status, run_at_ms <= ?1 AS due, COUNT(*)
             FROM reminder_tasks
             GROUP BY queue, status, due",
        )?;
        let rows = stmt.query_map(params![now.timestamp_millis()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, bool>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        let mut stats = QueueStats::default();
        for row in rows {
            let (queue, status, due, count) = row?;
            let queue = match queue.as_str() {
                "reminders" => QueueName::Reminders,
                "escalations" => QueueName::Escalations,
                other => {
                    warn!("ignoring tasks in unknown queue {}", other);
                    continue;
                }
            };
            let count = usize::try_from(count).unwrap_or(0);
            let counts = stats.for_queue_mut(queue);
            match (status.as_str(), due) {
                ("pending", true) => counts.waiting += count,
                ("pending", false) => counts.delayed += count,
                ("processing", _) => counts.active += count,
                ("done", _) => counts.completed += count,
                ("failed", _) => counts.failed += count,
                (other, _) => warn!("ignoring tasks with unknown status {}", other),
            }
        }
        Ok(stats)
    }

    fn fail_expired_leases(&self, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let conn = self.open()?;
        let lease_cutoff = now.timestamp_millis() - self.policy.lease.num_milliseconds();
        let failed = conn.execute(
            "UPDATE reminder_tasks
             SET status = 'failed',
                 finished_at_ms = ?1,
                 locked_at_ms = NULL,
                 locked_by = NULL,
                 last_error = COALESCE(last_error, 'lease expired')
             WHERE status = 'processing'
               AND locked_at_ms < ?2
               AND attempts >= ?3",
            params![
                now.timestamp_millis(),
                lease_cutoff,
                i64::from(self.policy.max_attempts)
            ],
        )?;
        Ok(failed)
    }

    fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize, QueueError> {
        let conn = self.open()?;
        let removed = conn.execute(
            "DELETE FROM reminder_tasks
             WHERE status IN ('done', 'failed') AND finished_at_ms < ?1",
            params![cutoff.timestamp_millis()],
        )?;
        Ok(removed)
    }
}

fn select_generation(conn: &Connection, schedule_id: Uuid) -> Result<u64, QueueError> {
    let generation: Option<i64> = conn
        .query_row(
            "SELECT generation FROM schedule_generations WHERE schedule_id = ?1",
            params![schedule_id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(generation.map(|value| value.max(0) as u64).unwrap_or(0))
}

struct RawTask {
    id: String,
    key: String,
    payload_json: String,
    run_at_ms: i64,
    attempts: i64,
    generation: i64,
}

impl RawTask {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            key: row.get(1)?,
            payload_json: row.get(2)?,
            run_at_ms: row.get(3)?,
            attempts: row.get(4)?,
            generation: row.get(5)?,
        })
    }

    fn into_task(self) -> Result<QueuedTask, QueueError> {
        let payload: TaskPayload = serde_json::from_str(&self.payload_json)?;
        Ok(QueuedTask {
            id: Uuid::parse_str(&self.id)?,
            key: self.key,
            payload,
            run_at: datetime_from_millis(self.run_at_ms)?,
            attempts: u32::try_from(self.attempts).unwrap_or(0),
            generation: self.generation.max(0) as u64,
        })
    }
}
