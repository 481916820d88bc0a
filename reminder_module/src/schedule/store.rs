use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;
use uuid::Uuid;

use crate::storage::{format_datetime, open_connection, parse_optional_datetime, StoreError};

use super::{Schedule, ScheduleError};

const SCHEDULE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS schedules (
    id TEXT PRIMARY KEY,
    definition_json TEXT NOT NULL,
    last_fired_at TEXT,
    next_reminder_at TEXT,
    updated_at TEXT NOT NULL
);
"#;

/// What the scheduler needs from the schedule record.
pub trait ScheduleStore: Send + Sync {
    fn get(&self, id: Uuid) -> Result<Option<Schedule>, StoreError>;
    fn record_last_fired(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;
    fn record_next_reminder(&self, id: Uuid, at: Option<DateTime<Utc>>)
        -> Result<(), StoreError>;
}

#[derive(Debug)]
pub struct SqliteScheduleStore {
    path: PathBuf,
}

impl SqliteScheduleStore {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self { path: path.into() };
        let _ = store.open()?;
        Ok(store)
    }

    fn open(&self) -> Result<Connection, StoreError> {
        open_connection(&self.path, SCHEDULE_SCHEMA)
    }

    /// Inserts or replaces the definition. Invalid rules and ladders are
    /// rejected here so the scheduling core only ever sees well-formed ones.
    pub fn upsert(&self, schedule: &Schedule, now: DateTime<Utc>) -> Result<(), ScheduleError> {
        schedule.validate()?;
        let definition_json = serde_json::to_string(schedule).map_err(StoreError::from)?;
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO schedules (id, definition_json, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                definition_json = excluded.definition_json,
                updated_at = excluded.updated_at",
            params![
                schedule.id.to_string(),
                definition_json,
                format_datetime(now)
            ],
        )
        .map_err(StoreError::from)?;
        Ok(())
    }

    pub fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let conn = self.open()?;
        let removed = conn.execute(
            "DELETE FROM schedules WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(removed > 0)
    }

    pub fn list_ids(&self) -> Result<Vec<Uuid>, StoreError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT id FROM schedules ORDER BY id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(Uuid::parse_str(&row?)?);
        }
        Ok(ids)
    }
}

impl ScheduleStore for SqliteScheduleStore {
    fn get(&self, id: Uuid) -> Result<Option<Schedule>, StoreError> {
        let conn = self.open()?;
        let row = conn
            .query_row(
                "SELECT definition_json, last_fired_at, next_reminder_at
                 FROM schedules WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()?;
        let Some((definition_json, last_fired_raw, next_reminder_raw)) = row else {
            return Ok(None);
        };
        let mut schedule: Schedule = serde_json::from_str(&definition_json)?;
        schedule.last_fired_at = parse_optional_datetime(last_fired_raw.as_deref())?;
        schedule.next_reminder_at = parse_optional_datetime(next_reminder_raw.as_deref())?;
        Ok(Some(schedule))
    }

    fn record_last_fired(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE schedules SET last_fired_at = ?2 WHERE id = ?1",
            params![id.to_string(), format_datetime(at)],
        )?;
        Ok(())
    }

    fn record_next_reminder(
        &self,
        id: Uuid,
        at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE schedules SET next_reminder_at = ?2 WHERE id = ?1",
            params![id.to_string(), at.map(format_datetime)],
        )?;
        Ok(())
    }
}
