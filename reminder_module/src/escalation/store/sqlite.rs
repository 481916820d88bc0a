use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::PathBuf;
use uuid::Uuid;

use crate::storage::{
    bool_to_int, format_datetime, open_connection, parse_datetime, parse_optional_datetime,
    StoreError,
};

use super::super::state::{DoseKey, EscalationState, Resolution};
use super::EscalationStore;

const ESCALATION_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS escalation_states (
    schedule_id TEXT NOT NULL,
    dose_at TEXT NOT NULL,
    level TEXT NOT NULL,
    attempts INTEGER NOT NULL,
    checks INTEGER NOT NULL DEFAULT 0,
    started_at TEXT NOT NULL,
    last_attempt_at TEXT,
    resolved INTEGER NOT NULL DEFAULT 0,
    resolved_at TEXT,
    resolution TEXT,
    PRIMARY KEY (schedule_id, dose_at)
);

CREATE INDEX IF NOT EXISTS escalation_states_resolved_idx
    ON escalation_states(resolved, resolved_at);

CREATE INDEX IF NOT EXISTS escalation_states_open_idx
    ON escalation_states(resolved, dose_at);
"#;

const SELECT_COLUMNS: &str = "schedule_id, dose_at, level, attempts, checks, started_at, \
     last_attempt_at, resolved, resolved_at, resolution";

/// Durable store. Writes run in `BEGIN IMMEDIATE` transactions so concurrent
/// workers, in this process or another, serialize on the database write lock.
#[derive(Debug)]
pub struct SqliteEscalationStore {
    path: PathBuf,
}

impl SqliteEscalationStore {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self { path: path.into() };
        let _ = store.open()?;
        Ok(store)
    }

    fn open(&self) -> Result<Connection, StoreError> {
        open_connection(&self.path, ESCALATION_SCHEMA)
    }
}

impl EscalationStore for SqliteEscalationStore {
    fn load(&self, key: &DoseKey) -> Result<Option<EscalationState>, StoreError> {
        let conn = self.open()?;
        select_state(&conn, key)
    }

    fn insert_if_absent(&self, state: EscalationState) -> Result<EscalationState, StoreError> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            &format!(
                "INSERT OR IGNORE INTO escalation_states ({SELECT_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            ),
            params![
                state.schedule_id.to_string(),
                format_datetime(state.dose_at),
                state.level.as_str(),
                state.attempts,
                state.checks,
                format_datetime(state.started_at),
                state.last_attempt_at.map(format_datetime),
                bool_to_int(state.resolved),
                state.resolved_at.map(format_datetime),
                state.resolution.map(|reason| reason.as_str()),
            ],
        )?;
        let stored = select_state(&tx, &state.key())?.ok_or_else(|| {
            StoreError::Corrupt(format!("escalation state {} vanished", state.key()))
        })?;
        tx.commit()?;
        Ok(stored)
    }

    fn update(
        &self,
        key: &DoseKey,
        apply: &mut dyn FnMut(&mut EscalationState),
    ) -> Result<Option<EscalationState>, StoreError> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some(mut state) = select_state(&tx, key)? else {
            tx.commit()?;
            return Ok(None);
        };
        apply(&mut state);
        tx.execute(
            "UPDATE escalation_states
             SET level = ?3,
                 attempts = ?4,
                 checks = ?5,
                 last_attempt_at = ?6,
                 resolved = ?7,
                 resolved_at = ?8,
                 resolution = ?9
             WHERE schedule_id = ?1 AND dose_at = ?2",
            params![
                key.schedule_id.to_string(),
                format_datetime(key.dose_at),
                state.level.as_str(),
                state.attempts,
                state.checks,
                state.last_attempt_at.map(format_datetime),
                bool_to_int(state.resolved),
                state.resolved_at.map(format_datetime),
                state.resolution.map(|reason| reason.as_str()),
            ],
        )?;
        tx.commit()?;
        Ok(Some(state))
    }

    fn purge_resolved_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = self.open()?;
        let removed = conn.execute(
            "DELETE FROM escalation_states WHERE resolved = 1 AND resolved_at < ?1",
            params![format_datetime(cutoff)],
        )?;
        Ok(removed)
    }

    fn expire_unresolved_before(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let conn = self.open()?;
        let expired = conn.execute(
            "UPDATE escalation_states
             SET resolved = 1, resolved_at = ?2, resolution = ?3
             WHERE resolved = 0 AND dose_at < ?1",
            params![
                format_datetime(cutoff),
                format_datetime(now),
                Resolution::Timeout.as_str(),
            ],
        )?;
        Ok(expired)
    }

    fn unresolved_count(&self) -> Result<usize, StoreError> {
        let conn = self.open()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM escalation_states WHERE resolved = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

fn select_state(conn: &Connection, key: &DoseKey) -> Result<Option<EscalationState>, StoreError> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {SELECT_COLUMNS} FROM escalation_states
                 WHERE schedule_id = ?1 AND dose_at = ?2"
            ),
            params![key.schedule_id.to_string(), format_datetime(key.dose_at)],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, u32>(3)?,
                    row.get::<_, u32>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, Option<String>>(8)?,
                    row.get::<_, Option<String>>(9)?,
                ))
            },
        )
        .optional()?;
    let Some((
        schedule_id_raw,
        dose_at_raw,
        level_raw,
        attempts,
        checks,
        started_at_raw,
        last_attempt_raw,
        resolved_raw,
        resolved_at_raw,
        resolution_raw,
    )) = row
    else {
        return Ok(None);
    };

    let level = level_raw.parse().map_err(StoreError::Corrupt)?;
    let resolution = resolution_raw
        .as_deref()
        .map(str::parse)
        .transpose()
        .map_err(StoreError::Corrupt)?;
    Ok(Some(EscalationState {
        schedule_id: Uuid::parse_str(&schedule_id_raw)?,
        dose_at: parse_datetime(&dose_at_raw)?,
        level,
        attempts,
        checks,
        started_at: parse_datetime(&started_at_raw)?,
        last_attempt_at: parse_optional_datetime(last_attempt_raw.as_deref())?,
        resolved: resolved_raw != 0,
        resolved_at: parse_optional_datetime(resolved_at_raw.as_deref())?,
        resolution,
    }))
}
