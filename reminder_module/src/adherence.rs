use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

use crate::escalation::Resolution;
use crate::storage::{format_datetime, open_connection, StoreError};

const ADHERENCE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS dose_acknowledgments (
    schedule_id TEXT NOT NULL,
    dose_at TEXT NOT NULL,
    action TEXT NOT NULL,
    acknowledged_at TEXT NOT NULL,
    PRIMARY KEY (schedule_id, dose_at)
);
"#;

/// User action recorded against a due dose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Acknowledgment {
    Taken,
    Skipped,
}

impl Acknowledgment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Acknowledgment::Taken => "TAKEN",
            Acknowledgment::Skipped => "SKIPPED",
        }
    }

    pub fn resolution(&self) -> Resolution {
        match self {
            Acknowledgment::Taken => Resolution::Taken,
            Acknowledgment::Skipped => Resolution::Skipped,
        }
    }
}

impl fmt::Display for Acknowledgment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Acknowledgment {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "TAKEN" => Ok(Acknowledgment::Taken),
            "SKIPPED" => Ok(Acknowledgment::Skipped),
            other => Err(format!("unknown acknowledgment: {}", other)),
        }
    }
}

/// Authority on whether a dose was acknowledged.
pub trait AdherenceGate: Send + Sync {
    fn acknowledgment(
        &self,
        schedule_id: Uuid,
        dose_at: DateTime<Utc>,
    ) -> Result<Option<Acknowledgment>, StoreError>;

    fn was_acknowledged(&self, schedule_id: Uuid, dose_at: DateTime<Utc>) -> Result<bool, StoreError> {
        Ok(self.acknowledgment(schedule_id, dose_at)?.is_some())
    }
}

/// Reads the acknowledgement table written by the adherence recorder.
#[derive(Debug)]
pub struct SqliteAdherenceGate {
    path: PathBuf,
}

impl SqliteAdherenceGate {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let gate = Self { path: path.into() };
        let _ = gate.open()?;
        Ok(gate)
    }

    fn open(&self) -> Result<Connection, StoreError> {
        open_connection(&self.path, ADHERENCE_SCHEMA)
    }

    /// Records a user action. The first action for a dose wins; returns
    /// whether this call stored it.
    pub fn record(
        &self,
        schedule_id: Uuid,
        dose_at: DateTime<Utc>,
        action: Acknowledgment,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.open()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO dose_acknowledgments
                (schedule_id, dose_at, action, acknowledged_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                schedule_id.to_string(),
                format_datetime(dose_at),
                action.as_str(),
                format_datetime(at)
            ],
        )?;
        Ok(inserted > 0)
    }
}

impl AdherenceGate for SqliteAdherenceGate {
    fn acknowledgment(
        &self,
        schedule_id: Uuid,
        dose_at: DateTime<Utc>,
    ) -> Result<Option<Acknowledgment>, StoreError> {
        let conn = self.open()?;
        let action: Option<String> = conn
            .query_row(
                "SELECT action FROM dose_acknowledgments
                 WHERE schedule_id = ?1 AND dose_at = ?2",
                params![schedule_id.to_string(), format_datetime(dose_at)],
                |row| row.get(0),
            )
            .optional()?;
        action
            .map(|raw| raw.parse::<Acknowledgment>().map_err(StoreError::Corrupt))
            .transpose()
    }
}
