use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::ladder::EscalationLevel;

/// Identifies one due dose: escalation state is keyed per dose, not per schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DoseKey {
    pub schedule_id: Uuid,
    pub dose_at: DateTime<Utc>,
}

impl DoseKey {
    pub fn new(schedule_id: Uuid, dose_at: DateTime<Utc>) -> Self {
        Self {
            schedule_id,
            dose_at,
        }
    }
}

impl fmt::Display for DoseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}",
            self.schedule_id,
            crate::storage::format_datetime(self.dose_at)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Resolution {
    Taken,
    Skipped,
    Timeout,
    Manual,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Taken => "TAKEN",
            Resolution::Skipped => "SKIPPED",
            Resolution::Timeout => "TIMEOUT",
            Resolution::Manual => "MANUAL",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "TAKEN" => Ok(Resolution::Taken),
            "SKIPPED" => Ok(Resolution::Skipped),
            "TIMEOUT" => Ok(Resolution::Timeout),
            "MANUAL" => Ok(Resolution::Manual),
            other => Err(format!("unknown resolution: {}", other)),
        }
    }
}

/// Escalation progress for one due dose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationState {
    pub schedule_id: Uuid,
    pub dose_at: DateTime<Utc>,
    pub level: EscalationLevel,
    /// Attempts consumed at the current level.
    pub attempts: u32,
    /// Escalation checks applied so far across all levels.
    pub checks: u32,
    pub started_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution: Option<Resolution>,
}

impl EscalationState {
    pub(crate) fn started(key: DoseKey, level: EscalationLevel, now: DateTime<Utc>) -> Self {
        Self {
            schedule_id: key.schedule_id,
            dose_at: key.dose_at,
            level,
            attempts: 0,
            checks: 0,
            started_at: now,
            last_attempt_at: None,
            resolved: false,
            resolved_at: None,
            resolution: None,
        }
    }

    pub fn key(&self) -> DoseKey {
        DoseKey::new(self.schedule_id, self.dose_at)
    }

    pub(crate) fn mark_resolved(&mut self, reason: Resolution, now: DateTime<Utc>) {
        if self.resolved {
            return;
        }
        self.resolved = true;
        self.resolved_at = Some(now);
        self.resolution = Some(reason);
    }
}
