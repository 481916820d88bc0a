use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::escalation::{EscalationLadder, LadderError};
use crate::recurrence::{RecurrenceError, RecurrenceRule};
use crate::storage::StoreError;

mod store;

pub use store::{ScheduleStore, SqliteScheduleStore};

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("invalid recurrence: {0}")]
    Recurrence(#[from] RecurrenceError),
    #[error("invalid escalation ladder: {0}")]
    Ladder(#[from] LadderError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Someone who can be notified: the patient or their caregiver.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub push_token: Option<String>,
}

impl Recipient {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Read model of one medication schedule. Mutations happen elsewhere and are
/// followed by a reschedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    pub medication: String,
    #[serde(default)]
    pub dosage: Option<String>,
    pub patient: Recipient,
    #[serde(default)]
    pub caregiver: Option<Recipient>,
    pub timezone: Tz,
    pub recurrence: RecurrenceRule,
    #[serde(default = "EscalationLadder::system_default")]
    pub ladder: EscalationLadder,
    /// Advisory, for display only.
    #[serde(skip)]
    pub last_fired_at: Option<DateTime<Utc>>,
    /// Advisory, for display only; the queue is authoritative.
    #[serde(skip)]
    pub next_reminder_at: Option<DateTime<Utc>>,
}

impl Schedule {
    pub fn new(
        medication: impl Into<String>,
        patient: Recipient,
        timezone: Tz,
        recurrence: RecurrenceRule,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            medication: medication.into(),
            dosage: None,
            patient,
            caregiver: None,
            timezone,
            recurrence,
            ladder: EscalationLadder::system_default(),
            last_fired_at: None,
            next_reminder_at: None,
        }
    }

    pub fn validate(&self) -> Result<(), ScheduleError> {
        self.recurrence.validate()?;
        // Ladders are checked on construction; this re-check catches values
        // assembled field by field.
        EscalationLadder::new(self.ladder.rules().to_vec())?;
        Ok(())
    }
}
