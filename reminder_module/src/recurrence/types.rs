use chrono::{DateTime, NaiveDate, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Frequency {
    Daily,
    Weekly,
    CustomInterval,
    AsNeeded,
}

/// Wall-clock dose time in the schedule's time zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub hour: u32,
    pub minute: u32,
    #[serde(default)]
    pub label: Option<String>,
}

impl TimeSlot {
    pub fn new(hour: u32, minute: u32) -> Self {
        Self {
            hour,
            minute,
            label: None,
        }
    }

    pub fn labelled(hour: u32, minute: u32, label: impl Into<String>) -> Self {
        Self {
            hour,
            minute,
            label: Some(label.into()),
        }
    }

    /// `None` when hour/minute are out of range.
    pub fn time(&self) -> Option<NaiveTime> {
        NaiveTime::from_hms_opt(self.hour, self.minute, 0)
    }
}

/// `active_days` on, then `break_days` off, repeating from `anchor`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleRule {
    pub active_days: u32,
    pub break_days: u32,
    pub anchor: NaiveDate,
}

impl CycleRule {
    pub fn length(&self) -> i64 {
        i64::from(self.active_days) + i64::from(self.break_days)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DurationPolicy {
    Ongoing,
    /// Last calendar day (inclusive) on which doses are due.
    Until { end_date: NaiveDate },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrenceRule {
    pub frequency: Frequency,
    #[serde(default)]
    pub days_of_week: Vec<Weekday>,
    #[serde(default)]
    pub interval_days: Option<u32>,
    #[serde(default)]
    pub time_slots: Vec<TimeSlot>,
    #[serde(default)]
    pub cycle: Option<CycleRule>,
    pub start_date: NaiveDate,
    pub duration: DurationPolicy,
    pub active: bool,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub resume_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecurrenceError {
    #[error("time slot {hour:02}:{minute:02} is out of range")]
    InvalidSlot { hour: u32, minute: u32 },
    #[error("duplicate time slot {hour:02}:{minute:02}")]
    DuplicateSlot { hour: u32, minute: u32 },
    #[error("custom interval rule requires interval_days >= 1")]
    InvalidInterval,
    #[error("cycle requires active_days >= 1 and break_days >= 1 (got {active_days}/{break_days})")]
    InvalidCycle { active_days: u32, break_days: u32 },
    #[error("end date {end_date} precedes start date {start_date}")]
    EndBeforeStart {
        start_date: NaiveDate,
        end_date: NaiveDate,
    },
}

impl RecurrenceRule {
    pub fn daily(start_date: NaiveDate, time_slots: Vec<TimeSlot>) -> Self {
        Self {
            frequency: Frequency::Daily,
            days_of_week: Vec::new(),
            interval_days: None,
            time_slots,
            cycle: None,
            start_date,
            duration: DurationPolicy::Ongoing,
            active: true,
            paused: false,
            resume_at: None,
        }
    }

    /// Checks the invariants enforced when a schedule is created or edited.
    /// An empty slot list is accepted; such a rule simply never produces a dose.
    pub fn validate(&self) -> Result<(), RecurrenceError> {
        let mut seen = HashSet::new();
        for slot in &self.time_slots {
            if slot.time().is_none() {
                return Err(RecurrenceError::InvalidSlot {
                    hour: slot.hour,
                    minute: slot.minute,
                });
            }
            if !seen.insert((slot.hour, slot.minute)) {
                return Err(RecurrenceError::DuplicateSlot {
                    hour: slot.hour,
                    minute: slot.minute,
                });
            }
        }
        if self.frequency == Frequency::CustomInterval && self.interval_days.unwrap_or(0) < 1 {
            return Err(RecurrenceError::InvalidInterval);
        }
        if let Some(cycle) = &self.cycle {
            if cycle.active_days < 1 || cycle.break_days < 1 {
                return Err(RecurrenceError::InvalidCycle {
                    active_days: cycle.active_days,
                    break_days: cycle.break_days,
                });
            }
        }
        if let DurationPolicy::Until { end_date } = self.duration {
            if end_date < self.start_date {
                return Err(RecurrenceError::EndBeforeStart {
                    start_date: self.start_date,
                    end_date,
                });
            }
        }
        Ok(())
    }

    /// Valid slots in ascending (hour, minute) order, duplicates dropped.
    pub fn sorted_times(&self) -> Vec<NaiveTime> {
        let mut times: Vec<NaiveTime> = self
            .time_slots
            .iter()
            .filter_map(TimeSlot::time)
            .collect();
        times.sort();
        times.dedup();
        times
    }

    pub fn end_date(&self) -> Option<NaiveDate> {
        match self.duration {
            DurationPolicy::Ongoing => None,
            DurationPolicy::Until { end_date } => Some(end_date),
        }
    }
}
