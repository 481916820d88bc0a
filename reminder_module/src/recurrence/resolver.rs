use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

use super::types::{Frequency, RecurrenceRule};

/// Forward scan horizon in days.
const MAX_SCAN_DAYS: i64 = 365;

/// Next dose instant strictly after `reference`, evaluated in `tz`.
///
/// Returns `None` when the rule is inactive, paused (unless its resume instant
/// has already passed), past its end date, has no usable slots, or no
/// qualifying day exists within the scan horizon.
pub fn next_occurrence(
    rule: &RecurrenceRule,
    reference: DateTime<Utc>,
    tz: Tz,
) -> Option<DateTime<Utc>> {
    if !rule.active {
        return None;
    }
    if rule.paused {
        match rule.resume_at {
            Some(resume_at) if resume_at <= reference => {}
            _ => return None,
        }
    }

    let times = rule.sorted_times();
    if times.is_empty() {
        return None;
    }

    let today = reference.with_timezone(&tz).date_naive();
    let mut first_day = today.max(rule.start_date);
    if let Some(cycle) = &rule.cycle {
        if cycle.active_days == 0 {
            return None;
        }
        first_day = first_day.max(cycle.anchor);
    }

    if past_end(rule, first_day) {
        return None;
    }
    if first_day > today {
        return scan_from(rule, tz, &times, first_day, reference);
    }

    if let Some(cycle) = &rule.cycle {
        let elapsed = (today - cycle.anchor).num_days();
        let length = cycle.length();
        if elapsed % length >= i64::from(cycle.active_days) {
            let next_window = cycle.anchor + Duration::days((elapsed / length + 1) * length);
            if past_end(rule, next_window) {
                return None;
            }
            return earliest_on(tz, next_window, &times, reference);
        }
    }

    if day_qualifies(rule, today) {
        if let Some(instant) = earliest_on(tz, today, &times, reference) {
            return Some(instant);
        }
    }
    scan_from(rule, tz, &times, today + Duration::days(1), reference)
}

/// Earliest qualifying slot on or after `from`, within the scan horizon.
fn scan_from(
    rule: &RecurrenceRule,
    tz: Tz,
    times: &[NaiveTime],
    from: NaiveDate,
    reference: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    for offset in 0..MAX_SCAN_DAYS {
        let date = from + Duration::days(offset);
        if past_end(rule, date) {
            return None;
        }
        if day_qualifies(rule, date) {
            if let Some(instant) = earliest_on(tz, date, times, reference) {
                return Some(instant);
            }
        }
    }
    None
}

/// Compares resolved instants rather than wall-clock times, since a slot
/// shifted out of a DST gap can land after a later slot.
fn earliest_on(
    tz: Tz,
    date: NaiveDate,
    times: &[NaiveTime],
    reference: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    times
        .iter()
        .filter_map(|time| slot_instant(tz, date, *time))
        .filter(|instant| *instant > reference)
        .min()
}

/// Converts a wall-clock slot to an instant. Ambiguous local times take the
/// earlier instant; times inside a DST gap move forward one hour.
pub fn slot_instant(tz: Tz, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
    let naive = date.and_time(time);
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(value) => Some(value.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
        LocalResult::None => tz
            .from_local_datetime(&(naive + Duration::hours(1)))
            .earliest()
            .map(|value| value.with_timezone(&Utc)),
    }
}

fn past_end(rule: &RecurrenceRule, date: NaiveDate) -> bool {
    rule.end_date().is_some_and(|end| date > end)
}

fn day_qualifies(rule: &RecurrenceRule, date: NaiveDate) -> bool {
    if date < rule.start_date {
        return false;
    }
    if let Some(cycle) = &rule.cycle {
        let elapsed = (date - cycle.anchor).num_days();
        if elapsed < 0 || elapsed % cycle.length() >= i64::from(cycle.active_days) {
            return false;
        }
    }
    match rule.frequency {
        Frequency::Daily | Frequency::AsNeeded => true,
        Frequency::Weekly => {
            rule.days_of_week.is_empty() || rule.days_of_week.contains(&date.weekday())
        }
        Frequency::CustomInterval => {
            let interval = i64::from(rule.interval_days.unwrap_or(1).max(1));
            (date - rule.start_date).num_days() % interval == 0
        }
    }
}
