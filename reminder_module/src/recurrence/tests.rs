use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc, Weekday};
use chrono_tz::Tz;

use super::*;

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
}

fn daily(slots: &[(u32, u32)]) -> RecurrenceRule {
    RecurrenceRule::daily(
        date(2026, 1, 1),
        slots.iter().map(|(h, m)| TimeSlot::new(*h, *m)).collect(),
    )
}

#[test]
fn daily_returns_later_slot_today() {
    let rule = daily(&[(8, 0), (20, 0)]);
    let next = next_occurrence(&rule, utc(2026, 3, 10, 9, 30), Tz::UTC);
    assert_eq!(next, Some(utc(2026, 3, 10, 20, 0)));
}

#[test]
fn daily_rolls_over_to_first_slot_tomorrow() {
    let rule = daily(&[(20, 0), (8, 0)]);
    let next = next_occurrence(&rule, utc(2026, 3, 10, 21, 0), Tz::UTC);
    assert_eq!(next, Some(utc(2026, 3, 11, 8, 0)));
}

#[test]
fn slot_equal_to_reference_is_not_returned() {
    let rule = daily(&[(8, 0)]);
    let next = next_occurrence(&rule, utc(2026, 3, 10, 8, 0), Tz::UTC);
    assert_eq!(next, Some(utc(2026, 3, 11, 8, 0)));
}

#[test]
fn daily_result_is_within_one_day_of_reference() {
    let rule = daily(&[(0, 15), (6, 45), (13, 0), (23, 59)]);
    let mut reference = utc(2026, 5, 1, 0, 0);
    for _ in 0..200 {
        let next = next_occurrence(&rule, reference, Tz::UTC).expect("next");
        assert!(next > reference);
        assert!(next - reference <= Duration::hours(24));
        reference += Duration::minutes(37);
    }
}

#[test]
fn empty_slots_yield_none() {
    let rule = daily(&[]);
    assert_eq!(next_occurrence(&rule, utc(2026, 3, 10, 9, 0), Tz::UTC), None);
}

#[test]
fn inactive_rule_yields_none() {
    let mut rule = daily(&[(8, 0)]);
    rule.active = false;
    assert_eq!(next_occurrence(&rule, utc(2026, 3, 10, 7, 0), Tz::UTC), None);
}

#[test]
fn paused_rule_respects_resume_time() {
    let mut rule = daily(&[(8, 0)]);
    rule.paused = true;
    assert_eq!(next_occurrence(&rule, utc(2026, 3, 10, 7, 0), Tz::UTC), None);

    rule.resume_at = Some(utc(2026, 3, 12, 0, 0));
    assert_eq!(next_occurrence(&rule, utc(2026, 3, 10, 7, 0), Tz::UTC), None);

    rule.resume_at = Some(utc(2026, 3, 9, 0, 0));
    assert_eq!(
        next_occurrence(&rule, utc(2026, 3, 10, 7, 0), Tz::UTC),
        Some(utc(2026, 3, 10, 8, 0))
    );
}

#[test]
fn end_date_is_inclusive() {
    let mut rule = daily(&[(8, 0), (20, 0)]);
    rule.duration = DurationPolicy::Until {
        end_date: date(2026, 3, 10),
    };
    assert_eq!(
        next_occurrence(&rule, utc(2026, 3, 10, 9, 0), Tz::UTC),
        Some(utc(2026, 3, 10, 20, 0))
    );
    assert_eq!(next_occurrence(&rule, utc(2026, 3, 10, 21, 0), Tz::UTC), None);
    assert_eq!(next_occurrence(&rule, utc(2026, 3, 11, 1, 0), Tz::UTC), None);
}

#[test]
fn weekly_rule_picks_next_listed_weekday() {
    // 2026-03-10 is a Tuesday.
    let mut rule = daily(&[(9, 0)]);
    rule.frequency = Frequency::Weekly;
    rule.days_of_week = vec![Weekday::Mon, Weekday::Fri];
    assert_eq!(
        next_occurrence(&rule, utc(2026, 3, 10, 8, 0), Tz::UTC),
        Some(utc(2026, 3, 13, 9, 0))
    );
    assert_eq!(
        next_occurrence(&rule, utc(2026, 3, 13, 10, 0), Tz::UTC),
        Some(utc(2026, 3, 16, 9, 0))
    );
}

#[test]
fn weekly_rule_without_days_behaves_daily() {
    let mut rule = daily(&[(9, 0)]);
    rule.frequency = Frequency::Weekly;
    assert_eq!(
        next_occurrence(&rule, utc(2026, 3, 10, 10, 0), Tz::UTC),
        Some(utc(2026, 3, 11, 9, 0))
    );
}

#[test]
fn custom_interval_counts_from_start_date() {
    let mut rule = daily(&[(7, 30)]);
    rule.frequency = Frequency::CustomInterval;
    rule.interval_days = Some(3);
    rule.start_date = date(2026, 3, 1);
    // Qualifying days: Mar 1, 4, 7, 10, ...
    assert_eq!(
        next_occurrence(&rule, utc(2026, 3, 2, 0, 0), Tz::UTC),
        Some(utc(2026, 3, 4, 7, 30))
    );
    assert_eq!(
        next_occurrence(&rule, utc(2026, 3, 10, 7, 0), Tz::UTC),
        Some(utc(2026, 3, 10, 7, 30))
    );
}

#[test]
fn no_dose_before_start_date() {
    let mut rule = daily(&[(8, 0)]);
    rule.start_date = date(2026, 4, 1);
    assert_eq!(
        next_occurrence(&rule, utc(2026, 3, 20, 12, 0), Tz::UTC),
        Some(utc(2026, 4, 1, 8, 0))
    );
}

#[test]
fn cycle_break_day_jumps_to_next_active_window() {
    let mut rule = daily(&[(8, 0), (18, 0)]);
    rule.cycle = Some(CycleRule {
        active_days: 5,
        break_days: 2,
        anchor: date(2026, 3, 1),
    });
    // Day 6 (0-indexed) is Mar 7, inside the break; day 7 is Mar 8.
    assert_eq!(
        next_occurrence(&rule, utc(2026, 3, 7, 6, 0), Tz::UTC),
        Some(utc(2026, 3, 8, 8, 0))
    );
}

#[test]
fn cycle_last_active_day_skips_break_window() {
    let mut rule = daily(&[(8, 0)]);
    rule.cycle = Some(CycleRule {
        active_days: 5,
        break_days: 2,
        anchor: date(2026, 3, 1),
    });
    // Mar 5 is day 4, the last active day of the first window.
    assert_eq!(
        next_occurrence(&rule, utc(2026, 3, 5, 9, 0), Tz::UTC),
        Some(utc(2026, 3, 8, 8, 0))
    );
}

#[test]
fn cycle_before_anchor_waits_for_start_date() {
    let mut rule = daily(&[(8, 0)]);
    rule.start_date = date(2026, 3, 10);
    rule.cycle = Some(CycleRule {
        active_days: 5,
        break_days: 2,
        anchor: date(2026, 3, 1),
    });
    // Mar 10 is day 9 of the cycle, an active day.
    assert_eq!(
        next_occurrence(&rule, utc(2026, 2, 20, 12, 0), Tz::UTC),
        Some(utc(2026, 3, 10, 8, 0))
    );
}

#[test]
fn cycle_break_window_never_lands_before_start_date() {
    let mut rule = daily(&[(8, 0)]);
    rule.start_date = date(2026, 3, 20);
    rule.cycle = Some(CycleRule {
        active_days: 5,
        break_days: 2,
        anchor: date(2026, 3, 1),
    });
    // Mar 7 is a break day; the next window opens Mar 8, which is before the
    // start date. Mar 20 and 21 are break days, Mar 22 opens a window.
    assert_eq!(
        next_occurrence(&rule, utc(2026, 3, 7, 12, 0), Tz::UTC),
        Some(utc(2026, 3, 22, 8, 0))
    );
}

#[test]
fn slots_are_evaluated_in_the_schedule_time_zone() {
    let tz: Tz = "America/New_York".parse().unwrap();
    let rule = daily(&[(8, 0)]);
    // 11:00 UTC on Mar 10 is 07:00 EDT.
    assert_eq!(
        next_occurrence(&rule, utc(2026, 3, 10, 11, 0), tz),
        Some(utc(2026, 3, 10, 12, 0))
    );
}

#[test]
fn slot_inside_dst_gap_moves_forward() {
    let tz: Tz = "America/New_York".parse().unwrap();
    let rule = daily(&[(2, 30)]);
    // Clocks jump from 02:00 to 03:00 on 2026-03-08; 03:30 EDT is 07:30 UTC.
    assert_eq!(
        next_occurrence(&rule, utc(2026, 3, 8, 5, 0), tz),
        Some(utc(2026, 3, 8, 7, 30))
    );
}

#[test]
fn validate_rejects_bad_rules() {
    let mut rule = daily(&[(24, 0)]);
    assert_eq!(
        rule.validate(),
        Err(RecurrenceError::InvalidSlot { hour: 24, minute: 0 })
    );

    rule = daily(&[(8, 0), (8, 0)]);
    assert!(matches!(
        rule.validate(),
        Err(RecurrenceError::DuplicateSlot { .. })
    ));

    rule = daily(&[(8, 0)]);
    rule.frequency = Frequency::CustomInterval;
    assert_eq!(rule.validate(), Err(RecurrenceError::InvalidInterval));

    rule = daily(&[(8, 0)]);
    rule.cycle = Some(CycleRule {
        active_days: 21,
        break_days: 0,
        anchor: date(2026, 1, 1),
    });
    assert!(matches!(
        rule.validate(),
        Err(RecurrenceError::InvalidCycle { .. })
    ));

    assert_eq!(daily(&[(8, 0), (20, 30)]).validate(), Ok(()));
}

#[test]
fn rule_round_trips_through_json() {
    let mut rule = daily(&[(8, 0)]);
    rule.frequency = Frequency::Weekly;
    rule.days_of_week = vec![Weekday::Wed];
    let json = serde_json::to_string(&rule).unwrap();
    assert!(json.contains("\"WEEKLY\""));
    let parsed: RecurrenceRule = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, rule);
}

#[test]
fn shifted_gap_slot_does_not_hide_earlier_slot() {
    let tz: Tz = "America/New_York".parse().unwrap();
    let rule = daily(&[(2, 30), (3, 0)]);
    // On 2026-03-08 02:30 becomes 03:30 EDT (07:30 UTC); 03:00 EDT is 07:00 UTC.
    assert_eq!(
        next_occurrence(&rule, utc(2026, 3, 8, 5, 0), tz),
        Some(utc(2026, 3, 8, 7, 0))
    );
    assert_eq!(
        next_occurrence(&rule, utc(2026, 3, 8, 7, 0), tz),
        Some(utc(2026, 3, 8, 7, 30))
    );
}
