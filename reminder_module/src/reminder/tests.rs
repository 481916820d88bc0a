use super::*;
use crate::adherence::{Acknowledgment, SqliteAdherenceGate};
use crate::channel::Channel;
use crate::dispatch::{
    Audience, ChannelOutcome, DispatchError, NotificationDispatcher, NotificationPayload, Priority,
};
use crate::escalation::{
    DoseKey, EscalationLadder, EscalationLevel, EscalationMachine, EscalationRule, Resolution,
    SqliteEscalationStore,
};
use crate::queue::{QueueName, RetryPolicy, SqliteTaskQueue, TaskPayload, TaskQueue};
use crate::recurrence::{RecurrenceRule, TimeSlot};
use crate::schedule::{Recipient, Schedule, ScheduleStore, SqliteScheduleStore};

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use send_notifications_module::SendReceipt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;
use tempfile::TempDir;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Sent {
    recipient: String,
    channels: Vec<Channel>,
    level: EscalationLevel,
    audience: Audience,
}

#[derive(Default)]
struct RecordingDispatcher {
    sent: Mutex<Vec<Sent>>,
    fail: AtomicBool,
    delay_ms: AtomicU64,
}

impl RecordingDispatcher {
    fn sent(&self) -> Vec<Sent> {
        self.sent
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .clone()
    }
}

impl NotificationDispatcher for RecordingDispatcher {
    fn send(
        &self,
        recipient: &Recipient,
        channels: &[Channel],
        _priority: Priority,
        payload: &NotificationPayload,
    ) -> Vec<ChannelOutcome> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(StdDuration::from_millis(delay));
        }
        let fail = self.fail.load(Ordering::SeqCst);
        if !fail {
            self.sent
                .lock()
                .unwrap_or_else(|poison| poison.into_inner())
                .push(Sent {
                    recipient: recipient.id.clone(),
                    channels: channels.to_vec(),
                    level: payload.level,
                    audience: payload.audience,
                });
        }
        channels
            .iter()
            .map(|channel| ChannelOutcome {
                channel: *channel,
                result: if fail {
                    Err(DispatchError::MissingAddress {
                        recipient: recipient.id.clone(),
                        channel: *channel,
                    })
                } else {
                    Ok(SendReceipt::default())
                },
            })
            .collect()
    }
}

struct Harness {
    _temp: TempDir,
    scheduler: ReminderScheduler,
    schedules: Arc<SqliteScheduleStore>,
    queue: Arc<SqliteTaskQueue>,
    dispatcher: Arc<RecordingDispatcher>,
    gate: Arc<SqliteAdherenceGate>,
}

impl Harness {
    fn new() -> Self {
        Self::with_timeout(StdDuration::from_secs(5))
    }

    fn with_timeout(timeout: StdDuration) -> Self {
        let temp = TempDir::new().expect("tempdir");
        let db_path = temp.path().join("state").join("reminders.db");
        let schedules = Arc::new(SqliteScheduleStore::new(&db_path).expect("schedules"));
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::seconds(5),
            max_delay: Duration::minutes(5),
            lease: Duration::minutes(2),
        };
        let queue = Arc::new(SqliteTaskQueue::new(&db_path, policy).expect("queue"));
        let escalations = EscalationMachine::new(Arc::new(
            SqliteEscalationStore::new(&db_path).expect("escalations"),
        ));
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let gate = Arc::new(SqliteAdherenceGate::new(&db_path).expect("gate"));
        let scheduler = ReminderScheduler::new(
            schedules.clone(),
            queue.clone(),
            escalations,
            dispatcher.clone(),
            gate.clone(),
        )
        .with_external_timeout(timeout);
        Self {
            _temp: temp,
            scheduler,
            schedules,
            queue,
            dispatcher,
            gate,
        }
    }

    fn store(&self, schedule: &Schedule) {
        self.schedules
            .upsert(schedule, at(0, 0))
            .expect("store schedule");
    }

    fn drain(&self, queue: QueueName, now: DateTime<Utc>) -> Vec<TaskReport> {
        let mut reports = Vec::new();
        while let Some(report) = self
            .scheduler
            .process_next(queue, "test-worker", now)
            .expect("process")
        {
            reports.push(report);
        }
        reports
    }

    fn pending(&self, schedule_id: uuid::Uuid) -> Vec<TaskPayload> {
        self.queue
            .pending_for_schedule(schedule_id)
            .expect("pending")
            .into_iter()
            .map(|task| task.payload)
            .collect()
    }
}

fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 10, hour, minute, 0)
        .single()
        .expect("valid timestamp")
}

fn three_level_ladder() -> EscalationLadder {
    EscalationLadder::new(vec![
        EscalationRule::new(
            EscalationLevel::Gentle,
            StdDuration::ZERO,
            1,
            false,
            vec![Channel::Push],
        ),
        EscalationRule::new(
            EscalationLevel::Repeat,
            StdDuration::from_secs(15 * 60),
            2,
            false,
            vec![Channel::Push],
        ),
        EscalationRule::new(
            EscalationLevel::Sms,
            StdDuration::from_secs(30 * 60),
            1,
            true,
            vec![Channel::Sms],
        ),
    ])
    .expect("ladder")
}

fn schedule(slots: Vec<TimeSlot>) -> Schedule {
    let start = NaiveDate::from_ymd_opt(2025, 3, 1).expect("date");
    let mut schedule = Schedule::new(
        "Atorvastatin",
        Recipient::new("patient-1"),
        chrono_tz::UTC,
        RecurrenceRule::daily(start, slots),
    );
    schedule.caregiver = Some(Recipient::new("caregiver-1"));
    schedule.ladder = three_level_ladder();
    schedule
}

fn fire(schedule: &Schedule, dose_at: DateTime<Utc>) -> TaskPayload {
    TaskPayload::FireReminder {
        schedule_id: schedule.id,
        dose_at,
    }
}

fn check(schedule: &Schedule, dose_at: DateTime<Utc>, step: u32) -> TaskPayload {
    TaskPayload::AdvanceEscalation {
        schedule_id: schedule.id,
        dose_at,
        step,
    }
}

#[test]
fn schedule_next_queues_the_next_slot_once() {
    let harness = Harness::new();
    let schedule = schedule(vec![TimeSlot::new(8, 0), TimeSlot::new(20, 0)]);
    harness.store(&schedule);

    let next = harness
        .scheduler
        .schedule_next_at(&schedule, at(9, 0))
        .expect("schedule");
    assert_eq!(next, NextFire::Scheduled(at(20, 0)));
    let again = harness
        .scheduler
        .schedule_next_at(&schedule, at(9, 30))
        .expect("schedule");
    assert_eq!(again, NextFire::AlreadyQueued(at(20, 0)));

    assert_eq!(harness.pending(schedule.id), vec![fire(&schedule, at(20, 0))]);
    let stored = harness
        .schedules
        .get(schedule.id)
        .expect("get")
        .expect("stored");
    assert_eq!(stored.next_reminder_at, Some(at(20, 0)));
}

#[test]
fn inactive_or_empty_rules_queue_nothing() {
    let harness = Harness::new();
    let mut inactive = schedule(vec![TimeSlot::new(8, 0)]);
    inactive.recurrence.active = false;
    let empty = schedule(Vec::new());

    for schedule in [&inactive, &empty] {
        let next = harness
            .scheduler
            .schedule_next_at(schedule, at(7, 0))
            .expect("schedule");
        assert_eq!(next, NextFire::NoneDue);
        assert!(harness.pending(schedule.id).is_empty());
    }
}

#[test]
fn firing_notifies_starts_escalation_and_queues_successor() {
    let harness = Harness::new();
    let schedule = schedule(vec![TimeSlot::new(8, 0), TimeSlot::new(20, 0)]);
    harness.store(&schedule);
    harness
        .scheduler
        .schedule_next_at(&schedule, at(7, 0))
        .expect("schedule");

    let reports = harness.drain(QueueName::Reminders, at(8, 0));
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].result, TaskResult::Done);

    assert_eq!(
        harness.dispatcher.sent(),
        vec![Sent {
            recipient: "patient-1".to_string(),
            channels: vec![Channel::Push],
            level: EscalationLevel::Gentle,
            audience: Audience::Patient,
        }]
    );
    let state = harness
        .scheduler
        .escalations()
        .get(&DoseKey::new(schedule.id, at(8, 0)))
        .expect("get")
        .expect("started");
    assert_eq!(state.level, EscalationLevel::Gentle);
    assert_eq!(state.attempts, 0);

    assert_eq!(
        harness.pending(schedule.id),
        vec![check(&schedule, at(8, 0), 0), fire(&schedule, at(20, 0))]
    );
    let stored = harness
        .schedules
        .get(schedule.id)
        .expect("get")
        .expect("stored");
    assert_eq!(stored.last_fired_at, Some(at(8, 0)));
}

#[test]
fn single_level_ladder_never_escalates() {
    let harness = Harness::new();
    let mut schedule = schedule(vec![TimeSlot::new(8, 0)]);
    schedule.ladder = EscalationLadder::new(vec![EscalationRule::new(
        EscalationLevel::Gentle,
        StdDuration::ZERO,
        1,
        false,
        vec![Channel::Push],
    )])
    .expect("ladder");
    harness.store(&schedule);
    harness
        .scheduler
        .schedule_next_at(&schedule, at(7, 0))
        .expect("schedule");

    harness.drain(QueueName::Reminders, at(8, 0));
    let successor = at(8, 0) + Duration::days(1);
    assert_eq!(harness.pending(schedule.id), vec![fire(&schedule, successor)]);
}

#[test]
fn late_fire_skips_past_due_successor() {
    let harness = Harness::new();
    let schedule = schedule(vec![TimeSlot::new(8, 0), TimeSlot::new(20, 0)]);
    harness.store(&schedule);
    harness
        .scheduler
        .schedule_next_at(&schedule, at(7, 0))
        .expect("schedule");

    // Worker was down from before 08:00 until after 20:00.
    harness.drain(QueueName::Reminders, at(21, 0));
    let pending = harness.pending(schedule.id);
    assert!(pending.contains(&fire(&schedule, at(8, 0) + Duration::days(1))));
    assert!(!pending.contains(&fire(&schedule, at(20, 0))));
}

#[test]
fn cancel_drops_pending_and_blocks_in_flight_follow_ups() {
    let harness = Harness::new();
    let schedule = schedule(vec![TimeSlot::new(8, 0), TimeSlot::new(20, 0)]);
    harness.store(&schedule);
    harness
        .scheduler
        .schedule_next_at(&schedule, at(7, 0))
        .expect("schedule");

    let in_flight = harness
        .scheduler
        .claim(QueueName::Reminders, "test-worker", at(8, 0))
        .expect("claim")
        .expect("due");
    assert_eq!(harness.scheduler.cancel_all(schedule.id).expect("cancel"), 0);

    let report = harness
        .scheduler
        .execute(in_flight, at(8, 0))
        .expect("execute");
    assert_eq!(report.result, TaskResult::Done);
    assert!(harness.pending(schedule.id).is_empty());
    assert!(harness.dispatcher.sent().is_empty());

    let next = harness
        .scheduler
        .reschedule_at(&schedule, at(8, 1))
        .expect("reschedule");
    assert_eq!(next, NextFire::Scheduled(at(20, 0)));
    assert_eq!(harness.pending(schedule.id), vec![fire(&schedule, at(20, 0))]);
}

#[test]
fn cancel_removes_escalation_checks_too() {
    let harness = Harness::new();
    let schedule = schedule(vec![TimeSlot::new(8, 0)]);
    harness.store(&schedule);
    harness
        .scheduler
        .schedule_next_at(&schedule, at(7, 0))
        .expect("schedule");
    harness.drain(QueueName::Reminders, at(8, 0));
    assert_eq!(harness.pending(schedule.id).len(), 2);

    assert_eq!(harness.scheduler.cancel_all(schedule.id).expect("cancel"), 2);
    assert!(harness.drain(QueueName::Escalations, at(9, 0)).is_empty());
}

#[test]
fn dispatch_failure_retries_without_double_advancing() {
    let harness = Harness::new();
    let schedule = schedule(vec![TimeSlot::new(8, 0)]);
    harness.store(&schedule);
    harness
        .scheduler
        .schedule_next_at(&schedule, at(7, 0))
        .expect("schedule");
    harness.drain(QueueName::Reminders, at(8, 0));

    harness.dispatcher.fail.store(true, Ordering::SeqCst);
    let reports = harness.drain(QueueName::Escalations, at(8, 0));
    assert_eq!(
        reports[0].result,
        TaskResult::Retrying {
            retry_at: at(8, 0) + Duration::seconds(5)
        }
    );
    let key = DoseKey::new(schedule.id, at(8, 0));
    let state = harness
        .scheduler
        .escalations()
        .get(&key)
        .expect("get")
        .expect("state");
    assert_eq!(state.level, EscalationLevel::Repeat);
    assert_eq!(state.checks, 1);
    // The next check is queued even though this level's message failed.
    assert!(harness
        .pending(schedule.id)
        .contains(&check(&schedule, at(8, 0), 1)));

    harness.dispatcher.fail.store(false, Ordering::SeqCst);
    let retry_at = at(8, 0) + Duration::seconds(5);
    let reports = harness.drain(QueueName::Escalations, retry_at);
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].result, TaskResult::Done);

    let state = harness
        .scheduler
        .escalations()
        .get(&key)
        .expect("get")
        .expect("state");
    assert_eq!(state.checks, 1);
    assert_eq!(state.attempts, 0);
    let levels: Vec<EscalationLevel> = harness
        .dispatcher
        .sent()
        .into_iter()
        .map(|sent| sent.level)
        .collect();
    assert_eq!(levels, vec![EscalationLevel::Gentle, EscalationLevel::Repeat]);
}

#[test]
fn exhausted_retries_mark_task_failed_and_keep_schedule_alive() {
    let harness = Harness::new();
    let schedule = schedule(vec![TimeSlot::new(8, 0)]);
    harness.store(&schedule);
    harness
        .scheduler
        .schedule_next_at(&schedule, at(7, 0))
        .expect("schedule");
    harness.dispatcher.fail.store(true, Ordering::SeqCst);

    let mut now = at(8, 0);
    let mut last = None;
    for _ in 0..3 {
        let reports = harness.drain(QueueName::Reminders, now);
        last = reports.into_iter().last();
        now = now + Duration::minutes(1);
    }
    assert!(matches!(
        last.map(|report| report.result),
        Some(TaskResult::Failed { .. })
    ));

    let stats = harness.scheduler.queue_stats_at(now).expect("stats");
    assert_eq!(stats.reminders.failed, 1);
    // Successor was queued on the first attempt.
    assert_eq!(stats.reminders.delayed, 1);
}

#[test]
fn slow_dispatcher_times_out() {
    let harness = Harness::with_timeout(StdDuration::from_millis(50));
    harness.dispatcher.delay_ms.store(500, Ordering::SeqCst);
    let schedule = schedule(vec![TimeSlot::new(8, 0)]);
    harness.store(&schedule);
    harness
        .scheduler
        .schedule_next_at(&schedule, at(7, 0))
        .expect("schedule");

    let reports = harness.drain(QueueName::Reminders, at(8, 0));
    assert!(matches!(reports[0].result, TaskResult::Retrying { .. }));
    assert!(harness
        .pending(schedule.id)
        .contains(&check(&schedule, at(8, 0), 0)));
}

#[test]
fn acknowledgment_short_circuits_pending_checks() {
    let harness = Harness::new();
    let schedule = schedule(vec![TimeSlot::new(8, 0)]);
    harness.store(&schedule);
    harness
        .scheduler
        .schedule_next_at(&schedule, at(7, 0))
        .expect("schedule");
    harness.drain(QueueName::Reminders, at(8, 0));

    let state = harness
        .scheduler
        .on_acknowledged_at(schedule.id, at(8, 0), Resolution::Skipped, at(8, 0))
        .expect("ack")
        .expect("state");
    assert_eq!(state.resolution, Some(Resolution::Skipped));

    let reports = harness.drain(QueueName::Escalations, at(8, 0));
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].result, TaskResult::Done);
    assert_eq!(harness.dispatcher.sent().len(), 1);
    assert!(harness
        .pending(schedule.id)
        .iter()
        .all(|payload| matches!(payload, TaskPayload::FireReminder { .. })));
}

#[test]
fn gate_acknowledgment_resolves_with_recorded_action() {
    let harness = Harness::new();
    let schedule = schedule(vec![TimeSlot::new(8, 0)]);
    harness.store(&schedule);
    harness
        .scheduler
        .schedule_next_at(&schedule, at(7, 0))
        .expect("schedule");
    harness.drain(QueueName::Reminders, at(8, 0));
    harness
        .gate
        .record(schedule.id, at(8, 0), Acknowledgment::Skipped, at(8, 0))
        .expect("record");

    harness.drain(QueueName::Escalations, at(8, 0));
    let state = harness
        .scheduler
        .escalations()
        .get(&DoseKey::new(schedule.id, at(8, 0)))
        .expect("get")
        .expect("state");
    assert!(state.resolved);
    assert_eq!(state.resolution, Some(Resolution::Skipped));
    assert_eq!(state.level, EscalationLevel::Gentle);
}

#[test]
fn sweep_purges_resolved_states_and_finished_rows() {
    let harness = Harness::new();
    let schedule = schedule(vec![TimeSlot::new(8, 0)]);
    harness.store(&schedule);
    harness
        .scheduler
        .schedule_next_at(&schedule, at(7, 0))
        .expect("schedule");
    harness.drain(QueueName::Reminders, at(8, 0));
    harness
        .scheduler
        .on_acknowledged_at(schedule.id, at(8, 0), Resolution::Taken, at(8, 5))
        .expect("ack");
    harness.drain(QueueName::Escalations, at(8, 5));

    let policy = SweepPolicy::default();
    let early = harness.scheduler.sweep(at(8, 30), &policy).expect("sweep");
    assert_eq!(early, SweepReport::default());

    let later = harness.scheduler.sweep(at(10, 0), &policy).expect("sweep");
    assert_eq!(later.purged_states, 1);
    assert_eq!(later.purged_tasks, 0);
    assert!(harness
        .scheduler
        .escalations()
        .get(&DoseKey::new(schedule.id, at(8, 0)))
        .expect("get")
        .is_none());

    let much_later = harness
        .scheduler
        .sweep(at(8, 0) + Duration::days(2), &policy)
        .expect("sweep");
    assert_eq!(much_later.purged_tasks, 2);
}

#[test]
fn sweep_times_out_unacknowledged_single_level_doses() {
    let harness = Harness::new();
    let mut schedule = schedule(vec![TimeSlot::new(8, 0)]);
    schedule.ladder = EscalationLadder::new(vec![EscalationRule::new(
        EscalationLevel::Gentle,
        StdDuration::ZERO,
        1,
        false,
        vec![Channel::Push],
    )])
    .expect("ladder");
    harness.store(&schedule);
    harness
        .scheduler
        .schedule_next_at(&schedule, at(7, 0))
        .expect("schedule");

    for day in 0..30 {
        let reports = harness.drain(QueueName::Reminders, at(8, 0) + Duration::days(day));
        assert_eq!(reports.len(), 1);
    }
    let escalations = harness.scheduler.escalations();
    assert_eq!(escalations.unresolved_count().expect("count"), 30);

    let report = harness
        .scheduler
        .sweep(at(8, 0) + Duration::days(365), &SweepPolicy::default())
        .expect("sweep");
    assert_eq!(report.expired_states, 30);
    assert_eq!(escalations.unresolved_count().expect("count"), 0);
    let last = escalations
        .get(&DoseKey::new(schedule.id, at(8, 0) + Duration::days(29)))
        .expect("get")
        .expect("state");
    assert_eq!(last.resolution, Some(Resolution::Timeout));
}

#[test]
fn sweep_times_out_escalations_orphaned_by_cancel() {
    let harness = Harness::new();
    let schedule = schedule(vec![TimeSlot::new(8, 0)]);
    harness.store(&schedule);
    harness
        .scheduler
        .schedule_next_at(&schedule, at(7, 0))
        .expect("schedule");
    harness.drain(QueueName::Reminders, at(8, 0));
    harness.scheduler.cancel_all(schedule.id).expect("cancel");

    let policy = SweepPolicy::default();
    let soon = harness.scheduler.sweep(at(12, 0), &policy).expect("sweep");
    assert_eq!(soon.expired_states, 0);

    let later = harness
        .scheduler
        .sweep(at(8, 0) + Duration::days(3), &policy)
        .expect("sweep");
    assert_eq!(later.expired_states, 1);
    assert_eq!(
        harness
            .scheduler
            .escalations()
            .unresolved_count()
            .expect("count"),
        0
    );
}

#[test]
fn overflowing_escalation_delay_fails_instead_of_panicking() {
    let rule = EscalationRule {
        level: EscalationLevel::Repeat,
        delay_secs: u64::MAX,
        max_attempts: 1,
        notify_caregiver: false,
        channels: vec![Channel::Push],
    };
    let err = super::core::check_time(DateTime::<Utc>::MAX_UTC, &rule).expect_err("overflow");
    assert!(matches!(err, SchedulerError::TaskFailed(_)));

    let ok = super::core::check_time(at(8, 0), &three_level_ladder().rules()[1])
        .expect("in range");
    assert!(ok > at(8, 0));
}

#[test]
fn deleted_schedule_tasks_are_dropped() {
    let harness = Harness::new();
    let schedule = schedule(vec![TimeSlot::new(8, 0)]);
    harness.store(&schedule);
    harness
        .scheduler
        .schedule_next_at(&schedule, at(7, 0))
        .expect("schedule");
    harness.schedules.delete(schedule.id).expect("delete");

    let reports = harness.drain(QueueName::Reminders, at(8, 0));
    assert_eq!(reports[0].result, TaskResult::Done);
    assert!(harness.dispatcher.sent().is_empty());
    assert!(matches!(
        harness.scheduler.schedule_next_by_id(schedule.id, at(8, 1)),
        Err(SchedulerError::ScheduleNotFound(_))
    ));
}
