use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::adherence::{Acknowledgment, AdherenceGate};
use crate::channel::Channel;
use crate::dispatch::{
    all_failed, ChannelOutcome, NotificationDispatcher, NotificationPayload, Priority,
};
use crate::escalation::{
    DoseKey, EscalationLevel, EscalationMachine, EscalationRule, EscalationState, Resolution,
};
use crate::queue::{
    EnqueueOutcome, FailureOutcome, QueueName, QueueStats, QueuedTask, TaskPayload, TaskQueue,
    TaskRequest,
};
use crate::recurrence::next_occurrence;
use crate::schedule::{Recipient, Schedule, ScheduleStore};
use crate::storage::retention_cutoff;

use super::timeout::call_with_timeout;
use super::types::{SchedulerError, SweepPolicy, SweepReport, TaskReport, TaskResult};

pub const DEFAULT_EXTERNAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of trying to queue a schedule's next dose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextFire {
    Scheduled(DateTime<Utc>),
    AlreadyQueued(DateTime<Utc>),
    PastDue(DateTime<Utc>),
    NoneDue,
    Cancelled,
}

impl NextFire {
    pub fn instant(&self) -> Option<DateTime<Utc>> {
        match self {
            NextFire::Scheduled(at) | NextFire::AlreadyQueued(at) => Some(*at),
            NextFire::PastDue(_) | NextFire::NoneDue | NextFire::Cancelled => None,
        }
    }
}

/// Orchestrates the reminder and escalation queues. Constructed once by the
/// process entry point and shared by the workers.
#[derive(Clone)]
pub struct ReminderScheduler {
    schedules: Arc<dyn ScheduleStore>,
    queue: Arc<dyn TaskQueue>,
    escalations: EscalationMachine,
    dispatcher: Arc<dyn NotificationDispatcher>,
    gate: Arc<dyn AdherenceGate>,
    external_timeout: Duration,
}

impl ReminderScheduler {
    pub fn new(
        schedules: Arc<dyn ScheduleStore>,
        queue: Arc<dyn TaskQueue>,
        escalations: EscalationMachine,
        dispatcher: Arc<dyn NotificationDispatcher>,
        gate: Arc<dyn AdherenceGate>,
    ) -> Self {
        Self {
            schedules,
            queue,
            escalations,
            dispatcher,
            gate,
            external_timeout: DEFAULT_EXTERNAL_TIMEOUT,
        }
    }

    pub fn with_external_timeout(mut self, timeout: Duration) -> Self {
        self.external_timeout = timeout;
        self
    }

    pub fn escalations(&self) -> &EscalationMachine {
        &self.escalations
    }

    /// Queues the schedule's next dose after now.
    pub fn schedule_next(&self, schedule: &Schedule) -> Result<NextFire, SchedulerError> {
        self.schedule_next_at(schedule, Utc::now())
    }

    pub fn schedule_next_at(
        &self,
        schedule: &Schedule,
        now: DateTime<Utc>,
    ) -> Result<NextFire, SchedulerError> {
        let generation = self.queue.generation(schedule.id)?;
        self.enqueue_fire(schedule, now, now, generation)
    }

    /// Loads a stored schedule and queues its next dose.
    pub fn schedule_next_by_id(
        &self,
        schedule_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<NextFire, SchedulerError> {
        let schedule = self
            .schedules
            .get(schedule_id)?
            .ok_or(SchedulerError::ScheduleNotFound(schedule_id))?;
        self.schedule_next_at(&schedule, now)
    }

    /// Drops every pending reminder and escalation task of the schedule. Tasks
    /// already executing finish, but cannot queue follow-ups.
    pub fn cancel_all(&self, schedule_id: Uuid) -> Result<usize, SchedulerError> {
        let removed = self.queue.cancel_schedule(schedule_id)?;
        info!(
            "cancelled {} pending task(s) for schedule {}",
            removed, schedule_id
        );
        self.note_next_reminder(schedule_id, None);
        Ok(removed)
    }

    /// Call after any edit to the schedule's recurrence or ladder.
    pub fn reschedule(&self, schedule: &Schedule) -> Result<NextFire, SchedulerError> {
        self.reschedule_at(schedule, Utc::now())
    }

    pub fn reschedule_at(
        &self,
        schedule: &Schedule,
        now: DateTime<Utc>,
    ) -> Result<NextFire, SchedulerError> {
        self.cancel_all(schedule.id)?;
        self.schedule_next_at(schedule, now)
    }

    pub fn queue_stats(&self) -> Result<QueueStats, SchedulerError> {
        self.queue_stats_at(Utc::now())
    }

    /// Counts per queue; pending tasks due by `now` are waiting, later ones
    /// delayed.
    pub fn queue_stats_at(&self, now: DateTime<Utc>) -> Result<QueueStats, SchedulerError> {
        Ok(self.queue.stats(now)?)
    }

    /// Hook for the adherence recorder: resolves the dose's escalation so any
    /// pending check becomes a no-op.
    pub fn on_acknowledged(
        &self,
        schedule_id: Uuid,
        dose_at: DateTime<Utc>,
        reason: Resolution,
    ) -> Result<Option<EscalationState>, SchedulerError> {
        self.on_acknowledged_at(schedule_id, dose_at, reason, Utc::now())
    }

    pub fn on_acknowledged_at(
        &self,
        schedule_id: Uuid,
        dose_at: DateTime<Utc>,
        reason: Resolution,
        now: DateTime<Utc>,
    ) -> Result<Option<EscalationState>, SchedulerError> {
        let key = DoseKey::new(schedule_id, dose_at);
        let state = self.escalations.resolve(&key, reason, now)?;
        if state.is_none() {
            debug!("acknowledgment for {} has no escalation to resolve", key);
        }
        Ok(state)
    }

    pub fn claim(
        &self,
        queue: QueueName,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<QueuedTask>, SchedulerError> {
        Ok(self.queue.claim_next(queue, now, worker_id)?)
    }

    /// Runs a claimed task and records the outcome in the queue.
    pub fn execute(&self, task: QueuedTask, now: DateTime<Utc>) -> Result<TaskReport, SchedulerError> {
        let result = match self.run_task(&task, now) {
            Ok(()) => {
                self.queue.mark_done(&task.id, now)?;
                TaskResult::Done
            }
            Err(err) => {
                let message = err.to_string();
                match self.queue.mark_failed(&task.id, &message, now)? {
                    FailureOutcome::Retrying { attempts, retry_at } => {
                        warn!(
                            "task {} failed (attempt {}), retrying at {}: {}",
                            task.key, attempts, retry_at, message
                        );
                        TaskResult::Retrying { retry_at }
                    }
                    FailureOutcome::Failed { attempts } => {
                        error!(
                            "task {} permanently failed after {} attempt(s): {}",
                            task.key, attempts, message
                        );
                        TaskResult::Failed { error: message }
                    }
                }
            }
        };
        Ok(TaskReport { task, result })
    }

    /// Claims and executes the earliest due task of `queue`, if any.
    pub fn process_next(
        &self,
        queue: QueueName,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskReport>, SchedulerError> {
        match self.claim(queue, worker_id, now)? {
            Some(task) => Ok(Some(self.execute(task, now)?)),
            None => Ok(None),
        }
    }

    pub fn run_task(&self, task: &QueuedTask, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        match &task.payload {
            TaskPayload::FireReminder {
                schedule_id,
                dose_at,
            } => self.fire_reminder(task, *schedule_id, *dose_at, now),
            TaskPayload::AdvanceEscalation {
                schedule_id,
                dose_at,
                step,
            } => self.advance_escalation(task, *schedule_id, *dose_at, *step, now),
        }
    }

    pub fn sweep(
        &self,
        now: DateTime<Utc>,
        policy: &SweepPolicy,
    ) -> Result<SweepReport, SchedulerError> {
        let expired_states = self
            .escalations
            .expire_stale(now, policy.unresolved_retention)?;
        let purged_states = self
            .escalations
            .purge_resolved(now, policy.resolved_retention)?;
        let abandoned_tasks = self.queue.fail_expired_leases(now)?;
        if abandoned_tasks > 0 {
            error!(
                "{} task(s) abandoned by crashed workers marked failed",
                abandoned_tasks
            );
        }
        let purged_tasks = self
            .queue
            .purge_finished_before(retention_cutoff(now, policy.finished_task_retention))?;
        Ok(SweepReport {
            expired_states,
            purged_states,
            abandoned_tasks,
            purged_tasks,
        })
    }

    fn fire_reminder(
        &self,
        task: &QueuedTask,
        schedule_id: Uuid,
        dose_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        let Some(schedule) = self.load_live_schedule(task, schedule_id)? else {
            return Ok(());
        };
        let key = DoseKey::new(schedule_id, dose_at);
        let ladder = &schedule.ladder;
        let state = self.escalations.start(key, ladder, now)?;
        let fresh = !state.resolved && state.checks == 0;

        if fresh && ladder.len() > 1 {
            let check_at = check_time(now, ladder.first())?;
            self.enqueue_escalation(schedule_id, dose_at, 0, check_at, task.generation, now)?;
        }

        if let Err(err) = self.schedules.record_last_fired(schedule_id, dose_at) {
            warn!("failed to record last fired for {}: {}", schedule_id, err);
        }

        if let NextFire::PastDue(_) =
            self.enqueue_fire(&schedule, dose_at, now, task.generation)?
        {
            // Ran late enough to miss the following slot; continue from now.
            self.enqueue_fire(&schedule, now, now, task.generation)?;
        }

        if !fresh {
            debug!("reminder for {} already escalating; not resending", key);
            return Ok(());
        }
        let first = ladder.first();
        self.notify(
            &schedule,
            dose_at,
            first.level,
            &first.channels,
            first.notify_caregiver,
        )
    }

    fn advance_escalation(
        &self,
        task: &QueuedTask,
        schedule_id: Uuid,
        dose_at: DateTime<Utc>,
        step: u32,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        let Some(schedule) = self.load_live_schedule(task, schedule_id)? else {
            return Ok(());
        };
        let key = DoseKey::new(schedule_id, dose_at);
        let Some(current) = self.escalations.get(&key)? else {
            debug!("no escalation tracked for {}; nothing to advance", key);
            return Ok(());
        };
        if current.resolved {
            debug!("escalation {} already resolved", key);
            return Ok(());
        }

        if let Some(ack) = self.acknowledgment(&key)? {
            self.escalations.resolve(&key, ack.resolution(), now)?;
            return Ok(());
        }

        let ladder = &schedule.ladder;
        let state = if current.checks == step {
            match self.escalations.advance_step(&key, ladder, step, now)? {
                Some(state) => state,
                None => return Ok(()),
            }
        } else if current.checks == step + 1 {
            // Check already applied by an earlier delivery of this task whose
            // notification failed; only the notification is repeated.
            current
        } else {
            debug!(
                "stale escalation check {} for {} (at check {})",
                step, key, current.checks
            );
            return Ok(());
        };

        if state.resolved {
            info!(
                "escalation for {} exhausted the ladder ({})",
                key,
                state.resolution.map(|r| r.as_str()).unwrap_or("resolved")
            );
            return Ok(());
        }

        let Some(rule) = self.escalations.current_rule(&state, ladder) else {
            return Ok(());
        };
        let check_at = check_time(now, rule)?;
        self.enqueue_escalation(
            schedule_id,
            dose_at,
            state.checks,
            check_at,
            task.generation,
            now,
        )?;

        self.notify(
            &schedule,
            dose_at,
            state.level,
            &rule.channels,
            self.escalations.requires_caregiver(&state, ladder),
        )
    }

    /// Loads the schedule unless it is gone or the task predates a cancel.
    fn load_live_schedule(
        &self,
        task: &QueuedTask,
        schedule_id: Uuid,
    ) -> Result<Option<Schedule>, SchedulerError> {
        let current = self.queue.generation(schedule_id)?;
        if current != task.generation {
            info!(
                "skipping {} from cancelled generation {} (now {})",
                task.key, task.generation, current
            );
            return Ok(None);
        }
        let schedule = self.schedules.get(schedule_id)?;
        if schedule.is_none() {
            info!("schedule {} no longer exists; dropping {}", schedule_id, task.key);
        }
        Ok(schedule)
    }

    fn enqueue_fire(
        &self,
        schedule: &Schedule,
        reference: DateTime<Utc>,
        now: DateTime<Utc>,
        generation: u64,
    ) -> Result<NextFire, SchedulerError> {
        let Some(next) = next_occurrence(&schedule.recurrence, reference, schedule.timezone) else {
            debug!("schedule {} has no upcoming dose", schedule.id);
            self.note_next_reminder(schedule.id, None);
            return Ok(NextFire::NoneDue);
        };
        if next <= now {
            warn!(
                "skipping past-due dose {} for schedule {}",
                next, schedule.id
            );
            return Ok(NextFire::PastDue(next));
        }

        let request = TaskRequest {
            payload: TaskPayload::FireReminder {
                schedule_id: schedule.id,
                dose_at: next,
            },
            run_at: next,
            generation,
        };
        match self.queue.enqueue(&request, now)? {
            EnqueueOutcome::Inserted => {
                info!("scheduled reminder for {} at {}", schedule.id, next);
                self.note_next_reminder(schedule.id, Some(next));
                Ok(NextFire::Scheduled(next))
            }
            EnqueueOutcome::Duplicate => {
                debug!("reminder for {} at {} already queued", schedule.id, next);
                Ok(NextFire::AlreadyQueued(next))
            }
            EnqueueOutcome::Stale => {
                info!(
                    "schedule {} was cancelled; not scheduling {}",
                    schedule.id, next
                );
                Ok(NextFire::Cancelled)
            }
        }
    }

    fn enqueue_escalation(
        &self,
        schedule_id: Uuid,
        dose_at: DateTime<Utc>,
        step: u32,
        run_at: DateTime<Utc>,
        generation: u64,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        let request = TaskRequest {
            payload: TaskPayload::AdvanceEscalation {
                schedule_id,
                dose_at,
                step,
            },
            run_at,
            generation,
        };
        match self.queue.enqueue(&request, now)? {
            EnqueueOutcome::Inserted => debug!(
                "escalation check {} for {}@{} due at {}",
                step, schedule_id, dose_at, run_at
            ),
            EnqueueOutcome::Duplicate => {}
            EnqueueOutcome::Stale => info!(
                "schedule {} was cancelled; dropping escalation check {}",
                schedule_id, step
            ),
        }
        Ok(())
    }

    fn notify(
        &self,
        schedule: &Schedule,
        dose_at: DateTime<Utc>,
        level: EscalationLevel,
        channels: &[Channel],
        caregiver: bool,
    ) -> Result<(), SchedulerError> {
        let priority = Priority::for_level(level);
        let mut undelivered = Vec::new();

        let outcomes = self.send(
            schedule.patient.clone(),
            channels,
            priority,
            NotificationPayload::for_patient(schedule, dose_at, level),
        )?;
        if all_failed(&outcomes) {
            undelivered.push(format!("patient {}", schedule.patient.id));
        }

        if caregiver {
            match &schedule.caregiver {
                Some(contact) => {
                    let outcomes = self.send(
                        contact.clone(),
                        channels,
                        priority,
                        NotificationPayload::for_caregiver(schedule, dose_at, level),
                    )?;
                    if all_failed(&outcomes) {
                        undelivered.push(format!("caregiver {}", contact.id));
                    }
                }
                None => warn!(
                    "level {} notifies a caregiver but schedule {} has none",
                    level, schedule.id
                ),
            }
        }

        if undelivered.is_empty() {
            Ok(())
        } else {
            Err(SchedulerError::TaskFailed(format!(
                "{} notification undelivered to {}",
                level,
                undelivered.join(", ")
            )))
        }
    }

    fn send(
        &self,
        recipient: Recipient,
        channels: &[Channel],
        priority: Priority,
        payload: NotificationPayload,
    ) -> Result<Vec<ChannelOutcome>, SchedulerError> {
        let dispatcher = self.dispatcher.clone();
        let channels = channels.to_vec();
        call_with_timeout("dispatch", self.external_timeout, move || {
            dispatcher.send(&recipient, &channels, priority, &payload)
        })
    }

    fn acknowledgment(&self, key: &DoseKey) -> Result<Option<Acknowledgment>, SchedulerError> {
        let gate = self.gate.clone();
        let (schedule_id, dose_at) = (key.schedule_id, key.dose_at);
        let answer = call_with_timeout("adherence", self.external_timeout, move || {
            gate.acknowledgment(schedule_id, dose_at)
        })?;
        Ok(answer?)
    }

    fn note_next_reminder(&self, schedule_id: Uuid, at: Option<DateTime<Utc>>) {
        if let Err(err) = self.schedules.record_next_reminder(schedule_id, at) {
            warn!("failed to record next reminder for {}: {}", schedule_id, err);
        }
    }
}

/// When the check following `rule`'s level is due.
pub(super) fn check_time(
    now: DateTime<Utc>,
    rule: &EscalationRule,
) -> Result<DateTime<Utc>, SchedulerError> {
    now.checked_add_signed(rule.delay()).ok_or_else(|| {
        SchedulerError::TaskFailed(format!(
            "escalation delay {}s at level {} is out of range",
            rule.delay_secs, rule.level
        ))
    })
}
