pub mod adherence;
pub mod channel;
pub mod config;
pub mod dispatch;
pub mod escalation;
pub mod queue;
pub mod recurrence;
pub mod schedule;
pub(crate) mod storage;

mod reminder;

pub use reminder::{
    start_workers, NextFire, ReminderScheduler, SchedulerError, SweepPolicy, SweepReport,
    TaskReport, TaskResult, WorkerControl, WorkerOptions, DEFAULT_EXTERNAL_TIMEOUT,
};
pub use storage::StoreError;
