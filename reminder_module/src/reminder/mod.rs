mod core;
mod timeout;
mod types;
mod worker;

pub use self::core::{NextFire, ReminderScheduler, DEFAULT_EXTERNAL_TIMEOUT};
pub use types::{SchedulerError, SweepPolicy, SweepReport, TaskReport, TaskResult};
pub use worker::{start_workers, WorkerControl, WorkerOptions};

#[cfg(test)]
mod tests;
