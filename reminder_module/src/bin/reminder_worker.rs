use std::sync::Arc;

use chrono::Utc;
use reminder_module::adherence::SqliteAdherenceGate;
use reminder_module::config::ReminderConfig;
use reminder_module::dispatch::ModuleDispatcher;
use reminder_module::escalation::{EscalationMachine, SqliteEscalationStore};
use reminder_module::queue::SqliteTaskQueue;
use reminder_module::schedule::SqliteScheduleStore;
use reminder_module::{start_workers, NextFire, ReminderScheduler};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = ReminderConfig::from_env()?;
    info!("reminder state at {}", config.db_path.display());

    let schedules = Arc::new(SqliteScheduleStore::new(&config.db_path)?);
    let queue = Arc::new(SqliteTaskQueue::new(&config.db_path, config.retry)?);
    let escalations =
        EscalationMachine::new(Arc::new(SqliteEscalationStore::new(&config.db_path)?));
    let gate = Arc::new(SqliteAdherenceGate::new(&config.db_path)?);

    let scheduler = Arc::new(
        ReminderScheduler::new(
            schedules.clone(),
            queue,
            escalations,
            Arc::new(ModuleDispatcher),
            gate,
        )
        .with_external_timeout(config.external_timeout),
    );

    // Queued tasks survive restarts; this only re-seeds schedules whose chain
    // was lost (e.g. every dose fell inside the downtime).
    let now = Utc::now();
    let mut seeded = 0usize;
    for schedule_id in schedules.list_ids()? {
        match scheduler.schedule_next_by_id(schedule_id, now) {
            Ok(NextFire::Scheduled(_)) => seeded += 1,
            Ok(_) => {}
            Err(err) => warn!("could not schedule {}: {}", schedule_id, err),
        }
    }
    info!("seeded {} schedule(s) without a queued reminder", seeded);

    let mut workers = start_workers(scheduler, config.worker_options());
    info!("reminder worker {} started", config.worker_id);

    tokio::signal::ctrl_c().await?;
    info!("shutting down reminder worker");
    workers.stop_and_join();
    Ok(())
}
