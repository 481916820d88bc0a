use std::env;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use crate::queue::RetryPolicy;
use crate::reminder::{SweepPolicy, WorkerOptions};

#[derive(Debug, Clone)]
pub struct ReminderConfig {
    pub db_path: PathBuf,
    pub worker_id: String,
    pub worker_concurrency: usize,
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
    pub external_timeout: Duration,
    pub resolved_retention: Duration,
    pub unresolved_retention: Duration,
    pub finished_task_retention: Duration,
    pub sweep_interval: Duration,
}

impl ReminderConfig {
    pub fn from_env() -> Result<Self, io::Error> {
        dotenvy::dotenv().ok();

        let db_path = match env::var("REMINDER_DB_PATH")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
        {
            Some(raw) => resolve_path(raw)?,
            None => default_db_path()?,
        };

        let retry = RetryPolicy {
            max_attempts: resolve_u64_env("REMINDER_TASK_MAX_ATTEMPTS", 5)
                .try_into()
                .unwrap_or(u32::MAX),
            base_delay: chrono_secs(resolve_u64_env("REMINDER_RETRY_BASE_SECS", 5)),
            max_delay: chrono::Duration::hours(1),
            lease: chrono_secs(resolve_u64_env("REMINDER_TASK_LEASE_SECS", 120)),
        };

        Ok(Self {
            db_path,
            worker_id: resolve_worker_instance_id(),
            worker_concurrency: resolve_u64_env("REMINDER_WORKER_CONCURRENCY", 4)
                .try_into()
                .unwrap_or(usize::MAX),
            poll_interval: Duration::from_millis(resolve_u64_env(
                "REMINDER_POLL_INTERVAL_MS",
                1000,
            )),
            retry,
            external_timeout: Duration::from_secs(resolve_u64_env(
                "REMINDER_EXTERNAL_TIMEOUT_SECS",
                10,
            )),
            resolved_retention: Duration::from_secs(resolve_u64_env(
                "REMINDER_RESOLVED_RETENTION_SECS",
                3600,
            )),
            unresolved_retention: Duration::from_secs(resolve_u64_env(
                "REMINDER_UNRESOLVED_RETENTION_SECS",
                172_800,
            )),
            finished_task_retention: Duration::from_secs(resolve_u64_env(
                "REMINDER_FINISHED_TASK_RETENTION_SECS",
                86_400,
            )),
            sweep_interval: Duration::from_secs(resolve_u64_env(
                "REMINDER_SWEEP_INTERVAL_SECS",
                300,
            )),
        })
    }

    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            worker_id: self.worker_id.clone(),
            max_concurrency: self.worker_concurrency,
            poll_interval: self.poll_interval,
            sweep_interval: self.sweep_interval,
            sweep: SweepPolicy {
                resolved_retention: chrono_secs(self.resolved_retention.as_secs()),
                unresolved_retention: chrono_secs(self.unresolved_retention.as_secs()),
                finished_task_retention: chrono_secs(self.finished_task_retention.as_secs()),
            },
        }
    }
}

fn chrono_secs(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1000).min(i64::MAX / 1000))
}

fn resolve_u64_env(key: &str, default_value: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default_value)
}

fn resolve_worker_instance_id() -> String {
    for key in ["WORKER_INSTANCE_ID", "HOSTNAME"] {
        if let Ok(value) = env::var(key) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    format!("pid-{}", std::process::id())
}

fn default_db_path() -> Result<PathBuf, io::Error> {
    let home = dirs::home_dir()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "home directory not found"))?;
    Ok(home.join(".reminder").join("state").join("reminders.db"))
}

fn resolve_path(raw: String) -> Result<PathBuf, io::Error> {
    let path = PathBuf::from(raw);
    if path.is_absolute() {
        Ok(path)
    } else {
        Ok(env::current_dir()?.join(path))
    }
}
