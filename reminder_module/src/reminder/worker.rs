use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use crate::queue::QueueName;

use super::core::ReminderScheduler;
use super::types::{SweepPolicy, TaskResult};

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub worker_id: String,
    pub max_concurrency: usize,
    pub poll_interval: Duration,
    pub sweep_interval: Duration,
    pub sweep: SweepPolicy,
}

pub struct WorkerControl {
    stop: Arc<AtomicBool>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl WorkerControl {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn stop_and_join(&mut self) {
        self.stop();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

pub(crate) struct ConcurrencyLimiter {
    max: usize,
    in_flight: Mutex<usize>,
}

impl ConcurrencyLimiter {
    pub(crate) fn new(max: usize) -> Self {
        Self {
            max: max.max(1),
            in_flight: Mutex::new(0),
        }
    }

    pub(crate) fn try_acquire(&self) -> bool {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        if *in_flight >= self.max {
            return false;
        }
        *in_flight += 1;
        true
    }

    /// Takes a slot that is handed back when the permit drops, even if the
    /// task thread unwinds.
    pub(crate) fn try_permit(self: &Arc<Self>) -> Option<LimiterPermit> {
        if !self.try_acquire() {
            return None;
        }
        Some(LimiterPermit {
            limiter: Arc::clone(self),
        })
    }

    pub(crate) fn release(&self) {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        if *in_flight > 0 {
            *in_flight -= 1;
        }
    }

    pub(crate) fn in_flight(&self) -> usize {
        *self
            .in_flight
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

pub(crate) struct LimiterPermit {
    limiter: Arc<ConcurrencyLimiter>,
}

impl Drop for LimiterPermit {
    fn drop(&mut self) {
        self.limiter.release();
    }
}

/// Starts the poll thread (claims due tasks from both queues, one execution
/// thread per task up to `max_concurrency`) and the cleanup sweep thread.
pub fn start_workers(scheduler: Arc<ReminderScheduler>, options: WorkerOptions) -> WorkerControl {
    let stop = Arc::new(AtomicBool::new(false));
    let limiter = Arc::new(ConcurrencyLimiter::new(options.max_concurrency));
    let mut handles = Vec::with_capacity(2);

    {
        let scheduler = scheduler.clone();
        let stop = stop.clone();
        let limiter = limiter.clone();
        let worker_id = options.worker_id.clone();
        let poll_interval = options.poll_interval;
        let handle = thread::spawn(move || {
            info!(
                "reminder worker {} polling every {:?}",
                worker_id, poll_interval
            );
            let mut at_capacity = false;
            while !stop.load(Ordering::Relaxed) {
                for queue in QueueName::ALL {
                    loop {
                        let Some(permit) = limiter.try_permit() else {
                            if !at_capacity {
                                info!(
                                    "reminder worker at capacity ({} running)",
                                    limiter.in_flight()
                                );
                                at_capacity = true;
                            }
                            break;
                        };
                        at_capacity = false;
                        let task = match scheduler.claim(queue, &worker_id, Utc::now()) {
                            Ok(Some(task)) => task,
                            Ok(None) => break,
                            Err(err) => {
                                error!("claiming from {} failed: {}", queue, err);
                                break;
                            }
                        };
                        debug!("worker {} claimed {}", worker_id, task.key);
                        let scheduler = scheduler.clone();
                        thread::spawn(move || {
                            let _permit = permit;
                            let key = task.key.clone();
                            match scheduler.execute(task, Utc::now()) {
                                Ok(report) => {
                                    if report.result == TaskResult::Done {
                                        debug!("task {} done", key);
                                    }
                                }
                                Err(err) => error!("settling task {} failed: {}", key, err),
                            }
                        });
                    }
                }
                thread::sleep(poll_interval);
            }
        });
        handles.push(handle);
    }

    {
        let scheduler = scheduler.clone();
        let stop = stop.clone();
        let poll_interval = options.poll_interval;
        let sweep_interval = options.sweep_interval;
        let policy = options.sweep;
        let handle = thread::spawn(move || {
            let mut last_sweep: Option<Instant> = None;
            while !stop.load(Ordering::Relaxed) {
                let due = last_sweep.map_or(true, |at| at.elapsed() >= sweep_interval);
                if due {
                    match scheduler.sweep(Utc::now(), &policy) {
                        Ok(report) => debug!(
                            "sweep timed out {} and purged {} state(s), {} task row(s); {} abandoned",
                            report.expired_states,
                            report.purged_states,
                            report.purged_tasks,
                            report.abandoned_tasks
                        ),
                        Err(err) => error!("cleanup sweep failed: {}", err),
                    }
                    last_sweep = Some(Instant::now());
                }
                thread::sleep(poll_interval);
            }
        });
        handles.push(handle);
    }

    WorkerControl { stop, handles }
}
