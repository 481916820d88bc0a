use crossbeam_channel::{bounded, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use super::types::SchedulerError;

/// Runs `call` on a helper thread and waits at most `timeout` for it. A call
/// that overruns keeps its thread until it returns; its result is dropped.
pub(crate) fn call_with_timeout<T, F>(
    label: &str,
    timeout: Duration,
    call: F,
) -> Result<T, SchedulerError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (sender, receiver) = bounded(1);
    thread::Builder::new()
        .name(format!("reminder-{}", label))
        .spawn(move || {
            let _ = sender.send(call());
        })
        .map_err(|err| SchedulerError::TaskFailed(format!("spawn {}: {}", label, err)))?;

    match receiver.recv_timeout(timeout) {
        Ok(value) => Ok(value),
        Err(RecvTimeoutError::Timeout) => Err(SchedulerError::Timeout(format!(
            "{} exceeded {}ms",
            label,
            timeout.as_millis()
        ))),
        Err(RecvTimeoutError::Disconnected) => Err(SchedulerError::TaskFailed(format!(
            "{} panicked",
            label
        ))),
    }
}
