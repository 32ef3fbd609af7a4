//! Bounded off-thread execution for runner and snapshot calls

use crate::migration::GuardError;
use crossbeam_channel::{bounded, RecvTimeoutError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Cooperative cancellation flag shared between a caller and its worker
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Run `task` on its own thread and wait at most `timeout` for its result.
///
/// On timeout the worker is left to finish on its own; its result is discarded. Tasks that
/// hold resources must observe a [`CancellationToken`] to stop early.
pub(crate) fn run_with_timeout<T, F>(
    operation: &'static str,
    timeout: Duration,
    task: F,
) -> Result<T, GuardError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, GuardError> + Send + 'static,
{
    let (tx, rx) = bounded(1);

    std::thread::Builder::new()
        .name(format!("schemaguard-{}", operation.to_lowercase()))
        .spawn(move || {
            let _ = tx.send(task());
        })
        .map_err(|e| GuardError::io("worker thread", e))?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => {
            log::warn!("{} did not finish within {}s", operation, timeout.as_secs());
            Err(GuardError::Timeout {
                operation,
                after: timeout,
            })
        }
        Err(RecvTimeoutError::Disconnected) => Err(GuardError::runner(
            operation,
            "worker thread stopped without a result",
        )),
    }
}

/// Run `task` on its own thread, handing it `cancel`, and wait at most `timeout` for it.
///
/// On timeout `cancel` is triggered and the caller blocks until the worker has exited, so
/// nothing started here outlives the call. `task` must observe the token to stop promptly.
pub(crate) fn run_cancellable<T, F>(
    operation: &'static str,
    timeout: Duration,
    cancel: &CancellationToken,
    task: F,
) -> Result<T, GuardError>
where
    T: Send + 'static,
    F: FnOnce(&CancellationToken) -> Result<T, GuardError> + Send + 'static,
{
    let (tx, rx) = bounded(1);
    let token = cancel.clone();

    let handle = std::thread::Builder::new()
        .name(format!("schemaguard-{}", operation.to_lowercase()))
        .spawn(move || {
            let _ = tx.send(task(&token));
        })
        .map_err(|e| GuardError::io("worker thread", e))?;

    let outcome = rx.recv_timeout(timeout);
    if matches!(outcome, Err(RecvTimeoutError::Timeout)) {
        log::warn!(
            "{} did not finish within {}s; cancelling",
            operation,
            timeout.as_secs()
        );
        cancel.cancel();
    }
    let joined = handle.join();

    match outcome {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => match rx.try_recv() {
            Ok(Ok(value)) => {
                log::warn!("{} completed after its deadline", operation);
                Ok(value)
            }
            _ => Err(GuardError::Timeout {
                operation,
                after: timeout,
            }),
        },
        Err(RecvTimeoutError::Disconnected) => Err(GuardError::runner(
            operation,
            if joined.is_err() {
                "worker thread panicked"
            } else {
                "worker thread stopped without a result"
            },
        )),
    }
}
