//! In-process campaign lock serialising mutating migration operations
//!
//! The runner takes a database-level lock inside `migrate()`/`repair()`/`baseline()`. This lock
//! only guarantees that one process never starts two mutating operations at once, and lets
//! read-only operations tell whether their snapshot raced with a mutation.

use crate::migration::GuardError;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Interval between acquisition attempts while another campaign holds the lock
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Phase of the current (or last) migration campaign
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignPhase {
    Idle,
    Validating,
    Repairing,
    Executing,
    Done,
    Failed,
}

impl CampaignPhase {
    /// Whether `next` is a legal successor of `self` within one campaign
    pub fn can_transition_to(self, next: CampaignPhase) -> bool {
        use CampaignPhase::*;
        matches!(
            (self, next),
            (Idle | Done | Failed, Validating)
                | (Idle | Done | Failed, Repairing)
                | (Idle | Done | Failed, Executing)
                | (Validating, Repairing)
                | (Validating, Executing)
                | (Validating, Done)
                | (Validating, Failed)
                | (Repairing, Executing)
                | (Repairing, Done)
                | (Repairing, Failed)
                | (Executing, Validating)
                | (Executing, Done)
                | (Executing, Failed)
        )
    }
}

impl fmt::Display for CampaignPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CampaignPhase::Idle => "idle",
            CampaignPhase::Validating => "validating",
            CampaignPhase::Repairing => "repairing",
            CampaignPhase::Executing => "executing",
            CampaignPhase::Done => "done",
            CampaignPhase::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// How far a read-only result can be trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Consistency {
    /// No mutating operation was in flight while the snapshot was taken
    Consistent,
    /// A mutating operation was in flight; the snapshot may already be stale
    BestEffort,
}

/// The lock itself; share it between the manager and its read-only services.
#[derive(Debug)]
pub struct CampaignLock {
    held: AtomicBool,
    phase: Mutex<CampaignPhase>,
}

impl Default for CampaignLock {
    fn default() -> Self {
        Self::new()
    }
}

impl CampaignLock {
    pub fn new() -> Self {
        Self {
            held: AtomicBool::new(false),
            phase: Mutex::new(CampaignPhase::Idle),
        }
    }

    /// Acquire the lock, waiting up to `timeout` for the current holder to finish.
    ///
    /// # Errors
    ///
    /// Returns `GuardError::LockTimeout` if the lock is still held when the timeout expires.
    pub fn acquire(
        &self,
        operation: &str,
        timeout: Duration,
    ) -> Result<CampaignGuard<'_>, GuardError> {
        let start = Instant::now();

        loop {
            if self
                .held
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                log::debug!("Campaign lock acquired for {}", operation);
                return Ok(CampaignGuard {
                    lock: self,
                    operation: operation.to_string(),
                });
            }

            if start.elapsed() >= timeout {
                return Err(GuardError::LockTimeout(format!(
                    "could not start {} within {} seconds (current phase: {})",
                    operation,
                    timeout.as_secs(),
                    self.phase()
                )));
            }

            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Whether a mutating operation is currently in flight
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    pub fn consistency(&self) -> Consistency {
        if self.is_held() {
            Consistency::BestEffort
        } else {
            Consistency::Consistent
        }
    }

    pub fn phase(&self) -> CampaignPhase {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_phase(&self, next: CampaignPhase) {
        let mut phase = self.phase.lock().unwrap_or_else(|e| e.into_inner());
        if !phase.can_transition_to(next) {
            log::warn!("Unexpected campaign transition {} -> {}", *phase, next);
        }
        *phase = next;
    }
}

/// Guard that releases the campaign lock when dropped.
///
/// Dropping a guard whose campaign never reached `Done` or `Failed` marks it `Failed`, so an
/// early return can never leave the phase stuck mid-campaign.
pub struct CampaignGuard<'a> {
    lock: &'a CampaignLock,
    operation: String,
}

impl CampaignGuard<'_> {
    pub fn transition(&self, next: CampaignPhase) {
        log::debug!("{}: campaign phase -> {}", self.operation, next);
        self.lock.set_phase(next);
    }

    pub fn phase(&self) -> CampaignPhase {
        self.lock.phase()
    }
}

impl Drop for CampaignGuard<'_> {
    fn drop(&mut self) {
        if !matches!(
            self.lock.phase(),
            CampaignPhase::Idle | CampaignPhase::Done | CampaignPhase::Failed
        ) {
            self.lock.set_phase(CampaignPhase::Failed);
        }
        self.lock.held.store(false, Ordering::Release);
        log::debug!("Campaign lock released by {}", self.operation);
    }
}
