//! Live view of the reclamation run owned by one agent
//!
//! The tracker also serializes runs: only one run may hold a [`RunGuard`] at
//! a time, and the guard's cancel handle is reachable through the tracker.

use crate::clock::{cancel_pair, CancelHandle, CancelToken};
use crate::controller::{Phase, ReclaimError, RunReport, VmOutcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;

/// Progress of the current (or most recent) run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunProgress {
    pub run_id: Option<String>,
    pub phase: Phase,
    pub started_at: Option<DateTime<Utc>>,
    /// VM currently capped and being polled
    pub watching: Option<String>,
    pub outcomes: Vec<VmOutcome>,
    pub drain_polls: u32,
}

impl Default for RunProgress {
    fn default() -> Self {
        Self {
            run_id: None,
            phase: Phase::Idle,
            started_at: None,
            watching: None,
            outcomes: Vec::new(),
            drain_polls: 0,
        }
    }
}

/// Failure details kept for operators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub run_id: String,
    pub phase: Phase,
    pub message: String,
    pub host: Option<String>,
    pub vm: Option<String>,
    pub failed_at: DateTime<Utc>,
}

impl RunFailure {
    pub fn from_error(run_id: &str, error: &ReclaimError) -> Self {
        Self {
            run_id: run_id.to_string(),
            phase: error.phase(),
            message: error.to_string(),
            host: error.host().map(str::to_string),
            vm: error.vm().map(str::to_string),
            failed_at: Utc::now(),
        }
    }
}

/// Result of the most recent finished run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "result")]
pub enum RunRecord {
    Completed(RunReport),
    Failed(RunFailure),
}

/// Exclusive right to run; releases the tracker when dropped
#[derive(Debug)]
pub struct RunGuard {
    active: Arc<AtomicBool>,
    cancel: Arc<Mutex<Option<CancelHandle>>>,
    token: CancelToken,
}

impl RunGuard {
    pub fn cancel_token(&self) -> CancelToken {
        self.token.clone()
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        match self.cancel.lock() {
            Ok(mut cancel) => *cancel = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
        self.active.store(false, Ordering::SeqCst);
    }
}

/// Shared run state
#[derive(Debug, Clone, Default)]
pub struct RunTracker {
    progress: Arc<RwLock<RunProgress>>,
    last: Arc<RwLock<Option<RunRecord>>>,
    active: Arc<AtomicBool>,
    cancel: Arc<Mutex<Option<CancelHandle>>>,
}

impl RunTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the tracker for a new run, or `None` if one is already active
    pub fn try_begin(&self) -> Option<RunGuard> {
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return None;
        }

        let (handle, token) = cancel_pair();
        match self.cancel.lock() {
            Ok(mut cancel) => *cancel = Some(handle),
            Err(poisoned) => *poisoned.into_inner() = Some(handle),
        }

        Some(RunGuard {
            active: self.active.clone(),
            cancel: self.cancel.clone(),
            token,
        })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Ask the active run to stop; returns false when nothing is running
    pub fn request_cancel(&self) -> bool {
        let cancel = match self.cancel.lock() {
            Ok(cancel) => cancel.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        match cancel {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn start(&self, run_id: &str, started_at: DateTime<Utc>) {
        let mut progress = self.progress.write().await;
        *progress = RunProgress {
            run_id: Some(run_id.to_string()),
            started_at: Some(started_at),
            ..Default::default()
        };
    }

    pub async fn set_phase(&self, phase: Phase) {
        self.progress.write().await.phase = phase;
    }

    pub async fn set_watching(&self, vm_id: Option<&str>) {
        self.progress.write().await.watching = vm_id.map(str::to_string);
    }

    pub async fn record_outcome(&self, outcome: VmOutcome) {
        self.progress.write().await.outcomes.push(outcome);
    }

    pub async fn set_drain_polls(&self, polls: u32) {
        self.progress.write().await.drain_polls = polls;
    }

    pub async fn complete(&self, report: RunReport) {
        self.progress.write().await.watching = None;
        *self.last.write().await = Some(RunRecord::Completed(report));
    }

    pub async fn fail(&self, failure: RunFailure) {
        self.progress.write().await.watching = None;
        *self.last.write().await = Some(RunRecord::Failed(failure));
    }

    pub async fn current(&self) -> RunProgress {
        self.progress.read().await.clone()
    }

    pub async fn last(&self) -> Option<RunRecord> {
        self.last.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::VmDecision;

    #[test]
    fn test_only_one_run_at_a_time() {
        let tracker = RunTracker::new();

        let guard = tracker.try_begin().expect("first run should start");
        assert!(tracker.is_active());
        assert!(tracker.try_begin().is_none());

        drop(guard);
        assert!(!tracker.is_active());
        assert!(tracker.try_begin().is_some());
    }

    #[test]
    fn test_request_cancel_reaches_guard_token() {
        let tracker = RunTracker::new();
        assert!(!tracker.request_cancel());

        let guard = tracker.try_begin().unwrap();
        let token = guard.cancel_token();
        assert!(tracker.request_cancel());
        assert!(token.is_cancelled());

        drop(guard);
        assert!(!tracker.request_cancel());
    }

    #[tokio::test]
    async fn test_progress_updates() {
        let tracker = RunTracker::new();
        tracker.start("run-1", Utc::now()).await;
        tracker.set_phase(Phase::CappingOutliers).await;
        tracker.set_watching(Some("web-01")).await;
        tracker
            .record_outcome(VmOutcome {
                vm_id: "db-01".to_string(),
                decision: VmDecision::Skipped { idle_ratio: 0.05 },
            })
            .await;

        let progress = tracker.current().await;
        assert_eq!(progress.run_id.as_deref(), Some("run-1"));
        assert_eq!(progress.phase, Phase::CappingOutliers);
        assert_eq!(progress.watching.as_deref(), Some("web-01"));
        assert_eq!(progress.outcomes.len(), 1);
    }

    #[tokio::test]
    async fn test_failure_is_recorded_as_last_run() {
        let tracker = RunTracker::new();
        let error = ReclaimError::Cancelled {
            phase: Phase::DrainingBalloons,
            vm: None,
        };
        tracker.fail(RunFailure::from_error("run-2", &error)).await;

        match tracker.last().await {
            Some(RunRecord::Failed(failure)) => {
                assert_eq!(failure.phase, Phase::DrainingBalloons);
                assert_eq!(failure.run_id, "run-2");
            }
            other => panic!("unexpected last run: {:?}", other),
        }
    }
}
