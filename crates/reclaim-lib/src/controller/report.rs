//! Run report

use super::{Phase, VmDecision, VmOutcome};
use crate::summary::FleetSummary;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One host option change applied during a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostChange {
    pub host: String,
    pub phase: Phase,
    pub key: String,
    pub previous: Option<i64>,
    pub value: i64,
}

/// Everything a completed run did
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub cluster: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub hosts: Vec<String>,
    pub vms: Vec<String>,
    pub host_changes: Vec<HostChange>,
    pub outcomes: Vec<VmOutcome>,
    pub drain_polls: u32,
    pub fleet_before: FleetSummary,
    pub fleet_after: FleetSummary,
}

impl RunReport {
    pub fn new(run_id: impl Into<String>, cluster: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            cluster: cluster.into(),
            started_at: Utc::now(),
            finished_at: None,
            hosts: Vec::new(),
            vms: Vec::new(),
            host_changes: Vec::new(),
            outcomes: Vec::new(),
            drain_polls: 0,
            fleet_before: FleetSummary::default(),
            fleet_after: FleetSummary::default(),
        }
    }

    pub fn capped(&self) -> usize {
        self.outcomes.iter().filter(|o| o.was_capped()).count()
    }

    pub fn converged(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.decision, VmDecision::Converged { .. }))
            .count()
    }

    pub fn stalled(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.decision, VmDecision::GaveUp { .. }))
            .map(|o| o.vm_id.as_str())
            .collect()
    }

    /// Drop in fleet idle memory between the phase-2 snapshot and the drained fleet
    pub fn idle_reduction_mb(&self) -> i64 {
        self.fleet_before.idle_mb - self.fleet_after.idle_mb
    }
}
