//! Idle-memory reclamation controller
//!
//! A run walks four strictly ordered phases against one cluster:
//!
//! 1. raise the balloon ceiling on every host, then snapshot the VMs
//! 2. cap each idle outlier in turn and watch it converge or stall
//! 3. drop the ceiling to drain every balloon, polling until nothing is ballooned
//! 4. restore the default ceiling
//!
//! Everything is sequential. Any collaborator failure ends the run with a
//! single [`ReclaimError`]; earlier side effects are left in place.

mod convergence;
mod error;
mod report;

pub use convergence::{ConvergenceState, PollVerdict, VmDecision, VmOutcome, WatchedVm};
pub use error::ReclaimError;
pub use report::{HostChange, RunReport};

use crate::clock::{CancelToken, Clock, TokioClock};
use crate::evaluator::evaluate;
use crate::inventory::{HostConfigurer, InventoryReader, VmLimiter};
use crate::models::{Host, MemoryLimit, VmSnapshot};
use crate::observability::{ReclaimerMetrics, StructuredLogger};
use crate::summary::FleetSummary;
use crate::thresholds::ReclamationThresholds;
use crate::tracker::{RunFailure, RunTracker};
use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Controller phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    RaisingCeiling,
    CappingOutliers,
    DrainingBalloons,
    RestoringCeiling,
    Done,
    Failed,
}

impl Phase {
    /// Numeric value exported as a gauge
    pub fn ordinal(&self) -> i64 {
        match self {
            Phase::Idle => 0,
            Phase::RaisingCeiling => 1,
            Phase::CappingOutliers => 2,
            Phase::DrainingBalloons => 3,
            Phase::RestoringCeiling => 4,
            Phase::Done => 5,
            Phase::Failed => 6,
        }
    }

    /// True while a run is in flight
    pub fn is_active(&self) -> bool {
        !matches!(self, Phase::Idle | Phase::Done | Phase::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::RaisingCeiling => "raising_ceiling",
            Phase::CappingOutliers => "capping_outliers",
            Phase::DrainingBalloons => "draining_balloons",
            Phase::RestoringCeiling => "restoring_ceiling",
            Phase::Done => "done",
            Phase::Failed => "failed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Drives one cluster through a reclamation run
pub struct ReclamationController {
    hosts: Arc<dyn HostConfigurer>,
    inventory: Arc<dyn InventoryReader>,
    limiter: Arc<dyn VmLimiter>,
    clock: Arc<dyn Clock>,
    thresholds: ReclamationThresholds,
    cancel: CancelToken,
    logger: StructuredLogger,
    metrics: ReclaimerMetrics,
    tracker: Option<RunTracker>,
    phase: Phase,
    run_id: String,
}

impl ReclamationController {
    pub fn builder() -> ControllerBuilder {
        ControllerBuilder::new()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn thresholds(&self) -> &ReclamationThresholds {
        &self.thresholds
    }

    /// Execute all four phases, returning the report or the first failure
    pub async fn run(&mut self) -> Result<RunReport, ReclaimError> {
        let started = Instant::now();
        let run_id = format!("run-{}", Utc::now().format("%Y%m%dT%H%M%S%.3fZ"));
        self.run_id = run_id.clone();
        let mut report = RunReport::new(&run_id, self.logger.cluster());

        if let Some(tracker) = &self.tracker {
            tracker.start(&run_id, report.started_at).await;
        }

        let result = self.execute(&mut report).await;
        let elapsed = started.elapsed().as_secs_f64();
        self.metrics.observe_run_duration(elapsed);

        match result {
            Ok(()) => {
                report.finished_at = Some(Utc::now());
                self.enter(Phase::Done).await;
                self.metrics.inc_runs("completed");
                self.logger.log_run_completed(
                    &run_id,
                    report.capped(),
                    report.stalled().len(),
                    elapsed,
                );
                if let Some(tracker) = &self.tracker {
                    tracker.complete(report.clone()).await;
                }
                Ok(report)
            }
            Err(error) => {
                let failed_in = self.phase;
                self.enter(Phase::Failed).await;
                let result = if matches!(error, ReclaimError::Cancelled { .. }) {
                    "cancelled"
                } else {
                    "failed"
                };
                self.metrics.inc_runs(result);
                self.logger
                    .log_run_failed(&run_id, failed_in, &error.to_string());
                if let Some(tracker) = &self.tracker {
                    tracker.fail(RunFailure::from_error(&run_id, &error)).await;
                }
                Err(error)
            }
        }
    }

    async fn execute(&mut self, report: &mut RunReport) -> Result<(), ReclaimError> {
        self.enter(Phase::RaisingCeiling).await;
        let hosts = self.list_hosts().await?;
        report.hosts = hosts.iter().map(|h| h.name.clone()).collect();
        self.logger.log_run_started(&report.run_id, hosts.len());

        self.apply_ceiling(&hosts, self.thresholds.high_ceiling, report)
            .await?;

        let snapshot = self.snapshot_vms().await?;
        report.fleet_before = FleetSummary::from_snapshots(&snapshot);
        report.vms = snapshot.into_iter().map(|vm| vm.id).collect();

        self.enter(Phase::CappingOutliers).await;
        for vm_id in &report.vms {
            let outcome = self.reclaim_vm(vm_id).await?;
            if let Some(tracker) = &self.tracker {
                tracker.record_outcome(outcome.clone()).await;
            }
            report.outcomes.push(outcome);
        }

        self.enter(Phase::DrainingBalloons).await;
        self.apply_ceiling(&hosts, self.thresholds.drain_ceiling, report)
            .await?;
        let (drained, polls) = self.wait_for_drain(&report.vms).await?;
        report.drain_polls = polls;
        report.fleet_after = FleetSummary::from_snapshots(&drained);

        self.enter(Phase::RestoringCeiling).await;
        self.apply_ceiling(&hosts, self.thresholds.restore_ceiling, report)
            .await?;

        Ok(())
    }

    async fn enter(&mut self, phase: Phase) {
        self.phase = phase;
        self.metrics.set_phase(phase);
        if phase.is_active() {
            self.logger.log_phase(&self.run_id, phase);
        }
        if let Some(tracker) = &self.tracker {
            tracker.set_phase(phase).await;
        }
    }

    /// Fail fast if cancellation was requested
    fn checkpoint(&self, vm: Option<&str>) -> Result<(), ReclaimError> {
        if self.cancel.is_cancelled() {
            return Err(self.cancelled(vm));
        }
        Ok(())
    }

    fn cancelled(&self, vm: Option<&str>) -> ReclaimError {
        ReclaimError::Cancelled {
            phase: self.phase,
            vm: vm.map(str::to_string),
        }
    }

    /// One poll interval, cut short by cancellation
    async fn wait(&self, vm: Option<&str>) -> Result<(), ReclaimError> {
        self.checkpoint(vm)?;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(self.cancelled(vm)),
            _ = self.clock.sleep(self.thresholds.poll_interval) => Ok(()),
        }
    }

    async fn list_hosts(&self) -> Result<Vec<Host>, ReclaimError> {
        self.checkpoint(None)?;
        self.hosts.list_hosts().await.map_err(|source| {
            self.metrics.inc_collaborator_errors();
            ReclaimError::ListHosts {
                phase: self.phase,
                source,
            }
        })
    }

    /// Apply one ceiling value to every host in order, stopping at the first failure
    async fn apply_ceiling(
        &self,
        hosts: &[Host],
        value: u8,
        report: &mut RunReport,
    ) -> Result<(), ReclaimError> {
        let key = self.thresholds.ceiling_option.as_str();
        let value = i64::from(value);

        for host in hosts {
            self.checkpoint(None)?;
            let previous = self
                .hosts
                .set_host_option(host, key, value)
                .await
                .map_err(|source| {
                    self.metrics.inc_collaborator_errors();
                    ReclaimError::HostOption {
                        phase: self.phase,
                        host: host.name.clone(),
                        key: key.to_string(),
                        value,
                        source,
                    }
                })?;

            self.logger.log_host_option(&host.name, key, previous, value);
            report.host_changes.push(HostChange {
                host: host.name.clone(),
                phase: self.phase,
                key: key.to_string(),
                previous,
                value,
            });
        }
        Ok(())
    }

    /// Membership snapshot for the rest of the run, infrastructure VMs excluded
    async fn snapshot_vms(&self) -> Result<Vec<VmSnapshot>, ReclaimError> {
        self.checkpoint(None)?;
        let vms = self
            .inventory
            .list_vms(&self.thresholds.exclude_prefix)
            .await
            .map_err(|source| {
                self.metrics.inc_collaborator_errors();
                ReclaimError::ListVms {
                    phase: self.phase,
                    source,
                }
            })?;

        Ok(vms
            .into_iter()
            .filter(|vm| !self.thresholds.is_excluded(&vm.id))
            .collect())
    }

    async fn fetch_vm(&self, vm_id: &str) -> Result<VmSnapshot, ReclaimError> {
        self.checkpoint(Some(vm_id))?;
        self.inventory.get_vm(vm_id).await.map_err(|source| {
            self.metrics.inc_collaborator_errors();
            ReclaimError::FetchVm {
                phase: self.phase,
                vm: vm_id.to_string(),
                source,
            }
        })
    }

    async fn set_limit(&self, vm_id: &str, limit: MemoryLimit) -> Result<(), ReclaimError> {
        self.checkpoint(Some(vm_id))?;
        self.limiter
            .set_memory_limit(vm_id, limit)
            .await
            .map_err(|source| {
                self.metrics.inc_collaborator_errors();
                ReclaimError::SetLimit {
                    phase: self.phase,
                    vm: vm_id.to_string(),
                    limit,
                    source,
                }
            })
    }

    /// Evaluate one VM and, if it is an outlier, cap it until it converges or stalls
    async fn reclaim_vm(&self, vm_id: &str) -> Result<VmOutcome, ReclaimError> {
        let snapshot = self.fetch_vm(vm_id).await?;
        let evaluation = evaluate(&snapshot, &self.thresholds);

        let limit_mb = match evaluation.proposed_limit_mb {
            Some(limit_mb) if evaluation.exceeds_threshold => limit_mb,
            _ => {
                debug!(
                    vm = %vm_id,
                    idle_ratio = evaluation.idle_ratio,
                    "VM under idle threshold, skipping"
                );
                return Ok(VmOutcome {
                    vm_id: vm_id.to_string(),
                    decision: VmDecision::Skipped {
                        idle_ratio: evaluation.idle_ratio,
                    },
                });
            }
        };

        self.logger
            .log_vm_capped(vm_id, evaluation.idle_ratio, limit_mb);
        self.set_limit(vm_id, MemoryLimit::Limited(limit_mb)).await?;
        self.metrics.inc_vms_capped();
        if let Some(tracker) = &self.tracker {
            tracker.set_watching(Some(vm_id)).await;
        }

        let mut watched = WatchedVm::new(vm_id, limit_mb, evaluation.idle_ratio);
        let decision = match self.watch(&mut watched).await {
            Ok(decision) => decision,
            Err(error @ ReclaimError::Cancelled { .. }) => {
                self.release_after_cancel(vm_id, limit_mb).await;
                return Err(error);
            }
            Err(error) => return Err(error),
        };

        // Cancellation can land during the final poll's fetch
        match self.set_limit(vm_id, MemoryLimit::Unlimited).await {
            Ok(()) => {}
            Err(error @ ReclaimError::Cancelled { .. }) => {
                self.release_after_cancel(vm_id, limit_mb).await;
                return Err(error);
            }
            Err(error) => return Err(error),
        }
        self.logger.log_vm_limit_cleared(vm_id, limit_mb);
        if let Some(tracker) = &self.tracker {
            tracker.set_watching(None).await;
        }

        Ok(VmOutcome {
            vm_id: vm_id.to_string(),
            decision,
        })
    }

    /// Poll a capped VM until it converges or its stall counter runs out
    async fn watch(&self, watched: &mut WatchedVm) -> Result<VmDecision, ReclaimError> {
        loop {
            self.wait(Some(&watched.vm_id)).await?;
            let snapshot = self.fetch_vm(&watched.vm_id).await?;
            let evaluation = evaluate(&snapshot, &self.thresholds);

            match watched.observe(&evaluation, &self.thresholds) {
                PollVerdict::Converged => {
                    self.metrics.inc_vms_converged();
                    self.logger.log_vm_converged(
                        &watched.vm_id,
                        evaluation.idle_ratio,
                        watched.polls,
                    );
                    return Ok(VmDecision::Converged {
                        limit_mb: watched.limit_mb,
                        initial_ratio: watched.initial_ratio,
                        final_ratio: evaluation.idle_ratio,
                        polls: watched.polls,
                    });
                }
                PollVerdict::GaveUp => {
                    self.metrics.inc_vms_stalled();
                    self.logger.log_vm_stalled(
                        &watched.vm_id,
                        evaluation.idle_ratio,
                        watched.polls,
                    );
                    return Ok(VmDecision::GaveUp {
                        limit_mb: watched.limit_mb,
                        initial_ratio: watched.initial_ratio,
                        final_ratio: evaluation.idle_ratio,
                        polls: watched.polls,
                    });
                }
                PollVerdict::Waiting { stall_count } => {
                    self.logger.log_vm_poll(
                        &watched.vm_id,
                        evaluation.idle_ratio,
                        self.thresholds.idle_threshold,
                        stall_count,
                    );
                }
            }
        }
    }

    /// Clear the in-flight VM's limit after cancellation; the cancellation is
    /// still what the run reports
    async fn release_after_cancel(&self, vm_id: &str, limit_mb: i64) {
        match self
            .limiter
            .set_memory_limit(vm_id, MemoryLimit::Unlimited)
            .await
        {
            Ok(()) => self.logger.log_vm_limit_cleared(vm_id, limit_mb),
            Err(error) => {
                self.metrics.inc_collaborator_errors();
                warn!(
                    vm = %vm_id,
                    limit_mb = limit_mb,
                    error = %error,
                    "Failed to clear memory limit after cancellation"
                );
            }
        }
        if let Some(tracker) = &self.tracker {
            tracker.set_watching(None).await;
        }
    }

    /// Poll every snapshotted VM until none reports ballooned memory
    async fn wait_for_drain(
        &self,
        vm_ids: &[String],
    ) -> Result<(Vec<VmSnapshot>, u32), ReclaimError> {
        let mut polls = 0u32;
        loop {
            self.wait(None).await?;
            polls += 1;
            self.metrics.inc_drain_polls();
            if let Some(tracker) = &self.tracker {
                tracker.set_drain_polls(polls).await;
            }

            let mut snapshots = Vec::with_capacity(vm_ids.len());
            for vm_id in vm_ids {
                snapshots.push(self.fetch_vm(vm_id).await?);
            }

            let ballooned: Vec<String> = snapshots
                .iter()
                .filter(|vm| vm.has_ballooned_memory())
                .map(|vm| vm.id.clone())
                .collect();
            if ballooned.is_empty() {
                return Ok((snapshots, polls));
            }
            self.logger.log_drain_wait(polls, &ballooned);
        }
    }
}

/// Builder for [`ReclamationController`]
pub struct ControllerBuilder {
    hosts: Option<Arc<dyn HostConfigurer>>,
    inventory: Option<Arc<dyn InventoryReader>>,
    limiter: Option<Arc<dyn VmLimiter>>,
    clock: Arc<dyn Clock>,
    thresholds: ReclamationThresholds,
    cancel: CancelToken,
    cluster: String,
    tracker: Option<RunTracker>,
}

impl ControllerBuilder {
    pub fn new() -> Self {
        Self {
            hosts: None,
            inventory: None,
            limiter: None,
            clock: Arc::new(TokioClock),
            thresholds: ReclamationThresholds::default(),
            cancel: CancelToken::never(),
            cluster: "default".to_string(),
            tracker: None,
        }
    }

    /// Use one backend for all three collaborators
    pub fn fleet<F>(self, fleet: Arc<F>) -> Self
    where
        F: HostConfigurer + InventoryReader + VmLimiter + 'static,
    {
        self.host_configurer(fleet.clone())
            .inventory(fleet.clone())
            .limiter(fleet)
    }

    pub fn host_configurer(mut self, hosts: Arc<dyn HostConfigurer>) -> Self {
        self.hosts = Some(hosts);
        self
    }

    pub fn inventory(mut self, inventory: Arc<dyn InventoryReader>) -> Self {
        self.inventory = Some(inventory);
        self
    }

    pub fn limiter(mut self, limiter: Arc<dyn VmLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn thresholds(mut self, thresholds: ReclamationThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = cluster.into();
        self
    }

    pub fn tracker(mut self, tracker: RunTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn build(self) -> Result<ReclamationController> {
        let hosts = self
            .hosts
            .ok_or_else(|| anyhow::anyhow!("Host configurer is required"))?;
        let inventory = self
            .inventory
            .ok_or_else(|| anyhow::anyhow!("Inventory reader is required"))?;
        let limiter = self
            .limiter
            .ok_or_else(|| anyhow::anyhow!("VM limiter is required"))?;
        self.thresholds.validate()?;

        Ok(ReclamationController {
            hosts,
            inventory,
            limiter,
            clock: self.clock,
            thresholds: self.thresholds,
            cancel: self.cancel,
            logger: StructuredLogger::new(self.cluster),
            metrics: ReclaimerMetrics::new(),
            tracker: self.tracker,
            phase: Phase::Idle,
            run_id: String::new(),
        })
    }
}

impl Default for ControllerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
