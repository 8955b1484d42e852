//! Observability infrastructure for the reclaimer
//!
//! Provides:
//! - Prometheus metrics (run outcomes, current phase, per-VM decisions, drain polls)
//! - Structured JSON logging with tracing

use crate::controller::Phase;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Run durations range from seconds to many hours
const RUN_DURATION_BUCKETS: &[f64] = &[
    1.0, 10.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0, 14400.0, 28800.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<ReclaimerMetricsInner> = OnceLock::new();

struct ReclaimerMetricsInner {
    runs_total: IntCounterVec,
    phase: IntGauge,
    vms_capped: IntCounter,
    vms_converged: IntCounter,
    vms_stalled: IntCounter,
    drain_polls: IntCounter,
    collaborator_errors: IntCounter,
    run_duration_seconds: Histogram,
}

impl ReclaimerMetricsInner {
    fn new() -> Self {
        Self {
            runs_total: register_int_counter_vec!(
                "reclaimer_runs_total",
                "Reclamation runs by result",
                &["result"]
            )
            .expect("Failed to register runs_total"),

            phase: register_int_gauge!(
                "reclaimer_phase",
                "Current phase of the active run (0 idle .. 5 done, 6 failed)"
            )
            .expect("Failed to register phase"),

            vms_capped: register_int_counter!(
                "reclaimer_vms_capped_total",
                "VMs that received a temporary memory limit"
            )
            .expect("Failed to register vms_capped"),

            vms_converged: register_int_counter!(
                "reclaimer_vms_converged_total",
                "Capped VMs whose idle ratio dropped under the threshold"
            )
            .expect("Failed to register vms_converged"),

            vms_stalled: register_int_counter!(
                "reclaimer_vms_stalled_total",
                "Capped VMs abandoned after repeated non-improving polls"
            )
            .expect("Failed to register vms_stalled"),

            drain_polls: register_int_counter!(
                "reclaimer_drain_polls_total",
                "Polls spent waiting for ballooned memory to drain"
            )
            .expect("Failed to register drain_polls"),

            collaborator_errors: register_int_counter!(
                "reclaimer_collaborator_errors_total",
                "Failed calls to the management plane"
            )
            .expect("Failed to register collaborator_errors"),

            run_duration_seconds: register_histogram!(
                "reclaimer_run_duration_seconds",
                "Wall-clock duration of completed and failed runs",
                RUN_DURATION_BUCKETS.to_vec()
            )
            .expect("Failed to register run_duration_seconds"),
        }
    }
}

/// Reclaimer metrics for Prometheus exposition
///
/// A lightweight handle to the global metrics instance; clones share the
/// same underlying metrics.
#[derive(Clone)]
pub struct ReclaimerMetrics {
    _private: (),
}

impl Default for ReclaimerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ReclaimerMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ReclaimerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ReclaimerMetricsInner {
        GLOBAL_METRICS.get_or_init(ReclaimerMetricsInner::new)
    }

    pub fn set_phase(&self, phase: Phase) {
        self.inner().phase.set(phase.ordinal());
    }

    pub fn inc_runs(&self, result: &str) {
        self.inner().runs_total.with_label_values(&[result]).inc();
    }

    pub fn inc_vms_capped(&self) {
        self.inner().vms_capped.inc();
    }

    pub fn inc_vms_converged(&self) {
        self.inner().vms_converged.inc();
    }

    pub fn inc_vms_stalled(&self) {
        self.inner().vms_stalled.inc();
    }

    pub fn inc_drain_polls(&self) {
        self.inner().drain_polls.inc();
    }

    pub fn inc_collaborator_errors(&self) {
        self.inner().collaborator_errors.inc();
    }

    pub fn observe_run_duration(&self, duration_secs: f64) {
        self.inner().run_duration_seconds.observe(duration_secs);
    }
}

/// Structured logger for reclamation events
///
/// Every event carries a stable `event` field and the cluster name so runs
/// can be followed in aggregated JSON logs.
#[derive(Clone, Debug)]
pub struct StructuredLogger {
    cluster: String,
}

impl StructuredLogger {
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
        }
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn log_run_started(&self, run_id: &str, hosts: usize) {
        info!(
            event = "run_started",
            cluster = %self.cluster,
            run_id = %run_id,
            hosts = hosts,
            "Reclamation run started"
        );
    }

    pub fn log_phase(&self, run_id: &str, phase: Phase) {
        info!(
            event = "phase_entered",
            cluster = %self.cluster,
            run_id = %run_id,
            phase = %phase,
            "Entered phase"
        );
    }

    pub fn log_host_option(&self, host: &str, key: &str, previous: Option<i64>, value: i64) {
        info!(
            event = "host_option_updated",
            cluster = %self.cluster,
            host = %host,
            key = %key,
            previous = ?previous,
            value = value,
            "Updated host option"
        );
    }

    pub fn log_vm_capped(&self, vm_id: &str, idle_ratio: f64, limit_mb: i64) {
        info!(
            event = "vm_capped",
            cluster = %self.cluster,
            vm = %vm_id,
            idle_ratio = idle_ratio,
            limit_mb = limit_mb,
            "Setting temporary memory limit"
        );
    }

    pub fn log_vm_poll(&self, vm_id: &str, idle_ratio: f64, threshold: f64, stall_count: u32) {
        info!(
            event = "vm_poll",
            cluster = %self.cluster,
            vm = %vm_id,
            idle_ratio = idle_ratio,
            threshold = threshold,
            stall_count = stall_count,
            "Waiting for idle ratio to drop below threshold"
        );
    }

    pub fn log_vm_converged(&self, vm_id: &str, idle_ratio: f64, polls: u32) {
        info!(
            event = "vm_converged",
            cluster = %self.cluster,
            vm = %vm_id,
            idle_ratio = idle_ratio,
            polls = polls,
            "VM idle ratio converged"
        );
    }

    pub fn log_vm_stalled(&self, vm_id: &str, idle_ratio: f64, polls: u32) {
        warn!(
            event = "vm_stalled",
            cluster = %self.cluster,
            vm = %vm_id,
            idle_ratio = idle_ratio,
            polls = polls,
            "VM failed to respond to ballooning limit"
        );
    }

    pub fn log_vm_limit_cleared(&self, vm_id: &str, limit_mb: i64) {
        info!(
            event = "vm_limit_cleared",
            cluster = %self.cluster,
            vm = %vm_id,
            limit_mb = limit_mb,
            "Removed temporary memory limit"
        );
    }

    pub fn log_drain_wait(&self, poll: u32, ballooned_vms: &[String]) {
        info!(
            event = "drain_wait",
            cluster = %self.cluster,
            poll = poll,
            ballooned_vms = ?ballooned_vms,
            "VMs still have ballooned memory"
        );
    }

    pub fn log_run_completed(&self, run_id: &str, capped: usize, stalled: usize, elapsed_secs: f64) {
        info!(
            event = "run_completed",
            cluster = %self.cluster,
            run_id = %run_id,
            capped = capped,
            stalled = stalled,
            elapsed_secs = elapsed_secs,
            "Reclamation run completed"
        );
    }

    pub fn log_run_failed(&self, run_id: &str, phase: Phase, error: &str) {
        warn!(
            event = "run_failed",
            cluster = %self.cluster,
            run_id = %run_id,
            phase = %phase,
            error = %error,
            "Reclamation run failed; hosts and VMs may need manual cleanup"
        );
    }

    pub fn log_startup(&self, version: &str) {
        info!(
            event = "agent_started",
            cluster = %self.cluster,
            agent_version = %version,
            "Reclaimer agent started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            cluster = %self.cluster,
            reason = %reason,
            "Reclaimer agent shutting down"
        );
    }
}
