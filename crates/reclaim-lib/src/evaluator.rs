//! Idle-ratio evaluation
//!
//! Decides whether a VM holds more idle memory than the configured threshold
//! and sizes the temporary limit that squeezes it back under.

use crate::models::{IdleEvaluation, VmSnapshot};
use crate::thresholds::ReclamationThresholds;

/// Idle ratio reported for powered-off VMs
pub const POWERED_OFF_RATIO: f64 = -1.0;

/// Evaluate a VM snapshot against the idle threshold.
///
/// The ratio uses configured memory as its denominator, while the proposed
/// limit scales headroom off host usage: `guest + threshold * host`. A zero
/// configured size yields `+inf`, which always exceeds the threshold.
pub fn evaluate(vm: &VmSnapshot, thresholds: &ReclamationThresholds) -> IdleEvaluation {
    if !vm.is_powered_on() {
        return IdleEvaluation {
            exceeds_threshold: false,
            proposed_limit_mb: None,
            idle_ratio: POWERED_OFF_RATIO,
        };
    }

    let idle_ratio = vm.idle_ratio().unwrap_or(f64::INFINITY);
    let headroom = (vm.host_usage_mb as f64 * thresholds.idle_threshold) as i64;

    IdleEvaluation {
        exceeds_threshold: idle_ratio > thresholds.idle_threshold,
        proposed_limit_mb: Some(vm.guest_usage_mb + headroom),
        idle_ratio,
    }
}
