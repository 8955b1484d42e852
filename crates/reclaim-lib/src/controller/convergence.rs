//! Per-VM convergence and stall detection
//!
//! While a VM is capped the controller re-evaluates it after every poll
//! interval. A poll whose idle ratio is not at least `stall_epsilon` below the
//! previous observation counts as a stall; any meaningful improvement resets
//! the count. The first poll has no previous observation and counts as a stall,
//! and a non-finite ratio can never count as an improvement.

use crate::models::{idle_ratio_serde, IdleEvaluation};
use crate::thresholds::ReclamationThresholds;
use serde::{Deserialize, Serialize};

/// Ephemeral per-VM tracking state
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConvergenceState {
    pub previous_ratio: Option<f64>,
    pub stall_count: u32,
}

impl ConvergenceState {
    /// Record a new ratio and return the updated stall count
    pub fn record(&mut self, ratio: f64, stall_epsilon: f64) -> u32 {
        let improved = match self.previous_ratio {
            Some(previous) => ratio.is_finite() && ratio <= previous - stall_epsilon,
            None => false,
        };

        if improved {
            self.stall_count = 0;
        } else {
            self.stall_count += 1;
        }
        self.previous_ratio = Some(ratio);
        self.stall_count
    }
}

/// Outcome of one convergence poll
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PollVerdict {
    /// Ratio dropped to or below the threshold
    Converged,
    /// Still above threshold; keep watching
    Waiting { stall_count: u32 },
    /// Stall counter reached its limit
    GaveUp,
}

/// A VM the controller is currently watching
#[derive(Debug, Clone)]
pub struct WatchedVm {
    pub vm_id: String,
    pub limit_mb: i64,
    pub initial_ratio: f64,
    pub polls: u32,
    pub state: ConvergenceState,
}

impl WatchedVm {
    pub fn new(vm_id: impl Into<String>, limit_mb: i64, initial_ratio: f64) -> Self {
        Self {
            vm_id: vm_id.into(),
            limit_mb,
            initial_ratio,
            polls: 0,
            state: ConvergenceState::default(),
        }
    }

    /// Fold one fresh evaluation into the watch state
    pub fn observe(
        &mut self,
        evaluation: &IdleEvaluation,
        thresholds: &ReclamationThresholds,
    ) -> PollVerdict {
        self.polls += 1;

        if !evaluation.exceeds_threshold {
            return PollVerdict::Converged;
        }

        let stall_count = self
            .state
            .record(evaluation.idle_ratio, thresholds.stall_epsilon);
        if stall_count >= thresholds.stall_rounds {
            PollVerdict::GaveUp
        } else {
            PollVerdict::Waiting { stall_count }
        }
    }

    pub fn last_ratio(&self) -> Option<f64> {
        self.state.previous_ratio
    }
}

/// How the controller finished with a VM in the capping phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "decision")]
pub enum VmDecision {
    /// Under threshold (or powered off) on first evaluation
    Skipped {
        #[serde(with = "idle_ratio_serde")]
        idle_ratio: f64,
    },
    /// Dropped under threshold while capped
    Converged {
        limit_mb: i64,
        #[serde(with = "idle_ratio_serde")]
        initial_ratio: f64,
        #[serde(with = "idle_ratio_serde")]
        final_ratio: f64,
        polls: u32,
    },
    /// Abandoned after `stall_rounds` non-improving polls
    GaveUp {
        limit_mb: i64,
        #[serde(with = "idle_ratio_serde")]
        initial_ratio: f64,
        #[serde(with = "idle_ratio_serde")]
        final_ratio: f64,
        polls: u32,
    },
}

/// Per-VM record kept in the run report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmOutcome {
    pub vm_id: String,
    #[serde(flatten)]
    pub decision: VmDecision,
}

impl VmOutcome {
    pub fn was_capped(&self) -> bool {
        !matches!(self.decision, VmDecision::Skipped { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exceeding(ratio: f64) -> IdleEvaluation {
        IdleEvaluation {
            exceeds_threshold: true,
            proposed_limit_mb: Some(1000),
            idle_ratio: ratio,
        }
    }

    fn drive(ratios: &[f64], thresholds: &ReclamationThresholds) -> Vec<PollVerdict> {
        let mut watched = WatchedVm::new("web-01", 1750, 0.49);
        ratios
            .iter()
            .map(|r| watched.observe(&exceeding(*r), thresholds))
            .collect()
    }

    #[test]
    fn test_first_observation_counts_as_stall() {
        let mut state = ConvergenceState::default();
        assert_eq!(state.record(0.4, 0.05), 1);
        assert_eq!(state.previous_ratio, Some(0.4));
    }

    #[test]
    fn test_improvement_resets_counter() {
        let mut state = ConvergenceState::default();
        state.record(0.50, 0.05);
        state.record(0.49, 0.05);
        assert_eq!(state.stall_count, 2);

        assert_eq!(state.record(0.40, 0.05), 0);
    }

    #[test]
    fn test_drop_of_exactly_epsilon_is_improvement() {
        let mut state = ConvergenceState::default();
        state.record(0.75, 0.25);
        assert_eq!(state.record(0.5, 0.25), 0);
        assert_eq!(state.record(0.375, 0.25), 1);
    }

    #[test]
    fn test_increase_is_a_stall() {
        let mut state = ConvergenceState::default();
        state.record(0.30, 0.05);
        assert_eq!(state.record(0.45, 0.05), 2);
    }

    #[test]
    fn test_slow_decline_gives_up_after_stall_rounds() {
        let thresholds = ReclamationThresholds::default();
        let ratios: Vec<f64> = (0..10).map(|i| 0.40 - 0.01 * i as f64).collect();

        let verdicts = drive(&ratios, &thresholds);

        for (i, verdict) in verdicts.iter().take(9).enumerate() {
            assert_eq!(
                *verdict,
                PollVerdict::Waiting {
                    stall_count: i as u32 + 1
                }
            );
        }
        assert_eq!(verdicts[9], PollVerdict::GaveUp);
    }

    #[test]
    fn test_infinite_ratio_always_stalls() {
        let mut state = ConvergenceState::default();
        state.record(f64::INFINITY, 0.05);
        assert_eq!(state.record(f64::INFINITY, 0.05), 2);
        assert_eq!(state.record(f64::INFINITY, 0.05), 3);
    }

    #[test]
    fn test_steady_progress_never_gives_up() {
        let thresholds = ReclamationThresholds {
            stall_rounds: 2,
            ..Default::default()
        };
        let verdicts = drive(&[0.90, 0.80, 0.70, 0.60, 0.50], &thresholds);

        assert_eq!(verdicts[0], PollVerdict::Waiting { stall_count: 1 });
        assert!(verdicts[1..]
            .iter()
            .all(|v| *v == PollVerdict::Waiting { stall_count: 0 }));
    }

    #[test]
    fn test_converged_poll_does_not_touch_stall_state() {
        let thresholds = ReclamationThresholds::default();
        let mut watched = WatchedVm::new("web-01", 1750, 0.49);
        watched.observe(&exceeding(0.40), &thresholds);

        let verdict = watched.observe(
            &IdleEvaluation {
                exceeds_threshold: false,
                proposed_limit_mb: Some(1500),
                idle_ratio: 0.19,
            },
            &thresholds,
        );

        assert_eq!(verdict, PollVerdict::Converged);
        assert_eq!(watched.polls, 2);
        assert_eq!(watched.state.stall_count, 1);
        assert_eq!(watched.last_ratio(), Some(0.40));
    }

    #[test]
    fn test_single_round_gives_up_immediately() {
        let thresholds = ReclamationThresholds {
            stall_rounds: 1,
            ..Default::default()
        };
        assert_eq!(drive(&[0.9], &thresholds), vec![PollVerdict::GaveUp]);
    }

    #[test]
    fn test_outcome_serializes_with_decision_tag() {
        let outcome = VmOutcome {
            vm_id: "web-01".to_string(),
            decision: VmDecision::Skipped { idle_ratio: 0.1 },
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["decision"], "skipped");
        assert_eq!(json["vm_id"], "web-01");
        assert!(!outcome.was_capped());
    }

    #[test]
    fn test_unbounded_ratios_round_trip_through_flattened_outcome() {
        let outcome = VmOutcome {
            vm_id: "ghost-01".to_string(),
            decision: VmDecision::GaveUp {
                limit_mb: 75,
                initial_ratio: f64::INFINITY,
                final_ratio: f64::INFINITY,
                polls: 3,
            },
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert!(json["initial_ratio"].is_null());

        let back: VmOutcome = serde_json::from_value(json).unwrap();
        assert_eq!(back, outcome);
    }
}
