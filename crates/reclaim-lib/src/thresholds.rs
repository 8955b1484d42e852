//! Per-run reclamation thresholds

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Idle ratio above which a VM is treated as an outlier
pub const DEFAULT_IDLE_THRESHOLD: f64 = 0.25;

/// Consecutive non-improving polls before a VM is abandoned
pub const DEFAULT_STALL_ROUNDS: u32 = 10;

/// Minimum per-poll ratio improvement that resets the stall counter
pub const DEFAULT_STALL_EPSILON: f64 = 0.05;

/// Wait between convergence and drain polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Balloon ceiling applied while capping, and restored afterwards
pub const DEFAULT_HIGH_CEILING: u8 = 65;

/// Balloon ceiling that forces every balloon to deflate
pub const DEFAULT_DRAIN_CEILING: u8 = 0;

/// Infrastructure VMs carry this name prefix and are never touched
pub const DEFAULT_EXCLUDE_PREFIX: &str = "sc-";

/// Host advanced option governing the balloon ceiling
pub const DEFAULT_CEILING_OPTION: &str = "Mem.CtlMaxPercent";

/// Invalid threshold configuration
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ThresholdError {
    #[error("{name} must be a percentage between 0 and 100, got {value}")]
    CeilingOutOfRange { name: &'static str, value: u8 },

    #[error("{name} must be finite and non-negative, got {value}")]
    InvalidRatio { name: &'static str, value: f64 },

    #[error("stall_epsilon must be greater than zero, got {0}")]
    NonPositiveEpsilon(f64),

    #[error("stall_rounds must be at least 1")]
    ZeroStallRounds,

    #[error("ceiling_option must not be empty")]
    EmptyCeilingOption,
}

/// Configuration for one reclamation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReclamationThresholds {
    pub idle_threshold: f64,
    pub stall_rounds: u32,
    pub stall_epsilon: f64,
    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,
    pub high_ceiling: u8,
    pub drain_ceiling: u8,
    pub restore_ceiling: u8,
    pub exclude_prefix: String,
    pub ceiling_option: String,
}

impl Default for ReclamationThresholds {
    fn default() -> Self {
        Self {
            idle_threshold: DEFAULT_IDLE_THRESHOLD,
            stall_rounds: DEFAULT_STALL_ROUNDS,
            stall_epsilon: DEFAULT_STALL_EPSILON,
            poll_interval: DEFAULT_POLL_INTERVAL,
            high_ceiling: DEFAULT_HIGH_CEILING,
            drain_ceiling: DEFAULT_DRAIN_CEILING,
            restore_ceiling: DEFAULT_HIGH_CEILING,
            exclude_prefix: DEFAULT_EXCLUDE_PREFIX.to_string(),
            ceiling_option: DEFAULT_CEILING_OPTION.to_string(),
        }
    }
}

impl ReclamationThresholds {
    /// Check the invariants the controller relies on
    pub fn validate(&self) -> Result<(), ThresholdError> {
        for (name, value) in [
            ("high_ceiling", self.high_ceiling),
            ("drain_ceiling", self.drain_ceiling),
            ("restore_ceiling", self.restore_ceiling),
        ] {
            if value > 100 {
                return Err(ThresholdError::CeilingOutOfRange { name, value });
            }
        }

        for (name, value) in [
            ("idle_threshold", self.idle_threshold),
            ("stall_epsilon", self.stall_epsilon),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ThresholdError::InvalidRatio { name, value });
            }
        }

        // A zero epsilon lets a flat ratio reset the stall counter forever
        if self.stall_epsilon == 0.0 {
            return Err(ThresholdError::NonPositiveEpsilon(self.stall_epsilon));
        }

        if self.stall_rounds == 0 {
            return Err(ThresholdError::ZeroStallRounds);
        }

        if self.ceiling_option.is_empty() {
            return Err(ThresholdError::EmptyCeilingOption);
        }

        Ok(())
    }

    /// Whether a VM name belongs to the excluded infrastructure set
    pub fn is_excluded(&self, vm_id: &str) -> bool {
        !self.exclude_prefix.is_empty() && vm_id.starts_with(&self.exclude_prefix)
    }

    /// Worst-case time spent watching a single outlier VM
    pub fn max_watch_duration(&self) -> Duration {
        self.poll_interval * self.stall_rounds
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}
