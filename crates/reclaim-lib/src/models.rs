//! Core data models for the reclaimer

use serde::{Deserialize, Serialize};
use std::fmt;

/// Power state of a managed VM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
}

/// Point-in-time memory telemetry for one VM (all sizes in MB)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmSnapshot {
    pub id: String,
    pub power_state: PowerState,
    pub configured_mb: i64,
    pub host_usage_mb: i64,
    pub guest_usage_mb: i64,
    #[serde(default)]
    pub ballooned_mb: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit_mb: Option<i64>,
}

impl VmSnapshot {
    pub fn is_powered_on(&self) -> bool {
        self.power_state == PowerState::PoweredOn
    }

    /// Host-side usage minus guest-side usage. Negative values are sampling skew
    /// and are passed through unchanged.
    pub fn idle_mb(&self) -> i64 {
        self.host_usage_mb - self.guest_usage_mb
    }

    /// Idle memory normalised by configured size, `None` when the size is not positive
    pub fn idle_ratio(&self) -> Option<f64> {
        if self.configured_mb > 0 {
            Some(self.idle_mb() as f64 / self.configured_mb as f64)
        } else {
            None
        }
    }

    pub fn has_ballooned_memory(&self) -> bool {
        self.ballooned_mb != 0
    }
}

/// A hypervisor node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Host {
    pub name: String,
}

impl Host {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Hard memory ceiling applied to a VM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "mb")]
pub enum MemoryLimit {
    Limited(i64),
    Unlimited,
}

impl MemoryLimit {
    pub fn as_mb(&self) -> Option<i64> {
        match self {
            MemoryLimit::Limited(mb) => Some(*mb),
            MemoryLimit::Unlimited => None,
        }
    }
}

impl fmt::Display for MemoryLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryLimit::Limited(mb) => write!(f, "{}MB", mb),
            MemoryLimit::Unlimited => f.write_str("unlimited"),
        }
    }
}

/// Result of evaluating a VM against the idle threshold
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IdleEvaluation {
    pub exceeds_threshold: bool,
    /// Temporary limit to apply, `None` for powered-off VMs
    pub proposed_limit_mb: Option<i64>,
    #[serde(with = "idle_ratio_serde")]
    pub idle_ratio: f64,
}

/// Idle ratios on the wire. A VM with no configured memory has an unbounded
/// ratio, which JSON cannot carry; it is written as `null` and read back as
/// positive infinity.
pub mod idle_ratio_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            value.serialize(serializer)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::INFINITY))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm(configured: i64, host: i64, guest: i64) -> VmSnapshot {
        VmSnapshot {
            id: "web-01".to_string(),
            power_state: PowerState::PoweredOn,
            configured_mb: configured,
            host_usage_mb: host,
            guest_usage_mb: guest,
            ballooned_mb: 0,
            memory_limit_mb: None,
        }
    }

    #[test]
    fn test_idle_memory_can_be_negative() {
        let snapshot = vm(4096, 900, 1000);
        assert_eq!(snapshot.idle_mb(), -100);
        assert_eq!(snapshot.idle_ratio(), Some(-100.0 / 4096.0));
    }

    #[test]
    fn test_unbounded_ratio_survives_json() {
        let evaluation = IdleEvaluation {
            exceeds_threshold: true,
            proposed_limit_mb: Some(75),
            idle_ratio: f64::INFINITY,
        };
        let json = serde_json::to_string(&evaluation).unwrap();
        assert!(json.contains(r#""idle_ratio":null"#));

        let back: IdleEvaluation = serde_json::from_str(&json).unwrap();
        assert_eq!(back.idle_ratio, f64::INFINITY);
    }

    #[test]
    fn test_idle_ratio_undefined_for_zero_size() {
        assert_eq!(vm(0, 100, 10).idle_ratio(), None);
    }

    #[test]
    fn test_snapshot_deserializes_with_defaults() {
        let json = r#"{
            "id": "db-01",
            "power_state": "powered_on",
            "configured_mb": 2048,
            "host_usage_mb": 1500,
            "guest_usage_mb": 700
        }"#;
        let snapshot: VmSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(snapshot.ballooned_mb, 0);
        assert!(snapshot.memory_limit_mb.is_none());
        assert!(snapshot.is_powered_on());
    }

    #[test]
    fn test_memory_limit_display() {
        assert_eq!(MemoryLimit::Limited(1750).to_string(), "1750MB");
        assert_eq!(MemoryLimit::Unlimited.to_string(), "unlimited");
    }
}
