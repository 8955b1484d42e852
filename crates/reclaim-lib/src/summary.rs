//! Fleet memory aggregation

use crate::models::VmSnapshot;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Memory totals across a set of VMs (sizes in MB)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetSummary {
    pub vms: usize,
    pub powered_on: usize,
    pub allocated_mb: i64,
    pub guest_used_mb: i64,
    pub host_used_mb: i64,
    pub idle_mb: i64,
    pub ballooned_mb: i64,
}

impl FleetSummary {
    pub fn from_snapshots<'a>(snapshots: impl IntoIterator<Item = &'a VmSnapshot>) -> Self {
        let mut summary = Self::default();
        for vm in snapshots {
            summary.ingest(vm);
        }
        summary
    }

    pub fn ingest(&mut self, vm: &VmSnapshot) {
        self.vms += 1;
        if vm.is_powered_on() {
            self.powered_on += 1;
        }
        self.allocated_mb += vm.configured_mb;
        self.guest_used_mb += vm.guest_usage_mb;
        self.host_used_mb += vm.host_usage_mb;
        self.idle_mb += vm.idle_mb();
        self.ballooned_mb += vm.ballooned_mb;
    }

    /// Idle memory over allocated memory for the whole set
    pub fn idle_ratio(&self) -> Option<f64> {
        if self.allocated_mb > 0 {
            Some(self.idle_mb as f64 / self.allocated_mb as f64)
        } else {
            None
        }
    }
}

/// Totals plus per-group totals, grouped by a caller-chosen key
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetBreakdown {
    pub total: FleetSummary,
    pub groups: BTreeMap<String, FleetSummary>,
}

impl FleetBreakdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Group snapshots with `key`; VMs for which `key` returns `None` only count toward the total
    pub fn from_snapshots<'a, F>(snapshots: impl IntoIterator<Item = &'a VmSnapshot>, key: F) -> Self
    where
        F: Fn(&VmSnapshot) -> Option<String>,
    {
        let mut breakdown = Self::new();
        for vm in snapshots {
            breakdown.ingest(key(vm).as_deref(), vm);
        }
        breakdown
    }

    pub fn ingest(&mut self, group: Option<&str>, vm: &VmSnapshot) {
        self.total.ingest(vm);
        if let Some(group) = group {
            self.groups.entry(group.to_string()).or_default().ingest(vm);
        }
    }

    /// Group names in sorted order
    pub fn keys(&self) -> Vec<&str> {
        self.groups.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PowerState;

    fn vm(id: &str, configured: i64, host: i64, guest: i64, ballooned: i64) -> VmSnapshot {
        VmSnapshot {
            id: id.to_string(),
            power_state: PowerState::PoweredOn,
            configured_mb: configured,
            host_usage_mb: host,
            guest_usage_mb: guest,
            ballooned_mb: ballooned,
            memory_limit_mb: None,
        }
    }

    #[test]
    fn test_summary_totals() {
        let mut off = vm("batch-01", 1024, 0, 0, 0);
        off.power_state = PowerState::PoweredOff;
        let vms = vec![vm("web-01", 4096, 3000, 1000, 200), off];

        let summary = FleetSummary::from_snapshots(&vms);
        assert_eq!(summary.vms, 2);
        assert_eq!(summary.powered_on, 1);
        assert_eq!(summary.allocated_mb, 5120);
        assert_eq!(summary.idle_mb, 2000);
        assert_eq!(summary.ballooned_mb, 200);
        assert_eq!(summary.idle_ratio(), Some(2000.0 / 5120.0));
    }

    #[test]
    fn test_empty_summary_has_no_ratio() {
        assert_eq!(FleetSummary::default().idle_ratio(), None);
    }

    #[test]
    fn test_breakdown_by_name_prefix() {
        let vms = vec![
            vm("web-01", 1000, 800, 400, 0),
            vm("web-02", 1000, 600, 500, 0),
            vm("db-01", 2000, 1500, 1400, 0),
            vm("misc", 500, 100, 100, 0),
        ];

        let breakdown = FleetBreakdown::from_snapshots(&vms, |vm| {
            vm.id.split_once('-').map(|(prefix, _)| prefix.to_string())
        });

        assert_eq!(breakdown.total.vms, 4);
        assert_eq!(breakdown.keys(), vec!["db", "web"]);
        assert_eq!(breakdown.groups["web"].vms, 2);
        assert_eq!(breakdown.groups["web"].idle_mb, 500);
        assert_eq!(breakdown.groups["db"].idle_mb, 100);
    }
}
