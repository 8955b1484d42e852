//! In-memory fleet backend
//!
//! Serves scripted telemetry for a fixed set of hosts and VMs. Each `get_vm`
//! consumes the next telemetry sample of that VM and the last sample repeats
//! forever, so a fixture fully determines how a VM responds to capping and
//! draining. Failures can be injected per operation and target, and every
//! call is journaled in order.

use super::{async_trait, CollaboratorError, HostConfigurer, InventoryReader, VmLimiter};
use crate::models::{Host, MemoryLimit, PowerState, VmSnapshot};
use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

/// Collaborator operation, used for failure injection and the call journal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FleetOp {
    ListHosts,
    SetHostOption,
    ListVms,
    GetVm,
    SetMemoryLimit,
}

/// One journaled collaborator call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetCall {
    pub op: FleetOp,
    /// Host or VM name, empty for list operations
    pub target: String,
    /// Option value or memory limit, when the call carries one
    pub value: Option<i64>,
    pub succeeded: bool,
}

/// One telemetry sample served by `get_vm`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub host_usage_mb: i64,
    pub guest_usage_mb: i64,
    #[serde(default)]
    pub ballooned_mb: i64,
}

/// Scripted VM definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmFixture {
    pub id: String,
    #[serde(default = "default_power_state")]
    pub power_state: PowerState,
    pub configured_mb: i64,
    pub samples: Vec<TelemetrySample>,
}

fn default_power_state() -> PowerState {
    PowerState::PoweredOn
}

impl VmFixture {
    pub fn new(id: impl Into<String>, configured_mb: i64) -> Self {
        Self {
            id: id.into(),
            power_state: PowerState::PoweredOn,
            configured_mb,
            samples: Vec::new(),
        }
    }

    pub fn powered_off(mut self) -> Self {
        self.power_state = PowerState::PoweredOff;
        self
    }

    /// Append a sample with no ballooned memory
    pub fn sample(self, host_usage_mb: i64, guest_usage_mb: i64) -> Self {
        self.sample_ballooned(host_usage_mb, guest_usage_mb, 0)
    }

    pub fn sample_ballooned(
        mut self,
        host_usage_mb: i64,
        guest_usage_mb: i64,
        ballooned_mb: i64,
    ) -> Self {
        self.samples.push(TelemetrySample {
            host_usage_mb,
            guest_usage_mb,
            ballooned_mb,
        });
        self
    }
}

/// On-disk description of a fleet
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetFile {
    pub hosts: Vec<String>,
    /// Initial value of every host option that the fleet reports as previous
    #[serde(default)]
    pub initial_option_value: Option<i64>,
    pub vms: Vec<VmFixture>,
}

#[derive(Debug)]
struct VmState {
    fixture: VmFixture,
    samples: VecDeque<TelemetrySample>,
    limit_mb: Option<i64>,
}

impl VmState {
    fn current(&self) -> Option<&TelemetrySample> {
        self.samples.front()
    }

    /// Consume the front sample unless it is the last one
    fn advance(&mut self) -> Option<TelemetrySample> {
        if self.samples.len() > 1 {
            self.samples.pop_front()
        } else {
            self.samples.front().cloned()
        }
    }

    fn snapshot(&self, sample: &TelemetrySample) -> VmSnapshot {
        VmSnapshot {
            id: self.fixture.id.clone(),
            power_state: self.fixture.power_state,
            configured_mb: self.fixture.configured_mb,
            host_usage_mb: sample.host_usage_mb,
            guest_usage_mb: sample.guest_usage_mb,
            ballooned_mb: sample.ballooned_mb,
            memory_limit_mb: self.limit_mb,
        }
    }
}

#[derive(Debug, Clone)]
struct FailurePlan {
    remaining_successes: u32,
    error: CollaboratorError,
}

/// Fleet backed entirely by memory
#[derive(Debug, Default)]
pub struct InMemoryFleet {
    hosts: Vec<Host>,
    vm_order: Vec<String>,
    vms: DashMap<String, VmState>,
    host_options: DashMap<(String, String), i64>,
    initial_option_value: Option<i64>,
    failures: DashMap<(FleetOp, String), FailurePlan>,
    journal: Mutex<Vec<FleetCall>>,
}

impl InMemoryFleet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a fleet from a JSON [`FleetFile`]
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read fleet file {:?}", path))?;
        let file: FleetFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse fleet file {:?}", path))?;
        Ok(Self::from_fleet_file(file))
    }

    pub fn from_fleet_file(file: FleetFile) -> Self {
        let mut fleet = Self::new();
        fleet.initial_option_value = file.initial_option_value;
        for host in file.hosts {
            fleet = fleet.with_host(host);
        }
        for vm in file.vms {
            fleet = fleet.with_vm(vm);
        }
        fleet
    }

    pub fn with_host(mut self, name: impl Into<String>) -> Self {
        self.hosts.push(Host::new(name));
        self
    }

    pub fn with_initial_option_value(mut self, value: i64) -> Self {
        self.initial_option_value = Some(value);
        self
    }

    pub fn with_vm(mut self, fixture: VmFixture) -> Self {
        let id = fixture.id.clone();
        let samples = fixture.samples.iter().cloned().collect();
        self.vm_order.push(id.clone());
        self.vms.insert(
            id,
            VmState {
                fixture,
                samples,
                limit_mb: None,
            },
        );
        self
    }

    /// Make every call of `op` against `target` fail
    pub fn fail(&self, op: FleetOp, target: impl Into<String>, error: CollaboratorError) {
        self.fail_after(op, target, 0, error);
    }

    /// Let `successes` calls of `op` against `target` succeed, then fail the rest
    pub fn fail_after(
        &self,
        op: FleetOp,
        target: impl Into<String>,
        successes: u32,
        error: CollaboratorError,
    ) {
        self.failures.insert(
            (op, target.into()),
            FailurePlan {
                remaining_successes: successes,
                error,
            },
        );
    }

    /// Ordered record of every call made against the fleet
    pub fn journal(&self) -> Vec<FleetCall> {
        self.journal
            .lock()
            .map(|j| j.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Current value of a host option, if it has ever been set
    pub fn host_option(&self, host: &str, key: &str) -> Option<i64> {
        self.host_options
            .get(&(host.to_string(), key.to_string()))
            .map(|v| *v)
    }

    /// Current temporary limit of a VM
    pub fn memory_limit(&self, vm_id: &str) -> Option<i64> {
        self.vms.get(vm_id).and_then(|vm| vm.limit_mb)
    }

    fn record(&self, op: FleetOp, target: &str, value: Option<i64>, succeeded: bool) {
        let call = FleetCall {
            op,
            target: target.to_string(),
            value,
            succeeded,
        };
        match self.journal.lock() {
            Ok(mut journal) => journal.push(call),
            Err(poisoned) => poisoned.into_inner().push(call),
        }
    }

    /// Consult the failure plan for `op` on `target`, journaling a failed call
    fn check(&self, op: FleetOp, target: &str, value: Option<i64>) -> Result<(), CollaboratorError> {
        if let Some(mut plan) = self.failures.get_mut(&(op, target.to_string())) {
            if plan.remaining_successes == 0 {
                self.record(op, target, value, false);
                return Err(plan.error.clone());
            }
            plan.remaining_successes -= 1;
        }
        Ok(())
    }
}

#[async_trait]
impl HostConfigurer for InMemoryFleet {
    async fn list_hosts(&self) -> Result<Vec<Host>, CollaboratorError> {
        self.check(FleetOp::ListHosts, "", None)?;
        self.record(FleetOp::ListHosts, "", None, true);
        Ok(self.hosts.clone())
    }

    async fn set_host_option(
        &self,
        host: &Host,
        key: &str,
        value: i64,
    ) -> Result<Option<i64>, CollaboratorError> {
        if !self.hosts.contains(host) {
            self.record(FleetOp::SetHostOption, &host.name, Some(value), false);
            return Err(CollaboratorError::NotFound(format!("host {}", host.name)));
        }
        self.check(FleetOp::SetHostOption, &host.name, Some(value))?;

        let previous = self
            .host_options
            .insert((host.name.clone(), key.to_string()), value)
            .or(self.initial_option_value);
        self.record(FleetOp::SetHostOption, &host.name, Some(value), true);
        debug!(host = %host.name, key = %key, value = value, "Host option set");
        Ok(previous)
    }
}

#[async_trait]
impl InventoryReader for InMemoryFleet {
    async fn list_vms(&self, exclude_prefix: &str) -> Result<Vec<VmSnapshot>, CollaboratorError> {
        self.check(FleetOp::ListVms, "", None)?;
        self.record(FleetOp::ListVms, "", None, true);

        let snapshots = self
            .vm_order
            .iter()
            .filter(|id| exclude_prefix.is_empty() || !id.starts_with(exclude_prefix))
            .filter_map(|id| {
                let vm = self.vms.get(id)?;
                let sample = vm.current()?.clone();
                Some(vm.snapshot(&sample))
            })
            .collect();
        Ok(snapshots)
    }

    async fn get_vm(&self, id: &str) -> Result<VmSnapshot, CollaboratorError> {
        self.check(FleetOp::GetVm, id, None)?;

        let mut vm = match self.vms.get_mut(id) {
            Some(vm) => vm,
            None => {
                self.record(FleetOp::GetVm, id, None, false);
                return Err(CollaboratorError::NotFound(format!("vm {}", id)));
            }
        };
        let sample = match vm.advance() {
            Some(sample) => sample,
            None => {
                drop(vm);
                self.record(FleetOp::GetVm, id, None, false);
                return Err(CollaboratorError::Transport(format!(
                    "vm {} has no telemetry",
                    id
                )));
            }
        };
        let snapshot = vm.snapshot(&sample);
        drop(vm);

        self.record(FleetOp::GetVm, id, None, true);
        Ok(snapshot)
    }
}

#[async_trait]
impl VmLimiter for InMemoryFleet {
    async fn set_memory_limit(
        &self,
        vm_id: &str,
        limit: MemoryLimit,
    ) -> Result<(), CollaboratorError> {
        self.check(FleetOp::SetMemoryLimit, vm_id, limit.as_mb())?;

        match self.vms.get_mut(vm_id) {
            Some(mut vm) => vm.limit_mb = limit.as_mb(),
            None => {
                self.record(FleetOp::SetMemoryLimit, vm_id, limit.as_mb(), false);
                return Err(CollaboratorError::NotFound(format!("vm {}", vm_id)));
            }
        }

        self.record(FleetOp::SetMemoryLimit, vm_id, limit.as_mb(), true);
        Ok(())
    }
}
