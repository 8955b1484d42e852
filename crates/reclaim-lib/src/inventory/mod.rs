//! Capabilities the controller needs from the virtualization management plane
//!
//! Each collaborator is a narrow async trait so that the controller can be
//! driven against a real endpoint or against [`InMemoryFleet`] in tests.

mod memory;

pub use memory::{FleetCall, FleetFile, FleetOp, InMemoryFleet, TelemetrySample, VmFixture};

use crate::models::{Host, MemoryLimit, VmSnapshot};

pub use async_trait::async_trait;

/// Failure reported by a collaborator
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollaboratorError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not found: {0}")]
    NotFound(String),
}

/// Applies hypervisor-level options to hosts
#[async_trait]
pub trait HostConfigurer: Send + Sync {
    /// List hosts in the target datacenter
    async fn list_hosts(&self) -> Result<Vec<Host>, CollaboratorError>;

    /// Set an advanced option on one host, returning the previous value
    async fn set_host_option(
        &self,
        host: &Host,
        key: &str,
        value: i64,
    ) -> Result<Option<i64>, CollaboratorError>;
}

/// Reads VM membership and live telemetry
#[async_trait]
pub trait InventoryReader: Send + Sync {
    /// Snapshot every managed VM whose name does not start with `exclude_prefix`
    async fn list_vms(&self, exclude_prefix: &str) -> Result<Vec<VmSnapshot>, CollaboratorError>;

    /// Fetch fresh telemetry for one VM
    async fn get_vm(&self, id: &str) -> Result<VmSnapshot, CollaboratorError>;
}

/// Applies or clears a VM's hard memory ceiling.
///
/// Implementations must not return until the hypervisor has committed the
/// change. Clearing a VM that has no limit is a successful no-op.
#[async_trait]
pub trait VmLimiter: Send + Sync {
    async fn set_memory_limit(&self, vm_id: &str, limit: MemoryLimit)
        -> Result<(), CollaboratorError>;
}
