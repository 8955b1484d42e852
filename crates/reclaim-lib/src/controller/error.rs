//! Run failure taxonomy

use super::Phase;
use crate::inventory::CollaboratorError;
use crate::models::MemoryLimit;

/// The single error a failed run reports.
///
/// Every variant names the phase it happened in and, where one was involved,
/// the host or VM whose state may need manual cleanup.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReclaimError {
    #[error("{phase}: failed to list hosts: {source}")]
    ListHosts {
        phase: Phase,
        source: CollaboratorError,
    },

    #[error("{phase}: failed to set {key}={value} on host {host}: {source}")]
    HostOption {
        phase: Phase,
        host: String,
        key: String,
        value: i64,
        source: CollaboratorError,
    },

    #[error("{phase}: failed to list VMs: {source}")]
    ListVms {
        phase: Phase,
        source: CollaboratorError,
    },

    #[error("{phase}: failed to fetch VM {vm}: {source}")]
    FetchVm {
        phase: Phase,
        vm: String,
        source: CollaboratorError,
    },

    #[error("{phase}: failed to set memory limit {limit} on VM {vm}: {source}")]
    SetLimit {
        phase: Phase,
        vm: String,
        limit: MemoryLimit,
        source: CollaboratorError,
    },

    #[error("{phase}: run cancelled (in-flight VM: {})", .vm.as_deref().unwrap_or("none"))]
    Cancelled { phase: Phase, vm: Option<String> },
}

impl ReclaimError {
    pub fn phase(&self) -> Phase {
        match self {
            ReclaimError::ListHosts { phase, .. }
            | ReclaimError::HostOption { phase, .. }
            | ReclaimError::ListVms { phase, .. }
            | ReclaimError::FetchVm { phase, .. }
            | ReclaimError::SetLimit { phase, .. }
            | ReclaimError::Cancelled { phase, .. } => *phase,
        }
    }

    pub fn host(&self) -> Option<&str> {
        match self {
            ReclaimError::HostOption { host, .. } => Some(host),
            _ => None,
        }
    }

    pub fn vm(&self) -> Option<&str> {
        match self {
            ReclaimError::FetchVm { vm, .. } | ReclaimError::SetLimit { vm, .. } => Some(vm),
            ReclaimError::Cancelled { vm, .. } => vm.as_deref(),
            _ => None,
        }
    }

    /// True when the management plane rejected or failed a call
    pub fn is_collaborator_failure(&self) -> bool {
        !matches!(self, ReclaimError::Cancelled { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_failure_message_names_phase_and_host() {
        let err = ReclaimError::HostOption {
            phase: Phase::RaisingCeiling,
            host: "esx-03".to_string(),
            key: "Mem.CtlMaxPercent".to_string(),
            value: 65,
            source: CollaboratorError::PermissionDenied("read-only role".to_string()),
        };

        assert_eq!(
            err.to_string(),
            "raising_ceiling: failed to set Mem.CtlMaxPercent=65 on host esx-03: \
             permission denied: read-only role"
        );
        assert_eq!(err.host(), Some("esx-03"));
        assert_eq!(err.vm(), None);
        assert!(err.is_collaborator_failure());
    }

    #[test]
    fn test_cancelled_message() {
        let err = ReclaimError::Cancelled {
            phase: Phase::CappingOutliers,
            vm: Some("web-01".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "capping_outliers: run cancelled (in-flight VM: web-01)"
        );
        assert_eq!(err.vm(), Some("web-01"));
        assert!(!err.is_collaborator_failure());
    }
}
