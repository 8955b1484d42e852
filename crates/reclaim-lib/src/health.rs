//! Health check infrastructure for the reclaimer
//!
//! Tracks the controller and the management-plane connection so the agent
//! can answer liveness and readiness probes. A failed run degrades health
//! rather than failing it: the agent stays up so operators can inspect and
//! retry.

use crate::controller::ReclaimError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Health status of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Operational, but the last run left something for an operator to check
    Degraded,
    Unhealthy,
}

impl ComponentStatus {
    pub fn is_operational(&self) -> bool {
        matches!(self, ComponentStatus::Healthy | ComponentStatus::Degraded)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check_timestamp: i64,
}

impl ComponentHealth {
    fn with_status(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn healthy() -> Self {
        Self::with_status(ComponentStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::with_status(ComponentStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::with_status(ComponentStatus::Unhealthy, Some(message.into()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: HashMap<String, ComponentHealth>,
}

impl HealthResponse {
    /// Worst status across all components
    pub fn compute_status(components: &HashMap<String, ComponentHealth>) -> ComponentStatus {
        components
            .values()
            .map(|health| health.status)
            .fold(ComponentStatus::Healthy, |worst, status| match (worst, status) {
                (ComponentStatus::Unhealthy, _) | (_, ComponentStatus::Unhealthy) => {
                    ComponentStatus::Unhealthy
                }
                (ComponentStatus::Degraded, _) | (_, ComponentStatus::Degraded) => {
                    ComponentStatus::Degraded
                }
                _ => ComponentStatus::Healthy,
            })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names for health tracking
pub mod components {
    pub const CONTROLLER: &str = "controller";
    pub const MANAGEMENT_PLANE: &str = "management_plane";
}

#[derive(Debug, Clone)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, ComponentHealth>>>,
    ready: Arc<RwLock<bool>>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            components: Arc::new(RwLock::new(HashMap::new())),
            ready: Arc::new(RwLock::new(false)),
        }
    }

    pub async fn register(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn update(&self, name: &str, health: ComponentHealth) {
        self.components
            .write()
            .await
            .insert(name.to_string(), health);
    }

    pub async fn set_healthy(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::degraded(message)).await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::unhealthy(message)).await;
    }

    /// Fold a finished run into component health
    pub async fn record_run(&self, result: Result<(), &ReclaimError>) {
        match result {
            Ok(()) => {
                self.set_healthy(components::CONTROLLER).await;
                self.set_healthy(components::MANAGEMENT_PLANE).await;
            }
            Err(error) => {
                self.set_degraded(
                    components::CONTROLLER,
                    format!("last run failed: {}", error),
                )
                .await;
                if error.is_collaborator_failure() {
                    self.set_degraded(components::MANAGEMENT_PLANE, error.to_string())
                        .await;
                }
            }
        }
    }

    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.components.read().await.clone();
        let status = HealthResponse::compute_status(&components);
        HealthResponse { status, components }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        let ready = *self.ready.read().await;
        let health = self.health().await;

        let reason = if !ready {
            Some("Reclaimer not yet initialized".to_string())
        } else if !health.status.is_operational() {
            Some("Critical component unhealthy".to_string())
        } else {
            None
        };

        ReadinessResponse {
            ready: reason.is_none(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::Phase;
    use crate::inventory::CollaboratorError;

    #[tokio::test]
    async fn test_health_registry_initial_state() {
        let registry = HealthRegistry::new();
        let health = registry.health().await;

        assert_eq!(health.status, ComponentStatus::Healthy);
        assert!(health.components.is_empty());
    }

    #[tokio::test]
    async fn test_failed_run_degrades_controller_and_plane() {
        let registry = HealthRegistry::new();
        registry.register(components::CONTROLLER).await;
        registry.register(components::MANAGEMENT_PLANE).await;

        let error = ReclaimError::FetchVm {
            phase: Phase::CappingOutliers,
            vm: "web-01".to_string(),
            source: CollaboratorError::Transport("connection reset".to_string()),
        };
        registry.record_run(Err(&error)).await;

        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Degraded);
        assert_eq!(
            health.components[components::MANAGEMENT_PLANE].status,
            ComponentStatus::Degraded
        );
        assert!(health.components[components::CONTROLLER]
            .message
            .as_deref()
            .unwrap()
            .contains("web-01"));
    }

    #[tokio::test]
    async fn test_cancelled_run_leaves_plane_healthy() {
        let registry = HealthRegistry::new();
        registry.register(components::CONTROLLER).await;
        registry.register(components::MANAGEMENT_PLANE).await;

        let error = ReclaimError::Cancelled {
            phase: Phase::DrainingBalloons,
            vm: None,
        };
        registry.record_run(Err(&error)).await;

        let health = registry.health().await;
        assert_eq!(
            health.components[components::MANAGEMENT_PLANE].status,
            ComponentStatus::Healthy
        );
        assert_eq!(
            health.components[components::CONTROLLER].status,
            ComponentStatus::Degraded
        );
    }

    #[tokio::test]
    async fn test_successful_run_restores_health() {
        let registry = HealthRegistry::new();
        registry
            .set_degraded(components::CONTROLLER, "last run failed")
            .await;
        registry.record_run(Ok(())).await;

        assert_eq!(registry.health().await.status, ComponentStatus::Healthy);
    }

    #[tokio::test]
    async fn test_unhealthy_component_dominates() {
        let registry = HealthRegistry::new();
        registry.set_degraded(components::CONTROLLER, "slow").await;
        registry
            .set_unhealthy(components::MANAGEMENT_PLANE, "unreachable")
            .await;

        assert_eq!(registry.health().await.status, ComponentStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_readiness() {
        let registry = HealthRegistry::new();
        registry.register(components::CONTROLLER).await;

        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert!(readiness.reason.is_some());

        registry.set_ready(true).await;
        assert!(registry.readiness().await.ready);

        registry
            .set_unhealthy(components::CONTROLLER, "panicked")
            .await;
        assert!(!registry.readiness().await.ready);
    }
}
