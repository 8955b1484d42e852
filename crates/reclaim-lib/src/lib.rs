//! Idle-memory reclamation library
//!
//! This crate provides the core functionality for:
//! - Idle-ratio evaluation of VM memory telemetry
//! - The phased reclamation controller and its per-VM stall detection
//! - Collaborator traits for the virtualization management plane, plus an
//!   in-memory fleet backend
//! - Run tracking, health checks and observability

pub mod clock;
pub mod controller;
pub mod evaluator;
pub mod health;
pub mod inventory;
pub mod models;
pub mod observability;
pub mod summary;
pub mod thresholds;
pub mod tracker;

pub use clock::{cancel_pair, CancelHandle, CancelToken, Clock, TokioClock, VirtualClock};
pub use controller::{
    Phase, ReclaimError, ReclamationController, RunReport, VmDecision, VmOutcome,
};
pub use evaluator::evaluate;
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{ReclaimerMetrics, StructuredLogger};
pub use summary::{FleetBreakdown, FleetSummary};
pub use thresholds::ReclamationThresholds;
pub use tracker::{RunProgress, RunRecord, RunTracker};
