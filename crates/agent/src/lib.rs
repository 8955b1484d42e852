//! Reclaimer agent
//!
//! Hosts the reclamation controller behind an HTTP API: health and
//! readiness probes, Prometheus metrics, and endpoints to start, watch and
//! cancel runs.

pub mod api;
pub mod config;
pub mod runner;
