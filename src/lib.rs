//! # Meridian Core
//!
//! Meridian Core is the AI agent control plane of a multi-tenant service
//! platform: it routes tenant work onto a pool of domain agents, selects
//! and fails over between model providers by capability, caches results,
//! enforces per-tenant quotas and role-based access, and distils
//! telemetry into performance insights.
//!
//! ## Architecture
//!
//! - **Agent Orchestrator**: per-(tenant, kind) priority queues, a
//!   dispatch loop per partition, retry classification and backoff
//! - **Model Provider Registry**: capability-tagged catalogue with
//!   deterministic fallback chains ending in an always-available default
//! - **Tenant Store & Access Control**: subscription tiers with quota
//!   bundles, closed role/permission catalogues, audited mutations
//! - **Response Cache**: sharded TTL map with prefix invalidation
//! - **Insights Engine**: summaries, anomaly flags, recommendations
//! - **HTTP Surface**: thin axum layer mapping the error taxonomy to
//!   status codes
//!
//! Dependencies are wired once in the composition root (`main`); no
//! component reaches for process-wide state.

/// Access control: roles, permissions, sessions, audit log
pub mod access;
/// Agent framework and the orchestrator
pub mod agents;
/// HTTP API server and endpoints
pub mod api;
/// Response caching
pub mod cache;
/// Clock and identifier ports
pub mod clock;
/// Multi-agent collaboration coordination
pub mod collab;
/// System configuration
pub mod config;
/// System-wide constants
pub mod constants;
/// Error types and handling
pub mod error;
/// Performance insights and anomaly detection
pub mod insights;
/// Core data models
pub mod models;
/// Model provider registry and backends
pub mod providers;
/// Persistence port
pub mod store;
/// Metric samples and sinks
pub mod telemetry;
/// Tenant configuration and quotas
pub mod tenancy;
/// Payload validation and sanitisation
pub mod validation;

#[cfg(test)]
mod tests;

pub use error::{CoreError, Result};
