//! # Capstan
//!
//! Capstan is a fire-and-forget execution service for long-running agentic
//! coding jobs. A client submits a natural-language task (or a batch of
//! tasks with declared dependencies); the service persists the job,
//! dispatches it to a background executor that drives an external AI coding
//! agent, streams the agent's structured message log to disk, and reports
//! progress through a polling API.
//!
//! ## Architecture
//!
//! - **Store**: sole gateway to persistent state (`tasks.db`)
//! - **Log Sink**: per-task append-only summary/detailed writers
//! - **Resilience**: failure classification, retry policy, persisted
//!   circuit breaker
//! - **Executor**: drives one task against the external agent
//! - **Orchestrator**: admits DAGs of tasks, gates on completion events
//! - **Scheduler**: process-wide supervisor enforcing the concurrency bound
//! - **Resource Monitor**: periodic memory/disk sampling into a bounded ring
//!
//! Work survives restarts: non-terminal rows are re-queued on startup, and
//! a single misbehaving job cannot take the service down.

/// External agent integration (spawn, stream decode, diagnostics)
pub mod agent;
/// HTTP API server and endpoints
pub mod api;
/// Service configuration
pub mod config;
/// System-wide constants
pub mod constants;
/// Error types and handling
pub mod error;
/// Single-task execution
pub mod executor;
/// Per-task append-only log writers
pub mod logsink;
/// Core data models
pub mod models;
/// Resource monitoring
pub mod monitoring;
/// DAG admission and event-driven gating
pub mod orchestrator;
/// Failure classification, retries, circuit breaking
pub mod resilience;
/// Process-wide supervision and concurrency bounds
pub mod scheduler;
/// Persistent state gateway
pub mod store;
/// Admission validation
pub mod validation;

#[cfg(test)]
mod tests;

pub use error::{CapstanError, Result};
pub use resilience::BreakerRegistry;
