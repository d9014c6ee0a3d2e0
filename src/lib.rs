//! playbox: sandboxed multi-toolchain code execution
//!
//! A client submits a source snippet and an action; playbox resolves the
//! toolchain, waits for a concurrency slot, runs the snippet in a fresh
//! resource-limited container and returns the captured output.
//!
//! # Architecture
//!
//! ## Toolchain Registry ([`registry`])
//! - [`registry::descriptor`]: Closed toolchain set and execution environment descriptors
//! - [`registry::commands`]: Per-action command templates
//!
//! ## Sandbox Core ([`core`])
//! - [`core::runtime`]: Container runtime seam and the Docker-compatible CLI backend
//! - [`core::sandbox`]: Type-state environment lifecycle and limit supervision
//! - [`core::output`]: Bounded output collection with a shared combined limit
//! - [`core::cancel`]: Cooperative cancellation tokens
//!
//! ## Outcome Classification ([`verdict`])
//! - [`verdict::classifier`]: Outcome as a pure function over run evidence
//!
//! ## Dispatch ([`dispatch`])
//! - [`dispatch::engine`]: Validation, admission, execution, accounting
//! - [`dispatch::slots`]: Bounded concurrency pool with queue-wait limit
//!
//! ## Request Lifecycle ([`lifecycle`])
//! - [`lifecycle::tracker`]: Per-kind in-progress counter and latest result
//! - [`lifecycle::session`]: Injectable session owning the trackers
//!
//! ## Safety & Cleanup ([`safety`])
//! - [`safety::workspace`]: Run-scoped workspaces
//! - [`safety::guard`]: Container removal on drop
//!
//! ## Observability ([`observability`])
//! - [`observability::audit`]: Structured audit events
//! - [`observability::metrics`]: Prometheus metrics export
//!
//! ## Configuration ([`config`])
//! - [`config::service`]: Service configuration file
//! - [`config::validator`]: Startup and per-request validation
//! - [`config::types`]: Shared type definitions and closed enums

// Toolchain registry
pub mod registry;

// Toolchain-agnostic sandbox core
pub mod core;

// Outcome classification
pub mod verdict;

// Admission and dispatch
pub mod dispatch;

// Request lifecycle tracking
pub mod lifecycle;

// Safety & Cleanup
pub mod safety;

// Observability
pub mod observability;

// Configuration
pub mod config;

// Shutdown signal handling
pub mod signal;

// CLI entrypoint wiring for the playbox binary
pub mod cli;

// Re-export commonly used types for convenience
pub use config::types::*;
pub use crate::core::cancel::CancellationToken;
pub use dispatch::{DispatchEngine, DispatchOptions};
pub use lifecycle::{ClientEvent, Session};
pub use registry::ToolchainRegistry;
