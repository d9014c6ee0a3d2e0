//! Toolchain-agnostic sandbox core.
//!
//! Core owns the container lifecycle, limit enforcement, and evidence
//! collection. Toolchain-specific invocation lives in the registry.

pub mod cancel;
pub mod output;
pub mod runtime;
pub mod sandbox;
