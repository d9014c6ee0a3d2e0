//! Safety and cleanup
//!
//! Run-scoped workspaces and container teardown guards. Nothing an execution
//! creates outlives it.

pub mod guard;
pub mod workspace;
