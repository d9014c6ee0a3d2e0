//! Dispatch
//!
//! Admission control and the request path from submission to outcome.

pub mod engine;
pub mod slots;

pub use engine::{DispatchEngine, DispatchOptions};
pub use slots::{Admission, SlotGuard, SlotPool};
