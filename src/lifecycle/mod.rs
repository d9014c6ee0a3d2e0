//! Request lifecycle tracking
//!
//! Per-kind in-progress counters and most-recent results, owned by an
//! injectable [`Session`](session::Session).

pub mod session;
pub mod tracker;

pub use session::{ClientEvent, Session};
pub use tracker::{LifecycleTracker, RequestKind, RequestPayload, TrackerSnapshot, TrackerState};
