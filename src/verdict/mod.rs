//! Evidence-backed outcome classification
//!
//! Derives execution outcomes as pure functions over immutable run evidence.

pub mod classifier;
