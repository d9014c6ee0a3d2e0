//! Configuration and shared types
//!
//! Service configuration, request validation, and the closed enums shared by
//! every other module.

pub mod service;
pub mod types;
pub mod validator;
