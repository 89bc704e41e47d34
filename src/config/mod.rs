//! Configuration
//!
//! Engine settings, shared types, loading and startup validation.

pub mod loader;
pub mod types;
pub mod validator;
