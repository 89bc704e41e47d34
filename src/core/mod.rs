//! Language-agnostic sandbox core.
//!
//! Core owns the supervisor -> proxy -> payload process model, the watchdog
//! and the status contract between them. What runs inside is decided by the
//! runner adapters.

pub mod proxy;
pub mod supervisor;
pub mod types;
