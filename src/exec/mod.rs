//! Execution control
//!
//! Orchestrates kernel primitives into safe execution with type-state enforcement.

pub mod executor;
pub mod preexec;
