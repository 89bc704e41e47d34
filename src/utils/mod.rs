//! Utilities
//!
//! Cross-cutting helpers for FD closure and environment hygiene.

pub mod env_hygiene;
pub mod fd_closure;
