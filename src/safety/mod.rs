//! Safety and cleanup
//!
//! Run-scoped directories and symlink-safe teardown.

pub mod safe_cleanup;
pub mod workspace;
