//! Cgroup resource governance
//!
//! Per-run groups under the unified hierarchy: memory and pids ceilings plus
//! the OOM and fork-refusal evidence the verdict classifier reads.

pub mod backend;
pub mod v2;

pub use backend::{create_cgroup_backend, CgroupBackend};
pub use v2::CgroupV2;
