//! Linux capability management for the payload.
//!
//! The bounding set must be emptied while the child still holds CAP_SETPCAP,
//! i.e. before the uid switch. Whatever survives the switch is cleared after.

mod drop;
mod query;

pub use drop::{clear_remaining_capabilities, drop_bounding_set, set_no_new_privs};
pub use query::{bounding_set, capability_status, no_new_privs_enabled, process_capabilities_zero};

/// Highest capability number probed (CAP_CHECKPOINT_RESTORE is 40).
pub(crate) const MAX_CAP: u32 = 40;

pub(crate) const PR_CAPBSET_READ: libc::c_int = 23;
pub(crate) const PR_CAPBSET_DROP: libc::c_int = 24;
pub(crate) const PR_SET_NO_NEW_PRIVS: libc::c_int = 38;
pub(crate) const PR_GET_NO_NEW_PRIVS: libc::c_int = 39;
pub(crate) const PR_CAP_AMBIENT: libc::c_int = 47;
pub(crate) const PR_CAP_AMBIENT_CLEAR_ALL: libc::c_int = 4;
pub(crate) const LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;
