//! Read-only capability inspection, used for launch evidence and tests.

use super::{MAX_CAP, PR_CAPBSET_READ, PR_GET_NO_NEW_PRIVS};
use crate::config::types::{GradeError, Result};
use std::fs;

pub fn no_new_privs_enabled() -> Result<bool> {
    // SAFETY: PR_GET_NO_NEW_PRIVS takes no pointer arguments.
    let rc = unsafe { libc::prctl(PR_GET_NO_NEW_PRIVS, 0, 0, 0, 0) };
    if rc < 0 {
        return Err(GradeError::Privilege(
            "Failed to read PR_GET_NO_NEW_PRIVS".to_string(),
        ));
    }
    Ok(rc == 1)
}

/// Capability numbers still present in the bounding set.
pub fn bounding_set() -> Vec<u32> {
    (0..=MAX_CAP)
        .filter(|cap| {
            // SAFETY: PR_CAPBSET_READ takes a plain integer.
            unsafe { libc::prctl(PR_CAPBSET_READ, *cap as libc::c_ulong, 0, 0, 0) == 1 }
        })
        .collect()
}

/// The `Cap*` lines of /proc/self/status.
pub fn capability_status() -> Result<String> {
    let status = fs::read_to_string("/proc/self/status")
        .map_err(|e| GradeError::Privilege(format!("Failed to read /proc/self/status: {}", e)))?;
    Ok(status
        .lines()
        .filter(|line| line.starts_with("Cap"))
        .collect::<Vec<_>>()
        .join("\n"))
}

/// True when the inheritable, permitted and effective sets are all empty.
pub fn process_capabilities_zero() -> Result<bool> {
    Ok(sets_zero(&capability_status()?))
}

fn sets_zero(status: &str) -> bool {
    status
        .lines()
        .filter(|line| {
            line.starts_with("CapInh:") || line.starts_with("CapPrm:") || line.starts_with("CapEff:")
        })
        .all(|line| {
            line.split_whitespace()
                .nth(1)
                .and_then(|hex| u64::from_str_radix(hex, 16).ok())
                == Some(0)
        })
}
