//! Switch the payload to the unprivileged sandbox identity.
//!
//! Order matters: supplementary groups, then gid, then uid. Once the uid is
//! gone, the gid can no longer be changed.

use super::validation::validate_ids;
use crate::config::types::{GradeError, Result};
use nix::unistd::{getegid, geteuid, getgid, getuid, setgroups, setresgid, setresuid, Gid, Uid};

/// validate, clear groups, setresgid, setresuid, verify
pub fn transition_to_unprivileged(uid: u32, gid: u32, strict_mode: bool) -> Result<()> {
    validate_ids(uid, gid, strict_mode)?;

    permissive(strict_mode, setgroups(&[]).map_err(|e| {
        GradeError::Privilege(format!("Failed to clear supplementary groups: {}", e))
    }))?;

    let gid = Gid::from_raw(gid);
    permissive(strict_mode, setresgid(gid, gid, gid).map_err(|e| {
        GradeError::Privilege(format!("Failed to setresgid({}): {}", gid, e))
    }))?;

    let uid = Uid::from_raw(uid);
    permissive(strict_mode, setresuid(uid, uid, uid).map_err(|e| {
        GradeError::Privilege(format!("Failed to setresuid({}): {}", uid, e))
    }))?;

    permissive(strict_mode, verify_transition(uid, gid))
}

fn permissive(strict_mode: bool, result: Result<()>) -> Result<()> {
    match result {
        Err(e) if !strict_mode => {
            log::warn!("{} (permissive mode)", e);
            Ok(())
        }
        other => other,
    }
}

fn verify_transition(uid: Uid, gid: Gid) -> Result<()> {
    if getuid() != uid || geteuid() != uid {
        return Err(GradeError::Privilege(format!(
            "UID verification failed: expected {}, got real={}, effective={}",
            uid,
            getuid(),
            geteuid()
        )));
    }
    if getgid() != gid || getegid() != gid {
        return Err(GradeError::Privilege(format!(
            "GID verification failed: expected {}, got real={}, effective={}",
            gid,
            getgid(),
            getegid()
        )));
    }
    Ok(())
}
