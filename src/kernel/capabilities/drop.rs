use super::{
    LINUX_CAPABILITY_VERSION_3, MAX_CAP, PR_CAPBSET_DROP, PR_CAP_AMBIENT,
    PR_CAP_AMBIENT_CLEAR_ALL, PR_SET_NO_NEW_PRIVS,
};
use crate::config::types::{GradeError, Result};

/// Remove every capability from the bounding set. Needs CAP_SETPCAP, so it
/// runs before the uid switch. In strict mode any refusal is an error.
pub fn drop_bounding_set(strict_mode: bool) -> Result<()> {
    let mut refused = Vec::new();
    for cap in 0..=MAX_CAP {
        // SAFETY: PR_CAPBSET_DROP takes a plain integer; unknown caps return EINVAL.
        let rc = unsafe { libc::prctl(PR_CAPBSET_DROP, cap as libc::c_ulong, 0, 0, 0) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINVAL) {
                refused.push(cap);
            }
        }
    }

    if refused.is_empty() {
        return Ok(());
    }
    let msg = format!("bounding set drop refused for capabilities {:?}", refused);
    if strict_mode {
        Err(GradeError::Privilege(msg))
    } else {
        log::warn!("{} (permissive mode)", msg);
        Ok(())
    }
}

/// Clear ambient capabilities and zero the effective, permitted and
/// inheritable sets via capset(2).
pub fn clear_remaining_capabilities() -> Result<()> {
    // SAFETY: PR_CAP_AMBIENT_CLEAR_ALL has no pointer arguments.
    let rc = unsafe { libc::prctl(PR_CAP_AMBIENT, PR_CAP_AMBIENT_CLEAR_ALL, 0, 0, 0) };
    if rc != 0 {
        log::debug!("ambient capability clear unsupported on this kernel");
    }

    #[repr(C)]
    struct CapUserHeader {
        version: u32,
        pid: i32,
    }

    #[repr(C)]
    struct CapUserData {
        effective: u32,
        permitted: u32,
        inheritable: u32,
    }

    let header = CapUserHeader {
        version: LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };
    // Version 3 takes two entries: caps 0-31 and 32-63.
    let data = [
        CapUserData { effective: 0, permitted: 0, inheritable: 0 },
        CapUserData { effective: 0, permitted: 0, inheritable: 0 },
    ];

    // SAFETY: header and data are properly initialized repr(C) structs that
    // outlive the call; pid 0 targets the calling thread.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_capset,
            &header as *const CapUserHeader,
            data.as_ptr(),
        )
    };
    if rc != 0 {
        // EPERM is expected once the uid switch already emptied the sets.
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EPERM) {
            return Err(GradeError::Privilege(format!("capset failed: {}", err)));
        }
    }
    Ok(())
}

/// Prevent setuid binaries and file capabilities from regaining privilege
/// across execve. Irreversible.
pub fn set_no_new_privs() -> Result<()> {
    // SAFETY: PR_SET_NO_NEW_PRIVS takes integer arguments only.
    let rc = unsafe { libc::prctl(PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if rc != 0 {
        return Err(GradeError::Privilege(format!(
            "Failed to set PR_SET_NO_NEW_PRIVS: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}
