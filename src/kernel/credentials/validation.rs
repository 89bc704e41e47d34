use crate::config::types::{GradeError, Result};

/// The sandbox identity must not be root. Permissive mode only warns.
pub fn validate_ids(uid: u32, gid: u32, strict_mode: bool) -> Result<()> {
    if uid == 0 || gid == 0 {
        let msg = format!("sandbox identity must not be root (uid={}, gid={})", uid, gid);
        if strict_mode {
            return Err(GradeError::Privilege(msg));
        }
        log::warn!("{} (permissive mode)", msg);
    }
    Ok(())
}
