/// File descriptor closure before exec.
///
/// Everything above stderr is closed except the descriptors the payload is
/// meant to inherit (the result channel, the setup-error pipe).
/// Prefers close_range(2) over the gaps, falls back to /proc/self/fd.
use crate::config::types::{GradeError, Result};
use nix::unistd::close;
use std::fs;
use std::os::unix::io::RawFd;

const FIRST_CLOSABLE_FD: RawFd = 3;

/// Close every inherited descriptor >= 3 that is not in `keep`.
pub fn close_inherited_fds(strict_mode: bool, keep: &[RawFd]) -> Result<()> {
    let ranges = closable_ranges(keep);

    if ranges.iter().all(|(lo, hi)| try_close_range(*lo, *hi)) {
        log::debug!("closed inherited FDs using close_range (kept {:?})", keep);
        return Ok(());
    }

    close_fds_via_proc(strict_mode, keep)
}

/// Inclusive ranges of descriptors to close, skipping `keep`.
fn closable_ranges(keep: &[RawFd]) -> Vec<(u32, u32)> {
    let mut kept: Vec<RawFd> = keep
        .iter()
        .copied()
        .filter(|fd| *fd >= FIRST_CLOSABLE_FD)
        .collect();
    kept.sort_unstable();
    kept.dedup();

    let mut ranges = Vec::new();
    let mut next = FIRST_CLOSABLE_FD as u32;
    for fd in kept {
        let fd = fd as u32;
        if fd > next {
            ranges.push((next, fd - 1));
        }
        next = fd + 1;
    }
    ranges.push((next, u32::MAX));
    ranges
}

fn try_close_range(first: u32, last: u32) -> bool {
    // close_range shares one syscall number across architectures
    const SYS_CLOSE_RANGE: libc::c_long = 436;

    let result = unsafe { libc::syscall(SYS_CLOSE_RANGE, first, last, 0u32) };
    result == 0
}

fn close_fds_via_proc(strict_mode: bool, keep: &[RawFd]) -> Result<()> {
    let fds: Vec<RawFd> = get_open_fds()?
        .into_iter()
        .filter(|fd| *fd >= FIRST_CLOSABLE_FD && !keep.contains(fd))
        .collect();

    let mut closed_count = 0;
    let mut failed_closes = Vec::new();

    for fd in fds {
        match close(fd) {
            Ok(()) => closed_count += 1,
            // The directory handle used for the listing is already gone
            Err(nix::errno::Errno::EBADF) => {}
            Err(e) => failed_closes.push((fd, e)),
        }
    }

    if !failed_closes.is_empty() && strict_mode {
        let error_msg = failed_closes
            .iter()
            .map(|(fd, err)| format!("fd {}: {}", fd, err))
            .collect::<Vec<_>>()
            .join(", ");

        return Err(GradeError::Filesystem(format!(
            "Failed to close {} FD(s): {}",
            failed_closes.len(),
            error_msg
        )));
    }

    log::debug!("closed {} inherited FDs via /proc/self/fd", closed_count);
    Ok(())
}

/// Get list of open file descriptors
pub fn get_open_fds() -> Result<Vec<RawFd>> {
    let fd_dir = "/proc/self/fd";

    let entries = fs::read_dir(fd_dir)
        .map_err(|e| GradeError::Filesystem(format!("Failed to read {}: {}", fd_dir, e)))?;

    let mut fds: Vec<RawFd> = entries
        .flatten()
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter_map(|name| name.parse().ok())
        .collect();

    fds.sort_unstable();
    Ok(fds)
}
