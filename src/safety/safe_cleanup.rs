//! Symlink-safe recursive removal of run directories.
//!
//! Every step is relative to an already-open directory descriptor and never
//! follows symlinks, so a payload that planted links cannot redirect removal
//! outside the run directory. Removal refuses to descend into another
//! filesystem: a leftover bind mount stops cleanup instead of being emptied.

use crate::config::types::{GradeError, Result};
use nix::dir::{Dir, Type};
use nix::fcntl::{AtFlags, OFlag};
use nix::sys::stat::{fstatat, Mode, SFlag};
use nix::unistd::{unlinkat, UnlinkatFlags};
use std::ffi::CStr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

fn dir_flags() -> OFlag {
    OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC | OFlag::O_NOFOLLOW
}

fn fs_error(what: &str, target: impl std::fmt::Debug, err: nix::errno::Errno) -> GradeError {
    GradeError::Filesystem(format!("{} failed for {:?}: {}", what, target, err))
}

fn is_directory(parent_fd: RawFd, name: &CStr) -> Result<(bool, u64)> {
    let st = fstatat(parent_fd, name, AtFlags::AT_SYMLINK_NOFOLLOW)
        .map_err(|e| fs_error("fstatat", name, e))?;
    let kind = SFlag::from_bits_truncate(st.st_mode) & SFlag::S_IFMT;
    Ok((kind == SFlag::S_IFDIR, st.st_dev))
}

fn remove_dir_contents(dir: &mut Dir, root_dev: u64) -> Result<()> {
    let dir_fd = dir.as_raw_fd();

    // Collect first: unlinking while a readdir stream is open may skip entries.
    let mut names = Vec::new();
    for entry in dir.iter() {
        let entry = entry.map_err(|e| fs_error("readdir", dir_fd, e))?;
        let name = entry.file_name();
        if name.to_bytes() == b"." || name.to_bytes() == b".." {
            continue;
        }
        names.push((name.to_owned(), entry.file_type()));
    }

    for (name, hinted_type) in names {
        let is_dir = match hinted_type {
            Some(Type::Directory) | None => {
                let (is_dir, dev) = is_directory(dir_fd, &name)?;
                if is_dir && dev != root_dev {
                    return Err(GradeError::Filesystem(format!(
                        "Refusing to cross filesystem boundary at directory {:?}",
                        name
                    )));
                }
                is_dir
            }
            Some(_) => false,
        };

        if is_dir {
            let mut child = Dir::openat(dir_fd, name.as_c_str(), dir_flags(), Mode::empty())
                .map_err(|e| fs_error("openat", &name, e))?;
            remove_dir_contents(&mut child, root_dev)?;
            drop(child);
            unlinkat(Some(dir_fd), name.as_c_str(), UnlinkatFlags::RemoveDir)
                .map_err(|e| fs_error("unlinkat(dir)", &name, e))?;
        } else {
            unlinkat(Some(dir_fd), name.as_c_str(), UnlinkatFlags::NoRemoveDir)
                .map_err(|e| fs_error("unlinkat", &name, e))?;
        }
    }

    Ok(())
}

/// Remove a tree without following symlinks. A missing path is not an error.
pub fn remove_tree_secure(path: &Path) -> Result<()> {
    if std::fs::symlink_metadata(path).is_err() {
        return Ok(());
    }

    let parent = path.parent().ok_or_else(|| {
        GradeError::Filesystem(format!("Cannot remove path without parent: {}", path.display()))
    })?;
    let name = path.file_name().ok_or_else(|| {
        GradeError::Filesystem(format!(
            "Cannot remove path without file name: {}",
            path.display()
        ))
    })?;

    let parent_dir = Dir::open(parent, dir_flags(), Mode::empty())
        .map_err(|e| fs_error("open", parent, e))?;
    let parent_fd = parent_dir.as_raw_fd();

    let (is_dir, root_dev) = {
        let name_c = std::ffi::CString::new(std::os::unix::ffi::OsStrExt::as_bytes(name))
            .map_err(|_| {
                GradeError::Filesystem(format!(
                    "Path contains NUL byte and cannot be removed safely: {}",
                    path.display()
                ))
            })?;
        is_directory(parent_fd, &name_c)?
    };

    if is_dir {
        let mut dir = Dir::openat(parent_fd, name, dir_flags(), Mode::empty())
            .map_err(|e| fs_error("openat", name, e))?;
        remove_dir_contents(&mut dir, root_dev)?;
        drop(dir);
        unlinkat(Some(parent_fd), name, UnlinkatFlags::RemoveDir)
            .map_err(|e| fs_error("unlinkat(dir)", name, e))?;
    } else {
        unlinkat(Some(parent_fd), name, UnlinkatFlags::NoRemoveDir)
            .map_err(|e| fs_error("unlinkat", name, e))?;
    }

    Ok(())
}
