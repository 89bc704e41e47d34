/// Read-only jail construction, run inside the payload child.
///
/// Requires a private mount namespace (see `harden_mount_propagation`).
/// Sequence: bind the jail root onto itself, bind every directory, mount
/// proc and a minimal /dev, remount everything read-only, chroot.
use crate::config::types::{DirectoryBinding, DirectoryPermissions, GradeError, Result};
use nix::mount::{mount, MsFlags};
use nix::sys::stat::{fchmodat, makedev, mknod, FchmodatFlags, Mode, SFlag};
use std::path::{Path, PathBuf};

const PROC_TARGET: &str = "/proc";
const DEV_TARGET: &str = "/dev";

/// Device nodes available inside the jail
const DEVICES: &[(&str, u64, u64)] = &[("null", 1, 3), ("zero", 1, 5), ("urandom", 1, 9)];

/// Flags for the read-only remount of a binding.
pub fn remount_flags(permissions: &DirectoryPermissions) -> MsFlags {
    let base = MsFlags::MS_REMOUNT
        | MsFlags::MS_BIND
        | MsFlags::MS_RDONLY
        | MsFlags::MS_NOSUID
        | MsFlags::MS_NODEV;
    match permissions {
        DirectoryPermissions::ReadOnly => base,
        DirectoryPermissions::NoExec => base | MsFlags::MS_NOEXEC,
    }
}

/// Every directory the jail skeleton needs before the child mounts into it.
pub fn jail_mount_points(bindings: &[DirectoryBinding]) -> Vec<PathBuf> {
    let mut points: Vec<PathBuf> = bindings.iter().map(|b| b.target.clone()).collect();
    points.push(PathBuf::from(PROC_TARGET));
    points.push(PathBuf::from(DEV_TARGET));
    points
}

fn mount_error(what: &str, target: &Path, err: nix::errno::Errno) -> GradeError {
    GradeError::Filesystem(format!("{} at {} failed: {}", what, target.display(), err))
}

/// Filesystem isolation for one run
#[derive(Clone, Debug)]
pub struct FilesystemSecurity {
    jail_root: PathBuf,
    bindings: Vec<DirectoryBinding>,
    strict_mode: bool,
}

impl FilesystemSecurity {
    pub fn new(jail_root: PathBuf, bindings: Vec<DirectoryBinding>, strict_mode: bool) -> Self {
        Self {
            jail_root,
            bindings,
            strict_mode,
        }
    }

    pub fn jail_root(&self) -> &Path {
        &self.jail_root
    }

    pub fn bindings(&self) -> &[DirectoryBinding] {
        &self.bindings
    }

    fn host_target(&self, sandbox_path: &Path) -> PathBuf {
        self.jail_root
            .join(sandbox_path.strip_prefix("/").unwrap_or(sandbox_path))
    }

    /// Build the jail and chroot into it. Only safe in the forked payload child.
    pub fn setup_isolation(&self) -> Result<()> {
        mount(
            Some(&self.jail_root),
            &self.jail_root,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|e| mount_error("bind jail root", &self.jail_root, e))?;

        let mut mounted = Vec::new();
        for binding in &self.bindings {
            if let Some(target) = self.bind_directory(binding)? {
                mounted.push((target, binding.permissions.clone()));
            }
        }

        self.mount_procfs()?;
        self.mount_devfs()?;

        for (target, permissions) in &mounted {
            mount(
                None::<&str>,
                target,
                None::<&str>,
                remount_flags(permissions),
                None::<&str>,
            )
            .map_err(|e| mount_error("read-only remount", target, e))?;
        }

        mount(
            None::<&str>,
            &self.jail_root,
            None::<&str>,
            remount_flags(&DirectoryPermissions::ReadOnly),
            None::<&str>,
        )
        .map_err(|e| mount_error("read-only remount of jail root", &self.jail_root, e))?;

        self.apply_chroot()
    }

    fn bind_directory(&self, binding: &DirectoryBinding) -> Result<Option<PathBuf>> {
        if !binding.source.exists() {
            if binding.maybe {
                return Ok(None);
            }
            return Err(GradeError::Filesystem(format!(
                "bind source missing: {}",
                binding.source.display()
            )));
        }

        let target = self.host_target(&binding.target);
        if !target.is_dir() {
            return Err(GradeError::Filesystem(format!(
                "jail mount point missing: {}",
                target.display()
            )));
        }

        mount(
            Some(&binding.source),
            &target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|e| mount_error("bind mount", &target, e))?;
        Ok(Some(target))
    }

    fn mount_procfs(&self) -> Result<()> {
        let target = self.host_target(Path::new(PROC_TARGET));
        let result = mount(
            Some("proc"),
            &target,
            Some("proc"),
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
            None::<&str>,
        );
        match result {
            Ok(()) => Ok(()),
            Err(e) if !self.strict_mode => {
                log::warn!("Skipping /proc in sandbox: {}", e);
                Ok(())
            }
            Err(e) => Err(mount_error("proc mount", &target, e)),
        }
    }

    fn mount_devfs(&self) -> Result<()> {
        let target = self.host_target(Path::new(DEV_TARGET));
        mount(
            Some("tmpfs"),
            &target,
            Some("tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NOATIME,
            Some("size=64k,mode=755"),
        )
        .map_err(|e| mount_error("tmpfs /dev", &target, e))?;

        for (name, major, minor) in DEVICES {
            let node = target.join(name);
            let mode = Mode::from_bits_truncate(0o666);
            mknod(&node, SFlag::S_IFCHR, mode, makedev(*major, *minor))
                .map_err(|e| mount_error("mknod", &node, e))?;
            // mknod honours the inherited umask
            fchmodat(None, &node, mode, FchmodatFlags::FollowSymlink)
                .map_err(|e| mount_error("chmod", &node, e))?;
        }

        mount(
            None::<&str>,
            &target,
            None::<&str>,
            MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
            None::<&str>,
        )
        .map_err(|e| mount_error("read-only remount", &target, e))
    }

    fn apply_chroot(&self) -> Result<()> {
        nix::unistd::chroot(&self.jail_root).map_err(|e| mount_error("chroot", &self.jail_root, e))?;
        nix::unistd::chdir("/").map_err(|e| mount_error("chdir", Path::new("/"), e))
    }
}
