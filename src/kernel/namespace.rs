/// Namespace selection for the sandbox.
///
/// The namespaces are created by `clone(2)` in the supervisor, so the proxy
/// and everything it forks start inside them. The fresh network namespace
/// is left with its loopback down: the payload has no reachable interface.
use crate::config::types::{GradeError, Result};
use nix::sched::CloneFlags;

pub const SANDBOX_HOSTNAME: &str = "gradebox";

/// Namespaces entered by the cloned proxy
#[derive(Debug, Clone, PartialEq)]
pub struct NamespaceIsolation {
    pub pid: bool,
    pub ipc: bool,
    pub uts: bool,
    pub mount: bool,
    pub network: bool,
}

impl NamespaceIsolation {
    /// Every namespace a grading run needs
    pub fn for_grading() -> Self {
        Self {
            pid: true,
            ipc: true,
            uts: true,
            mount: true,
            network: true,
        }
    }

    /// Nothing unshared; the degraded launch path
    pub fn none() -> Self {
        Self {
            pid: false,
            ipc: false,
            uts: false,
            mount: false,
            network: false,
        }
    }

    pub fn is_supported() -> bool {
        std::fs::read_dir("/proc/self/ns").is_ok()
    }

    pub fn clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::empty();
        if self.pid {
            flags |= CloneFlags::CLONE_NEWPID;
        }
        if self.ipc {
            flags |= CloneFlags::CLONE_NEWIPC;
        }
        if self.uts {
            flags |= CloneFlags::CLONE_NEWUTS;
        }
        if self.mount {
            flags |= CloneFlags::CLONE_NEWNS;
        }
        if self.network {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        flags
    }

    pub fn enabled_namespaces(&self) -> Vec<&'static str> {
        [
            (self.pid, "pid"),
            (self.ipc, "ipc"),
            (self.uts, "uts"),
            (self.mount, "mount"),
            (self.network, "network"),
        ]
        .iter()
        .filter(|(enabled, _)| *enabled)
        .map(|(_, name)| *name)
        .collect()
    }
}

/// Give the UTS namespace a fixed hostname so the host's name does not leak.
pub fn set_sandbox_hostname() -> Result<()> {
    nix::unistd::sethostname(SANDBOX_HOSTNAME)
        .map_err(|e| GradeError::Namespace(format!("Failed to set sandbox hostname: {}", e)))
}

/// mount(NULL, "/", NULL, MS_REC | MS_PRIVATE, NULL)
///
/// Must succeed before any mount is made, or sandbox mounts could propagate
/// back to the host.
pub fn harden_mount_propagation() -> Result<()> {
    use nix::mount::{mount, MsFlags};

    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| {
        GradeError::Namespace(format!(
            "Failed to make mount propagation private (MS_PRIVATE|MS_REC on /): {}",
            e
        ))
    })
}
