/// Pre-exec ordering for the isolated payload.
///
/// The setup sequence is fixed:
/// 1. PR_SET_PDEATHSIG and sandbox hostname
/// 2. mount propagation: / to MS_PRIVATE | MS_REC
/// 3. cgroup attach (host cgroupfs is still visible)
/// 4. bind mounts, read-only remount, chroot
/// 5. rlimits, umask, fd closure, environment, chdir
/// 6. bounding set drop, setresgid, setresuid
/// 7. remaining capabilities and PR_SET_NO_NEW_PRIVS
/// 8. execve
///
/// Each step consumes the previous state, so the order cannot drift.
use crate::config::types::{GradeError, Result};
use crate::core::types::ExecutionProfile;
use crate::kernel::capabilities::{
    clear_remaining_capabilities, drop_bounding_set, no_new_privs_enabled, set_no_new_privs,
};
use crate::kernel::credentials::transition_to_unprivileged;
use crate::kernel::mount::FilesystemSecurity;
use crate::utils::env_hygiene::{EnvHygiene, EnvPolicy, PermissionPolicy};
use std::convert::Infallible;
use std::ffi::CString;
use std::marker::PhantomData;
use std::os::unix::io::RawFd;
use std::path::Path;

/// One resource limit to apply before exec
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RlimitSetting {
    pub name: &'static str,
    pub resource: libc::__rlimit_resource_t,
    pub soft: u64,
    pub hard: u64,
}

/// Limits applied to the payload. No RLIMIT_NPROC: it counts per uid across
/// the host, the cgroup pids ceiling is the process limit.
pub fn rlimit_plan(profile: &ExecutionProfile) -> Vec<RlimitSetting> {
    let mut plan = Vec::new();
    let mut push = |name, resource, soft: u64, hard: u64| {
        plan.push(RlimitSetting {
            name,
            resource,
            soft,
            hard,
        })
    };

    if let Some(limit) = profile.address_space_limit {
        push("RLIMIT_AS", libc::RLIMIT_AS, limit, limit);
    }
    if let Some(limit) = profile.file_size_limit {
        push("RLIMIT_FSIZE", libc::RLIMIT_FSIZE, limit, limit);
    }
    push("RLIMIT_CORE", libc::RLIMIT_CORE, 0, 0);
    push("RLIMIT_MEMLOCK", libc::RLIMIT_MEMLOCK, 0, 0);
    if let Some(limit) = profile.stack_limit {
        push("RLIMIT_STACK", libc::RLIMIT_STACK, limit, limit);
    }
    if let Some(limit) = profile.fd_limit {
        push("RLIMIT_NOFILE", libc::RLIMIT_NOFILE, limit, limit);
    }
    // soft -> SIGXCPU, hard one second later -> SIGKILL
    if let Some(cpu_ms) = profile.cpu_time_limit_ms {
        let secs = ((cpu_ms + 999) / 1000).max(1);
        push("RLIMIT_CPU", libc::RLIMIT_CPU, secs, secs + 1);
    }
    plan
}

/// setrlimit for each entry. Async-signal-safe: no allocation, no logging.
pub fn apply_rlimits(plan: &[RlimitSetting]) -> std::io::Result<()> {
    for setting in plan {
        let limit = libc::rlimit {
            rlim_cur: setting.soft as libc::rlim_t,
            rlim_max: setting.hard as libc::rlim_t,
        };
        // SAFETY: `limit` is a valid rlimit for the duration of the call.
        if unsafe { libc::setrlimit(setting.resource, &limit) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// PR_SET_PDEATHSIG(SIGKILL): die with the parent.
pub fn setup_parent_death_signal() -> Result<()> {
    use nix::sys::prctl;
    use nix::sys::signal::Signal;

    prctl::set_pdeathsig(Signal::SIGKILL)
        .map_err(|e| GradeError::Process(format!("Failed to set parent death signal: {}", e)))
}

fn to_cstrings(items: impl IntoIterator<Item = String>, what: &str) -> Result<Vec<CString>> {
    items
        .into_iter()
        .map(|item| {
            CString::new(item)
                .map_err(|_| GradeError::Config(format!("{} contains NUL byte", what)))
        })
        .collect()
}

pub struct FreshChild;
pub struct NamespacesReady;
pub struct MountsPrivate;
pub struct CgroupAttached;
pub struct RootReady;
pub struct HygieneApplied;
pub struct CredsDropped;
pub struct PrivsLocked;
pub struct ExecReady;

/// Payload child with type-state tracking.
///
/// Each step is only callable from the state before it, so skipping a step
/// or exec'ing early does not compile. `tests/trybuild.rs` pins this down.
pub struct Sandbox<S> {
    pub instance_id: String,
    pub strict_mode: bool,
    exec_env: Vec<CString>,
    _state: PhantomData<S>,
}

impl<S> Sandbox<S> {
    fn advance<T>(self) -> Sandbox<T> {
        Sandbox {
            instance_id: self.instance_id,
            strict_mode: self.strict_mode,
            exec_env: self.exec_env,
            _state: PhantomData,
        }
    }
}

impl Sandbox<FreshChild> {
    pub fn new(instance_id: String, strict_mode: bool) -> Self {
        Self {
            instance_id,
            strict_mode,
            exec_env: Vec::new(),
            _state: PhantomData,
        }
    }

    /// Tie the payload's life to the proxy and name the UTS namespace.
    pub fn bind_lifecycle(self, uts_namespace: bool) -> Result<Sandbox<NamespacesReady>> {
        setup_parent_death_signal()?;
        if uts_namespace {
            crate::kernel::namespace::set_sandbox_hostname()?;
        }
        Ok(self.advance())
    }
}

impl Sandbox<NamespacesReady> {
    pub fn harden_mount_propagation(self) -> Result<Sandbox<MountsPrivate>> {
        crate::kernel::namespace::harden_mount_propagation()?;
        Ok(self.advance())
    }
}

impl Sandbox<MountsPrivate> {
    /// Move this process into its cgroup before any payload code runs.
    /// Writing "0" names the writer, which sidesteps pid namespace translation.
    pub fn attach_to_cgroup(self, cgroup_path: Option<&Path>) -> Result<Sandbox<CgroupAttached>> {
        if let Some(dir) = cgroup_path {
            let procs = dir.join("cgroup.procs");
            std::fs::write(&procs, "0").map_err(|e| {
                GradeError::Cgroup(format!(
                    "Failed to attach payload to cgroup {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        } else if self.strict_mode {
            return Err(GradeError::Cgroup(
                "strict mode requires a cgroup for the payload".to_string(),
            ));
        }
        Ok(self.advance())
    }
}

impl Sandbox<CgroupAttached> {
    pub fn setup_mounts_and_root(self, profile: &ExecutionProfile) -> Result<Sandbox<RootReady>> {
        let jail_root = profile.jail_root.clone().ok_or_else(|| {
            GradeError::Filesystem("isolated launch without a jail root".to_string())
        })?;
        FilesystemSecurity::new(
            jail_root,
            profile.directory_bindings.clone(),
            self.strict_mode,
        )
        .setup_isolation()?;
        Ok(self.advance())
    }
}

impl Sandbox<RootReady> {
    /// rlimits, umask, descriptor closure except `keep_fds`, clean environment, chdir.
    pub fn apply_runtime_hygiene(
        mut self,
        profile: &ExecutionProfile,
        keep_fds: &[RawFd],
    ) -> Result<Sandbox<HygieneApplied>> {
        apply_rlimits(&rlimit_plan(profile))
            .map_err(|e| GradeError::ResourceLimit(format!("setrlimit failed: {}", e)))?;

        let hygiene = EnvHygiene::new(
            EnvPolicy {
                home: profile.workdir.to_string_lossy().into_owned(),
                strict_mode: self.strict_mode,
                ..EnvPolicy::default()
            },
            PermissionPolicy::default(),
        );
        hygiene.apply_umask()?;
        crate::utils::fd_closure::close_inherited_fds(self.strict_mode, keep_fds)?;

        self.exec_env = to_cstrings(hygiene.exec_env(&profile.environment)?, "environment")?;

        nix::unistd::chdir(&profile.workdir).map_err(|e| {
            GradeError::Filesystem(format!(
                "Failed to chdir to {}: {}",
                profile.workdir.display(),
                e
            ))
        })?;
        Ok(self.advance())
    }
}

impl Sandbox<HygieneApplied> {
    /// Empty the bounding set while CAP_SETPCAP is still held, then switch identity.
    pub fn drop_credentials(self, uid: Option<u32>, gid: Option<u32>) -> Result<Sandbox<CredsDropped>> {
        let (uid, gid) = match (uid, gid) {
            (Some(uid), Some(gid)) => (uid, gid),
            _ => {
                return Err(GradeError::Privilege(
                    "isolated launch requires a sandbox uid and gid".to_string(),
                ))
            }
        };
        drop_bounding_set(self.strict_mode)?;
        transition_to_unprivileged(uid, gid, self.strict_mode)?;
        Ok(self.advance())
    }
}

impl Sandbox<CredsDropped> {
    pub fn lock_privileges(self) -> Result<Sandbox<PrivsLocked>> {
        clear_remaining_capabilities()?;
        set_no_new_privs()?;
        if !no_new_privs_enabled()? {
            return Err(GradeError::Privilege(
                "PR_SET_NO_NEW_PRIVS verification failed".to_string(),
            ));
        }
        Ok(self.advance())
    }
}

impl Sandbox<PrivsLocked> {
    pub fn ready_for_exec(self) -> Sandbox<ExecReady> {
        self.advance()
    }
}

impl Sandbox<ExecReady> {
    /// execve with the sanitized environment. Only returns on failure.
    pub fn exec_payload(self, command: &[String]) -> Result<Infallible> {
        if command.is_empty() {
            return Err(GradeError::Config("Empty command for exec".to_string()));
        }
        let argv = to_cstrings(command.iter().cloned(), "command")?;
        nix::unistd::execve(argv[0].as_c_str(), &argv, &self.exec_env)
            .map_err(|e| GradeError::Process(format!("execve {} failed: {}", command[0], e)))
    }
}
