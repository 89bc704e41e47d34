//! Per-run executor: owns the cgroup around a single sandbox launch.
use crate::config::types::{GradeError, Result};
use crate::core::supervisor::launch_with_supervisor;
use crate::core::types::{ExecutionProfile, IsolationMode, SandboxLaunchOutcome, SandboxLaunchRequest};
use crate::kernel::cgroup::{create_cgroup_backend, CgroupBackend};
use std::path::Path;
use std::time::Duration;

const REMOVE_ATTEMPTS: u32 = 20;
const REMOVE_BACKOFF: Duration = Duration::from_millis(10);

pub struct SandboxExecutor {
    instance_id: String,
    cgroup: Option<Box<dyn CgroupBackend>>,
}

impl SandboxExecutor {
    /// Create the executor and, for isolated runs, the run's cgroup.
    ///
    /// An isolated run without a cgroup has no memory or process ceiling,
    /// so cgroup failures are fatal there. Degraded runs never get one.
    pub fn new(
        instance_id: impl Into<String>,
        cgroup_base: &Path,
        isolation: IsolationMode,
        strict_mode: bool,
    ) -> Result<Self> {
        let instance_id = instance_id.into();
        let cgroup = match isolation {
            IsolationMode::Degraded => None,
            IsolationMode::Isolated => {
                let backend = create_cgroup_backend(cgroup_base, strict_mode)?;
                backend.create(&instance_id)?;
                log::debug!(
                    "Created {} cgroup for {}",
                    backend.backend_name(),
                    instance_id
                );
                Some(backend)
            }
        };

        Ok(Self {
            instance_id,
            cgroup,
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn setup_resource_limits(&self, profile: &ExecutionProfile) -> Result<()> {
        if let Some(ref cgroup) = self.cgroup {
            if let Some(memory_limit) = profile.memory_limit {
                cgroup.set_memory_limit(&self.instance_id, memory_limit)?;
            }
            if let Some(process_limit) = profile.process_limit {
                cgroup.set_process_limit(&self.instance_id, process_limit)?;
            }
        } else if profile.isolation == IsolationMode::Isolated {
            return Err(GradeError::Cgroup(
                "Resource limits cannot be enforced without cgroups".to_string(),
            ));
        }
        Ok(())
    }

    /// Launch `profile` once and tear the cgroup down afterwards.
    pub fn execute(&mut self, profile: ExecutionProfile) -> Result<SandboxLaunchOutcome> {
        if profile.command.is_empty() {
            return Err(GradeError::Config("Empty command provided".to_string()));
        }
        self.setup_resource_limits(&profile)?;

        let request = SandboxLaunchRequest {
            instance_id: self.instance_id.clone(),
            cgroup_attach_path: self
                .cgroup
                .as_ref()
                .map(|cg| cg.get_cgroup_path(&self.instance_id)),
            profile,
        };

        let mut outcome = launch_with_supervisor(request, self.cgroup.as_deref())?;

        if let Err(err) = self.cleanup() {
            outcome
                .evidence
                .evidence_collection_errors
                .push(format!("executor_cleanup: {err}"));
        }

        Ok(outcome)
    }

    /// Kill anything left in the cgroup and remove it.
    pub fn cleanup(&mut self) -> Result<()> {
        let Some(cgroup) = self.cgroup.take() else {
            return Ok(());
        };

        if !cgroup.is_empty(&self.instance_id).unwrap_or(true) {
            if let Err(err) = cgroup.kill_all(&self.instance_id) {
                log::warn!("kill_all failed for {}: {}", self.instance_id, err);
            }
        }

        let mut last_err = None;
        for _ in 0..REMOVE_ATTEMPTS {
            match cgroup.remove(&self.instance_id) {
                Ok(()) => return Ok(()),
                // Killed members take a moment to leave the group.
                Err(err) => last_err = Some(err),
            }
            std::thread::sleep(REMOVE_BACKOFF);
        }
        Err(last_err.unwrap_or_else(|| {
            GradeError::Cgroup(format!("failed to remove cgroup for {}", self.instance_id))
        }))
    }
}

impl Drop for SandboxExecutor {
    fn drop(&mut self) {
        if self.cgroup.is_some() {
            if let Err(err) = self.cleanup() {
                log::warn!(
                    "SandboxExecutor drop cleanup failed for {}: {}",
                    self.instance_id,
                    err
                );
            }
        }
    }
}
