/// Cgroup v2 backend
///
/// Each run gets `<base>/<instance_id>` with `memory.max`, `memory.oom.group=1`
/// and `pids.max`. Evidence comes from `memory.peak`, `memory.events` and
/// `pids.events` after the payload exits.
use crate::config::types::{CgroupEvidence, GradeError, Result};
use crate::kernel::cgroup::backend::CgroupBackend;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs;
use std::path::{Path, PathBuf};

const CONTROLLERS: &str = "+memory +pids";

/// Cgroup v2 backend
pub struct CgroupV2 {
    base_path: PathBuf,
    strict_mode: bool,
}

fn read_trimmed(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| GradeError::Cgroup(format!("Failed to read {}: {}", path.display(), e)))
}

fn parse_u64(path: &Path, content: &str) -> Result<u64> {
    content
        .parse::<u64>()
        .map_err(|e| GradeError::Cgroup(format!("Failed to parse {}: {}", path.display(), e)))
}

/// `max` means unlimited
fn parse_limit(content: &str) -> Option<u64> {
    if content == "max" {
        None
    } else {
        content.parse().ok()
    }
}

/// Counter from a flat-keyed file such as memory.events (`oom 0\noom_kill 1`).
fn flat_keyed_counter(content: &str, key: &str) -> u64 {
    content
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some(k), Some(v)) if k == key => v.parse::<u64>().ok(),
                _ => None,
            }
        })
        .next()
        .unwrap_or(0)
}

impl CgroupV2 {
    pub fn new(base_path: &Path, strict_mode: bool) -> Result<Self> {
        if base_path.as_os_str().is_empty() {
            return Err(GradeError::Cgroup("cgroup base path is empty".to_string()));
        }
        Ok(CgroupV2 {
            base_path: base_path.to_path_buf(),
            strict_mode,
        })
    }

    fn instance_path(&self, instance_id: &str) -> PathBuf {
        self.base_path.join(instance_id)
    }

    /// Make memory and pids controllers available to children of `dir`.
    fn enable_controllers(&self, dir: &Path) -> Result<()> {
        let control = dir.join("cgroup.subtree_control");
        if let Err(e) = fs::write(&control, CONTROLLERS) {
            let msg = format!("Failed to enable controllers in {}: {}", control.display(), e);
            if self.strict_mode {
                return Err(GradeError::Cgroup(msg));
            }
            log::warn!("{}", msg);
        }
        Ok(())
    }

    fn ensure_base(&self) -> Result<()> {
        if !self.base_path.exists() {
            if let Some(parent) = self.base_path.parent() {
                self.enable_controllers(parent)?;
            }
            fs::create_dir_all(&self.base_path).map_err(|e| {
                GradeError::Cgroup(format!(
                    "Failed to create cgroup base {}: {}",
                    self.base_path.display(),
                    e
                ))
            })?;
        }
        self.enable_controllers(&self.base_path)
    }

    /// memory.peak (kernel 5.19+) with fallback to memory.current
    fn read_memory_peak(&self, instance_id: &str) -> Result<u64> {
        let path = self.instance_path(instance_id);
        let peak_path = path.join("memory.peak");
        if peak_path.exists() {
            let content = read_trimmed(&peak_path)?;
            return parse_u64(&peak_path, &content);
        }
        let current_path = path.join("memory.current");
        let content = read_trimmed(&current_path)?;
        parse_u64(&current_path, &content)
    }

    fn read_events(&self, instance_id: &str, file: &str) -> Result<Option<String>> {
        let path = self.instance_path(instance_id).join(file);
        if !path.exists() {
            return Ok(None);
        }
        read_trimmed(&path).map(Some)
    }

    fn read_procs(&self, instance_id: &str) -> Result<Vec<i32>> {
        let path = self.instance_path(instance_id).join("cgroup.procs");
        let content = read_trimmed(&path)?;
        Ok(content
            .lines()
            .filter_map(|line| line.trim().parse::<i32>().ok())
            .collect())
    }
}

impl CgroupBackend for CgroupV2 {
    fn backend_name(&self) -> &str {
        "cgroup_v2"
    }

    fn create(&self, instance_id: &str) -> Result<()> {
        self.ensure_base()?;
        let path = self.instance_path(instance_id);

        fs::create_dir(&path).map_err(|e| {
            GradeError::Cgroup(format!("Failed to create cgroup {}: {}", path.display(), e))
        })?;

        // Kill the whole group on OOM so no half-dead interpreter lingers.
        let oom_group_path = path.join("memory.oom.group");
        if oom_group_path.exists() {
            if let Err(e) = fs::write(&oom_group_path, "1") {
                if self.strict_mode {
                    return Err(GradeError::Cgroup(format!(
                        "Failed to set memory.oom.group: {}",
                        e
                    )));
                }
                log::warn!("Failed to set memory.oom.group (permissive mode): {}", e);
            }
        }

        Ok(())
    }

    fn remove(&self, instance_id: &str) -> Result<()> {
        let path = self.instance_path(instance_id);
        match fs::remove_dir(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(GradeError::Cgroup(format!(
                "Failed to remove cgroup {}: {}",
                path.display(),
                e
            ))),
        }
    }

    fn attach_process(&self, instance_id: &str, pid: u32) -> Result<()> {
        let procs_path = self.instance_path(instance_id).join("cgroup.procs");
        fs::write(&procs_path, pid.to_string()).map_err(|e| {
            GradeError::Cgroup(format!("Failed to attach process {} to cgroup: {}", pid, e))
        })
    }

    fn set_memory_limit(&self, instance_id: &str, limit_bytes: u64) -> Result<()> {
        let path = self.instance_path(instance_id);
        fs::write(path.join("memory.max"), limit_bytes.to_string())
            .map_err(|e| GradeError::Cgroup(format!("Failed to set memory limit: {}", e)))?;

        // Without swap off, memory.max alone lets the group page out instead of OOMing.
        let swap = path.join("memory.swap.max");
        if swap.exists() {
            if let Err(e) = fs::write(&swap, "0") {
                log::warn!("Failed to disable swap for cgroup {}: {}", instance_id, e);
            }
        }
        Ok(())
    }

    fn set_process_limit(&self, instance_id: &str, limit: u32) -> Result<()> {
        let path = self.instance_path(instance_id).join("pids.max");
        fs::write(&path, limit.to_string())
            .map_err(|e| GradeError::Cgroup(format!("Failed to set process limit: {}", e)))
    }

    fn get_memory_peak(&self, instance_id: &str) -> Result<u64> {
        self.read_memory_peak(instance_id)
    }

    fn get_process_count(&self, instance_id: &str) -> Result<u32> {
        let path = self.instance_path(instance_id).join("pids.current");
        let content = read_trimmed(&path)?;
        parse_u64(&path, &content).map(|count| count as u32)
    }

    fn kill_all(&self, instance_id: &str) -> Result<()> {
        let kill_path = self.instance_path(instance_id).join("cgroup.kill");
        if kill_path.exists() && fs::write(&kill_path, "1").is_ok() {
            return Ok(());
        }

        // cgroup.kill needs 5.14+; fall back to signalling each member.
        for pid in self.read_procs(instance_id)? {
            match kill(Pid::from_raw(pid), Signal::SIGKILL) {
                Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
                Err(e) => {
                    return Err(GradeError::Cgroup(format!(
                        "Failed to kill cgroup member {}: {}",
                        pid, e
                    )))
                }
            }
        }
        Ok(())
    }

    fn collect_evidence(&self, instance_id: &str) -> Result<CgroupEvidence> {
        let path = self.instance_path(instance_id);
        let memory_events = self.read_events(instance_id, "memory.events")?.unwrap_or_default();
        let pids_events = self.read_events(instance_id, "pids.events")?.unwrap_or_default();

        let memory_limit = read_trimmed(&path.join("memory.max"))
            .ok()
            .and_then(|c| parse_limit(&c));
        let process_limit = read_trimmed(&path.join("pids.max"))
            .ok()
            .and_then(|c| parse_limit(&c))
            .map(|limit| limit as u32);

        Ok(CgroupEvidence {
            memory_peak: self.read_memory_peak(instance_id).ok(),
            memory_limit,
            oom_events: flat_keyed_counter(&memory_events, "oom"),
            oom_kill_events: flat_keyed_counter(&memory_events, "oom_kill"),
            pids_max_events: flat_keyed_counter(&pids_events, "max"),
            process_count: self.get_process_count(instance_id).ok(),
            process_limit,
        })
    }

    fn get_cgroup_path(&self, instance_id: &str) -> PathBuf {
        self.instance_path(instance_id)
    }

    fn is_empty(&self, instance_id: &str) -> Result<bool> {
        Ok(self.read_procs(instance_id)?.is_empty())
    }
}
