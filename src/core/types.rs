use crate::config::types::{CgroupEvidence, DirectoryBinding, JudgeAction, OutputIntegrity};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How the payload is launched
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum IsolationMode {
    /// clone(2) into fresh namespaces, chroot jail, cgroup, credential drop
    Isolated,
    /// Plain child process on the host filesystem, wall-clock kill only
    Degraded,
}

impl std::fmt::Display for IsolationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IsolationMode::Isolated => write!(f, "isolated"),
            IsolationMode::Degraded => write!(f, "degraded"),
        }
    }
}

/// Runtime execution profile consumed by sandbox core.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionProfile {
    /// argv; `command[0]` is an absolute interpreter path
    pub command: Vec<String>,
    pub environment: Vec<(String, String)>,
    /// Working directory as seen by the payload
    pub workdir: PathBuf,
    pub isolation: IsolationMode,
    /// Host directory the payload chroots into (isolated only)
    pub jail_root: Option<PathBuf>,
    pub directory_bindings: Vec<DirectoryBinding>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub strict_mode: bool,
    pub memory_limit: Option<u64>,
    pub process_limit: Option<u32>,
    pub address_space_limit: Option<u64>,
    pub file_size_limit: Option<u64>,
    pub stack_limit: Option<u64>,
    pub fd_limit: Option<u64>,
    pub cpu_time_limit_ms: Option<u64>,
    pub wall_time_limit_ms: u64,
    /// Capture limit for each of stdout, stderr and the result channel
    pub output_limit: u64,
}

/// Host->proxy launch contract.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SandboxLaunchRequest {
    pub instance_id: String,
    pub profile: ExecutionProfile,
    /// cgroup the payload moves itself into before mounting the jail
    pub cgroup_attach_path: Option<PathBuf>,
}

/// Signal escalation report for timeout/forced termination paths.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KillReport {
    pub term_sent: bool,
    pub kill_sent: bool,
    pub waited_ms: u64,
    pub notes: Vec<String>,
}

/// Runtime evidence produced by core.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LaunchEvidence {
    pub isolation: IsolationMode,
    pub running_as_root: bool,
    pub configured_controls: Vec<String>,
    pub applied_controls: Vec<String>,
    pub missing_controls: Vec<String>,
    pub judge_actions: Vec<JudgeAction>,
    pub cgroup_evidence: Option<CgroupEvidence>,
    pub evidence_collection_errors: Vec<String>,
    /// Set when a SIGINT/SIGTERM to the grading process cut the run short
    pub interrupted_by: Option<i32>,
}

/// Proxy->host status payload transferred through status pipe.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProxyStatus {
    pub payload_pid: Option<i32>,
    pub exit_code: Option<i32>,
    pub term_signal: Option<i32>,
    pub timed_out: bool,
    pub wall_time_ms: u64,
    pub stdout: String,
    pub stderr: String,
    pub output_integrity: OutputIntegrity,
    /// Bytes read from the payload's fd 3, hex encoded
    pub result_channel: String,
    pub result_integrity: OutputIntegrity,
    /// Pre-exec failure reported by the payload child before it could exec
    pub setup_error: Option<String>,
    /// Proxy or supervisor failure unrelated to the payload
    pub internal_error: Option<String>,
    pub reaped_descendants: u32,
}

impl ProxyStatus {
    pub fn result_bytes(&self) -> Vec<u8> {
        hex::decode(&self.result_channel).unwrap_or_default()
    }
}

/// Core launch output.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SandboxLaunchOutcome {
    pub proxy_host_pid: i32,
    pub payload_host_pid: Option<i32>,
    pub evidence: LaunchEvidence,
    pub kill_report: Option<KillReport>,
    pub status: ProxyStatus,
}
