/// Core types and structures shared across gradebox
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::SystemTime;
use thiserror::Error;

/// Directory binding from the host into the sandbox root
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DirectoryBinding {
    /// Source directory on host system
    pub source: PathBuf,
    /// Target directory within sandbox
    pub target: PathBuf,
    /// Access permissions
    pub permissions: DirectoryPermissions,
    /// Ignore if source doesn't exist
    pub maybe: bool,
}

/// Directory access permissions. Nothing inside a grading sandbox is writable.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum DirectoryPermissions {
    /// Read-only, executables allowed (interpreter and shared libraries)
    ReadOnly,
    /// Read-only data, no execution
    NoExec,
}

impl DirectoryBinding {
    pub fn read_only(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            permissions: DirectoryPermissions::ReadOnly,
            maybe: false,
        }
    }

    pub fn data(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            permissions: DirectoryPermissions::NoExec,
            maybe: false,
        }
    }

    /// Mark the binding optional: a missing source is skipped instead of failing setup.
    pub fn optional(mut self) -> Self {
        self.maybe = true;
        self
    }

    /// Target path relative to the sandbox root, for joining under a host-side root.
    pub fn relative_target(&self) -> PathBuf {
        self.target
            .strip_prefix("/")
            .map(PathBuf::from)
            .unwrap_or_else(|_| self.target.clone())
    }
}

/// Grading engine configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GradeConfig {
    /// Root holding `buffers/shared` and `puzzles/`
    pub data_root: PathBuf,
    /// Parent of the per-run ephemeral directories
    pub runtime_root: PathBuf,
    /// cgroup v2 directory under which per-run groups are created
    pub cgroup_base: PathBuf,
    /// cgroup `memory.max` for the sandbox
    pub memory_limit_bytes: u64,
    /// RLIMIT_AS for the interpreter, lets the runner see MemoryError early
    pub address_space_limit_bytes: Option<u64>,
    /// cgroup `pids.max` for the sandbox
    pub process_limit: u32,
    /// Supervisor wall-clock deadline
    pub wall_time_limit_ms: u64,
    /// RLIMIT_CPU, rounded up to whole seconds
    pub cpu_time_limit_ms: Option<u64>,
    /// Capture limit for stdout, stderr and the result channel
    pub output_limit_bytes: u64,
    /// RLIMIT_FSIZE
    pub file_size_limit_bytes: u64,
    /// RLIMIT_STACK
    pub stack_limit_bytes: u64,
    /// RLIMIT_NOFILE
    pub fd_limit: u64,
    /// Interpreter executed inside the sandbox
    pub python_path: PathBuf,
    pub sandbox_uid: u32,
    pub sandbox_gid: u32,
    /// Mount oracle files at /puzzle and let the runner self-score
    pub expose_oracle: bool,
    /// Permit non-root runs without namespace isolation
    pub allow_degraded: bool,
    /// Fail hard when a configured control cannot be applied
    pub strict_mode: bool,
    pub audit_log_path: Option<PathBuf>,
    /// Host directories bound read-only into the sandbox root
    pub readonly_system_dirs: Vec<PathBuf>,
    /// Run directories older than this are swept at controller start
    pub stale_run_max_age_secs: u64,
}

impl GradeConfig {
    /// Runtime root directory scoped by effective UID.
    /// Prevents root and non-root runs from colliding on a shared temp dir.
    pub fn runtime_root_dir() -> PathBuf {
        let euid = unsafe { libc::geteuid() };
        std::env::temp_dir().join(format!("gradebox-uid-{}", euid))
    }

    pub fn corpus_dir(&self) -> PathBuf {
        self.data_root.join("buffers").join("shared")
    }

    pub fn puzzles_dir(&self) -> PathBuf {
        self.data_root.join("puzzles")
    }

    pub fn limit_snapshot(&self) -> LimitSnapshot {
        LimitSnapshot {
            cpu_limit_ms: self.cpu_time_limit_ms,
            wall_limit_ms: Some(self.wall_time_limit_ms),
            memory_limit_bytes: Some(self.memory_limit_bytes),
            process_limit: Some(self.process_limit),
            output_limit_bytes: Some(self.output_limit_bytes),
        }
    }
}

impl Default for GradeConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("."),
            runtime_root: Self::runtime_root_dir(),
            cgroup_base: PathBuf::from("/sys/fs/cgroup/gradebox"),
            memory_limit_bytes: 64 * 1024 * 1024,
            address_space_limit_bytes: Some(256 * 1024 * 1024),
            process_limit: 100,
            wall_time_limit_ms: 3_000,
            cpu_time_limit_ms: Some(3_000),
            output_limit_bytes: 1024 * 1024,
            file_size_limit_bytes: 1024 * 1024,
            stack_limit_bytes: 8 * 1024 * 1024,
            fd_limit: 64,
            python_path: PathBuf::from("/usr/bin/python3"),
            sandbox_uid: 65534, // nobody
            sandbox_gid: 65534, // nogroup
            expose_oracle: false,
            allow_degraded: false,
            strict_mode: true,
            audit_log_path: None,
            readonly_system_dirs: ["/usr", "/lib", "/lib64", "/bin"]
                .iter()
                .map(PathBuf::from)
                .collect(),
            stale_run_max_age_secs: 3_600,
        }
    }
}

/// Verdict actor - who made the termination decision
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum VerdictActor {
    /// Supervisor watchdog initiated termination
    #[serde(rename = "judge")]
    Judge,
    /// Kernel enforced limit
    #[serde(rename = "kernel")]
    Kernel,
    /// Submission or runner behavior
    #[serde(rename = "runtime")]
    Runtime,
    /// The sandbox itself could not be established or torn down
    #[serde(rename = "infrastructure")]
    Infrastructure,
}

/// Verdict cause - specific reason behind a classification
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum VerdictCause {
    #[serde(rename = "tle_wall_judge")]
    TleWallJudge,
    #[serde(rename = "tle_cpu_kernel")]
    TleCpuKernel,
    #[serde(rename = "mle_kernel_oom")]
    MleKernelOom,
    #[serde(rename = "mle_runner_memory_error")]
    MleRunnerMemoryError,
    #[serde(rename = "ple_pids_max")]
    PlePidsMax,
    #[serde(rename = "re_nonzero_exit")]
    ReNonzeroExit,
    #[serde(rename = "re_fatal_signal")]
    ReFatalSignal,
    #[serde(rename = "ie_setup_failure")]
    IeSetupFailure,
    #[serde(rename = "ie_supervisor_failure")]
    IeSupervisorFailure,
    #[serde(rename = "normal_exit")]
    NormalExit,
}

/// Output integrity classification
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub enum OutputIntegrity {
    #[default]
    #[serde(rename = "complete")]
    Complete,
    #[serde(rename = "truncated_by_judge_limit")]
    TruncatedByJudgeLimit,
    #[serde(rename = "truncated_by_program_close")]
    TruncatedByProgramClose,
    #[serde(rename = "write_error")]
    WriteError,
}

impl std::fmt::Display for OutputIntegrity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputIntegrity::Complete => write!(f, "complete"),
            OutputIntegrity::TruncatedByJudgeLimit => write!(f, "truncated_by_judge_limit"),
            OutputIntegrity::TruncatedByProgramClose => write!(f, "truncated_by_program_close"),
            OutputIntegrity::WriteError => write!(f, "write_error"),
        }
    }
}

/// Custom error types for gradebox
#[derive(Error, Debug)]
pub enum GradeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cgroup error: {0}")]
    Cgroup(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Namespace isolation error: {0}")]
    Namespace(String),

    #[error("Resource limit error: {0}")]
    ResourceLimit(String),

    #[error("Filesystem error: {0}")]
    Filesystem(String),

    #[error("Privilege error: {0}")]
    Privilege(String),

    #[error("Corpus error: {0}")]
    Corpus(String),

    #[error("Oracle error: {0}")]
    Oracle(String),

    #[error("Puzzle not found: {0}")]
    PuzzleNotFound(String),

    #[error("Result protocol error: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, GradeError>;

impl From<nix::errno::Errno> for GradeError {
    fn from(err: nix::errno::Errno) -> Self {
        GradeError::Process(err.to_string())
    }
}

impl From<serde_json::Error> for GradeError {
    fn from(err: serde_json::Error) -> Self {
        GradeError::Protocol(err.to_string())
    }
}

/// Judge action during execution
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JudgeAction {
    pub timestamp: SystemTime,
    pub action_type: JudgeActionType,
    pub details: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum JudgeActionType {
    #[serde(rename = "signal_sent")]
    SignalSent,
    #[serde(rename = "forced_kill")]
    ForcedKill,
}

/// Cgroup evidence from resource accounting
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct CgroupEvidence {
    /// Memory usage peak
    pub memory_peak: Option<u64>,
    /// Memory limit
    pub memory_limit: Option<u64>,
    /// `oom` counter from memory.events
    pub oom_events: u64,
    /// `oom_kill` counter from memory.events
    pub oom_kill_events: u64,
    /// `max` counter from pids.events (fork refused at the ceiling)
    pub pids_max_events: u64,
    /// Process count
    pub process_count: Option<u32>,
    /// Process limit
    pub process_limit: Option<u32>,
}

impl CgroupEvidence {
    pub fn memory_ceiling_hit(&self) -> bool {
        self.oom_events > 0 || self.oom_kill_events > 0
    }

    pub fn process_ceiling_hit(&self) -> bool {
        self.pids_max_events > 0
    }
}

/// Verdict provenance: who decided, why, from which evidence
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VerdictProvenance {
    pub verdict_actor: VerdictActor,
    pub verdict_cause: VerdictCause,
    pub verdict_evidence_sources: Vec<String>,
    pub termination_signal: Option<i32>,
    pub wall_time_used: f64,
    pub memory_peak: u64,
    pub limit_snapshot: LimitSnapshot,
    pub evidence_collection_errors: Vec<String>,
}

/// Limit snapshot at execution time
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct LimitSnapshot {
    pub cpu_limit_ms: Option<u64>,
    pub wall_limit_ms: Option<u64>,
    pub memory_limit_bytes: Option<u64>,
    pub process_limit: Option<u32>,
    pub output_limit_bytes: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_grading_envelope() {
        let config = GradeConfig::default();
        assert_eq!(config.memory_limit_bytes, 64 * 1024 * 1024);
        assert_eq!(config.process_limit, 100);
        assert_eq!(config.wall_time_limit_ms, 3_000);
        assert!(config.strict_mode);
        assert!(!config.allow_degraded);
        assert!(!config.expose_oracle);
        assert_eq!(config.sandbox_uid, 65534);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: GradeConfig =
            serde_json::from_str(r#"{"data_root": "/srv/puzzles", "expose_oracle": true}"#)
                .unwrap();
        assert_eq!(config.data_root, PathBuf::from("/srv/puzzles"));
        assert!(config.expose_oracle);
        assert_eq!(config.process_limit, 100);
        assert_eq!(config.corpus_dir(), PathBuf::from("/srv/puzzles/buffers/shared"));
    }

    #[test]
    fn binding_relative_target_strips_root() {
        let binding = DirectoryBinding::data("/srv/data", "/buffers/shared");
        assert_eq!(binding.relative_target(), PathBuf::from("buffers/shared"));
        assert_eq!(binding.permissions, DirectoryPermissions::NoExec);
        assert!(DirectoryBinding::read_only("/lib64", "/lib64").optional().maybe);
    }

    #[test]
    fn cgroup_evidence_flags() {
        let mut evidence = CgroupEvidence::default();
        assert!(!evidence.memory_ceiling_hit());
        evidence.oom_kill_events = 1;
        assert!(evidence.memory_ceiling_hit());
        evidence.pids_max_events = 3;
        assert!(evidence.process_ceiling_hit());
    }
}
