//! Where the runner finds its inputs, and the files that make up a run workspace.

use crate::runner::protocol::RESULT_FD;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

/// Corpus mount point inside the sandbox.
pub const SANDBOX_CORPUS_DIR: &str = "/buffers/shared";
/// Oracle mount point inside the sandbox (only when exposed).
pub const SANDBOX_ORACLE_DIR: &str = "/puzzle";
/// Workspace mount point inside the sandbox.
pub const SANDBOX_WORKSPACE_DIR: &str = "/workspace";

/// Paths as the runner sees them. Mount points under full isolation,
/// host paths in degraded mode.
#[derive(Clone, Debug, PartialEq)]
pub struct HarnessLayout {
    pub corpus_dir: PathBuf,
    pub oracle_dir: Option<PathBuf>,
    pub workspace_dir: PathBuf,
    pub result_fd: RawFd,
}

impl HarnessLayout {
    pub fn isolated(expose_oracle: bool) -> Self {
        Self {
            corpus_dir: PathBuf::from(SANDBOX_CORPUS_DIR),
            oracle_dir: expose_oracle.then(|| PathBuf::from(SANDBOX_ORACLE_DIR)),
            workspace_dir: PathBuf::from(SANDBOX_WORKSPACE_DIR),
            result_fd: RESULT_FD,
        }
    }

    pub fn host(corpus_dir: &Path, oracle_dir: Option<&Path>, workspace_dir: &Path) -> Self {
        Self {
            corpus_dir: corpus_dir.to_path_buf(),
            oracle_dir: oracle_dir.map(Path::to_path_buf),
            workspace_dir: workspace_dir.to_path_buf(),
            result_fd: RESULT_FD,
        }
    }

    /// Path of a workspace file as seen from inside the sandbox.
    pub fn workspace_file(&self, name: &str) -> PathBuf {
        self.workspace_dir.join(name)
    }
}

/// Files written into a run workspace before launch.
#[derive(Clone, Debug)]
pub struct WorkspaceFiles {
    pub harness_name: &'static str,
    pub harness: String,
    pub solution_name: &'static str,
    pub solution: String,
}
