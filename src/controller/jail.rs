//! What the sandbox sees: bind mounts and the paths the runner is told about.

use crate::config::types::{DirectoryBinding, GradeConfig};
use crate::runner::harness::{
    HarnessLayout, SANDBOX_CORPUS_DIR, SANDBOX_ORACLE_DIR, SANDBOX_WORKSPACE_DIR,
};
use std::path::Path;

/// Bind set for an isolated run. System directories are optional so hosts
/// without `/lib64` still work; every data mount is required.
pub fn grading_bindings(
    config: &GradeConfig,
    corpus_dir: &Path,
    oracle_dir: Option<&Path>,
    workspace_dir: &Path,
) -> Vec<DirectoryBinding> {
    let mut bindings: Vec<DirectoryBinding> = config
        .readonly_system_dirs
        .iter()
        .map(|dir| DirectoryBinding::read_only(dir, dir).optional())
        .collect();

    bindings.push(DirectoryBinding::data(corpus_dir, SANDBOX_CORPUS_DIR));
    if let Some(oracle) = oracle_dir {
        bindings.push(DirectoryBinding::data(oracle, SANDBOX_ORACLE_DIR));
    }
    bindings.push(DirectoryBinding::data(workspace_dir, SANDBOX_WORKSPACE_DIR));
    bindings
}

/// Runner paths for a degraded run, which reads the host directories directly.
pub fn host_layout(corpus_dir: &Path, oracle_dir: Option<&Path>, workspace_dir: &Path) -> HarnessLayout {
    HarnessLayout::host(corpus_dir, oracle_dir, workspace_dir)
}
