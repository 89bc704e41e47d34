//! Isolated runner.
//!
//! The controller stays language-agnostic: an adapter renders the harness that
//! loads the corpus and calls the submission, and names the interpreter
//! command that starts it inside the sandbox.

pub mod harness;
pub mod languages;
pub mod protocol;
pub mod registry;

use crate::config::types::Result;
use crate::runner::harness::{HarnessLayout, WorkspaceFiles};
use std::path::Path;

/// Language-specific pieces of a grading run.
pub trait LanguageAdapter: Send + Sync {
    fn language(&self) -> &'static str;

    /// Harness and solution files for the run workspace.
    fn workspace_files(&self, layout: &HarnessLayout, source: &str) -> Result<WorkspaceFiles>;

    /// argv that starts the harness. `harness` is the path as seen by the payload.
    fn run_command(&self, interpreter: &Path, harness: &Path) -> Vec<String>;

    /// Extra environment for the interpreter.
    fn environment(&self) -> Vec<(String, String)>;

    /// Text the interpreter prints when it dies of memory exhaustion.
    fn memory_error_marker(&self) -> Option<&'static str> {
        None
    }
}
