use crate::config::types::{GradeError, Result};
use crate::corpus::{BUFFER_LEN, CORPUS_SIZE};
use crate::runner::harness::{HarnessLayout, WorkspaceFiles};
use crate::runner::LanguageAdapter;
use std::path::Path;

const HARNESS_TEMPLATE: &str = include_str!("python_harness.py");

const HARNESS_FILE: &str = "runner.py";
const SOLUTION_FILE: &str = "solution.py";
const SOLUTION_MODULE: &str = "solution";

#[derive(Debug, Clone)]
pub struct PythonAdapter {
    entry_point: &'static str,
}

impl Default for PythonAdapter {
    fn default() -> Self {
        Self {
            entry_point: "transform",
        }
    }
}

impl PythonAdapter {
    /// Adapter for trusted reference transforms, which define `hidden_transform`.
    pub fn reference() -> Self {
        Self {
            entry_point: "hidden_transform",
        }
    }

    pub fn entry_point(&self) -> &'static str {
        self.entry_point
    }

    pub fn render_harness(&self, layout: &HarnessLayout) -> Result<String> {
        let oracle = match &layout.oracle_dir {
            Some(dir) => python_str(dir)?,
            None => "None".to_string(),
        };

        let substitutions = [
            ("{{CORPUS_DIR}}", python_str(&layout.corpus_dir)?),
            ("{{ORACLE_DIR}}", oracle),
            ("{{WORKSPACE_DIR}}", python_str(&layout.workspace_dir)?),
            ("{{RESULT_FD}}", layout.result_fd.to_string()),
            ("{{CORPUS_SIZE}}", CORPUS_SIZE.to_string()),
            ("{{BUFFER_LEN}}", BUFFER_LEN.to_string()),
            ("{{SOLUTION_MODULE}}", quote(SOLUTION_MODULE)?),
            ("{{ENTRY_POINT}}", quote(self.entry_point)?),
        ];

        let mut rendered = HARNESS_TEMPLATE.to_string();
        for (placeholder, value) in &substitutions {
            rendered = rendered.replace(placeholder, value);
        }
        Ok(rendered)
    }
}

/// A JSON string literal is also a valid Python string literal.
fn quote(text: &str) -> Result<String> {
    serde_json::to_string(text)
        .map_err(|e| GradeError::Config(format!("cannot quote {:?}: {}", text, e)))
}

fn python_str(path: &Path) -> Result<String> {
    let text = path.to_str().ok_or_else(|| {
        GradeError::Config(format!("path is not valid UTF-8: {}", path.display()))
    })?;
    quote(text)
}

impl LanguageAdapter for PythonAdapter {
    fn language(&self) -> &'static str {
        "python"
    }

    fn workspace_files(&self, layout: &HarnessLayout, source: &str) -> Result<WorkspaceFiles> {
        Ok(WorkspaceFiles {
            harness_name: HARNESS_FILE,
            harness: self.render_harness(layout)?,
            solution_name: SOLUTION_FILE,
            solution: source.to_string(),
        })
    }

    fn run_command(&self, interpreter: &Path, harness: &Path) -> Vec<String> {
        vec![
            interpreter.to_string_lossy().to_string(),
            "-I".to_string(),
            "-B".to_string(),
            "-S".to_string(),
            harness.to_string_lossy().to_string(),
        ]
    }

    fn environment(&self) -> Vec<(String, String)> {
        vec![("LC_ALL".to_string(), "C.UTF-8".to_string())]
    }

    fn memory_error_marker(&self) -> Option<&'static str> {
        Some("MemoryError")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn rendered_harness_has_no_placeholders() {
        let rendered = PythonAdapter::default()
            .render_harness(&HarnessLayout::isolated(true))
            .unwrap();
        assert!(!rendered.contains("{{"));
        assert!(rendered.contains(r#"CORPUS_DIR = "/buffers/shared""#));
        assert!(rendered.contains(r#"ORACLE_DIR = "/puzzle""#));
        assert!(rendered.contains("RESULT_FD = 3"));
        assert!(rendered.contains("CORPUS_SIZE = 24"));
        assert!(rendered.contains(r#"ENTRY_POINT = "transform""#));
    }

    #[test]
    fn hidden_oracle_renders_as_none() {
        let rendered = PythonAdapter::reference()
            .render_harness(&HarnessLayout::isolated(false))
            .unwrap();
        assert!(rendered.contains("ORACLE_DIR = None"));
        assert!(rendered.contains(r#"ENTRY_POINT = "hidden_transform""#));
    }

    #[test]
    fn paths_with_quotes_are_escaped() {
        let layout = HarnessLayout::host(
            Path::new("/data/it's \"here\""),
            None,
            Path::new("/tmp/ws"),
        );
        let rendered = PythonAdapter::default().render_harness(&layout).unwrap();
        assert!(rendered.contains(r#"CORPUS_DIR = "/data/it's \"here\"""#));
    }

    #[test]
    fn run_command_isolates_interpreter() {
        let argv = PythonAdapter::default().run_command(
            Path::new("/usr/bin/python3"),
            &PathBuf::from("/workspace/runner.py"),
        );
        assert_eq!(
            argv,
            vec!["/usr/bin/python3", "-I", "-B", "-S", "/workspace/runner.py"]
        );
    }
}
