/// Run-scoped directories for submissions.
///
/// Each run gets `<runtime_root>/<uuid>/` holding `workspace/` (runner and
/// solution, later bound read-only at /workspace) and, under full isolation,
/// `root/`, the skeleton the sandbox chroots into.
use crate::config::types::{GradeError, Result};
use crate::safety::safe_cleanup;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use uuid::Uuid;

const WORKSPACE_DIR: &str = "workspace";
const JAIL_DIR: &str = "root";

fn io_context(e: std::io::Error, what: String) -> GradeError {
    GradeError::Io(std::io::Error::new(e.kind(), format!("{}: {}", what, e)))
}

fn create_dir_with_mode(path: &Path, mode: u32) -> Result<()> {
    fs::create_dir_all(path)
        .map_err(|e| io_context(e, format!("Failed to create directory {}", path.display())))?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| io_context(e, format!("Failed to set permissions on {}", path.display())))
}

/// One submission's ephemeral directory
#[derive(Debug)]
pub struct Workspace {
    run_id: String,
    run_dir: PathBuf,
    workspace_dir: PathBuf,
    jail_root: Option<PathBuf>,
    cleaned: bool,
}

impl Workspace {
    pub fn new(base_dir: &Path) -> Result<Self> {
        let run_id = Uuid::new_v4().to_string();
        let run_dir = base_dir.join(&run_id);
        create_dir_with_mode(&run_dir, 0o711)?;

        let workspace_dir = run_dir.join(WORKSPACE_DIR);
        if let Err(e) = create_dir_with_mode(&workspace_dir, 0o755) {
            let _ = safe_cleanup::remove_tree_secure(&run_dir);
            return Err(e);
        }

        Ok(Self {
            run_id,
            run_dir,
            workspace_dir,
            jail_root: None,
            cleaned: false,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn workspace_dir(&self) -> &Path {
        &self.workspace_dir
    }

    pub fn jail_root(&self) -> Option<&Path> {
        self.jail_root.as_deref()
    }

    /// Write a world-readable file into the workspace. `name` must be a plain file name.
    pub fn write_file(&self, name: &str, content: &[u8]) -> Result<PathBuf> {
        let mut components = Path::new(name).components();
        if !matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        ) {
            return Err(GradeError::Filesystem(format!(
                "workspace file name must be a plain name: {:?}",
                name
            )));
        }

        let path = self.workspace_dir.join(name);
        fs::write(&path, content)
            .map_err(|e| io_context(e, format!("Failed to write {}", path.display())))?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644))
            .map_err(|e| io_context(e, format!("Failed to set permissions on {}", path.display())))?;
        Ok(path)
    }

    /// Copy host files into `<run_dir>/<subdir>/`, keeping their names.
    pub fn stage_files(&self, subdir: &str, files: &[PathBuf]) -> Result<PathBuf> {
        if subdir == WORKSPACE_DIR || subdir == JAIL_DIR || subdir.contains('/') {
            return Err(GradeError::Filesystem(format!(
                "cannot stage files into {:?}",
                subdir
            )));
        }
        let dir = self.run_dir.join(subdir);
        create_dir_with_mode(&dir, 0o755)?;

        for source in files {
            let name = source.file_name().ok_or_else(|| {
                GradeError::Filesystem(format!("no file name in {}", source.display()))
            })?;
            let target = dir.join(name);
            fs::copy(source, &target).map_err(|e| {
                io_context(e, format!("Failed to stage {}", source.display()))
            })?;
            fs::set_permissions(&target, fs::Permissions::from_mode(0o644)).map_err(|e| {
                io_context(e, format!("Failed to set permissions on {}", target.display()))
            })?;
        }
        Ok(dir)
    }

    /// Create the chroot skeleton with one empty directory per mount point.
    pub fn prepare_jail(&mut self, mount_points: &[PathBuf]) -> Result<PathBuf> {
        let root = self.run_dir.join(JAIL_DIR);
        create_dir_with_mode(&root, 0o755)?;

        for target in mount_points {
            let relative = target.strip_prefix("/").unwrap_or(target);
            if relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
            {
                return Err(GradeError::Filesystem(format!(
                    "mount point must be a normalized absolute path: {}",
                    target.display()
                )));
            }
            create_dir_with_mode(&root.join(relative), 0o755)?;
        }

        self.jail_root = Some(root.clone());
        Ok(root)
    }

    /// Remove the run directory. Idempotent.
    pub fn cleanup(&mut self) -> Result<()> {
        if self.cleaned {
            return Ok(());
        }
        safe_cleanup::remove_tree_secure(&self.run_dir)?;
        self.cleaned = true;
        Ok(())
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if !self.cleaned {
            if let Err(e) = self.cleanup() {
                log::warn!(
                    "Failed to remove run directory {}: {}",
                    self.run_dir.display(),
                    e
                );
            }
        }
    }
}

/// Owner of the runtime root
pub struct WorkspaceManager {
    base_dir: PathBuf,
}

impl WorkspaceManager {
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        create_dir_with_mode(&base_dir, 0o711)?;
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn create_workspace(&self) -> Result<Workspace> {
        Workspace::new(&self.base_dir)
    }

    /// Remove run directories left behind by crashed processes.
    pub fn cleanup_old_workspaces(&self, max_age: std::time::Duration) -> Result<usize> {
        let mut cleaned = 0;
        let now = std::time::SystemTime::now();

        if !self.base_dir.exists() {
            return Ok(0);
        }

        let entries = fs::read_dir(&self.base_dir).map_err(|e| {
            io_context(
                e,
                format!("Failed to read runtime root {}", self.base_dir.display()),
            )
        })?;

        for entry in entries.flatten() {
            let path = entry.path();
            let is_run_dir = entry
                .file_name()
                .to_str()
                .map(|name| Uuid::parse_str(name).is_ok())
                .unwrap_or(false);
            if !is_run_dir {
                continue;
            }

            let age = match entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
            {
                Some(age) => age,
                None => continue,
            };

            if age > max_age {
                log::info!("Removing stale run directory: {}", path.display());
                match safe_cleanup::remove_tree_secure(&path) {
                    Ok(()) => cleaned += 1,
                    Err(e) => log::warn!("Failed to remove stale run directory {}: {}", path.display(), e),
                }
            }
        }

        Ok(cleaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_workspace_files_are_readable_and_removed() {
        let base = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(base.path().join("runs")).unwrap();

        let mut workspace = manager.create_workspace().unwrap();
        let solution = workspace.write_file("solution.py", b"def transform(b): return b").unwrap();
        let mode = fs::metadata(&solution).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);

        workspace.cleanup().unwrap();
        assert!(!workspace.run_dir().exists());
        workspace.cleanup().unwrap();
    }

    #[test]
    fn test_write_file_rejects_paths() {
        let base = tempfile::tempdir().unwrap();
        let workspace = Workspace::new(base.path()).unwrap();
        assert!(workspace.write_file("../escape.py", b"").is_err());
        assert!(workspace.write_file("a/b.py", b"").is_err());
    }

    #[test]
    fn test_prepare_jail_creates_mount_points() {
        let base = tempfile::tempdir().unwrap();
        let mut workspace = Workspace::new(base.path()).unwrap();
        let root = workspace
            .prepare_jail(&[PathBuf::from("/buffers/shared"), PathBuf::from("/usr")])
            .unwrap();
        assert!(root.join("buffers/shared").is_dir());
        assert!(root.join("usr").is_dir());
        assert!(workspace
            .prepare_jail(&[PathBuf::from("/../etc")])
            .is_err());
    }

    #[test]
    fn test_stage_files_copies_by_name() {
        let base = tempfile::tempdir().unwrap();
        let source = base.path().join("visible_outputs_3.bin");
        fs::write(&source, [7u8; 16]).unwrap();

        let workspace = Workspace::new(&base.path().join("runs")).unwrap();
        let dir = workspace.stage_files("oracle", &[source]).unwrap();
        assert_eq!(fs::read(dir.join("visible_outputs_3.bin")).unwrap(), vec![7u8; 16]);
        assert!(workspace.stage_files("workspace", &[]).is_err());
        assert!(workspace.stage_files("a/b", &[]).is_err());
    }

    #[test]
    fn test_drop_removes_run_directory() {
        let base = tempfile::tempdir().unwrap();
        let run_dir = {
            let workspace = Workspace::new(base.path()).unwrap();
            workspace.run_dir().to_path_buf()
        };
        assert!(!run_dir.exists());
    }

    #[test]
    fn test_cleanup_old_workspaces_skips_foreign_entries() {
        let base = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(base.path().join("runs")).unwrap();
        let keep = manager.base_dir().join("not-a-run");
        fs::create_dir_all(&keep).unwrap();

        let stale = manager.base_dir().join(Uuid::new_v4().to_string());
        fs::create_dir_all(&stale).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let cleaned = manager
            .cleanup_old_workspaces(Duration::from_millis(1))
            .unwrap();
        assert_eq!(cleaned, 1);
        assert!(!stale.exists());
        assert!(keep.exists());
    }
}
