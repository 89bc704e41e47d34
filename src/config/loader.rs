/// Configuration loading from a JSON file
use crate::config::types::{GradeConfig, GradeError, Result};
use std::path::Path;

const DEFAULT_CONFIG_FILE: &str = "gradebox.json";

impl GradeConfig {
    /// Load configuration from a JSON file. Missing fields keep their defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            GradeError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let config: GradeConfig = serde_json::from_str(&content)
            .map_err(|e| GradeError::Config(format!("Failed to parse config JSON: {}", e)))?;

        Ok(config)
    }

    /// Load ./gradebox.json when present, built-in defaults otherwise.
    pub fn load_default() -> Result<Self> {
        let config_path = std::env::current_dir()
            .map_err(|e| GradeError::Config(format!("Failed to get current directory: {}", e)))?
            .join(DEFAULT_CONFIG_FILE);

        if config_path.exists() {
            log::debug!("loading config from {}", config_path.display());
            Self::load_from_file(config_path)
        } else {
            Ok(Self::default())
        }
    }
}
