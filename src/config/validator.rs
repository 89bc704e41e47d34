// Startup validation of the grading configuration.
// Errors abort startup with an actionable message; warnings are logged.

use crate::config::types::{GradeConfig, GradeError, Result};

/// Validation result with detailed errors
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.valid = false;
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

/// Validate config at startup. Any error is fatal.
pub fn validate_config(config: &GradeConfig) -> Result<ValidationResult> {
    let mut result = ValidationResult::new();

    validate_limits(config, &mut result);
    validate_paths(config, &mut result);
    validate_credentials(config, &mut result);
    validate_isolation(config, &mut result);

    for warning in &result.warnings {
        log::warn!("config: {}", warning);
    }

    if !result.is_valid() {
        return Err(GradeError::Config(format!(
            "config validation failed:\n{}",
            result.errors.join("\n")
        )));
    }

    Ok(result)
}

fn validate_limits(config: &GradeConfig, result: &mut ValidationResult) {
    if config.memory_limit_bytes == 0 {
        result.add_error("memory_limit_bytes cannot be zero".to_string());
    } else if config.memory_limit_bytes < 16 * 1024 * 1024 {
        result.add_warning(format!(
            "memory_limit_bytes {} is below 16MiB, the interpreter may not start",
            config.memory_limit_bytes
        ));
    }

    if let Some(address_space) = config.address_space_limit_bytes {
        if address_space < config.memory_limit_bytes {
            result.add_error(format!(
                "address_space_limit_bytes ({}) must be >= memory_limit_bytes ({})",
                address_space, config.memory_limit_bytes
            ));
        }
    }

    if config.wall_time_limit_ms == 0 {
        result.add_error("wall_time_limit_ms cannot be zero".to_string());
    }

    if let Some(cpu_ms) = config.cpu_time_limit_ms {
        if cpu_ms == 0 {
            result.add_error("cpu_time_limit_ms cannot be zero".to_string());
        }
        if cpu_ms > config.wall_time_limit_ms {
            result.add_warning(format!(
                "cpu_time_limit_ms ({}) exceeds wall_time_limit_ms ({}); the wall deadline fires first",
                cpu_ms, config.wall_time_limit_ms
            ));
        }
    }

    if config.process_limit == 0 {
        result.add_error("process_limit cannot be zero".to_string());
    }

    if config.output_limit_bytes < 64 * 1024 {
        result.add_error(format!(
            "output_limit_bytes ({}) is too small to carry a runner result",
            config.output_limit_bytes
        ));
    }

    if config.fd_limit < 8 {
        result.add_error(format!("fd_limit ({}) must be at least 8", config.fd_limit));
    }
}

fn validate_paths(config: &GradeConfig, result: &mut ValidationResult) {
    if !config.runtime_root.is_absolute() {
        result.add_error(format!(
            "runtime_root must be absolute path: {:?}",
            config.runtime_root
        ));
    }

    if !config.cgroup_base.is_absolute() {
        result.add_error(format!(
            "cgroup_base must be absolute path: {:?}",
            config.cgroup_base
        ));
    }

    if !config.python_path.is_absolute() {
        result.add_error(format!(
            "python_path must be absolute path: {:?}",
            config.python_path
        ));
    } else if !config.python_path.exists() {
        result.add_warning(format!(
            "python_path does not exist: {:?}",
            config.python_path
        ));
    }

    for dir in &config.readonly_system_dirs {
        if !dir.is_absolute() {
            result.add_error(format!("readonly_system_dirs entry must be absolute: {:?}", dir));
        }
    }

    if let Some(ref audit) = config.audit_log_path {
        if let Some(parent) = audit.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                result.add_warning(format!(
                    "audit_log_path parent directory does not exist: {:?}",
                    parent
                ));
            }
        }
    }
}

fn validate_credentials(config: &GradeConfig, result: &mut ValidationResult) {
    if config.sandbox_uid == 0 {
        result.add_error("sandbox_uid cannot be 0 (root)".to_string());
    }
    if config.sandbox_gid == 0 {
        result.add_error("sandbox_gid cannot be 0 (root)".to_string());
    }
}

fn validate_isolation(config: &GradeConfig, result: &mut ValidationResult) {
    if config.allow_degraded && config.strict_mode {
        result.add_warning(
            "allow_degraded has no effect while strict_mode is enabled".to_string(),
        );
    }
    if config.allow_degraded && !config.strict_mode {
        result.add_warning(
            "degraded mode runs submissions without namespace isolation; not for untrusted code"
                .to_string(),
        );
    }
}
