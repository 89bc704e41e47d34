/// Environment and permission hygiene for the payload.
///
/// The payload environment is built from scratch: nothing from the host
/// process leaks in. Caller-provided variables are layered on top, except
/// loader variables, which are always refused.
use crate::config::types::{GradeError, Result};
use std::collections::BTreeMap;

const LOADER_VARS: &[&str] = &[
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "LD_AUDIT",
    "LD_BIND_NOW",
    "LD_DEBUG",
    "LD_PROFILE",
    "LD_USE_LOAD_BIAS",
    "LD_DYNAMIC_WEAK",
];

/// Environment policy for the payload
#[derive(Debug, Clone)]
pub struct EnvPolicy {
    pub path: String,
    pub home: String,
    pub locale: String,
    pub strict_mode: bool,
}

impl Default for EnvPolicy {
    fn default() -> Self {
        EnvPolicy {
            path: "/usr/local/bin:/usr/bin:/bin".to_string(),
            home: "/workspace".to_string(),
            locale: "C.UTF-8".to_string(),
            strict_mode: true,
        }
    }
}

/// Permission policy for files the payload creates
#[derive(Debug, Clone)]
pub struct PermissionPolicy {
    pub umask: u32,
}

impl Default for PermissionPolicy {
    fn default() -> Self {
        PermissionPolicy { umask: 0o077 }
    }
}

/// Environment hygiene manager
pub struct EnvHygiene {
    env_policy: EnvPolicy,
    perm_policy: PermissionPolicy,
}

impl EnvHygiene {
    pub fn new(env_policy: EnvPolicy, perm_policy: PermissionPolicy) -> Self {
        EnvHygiene {
            env_policy,
            perm_policy,
        }
    }

    /// Base environment plus `extra`. Loader variables in `extra` are an
    /// error in strict mode and dropped otherwise.
    pub fn build_environment(&self, extra: &[(String, String)]) -> Result<BTreeMap<String, String>> {
        let mut env_map = BTreeMap::new();
        env_map.insert("PATH".to_string(), self.env_policy.path.clone());
        env_map.insert("HOME".to_string(), self.env_policy.home.clone());
        env_map.insert("LANG".to_string(), self.env_policy.locale.clone());

        for (key, value) in extra {
            if key.is_empty() || key.contains('=') || key.contains('\0') || value.contains('\0') {
                return Err(GradeError::Config(format!(
                    "invalid environment entry {:?}",
                    key
                )));
            }
            if LOADER_VARS.contains(&key.as_str()) {
                if self.env_policy.strict_mode {
                    return Err(GradeError::Config(format!(
                        "refusing loader variable {} in payload environment",
                        key
                    )));
                }
                log::warn!("Dropped loader variable from payload environment: {}", key);
                continue;
            }
            env_map.insert(key.clone(), value.clone());
        }

        Ok(env_map)
    }

    /// Apply umask
    pub fn apply_umask(&self) -> Result<()> {
        use nix::sys::stat::{umask, Mode};

        let mode = Mode::from_bits(self.perm_policy.umask).ok_or_else(|| {
            GradeError::Config(format!("Invalid umask: {:o}", self.perm_policy.umask))
        })?;

        umask(mode);
        log::debug!("Applied umask: {:o}", self.perm_policy.umask);
        Ok(())
    }

    /// `KEY=value` strings, sorted
    pub fn exec_env(&self, extra: &[(String, String)]) -> Result<Vec<String>> {
        Ok(self
            .build_environment(extra)?
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hygiene(strict_mode: bool) -> EnvHygiene {
        EnvHygiene::new(
            EnvPolicy {
                strict_mode,
                ..EnvPolicy::default()
            },
            PermissionPolicy::default(),
        )
    }

    #[test]
    fn test_base_environment_is_deterministic() {
        let env_map = hygiene(true).build_environment(&[]).unwrap();
        assert_eq!(env_map.len(), 3);
        assert_eq!(env_map.get("HOME"), Some(&"/workspace".to_string()));
        assert_eq!(env_map.get("LANG"), Some(&"C.UTF-8".to_string()));
    }

    #[test]
    fn test_host_environment_does_not_leak() {
        let env_map = hygiene(true).build_environment(&[]).unwrap();
        assert!(!env_map.contains_key("CARGO_PKG_NAME"));
        assert!(!env_map.contains_key("USER"));
    }

    #[test]
    fn test_extra_variables_are_layered() {
        let extra = vec![("PUZZLE_NUM".to_string(), "3".to_string())];
        let exec_env = hygiene(true).exec_env(&extra).unwrap();
        assert!(exec_env.contains(&"PUZZLE_NUM=3".to_string()));
        let mut sorted = exec_env.clone();
        sorted.sort();
        assert_eq!(exec_env, sorted);
    }

    #[test]
    fn test_loader_variables_refused_in_strict_mode() {
        let extra = vec![("LD_PRELOAD".to_string(), "/evil.so".to_string())];
        assert!(hygiene(true).build_environment(&extra).is_err());
        let env_map = hygiene(false).build_environment(&extra).unwrap();
        assert!(!env_map.contains_key("LD_PRELOAD"));
    }

    #[test]
    fn test_malformed_keys_rejected() {
        let extra = vec![("A=B".to_string(), "x".to_string())];
        assert!(hygiene(false).build_environment(&extra).is_err());
    }
}
