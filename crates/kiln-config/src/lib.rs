//! TOML configuration loading for the kiln service.
//!
//! Configuration is override-shaped: every field is optional, and anything
//! absent falls back to the compiled-in defaults of the sandbox crate. Values
//! may reference environment variables as `${VAR_NAME}`; unresolved
//! references are left intact so the error surfaces where the value is used,
//! not silently as an empty string.
//!
//! ```toml
//! [sandbox]
//! slots = 5
//! wall_time_secs = 30
//! isolation = "isolate"
//!
//! [workspace]
//! scratch_root = "/tmp/kiln"
//! retention_secs = 600
//! ```

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Errors produced while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The config file is not valid TOML for this schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config parsed but holds an unusable value.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration, all sections optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KilnConfig {
    /// Sandbox pool overrides.
    #[serde(default)]
    pub sandbox: SandboxOverrides,
    /// Workspace lifecycle overrides.
    #[serde(default)]
    pub workspace: WorkspaceOverrides,
}

/// Overrides for the isolation pool. `None` means "use the default".
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SandboxOverrides {
    /// Number of isolation slots.
    pub slots: Option<usize>,
    /// Wall-clock ceiling per invocation, in seconds.
    pub wall_time_secs: Option<u64>,
    /// Control-group memory ceiling, in KiB.
    pub memory_limit_kib: Option<u64>,
    /// Process count ceiling inside the sandbox.
    pub process_limit: Option<u32>,
    /// Grant network access inside the sandbox.
    pub share_net: Option<bool>,
    /// Isolation backend: `"isolate"` or `"none"`.
    pub isolation: Option<String>,
    /// Explicit path to the runner binary, bypassing discovery.
    pub runner_bin: Option<String>,
}

/// Overrides for workspace handling. `None` means "use the default".
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkspaceOverrides {
    /// Directory under which invocation workspaces are created.
    pub scratch_root: Option<String>,
    /// How long result workspaces are retained, in seconds.
    pub retention_secs: Option<u64>,
}

impl KilnConfig {
    /// Parse configuration from a TOML string.
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string after `${VAR}` expansion.
    pub fn from_toml_with_env(raw: &str) -> Result<Self, ConfigError> {
        Self::from_toml(&expand_env_vars(raw))
    }

    /// Load configuration from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        Self::from_toml(&std::fs::read_to_string(path)?)
    }

    /// Load configuration from a file path with `${VAR}` expansion.
    pub fn from_file_with_env(path: &Path) -> Result<Self, ConfigError> {
        Self::from_toml_with_env(&std::fs::read_to_string(path)?)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.sandbox.slots == Some(0) {
            return Err(ConfigError::Invalid(
                "sandbox.slots must be at least 1".into(),
            ));
        }
        if self.sandbox.wall_time_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "sandbox.wall_time_secs must be at least 1".into(),
            ));
        }
        if let Some(isolation) = self.sandbox.isolation.as_deref() {
            if isolation != "isolate" && isolation != "none" {
                return Err(ConfigError::Invalid(format!(
                    "unknown isolation backend '{isolation}' (supported: isolate, none)"
                )));
            }
        }
        Ok(())
    }
}

/// Expand `${VAR_NAME}` references from the environment.
///
/// Unresolved references are preserved verbatim, as is a `${` with no
/// closing brace.
pub fn expand_env_vars(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut name = String::new();
            let mut closed = false;
            for inner in chars.by_ref() {
                if inner == '}' {
                    closed = true;
                    break;
                }
                name.push(inner);
            }
            match std::env::var(&name) {
                Ok(value) if closed => out.push_str(&value),
                _ => {
                    out.push_str("${");
                    out.push_str(&name);
                    if closed {
                        out.push('}');
                    }
                }
            }
        } else {
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_parses_full_example() {
        let toml = r#"
            [sandbox]
            slots = 8
            wall_time_secs = 60
            memory_limit_kib = 204800
            process_limit = 25
            share_net = true
            isolation = "isolate"
            runner_bin = "/opt/kiln/kiln-runner"

            [workspace]
            scratch_root = "/srv/kiln/scratch"
            retention_secs = 120
        "#;

        let config = KilnConfig::from_toml(toml).unwrap();
        assert_eq!(config.sandbox.slots, Some(8));
        assert_eq!(config.sandbox.wall_time_secs, Some(60));
        assert_eq!(config.sandbox.memory_limit_kib, Some(204800));
        assert_eq!(config.sandbox.process_limit, Some(25));
        assert_eq!(config.sandbox.share_net, Some(true));
        assert_eq!(config.sandbox.isolation.as_deref(), Some("isolate"));
        assert_eq!(
            config.sandbox.runner_bin.as_deref(),
            Some("/opt/kiln/kiln-runner")
        );
        assert_eq!(
            config.workspace.scratch_root.as_deref(),
            Some("/srv/kiln/scratch")
        );
        assert_eq!(config.workspace.retention_secs, Some(120));
    }

    #[test]
    fn config_empty_is_valid() {
        let config = KilnConfig::from_toml("").unwrap();
        assert!(config.sandbox.slots.is_none());
        assert!(config.workspace.scratch_root.is_none());
    }

    #[test]
    fn config_uses_defaults_when_absent() {
        let toml = r#"
            [sandbox]
            slots = 3
        "#;

        let config = KilnConfig::from_toml(toml).unwrap();
        assert_eq!(config.sandbox.slots, Some(3));
        assert!(config.sandbox.wall_time_secs.is_none());
        assert!(config.sandbox.isolation.is_none());
        assert!(config.workspace.retention_secs.is_none());
    }

    #[test]
    fn config_rejects_zero_slots() {
        let toml = r#"
            [sandbox]
            slots = 0
        "#;

        let err = KilnConfig::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("slots"));
    }

    #[test]
    fn config_rejects_zero_wall_time() {
        let toml = r#"
            [sandbox]
            wall_time_secs = 0
        "#;

        let err = KilnConfig::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("wall_time_secs"));
    }

    #[test]
    fn config_rejects_unknown_isolation() {
        let toml = r#"
            [sandbox]
            isolation = "firecracker"
        "#;

        let err = KilnConfig::from_toml(toml).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("firecracker"), "error should name the backend: {msg}");
        assert!(msg.contains("isolate"), "error should list supported backends: {msg}");
    }

    #[test]
    fn config_loads_from_file() {
        let dir = std::env::temp_dir().join("kiln-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("kiln.toml");
        std::fs::write(
            &path,
            r#"
            [workspace]
            retention_secs = 60
        "#,
        )
        .unwrap();

        let config = KilnConfig::from_file(&path).unwrap();
        assert_eq!(config.workspace.retention_secs, Some(60));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn env_var_expansion_resolves_from_environment() {
        std::env::set_var("KILN_TEST_SCRATCH", "/tmp/from-env");
        let toml = r#"
            [workspace]
            scratch_root = "${KILN_TEST_SCRATCH}"
        "#;

        let config = KilnConfig::from_toml_with_env(toml).unwrap();
        assert_eq!(config.workspace.scratch_root.as_deref(), Some("/tmp/from-env"));
        std::env::remove_var("KILN_TEST_SCRATCH");
    }

    #[test]
    fn env_var_expansion_preserves_unresolved() {
        let result = expand_env_vars("prefix ${DEFINITELY_NOT_SET_12345} suffix");
        assert_eq!(result, "prefix ${DEFINITELY_NOT_SET_12345} suffix");
    }

    #[test]
    fn env_var_expansion_handles_no_vars() {
        let result = expand_env_vars("no variables here");
        assert_eq!(result, "no variables here");
    }

    #[test]
    fn env_var_expansion_keeps_unclosed_reference() {
        let result = expand_env_vars("tail ${NOT_CLOSED");
        assert_eq!(result, "tail ${NOT_CLOSED");
    }
}
