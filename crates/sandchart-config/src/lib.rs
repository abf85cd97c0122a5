#![warn(missing_docs)]

//! # sandchart-config
//!
//! Configuration loading for the sandchart build pipeline.
//!
//! Supports TOML configuration files with environment variable expansion.
//!
//! ## Example
//!
//! ```toml
//! [sandbox]
//! memory_limit_mb = 128
//! max_concurrent_sessions = 16
//! module_budget_ms = 5000
//!
//! [timeouts]
//! javascript_ms = 9500
//! ui_ms = 1000
//!
//! [config_tabs]
//! custom_node = "config"
//!
//! [modules]
//! directory = "${CHART_MODULES_DIR}"
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Largest accepted `sandbox.memory_limit_mb` (64 GiB).
pub const MAX_MEMORY_LIMIT_MB: usize = 64 * 1024;

/// Largest accepted `sandbox.max_code_size_kb` and `sandbox.max_output_size_kb` (1 GiB).
pub const MAX_SIZE_KB: usize = 1024 * 1024;

/// Errors from config parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level sandchart configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SandchartConfig {
    /// Isolated context limits.
    #[serde(default)]
    pub sandbox: SandboxOverrides,

    /// Per-stage timeout overrides.
    #[serde(default)]
    pub timeouts: TimeoutOverrides,

    /// Extra chart-type → config-tab field entries, merged over the built-in table.
    #[serde(default)]
    pub config_tabs: HashMap<String, String>,

    /// Module store settings.
    #[serde(default)]
    pub modules: ModuleSettings,
}

/// Sandbox configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SandboxOverrides {
    /// Heap ceiling of each isolated context in megabytes.
    #[serde(default)]
    pub memory_limit_mb: Option<usize>,

    /// Maximum number of build sessions alive at once.
    #[serde(default)]
    pub max_concurrent_sessions: Option<usize>,

    /// Maximum fragment or module source size in kilobytes.
    #[serde(default)]
    pub max_code_size_kb: Option<usize>,

    /// Maximum serialized fragment result size in kilobytes.
    #[serde(default)]
    pub max_output_size_kb: Option<usize>,

    /// Total time budget for loading all dependency modules of one build.
    #[serde(default)]
    pub module_budget_ms: Option<u64>,

    /// Maximum hook calls a single fragment may make.
    #[serde(default)]
    pub max_hook_calls: Option<usize>,
}

/// Per-stage timeout overrides in milliseconds.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TimeoutOverrides {
    /// Params stage.
    #[serde(default)]
    pub params_ms: Option<u64>,
    /// Urls stage.
    #[serde(default)]
    pub urls_ms: Option<u64>,
    /// Chart-library config stage (graph / map / ymap).
    #[serde(default)]
    pub library_config_ms: Option<u64>,
    /// Chart-type config stage.
    #[serde(default)]
    pub config_ms: Option<u64>,
    /// Chart JavaScript stage.
    #[serde(default)]
    pub javascript_ms: Option<u64>,
    /// UI stage.
    #[serde(default)]
    pub ui_ms: Option<u64>,
}

/// Where dependency modules are read from.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModuleSettings {
    /// Directory holding `<name>.js` module sources.
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// Maximum `require` nesting depth when resolving dependencies.
    #[serde(default)]
    pub max_depth: Option<usize>,
}

impl SandchartConfig {
    /// Parse a config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: SandchartConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse a config from a TOML string, expanding `${ENV_VAR}` references.
    pub fn from_toml_with_env(toml_str: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(toml_str);
        Self::from_toml(&expanded)
    }

    /// Load config from a file path, expanding environment variables.
    pub fn from_file_with_env(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_with_env(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let sandbox = &self.sandbox;
        if sandbox.memory_limit_mb == Some(0) {
            return Err(ConfigError::Invalid(
                "sandbox.memory_limit_mb must be greater than 0".into(),
            ));
        }
        if let Some(mb) = sandbox.memory_limit_mb.filter(|mb| *mb > MAX_MEMORY_LIMIT_MB) {
            return Err(ConfigError::Invalid(format!(
                "sandbox.memory_limit_mb must be at most {MAX_MEMORY_LIMIT_MB} (got {mb})"
            )));
        }
        let sizes = [
            ("max_code_size_kb", sandbox.max_code_size_kb),
            ("max_output_size_kb", sandbox.max_output_size_kb),
        ];
        for (name, value) in sizes {
            if let Some(kb) = value.filter(|kb| *kb > MAX_SIZE_KB) {
                return Err(ConfigError::Invalid(format!(
                    "sandbox.{name} must be at most {MAX_SIZE_KB} (got {kb})"
                )));
            }
        }
        if sandbox.max_concurrent_sessions == Some(0) {
            return Err(ConfigError::Invalid(
                "sandbox.max_concurrent_sessions must be greater than 0".into(),
            ));
        }
        if sandbox.module_budget_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "sandbox.module_budget_ms must be greater than 0".into(),
            ));
        }

        let t = &self.timeouts;
        let stage_timeouts = [
            ("params_ms", t.params_ms),
            ("urls_ms", t.urls_ms),
            ("library_config_ms", t.library_config_ms),
            ("config_ms", t.config_ms),
            ("javascript_ms", t.javascript_ms),
            ("ui_ms", t.ui_ms),
        ];
        for (name, value) in stage_timeouts {
            if value == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "timeouts.{} must be greater than 0",
                    name
                )));
            }
        }

        for (stype, field) in &self.config_tabs {
            if field.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "config_tabs.{}: field name must not be empty",
                    stype
                )));
            }
        }
        Ok(())
    }
}

/// Locate the config file.
///
/// Search order:
/// 1. `SANDCHART_CONFIG` environment variable
/// 2. `./sandchart.toml` in the current directory
/// 3. None (defaults apply)
pub fn find_config_file() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("SANDCHART_CONFIG") {
        let p = PathBuf::from(path);
        if p.exists() {
            return Some(p);
        }
    }

    let cwd = PathBuf::from("sandchart.toml");
    if cwd.exists() {
        return Some(cwd);
    }

    None
}

/// Expand `${ENV_VAR}` patterns in a string using environment variables.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(value) => result.push_str(&value),
                // Unknown variables stay as written
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(ch);
        }
    }

    result
}
