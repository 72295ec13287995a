//! Agent configuration resolution: a fixed 7-level search order shared by
//! every binary in the crate (§6.2, §9 Design Notes).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_yaml::Value;
use thiserror::Error;

/// Environment variable naming an explicit config file, checked ahead of
/// every filesystem convention (§6.2 level 2).
pub const ENV_CONFIG_PATH: &str = "AGEN_CONFIG_PATH";
/// Environment variable naming the orchestrator-provisioned workbench
/// directory for a spawned agent (§6.2 level 3).
pub const ENV_WORKBENCH_DIR: &str = "AGEN_WORKBENCH_DIR";

/// Errors resolving or parsing an agent's configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A candidate path existed but failed to parse as YAML.
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        /// The file that failed to parse.
        path: PathBuf,
        /// The underlying YAML error.
        #[source]
        source: serde_yaml::Error,
    },

    /// A candidate path existed but could not be read.
    #[error("failed to read config at {path}: {source}")]
    Read {
        /// The file that failed to read.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The embedded default document itself failed to parse — a build-time
    /// defect, not a deployment one.
    #[error("embedded default config is not valid YAML: {0}")]
    InvalidEmbeddedDefaults(serde_yaml::Error),
}

/// A resolved agent configuration: a flat map of string keys to typed YAML
/// scalars, with explicit accessor methods rather than reflection-based
/// coercion (§9 Design Notes).
#[derive(Debug, Clone, Default)]
pub struct AgentConfig {
    values: HashMap<String, Value>,
    /// Which of the 7 levels this configuration was resolved from, kept
    /// for diagnostics and the orchestrator's startup banner.
    pub source: ConfigSource,
}

/// Which level of the §6.2 search order produced a configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfigSource {
    /// `--config <path>` CLI flag.
    CliFlag,
    /// `AGEN_CONFIG_PATH` environment variable.
    EnvVar,
    /// `$AGEN_WORKBENCH_DIR/config/agents/<agent-name>.yaml`.
    WorkbenchEnv,
    /// `./config/<agent-name>.yaml`.
    CurrentDirConfig,
    /// `./workbench/config/agents/<agent-name>.yaml`.
    CurrentDirWorkbench,
    /// `<binary-dir>/config/<agent-name>.yaml`.
    BinaryDirConfig,
    /// Embedded defaults compiled into the binary.
    #[default]
    EmbeddedDefaults,
}

impl AgentConfig {
    fn from_yaml_str(source: ConfigSource, text: &str, path: Option<&Path>) -> Result<Self, ConfigError> {
        let parsed: HashMap<String, Value> = serde_yaml::from_str(text).map_err(|err| match path {
            Some(path) => ConfigError::Parse { path: path.to_path_buf(), source: err },
            None => ConfigError::InvalidEmbeddedDefaults(err),
        })?;
        Ok(Self { values: parsed, source })
    }

    /// Returns the string value for `key`, or `default` if absent or not a
    /// string.
    #[must_use]
    pub fn get_string(&self, key: &str, default: &str) -> String {
        self.values.get(key).and_then(Value::as_str).map_or_else(|| default.to_string(), ToString::to_string)
    }

    /// Returns the integer value for `key`, or `default` if absent or not
    /// an integer.
    #[must_use]
    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        self.values.get(key).and_then(Value::as_i64).unwrap_or(default)
    }

    /// Returns the boolean value for `key`, or `default` if absent or not a
    /// boolean.
    #[must_use]
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.values.get(key).and_then(Value::as_bool).unwrap_or(default)
    }
}

/// Resolves configuration for `agent_name`, trying each of the 7 levels in
/// priority order and returning the first that exists and parses (§6.2).
///
/// `embedded_defaults` is the binary's own compiled-in fallback YAML
/// (level 7) — it MUST be sufficient to start with no filesystem state.
///
/// # Errors
/// Returns an error only if a candidate file exists but fails to read or
/// parse; a missing file is not an error; it just falls through to the
/// next level.
pub fn resolve(
    agent_name: &str,
    cli_flag: Option<&Path>,
    embedded_defaults: &str,
) -> Result<AgentConfig, ConfigError> {
    if let Some(path) = cli_flag {
        return load(ConfigSource::CliFlag, path);
    }

    if let Ok(path) = std::env::var(ENV_CONFIG_PATH) {
        return load(ConfigSource::EnvVar, Path::new(&path));
    }

    if let Ok(workbench) = std::env::var(ENV_WORKBENCH_DIR) {
        let path = Path::new(&workbench).join("config/agents").join(format!("{agent_name}.yaml"));
        if path.exists() {
            return load(ConfigSource::WorkbenchEnv, &path);
        }
    }

    let current_dir_config = Path::new("config").join(format!("{agent_name}.yaml"));
    if current_dir_config.exists() {
        return load(ConfigSource::CurrentDirConfig, &current_dir_config);
    }

    let current_dir_workbench = Path::new("workbench/config/agents").join(format!("{agent_name}.yaml"));
    if current_dir_workbench.exists() {
        return load(ConfigSource::CurrentDirWorkbench, &current_dir_workbench);
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(binary_dir) = exe.parent() {
            let path = binary_dir.join("config").join(format!("{agent_name}.yaml"));
            if path.exists() {
                return load(ConfigSource::BinaryDirConfig, &path);
            }
        }
    }

    AgentConfig::from_yaml_str(ConfigSource::EmbeddedDefaults, embedded_defaults, None)
}

fn load(source: ConfigSource, path: &Path) -> Result<AgentConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|err| ConfigError::Read { path: path.to_path_buf(), source: err })?;
    AgentConfig::from_yaml_str(source, &text, Some(path))
}
