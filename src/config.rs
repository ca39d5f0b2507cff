//! Configuration loading and the four-level resolution cascade.
//!
//! Each effective setting is resolved as: explicit command flag, then
//! environment variable, then config file, then hard-coded default; the first
//! non-empty value wins. The config is loaded once on CLI entry and treated
//! as immutable afterwards; `config set` writes to disk but does not affect
//! running daemons until restart.
use std::{env, fs, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{constants, error::ConfigError, paths};

/// Root of the user configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Backend selection and per-backend settings.
    pub backend: BackendConfig,
}

/// Which backend the CLI talks to.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// Local daemon managed by the supervisor.
    #[default]
    Local,
    /// Remote cloud backend.
    Cloud,
}

impl BackendType {
    /// Stable name used in config files and CLI output.
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendType::Local => "local",
            BackendType::Cloud => "cloud",
        }
    }
}

impl FromStr for BackendType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(BackendType::Local),
            "cloud" => Ok(BackendType::Cloud),
            other => Err(format!("unknown backend type '{other}' (local|cloud)")),
        }
    }
}

/// Backend configuration block.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
    /// Active backend type.
    #[serde(rename = "type")]
    pub backend_type: BackendType,
    /// Settings for the local backend.
    pub local: LocalBackendConfig,
    /// Settings for the cloud backend.
    pub cloud: CloudBackendConfig,
}

/// Local backend configuration block.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LocalBackendConfig {
    /// Agent execution settings.
    pub execution: ExecutionConfig,
}

/// How agent executions are hosted.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Run agents directly on the host.
    Local,
    /// Run agents in the sandbox container.
    Sandbox,
    /// Use the sandbox when a container runtime is available, else local.
    #[default]
    Auto,
}

impl ExecutionMode {
    /// Stable name used in config files and CLI output.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Local => "local",
            ExecutionMode::Sandbox => "sandbox",
            ExecutionMode::Auto => "auto",
        }
    }
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(ExecutionMode::Local),
            "sandbox" => Ok(ExecutionMode::Sandbox),
            "auto" => Ok(ExecutionMode::Auto),
            other => Err(format!(
                "unknown execution mode '{other}' (local|sandbox|auto)"
            )),
        }
    }
}

/// Agent execution configuration block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Execution mode.
    pub mode: ExecutionMode,
    /// Container image for the sandboxed agent runner.
    pub sandbox_image: String,
    /// Pull the sandbox image automatically when absent.
    pub auto_pull: bool,
    /// Remove the sandbox container on stop.
    pub cleanup: bool,
    /// Sandbox container time-to-live in seconds.
    pub ttl: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            sandbox_image: constants::DEFAULT_SANDBOX_IMAGE.to_string(),
            auto_pull: true,
            cleanup: true,
            ttl: 3600,
        }
    }
}

/// Cloud backend configuration block.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CloudBackendConfig {
    /// Endpoint of the cloud backend.
    pub endpoint: String,
    /// API key attached as an authorization header.
    pub api_key: String,
    /// Organization identifier.
    pub organization: String,
}

/// Loads the config file, fail-open: a missing file yields defaults, a
/// malformed one fails with a descriptive error.
pub fn load_config() -> Result<Config, ConfigError> {
    let path = paths::config_file();
    if !path.exists() {
        return Ok(Config::default());
    }

    let raw = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

/// Writes the config file back to disk.
pub fn save_config(config: &Config) -> Result<(), ConfigError> {
    let path = paths::config_file();
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    let raw = serde_yaml::to_string(config).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;
    fs::write(&path, raw).map_err(|source| ConfigError::Write {
        path: path.display().to_string(),
        source,
    })
}

/// Recognized dotted config keys, in display order.
pub const CONFIG_KEYS: &[&str] = &[
    "backend.type",
    "backend.local.execution.mode",
    "backend.local.execution.sandbox_image",
    "backend.local.execution.auto_pull",
    "backend.local.execution.cleanup",
    "backend.local.execution.ttl",
    "backend.cloud.endpoint",
    "backend.cloud.api_key",
    "backend.cloud.organization",
];

/// Reads a dotted key from the config.
pub fn get_key(config: &Config, key: &str) -> Result<String, ConfigError> {
    let execution = &config.backend.local.execution;
    let value = match key {
        "backend.type" => config.backend.backend_type.as_str().to_string(),
        "backend.local.execution.mode" => execution.mode.as_str().to_string(),
        "backend.local.execution.sandbox_image" => execution.sandbox_image.clone(),
        "backend.local.execution.auto_pull" => execution.auto_pull.to_string(),
        "backend.local.execution.cleanup" => execution.cleanup.to_string(),
        "backend.local.execution.ttl" => execution.ttl.to_string(),
        "backend.cloud.endpoint" => config.backend.cloud.endpoint.clone(),
        "backend.cloud.api_key" => config.backend.cloud.api_key.clone(),
        "backend.cloud.organization" => config.backend.cloud.organization.clone(),
        _ => {
            return Err(ConfigError::UnknownKey {
                key: key.to_string(),
            });
        }
    };
    Ok(value)
}

/// Writes a dotted key into the config.
pub fn set_key(config: &mut Config, key: &str, value: &str) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason,
    };

    let execution = &mut config.backend.local.execution;
    match key {
        "backend.type" => config.backend.backend_type = value.parse().map_err(invalid)?,
        "backend.local.execution.mode" => execution.mode = value.parse().map_err(invalid)?,
        "backend.local.execution.sandbox_image" => {
            execution.sandbox_image = value.to_string();
        }
        "backend.local.execution.auto_pull" => {
            execution.auto_pull = parse_bool(value).map_err(invalid)?;
        }
        "backend.local.execution.cleanup" => {
            execution.cleanup = parse_bool(value).map_err(invalid)?;
        }
        "backend.local.execution.ttl" => {
            execution.ttl = value
                .parse()
                .map_err(|_| invalid("expected a number of seconds".into()))?;
        }
        "backend.cloud.endpoint" => config.backend.cloud.endpoint = value.to_string(),
        "backend.cloud.api_key" => config.backend.cloud.api_key = value.to_string(),
        "backend.cloud.organization" => {
            config.backend.cloud.organization = value.to_string();
        }
        _ => {
            return Err(ConfigError::UnknownKey {
                key: key.to_string(),
            });
        }
    }
    Ok(())
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(format!("expected true or false, got '{other}'")),
    }
}

/// Resolves a string setting through the flag > env > file > default cascade.
pub fn resolve_string(
    flag: Option<&str>,
    env_var: &str,
    file_value: &str,
    default: &str,
) -> String {
    if let Some(flag) = flag
        && !flag.is_empty()
    {
        return flag.to_string();
    }
    if let Ok(env_value) = env::var(env_var)
        && !env_value.is_empty()
    {
        return env_value;
    }
    if !file_value.is_empty() {
        return file_value.to_string();
    }
    default.to_string()
}

/// Resolves a parseable setting through the cascade; unparseable env values
/// fall through to the next level.
pub fn resolve_parsed<T: FromStr + Copy>(flag: Option<T>, env_var: &str, file_value: T) -> T {
    if let Some(flag) = flag {
        return flag;
    }
    if let Ok(env_value) = env::var(env_var)
        && let Ok(parsed) = env_value.parse::<T>()
    {
        return parsed;
    }
    file_value
}

/// Effective execution settings after the cascade has been applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionSettings {
    /// Effective execution mode.
    pub mode: ExecutionMode,
    /// Effective sandbox image.
    pub sandbox_image: String,
    /// Effective auto-pull flag.
    pub auto_pull: bool,
    /// Effective cleanup flag.
    pub cleanup: bool,
    /// Effective time-to-live.
    pub ttl: u64,
}

/// Flag-level overrides accepted by `server start`/`server restart`.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOverrides {
    /// `--execution-mode`.
    pub mode: Option<ExecutionMode>,
    /// `--sandbox-image`.
    pub sandbox_image: Option<String>,
    /// `--sandbox-auto-pull`.
    pub auto_pull: Option<bool>,
    /// `--sandbox-cleanup`.
    pub cleanup: Option<bool>,
    /// `--sandbox-ttl`.
    pub ttl: Option<u64>,
}

/// Applies the cascade for every execution setting.
pub fn resolve_execution(config: &Config, overrides: &ExecutionOverrides) -> ExecutionSettings {
    let file = &config.backend.local.execution;
    ExecutionSettings {
        mode: resolve_parsed(overrides.mode, constants::ENV_EXECUTION_MODE, file.mode),
        sandbox_image: resolve_string(
            overrides.sandbox_image.as_deref(),
            constants::ENV_SANDBOX_IMAGE,
            &file.sandbox_image,
            constants::DEFAULT_SANDBOX_IMAGE,
        ),
        auto_pull: resolve_parsed(
            overrides.auto_pull,
            constants::ENV_SANDBOX_AUTO_PULL,
            file.auto_pull,
        ),
        cleanup: resolve_parsed(
            overrides.cleanup,
            constants::ENV_SANDBOX_CLEANUP,
            file.cleanup,
        ),
        ttl: resolve_parsed(overrides.ttl, constants::ENV_SANDBOX_TTL, file.ttl),
    }
}
