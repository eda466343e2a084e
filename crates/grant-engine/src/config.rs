//! Engine settings: defaults, an optional JSON/YAML file, then `DYNGRANT__*` variables.

use std::env;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const ENV_PREFIX: &str = "DYNGRANT__";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EngineConfig {
    /// Buffered audit events per subscriber before the slowest one starts lagging.
    pub audit_capacity: usize,
    pub cache_mode: CacheMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            audit_capacity: 128,
            cache_mode: CacheMode::Auto,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// Eager for a non-dynamic base policy, lazy otherwise.
    #[default]
    Auto,
    /// Always recompute base policy output.
    Lazy,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to deserialize config: {0}")]
    Deserialize(String),
}

pub fn load_config(path: Option<&Path>) -> Result<EngineConfig, ConfigError> {
    let mut config = match path {
        Some(path) if path.exists() => load_config_from_path(path)?,
        _ => EngineConfig::default(),
    };
    apply_env_overrides(&mut config, env::vars())?;
    Ok(config)
}

pub fn load_config_from_reader<R: Read>(mut reader: R) -> Result<EngineConfig, ConfigError> {
    let mut buf = String::new();
    reader.read_to_string(&mut buf)?;
    parse_config_str(&buf)
}

pub fn load_config_from_path(path: impl AsRef<Path>) -> Result<EngineConfig, ConfigError> {
    let file = File::open(path.as_ref())?;
    load_config_from_reader(file)
}

pub fn parse_config_str(raw: &str) -> Result<EngineConfig, ConfigError> {
    if raw.trim().is_empty() {
        return Ok(EngineConfig::default());
    }
    match serde_json::from_str(raw) {
        Ok(config) => Ok(config),
        Err(json_err) => serde_yaml::from_str(raw).map_err(|yaml_err| {
            ConfigError::Deserialize(format!(
                "json error: {}; yaml error: {}",
                json_err, yaml_err
            ))
        }),
    }
}

/// Applies `DYNGRANT__<FIELD>` entries from `vars`; other variables are ignored.
pub fn apply_env_overrides<I>(config: &mut EngineConfig, vars: I) -> Result<(), ConfigError>
where
    I: IntoIterator<Item = (String, String)>,
{
    for (key, raw) in vars {
        let Some(field) = key.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let raw = raw.trim();
        match field.to_ascii_lowercase().as_str() {
            "audit_capacity" => {
                config.audit_capacity = raw.parse().map_err(|_| {
                    ConfigError::Deserialize(format!("{key}: expected integer, got {raw:?}"))
                })?;
            }
            "cache_mode" => {
                config.cache_mode = match raw.to_ascii_lowercase().as_str() {
                    "auto" => CacheMode::Auto,
                    "lazy" => CacheMode::Lazy,
                    other => {
                        return Err(ConfigError::Deserialize(format!(
                            "{key}: unknown cache mode {other:?}"
                        )))
                    }
                };
            }
            other => {
                return Err(ConfigError::Deserialize(format!(
                    "unknown setting {ENV_PREFIX}{}",
                    other.to_ascii_uppercase()
                )))
            }
        }
    }
    Ok(())
}
