//! Process-level configuration: the TOML file and the environment directives.
//!
//! Both are materialised once in `main` and passed down as values.

use crate::compression::backend::BackendKind;
use crate::compression::selector::Workers;
use crate::error::ConvertError;
use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const CONFIG_ENV: &str = "LAYER_CONVERT_TOML";
pub const FORCE_IMPLEMENTATION_ENV: &str = "ZSTD_FORCE_IMPLEMENTATION";
pub const WORKERS_ENV: &str = "ZSTD_WORKERS";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub compression: CompressionConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CompressionConfig {
    pub zstd_implementation: Option<String>,
    pub zstd_compression_level: Option<i32>,
    pub zstd_chunked_compression_level: Option<i32>,
}

impl Config {
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).context("Parsing configuration")
    }

    /// Loads `path`, treating a missing file as an empty configuration.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            debug!("No configuration at {path:?}, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).with_context(|| format!("Reading configuration {path:?}"))?;
        Self::from_toml(&content).with_context(|| format!("Invalid configuration in {path:?}"))
    }

    /// Explicit path, then `$LAYER_CONVERT_TOML`, then the user config dir.
    pub fn default_path(explicit: Option<PathBuf>, env_value: Option<String>) -> Option<PathBuf> {
        explicit
            .or_else(|| env_value.filter(|v| !v.is_empty()).map(PathBuf::from))
            .or_else(|| dirs::config_dir().map(|dir| dir.join("layer-convert").join("config.toml")))
    }

    pub fn preferred_implementation(&self) -> Result<Option<BackendKind>, ConvertError> {
        match &self.compression.zstd_implementation {
            Some(name) => BackendKind::parse_preference(name),
            None => Ok(None),
        }
    }
}

/// The environment-style directives, read once per invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    pub force_implementation: Option<BackendKind>,
    pub workers: Workers,
}

impl EnvOverrides {
    /// Builds the overrides from raw variable values.
    pub fn from_values(force_implementation: Option<&str>, workers: Option<&str>) -> Result<Self, ConvertError> {
        let force_implementation = match force_implementation {
            Some(value) => BackendKind::parse_preference(value)?,
            None => None,
        };
        let workers = match workers.map(str::trim).filter(|v| !v.is_empty()) {
            Some(value) => Workers::parse(value)?,
            None => Workers::Auto,
        };
        Ok(Self {
            force_implementation,
            workers,
        })
    }

    pub fn from_process_env() -> Result<Self, ConvertError> {
        let force = std::env::var(FORCE_IMPLEMENTATION_ENV).ok();
        let workers = std::env::var(WORKERS_ENV).ok();
        Self::from_values(force.as_deref(), workers.as_deref())
    }
}
