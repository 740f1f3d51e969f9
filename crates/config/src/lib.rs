//! Configuration loading, validation, and management for toolstream.
//!
//! Loads configuration from `~/.toolstream/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use toolstream_core::ModelRef;

/// The root configuration structure.
///
/// Maps directly to `~/.toolstream/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Admission cap: sessions running at once
    #[serde(default = "default_max_concurrent_sessions")]
    pub max_concurrent_sessions: usize,

    /// Hard ceiling on tool calls per session
    #[serde(default = "default_max_tool_calls")]
    pub max_tool_calls_per_session: u32,

    /// Capacity of each session's caller-facing event channel
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Model reference (`provider/model`) used when none is given
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Whether the bundled scripted backend advertises structured tool calling
    #[serde(default = "default_true")]
    pub native_tool_calling: bool,
}

fn default_max_concurrent_sessions() -> usize {
    10
}
fn default_max_tool_calls() -> u32 {
    20
}
fn default_event_buffer() -> usize {
    128
}
fn default_model() -> String {
    "scripted/replay".into()
}
fn default_true() -> bool {
    true
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: default_max_concurrent_sessions(),
            max_tool_calls_per_session: default_max_tool_calls(),
            event_buffer: default_event_buffer(),
            default_model: default_model(),
            native_tool_calling: true,
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from the default path and apply env overrides.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_overrides(&Self::config_dir().join("config.toml"))
    }

    /// Load from `path`, then apply env overrides and validate the result.
    pub fn load_with_overrides(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_from(path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply `TOOLSTREAM_*` overrides using `lookup` to read variables.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("TOOLSTREAM_MAX_SESSIONS") {
            match raw.trim().parse() {
                Ok(n) => self.max_concurrent_sessions = n,
                Err(_) => tracing::warn!(value = %raw, "Ignoring invalid TOOLSTREAM_MAX_SESSIONS"),
            }
        }

        if let Some(raw) = lookup("TOOLSTREAM_MAX_TOOL_CALLS") {
            match raw.trim().parse() {
                Ok(n) => self.max_tool_calls_per_session = n,
                Err(_) => tracing::warn!(value = %raw, "Ignoring invalid TOOLSTREAM_MAX_TOOL_CALLS"),
            }
        }

        if let Some(model) = lookup("TOOLSTREAM_MODEL") {
            self.default_model = model;
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".toolstream")
    }

    /// The default model as a parsed reference.
    pub fn model_ref(&self) -> Result<ModelRef, ConfigError> {
        ModelRef::parse(&self.default_model).ok_or_else(|| {
            ConfigError::ValidationError(format!(
                "default_model must look like provider/model, got '{}'",
                self.default_model
            ))
        })
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_sessions == 0 {
            return Err(ConfigError::ValidationError(
                "max_concurrent_sessions must be at least 1".into(),
            ));
        }

        if self.max_tool_calls_per_session == 0 {
            return Err(ConfigError::ValidationError(
                "max_tool_calls_per_session must be at least 1".into(),
            ));
        }

        if self.event_buffer == 0 {
            return Err(ConfigError::ValidationError(
                "event_buffer must be at least 1".into(),
            ));
        }

        self.model_ref()?;
        Ok(())
    }

    /// Render the default configuration as TOML.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for toolstream_core::Error {
    fn from(err: ConfigError) -> Self {
        toolstream_core::Error::Config {
            message: err.to_string(),
        }
    }
}
