//! CLI command implementations.

pub mod config_cmd;
pub mod replay;
pub mod run;
pub mod tools;

use std::path::Path;

use toolstream_config::{ConfigError, OrchestratorConfig};

/// Load the config from `path` if given, otherwise from the default location.
pub fn load_config(path: Option<&Path>) -> Result<OrchestratorConfig, ConfigError> {
    match path {
        Some(path) => OrchestratorConfig::load_with_overrides(path),
        None => OrchestratorConfig::load(),
    }
}
