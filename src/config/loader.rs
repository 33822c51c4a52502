//! Configuration loading.
//!
//! Settings come from an optional YAML file, then command-line overrides are
//! applied, then the result is validated as a whole.

use crate::config::{validate_config, Config};
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Values given on the command line that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Appended after the file's backends.
    pub backends: Vec<String>,
    pub listen: Option<SocketAddr>,
    pub log_level: Option<String>,
}

/// Load, merge, and validate configuration.
///
/// # Arguments
///
/// * `path` - Optional YAML file; defaults are used when absent
/// * `overrides` - Command-line values applied on top of the file
///
/// # Returns
///
/// The merged and validated configuration, or an error.
pub fn load_config(path: Option<&Path>, overrides: ConfigOverrides) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(path) => parse_config(&std::fs::read_to_string(path)?)?,
        None => Config::default(),
    };

    config.backends.extend(overrides.backends);
    if let Some(listen) = overrides.listen {
        config.listen = listen;
    }
    if let Some(level) = overrides.log_level {
        config.global.log_level = level;
    }

    validate_config(&config).map_err(ConfigError::ValidationError)?;

    Ok(config)
}

/// Parse YAML text into a configuration without validating it.
pub fn parse_config(contents: &str) -> Result<Config, ConfigError> {
    if contents.trim().is_empty() {
        return Ok(Config::default());
    }
    Ok(serde_yaml::from_str(contents)?)
}
