//! Configuration validation.

use crate::backend::Backend;
use crate::config::Config;
use std::collections::HashSet;
use std::time::Duration;

/// Validate the configuration.
///
/// Checks for:
/// - At least one backend
/// - Every backend URL parses as `http://host[:port]`
/// - No duplicate backends
/// - Non-zero health check timings and body limit, at least one attempt per request
/// - A usable metrics path and address
/// - A known log level
///
/// # Returns
///
/// `Ok(())` if valid, or an error message describing every problem found.
pub fn validate_config(config: &Config) -> Result<(), String> {
    let mut errors = Vec::new();

    if config.backends.is_empty() {
        errors.push("at least one backend must be defined".to_string());
    }

    let mut seen = HashSet::new();
    for url in &config.backends {
        match Backend::parse(url) {
            Ok(backend) => {
                if !seen.insert(backend.to_string()) {
                    errors.push(format!("duplicate backend: {}", backend));
                }
            }
            Err(e) => errors.push(e.to_string()),
        }
    }

    if config.health_check.interval == Duration::ZERO {
        errors.push("health_check.interval must be greater than zero".to_string());
    }
    if config.health_check.timeout == Duration::ZERO {
        errors.push("health_check.timeout must be greater than zero".to_string());
    }

    if config.proxy.max_body_size == 0 {
        errors.push("proxy.max_body_size must be greater than zero".to_string());
    }

    if config.retry.max_attempts == 0 {
        errors.push("retry.max_attempts must be at least 1".to_string());
    }

    let metrics = &config.global.metrics;
    if metrics.enabled {
        if !metrics.path.starts_with('/') {
            errors.push(format!(
                "metrics path '{}' must start with '/'",
                metrics.path
            ));
        }
        if metrics.address == config.listen {
            errors.push(format!(
                "metrics address {} conflicts with listen address",
                metrics.address
            ));
        }
    }

    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_levels.contains(&config.global.log_level.to_lowercase().as_str()) {
        errors.push(format!(
            "invalid log level '{}', must be one of: {}",
            config.global.log_level,
            valid_levels.join(", ")
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}
