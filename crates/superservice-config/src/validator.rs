//! Configuration validation

use crate::ServiceConfig;
use superservice_core::{is_valid_service_name, Error, Result, ServiceKey};

/// Validate configuration
pub fn validate_config(config: &ServiceConfig) -> Result<()> {
    validate_service(config)?;
    validate_registry(config)?;
    validate_runtime(config)?;
    validate_log(config)?;
    Ok(())
}

fn validate_service(config: &ServiceConfig) -> Result<()> {
    if config.service.name.is_empty() {
        return Ok(());
    }

    let key = ServiceKey::parse(&config.service.name);
    if !is_valid_service_name(&key.name) {
        return Err(Error::Config(format!(
            "service name '{}' may only contain letters, digits and hyphens",
            key.name
        )));
    }

    Ok(())
}

fn validate_registry(config: &ServiceConfig) -> Result<()> {
    if config.registry.address.trim().is_empty() {
        return Err(Error::Config("registry address cannot be empty".to_string()));
    }

    if config.registry.timeout.is_zero() {
        return Err(Error::Config("registry timeout must be > 0".to_string()));
    }

    if config.registry.enabled && config.service.name.is_empty() {
        tracing::warn!("Registry enabled without a service name, nothing will be registered");
    }

    Ok(())
}

fn validate_runtime(config: &ServiceConfig) -> Result<()> {
    if config.runtime.grace_period.is_zero() {
        return Err(Error::Config("grace_period must be > 0".to_string()));
    }

    if config.runtime.grace_period.as_secs() > 60 {
        tracing::warn!("grace_period is very high (>1 minute)");
    }

    if config.runtime.sniff_timeout.is_zero() {
        return Err(Error::Config("sniff_timeout must be > 0".to_string()));
    }

    Ok(())
}

fn validate_log(config: &ServiceConfig) -> Result<()> {
    match config.log.level.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        other => Err(Error::Config(format!("Invalid log level: {other}"))),
    }
}
