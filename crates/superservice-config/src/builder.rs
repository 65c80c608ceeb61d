//! Configuration builder

use crate::types::ServiceConfig;
use std::time::Duration;

/// Builder for constructing configuration programmatically
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: ServiceConfig,
}

impl ConfigBuilder {
    /// Create a new configuration builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set service name (`name` or `name:tag`)
    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.config.service.name = name.into();
        self
    }

    /// Set service tag
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.config.service.tag = Some(tag.into());
        self
    }

    /// Set listen port
    pub fn port(mut self, port: u16) -> Self {
        self.config.service.port = port;
        self
    }

    /// Enable the registry-backed finder with the given agent address
    pub fn registry(mut self, address: impl Into<String>) -> Self {
        self.config.registry.enabled = true;
        self.config.registry.address = address.into();
        self
    }

    /// Set the shutdown grace period
    pub fn grace_period(mut self, grace_period: Duration) -> Self {
        self.config.runtime.grace_period = grace_period;
        self
    }

    /// Enable profiling endpoints
    pub fn pprof(mut self, enabled: bool) -> Self {
        self.config.runtime.pprof = enabled;
        self
    }

    /// Enable the reflection debug UI
    pub fn debug_ui(mut self, enabled: bool) -> Self {
        self.config.runtime.debug_ui = enabled;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> superservice_core::Result<ServiceConfig> {
        crate::validator::validate_config(&self.config)?;
        Ok(self.config)
    }
}
