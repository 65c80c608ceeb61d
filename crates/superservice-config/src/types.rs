//! Configuration types

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::ToSocketAddrs;
use std::path::Path;
use std::time::Duration;

/// Default Consul agent port
pub const DEFAULT_REGISTRY_PORT: u16 = 8500;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServiceConfig {
    /// Service identity
    #[serde(default)]
    pub service: ServiceSection,

    /// Service registry
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Runtime behaviour
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// REST gateway header mappings
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Logging
    #[serde(default)]
    pub log: LogConfig,
}

/// Service identity
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServiceSection {
    /// Service name, `name` or `name:tag`. Empty disables registration.
    #[serde(default)]
    pub name: String,

    /// Tag, overrides the tag embedded in `name`
    #[serde(default)]
    pub tag: Option<String>,

    /// Listen port (0 = ephemeral)
    #[serde(default)]
    pub port: u16,
}

/// Service registry configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistryConfig {
    /// Switch the active finder to the registry-backed one at startup
    #[serde(default)]
    pub enabled: bool,

    /// Registry agent address (host:port or http URL)
    #[serde(default = "default_registry_address")]
    pub address: String,

    /// Datacenter filter
    #[serde(default)]
    pub datacenter: Option<String>,

    /// Per-request timeout
    #[serde(default = "default_registry_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_registry_address(),
            datacenter: None,
            timeout: default_registry_timeout(),
        }
    }
}

/// Runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeConfig {
    /// Time a task gets to exit after cancellation before it is force-failed
    #[serde(default = "default_grace_period", with = "humantime_serde")]
    pub grace_period: Duration,

    /// Time the multiplexer waits for a connection's protocol signature
    #[serde(default = "default_sniff_timeout", with = "humantime_serde")]
    pub sniff_timeout: Duration,

    /// Allow all origins on the HTTP side
    #[serde(default = "default_true")]
    pub http_cors: bool,

    /// Serve profiling endpoints under /debug/pprof
    #[serde(default)]
    pub pprof: bool,

    /// Serve the reflection debug UI under /debug
    #[serde(default)]
    pub debug_ui: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            grace_period: default_grace_period(),
            sniff_timeout: default_sniff_timeout(),
            http_cors: true,
            pprof: false,
            debug_ui: false,
        }
    }
}

/// REST gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GatewayConfig {
    /// HTTP header name -> RPC metadata key
    #[serde(default)]
    pub incoming_headers: HashMap<String, String>,

    /// RPC metadata key -> HTTP header name
    #[serde(default)]
    pub outgoing_headers: HashMap<String, String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

fn default_true() -> bool {
    true
}

fn default_grace_period() -> Duration {
    Duration::from_secs(5)
}

fn default_sniff_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_registry_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Whether the process runs inside a docker container
pub fn is_inside_docker_container() -> bool {
    Path::new("/.dockerenv").exists()
}

/// Registry agent host: the docker host when running in a container and
/// `host.docker.internal` resolves, loopback otherwise.
pub fn default_registry_host() -> String {
    if is_inside_docker_container() {
        if let Some(addr) = ("host.docker.internal", DEFAULT_REGISTRY_PORT)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
        {
            tracing::debug!(host = %addr.ip(), "Running inside docker container");
            return addr.ip().to_string();
        }
    }
    "127.0.0.1".to_string()
}

/// Default registry agent address
pub fn default_registry_address() -> String {
    format!("{}:{}", default_registry_host(), DEFAULT_REGISTRY_PORT)
}
