//! Registry backend abstraction and wire types

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use superservice_core::Result;

/// Interval between TCP health probes
pub const CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// How long a check may stay critical before the registry drops the instance
pub const DEREGISTER_CRITICAL_AFTER: Duration = Duration::from_secs(10 * 60);

/// One healthy instance returned by a health query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceEntry {
    /// Node the instance runs on
    pub node: NodeInfo,

    /// The registered service
    pub service: AgentService,
}

impl ServiceEntry {
    /// Dialable address: the service address when set, the node address otherwise
    pub fn address(&self) -> String {
        let host = if self.service.address.is_empty() {
            &self.node.address
        } else {
            &self.service.address
        };
        format!("{}:{}", host, self.service.port)
    }
}

/// Registry node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NodeInfo {
    /// Node name
    #[serde(default)]
    pub node: String,

    /// Node address
    #[serde(default)]
    pub address: String,
}

/// Registered service as reported by the registry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AgentService {
    /// Instance ID
    #[serde(rename = "ID")]
    pub id: String,

    /// Service name
    pub service: String,

    /// Instance address, empty when the node address applies
    #[serde(default)]
    pub address: String,

    /// Instance port
    pub port: u16,

    /// Tags
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

/// Service registration request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceRegistration {
    /// Instance ID
    #[serde(rename = "ID")]
    pub id: String,

    /// Service name
    pub name: String,

    /// Instance address, omitted to let the registry use the node address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// Instance port
    pub port: u16,

    /// Tags
    #[serde(default)]
    pub tags: Vec<String>,

    /// Health check attached to the instance
    pub check: ServiceCheck,
}

/// Health check definition attached to a registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceCheck {
    /// Check ID
    #[serde(rename = "CheckID")]
    pub check_id: String,

    /// Check name
    #[serde(rename = "Name")]
    pub name: String,

    /// host:port probed over TCP
    #[serde(rename = "TCP")]
    pub tcp: String,

    /// Probe interval, Go duration syntax (`10s`)
    #[serde(rename = "Interval")]
    pub interval: String,

    /// Initial status
    #[serde(rename = "Status")]
    pub status: String,

    /// Go duration syntax (`10m`)
    #[serde(rename = "DeregisterCriticalServiceAfter")]
    pub deregister_critical_service_after: String,
}

impl ServiceCheck {
    /// TCP reachability check against the loopback port of an instance
    pub fn tcp(check_id: impl Into<String>, name: impl Into<String>, port: u16) -> Self {
        Self {
            check_id: check_id.into(),
            name: name.into(),
            tcp: format!("127.0.0.1:{port}"),
            interval: format!("{}s", CHECK_INTERVAL.as_secs()),
            status: "passing".to_string(),
            deregister_critical_service_after: format!(
                "{}m",
                DEREGISTER_CRITICAL_AFTER.as_secs() / 60
            ),
        }
    }
}

/// Service registry backend
#[async_trait]
pub trait RegistryBackend: Send + Sync + fmt::Debug + 'static {
    /// Get the backend name
    fn name(&self) -> &str;

    /// Passing instances of `service`, filtered by `tag` unless it is empty
    async fn healthy_instances(&self, service: &str, tag: &str) -> Result<Vec<ServiceEntry>>;

    /// Register an instance with its health check
    async fn register(&self, registration: &ServiceRegistration) -> Result<()>;

    /// Remove an instance
    async fn deregister_service(&self, service_id: &str) -> Result<()>;

    /// Remove a health check
    async fn deregister_check(&self, check_id: &str) -> Result<()>;
}
