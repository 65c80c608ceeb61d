//! In-process registry backend
//!
//! Keeps registrations in memory and answers health queries from them. Used
//! for local development and tests where no agent is running.

use crate::backend::{AgentService, NodeInfo, RegistryBackend, ServiceEntry, ServiceRegistration};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use superservice_core::{Error, Result};
use tracing::debug;

const NODE_NAME: &str = "local";
const NODE_ADDRESS: &str = "127.0.0.1";

#[derive(Debug, Clone)]
struct Instance {
    registration: ServiceRegistration,
    healthy: bool,
}

/// In-memory registry
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    instances: RwLock<HashMap<String, Instance>>,
    checks: RwLock<HashSet<String>>,
    queries: AtomicUsize,
    latency: Option<Duration>,
}

impl MemoryRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every health query by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Registered instances, healthy or not
    pub fn instances(&self) -> Vec<ServiceRegistration> {
        let mut instances: Vec<_> = self
            .instances
            .read()
            .values()
            .map(|instance| instance.registration.clone())
            .collect();
        instances.sort_by(|a, b| a.id.cmp(&b.id));
        instances
    }

    /// IDs of registered health checks
    pub fn checks(&self) -> Vec<String> {
        let mut checks: Vec<_> = self.checks.read().iter().cloned().collect();
        checks.sort();
        checks
    }

    /// Mark an instance as passing or critical
    pub fn set_health(&self, service_id: &str, healthy: bool) -> Result<()> {
        let mut instances = self.instances.write();
        let instance = instances
            .get_mut(service_id)
            .ok_or_else(|| Error::Registry(format!("Unknown service ID: {service_id}")))?;
        instance.healthy = healthy;
        Ok(())
    }

    /// Number of health queries served
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RegistryBackend for MemoryRegistry {
    fn name(&self) -> &str {
        "memory"
    }

    async fn healthy_instances(&self, service: &str, tag: &str) -> Result<Vec<ServiceEntry>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let mut entries: Vec<ServiceEntry> = self
            .instances
            .read()
            .values()
            .filter(|instance| instance.healthy)
            .map(|instance| &instance.registration)
            .filter(|registration| registration.name == service)
            .filter(|registration| tag.is_empty() || registration.tags.iter().any(|t| t == tag))
            .map(|registration| ServiceEntry {
                node: NodeInfo {
                    node: NODE_NAME.to_string(),
                    address: NODE_ADDRESS.to_string(),
                },
                service: AgentService {
                    id: registration.id.clone(),
                    service: registration.name.clone(),
                    address: registration.address.clone().unwrap_or_default(),
                    port: registration.port,
                    tags: Some(registration.tags.clone()),
                },
            })
            .collect();
        entries.sort_by(|a, b| a.service.id.cmp(&b.service.id));

        Ok(entries)
    }

    async fn register(&self, registration: &ServiceRegistration) -> Result<()> {
        debug!(service_id = %registration.id, "Registering instance in memory registry");
        self.checks
            .write()
            .insert(registration.check.check_id.clone());
        self.instances.write().insert(
            registration.id.clone(),
            Instance {
                registration: registration.clone(),
                healthy: true,
            },
        );
        Ok(())
    }

    async fn deregister_service(&self, service_id: &str) -> Result<()> {
        self.instances
            .write()
            .remove(service_id)
            .map(|_| ())
            .ok_or_else(|| Error::Registry(format!("Unknown service ID: {service_id}")))
    }

    async fn deregister_check(&self, check_id: &str) -> Result<()> {
        if self.checks.write().remove(check_id) {
            Ok(())
        } else {
            Err(Error::Registry(format!("Unknown check ID: {check_id}")))
        }
    }
}
