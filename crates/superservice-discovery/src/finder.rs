//! Service finders
//!
//! A [`ServiceFinder`] turns a logical service name into dialable addresses
//! and registers instances of this process. [`ManualFinder`] works from a
//! static table; [`RegistryClient`] asks the external registry.

use crate::backend::RegistryBackend;
use crate::client::{parse_host_port, RegistryClient};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use superservice_core::{is_valid_service_name, Error, Result, ServiceKey};
use tracing::{debug, info, warn};

/// Resolution and registration capability set
#[async_trait]
pub trait ServiceFinder: Send + Sync + fmt::Debug {
    /// Finder name, for logs
    fn name(&self) -> &str;

    /// One address for `service` and `tag`; `None` when unresolved
    async fn resolve(&self, service: &str, tag: &str) -> Option<String>;

    /// Every known address for `service` and `tag`
    async fn resolve_all(&self, service: &str, tag: &str) -> Vec<String>;

    /// Register an instance of this process
    async fn register(&self, name: &str, address: &str, tag: &str) -> Result<()>;

    /// Undo every registration made through this finder
    async fn close(&self);

    /// Untagged [`ServiceFinder::resolve`]
    async fn address(&self, service: &str) -> Option<String> {
        self.resolve(service, "").await
    }

    /// Untagged [`ServiceFinder::resolve_all`]
    async fn all_addresses(&self, service: &str) -> Vec<String> {
        self.resolve_all(service, "").await
    }
}

#[async_trait]
impl<B: RegistryBackend> ServiceFinder for RegistryClient<B> {
    fn name(&self) -> &str {
        self.backend().name()
    }

    async fn resolve(&self, service: &str, tag: &str) -> Option<String> {
        RegistryClient::resolve(self, service, tag).await
    }

    async fn resolve_all(&self, service: &str, tag: &str) -> Vec<String> {
        RegistryClient::resolve_all(self, service, tag).await
    }

    async fn register(&self, name: &str, address: &str, tag: &str) -> Result<()> {
        RegistryClient::register(self, name, address, tag).await
    }

    async fn close(&self) {
        RegistryClient::close(self).await
    }
}

/// Static finder with no network calls.
///
/// Mappings are added with [`ManualFinder::add`]; `register` records the
/// instance in the same table so sibling code in one process can find it.
/// Names that are already IP or socket address literals resolve to themselves.
#[derive(Debug, Default)]
pub struct ManualFinder {
    routes: RwLock<HashMap<ServiceKey, Vec<String>>>,
    registered: RwLock<Vec<(ServiceKey, String)>>,
}

impl ManualFinder {
    /// Create an empty finder
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `service` (optionally `name:tag`) to `address`
    pub fn with_route(self, service: &str, address: impl Into<String>) -> Self {
        self.add(service, address);
        self
    }

    /// Map `service` (optionally `name:tag`) to `address`
    pub fn add(&self, service: &str, address: impl Into<String>) {
        let key = ServiceKey::parse(service);
        let address = address.into();
        debug!(service = %key, address = %address, "Adding manual route");

        let mut routes = self.routes.write();
        let addresses = routes.entry(key).or_default();
        if !addresses.contains(&address) {
            addresses.push(address);
        }
    }

    /// Drop every address of `service`
    pub fn remove(&self, service: &str) {
        self.routes.write().remove(&ServiceKey::parse(service));
    }

    fn literal(service: &str) -> Option<String> {
        if let Ok(ip) = service.parse::<IpAddr>() {
            return Some(ip.to_string());
        }
        service.parse::<SocketAddr>().ok().map(|addr| addr.to_string())
    }
}

#[async_trait]
impl ServiceFinder for ManualFinder {
    fn name(&self) -> &str {
        "manual"
    }

    async fn resolve(&self, service: &str, tag: &str) -> Option<String> {
        if let Some(literal) = Self::literal(service) {
            return Some(literal);
        }

        let address = self
            .routes
            .read()
            .get(&ServiceKey::new(service, tag))
            .and_then(|addresses| addresses.first().cloned());

        if address.is_none() {
            warn!(service = %service, tag = %tag, "No manual route for service");
        }
        address
    }

    async fn resolve_all(&self, service: &str, tag: &str) -> Vec<String> {
        if let Some(literal) = Self::literal(service) {
            return vec![literal];
        }

        self.routes
            .read()
            .get(&ServiceKey::new(service, tag))
            .cloned()
            .unwrap_or_default()
    }

    async fn register(&self, name: &str, address: &str, tag: &str) -> Result<()> {
        if !is_valid_service_name(name) {
            return Err(Error::InvalidServiceName(name.to_string()));
        }
        let (host, port) = parse_host_port(address)?;
        let host = if host.is_empty() {
            "127.0.0.1"
        } else {
            host.as_str()
        };
        let address = match host.parse::<IpAddr>() {
            Ok(ip) if ip.is_unspecified() => format!("127.0.0.1:{port}"),
            Ok(ip) => SocketAddr::new(ip, port).to_string(),
            Err(_) => format!("{host}:{port}"),
        };

        let key = ServiceKey::new(name, tag);
        {
            let mut routes = self.routes.write();
            let addresses = routes.entry(key.clone()).or_default();
            if !addresses.contains(&address) {
                addresses.push(address.clone());
            }
        }

        info!(service = %key, address = %address, "Registered service in manual finder");
        self.registered.write().push((key, address));
        Ok(())
    }

    async fn close(&self) {
        let registered = std::mem::take(&mut *self.registered.write());
        let mut routes = self.routes.write();

        for (key, address) in registered {
            if let Some(addresses) = routes.get_mut(&key) {
                addresses.retain(|a| a != &address);
                if addresses.is_empty() {
                    routes.remove(&key);
                }
            }
            debug!(service = %key, address = %address, "Removed manual registration");
        }
    }
}
