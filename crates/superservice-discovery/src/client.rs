//! Registry client
//!
//! Resolves logical service names through a [`RegistryBackend`], registers
//! this process as an instance with a TCP health check, and deregisters every
//! instance it registered on [`RegistryClient::close`].

use crate::backend::{RegistryBackend, ServiceCheck, ServiceEntry, ServiceRegistration};
use crate::coalesce::Group;
use crate::consul::{ConsulApi, ConsulConfig};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use superservice_core::{is_valid_service_name, Error, Result};
use tracing::{debug, error, info};

/// An instance registered by a [`RegistryClient`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredService {
    /// Instance ID, `<name>-<port>-<host>`
    pub service_id: String,

    /// Health check ID, `service:<instance id>`
    pub check_id: String,
}

/// Registry client
pub struct RegistryClient<B: RegistryBackend = ConsulApi> {
    backend: Arc<B>,
    lookups: Group<Vec<ServiceEntry>, Arc<Error>>,
    services: Mutex<Vec<RegisteredService>>,
    hostname: String,
}

impl<B: RegistryBackend> fmt::Debug for RegistryClient<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryClient")
            .field("backend", &self.backend.name())
            .field("hostname", &self.hostname)
            .field("registered", &self.services.lock().len())
            .finish()
    }
}

impl RegistryClient<ConsulApi> {
    /// Client for a Consul agent
    pub fn consul(config: ConsulConfig) -> Self {
        Self::new(ConsulApi::new(config))
    }
}

impl<B: RegistryBackend> RegistryClient<B> {
    /// Create a client over `backend`
    pub fn new(backend: B) -> Self {
        Self::from_arc(Arc::new(backend))
    }

    /// Create a client over a shared backend
    pub fn from_arc(backend: Arc<B>) -> Self {
        Self {
            backend,
            lookups: Group::new(),
            services: Mutex::new(Vec::new()),
            hostname: local_hostname(),
        }
    }

    /// Override the host part of generated instance IDs
    pub fn with_hostname(mut self, hostname: impl AsRef<str>) -> Self {
        self.hostname = hostname.as_ref().replace('.', "-");
        self
    }

    /// Registry backend
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Host part used in instance IDs
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Instances registered and not yet closed, in registration order
    pub fn registered(&self) -> Vec<RegisteredService> {
        self.services.lock().clone()
    }

    /// Healthy entries for `service`, coalescing concurrent identical queries
    async fn find(&self, service: &str, tag: &str) -> Result<Vec<ServiceEntry>, Arc<Error>> {
        let key = format!("{service}:{tag}");
        let backend = Arc::clone(&self.backend);
        let (service, tag) = (service.to_string(), tag.to_string());

        self.lookups
            .work(&key, async move {
                backend
                    .healthy_instances(&service, &tag)
                    .await
                    .map_err(Arc::new)
            })
            .await
    }

    /// One address for `service`, chosen at random among healthy instances.
    ///
    /// A literal IP address is returned as is. `None` means unresolved.
    pub async fn resolve(&self, service: &str, tag: &str) -> Option<String> {
        if let Ok(ip) = service.parse::<IpAddr>() {
            return Some(ip.to_string());
        }

        let address = self.resolve_all(service, tag).await.into_iter().next()?;
        debug!(service = %service, tag = %tag, address = %address, "Resolved service");
        Some(address)
    }

    /// Addresses of every healthy instance of `service`, shuffled
    pub async fn resolve_all(&self, service: &str, tag: &str) -> Vec<String> {
        let entries = match self.find(service, tag).await {
            Ok(entries) if !entries.is_empty() => entries,
            Ok(_) => {
                error!(service = %service, tag = %tag, "No healthy instance found in registry");
                return Vec::new();
            }
            Err(e) => {
                error!(service = %service, tag = %tag, error = %e, "Failed to find service in registry");
                return Vec::new();
            }
        };

        let mut addresses: Vec<String> = entries.iter().map(ServiceEntry::address).collect();
        addresses.shuffle(&mut rand::thread_rng());
        addresses
    }

    /// Register an instance of `name` listening on `address`.
    ///
    /// Not retried on failure.
    pub async fn register(&self, name: &str, address: &str, tag: &str) -> Result<()> {
        if !is_valid_service_name(name) {
            return Err(Error::InvalidServiceName(name.to_string()));
        }

        let (host, port) = parse_host_port(address)?;
        let service_id = format!("{}-{}-{}", name, port, self.hostname);
        let check_id = format!("service:{service_id}");

        let registration = ServiceRegistration {
            id: service_id.clone(),
            name: name.to_string(),
            address: advertised_host(&host),
            port,
            tags: if tag.is_empty() {
                Vec::new()
            } else {
                vec![tag.to_string()]
            },
            check: ServiceCheck::tcp(check_id.clone(), service_id.clone(), port),
        };

        self.backend.register(&registration).await.map_err(|e| {
            Error::Registry(format!(
                "initial register service '{name}' host to {} error: {e}",
                self.backend.name()
            ))
        })?;

        info!(service_id = %service_id, backend = %self.backend.name(), "Registered service");
        self.services.lock().push(RegisteredService {
            service_id,
            check_id,
        });
        Ok(())
    }

    /// Deregister every instance registered through this client.
    ///
    /// Each instance is attempted independently; failures are logged.
    pub async fn close(&self) {
        let services = std::mem::take(&mut *self.services.lock());

        for service in services {
            match self.deregister(&service).await {
                Ok(()) => info!(service_id = %service.service_id, "Deregistered"),
                Err(e) => error!(service_id = %service.service_id, error = %e, "Deregister"),
            }
        }
    }

    async fn deregister(&self, service: &RegisteredService) -> Result<()> {
        let service_result = self
            .backend
            .deregister_service(&service.service_id)
            .await
            .map_err(|e| Error::Registry(format!("Deregister service: {e}")));
        let check_result = self
            .backend
            .deregister_check(&service.check_id)
            .await
            .map_err(|e| Error::Registry(format!("Deregister check: {e}")));

        check_result.and(service_result)
    }
}

/// Split `address` into host and port.
///
/// Accepts socket address literals (`10.0.0.5:9000`, `[::1]:9000`) and
/// `host:port` with a hostname or an empty host (`:9000`).
pub fn parse_host_port(address: &str) -> Result<(String, u16)> {
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok((addr.ip().to_string(), addr.port()));
    }

    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| Error::invalid_address(address, "missing port"))?;
    let port: u16 = port
        .parse()
        .map_err(|_| Error::invalid_address(address, "invalid port"))?;

    let valid_host = host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
    if !valid_host {
        return Err(Error::invalid_address(address, "invalid host"));
    }

    Ok((host.to_string(), port))
}

/// Host to publish in the registration, if any
fn advertised_host(host: &str) -> Option<String> {
    match host.parse::<IpAddr>() {
        Ok(ip) if ip.is_unspecified() => None,
        Ok(ip) => Some(ip.to_string()),
        Err(_) if host.is_empty() => None,
        Err(_) => Some(host.to_string()),
    }
}

fn local_hostname() -> String {
    let hostname = match hostname::get() {
        Ok(name) if !name.is_empty() => name.to_string_lossy().into_owned(),
        _ => uuid::Uuid::new_v4().simple().to_string(),
    };
    hostname.replace('.', "-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRegistry;
    use std::collections::HashMap;
    use std::time::Duration;

    fn client() -> RegistryClient<MemoryRegistry> {
        RegistryClient::new(MemoryRegistry::new()).with_hostname("box.local")
    }

    #[test]
    fn test_parse_host_port() {
        assert_eq!(
            parse_host_port("10.0.0.5:9000").unwrap(),
            ("10.0.0.5".to_string(), 9000)
        );
        assert_eq!(parse_host_port("[::1]:9000").unwrap(), ("::1".to_string(), 9000));
        assert_eq!(
            parse_host_port("orders.internal:80").unwrap(),
            ("orders.internal".to_string(), 80)
        );
        assert_eq!(parse_host_port(":9000").unwrap(), (String::new(), 9000));
    }

    #[test]
    fn test_parse_host_port_rejects_garbage() {
        assert!(parse_host_port("10.0.0.5").is_err());
        assert!(parse_host_port("10.0.0.5:http").is_err());
        assert!(parse_host_port("10.0.0.5:70000").is_err());
        assert!(parse_host_port("bad host:80").is_err());
    }

    #[test]
    fn test_advertised_host() {
        assert_eq!(advertised_host("10.0.0.5"), Some("10.0.0.5".to_string()));
        assert_eq!(advertised_host("0.0.0.0"), None);
        assert_eq!(advertised_host(""), None);
        assert_eq!(advertised_host("orders.internal"), Some("orders.internal".to_string()));
    }

    #[test]
    fn test_hostname_dots_become_hyphens() {
        assert_eq!(client().hostname(), "box-local");
        assert!(!local_hostname().contains('.'));
    }

    #[tokio::test]
    async fn test_register_then_resolve() {
        let client = client();
        client.register("orders", "10.0.0.5:9000", "").await.unwrap();

        assert_eq!(
            client.resolve("orders", "").await.as_deref(),
            Some("10.0.0.5:9000")
        );
        assert_eq!(
            client.registered(),
            vec![RegisteredService {
                service_id: "orders-9000-box-local".to_string(),
                check_id: "service:orders-9000-box-local".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_register_rejects_invalid_input() {
        let client = client();

        let err = client.register("orders_v2", "10.0.0.5:9000", "").await.unwrap_err();
        assert!(matches!(err, Error::InvalidServiceName(_)));

        let err = client.register("orders", "nowhere", "").await.unwrap_err();
        assert!(matches!(err, Error::InvalidAddress { .. }));

        assert!(client.registered().is_empty());
        assert!(client.backend().instances().is_empty());
    }

    #[tokio::test]
    async fn test_register_with_tag() {
        let client = client();
        client.register("orders", "10.0.0.5:9000", "blue").await.unwrap();

        assert!(client.resolve("orders", "blue").await.is_some());
        assert!(client.resolve("orders", "green").await.is_none());
        assert_eq!(client.backend().instances()[0].tags, vec!["blue".to_string()]);
    }

    #[tokio::test]
    async fn test_literal_ip_skips_registry() {
        let client = client();

        assert_eq!(client.resolve("10.1.2.3", "").await.as_deref(), Some("10.1.2.3"));
        assert_eq!(client.backend().query_count(), 0);
    }

    #[tokio::test]
    async fn test_unresolved_is_empty() {
        let client = client();

        assert_eq!(client.resolve("missing", "").await, None);
        assert!(client.resolve_all("missing", "").await.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_resolves_are_coalesced() {
        let backend = Arc::new(MemoryRegistry::new().with_latency(Duration::from_millis(50)));
        let client = Arc::new(RegistryClient::from_arc(Arc::clone(&backend)).with_hostname("h"));
        client.register("orders", "10.0.0.5:9000", "").await.unwrap();

        let lookups = (0..16).map(|_| {
            let client = Arc::clone(&client);
            async move { client.resolve("orders", "").await }
        });
        let results = futures::future::join_all(lookups).await;

        assert_eq!(backend.query_count(), 1);
        assert!(results
            .iter()
            .all(|r| r.as_deref() == Some("10.0.0.5:9000")));
    }

    #[tokio::test]
    async fn test_resolve_spreads_over_instances() {
        let client = client();
        for port in [9000, 9001, 9002] {
            client
                .register("orders", &format!("10.0.0.5:{port}"), "")
                .await
                .unwrap();
        }

        let mut hits: HashMap<String, usize> = HashMap::new();
        for _ in 0..3000 {
            let address = client.resolve("orders", "").await.unwrap();
            *hits.entry(address).or_default() += 1;
        }

        assert_eq!(hits.len(), 3);
        for count in hits.values() {
            assert!((800..=1200).contains(count), "skewed distribution: {hits:?}");
        }
    }

    #[tokio::test]
    async fn test_close_deregisters_everything() {
        let client = client();
        client.register("orders", "10.0.0.5:9000", "").await.unwrap();
        client.register("orders", "10.0.0.5:9001", "").await.unwrap();

        client.close().await;

        assert!(client.registered().is_empty());
        assert!(client.backend().instances().is_empty());
        assert!(client.backend().checks().is_empty());

        // second close has nothing left to do
        client.close().await;
    }

    #[tokio::test]
    async fn test_close_continues_after_failure() {
        let client = client();
        client.register("orders", "10.0.0.5:9000", "").await.unwrap();
        client.register("billing", "10.0.0.5:9100", "").await.unwrap();

        // removed behind the client's back, so its deregistration fails
        client
            .backend()
            .deregister_service("orders-9000-box-local")
            .await
            .unwrap();

        client.close().await;

        assert!(client.backend().instances().is_empty());
        assert!(client.backend().checks().is_empty());
    }
}
