//! Consul agent HTTP API backend

use crate::backend::{RegistryBackend, ServiceEntry, ServiceRegistration};
use async_trait::async_trait;
use bytes::Bytes;
use http::{header, Method, Request, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use superservice_config::RegistryConfig;
use superservice_core::{Error, Result};
use tracing::debug;
use url::Url;

/// Consul configuration
#[derive(Debug, Clone)]
pub struct ConsulConfig {
    /// Agent address, `host:port` or a full `http://` URL
    pub address: String,

    /// Datacenter filter
    pub datacenter: Option<String>,

    /// Per-request timeout
    pub timeout: Duration,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self::from(&RegistryConfig::default())
    }
}

impl From<&RegistryConfig> for ConsulConfig {
    fn from(config: &RegistryConfig) -> Self {
        Self {
            address: config.address.clone(),
            datacenter: config.datacenter.clone(),
            timeout: config.timeout,
        }
    }
}

/// Consul agent API client
#[derive(Debug, Clone)]
pub struct ConsulApi {
    /// Base URL of the agent
    base: String,

    /// Datacenter filter
    datacenter: Option<String>,

    /// HTTP client
    client: Client<HttpConnector, Full<Bytes>>,

    /// Per-request timeout
    timeout: Duration,
}

impl ConsulApi {
    /// Create a new Consul API client
    pub fn new(config: ConsulConfig) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();

        let base = if config.address.starts_with("http://") || config.address.starts_with("https://")
        {
            config.address.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", config.address.trim_end_matches('/'))
        };

        Self {
            base,
            datacenter: config.datacenter,
            client,
            timeout: config.timeout,
        }
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(ConsulConfig::default())
    }

    /// Agent base URL
    pub fn base_url(&self) -> &str {
        &self.base
    }

    /// Build Consul API URL
    fn build_url(&self, segments: &[&str], query: &[(&str, &str)]) -> Result<Uri> {
        let mut url = Url::parse(&self.base)
            .map_err(|e| Error::Registry(format!("Invalid Consul URL: {e}")))?;

        url.path_segments_mut()
            .map_err(|_| Error::Registry(format!("Consul URL cannot be a base: {}", self.base)))?
            .pop_if_empty()
            .extend(segments);

        {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
            if let Some(dc) = &self.datacenter {
                pairs.append_pair("dc", dc);
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }

        url.as_str()
            .parse()
            .map_err(|e| Error::Registry(format!("Invalid Consul URL: {e}")))
    }

    /// Make HTTP request to Consul
    async fn request(&self, method: Method, uri: Uri, body: Option<Vec<u8>>) -> Result<Bytes> {
        let mut builder = Request::builder().method(method.clone()).uri(uri.clone());
        if body.is_some() {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
        }

        let req = builder
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| Error::Registry(format!("Failed to build request: {e}")))?;

        let res = tokio::time::timeout(self.timeout, self.client.request(req))
            .await
            .map_err(|_| Error::Registry(format!("Consul request timed out: {method} {uri}")))?
            .map_err(|e| Error::Registry(format!("Consul request failed: {e}")))?;

        let status = res.status();
        let body = res
            .into_body()
            .collect()
            .await
            .map_err(|e| Error::Registry(format!("Failed to read response: {e}")))?
            .to_bytes();

        if !status.is_success() {
            return Err(Error::Registry(format!(
                "Unexpected response code: {} ({})",
                status.as_u16(),
                String::from_utf8_lossy(&body).trim()
            )));
        }

        Ok(body)
    }
}

#[async_trait]
impl RegistryBackend for ConsulApi {
    fn name(&self) -> &str {
        "consul"
    }

    async fn healthy_instances(&self, service: &str, tag: &str) -> Result<Vec<ServiceEntry>> {
        debug!(service = %service, tag = %tag, "Querying Consul for healthy instances");

        let mut query = vec![("passing", "true")];
        if !tag.is_empty() {
            query.push(("tag", tag));
        }

        let uri = self.build_url(&["v1", "health", "service", service], &query)?;
        let body = self.request(Method::GET, uri, None).await?;

        let entries: Vec<ServiceEntry> = serde_json::from_slice(&body)
            .map_err(|e| Error::Registry(format!("Failed to parse health entries: {e}")))?;

        debug!(service = %service, count = entries.len(), "Found healthy instances");
        Ok(entries)
    }

    async fn register(&self, registration: &ServiceRegistration) -> Result<()> {
        let uri = self.build_url(&["v1", "agent", "service", "register"], &[])?;
        let body = serde_json::to_vec(registration)?;
        self.request(Method::PUT, uri, Some(body)).await?;
        Ok(())
    }

    async fn deregister_service(&self, service_id: &str) -> Result<()> {
        let uri = self.build_url(&["v1", "agent", "service", "deregister", service_id], &[])?;
        self.request(Method::PUT, uri, None).await?;
        Ok(())
    }

    async fn deregister_check(&self, check_id: &str) -> Result<()> {
        let uri = self.build_url(&["v1", "agent", "check", "deregister", check_id], &[])?;
        self.request(Method::PUT, uri, None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ServiceCheck;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn api(address: &str) -> ConsulApi {
        ConsulApi::new(ConsulConfig {
            address: address.to_string(),
            datacenter: None,
            timeout: Duration::from_secs(2),
        })
    }

    #[test]
    fn test_consul_creation() {
        let consul = api("127.0.0.1:8500");
        assert_eq!(consul.name(), "consul");
        assert_eq!(consul.base_url(), "http://127.0.0.1:8500");
    }

    #[test]
    fn test_build_url() {
        let consul = api("http://127.0.0.1:8500/");
        let uri = consul
            .build_url(
                &["v1", "health", "service", "orders"],
                &[("passing", "true"), ("tag", "blue")],
            )
            .unwrap();
        assert_eq!(
            uri.to_string(),
            "http://127.0.0.1:8500/v1/health/service/orders?passing=true&tag=blue"
        );

        let uri = consul.build_url(&["v1", "agent", "service", "register"], &[]).unwrap();
        assert_eq!(uri.to_string(), "http://127.0.0.1:8500/v1/agent/service/register");
    }

    #[test]
    fn test_build_url_with_datacenter() {
        let consul = ConsulApi::new(ConsulConfig {
            address: "127.0.0.1:8500".to_string(),
            datacenter: Some("dc2".to_string()),
            timeout: Duration::from_secs(2),
        });
        let uri = consul.build_url(&["v1", "health", "service", "orders"], &[]).unwrap();
        assert_eq!(
            uri.to_string(),
            "http://127.0.0.1:8500/v1/health/service/orders?dc=dc2"
        );
    }

    #[tokio::test]
    async fn test_healthy_instances() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/health/service/orders"))
            .and(query_param("passing", "true"))
            .and(query_param("tag", "blue"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {
                    "Node": {"Node": "n1", "Address": "10.0.0.1"},
                    "Service": {"ID": "orders-9000-a", "Service": "orders", "Address": "10.0.0.5", "Port": 9000, "Tags": ["blue"]}
                }
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let consul = api(&server.uri());
        let entries = consul.healthy_instances("orders", "blue").await.unwrap();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].address(), "10.0.0.5:9000");
    }

    #[tokio::test]
    async fn test_register_sends_registration() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/agent/service/register"))
            .and(body_partial_json(serde_json::json!({
                "ID": "orders-9000-host",
                "Name": "orders",
                "Port": 9000,
                "Check": {"TCP": "127.0.0.1:9000", "Interval": "10s"}
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let consul = api(&server.uri());
        let registration = ServiceRegistration {
            id: "orders-9000-host".to_string(),
            name: "orders".to_string(),
            address: None,
            port: 9000,
            tags: vec![],
            check: ServiceCheck::tcp("service:orders-9000-host", "orders-9000-host", 9000),
        };

        consul.register(&registration).await.unwrap();
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/agent/service/deregister/orders-9000-host"))
            .respond_with(ResponseTemplate::new(500).set_body_string("agent unavailable"))
            .mount(&server)
            .await;

        let consul = api(&server.uri());
        let err = consul.deregister_service("orders-9000-host").await.unwrap_err();

        assert!(matches!(err, Error::Registry(_)));
        assert!(err.to_string().contains("500"));
        assert!(err.to_string().contains("agent unavailable"));
    }

    #[tokio::test]
    async fn test_unreachable_agent() {
        let consul = api("127.0.0.1:1");
        let result = consul.healthy_instances("orders", "").await;
        assert!(result.is_err());
    }
}
