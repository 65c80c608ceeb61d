//! Dialing other services by logical name

use std::time::Duration;
use superservice_core::{Error, Result};
use superservice_discovery::FinderRegistry;
use tonic::transport::{Channel, Endpoint};
use tracing::debug;

/// Timeout for establishing a connection
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// One address for `service` through the active finder
pub async fn discover_service_with_tag(finders: &FinderRegistry, service: &str, tag: &str) -> Option<String> {
    finders.current().resolve(service, tag).await
}

/// Untagged [`discover_service_with_tag`]
pub async fn discover_service(finders: &FinderRegistry, service: &str) -> Option<String> {
    discover_service_with_tag(finders, service, "").await
}

/// Endpoint for `service`, for callers that want to tune it before connecting
pub async fn endpoint(finders: &FinderRegistry, service: &str, tag: &str) -> Result<Endpoint> {
    let address = discover_service_with_tag(finders, service, tag)
        .await
        .ok_or_else(|| Error::Discovery(format!("service {service} with tag '{tag}' not found")))?;

    Endpoint::from_shared(format!("http://{address}"))
        .map_err(|e| Error::Transport(format!("invalid address {address} for {service}: {e}")))
}

/// Connect to `service` and `tag`, failing after `timeout`
pub async fn dial_with_timeout(finders: &FinderRegistry, service: &str, tag: &str, timeout: Duration) -> Result<Channel> {
    let endpoint = endpoint(finders, service, tag).await?.connect_timeout(timeout);
    debug!(service = %service, tag = %tag, target = %endpoint.uri(), "dial grpc service");

    match tokio::time::timeout(timeout, endpoint.connect()).await {
        Ok(Ok(channel)) => Ok(channel),
        Ok(Err(e)) => Err(Error::Transport(format!("dial {service}: {e}"))),
        Err(_) => Err(Error::Transport(format!("dial {service}: timed out after {timeout:?}"))),
    }
}

/// Connect to a tagged service
pub async fn dial_with_tag(finders: &FinderRegistry, service: &str, tag: &str) -> Result<Channel> {
    dial_with_timeout(finders, service, tag, DEFAULT_DIAL_TIMEOUT).await
}

/// Connect to a service
pub async fn dial(finders: &FinderRegistry, service: &str) -> Result<Channel> {
    dial_with_tag(finders, service, "").await
}
