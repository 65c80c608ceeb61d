//! REST gateways over the self channel
//!
//! A gateway is an axum router built by a user-supplied registrar. The
//! registrar gets a [`GatewayContext`] holding the self channel, so its
//! handlers can call this process's RPC services as an ordinary client, and
//! the header mappings that decide which HTTP headers travel as RPC metadata
//! and back.

use crate::loopback::SelfChannel;
use crate::routes::{normalize_prefix, HttpRoutes};
use crate::supervisor::MountTask;
use axum::extract::{OriginalUri, Request};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue, KeyAndValueRef, MetadataMap};
use tonic::transport::Channel;
use tonic::{Code, Status};
use tracing::{debug, error, info, warn};

/// Adjustment applied to every gateway router before it is mounted
pub type RouterOption = Arc<dyn Fn(Router) -> Router + Send + Sync>;

/// Builds a gateway router from the self channel
pub type GatewayRegistrar = Box<dyn FnOnce(GatewayContext) -> anyhow::Result<Router> + Send>;

/// Maps HTTP header names to RPC metadata keys and back.
///
/// Lookups are case-insensitive. Headers without a mapping are not
/// forwarded.
#[derive(Debug, Clone, Default)]
pub struct HeaderMapper {
    incoming: HashMap<String, String>,
    outgoing: HashMap<String, String>,
}

impl HeaderMapper {
    /// Create a mapper from incoming (header -> metadata) and outgoing
    /// (metadata -> header) mappings
    pub fn new(incoming: HashMap<String, String>, outgoing: HashMap<String, String>) -> Self {
        let lowercase = |map: HashMap<String, String>| {
            map.into_iter()
                .map(|(from, to)| (from.to_ascii_lowercase(), to))
                .collect()
        };

        Self {
            incoming: lowercase(incoming),
            outgoing: lowercase(outgoing),
        }
    }

    /// Metadata key an incoming header travels as
    pub fn incoming(&self, header: &str) -> Option<&str> {
        self.incoming
            .get(&header.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Header an outgoing metadata key is returned as
    pub fn outgoing(&self, key: &str) -> Option<&str> {
        self.outgoing
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Mapped request headers as RPC metadata
    pub fn to_metadata(&self, headers: &HeaderMap) -> MetadataMap {
        let mut metadata = MetadataMap::new();

        for (name, value) in headers {
            let Some(mapped) = self.incoming(name.as_str()) else {
                continue;
            };

            match (
                AsciiMetadataKey::from_bytes(mapped.as_bytes()),
                AsciiMetadataValue::try_from(value.as_bytes()),
            ) {
                (Ok(key), Ok(value)) => {
                    metadata.append(key, value);
                }
                _ => debug!(header = %name, metadata = %mapped, "Skipping unmappable header"),
            }
        }

        metadata
    }

    /// Mapped response metadata as HTTP headers
    pub fn to_headers(&self, metadata: &MetadataMap) -> HeaderMap {
        let mut headers = HeaderMap::new();

        for entry in metadata.iter() {
            let KeyAndValueRef::Ascii(key, value) = entry else {
                continue;
            };
            let Some(mapped) = self.outgoing(key.as_str()) else {
                continue;
            };

            match (
                HeaderName::from_bytes(mapped.as_bytes()),
                HeaderValue::from_bytes(value.as_encoded_bytes()),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.append(name, value);
                }
                _ => debug!(metadata = %key.as_str(), header = %mapped, "Skipping unmappable metadata"),
            }
        }

        headers
    }
}

/// What a gateway registrar gets to build its router with
#[derive(Debug, Clone)]
pub struct GatewayContext {
    loopback: SelfChannel,
    headers: Arc<HeaderMapper>,
}

impl GatewayContext {
    /// Create a context
    pub fn new(loopback: SelfChannel, headers: Arc<HeaderMapper>) -> Self {
        Self { loopback, headers }
    }

    /// Channel to this process's RPC server. Handlers should fetch it per
    /// request; it is `UNAVAILABLE` once the self connection is closed.
    pub fn channel(&self) -> Result<Channel, Status> {
        self.loopback
            .get()
            .ok_or_else(|| Status::unavailable("self connection closed"))
    }

    /// Header mappings
    pub fn headers(&self) -> &HeaderMapper {
        &self.headers
    }

    /// RPC request carrying the mapped headers as metadata
    pub fn request<T>(&self, headers: &HeaderMap, message: T) -> tonic::Request<T> {
        tonic::Request::from_parts(
            self.headers.to_metadata(headers),
            tonic::Extensions::default(),
            message,
        )
    }

    /// JSON response for an RPC outcome, with mapped metadata as headers
    pub fn reply<T: Serialize>(&self, result: Result<tonic::Response<T>, Status>) -> Response {
        match result {
            Ok(response) => {
                let headers = self.headers.to_headers(response.metadata());
                (headers, Json(response.into_inner())).into_response()
            }
            Err(status) => {
                let headers = self.headers.to_headers(status.metadata());
                (headers, GatewayError(status)).into_response()
            }
        }
    }
}

/// An RPC status rendered as an HTTP error
#[derive(Debug)]
pub struct GatewayError(pub Status);

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: i32,
    message: &'a str,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            code: self.0.code() as i32,
            message: self.0.message(),
        };
        (http_status(self.0.code()), Json(body)).into_response()
    }
}

impl From<Status> for GatewayError {
    fn from(status: Status) -> Self {
        Self(status)
    }
}

/// HTTP status for an RPC status code
pub fn http_status(code: Code) -> StatusCode {
    match code {
        Code::Ok => StatusCode::OK,
        Code::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
        Code::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
        Code::InvalidArgument => StatusCode::BAD_REQUEST,
        Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::AlreadyExists => StatusCode::CONFLICT,
        Code::PermissionDenied => StatusCode::FORBIDDEN,
        Code::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        Code::FailedPrecondition => StatusCode::BAD_REQUEST,
        Code::Aborted => StatusCode::CONFLICT,
        Code::OutOfRange => StatusCode::BAD_REQUEST,
        Code::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        Code::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        Code::DataLoss => StatusCode::INTERNAL_SERVER_ERROR,
        Code::Unauthenticated => StatusCode::UNAUTHORIZED,
    }
}

async fn log_request(request: Request, next: Next) -> Response {
    let path = request
        .extensions()
        .get::<OriginalUri>()
        .map(|uri| uri.path().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    info!(path = %path, "receive request");
    next.run(request).await
}

/// Gateways waiting to be mounted
#[derive(Default)]
pub(crate) struct GatewaySetup {
    pub(crate) gateways: Vec<(String, GatewayRegistrar)>,
    pub(crate) options: Vec<RouterOption>,
    pub(crate) headers: HeaderMapper,
}

impl std::fmt::Debug for GatewaySetup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewaySetup")
            .field("prefixes", &self.gateways.iter().map(|(prefix, _)| prefix).collect::<Vec<_>>())
            .field("options", &self.options.len())
            .field("headers", &self.headers)
            .finish()
    }
}

impl GatewaySetup {
    pub(crate) fn is_empty(&self) -> bool {
        self.gateways.is_empty()
    }

    /// Build and mount every gateway. A registrar that fails is logged and
    /// skipped; the others are still mounted.
    pub(crate) fn mount_all(self, routes: &HttpRoutes, loopback: &SelfChannel) -> usize {
        let headers = Arc::new(self.headers);
        let mut mounted = 0;

        for (index, (prefix, registrar)) in self.gateways.into_iter().enumerate() {
            let prefix = normalize_prefix(&prefix);
            let context = GatewayContext::new(loopback.clone(), Arc::clone(&headers));

            let router = match registrar(context) {
                Ok(router) => router,
                Err(e) => {
                    error!(index, prefix = %prefix, error = %e, "Register gateway handler");
                    continue;
                }
            };

            let router = self
                .options
                .iter()
                .fold(router, |router, option| option(router))
                .layer(middleware::from_fn(log_request));
            let router = match prefix.as_str() {
                "/" => router,
                nested => Router::new().nest(nested, router),
            };

            match routes.mount(&prefix, router) {
                Ok(()) => {
                    info!(prefix = %prefix, "Mounted restful gateway");
                    mounted += 1;
                }
                Err(e) => error!(index, prefix = %prefix, error = %e, "Register gateway handler"),
            }
        }

        mounted
    }

    /// Mount task: mounts the gateways, then waits for cancellation
    pub(crate) fn into_task(self, routes: Arc<HttpRoutes>, loopback: SelfChannel) -> MountTask {
        MountTask::new("gateway", move |token: CancellationToken, _| async move {
            if loopback.get().is_some() {
                self.mount_all(&routes, &loopback);
            } else {
                warn!("Self connection closed, restful gateways not mounted");
            }

            token.cancelled().await;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::routing::get;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn mapper() -> HeaderMapper {
        HeaderMapper::new(
            HashMap::from([("X-User-Id".to_string(), "user-id".to_string())]),
            HashMap::from([("x-request-cost".to_string(), "X-Request-Cost".to_string())]),
        )
    }

    fn loopback() -> SelfChannel {
        SelfChannel::dial("127.0.0.1:1".parse().unwrap()).unwrap()
    }

    #[test]
    fn test_incoming_mapping_is_case_insensitive() {
        let mapper = mapper();
        assert_eq!(mapper.incoming("x-user-id"), Some("user-id"));
        assert_eq!(mapper.incoming("X-USER-ID"), Some("user-id"));
        assert_eq!(mapper.incoming("authorization"), None);
    }

    #[test]
    fn test_only_mapped_headers_forwarded() {
        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", HeaderValue::from_static("42"));
        headers.insert("authorization", HeaderValue::from_static("Bearer t"));

        let metadata = mapper().to_metadata(&headers);
        assert_eq!(metadata.get("user-id").unwrap(), "42");
        assert!(metadata.get("authorization").is_none());
        assert!(metadata.get("x-user-id").is_none());
    }

    #[test]
    fn test_outgoing_metadata_to_headers() {
        let mut metadata = MetadataMap::new();
        metadata.insert("x-request-cost", AsciiMetadataValue::from_static("3"));
        metadata.insert("x-internal", AsciiMetadataValue::from_static("secret"));

        let headers = mapper().to_headers(&metadata);
        assert_eq!(headers.get("x-request-cost").unwrap(), "3");
        assert!(headers.get("x-internal").is_none());
    }

    #[test]
    fn test_empty_mapper_forwards_nothing() {
        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", HeaderValue::from_static("42"));
        assert!(HeaderMapper::default().to_metadata(&headers).is_empty());
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(http_status(Code::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(http_status(Code::Unauthenticated), StatusCode::UNAUTHORIZED);
        assert_eq!(http_status(Code::Unavailable), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(http_status(Code::Cancelled).as_u16(), 499);
    }

    #[tokio::test]
    async fn test_gateway_error_body() {
        let response = GatewayError(Status::not_found("no such order")).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["code"], 5);
        assert_eq!(body["message"], "no such order");
    }

    #[tokio::test]
    async fn test_failed_registrar_is_skipped() {
        let routes = HttpRoutes::new(false);
        let setup = GatewaySetup {
            gateways: vec![
                (
                    "/broken".to_string(),
                    Box::new(|_: GatewayContext| -> anyhow::Result<Router> {
                        Err(anyhow::anyhow!("no descriptor"))
                    }) as GatewayRegistrar,
                ),
                (
                    "/v1".to_string(),
                    Box::new(|_: GatewayContext| -> anyhow::Result<Router> {
                        Ok(Router::new().route("/orders", get(|| async { "[]" })))
                    }) as GatewayRegistrar,
                ),
            ],
            ..Default::default()
        };

        assert_eq!(setup.mount_all(&routes, &loopback()), 1);
        assert_eq!(routes.prefixes(), vec!["/v1".to_string()]);

        let response = routes
            .current()
            .oneshot(axum::http::Request::get("/v1/orders").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_router_options_applied() {
        let routes = HttpRoutes::new(false);
        let option: RouterOption = Arc::new(|router: Router| router.route("/health", get(|| async { "ok" })));
        let setup = GatewaySetup {
            gateways: vec![(
                "/api".to_string(),
                Box::new(|_: GatewayContext| -> anyhow::Result<Router> { Ok(Router::new()) }) as GatewayRegistrar,
            )],
            options: vec![option],
            ..Default::default()
        };
        setup.mount_all(&routes, &loopback());

        let response = routes
            .current()
            .oneshot(axum::http::Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_context_request_carries_metadata() {
        let context = GatewayContext::new(loopback(), Arc::new(mapper()));
        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", HeaderValue::from_static("7"));

        let request = context.request(&headers, ());
        assert_eq!(request.metadata().get("user-id").unwrap(), "7");
    }

    #[tokio::test]
    async fn test_context_channel_follows_close() {
        let loopback = loopback();
        let context = GatewayContext::new(loopback.clone(), Arc::new(mapper()));
        assert!(context.channel().is_ok());

        loopback.close();
        let status = context.channel().unwrap_err();
        assert_eq!(status.code(), Code::Unavailable);

        let response = context.reply::<()>(Err(status));
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
