//! HTTP side of the shared port
//!
//! Routers are mounted at path prefixes and a request goes to the mount with
//! the longest prefix covering its path, so `/api` and `/api/health` can be
//! mounted side by side. Mounting happens before the serve loop starts (user
//! handlers, profiling) and while it runs (gateways, the debug UI), so the
//! served router is swapped atomically on every mount and each new
//! connection picks up the latest one.

use crate::mux::MuxListener;
use crate::supervisor::MountTask;
use arc_swap::ArcSwap;
use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use parking_lot::Mutex;
use std::convert::Infallible;
use std::sync::Arc;
use superservice_core::{Error, Result};
use tokio_util::sync::CancellationToken;
use tower::{Service, ServiceExt};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, trace};

/// Router for a service mounted under `prefix`, with the prefix stripped
pub(crate) fn handler_router<S>(prefix: &str, service: S) -> Router
where
    S: Service<Request, Error = Infallible> + Clone + Send + 'static,
    S::Response: IntoResponse,
    S::Future: Send + 'static,
{
    match normalize_prefix(prefix).as_str() {
        "/" => Router::new().fallback_service(service),
        prefix => Router::new().nest_service(prefix, service),
    }
}

/// Leading slash, no trailing slash (except for the root)
pub(crate) fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_matches('/');
    format!("/{trimmed}")
}

#[derive(Clone)]
struct Mount {
    prefix: String,
    router: Router,
}

impl Mount {
    fn covers(&self, path: &str) -> bool {
        match self.prefix.as_str() {
            "/" => true,
            prefix => path
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.is_empty() || rest.starts_with('/')),
        }
    }
}

/// Mount with the longest prefix covering `path`
fn select<'a>(mounts: &'a [Mount], path: &str) -> Option<&'a Mount> {
    mounts
        .iter()
        .filter(|mount| mount.covers(path))
        .max_by_key(|mount| mount.prefix.len())
}

async fn dispatch(mounts: Arc<[Mount]>, request: Request) -> Response {
    match select(&mounts, request.uri().path()) {
        Some(mount) => match mount.router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(never) => match never {},
        },
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// The set of routers served on the HTTP side
pub(crate) struct HttpRoutes {
    mounts: Mutex<Vec<Mount>>,
    active: ArcSwap<Router>,
    cors: bool,
}

impl std::fmt::Debug for HttpRoutes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRoutes")
            .field("prefixes", &self.prefixes())
            .field("cors", &self.cors)
            .finish()
    }
}

impl HttpRoutes {
    pub(crate) fn new(cors: bool) -> Self {
        let routes = Self {
            mounts: Mutex::new(Vec::new()),
            active: ArcSwap::from_pointee(Router::new()),
            cors,
        };
        routes.active.store(Arc::new(routes.build(&[])));
        routes
    }

    /// Add a router already positioned under `prefix`.
    ///
    /// `prefix` identifies the mount; mounting the same prefix twice fails.
    pub(crate) fn mount(&self, prefix: &str, router: Router) -> Result<()> {
        let prefix = normalize_prefix(prefix);
        let mut mounts = self.mounts.lock();

        if mounts.iter().any(|mount| mount.prefix == prefix) {
            return Err(Error::Config(format!("HTTP prefix '{prefix}' is already mounted")));
        }

        mounts.push(Mount {
            prefix: prefix.clone(),
            router,
        });
        self.active.store(Arc::new(self.build(&mounts)));

        debug!(prefix = %prefix, "Mounted HTTP routes");
        Ok(())
    }

    /// Router new connections are served with
    pub(crate) fn current(&self) -> Router {
        Router::clone(&self.active.load())
    }

    /// Mounted prefixes, in mount order
    pub(crate) fn prefixes(&self) -> Vec<String> {
        self.mounts.lock().iter().map(|mount| mount.prefix.clone()).collect()
    }

    fn build(&self, mounts: &[Mount]) -> Router {
        let mounts: Arc<[Mount]> = Arc::from(mounts.to_vec());
        let router = Router::new()
            .fallback(move |request: Request| dispatch(Arc::clone(&mounts), request))
            .layer(TraceLayer::new_for_http());

        if self.cors {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }
}

/// Mount task serving HTTP/1 and non-RPC HTTP/2 connections
pub(crate) fn http_task(routes: Arc<HttpRoutes>, mut incoming: MuxListener) -> MountTask {
    MountTask::new("http", move |token: CancellationToken, _| async move {
        loop {
            let stream = tokio::select! {
                _ = token.cancelled() => {
                    info!("Stopping http server");
                    return Ok(());
                }
                stream = incoming.accept() => match stream {
                    Some(stream) => stream,
                    None if token.is_cancelled() => return Ok(()),
                    None => return Err(Error::ListenerClosed("http")),
                },
            };

            trace!(peer = ?stream.peer_addr().ok(), "Accepted http connection");

            let service = TowerToHyperService::new(routes.current());
            let token = token.clone();

            tokio::spawn(async move {
                let builder = auto::Builder::new(TokioExecutor::new());
                let connection = builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
                tokio::pin!(connection);

                let result = tokio::select! {
                    result = connection.as_mut() => result,
                    _ = token.cancelled() => {
                        connection.as_mut().graceful_shutdown();
                        connection.await
                    }
                };

                if let Err(e) = result {
                    debug!(error = %e, "HTTP connection error");
                }
            });
        }
    })
}
