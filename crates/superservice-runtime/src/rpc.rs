//! RPC server assembly

use crate::mux::MuxListener;
use crate::supervisor::MountTask;
use std::sync::Arc;
use superservice_core::{Error, Result};
use tokio_util::sync::CancellationToken;
use tonic::service::RoutesBuilder;
use tonic::transport::Server;
use tonic::{Request, Status};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

/// A server interceptor applied to every RPC request
pub type Interceptor = Arc<dyn Fn(Request<()>) -> std::result::Result<Request<()>, Status> + Send + Sync>;

/// Raw adjustment of the RPC server before routes are added
pub type ServerOption = Arc<dyn Fn(Server) -> Server + Send + Sync>;

/// Interceptors run in registration order; the first rejection wins
#[derive(Clone)]
pub struct InterceptorChain {
    interceptors: Arc<[Interceptor]>,
}

impl Default for InterceptorChain {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl std::fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("len", &self.interceptors.len())
            .finish()
    }
}

impl InterceptorChain {
    /// Chain the given interceptors
    pub fn new(interceptors: Vec<Interceptor>) -> Self {
        Self {
            interceptors: Arc::from(interceptors),
        }
    }

    /// Number of interceptors
    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    /// Whether the chain is empty
    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }
}

impl tonic::service::Interceptor for InterceptorChain {
    fn call(&mut self, mut request: Request<()>) -> std::result::Result<Request<()>, Status> {
        for interceptor in self.interceptors.iter() {
            request = interceptor(request)?;
        }
        Ok(request)
    }
}

/// Everything the RPC server is built from
#[derive(Default)]
pub(crate) struct RpcSetup {
    pub(crate) routes: RoutesBuilder,
    pub(crate) descriptor_sets: Vec<&'static [u8]>,
    pub(crate) interceptors: Vec<Interceptor>,
    pub(crate) options: Vec<ServerOption>,
}

impl std::fmt::Debug for RpcSetup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcSetup")
            .field("descriptor_sets", &self.descriptor_sets.len())
            .field("interceptors", &self.interceptors.len())
            .field("options", &self.options.len())
            .finish()
    }
}

impl RpcSetup {
    /// Reflection (v1 and v1alpha) over the registered descriptor sets
    fn add_reflection(&mut self) -> Result<()> {
        let reflection_builder = || {
            self.descriptor_sets.iter().copied().fold(
                tonic_reflection::server::Builder::configure(),
                |builder, set| builder.register_encoded_file_descriptor_set(set),
            )
        };

        let v1 = reflection_builder()
            .build_v1()
            .map_err(|e| Error::Transport(format!("reflection service: {e}")))?;
        let v1alpha = reflection_builder()
            .build_v1alpha()
            .map_err(|e| Error::Transport(format!("reflection service: {e}")))?;

        self.routes.add_service(v1);
        self.routes.add_service(v1alpha);
        Ok(())
    }

    /// Mount task serving RPC connections until `stop` or the group token fires
    pub(crate) fn into_task(mut self, incoming: MuxListener, stop: CancellationToken) -> Result<MountTask> {
        self.add_reflection()?;

        let chain = InterceptorChain::new(self.interceptors);
        let options = self.options;
        let routes = self.routes.routes();
        debug!(interceptors = chain.len(), options = options.len(), "Assembled grpc server");

        Ok(MountTask::new("grpc", move |token: CancellationToken, _| async move {
            let server = options
                .iter()
                .fold(Server::builder(), |server, option| option(server));

            let shutdown = async move {
                tokio::select! {
                    _ = stop.cancelled() => {}
                    _ = token.cancelled() => {}
                }
                info!("Stopping grpc server");
            };

            server
                .layer(
                    ServiceBuilder::new()
                        .layer(TraceLayer::new_for_grpc())
                        .layer(tonic::service::interceptor(chain))
                        .into_inner(),
                )
                .add_routes(routes)
                .serve_with_incoming_shutdown(incoming, shutdown)
                .await
                .map_err(|e| Error::Transport(format!("grpc server: {e}")))
        }))
    }
}
