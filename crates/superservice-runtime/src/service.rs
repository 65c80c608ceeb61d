//! The service builder and runtime entry point

use crate::gateway::{GatewayContext, GatewaySetup, HeaderMapper, RouterOption};
use crate::loopback::SelfChannel;
use crate::mux::Multiplexer;
use crate::routes::{handler_router, http_task, normalize_prefix, HttpRoutes};
use crate::rpc::{Interceptor, RpcSetup, ServerOption};
use crate::signal::signal_task;
use crate::supervisor::{MountTask, StateHandle, Supervisor, DEFAULT_GRACE_PERIOD};
use crate::ui::ui_task;
use crate::worker::Worker;
use axum::extract::Request;
use axum::response::IntoResponse;
use axum::Router;
use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use superservice_config::ServiceConfig;
use superservice_core::{Error, Result, ServiceKey, ServiceState};
use superservice_discovery::{ConsulConfig, FinderRegistry};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tonic::body::BoxBody;
use tonic::server::NamedService;
use tonic::transport::Server;
use tonic::{Request as RpcRequest, Status};
use tower::Service;
use tracing::{debug, error, info, warn};

/// Default time the multiplexer waits for a protocol signature
pub const DEFAULT_SNIFF_TIMEOUT: Duration = Duration::from_secs(10);

const BANNER: &str = r"
  ___ _   _ _ __   ___ _ __ ___  ___ _ ____   _(_) ___ ___
 / __| | | | '_ \ / _ \ '__/ __|/ _ \ '__\ \ / / |/ __/ _ \
 \__ \ |_| | |_) |  __/ |  \__ \  __/ |   \ V /| | (_|  __/
 |___/\__,_| .__/ \___|_|  |___/\___|_|    \_/ |_|\___\___|
           |_|
";

/// One port serving RPC and HTTP, supervised as a single unit.
///
/// ```no_run
/// use superservice_runtime::SuperService;
///
/// # async fn run() -> superservice_core::Result<()> {
/// SuperService::new()
///     .with_service_name("orders:blue")
///     .with_debug_ui()
///     .listen_and_serve(9000)
///     .await
/// # }
/// ```
pub struct SuperService {
    service_name: String,
    tag: String,
    rpc: RpcSetup,
    http_handlers: Vec<(String, Router)>,
    http_cors: bool,
    pprof: bool,
    gateways: GatewaySetup,
    workers: Vec<Worker>,
    debug_ui: bool,
    grace_period: Duration,
    sniff_timeout: Duration,
    parent: CancellationToken,
    finders: Arc<FinderRegistry>,
    state: StateHandle,
}

impl std::fmt::Debug for SuperService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuperService")
            .field("service_name", &self.service_name)
            .field("tag", &self.tag)
            .field("rpc", &self.rpc)
            .field(
                "http_handlers",
                &self.http_handlers.iter().map(|(prefix, _)| prefix).collect::<Vec<_>>(),
            )
            .field("http_cors", &self.http_cors)
            .field("pprof", &self.pprof)
            .field("gateways", &self.gateways)
            .field("workers", &self.workers)
            .field("debug_ui", &self.debug_ui)
            .field("grace_period", &self.grace_period)
            .field("state", &self.state.get())
            .finish()
    }
}

impl Default for SuperService {
    fn default() -> Self {
        Self::new()
    }
}

impl SuperService {
    /// A service with CORS enabled, a 5s grace period and a manual finder
    pub fn new() -> Self {
        Self {
            service_name: String::new(),
            tag: String::new(),
            rpc: RpcSetup::default(),
            http_handlers: Vec::new(),
            http_cors: true,
            pprof: false,
            gateways: GatewaySetup::default(),
            workers: Vec::new(),
            debug_ui: false,
            grace_period: DEFAULT_GRACE_PERIOD,
            sniff_timeout: DEFAULT_SNIFF_TIMEOUT,
            parent: CancellationToken::new(),
            finders: Arc::new(FinderRegistry::default()),
            state: StateHandle::default(),
        }
    }

    /// Apply a loaded configuration.
    ///
    /// Builds a finder registry from the registry section and switches it to
    /// the registry-backed finder when `registry.enabled` is set.
    pub fn from_config(config: &ServiceConfig) -> Self {
        let finders = Arc::new(FinderRegistry::new(ConsulConfig::from(&config.registry)));
        if config.registry.enabled {
            finders.use_registry();
        }

        let mut service = Self::new()
            .with_finders(finders)
            .with_grace_period(config.runtime.grace_period)
            .with_sniff_timeout(config.runtime.sniff_timeout)
            .with_http_cors(config.runtime.http_cors)
            .with_header_mapping(HeaderMapper::new(
                config.gateway.incoming_headers.clone(),
                config.gateway.outgoing_headers.clone(),
            ));

        if !config.service.name.is_empty() {
            service = service.with_service_name(&config.service.name);
        }
        if let Some(tag) = &config.service.tag {
            service = service.with_tag(tag);
        }
        if config.runtime.pprof {
            service = service.with_pprof();
        }
        if config.runtime.debug_ui {
            service = service.with_debug_ui();
        }
        service
    }

    /// Service name, `name` or `name:tag`. A named service registers itself
    /// through the active finder once running.
    pub fn with_service_name(mut self, name: &str) -> Self {
        debug!(name = %name, "With service name");
        let key = ServiceKey::parse(name);
        self.service_name = key.name;
        if !key.tag.is_empty() || name.contains(':') {
            self.tag = key.tag;
        }
        self
    }

    /// Registration tag
    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tag = tag.to_string();
        self
    }

    /// Add an RPC service
    pub fn with_grpc_service<S>(mut self, service: S) -> Self
    where
        S: Service<http::Request<BoxBody>, Response = http::Response<BoxBody>, Error = Infallible>
            + NamedService
            + Clone
            + Send
            + 'static,
        S::Future: Send + 'static,
    {
        debug!(service = %S::NAME, "Enabled GRPC");
        self.rpc.routes.add_service(service);
        self
    }

    /// Encoded file descriptor set served through reflection
    pub fn with_file_descriptor_set(mut self, descriptor_set: &'static [u8]) -> Self {
        self.rpc.descriptor_sets.push(descriptor_set);
        self
    }

    /// Adjust the RPC server before routes are added
    pub fn with_server_option<F>(mut self, option: F) -> Self
    where
        F: Fn(Server) -> Server + Send + Sync + 'static,
    {
        self.rpc.options.push(Arc::new(option) as ServerOption);
        self
    }

    /// Server interceptor, run after those added before it
    pub fn with_interceptor<F>(mut self, interceptor: F) -> Self
    where
        F: Fn(RpcRequest<()>) -> std::result::Result<RpcRequest<()>, Status> + Send + Sync + 'static,
    {
        self.rpc.interceptors.push(Arc::new(interceptor) as Interceptor);
        self
    }

    /// Allow all origins on the HTTP side (on by default)
    pub fn with_http_cors(mut self, enabled: bool) -> Self {
        debug!(enabled, "HTTP CORS");
        self.http_cors = enabled;
        self
    }

    /// Serve profiling endpoints under `/debug/pprof`
    pub fn with_pprof(mut self) -> Self {
        self.pprof = true;
        self
    }

    /// Serve `service` under `prefix`; the prefix is stripped from the path
    pub fn with_http_handler<S>(mut self, prefix: &str, service: S) -> Self
    where
        S: Service<Request, Error = Infallible> + Clone + Send + 'static,
        S::Response: IntoResponse,
        S::Future: Send + 'static,
    {
        let prefix = normalize_prefix(prefix);
        info!(prefix = %prefix, "Registered http endpoint prefix");
        self.http_handlers.push((prefix.clone(), handler_router(&prefix, service)));
        self
    }

    /// REST gateway under `prefix`, built once the self channel is up
    pub fn with_restful_gateway<F>(mut self, prefix: &str, registrar: F) -> Self
    where
        F: FnOnce(GatewayContext) -> anyhow::Result<Router> + Send + 'static,
    {
        let prefix = normalize_prefix(prefix);
        debug!(prefix = %prefix, "Enabled GRPC HTTP Gateway");
        self.gateways.gateways.push((prefix, Box::new(registrar)));
        self
    }

    /// Adjust every gateway router before it is mounted
    pub fn with_gateway_option<F>(mut self, option: F) -> Self
    where
        F: Fn(Router) -> Router + Send + Sync + 'static,
    {
        self.gateways.options.push(Arc::new(option) as RouterOption);
        self
    }

    /// Header mappings used by gateways
    pub fn with_header_mapping(mut self, headers: HeaderMapper) -> Self {
        self.gateways.headers = headers;
        self
    }

    /// Incoming (header -> metadata) and outgoing (metadata -> header) mappings
    pub fn with_header_mappings(self, incoming: HashMap<String, String>, outgoing: HashMap<String, String>) -> Self {
        self.with_header_mapping(HeaderMapper::new(incoming, outgoing))
    }

    /// Background worker named after its function. Its return ends the service.
    pub fn with_worker<F, Fut>(self, worker: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.with(Worker::new(worker))
    }

    /// Background worker with an explicit name. Its return ends the service.
    pub fn with_named_worker<F, Fut>(self, name: &str, worker: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.with(Worker::named(name, worker))
    }

    fn with(mut self, worker: Worker) -> Self {
        debug!(worker = %worker.name(), fullname = %worker.full_name(), "Added worker");
        self.workers.push(worker);
        self
    }

    /// Reflection debug UI at `/debug`
    pub fn with_debug_ui(mut self) -> Self {
        self.debug_ui = true;
        self
    }

    /// Time tasks get to stop after the service starts draining
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Time the multiplexer waits for a connection's protocol signature
    pub fn with_sniff_timeout(mut self, sniff_timeout: Duration) -> Self {
        self.sniff_timeout = sniff_timeout;
        self
    }

    /// Stop the service when `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.parent = token;
        self
    }

    /// Finder registry used for registration
    pub fn with_finders(mut self, finders: Arc<FinderRegistry>) -> Self {
        self.finders = finders;
        self
    }

    /// Finder registry in use
    pub fn finders(&self) -> &Arc<FinderRegistry> {
        &self.finders
    }

    /// Shared view of the lifecycle state
    pub fn state(&self) -> StateHandle {
        self.state.clone()
    }

    /// Bind `0.0.0.0:port` (0 picks a free port) and serve until termination
    pub async fn listen_and_serve(self, port: u16) -> Result<()> {
        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
            .await
            .map_err(|e| Error::Runtime(format!("Failed to bind to port {port}: {e}")))?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until termination.
    ///
    /// Returns the outcome of whichever task stopped the service first.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        self.state.set(ServiceState::Mounting);
        let addr = listener.local_addr()?;

        let (mux, rpc_incoming, http_incoming) = Multiplexer::new(listener, self.sniff_timeout);

        let routes = Arc::new(HttpRoutes::new(self.http_cors));
        if self.pprof {
            mount_pprof(&routes)?;
        }
        for (prefix, router) in self.http_handlers {
            routes.mount(&prefix, router)?;
        }

        let loopback = if self.debug_ui || !self.gateways.is_empty() {
            SelfChannel::dial(addr)?
        } else {
            SelfChannel::default()
        };

        let rpc_stop = CancellationToken::new();
        let mut supervisor = Supervisor::new()
            .grace_period(self.grace_period)
            .parent(self.parent)
            .state(self.state.clone());

        supervisor.push(http_task(Arc::clone(&routes), http_incoming));
        supervisor.push(self.rpc.into_task(rpc_incoming, rpc_stop.clone())?);
        supervisor.push(MountTask::new("mux", move |token: CancellationToken, _| mux.serve(token)));
        supervisor.push(signal_task(rpc_stop, loopback.clone()));

        if !self.service_name.is_empty() {
            supervisor.push(registration_task(
                Arc::clone(&self.finders),
                self.service_name.clone(),
                self.tag.clone(),
            ));
        }
        if !self.gateways.is_empty() {
            supervisor.push(self.gateways.into_task(Arc::clone(&routes), loopback.clone()));
        }
        if self.debug_ui {
            let title = if self.service_name.is_empty() {
                "superservice".to_string()
            } else {
                self.service_name.clone()
            };
            supervisor.push(ui_task(Arc::clone(&routes), loopback.clone(), title));
        }
        for worker in self.workers {
            supervisor.push(worker.into_task());
        }

        let running = supervisor.start(addr);
        display_welcome(addr, self.debug_ui);

        let supervision = running.wait().await;
        loopback.close();

        for forced in &supervision.forced {
            warn!(error = %forced, "Task abandoned");
        }
        if let Err(e) = &supervision.result {
            error!(error = %e, "error group error");
        }
        supervision.into_result()
    }
}

#[cfg(unix)]
fn mount_pprof(routes: &HttpRoutes) -> Result<()> {
    routes.mount(crate::profiling::PREFIX, crate::profiling::router())
}

#[cfg(not(unix))]
fn mount_pprof(_routes: &HttpRoutes) -> Result<()> {
    warn!("Profiling endpoints are only available on unix");
    Ok(())
}

/// Registers the service once running, deregisters on cancellation
fn registration_task(finders: Arc<FinderRegistry>, name: String, tag: String) -> MountTask {
    MountTask::new("registry", move |token: CancellationToken, addr: SocketAddr| async move {
        let finder = finders.current();

        if let Err(e) = finder.register(&name, &addr.to_string(), &tag).await {
            error!(service = %name, error = %e, "Register service");
            return Err(e);
        }
        info!(service = %name, finder = %finder.name(), "Registered");
        if !tag.is_empty() {
            info!(service = %name, tag = %tag, "Registered with tags");
        }

        token.cancelled().await;
        finder.close().await;
        Ok(())
    })
}

fn display_welcome(addr: SocketAddr, debug_ui: bool) {
    println!("{BANNER}");
    info!(address = %addr, "Listening");
    if debug_ui {
        info!("GRPCUI address: http://127.0.0.1:{}/debug", addr.port());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use superservice_config::ConfigBuilder;
    use superservice_discovery::{MemoryRegistry, RegistryClient, ServiceFinder};

    #[test]
    fn test_service_name_with_tag() {
        let service = SuperService::new().with_service_name("orders:blue");
        assert_eq!(service.service_name, "orders");
        assert_eq!(service.tag, "blue");

        let service = SuperService::new().with_tag("green").with_service_name("orders");
        assert_eq!(service.service_name, "orders");
        assert_eq!(service.tag, "green");
    }

    #[test]
    fn test_defaults() {
        let service = SuperService::new();
        assert!(service.http_cors);
        assert!(!service.pprof);
        assert!(!service.debug_ui);
        assert_eq!(service.grace_period, Duration::from_secs(5));
        assert_eq!(service.state().get(), ServiceState::Idle);
        assert!(!service.finders().is_registry_active());
    }

    #[test]
    fn test_handler_prefix_normalized() {
        let service = SuperService::new().with_http_handler("api/", Router::new());
        assert_eq!(service.http_handlers[0].0, "/api");
    }

    #[test]
    fn test_workers_collected_in_order() {
        let service = SuperService::new()
            .with_named_worker("first", |_| async { Ok(()) })
            .with_named_worker("second", |_| async { Ok(()) });
        let names: Vec<&str> = service.workers.iter().map(Worker::name).collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[test]
    fn test_from_config() {
        let mut config = ConfigBuilder::new()
            .service_name("orders:blue")
            .grace_period(Duration::from_secs(2))
            .debug_ui(true)
            .build()
            .unwrap();
        config.runtime.http_cors = false;

        let service = SuperService::from_config(&config);
        assert_eq!(service.service_name, "orders");
        assert_eq!(service.tag, "blue");
        assert_eq!(service.grace_period, Duration::from_secs(2));
        assert!(!service.http_cors);
        assert!(service.debug_ui);
    }

    #[tokio::test]
    async fn test_registration_task_registers_and_deregisters() {
        let memory = Arc::new(MemoryRegistry::new());
        let backend = Arc::clone(&memory);
        let finders = Arc::new(FinderRegistry::with_factory(move || {
            Arc::new(RegistryClient::from_arc(Arc::clone(&backend)).with_hostname("test-host")) as Arc<dyn ServiceFinder>
        }));
        finders.use_registry();

        let parent = CancellationToken::new();
        let running = Supervisor::new()
            .parent(parent.clone())
            .task(registration_task(Arc::clone(&finders), "orders".to_string(), String::new()))
            .start("10.0.0.5:9000".parse().unwrap());

        tokio::time::timeout(Duration::from_secs(5), async {
            while memory.instances().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(
            finders.current().resolve("orders", "").await.as_deref(),
            Some("10.0.0.5:9000")
        );

        parent.cancel();
        let supervision = running.wait().await;

        assert!(matches!(supervision.result, Err(Error::Cancelled)));
        assert!(memory.instances().is_empty());
    }

    #[tokio::test]
    async fn test_registration_failure_stops_service() {
        let result = Supervisor::new()
            .task(registration_task(
                Arc::new(FinderRegistry::default()),
                "bad_name".to_string(),
                String::new(),
            ))
            .run("127.0.0.1:9000".parse().unwrap())
            .await
            .into_result();

        assert!(matches!(result, Err(Error::InvalidServiceName(_))));
    }
}
