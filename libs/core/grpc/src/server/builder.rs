//! The bindable gRPC server.

use std::convert::Infallible;
use std::future::Future;
use std::io;

use futures::{Stream, StreamExt};
use http::Request;
use tokio::net::{TcpListener, TcpStream};
use tokio_stream::wrappers::TcpListenerStream;
use tonic::body::Body;
use tonic::server::NamedService;
use tonic::service::Routes;
use tonic::transport::Server;
use tower::Service;
use tower::layer::util::{Identity, Stack};
use tracing::{debug, info, warn};

use super::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::interceptors::ServerLayer;
use crate::option::{self, ConfigOption, apply_options, resolve_options};
use crate::telemetry::CallLogger;

type InnerServer = Server<Stack<ServerLayer, Identity>>;

/// A gRPC server with defaults applied and no services yet.
///
/// Register services with [`add_service`](Self::add_service), then call one
/// of the serve methods.
///
/// # Example
///
/// ```ignore
/// use grpc_server::{ConfigOption, GrpcServer};
///
/// let (reporter, health) = tonic_health::server::health_reporter();
/// let mut server = GrpcServer::new([ConfigOption::log(None)])?;
/// server.add_service(health);
/// server.listen_and_serve("[::1]:50051").await?;
/// ```
pub struct GrpcServer {
    server: InnerServer,
    routes: Option<Routes>,
    services: Vec<&'static str>,
    intercepting: bool,
    tcp_nodelay: Option<bool>,
    logger: Option<CallLogger>,
    config: ServerConfig,
}

impl GrpcServer {
    /// Build a server from configuration options, applied in order.
    ///
    /// No address is implied; pass one to
    /// [`listen_and_serve`](Self::listen_and_serve).
    pub fn new(options: impl IntoIterator<Item = ConfigOption>) -> ServerResult<Self> {
        let resolved = resolve_options(options)?;
        Self::from_server_options(resolved, None, ServerConfig::default())
    }

    /// Build a server from a configuration record.
    ///
    /// Derives, in order: TLS when a certificate or key path is set, the call
    /// chain when a logger is given, then `config.server_options` so caller
    /// options override the derived ones. An empty address becomes `:8443`.
    /// The record is kept as given; [`config`](Self::config) can be fed back
    /// in to build an identical server.
    pub fn from_config(logger: Option<CallLogger>, config: ServerConfig) -> ServerResult<Self> {
        let config = config.with_defaults();

        let mut options = Vec::new();
        if config.tls_requested() {
            options.push(ConfigOption::tls(
                config.cert_path.clone(),
                config.key_path.clone(),
            ));
        }
        if let Some(logger) = logger.clone() {
            options.push(ConfigOption::log(Some(logger)));
        }
        options.push(ConfigOption::bundle(config.server_options.clone()));

        let resolved = resolve_options(options)?;
        Self::from_server_options(resolved, logger, config)
    }

    fn from_server_options(
        resolved: Vec<option::ServerOption>,
        logger: Option<CallLogger>,
        config: ServerConfig,
    ) -> ServerResult<Self> {
        let applied = apply_options(resolved)?;
        let layer = ServerLayer::new(applied.chain);
        let intercepting = layer.is_intercepting();

        debug!(
            intercepting,
            tcp_nodelay = ?applied.tcp_nodelay,
            "gRPC server constructed"
        );

        Ok(Self {
            server: applied.server.layer(layer),
            routes: None,
            services: Vec::new(),
            intercepting,
            tcp_nodelay: applied.tcp_nodelay,
            logger,
            config,
        })
    }

    /// Register a service. Its calls go through the configured call chain.
    pub fn add_service<S>(&mut self, svc: S) -> &mut Self
    where
        S: Service<Request<Body>, Error = Infallible>
            + NamedService
            + Clone
            + Send
            + Sync
            + 'static,
        S::Response: axum::response::IntoResponse,
        S::Future: Send + 'static,
    {
        self.routes = Some(match self.routes.take() {
            Some(routes) => routes.add_service(svc),
            None => Routes::new(svc),
        });
        self.services.push(S::NAME);
        debug!(service = S::NAME, "registered gRPC service");
        self
    }

    /// Names of the registered services.
    pub fn service_names(&self) -> &[&'static str] {
        &self.services
    }

    /// Whether calls are wrapped in the tagging/logging/recovery chain.
    pub fn is_intercepting(&self) -> bool {
        self.intercepting
    }

    /// The logger given to [`from_config`](Self::from_config), if any.
    pub fn logger(&self) -> Option<&CallLogger> {
        self.logger.as_ref()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Serve on the configured address until the listener fails.
    pub async fn serve(&mut self) -> ServerResult<()> {
        let addr = self.configured_addr()?;
        self.run(&addr, None::<std::future::Pending<()>>).await
    }

    /// Serve on the configured address until `signal` resolves.
    pub async fn serve_with_shutdown<F>(&mut self, signal: F) -> ServerResult<()>
    where
        F: Future<Output = ()> + Send,
    {
        let addr = self.configured_addr()?;
        self.run(&addr, Some(signal)).await
    }

    /// Serve on `addr` until the listener fails.
    pub async fn listen_and_serve(&mut self, addr: &str) -> ServerResult<()> {
        self.run(addr, None::<std::future::Pending<()>>).await
    }

    /// Serve on `addr` until `signal` resolves, then shut down gracefully.
    pub async fn listen_and_serve_with_shutdown<F>(&mut self, addr: &str, signal: F) -> ServerResult<()>
    where
        F: Future<Output = ()> + Send,
    {
        self.run(addr, Some(signal)).await
    }

    fn registered_routes(&self) -> ServerResult<Routes> {
        match &self.routes {
            Some(routes) if !self.services.is_empty() => Ok(routes.clone()),
            _ => Err(ServerError::Configuration(
                "no services registered to this server".to_string(),
            )),
        }
    }

    fn configured_addr(&self) -> ServerResult<String> {
        self.registered_routes()?;
        if self.config.addr.is_empty() {
            return Err(ServerError::Configuration(
                "no listen address configured".to_string(),
            ));
        }
        Ok(self.config.addr.clone())
    }

    async fn run<F>(&mut self, addr: &str, signal: Option<F>) -> ServerResult<()>
    where
        F: Future<Output = ()> + Send,
    {
        let routes = self.registered_routes()?;
        let listener = bind_listener(addr).await?;
        let local_addr = listener.local_addr().map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })?;

        info!(
            addr = %local_addr,
            services = ?self.services,
            intercepting = self.intercepting,
            "gRPC server starting"
        );

        let nodelay = self.tcp_nodelay;
        let incoming = TcpListenerStream::new(listener).map(move |conn| {
            let stream = conn?;
            if let Some(nodelay) = nodelay {
                stream.set_nodelay(nodelay)?;
            }
            Ok::<_, io::Error>(stream)
        });

        self.serve_incoming(routes, incoming, signal).await
    }

    /// Serve connections from `incoming` until `signal` resolves or the
    /// stream ends. Without a signal the end of the stream is an error.
    async fn serve_incoming<I, F>(
        &mut self,
        routes: Routes,
        incoming: I,
        signal: Option<F>,
    ) -> ServerResult<()>
    where
        I: Stream<Item = io::Result<TcpStream>> + Send + Unpin + 'static,
        F: Future<Output = ()> + Send,
    {
        let router = self.server.add_routes(routes);
        match signal {
            Some(signal) => {
                router.serve_with_incoming_shutdown(incoming, signal).await?;
                info!("gRPC server shut down");
                Ok(())
            }
            None => {
                router.serve_with_incoming(incoming).await?;
                warn!("gRPC listener closed");
                Err(ServerError::ListenerClosed)
            }
        }
    }
}

/// Bind `addr`. A bare `:port` listens on every interface: dual-stack
/// `[::]` where IPv6 is available, `0.0.0.0` otherwise.
async fn bind_listener(addr: &str) -> ServerResult<TcpListener> {
    let bind_err = |source: io::Error| ServerError::Bind {
        addr: addr.to_string(),
        source,
    };

    let Some(port) = addr.strip_prefix(':') else {
        return TcpListener::bind(addr).await.map_err(bind_err);
    };
    match TcpListener::bind(format!("[::]:{port}")).await {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => Err(bind_err(e)),
        Err(e) => {
            debug!(error = %e, "IPv6 unavailable, listening on IPv4 only");
            TcpListener::bind(format!("0.0.0.0:{port}"))
                .await
                .map_err(bind_err)
        }
    }
}
