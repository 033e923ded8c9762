//! Configuration options and the low-level settings they resolve to.
//!
//! A [`ConfigOption`] is deferred: nothing happens until the builder applies
//! it, once, in the order it was given. Applying it yields zero or more
//! [`ServerOption`]s, which are then handed to tonic in that same order, so
//! later settings win over earlier ones.

use std::fmt;
use std::time::Duration;

use tonic::transport::{Server, ServerTlsConfig};
use tracing::debug;

use crate::error::{ServerError, ServerResult};
use crate::interceptors::CallChain;
use crate::telemetry::CallLogger;
use crate::tls;

/// A setting accepted by the underlying tonic server at construction time.
#[derive(Clone)]
pub enum ServerOption {
    /// Serve over TLS with these credentials
    Tls(ServerTlsConfig),
    /// Wrap every call in this chain
    Interceptors(CallChain),
    /// Per-request timeout
    Timeout(Duration),
    ConcurrencyLimitPerConnection(usize),
    MaxConcurrentStreams(u32),
    InitialStreamWindowSize(u32),
    InitialConnectionWindowSize(u32),
    Http2KeepaliveInterval(Duration),
    Http2AdaptiveWindow(bool),
    MaxFrameSize(u32),
    AcceptHttp1(bool),
    /// Set TCP_NODELAY on accepted connections
    TcpNodelay(bool),
}

impl ServerOption {
    /// Short name used in logs and debug output.
    pub fn name(&self) -> &'static str {
        match self {
            ServerOption::Tls(_) => "tls",
            ServerOption::Interceptors(_) => "interceptors",
            ServerOption::Timeout(_) => "timeout",
            ServerOption::ConcurrencyLimitPerConnection(_) => "concurrency_limit_per_connection",
            ServerOption::MaxConcurrentStreams(_) => "max_concurrent_streams",
            ServerOption::InitialStreamWindowSize(_) => "initial_stream_window_size",
            ServerOption::InitialConnectionWindowSize(_) => "initial_connection_window_size",
            ServerOption::Http2KeepaliveInterval(_) => "http2_keepalive_interval",
            ServerOption::Http2AdaptiveWindow(_) => "http2_adaptive_window",
            ServerOption::MaxFrameSize(_) => "max_frame_size",
            ServerOption::AcceptHttp1(_) => "accept_http1",
            ServerOption::TcpNodelay(_) => "tcp_nodelay",
        }
    }
}

impl fmt::Debug for ServerOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerOption::Tls(_) => f.write_str("Tls(..)"),
            ServerOption::Interceptors(_) => f.write_str("Interceptors(..)"),
            ServerOption::Timeout(d) | ServerOption::Http2KeepaliveInterval(d) => {
                write!(f, "{}({d:?})", self.name())
            }
            ServerOption::ConcurrencyLimitPerConnection(n) => write!(f, "{}({n})", self.name()),
            ServerOption::MaxConcurrentStreams(n)
            | ServerOption::InitialStreamWindowSize(n)
            | ServerOption::InitialConnectionWindowSize(n)
            | ServerOption::MaxFrameSize(n) => write!(f, "{}({n})", self.name()),
            ServerOption::Http2AdaptiveWindow(b)
            | ServerOption::AcceptHttp1(b)
            | ServerOption::TcpNodelay(b) => write!(f, "{}({b})", self.name()),
        }
    }
}

/// Low-level options folded into the shape the server needs.
///
/// Everything tonic's builder understands is applied directly; the call chain
/// and the TCP settings are kept aside because they are installed at layer
/// and accept time respectively.
pub(crate) struct Applied {
    pub server: Server,
    pub chain: Option<CallChain>,
    pub tcp_nodelay: Option<bool>,
}

pub(crate) fn apply_options(options: Vec<ServerOption>) -> ServerResult<Applied> {
    let mut applied = Applied {
        server: Server::builder(),
        chain: None,
        tcp_nodelay: None,
    };

    for option in options {
        let name = option.name();
        let server = applied.server;
        applied.server = match option {
            ServerOption::Tls(config) => server
                .tls_config(config)
                .map_err(|e| ServerError::from(e).in_option(name))?,
            ServerOption::Interceptors(chain) => {
                applied.chain = Some(chain);
                server
            }
            ServerOption::Timeout(timeout) => server.timeout(timeout),
            ServerOption::ConcurrencyLimitPerConnection(limit) => {
                server.concurrency_limit_per_connection(limit)
            }
            ServerOption::MaxConcurrentStreams(max) => server.max_concurrent_streams(max),
            ServerOption::InitialStreamWindowSize(size) => server.initial_stream_window_size(size),
            ServerOption::InitialConnectionWindowSize(size) => {
                server.initial_connection_window_size(size)
            }
            ServerOption::Http2KeepaliveInterval(interval) => {
                server.http2_keepalive_interval(Some(interval))
            }
            ServerOption::Http2AdaptiveWindow(enabled) => server.http2_adaptive_window(Some(enabled)),
            ServerOption::MaxFrameSize(size) => server.max_frame_size(size),
            ServerOption::AcceptHttp1(accept) => server.accept_http1(accept),
            ServerOption::TcpNodelay(nodelay) => {
                applied.tcp_nodelay = Some(nodelay);
                server
            }
        };
    }

    Ok(applied)
}

type ApplyFn = Box<dyn FnOnce() -> ServerResult<Vec<ServerOption>> + Send>;

/// A named, one-shot unit of configuration.
///
/// # Example
/// ```ignore
/// use grpc_server::{ConfigOption, GrpcServer, ServerOption};
/// use std::time::Duration;
///
/// let server = GrpcServer::new([
///     ConfigOption::tls("certs/server.crt", "certs/server.key"),
///     ConfigOption::log(None),
///     ConfigOption::bundle([ServerOption::Timeout(Duration::from_secs(30))]),
/// ])?;
/// ```
pub struct ConfigOption {
    name: String,
    apply: ApplyFn,
}

impl ConfigOption {
    /// Build an option from any closure.
    pub fn from_fn<F>(name: impl Into<String>, apply: F) -> Self
    where
        F: FnOnce() -> ServerResult<Vec<ServerOption>> + Send + 'static,
    {
        Self {
            name: name.into(),
            apply: Box::new(apply),
        }
    }

    /// Pass low-level options through unchanged.
    pub fn bundle(options: impl IntoIterator<Item = ServerOption>) -> Self {
        let options: Vec<_> = options.into_iter().collect();
        Self::from_fn("bundle", move || Ok(options))
    }

    /// Serve over TLS using PEM files. Both paths empty means no TLS.
    pub fn tls(cert_path: impl Into<String>, key_path: impl Into<String>) -> Self {
        let cert_path = cert_path.into();
        let key_path = key_path.into();
        Self::from_fn("tls", move || tls::resolve_credentials(&cert_path, &key_path))
    }

    /// Install the tagging, logging and recovery chain.
    ///
    /// Without a logger the example logger is used, so the chain always has
    /// somewhere to write.
    pub fn log(logger: Option<CallLogger>) -> Self {
        Self::from_fn("log", move || {
            let logger = logger.unwrap_or_else(CallLogger::example);
            Ok(vec![ServerOption::Interceptors(CallChain::new(logger))])
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Apply the option. Consumes it: options run exactly once.
    pub fn apply(self) -> ServerResult<Vec<ServerOption>> {
        (self.apply)()
    }
}

impl fmt::Debug for ConfigOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigOption")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Apply options in order and concatenate what they yield.
///
/// Stops at the first failure, reporting which option failed.
pub fn resolve_options(
    options: impl IntoIterator<Item = ConfigOption>,
) -> ServerResult<Vec<ServerOption>> {
    let mut resolved = Vec::new();
    for option in options {
        let name = option.name().to_string();
        let yielded = option.apply().map_err(|e| e.in_option(&name))?;
        debug!(option = %name, yielded = ?yielded, "applied server option");
        resolved.extend(yielded);
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn names(options: &[ServerOption]) -> Vec<&'static str> {
        options.iter().map(ServerOption::name).collect()
    }

    #[test]
    fn test_resolve_preserves_order() {
        let resolved = resolve_options([
            ConfigOption::bundle([
                ServerOption::Timeout(Duration::from_secs(1)),
                ServerOption::TcpNodelay(true),
            ]),
            ConfigOption::bundle([]),
            ConfigOption::bundle([ServerOption::MaxFrameSize(16 * 1024)]),
        ])
        .unwrap();

        assert_eq!(names(&resolved), ["timeout", "tcp_nodelay", "max_frame_size"]);
    }

    #[test]
    fn test_resolve_stops_at_first_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let after = calls.clone();

        let err = resolve_options([
            ConfigOption::bundle([ServerOption::AcceptHttp1(true)]),
            ConfigOption::from_fn("broken", || {
                Err(ServerError::Configuration("bad setting".to_string()))
            }),
            ConfigOption::from_fn("never", move || {
                after.fetch_add(1, Ordering::SeqCst);
                Ok(vec![])
            }),
        ])
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        match &err {
            ServerError::OptionApplication { option, source } => {
                assert_eq!(option, "broken");
                assert!(matches!(**source, ServerError::Configuration(_)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().contains("bad setting"));
    }

    #[test]
    fn test_empty_options_resolve_to_nothing() {
        assert!(resolve_options(Vec::new()).unwrap().is_empty());
    }

    #[test]
    fn test_log_without_logger_still_installs_chain() {
        let resolved = ConfigOption::log(None).apply().unwrap();
        assert_eq!(names(&resolved), ["interceptors"]);
    }

    #[test]
    fn test_tls_without_paths_yields_nothing() {
        assert!(ConfigOption::tls("", "").apply().unwrap().is_empty());
    }

    #[test]
    fn test_apply_keeps_last_chain_and_nodelay() {
        let applied = apply_options(vec![
            ServerOption::TcpNodelay(false),
            ServerOption::Interceptors(CallChain::new(CallLogger::current())),
            ServerOption::Timeout(Duration::from_secs(5)),
            ServerOption::TcpNodelay(true),
        ])
        .unwrap();

        assert!(applied.chain.is_some());
        assert_eq!(applied.tcp_nodelay, Some(true));
    }

    #[test]
    fn test_apply_every_builder_option() {
        let applied = apply_options(vec![
            ServerOption::Timeout(Duration::from_secs(30)),
            ServerOption::ConcurrencyLimitPerConnection(32),
            ServerOption::MaxConcurrentStreams(128),
            ServerOption::InitialStreamWindowSize(1 << 20),
            ServerOption::InitialConnectionWindowSize(1 << 21),
            ServerOption::Http2KeepaliveInterval(Duration::from_secs(20)),
            ServerOption::Http2AdaptiveWindow(true),
            ServerOption::MaxFrameSize(32 * 1024),
            ServerOption::AcceptHttp1(true),
            ServerOption::Timeout(Duration::from_secs(5)),
        ])
        .unwrap();

        assert!(applied.chain.is_none());
        assert_eq!(applied.tcp_nodelay, None);
    }

    #[test]
    fn test_debug_output_names_options() {
        let dbg = format!(
            "{:?}",
            vec![ServerOption::MaxConcurrentStreams(64), ServerOption::AcceptHttp1(false)]
        );
        assert_eq!(dbg, "[max_concurrent_streams(64), accept_http1(false)]");
    }
}
