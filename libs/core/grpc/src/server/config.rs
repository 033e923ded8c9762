//! Server configuration record, optionally loaded from environment variables.

use std::env;
use std::time::Duration;

use thiserror::Error;

use crate::option::ServerOption;

/// Address used when none is configured.
pub const DEFAULT_ADDR: &str = ":8443";

/// Configuration error type
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse environment variable '{key}': {details}")]
    ParseError { key: String, details: String },
}

/// Trait for configuration that can be loaded from environment variables
pub trait FromEnv: Sized {
    fn from_env() -> Result<Self, ConfigError>;
}

/// Helper to load an environment variable with a default value
pub fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => {
            value
                .trim()
                .parse()
                .map(Some)
                .map_err(|e: T::Err| ConfigError::ParseError {
                    key: key.to_string(),
                    details: e.to_string(),
                })
        }
        _ => Ok(None),
    }
}

/// Configuration for a gRPC server built with
/// [`GrpcServer::from_config`](crate::GrpcServer::from_config).
///
/// TLS is enabled when either path is set (both are then required).
/// `server_options` are applied after the derived defaults, so they win.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// Listen address; `":port"` binds all IPv4 interfaces. Empty means
    /// [`DEFAULT_ADDR`].
    pub addr: String,
    /// PEM certificate chain
    pub cert_path: String,
    /// PEM private key
    pub key_path: String,
    /// Extra low-level options, applied last
    pub server_options: Vec<ServerOption>,
}

impl ServerConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            ..Self::default()
        }
    }

    /// Serve over TLS with the given PEM files.
    pub fn with_tls(mut self, cert_path: impl Into<String>, key_path: impl Into<String>) -> Self {
        self.cert_path = cert_path.into();
        self.key_path = key_path.into();
        self
    }

    /// Append a low-level option.
    pub fn with_option(mut self, option: ServerOption) -> Self {
        self.server_options.push(option);
        self
    }

    /// Whether TLS was asked for.
    pub fn tls_requested(&self) -> bool {
        !self.cert_path.is_empty() || !self.key_path.is_empty()
    }

    /// Fill in the default address if none was given.
    pub(crate) fn with_defaults(mut self) -> Self {
        if self.addr.is_empty() {
            self.addr = DEFAULT_ADDR.to_string();
        }
        self
    }
}

impl FromEnv for ServerConfig {
    /// Reads:
    /// - `GRPC_ADDR` (default: `:8443`)
    /// - `GRPC_TLS_CERT`, `GRPC_TLS_KEY` (default: empty, no TLS)
    /// - `GRPC_TIMEOUT_SECS` (optional per-request timeout)
    /// - `GRPC_CONCURRENCY_LIMIT` (optional, per connection)
    fn from_env() -> Result<Self, ConfigError> {
        let mut config = ServerConfig::new(env_or_default("GRPC_ADDR", DEFAULT_ADDR))
            .with_tls(env_or_default("GRPC_TLS_CERT", ""), env_or_default("GRPC_TLS_KEY", ""));

        if let Some(secs) = env_parsed::<u64>("GRPC_TIMEOUT_SECS")? {
            config = config.with_option(ServerOption::Timeout(Duration::from_secs(secs)));
        }
        if let Some(limit) = env_parsed::<usize>("GRPC_CONCURRENCY_LIMIT")? {
            config = config.with_option(ServerOption::ConcurrencyLimitPerConnection(limit));
        }

        Ok(config)
    }
}
