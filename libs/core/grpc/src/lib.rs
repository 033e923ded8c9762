//! # gRPC Server Library
//!
//! Unregistered tonic servers with the defaults every service in the monorepo
//! should share: structured call logging, panic recovery and optional TLS.
//!
//! Configuration comes either as an ordered list of [`ConfigOption`]s or as a
//! [`ServerConfig`] record. Both resolve to the same low-level
//! [`ServerOption`]s and produce a [`GrpcServer`] that is ready once at least
//! one service is registered.
//!
//! ## Quick Start
//!
//! ```ignore
//! use grpc_server::{CallLogger, ConfigOption, GrpcServer};
//! use tonic_health::server::health_reporter;
//!
//! let (reporter, health) = health_reporter();
//! let mut server = GrpcServer::new([ConfigOption::log(Some(CallLogger::current()))])?;
//! server.add_service(health);
//! server.listen_and_serve("[::1]:50051").await?;
//! ```
//!
//! ## Call chain
//!
//! With logging enabled every call, unary or streaming, runs through
//! tagging, logging and recovery (outer to inner). See [`interceptors`].

pub mod error;
pub mod interceptors;
pub mod option;
pub mod server;
pub mod telemetry;
pub mod tls;

pub use error::{ServerError, ServerResult};
pub use interceptors::{CallChain, CallTags, REQUEST_ID_HEADER};
pub use option::{ConfigOption, ServerOption, resolve_options};
pub use server::{ConfigError, DEFAULT_ADDR, FromEnv, GrpcServer, ServerConfig, env_or_default};
pub use telemetry::{CallLogger, Environment, init_tracing, install_color_eyre};
