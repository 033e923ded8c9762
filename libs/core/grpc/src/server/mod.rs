//! gRPC server construction and lifecycle.
//!
//! ## Functional options
//!
//! ```ignore
//! use grpc_server::{ConfigOption, GrpcServer};
//!
//! let mut server = GrpcServer::new([
//!     ConfigOption::tls("certs/server.crt", "certs/server.key"),
//!     ConfigOption::log(Some(CallLogger::current())),
//! ])?;
//! server.add_service(TasksServiceServer::new(my_impl));
//! server.listen_and_serve("[::]:50051").await?;
//! ```
//!
//! ## Configuration record
//!
//! ```ignore
//! use grpc_server::{FromEnv, GrpcServer, ServerConfig};
//!
//! let config = ServerConfig::from_env()?;
//! let mut server = GrpcServer::from_config(Some(CallLogger::current()), config)?;
//! server.add_service(TasksServiceServer::new(my_impl));
//! server.serve().await?;
//! ```

mod builder;
mod config;

pub use builder::GrpcServer;
pub use config::{ConfigError, DEFAULT_ADDR, FromEnv, ServerConfig, env_or_default};
