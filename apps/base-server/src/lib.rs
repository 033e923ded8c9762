//! Base gRPC Server
//!
//! Reference deployment of the shared server defaults: environment-driven
//! configuration, call logging and recovery, optional TLS, and the standard
//! health service (grpc.health.v1.Health) for Kubernetes probes.
//!
//! ## Modules
//!
//! - `server`: Server initialization and lifecycle

pub mod server;

pub use server::run;
