//! gRPC server initialization and lifecycle management
//!
//! This module handles all server setup:
//! - Tracing and error-report initialization
//! - Configuration from environment variables
//! - Health check service (grpc.health.v1.Health)
//! - Serving until Ctrl-C

use eyre::{Result, WrapErr};
use grpc_server::{CallLogger, Environment, FromEnv, GrpcServer, ServerConfig};
use tonic_health::server::health_reporter;
use tracing::info;

/// Run the gRPC server
///
/// 1. Sets up structured logging (env-aware: JSON for prod, pretty for dev)
/// 2. Loads `GRPC_*` configuration
/// 3. Builds the server with call logging and recovery
/// 4. Registers the health service and serves until Ctrl-C
///
/// # Errors
///
/// Returns an error if:
/// - Configuration is invalid
/// - TLS credentials cannot be loaded
/// - Server binding fails
/// - Server runtime encounters an error
pub async fn run() -> Result<()> {
    grpc_server::install_color_eyre();
    let environment = Environment::from_env();
    grpc_server::init_tracing(&environment);

    let config = ServerConfig::from_env().wrap_err("Failed to load server configuration")?;
    info!(
        addr = %config.addr,
        tls = config.tls_requested(),
        "Loaded gRPC server configuration"
    );

    let mut server = GrpcServer::from_config(Some(CallLogger::current()), config)
        .wrap_err("Failed to build gRPC server")?;

    // Create a health reporter for Kubernetes probes
    let (health_reporter, health_service) = health_reporter();
    // Empty service name is what k8s checks by default
    health_reporter
        .set_service_status("", tonic_health::ServingStatus::Serving)
        .await;
    server.add_service(health_service);
    info!("Health check service enabled (grpc.health.v1.Health)");

    server
        .serve_with_shutdown(shutdown_signal())
        .await
        .wrap_err("gRPC server failed")?;

    info!("gRPC server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
