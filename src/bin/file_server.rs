use file_proxy::{
    config::ServerConfig,
    file_server::FileServer,
    logging::LoggerManager,
    remote_http::RemoteStoreService,
    shutdown::{ShutdownCoordinator, ShutdownSignal},
    ProxyError, Result,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::load()?;

    let logger = LoggerManager::new(config.logging.clone(), "file-server");
    logger.initialize()?;
    if let Err(e) = logger.cleanup_old_logs(7) {
        warn!("Failed to clean up old log files: {}", e);
    }

    info!(
        "Starting file server v{} (built: {})",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIMESTAMP")
    );
    match &config.root_dir {
        Some(root) => info!("Root directory: {}", root.display()),
        None => info!("No root directory configured, files are kept in memory only"),
    }
    info!(
        "Leases: read_ttl={:?}, write_ttl={:?}, wait_timeout={:?}",
        config.leases.read_lease_ttl, config.leases.write_lease_ttl, config.leases.lease_wait_timeout
    );

    let server = Arc::new(FileServer::open(&config)?);

    let listen_addr = format!("{}:{}", config.listen_address, config.port);
    let listener = TcpListener::bind(&listen_addr)
        .await
        .map_err(|e| ProxyError::IoError(format!("Failed to bind file server on {}: {}", listen_addr, e)))?;

    let shutdown_coordinator = ShutdownCoordinator::new(config.shutdown.timeout);
    let rpc_shutdown = ShutdownSignal::new(shutdown_coordinator.subscribe());

    let rpc_task = tokio::spawn(async move {
        if let Err(e) = RemoteStoreService::new(server).serve(listener, rpc_shutdown).await {
            error!("File server failed: {}", e);
        }
    });

    let shutdown_task = tokio::spawn(async move {
        if let Err(e) = shutdown_coordinator.listen_for_shutdown().await {
            error!("Shutdown coordinator failed: {}", e);
        }
    });

    shutdown_task.await.ok();
    if tokio::time::timeout(Duration::from_millis(500), rpc_task).await.is_err() {
        warn!("RPC listener did not stop in time");
    }

    info!("File server shutdown complete");
    Ok(())
}
