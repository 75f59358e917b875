use file_proxy::{
    config::Config,
    gateway::serve_gateway,
    logging::LoggerManager,
    remote_http::HttpRemoteStore,
    remote_store::RemoteStore,
    session::FileProxy,
    shutdown::{ShutdownCoordinator, ShutdownSignal},
    ProxyError, Result,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let logger = LoggerManager::new(config.logging.clone(), "file-proxy");
    logger.initialize()?;
    if let Err(e) = logger.cleanup_old_logs(7) {
        warn!("Failed to clean up old log files: {}", e);
    }

    info!(
        "Starting file proxy v{} (built: {})",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIMESTAMP")
    );
    info!("Proxy id: {}", config.proxy.proxy_id);
    info!("File server: {}", config.remote.endpoint);
    info!(
        "Cache: max_size={}MB, max_entries={}",
        config.cache.max_cache_size / 1024 / 1024,
        config.cache.max_entries
    );
    if config.consistency.allow_stale_reads {
        warn!("Stale reads enabled: cached content is served while the file server is unreachable");
    }

    let remote = Arc::new(HttpRemoteStore::new(config.proxy.proxy_id.clone(), &config.remote));
    let remote_store: Arc<dyn RemoteStore> = remote.clone();
    let proxy = FileProxy::start(remote_store, &config).await?;

    let listen_addr = format!("{}:{}", config.proxy.listen_address, config.proxy.port);
    let listener = TcpListener::bind(&listen_addr)
        .await
        .map_err(|e| ProxyError::IoError(format!("Failed to bind gateway on {}: {}", listen_addr, e)))?;

    let mut shutdown_coordinator = ShutdownCoordinator::new(config.shutdown.timeout);
    shutdown_coordinator.set_proxy(proxy.clone());
    let gateway_shutdown = ShutdownSignal::new(shutdown_coordinator.subscribe());

    let gateway_task = tokio::spawn(async move {
        if let Err(e) = serve_gateway(listener, proxy, gateway_shutdown).await {
            error!("Gateway failed: {}", e);
        }
    });

    // Start shutdown listener
    let shutdown_task = tokio::spawn(async move {
        if let Err(e) = shutdown_coordinator.listen_for_shutdown().await {
            error!("Shutdown coordinator failed: {}", e);
        }
    });

    shutdown_task.await.ok();
    info!("Shutdown coordinator completed, waiting for the gateway");
    if tokio::time::timeout(Duration::from_millis(500), gateway_task).await.is_err() {
        warn!("Gateway did not stop in time");
    }

    if let Err(e) = remote.disconnect().await {
        warn!("Failed to disconnect from file server: {}", e);
    }

    info!("File proxy shutdown complete");
    Ok(())
}
