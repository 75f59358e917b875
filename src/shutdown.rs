//! Graceful Shutdown Module
//!
//! Signal handling and the shutdown sequence: listeners stop accepting, then
//! every client session of the proxy is closed (committing dirty files) and
//! the remaining leases are released, all bounded by a timeout.

use crate::session::FileProxy;
use crate::{ProxyError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, error, info};

/// Shutdown coordinator for graceful system shutdown
pub struct ShutdownCoordinator {
    proxy: Option<Arc<FileProxy>>,
    shutdown_sender: broadcast::Sender<()>,
    shutdown_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(shutdown_timeout: Duration) -> Self {
        let (shutdown_sender, _) = broadcast::channel(16);

        Self {
            proxy: None,
            shutdown_sender,
            shutdown_timeout,
        }
    }

    /// Proxy whose sessions are closed on shutdown
    pub fn set_proxy(&mut self, proxy: Arc<FileProxy>) {
        self.proxy = Some(proxy);
    }

    /// Get shutdown receiver for components to listen for shutdown signals
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_sender.subscribe()
    }

    /// Wait for SIGINT or SIGTERM, then run the shutdown sequence
    pub async fn listen_for_shutdown(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        let mut sigint =
            signal::unix::signal(signal::unix::SignalKind::interrupt()).map_err(|e| {
                ProxyError::SystemError(format!("Failed to create SIGINT handler: {}", e))
            })?;

        let mut sigterm =
            signal::unix::signal(signal::unix::SignalKind::terminate()).map_err(|e| {
                ProxyError::SystemError(format!("Failed to create SIGTERM handler: {}", e))
            })?;

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, initiating graceful shutdown");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
            }
        }

        self.initiate_shutdown().await
    }

    pub async fn initiate_shutdown(&self) -> Result<()> {
        info!("Initiating graceful shutdown sequence");

        if let Err(e) = self.shutdown_sender.send(()) {
            // No listener left is normal at this point
            debug!("Shutdown signal not sent (no active receivers): {}", e);
        }

        match timeout(self.shutdown_timeout, self.perform_shutdown()).await {
            Ok(()) => {
                info!("Graceful shutdown completed successfully");
                Ok(())
            }
            Err(_) => {
                error!(
                    "Graceful shutdown timed out after {:?}, uncommitted changes may be lost",
                    self.shutdown_timeout
                );
                Err(ProxyError::TimeoutError(
                    "Graceful shutdown timeout".to_string(),
                ))
            }
        }
    }

    async fn perform_shutdown(&self) {
        if let Some(proxy) = &self.proxy {
            info!("Closing client sessions of proxy {}", proxy.proxy_id());
            proxy.shutdown().await;
        }

        // Give a moment for final log messages to be written
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Shutdown signal wrapper for components
pub struct ShutdownSignal {
    receiver: broadcast::Receiver<()>,
    shutdown_requested: bool,
}

impl ShutdownSignal {
    pub fn new(receiver: broadcast::Receiver<()>) -> Self {
        Self {
            receiver,
            shutdown_requested: false,
        }
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    /// Wait for shutdown signal; a closed or lagged channel counts as one
    pub async fn wait_for_shutdown(&mut self) {
        let _ = self.receiver.recv().await;
        self.shutdown_requested = true;
    }
}
