//! Logging Module
//!
//! Installs the global `tracing` subscriber: a compact console layer and, when
//! a log directory is configured, a daily-rolling file layer under
//! `<app_log_dir>/<hostname>/`.

use crate::config::LoggingConfig;
use crate::{ProxyError, Result};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Logger manager for one process (proxy or file server)
pub struct LoggerManager {
    config: LoggingConfig,
    hostname: String,
    /// File name prefix, e.g. `file-proxy.log`
    file_name: String,
}

impl LoggerManager {
    pub fn new(config: LoggingConfig, component: &str) -> Self {
        Self {
            config,
            hostname: gethostname::gethostname().to_string_lossy().to_string(),
            file_name: format!("{}.log", component),
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Directory the rolling file appender writes to, if file logging is on
    pub fn host_log_dir(&self) -> Option<PathBuf> {
        self.config
            .app_log_dir
            .as_ref()
            .map(|dir| dir.join(&self.hostname))
    }

    /// Initialize the logging system
    pub fn initialize(&self) -> Result<()> {
        let host_log_dir = self.host_log_dir();

        let file_layer = match &host_log_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir).map_err(|e| {
                    ProxyError::IoError(format!("Failed to create app log directory: {}", e))
                })?;
                let file_appender =
                    RollingFileAppender::new(Rotation::DAILY, dir.clone(), &self.file_name);
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(file_appender)
                        .with_ansi(false)
                        .with_target(true)
                        .with_thread_ids(true)
                        .with_file(true)
                        .with_line_number(true)
                        .with_level(true)
                        .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
                        .compact(),
                )
            }
            None => None,
        };

        let console_layer = self.config.console.then(|| {
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(true)
                .with_target(false)
                .with_level(true)
                .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
                .compact()
        });

        // RUST_LOG wins over the configured level
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&self.config.log_level));

        let result = tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(console_layer)
            .try_init();

        match result {
            Ok(_) => {
                info!("Application logging initialized for host: {}", self.hostname);
                if let Some(dir) = &host_log_dir {
                    info!("Application logs will be written to: {:?}", dir);
                }
            }
            Err(_) => {
                // Already initialized, likely in tests
                debug!("Tracing subscriber already initialized, skipping");
            }
        }

        Ok(())
    }

    /// Remove rolled log files older than `keep_days`; returns how many went
    pub fn cleanup_old_logs(&self, keep_days: u32) -> Result<usize> {
        match self.host_log_dir() {
            Some(dir) => cleanup_dir(&dir, Duration::from_secs(keep_days as u64 * 24 * 3600)),
            None => Ok(0),
        }
    }
}

fn cleanup_dir(log_dir: &Path, max_age: Duration) -> Result<usize> {
    let cutoff_time = SystemTime::now()
        .checked_sub(max_age)
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let mut removed = 0;
    if let Ok(entries) = std::fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            if let Ok(modified) = metadata.modified() {
                if modified < cutoff_time {
                    match std::fs::remove_file(entry.path()) {
                        Ok(()) => {
                            debug!("Removed old log file: {:?}", entry.path());
                            removed += 1;
                        }
                        Err(e) => warn!("Failed to remove old log file {:?}: {}", entry.path(), e),
                    }
                }
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_initialize_creates_host_dir() {
        let temp = TempDir::new().unwrap();
        let config = LoggingConfig {
            log_level: "debug".to_string(),
            app_log_dir: Some(temp.path().to_path_buf()),
            console: false,
        };
        let manager = LoggerManager::new(config, "file-proxy").with_hostname("test-host");
        manager.initialize().unwrap();
        // Second initialization is tolerated
        manager.initialize().unwrap();

        assert!(temp.path().join("test-host").is_dir());
    }

    #[test]
    fn test_cleanup_keeps_recent_files() {
        let temp = TempDir::new().unwrap();
        let config = LoggingConfig {
            log_level: "info".to_string(),
            app_log_dir: Some(temp.path().to_path_buf()),
            console: false,
        };
        let manager = LoggerManager::new(config, "file-server").with_hostname("h");
        let dir = manager.host_log_dir().unwrap();
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("file-server.log.2026-10-01"), b"old").unwrap();

        assert_eq!(manager.cleanup_old_logs(30).unwrap(), 0);
        assert_eq!(cleanup_dir(&dir, Duration::ZERO).unwrap(), 1);
    }

    #[test]
    fn test_console_only_without_dir() {
        let manager = LoggerManager::new(LoggingConfig::default(), "file-proxy");
        assert!(manager.host_log_dir().is_none());
        assert_eq!(manager.cleanup_old_logs(1).unwrap(), 0);
    }
}
