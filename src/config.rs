//! Configuration Module
//!
//! Handles configuration loading from files, environment variables, and command-line arguments
//! for both the caching proxy (`Config`) and the authoritative file server (`ServerConfig`).

use crate::retry::RetryConfig;
use crate::{ProxyError, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use serde::{Deserialize, Serialize};

use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Custom deserializer for PathBuf that expands ~ to home directory
mod pathbuf_serde {
    use serde::{Deserialize, Deserializer};
    use std::path::PathBuf;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<PathBuf>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = Option::<String>::deserialize(deserializer)?;
        Ok(s.map(|s| expand_tilde(&s)))
    }

    pub(super) fn expand_tilde(path: &str) -> PathBuf {
        if let Some(rest) = path.strip_prefix("~/") {
            if let Some(home) = std::env::var_os("HOME") {
                let mut result = PathBuf::from(home);
                result.push(rest);
                return result;
            }
        }
        PathBuf::from(path)
    }
}

/// Duration (de)serializer for strings like "30s", "5m", "250ms"
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("Empty duration string".to_string());
        }

        // Find where the number ends and the unit begins
        let num_end = s
            .char_indices()
            .find(|(_, c)| !(c.is_ascii_digit() || *c == '.'))
            .map(|(i, _)| i)
            .unwrap_or(s.len());

        if num_end == 0 {
            return Err(format!("No number found in duration string: {}", s));
        }

        let num_str = &s[..num_end];
        let unit = s[num_end..].trim();

        let value: f64 = num_str
            .parse()
            .map_err(|e| format!("Failed to parse number '{}': {}", num_str, e))?;

        let duration = match unit {
            "s" | "sec" | "secs" | "second" | "seconds" => Duration::from_secs_f64(value),
            "m" | "min" | "mins" | "minute" | "minutes" => Duration::from_secs_f64(value * 60.0),
            "h" | "hr" | "hrs" | "hour" | "hours" => Duration::from_secs_f64(value * 3600.0),
            "ms" | "millis" | "millisecond" | "milliseconds" => {
                Duration::from_secs_f64(value / 1000.0)
            }
            "" => Duration::from_secs_f64(value), // Default to seconds if no unit
            _ => return Err(format!("Unknown duration unit: {}", unit)),
        };

        Ok(duration)
    }
}

/// Proxy endpoint and per-client limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    pub listen_address: String,
    pub port: u16,
    /// Identity presented to the file server; generated when empty
    pub proxy_id: String,
    /// Open handles allowed per client
    pub max_open_files: usize,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1".to_string(),
            port: 4041,
            proxy_id: String::new(),
            max_open_files: 10240,
        }
    }
}

/// How the proxy reaches the file server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// `host:port` of the file server
    pub endpoint: String,
    /// Upper bound for one RPC; a write grant may wait for a reader's lease to expire
    #[serde(with = "duration_serde")]
    pub request_timeout: Duration,
    /// How long one invalidation long-poll may park on the server
    #[serde(with = "duration_serde")]
    pub poll_wait: Duration,
    pub retry: RetryConfig,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            endpoint: "127.0.0.1:15440".to_string(),
            request_timeout: Duration::from_secs(60),
            poll_wait: Duration::from_secs(20),
            retry: RetryConfig::default(),
        }
    }
}

/// Cache store capacity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Aggregate content size in bytes
    pub max_cache_size: u64,
    /// Maximum number of cached files (0 = unlimited)
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_cache_size: 100 * 1024 * 1024,
            max_entries: 0,
        }
    }
}

/// Proxy-side consistency knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsistencyConfig {
    /// Subtracted from every lease ttl before the proxy trusts it
    #[serde(with = "duration_serde")]
    pub lease_safety_margin: Duration,
    /// How long a local write-open waits for the previous local writer
    #[serde(with = "duration_serde")]
    pub write_gate_timeout: Duration,
    /// Serve cached content when the file server is unreachable
    pub allow_stale_reads: bool,
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            lease_safety_margin: Duration::from_millis(500),
            write_gate_timeout: Duration::from_secs(30),
            allow_stale_reads: false,
        }
    }
}

/// Application logging
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_level: String,
    /// Directory for daily-rolling log files; console only when unset
    #[serde(deserialize_with = "pathbuf_serde::deserialize")]
    pub app_log_dir: Option<PathBuf>,
    pub console: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            app_log_dir: None,
            console: true,
        }
    }
}

/// Proxy configuration root
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub proxy: ProxySettings,
    pub remote: RemoteConfig,
    pub cache: CacheConfig,
    pub consistency: ConsistencyConfig,
    pub logging: LoggingConfig,
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Time allowed for committing open files before exit
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Load the proxy configuration from the process arguments and environment
    pub fn load() -> Result<Self> {
        Self::load_from_matches(&Self::build_cli().get_matches())
    }

    /// Same as `load`, for an explicit argument list
    pub fn load_from_args<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let matches = Self::build_cli()
            .try_get_matches_from(args)
            .map_err(|e| ProxyError::ConfigError(e.to_string()))?;
        Self::load_from_matches(&matches)
    }

    fn load_from_matches(matches: &ArgMatches) -> Result<Self> {
        let mut config = Self::default();

        // Load from config file if specified
        if let Some(config_path) = matches.get_one::<String>("config") {
            config = load_from_file(config_path)?;
        }

        // Override with environment variables
        config.apply_env_overrides();

        // Override with command line arguments
        config.apply_cli_overrides(matches);

        if config.proxy.proxy_id.is_empty() {
            config.proxy.proxy_id = format!(
                "{}-{}-{}",
                gethostname::gethostname().to_string_lossy(),
                config.proxy.port,
                &uuid::Uuid::new_v4().simple().to_string()[..8]
            );
        }

        config.validate()?;

        info!(
            "Proxy {} on {}:{}, file server {}, cache {} bytes / {} entries",
            config.proxy.proxy_id,
            config.proxy.listen_address,
            config.proxy.port,
            config.remote.endpoint,
            config.cache.max_cache_size,
            if config.cache.max_entries == 0 {
                "unlimited".to_string()
            } else {
                config.cache.max_entries.to_string()
            }
        );

        Ok(config)
    }

    fn build_cli() -> Command {
        Command::new("file-proxy")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Caching proxy for a remote file store")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path"),
            )
            .arg(
                Arg::new("port")
                    .short('p')
                    .long("port")
                    .value_name("PORT")
                    .help("Port the proxy listens on (default: 4041)"),
            )
            .arg(
                Arg::new("listen-address")
                    .long("listen-address")
                    .value_name("ADDR")
                    .help("Address the proxy binds to (default: 127.0.0.1)"),
            )
            .arg(
                Arg::new("server")
                    .long("server")
                    .value_name("HOST:PORT")
                    .help("File server endpoint (default: 127.0.0.1:15440)"),
            )
            .arg(
                Arg::new("proxy-id")
                    .long("proxy-id")
                    .value_name("ID")
                    .help("Identity presented to the file server"),
            )
            .arg(
                Arg::new("cache-size")
                    .long("cache-size")
                    .value_name("BYTES")
                    .help("Cache capacity in bytes"),
            )
            .arg(
                Arg::new("max-entries")
                    .long("max-entries")
                    .value_name("N")
                    .help("Maximum number of cached files (0 = unlimited)"),
            )
            .arg(
                Arg::new("allow-stale-reads")
                    .long("allow-stale-reads")
                    .action(ArgAction::SetTrue)
                    .help("Serve cached content when the file server is unreachable"),
            )
            .arg(
                Arg::new("log-level")
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level (trace, debug, info, warn, error)"),
            )
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("PROXY_LISTEN_PORT") {
            if let Ok(port) = port.parse() {
                self.proxy.port = port;
            }
        }

        if let Ok(proxy_id) = std::env::var("PROXY_ID") {
            self.proxy.proxy_id = proxy_id;
        }

        if let Ok(endpoint) = std::env::var("FILE_SERVER") {
            self.remote.endpoint = endpoint;
        }

        if let Ok(size) = std::env::var("CACHE_SIZE") {
            if let Ok(size) = size.parse() {
                self.cache.max_cache_size = size;
            }
        }

        if let Ok(entries) = std::env::var("CACHE_MAX_ENTRIES") {
            if let Ok(entries) = entries.parse() {
                self.cache.max_entries = entries;
            }
        }

        apply_logging_env(&mut self.logging);
    }

    fn apply_cli_overrides(&mut self, matches: &ArgMatches) {
        if let Some(port) = matches.get_one::<String>("port") {
            if let Ok(port) = port.parse() {
                self.proxy.port = port;
            }
        }

        if let Some(addr) = matches.get_one::<String>("listen-address") {
            self.proxy.listen_address = addr.clone();
        }

        if let Some(endpoint) = matches.get_one::<String>("server") {
            self.remote.endpoint = endpoint.clone();
        }

        if let Some(proxy_id) = matches.get_one::<String>("proxy-id") {
            self.proxy.proxy_id = proxy_id.clone();
        }

        if let Some(size) = matches.get_one::<String>("cache-size") {
            match size.parse() {
                Ok(size) => self.cache.max_cache_size = size,
                Err(_) => warn!("Ignoring invalid --cache-size {}", size),
            }
        }

        if let Some(entries) = matches.get_one::<String>("max-entries") {
            match entries.parse() {
                Ok(entries) => self.cache.max_entries = entries,
                Err(_) => warn!("Ignoring invalid --max-entries {}", entries),
            }
        }

        if matches.get_flag("allow-stale-reads") {
            self.consistency.allow_stale_reads = true;
        }

        if let Some(level) = matches.get_one::<String>("log-level") {
            self.logging.log_level = level.clone();
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache.max_cache_size == 0 {
            return Err(ProxyError::ConfigError(
                "cache.max_cache_size must be greater than zero".to_string(),
            ));
        }
        if self.proxy.max_open_files == 0 {
            return Err(ProxyError::ConfigError(
                "proxy.max_open_files must be greater than zero".to_string(),
            ));
        }
        if self.remote.endpoint.trim().is_empty() {
            return Err(ProxyError::ConfigError(
                "remote.endpoint must not be empty".to_string(),
            ));
        }
        if self.remote.request_timeout <= self.remote.poll_wait {
            return Err(ProxyError::ConfigError(format!(
                "remote.request_timeout ({:?}) must exceed remote.poll_wait ({:?})",
                self.remote.request_timeout, self.remote.poll_wait
            )));
        }
        debug!("Proxy configuration validated");
        Ok(())
    }
}

/// Server-side lease timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    #[serde(with = "duration_serde")]
    pub read_lease_ttl: Duration,
    #[serde(with = "duration_serde")]
    pub write_lease_ttl: Duration,
    /// Longest a lease request may wait for a conflicting holder
    #[serde(with = "duration_serde")]
    pub lease_wait_timeout: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            read_lease_ttl: Duration::from_secs(30),
            write_lease_ttl: Duration::from_secs(60),
            lease_wait_timeout: Duration::from_secs(10),
        }
    }
}

/// File server configuration root
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_address: String,
    pub port: u16,
    /// Seed files from, and write commits through to, this directory
    #[serde(deserialize_with = "pathbuf_serde::deserialize")]
    pub root_dir: Option<PathBuf>,
    pub leases: LeaseConfig,
    pub logging: LoggingConfig,
    pub shutdown: ShutdownConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1".to_string(),
            port: 15440,
            root_dir: None,
            leases: LeaseConfig::default(),
            logging: LoggingConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn load() -> Result<Self> {
        Self::load_from_matches(&Self::build_cli().get_matches())
    }

    pub fn load_from_args<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let matches = Self::build_cli()
            .try_get_matches_from(args)
            .map_err(|e| ProxyError::ConfigError(e.to_string()))?;
        Self::load_from_matches(&matches)
    }

    fn load_from_matches(matches: &ArgMatches) -> Result<Self> {
        let mut config = Self::default();

        if let Some(config_path) = matches.get_one::<String>("config") {
            config = load_from_file(config_path)?;
        }

        if let Ok(port) = std::env::var("SERVER_PORT") {
            if let Ok(port) = port.parse() {
                config.port = port;
            }
        }
        if let Ok(root) = std::env::var("SERVER_ROOT") {
            config.root_dir = Some(pathbuf_serde::expand_tilde(&root));
        }
        apply_logging_env(&mut config.logging);

        if let Some(port) = matches.get_one::<String>("port") {
            if let Ok(port) = port.parse() {
                config.port = port;
            }
        }
        if let Some(addr) = matches.get_one::<String>("listen-address") {
            config.listen_address = addr.clone();
        }
        if let Some(root) = matches.get_one::<String>("root") {
            config.root_dir = Some(pathbuf_serde::expand_tilde(root));
        }
        if let Some(ttl) = matches.get_one::<String>("read-lease-ttl") {
            config.leases.read_lease_ttl = duration_serde::parse_duration(ttl)
                .map_err(|e| ProxyError::ConfigError(format!("--read-lease-ttl: {}", e)))?;
        }
        if let Some(wait) = matches.get_one::<String>("lease-wait-timeout") {
            config.leases.lease_wait_timeout = duration_serde::parse_duration(wait)
                .map_err(|e| ProxyError::ConfigError(format!("--lease-wait-timeout: {}", e)))?;
        }
        if let Some(level) = matches.get_one::<String>("log-level") {
            config.logging.log_level = level.clone();
        }

        config.validate()?;
        info!(
            "File server on {}:{}, root {:?}, read lease {:?}, write lease {:?}",
            config.listen_address,
            config.port,
            config.root_dir,
            config.leases.read_lease_ttl,
            config.leases.write_lease_ttl
        );
        Ok(config)
    }

    fn build_cli() -> Command {
        Command::new("file-server")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Authoritative file store with lease-based invalidation")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path"),
            )
            .arg(
                Arg::new("port")
                    .short('p')
                    .long("port")
                    .value_name("PORT")
                    .help("Port the server listens on (default: 15440)"),
            )
            .arg(
                Arg::new("listen-address")
                    .long("listen-address")
                    .value_name("ADDR")
                    .help("Address the server binds to (default: 127.0.0.1)"),
            )
            .arg(
                Arg::new("root")
                    .long("root")
                    .value_name("DIR")
                    .help("Directory to seed files from and write commits to"),
            )
            .arg(
                Arg::new("read-lease-ttl")
                    .long("read-lease-ttl")
                    .value_name("DURATION")
                    .help("Read lease lifetime, e.g. 30s"),
            )
            .arg(
                Arg::new("lease-wait-timeout")
                    .long("lease-wait-timeout")
                    .value_name("DURATION")
                    .help("Longest a lease request waits, e.g. 10s"),
            )
            .arg(
                Arg::new("log-level")
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level (trace, debug, info, warn, error)"),
            )
    }

    pub fn validate(&self) -> Result<()> {
        if self.leases.read_lease_ttl.is_zero() || self.leases.write_lease_ttl.is_zero() {
            return Err(ProxyError::ConfigError(
                "lease ttls must be greater than zero".to_string(),
            ));
        }
        if self.leases.lease_wait_timeout.is_zero() {
            return Err(ProxyError::ConfigError(
                "leases.lease_wait_timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn load_from_file<T: serde::de::DeserializeOwned>(path: &str) -> Result<T> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        ProxyError::ConfigError(format!("Failed to read config file {}: {}", path, e))
    })?;

    let config: T = serde_yaml::from_str(&content).map_err(|e| {
        ProxyError::ConfigError(format!("Failed to parse config file {}: {}", path, e))
    })?;

    info!("Configuration loaded from file: {}", path);
    Ok(config)
}

fn apply_logging_env(logging: &mut LoggingConfig) {
    if let Ok(level) = std::env::var("LOG_LEVEL") {
        logging.log_level = level;
    }
    if let Ok(dir) = std::env::var("APP_LOG_DIR") {
        logging.app_log_dir = Some(pathbuf_serde::expand_tilde(&dir));
    }
}
