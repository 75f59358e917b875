//! File Proxy - caching proxy for a remote file store
//!
//! Clients open, read, write and close files through a proxy that keeps
//! whole-file copies in a bounded LRU cache. A lease protocol with the
//! authoritative file server keeps every proxy's cache consistent: readers
//! never see content older than the latest committed version, and writers
//! commit whole files on close.

pub mod cache_store;
pub mod cache_types;
pub mod config;
pub mod consistency;
pub mod error;
pub mod eviction;
pub mod file_server;
pub mod gateway;
pub mod logging;
pub mod remote_http;
pub mod remote_store;
pub mod retry;
pub mod session;
pub mod shutdown;
pub mod transport;
pub mod wire;

pub use error::{ProxyError, Result};
