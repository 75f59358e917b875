//! Error Module
//!
//! Defines error types and result types used throughout the file proxy.
//!
//! The variants mirror the failure taxonomy of the cache: some are resolved
//! internally (`CacheMiss`, `StaleVersion`), some are recoverable by the caller
//! (`LeaseTimeout`, `CapacityExceeded`, `Busy`) and some require the caller to
//! act (`Conflict`, `RemoteUnavailable`).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the file proxy
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProxyError {
    #[error("Cache miss: {0}")]
    CacheMiss(String),

    #[error("Stale version for {name}: cached {cached}, offered {offered}")]
    StaleVersion {
        name: String,
        cached: u64,
        offered: u64,
    },

    #[error("Lease timeout: {0}")]
    LeaseTimeout(String),

    #[error("Remote store unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("Cache capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Commit conflict on {name}: expected version {expected}, remote is at {current}")]
    Conflict {
        name: String,
        expected: u64,
        current: u64,
    },

    #[error("Entry busy: {0}")]
    Busy(String),

    #[error("No such file: {0}")]
    NotFound(String),

    #[error("File already exists: {0}")]
    AlreadyExists(String),

    #[error("Bad file handle: {0}")]
    BadHandle(u32),

    #[error("Too many open files for client {0}")]
    TooManyOpenFiles(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("System error: {0}")]
    SystemError(String),

    #[error("Timeout error: {0}")]
    TimeoutError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl ProxyError {
    /// Whether the caller can reasonably retry the same operation later
    /// without changing anything on its side.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProxyError::LeaseTimeout(_)
                | ProxyError::CapacityExceeded(_)
                | ProxyError::Busy(_)
                | ProxyError::RemoteUnavailable(_)
                | ProxyError::TimeoutError(_)
        )
    }

    /// POSIX-style negative error code reported to intercepted clients.
    pub fn errno(&self) -> i32 {
        match self {
            ProxyError::NotFound(_) | ProxyError::CacheMiss(_) => -2, // ENOENT
            ProxyError::IoError(_) | ProxyError::InternalError(_) => -5, // EIO
            ProxyError::BadHandle(_) => -9,                            // EBADF
            ProxyError::Busy(_) => -16,                                // EBUSY
            ProxyError::AlreadyExists(_) => -17,                       // EEXIST
            ProxyError::InvalidRequest(_)
            | ProxyError::ConfigError(_)
            | ProxyError::SerializationError(_) => -22, // EINVAL
            ProxyError::TooManyOpenFiles(_) => -24,                    // EMFILE
            ProxyError::CapacityExceeded(_) => -28,                    // ENOSPC
            ProxyError::RemoteUnavailable(_) | ProxyError::HttpError(_) => -107, // ENOTCONN
            ProxyError::LeaseTimeout(_) | ProxyError::TimeoutError(_) => -110, // ETIMEDOUT
            ProxyError::Conflict { .. } | ProxyError::StaleVersion { .. } => -116, // ESTALE
            ProxyError::SystemError(_) => -1,                          // EPERM
        }
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::IoError(err.to_string())
    }
}

impl From<hyper::Error> for ProxyError {
    fn from(err: hyper::Error) -> Self {
        ProxyError::HttpError(err.to_string())
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(err: serde_json::Error) -> Self {
        ProxyError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ProxyError {
    fn from(err: serde_yaml::Error) -> Self {
        ProxyError::SerializationError(err.to_string())
    }
}

/// Result type alias for the file proxy
pub type Result<T> = std::result::Result<T, ProxyError>;
