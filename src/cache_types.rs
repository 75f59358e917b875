//! Cache Types Module
//!
//! Basic data structures shared by the cache store, the consistency manager,
//! the remote store clients and the session handler.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Monotonic content version assigned by the file server.
///
/// Version 0 is reserved for "does not exist yet" and is never handed out
/// for committed content.
pub type Version = u64;

/// Identity of a proxy instance as seen by the file server
pub type ProxyId = String;

/// Per-client open file number
pub type FileHandle = u32;

/// Cached file bytes plus the metadata the store needs for admission and eviction
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub name: String,
    pub content: Bytes,
    pub version: Version,
    pub cached_at: DateTime<Utc>,
    /// Local modifications not yet committed to the remote store
    pub dirty: bool,
    /// Accounted size in bytes; can exceed `content.len()` while a writer grows the file
    pub size: u64,
    /// Open handles and write sessions holding the entry in place
    pub pins: u32,
}

impl CacheEntry {
    pub fn new(name: &str, content: Bytes, version: Version) -> Self {
        let size = content.len() as u64;
        Self {
            name: name.to_string(),
            content,
            version,
            cached_at: Utc::now(),
            dirty: false,
            size,
            pins: 0,
        }
    }

    /// Entries that are neither dirty nor pinned may be evicted
    pub fn is_evictable(&self) -> bool {
        !self.dirty && self.pins == 0
    }
}

/// Lease modes granted by the file server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LeaseMode {
    #[default]
    None,
    Read,
    Write,
}

/// A proxy's local view of its lease on one file
#[derive(Debug, Clone)]
pub struct LeaseState {
    pub name: String,
    pub mode: LeaseMode,
    pub holder: ProxyId,
    /// Local monotonic deadline after which the lease must be re-checked
    pub expires_at: Option<Instant>,
}

impl LeaseState {
    pub fn none(name: &str, holder: &str) -> Self {
        Self {
            name: name.to_string(),
            mode: LeaseMode::None,
            holder: holder.to_string(),
            expires_at: None,
        }
    }

    /// True when the lease grants at least `mode` and has not expired
    pub fn covers(&self, mode: LeaseMode, now: Instant) -> bool {
        let mode_ok = match mode {
            LeaseMode::None => true,
            LeaseMode::Read => matches!(self.mode, LeaseMode::Read | LeaseMode::Write),
            LeaseMode::Write => self.mode == LeaseMode::Write,
        };
        let fresh = match self.expires_at {
            Some(deadline) => now < deadline,
            None => self.mode == LeaseMode::None,
        };
        mode_ok && fresh
    }
}

/// Consistency state of one file on one proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ConsistencyState {
    #[default]
    Invalid,
    ReadValid,
    WriteValid,
}

/// How a client asks to open a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenMode {
    /// Read-only; the file must exist
    Read,
    /// Read-write; the file must exist
    Write,
    /// Read-write; the file is created if missing
    Create,
    /// Read-write; the file must not exist yet
    CreateNew,
}

impl OpenMode {
    pub fn is_write(self) -> bool {
        !matches!(self, OpenMode::Read)
    }

    pub fn creates(self) -> bool {
        matches!(self, OpenMode::Create | OpenMode::CreateNew)
    }

    pub fn exclusive(self) -> bool {
        matches!(self, OpenMode::CreateNew)
    }
}

/// Open request as seen by the session handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenOptions {
    pub mode: OpenMode,
    /// Serve cached content when the remote store is unreachable
    #[serde(default)]
    pub allow_stale: bool,
}

impl From<OpenMode> for OpenOptions {
    fn from(mode: OpenMode) -> Self {
        Self {
            mode,
            allow_stale: false,
        }
    }
}

/// Origin of a seek on an open handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeekOrigin {
    Start(u64),
    Current(i64),
    End(i64),
}

/// File content as returned by the remote store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub content: Bytes,
    pub version: Version,
}

/// Lease grant returned by the remote store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseGrant {
    pub mode: LeaseMode,
    /// Current remote version, `None` when the file does not exist
    pub version: Option<Version>,
    /// How long the grant may be trusted, measured from the request
    pub ttl: Duration,
}

/// Statistics of a cache store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub current_size: u64,
    pub max_size: u64,
    pub entries_count: u64,
    pub max_entries: u64,
    pub hit_count: u64,
    pub miss_count: u64,
    pub admission_count: u64,
    pub eviction_count: u64,
    pub rejected_admissions: u64,
    pub dirty_entries: u64,
    pub last_eviction: Option<DateTime<Utc>>,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f32 {
        let total = self.hit_count + self.miss_count;
        if total > 0 {
            self.hit_count as f32 / total as f32
        } else {
            0.0
        }
    }
}
