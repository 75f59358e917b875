//! Consistency Manager Module
//!
//! Tracks the per-file consistency state of one proxy
//! (`Invalid -> ReadValid -> WriteValid -> Invalid`) and drives the lease
//! protocol against the remote store.
//!
//! Every operation on a file runs under that file's async mutex, so the
//! consistency record and the cache entry change together. The store-wide
//! lock inside `SharedCacheStore` is only taken for single lookups and
//! admissions, never across a remote call.
//!
//! Invalidations arrive on the transport's task and must not block: they only
//! bump the file's invalidation epoch. The next operation on the file compares
//! the epoch with the one it last saw and drops the state to `Invalid`.

use crate::cache_store::SharedCacheStore;
use crate::cache_types::{CacheEntry, ConsistencyState, LeaseMode, LeaseState, OpenMode, ProxyId, Version};
use crate::config::ConsistencyConfig;
use crate::remote_store::{InvalidationListener, RemoteStore};
use crate::retry::is_transport_failure;
use crate::{ProxyError, Result};
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

struct FileRecord {
    state: ConsistencyState,
    lease: LeaseState,
    /// Invalidation epoch observed by the last operation
    seen_epoch: u64,
}

struct FileSlot {
    record: Mutex<FileRecord>,
    /// One local write session per file at a time
    write_gate: Arc<Semaphore>,
    invalidations: AtomicU64,
}

impl FileSlot {
    fn new(name: &str, proxy_id: &str) -> Self {
        Self {
            record: Mutex::new(FileRecord {
                state: ConsistencyState::Invalid,
                lease: LeaseState::none(name, proxy_id),
                seen_epoch: 0,
            }),
            write_gate: Arc::new(Semaphore::new(1)),
            invalidations: AtomicU64::new(0),
        }
    }
}

/// A read handle's view of a file: one version, fixed for the handle's lifetime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadBinding {
    pub version: Version,
    pub content: Bytes,
    /// Served from cache while the remote store was unreachable
    pub stale: bool,
}

impl ReadBinding {
    fn of(entry: CacheEntry, stale: bool) -> Self {
        Self {
            version: entry.version,
            content: entry.content,
            stale,
        }
    }

    pub fn size(&self) -> u64 {
        self.content.len() as u64
    }
}

/// A checked-out copy of a file being written by one handle.
///
/// Holds the local write gate until dropped.
#[derive(Debug)]
pub struct WriteSession {
    name: String,
    base_version: Version,
    buffer: Vec<u8>,
    dirty: bool,
    closed: bool,
    _permit: Option<OwnedSemaphorePermit>,
}

/// Gives back a write lease whose open never produced a `WriteSession`,
/// e.g. because the caller dropped the future while the base version was
/// being fetched. Keeps the local write gate until the release went through.
struct WriteLeaseGuard {
    manager: Arc<ConsistencyManager>,
    name: String,
    permit: Option<OwnedSemaphorePermit>,
}

impl WriteLeaseGuard {
    fn disarm(mut self) -> Option<OwnedSemaphorePermit> {
        self.permit.take()
    }
}

impl Drop for WriteLeaseGuard {
    fn drop(&mut self) {
        let Some(permit) = self.permit.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("Write lease on {} left to expire: no runtime to release it", self.name);
            return;
        };
        let manager = self.manager.clone();
        let name = std::mem::take(&mut self.name);
        debug!("Open of {} for writing abandoned, releasing its lease", name);
        runtime.spawn(async move {
            let slot = manager.slot(&name);
            let mut record = slot.record.lock().await;
            manager.release_remote(&name).await;
            manager.reset(&mut record, &name);
            drop(record);
            drop(permit);
        });
    }
}

impl WriteSession {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Version the modifications are based on (0 for a new file)
    pub fn base_version(&self) -> Version {
        self.base_version
    }

    pub fn len(&self) -> u64 {
        self.buffer.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Read back from the session's own buffer
    pub fn read_at(&self, offset: u64, len: usize) -> Bytes {
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(self.buffer.len());
        let end = start.saturating_add(len).min(self.buffer.len());
        Bytes::copy_from_slice(&self.buffer[start..end])
    }
}

#[derive(Default)]
struct ConsistencyCounters {
    lease_requests: AtomicU64,
    fetches: AtomicU64,
    revalidations: AtomicU64,
    invalidations: AtomicU64,
    commits: AtomicU64,
    conflicts: AtomicU64,
    stale_reads: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyStats {
    pub lease_requests: u64,
    /// Content downloads
    pub fetches: u64,
    /// Lease renewals that found the cached version current
    pub revalidations: u64,
    pub invalidations_received: u64,
    pub commits: u64,
    pub conflicts: u64,
    pub stale_reads: u64,
    pub tracked_files: u64,
}

pub struct ConsistencyManager {
    proxy_id: ProxyId,
    config: ConsistencyConfig,
    store: Arc<SharedCacheStore>,
    remote: Arc<dyn RemoteStore>,
    slots: DashMap<String, Arc<FileSlot>>,
    counters: ConsistencyCounters,
}

impl ConsistencyManager {
    pub fn new(
        store: Arc<SharedCacheStore>,
        remote: Arc<dyn RemoteStore>,
        config: ConsistencyConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            proxy_id: remote.proxy_id().to_string(),
            config,
            store,
            remote,
            slots: DashMap::new(),
            counters: ConsistencyCounters::default(),
        })
    }

    pub fn proxy_id(&self) -> &str {
        &self.proxy_id
    }

    pub fn store(&self) -> &Arc<SharedCacheStore> {
        &self.store
    }

    /// Route the server's invalidations for this proxy to this manager
    pub async fn subscribe(self: &Arc<Self>) -> Result<()> {
        let listener: Arc<dyn InvalidationListener> = self.clone();
        self.remote.subscribe(listener).await
    }

    fn slot(&self, name: &str) -> Arc<FileSlot> {
        self.slots
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(FileSlot::new(name, &self.proxy_id)))
            .clone()
    }

    /// Apply invalidations that arrived since the last operation on this file
    fn refresh(&self, slot: &FileSlot, record: &mut FileRecord, name: &str) {
        let epoch = slot.invalidations.load(Ordering::SeqCst);
        if epoch != record.seen_epoch {
            record.seen_epoch = epoch;
            if record.state != ConsistencyState::Invalid {
                info!("{} invalidated by the file server ({:?} -> Invalid)", name, record.state);
            }
            record.state = ConsistencyState::Invalid;
            record.lease = LeaseState::none(name, &self.proxy_id);
        }
    }

    fn lease_until(&self, name: &str, mode: LeaseMode, requested_at: Instant, ttl: Duration) -> LeaseState {
        LeaseState {
            name: name.to_string(),
            mode,
            holder: self.proxy_id.clone(),
            expires_at: Some(requested_at + ttl.saturating_sub(self.config.lease_safety_margin)),
        }
    }

    fn reset(&self, record: &mut FileRecord, name: &str) {
        record.state = ConsistencyState::Invalid;
        record.lease = LeaseState::none(name, &self.proxy_id);
    }

    fn trusted(record: &FileRecord, now: Instant) -> bool {
        match record.state {
            ConsistencyState::WriteValid => true,
            ConsistencyState::ReadValid => record.lease.covers(LeaseMode::Read, now),
            ConsistencyState::Invalid => false,
        }
    }

    /// Bring `name` to at least `ReadValid` and pin the cached copy, fetching
    /// when it is missing or outdated. Runs with the file's record locked.
    ///
    /// Lookup and pin happen under one store lock, so a concurrent admission
    /// of another file cannot evict the copy in between.
    async fn pin_readable(
        self: &Arc<Self>,
        name: &str,
        slot: &FileSlot,
        record: &mut FileRecord,
        allow_stale: bool,
    ) -> Result<ReadBinding> {
        if record.state == ConsistencyState::WriteValid {
            // This proxy holds the write lease; version 0 is a file not committed yet
            return match self.store.get_pinned(name) {
                Some(entry) if entry.version != 0 => Ok(ReadBinding::of(entry, false)),
                Some(_) => {
                    self.store.unpin(name);
                    Err(ProxyError::NotFound(name.to_string()))
                }
                None => Err(ProxyError::NotFound(name.to_string())),
            };
        }
        if Self::trusted(record, Instant::now()) {
            if let Some(entry) = self.store.get_pinned(name) {
                return Ok(ReadBinding::of(entry, false));
            }
        }

        let allow_stale = allow_stale || self.config.allow_stale_reads;
        let epoch = slot.invalidations.load(Ordering::SeqCst);
        let requested_at = Instant::now();
        self.counters.lease_requests.fetch_add(1, Ordering::Relaxed);
        let grant = match self.remote.request_lease(name, LeaseMode::Read).await {
            Ok(grant) => grant,
            Err(e @ ProxyError::RemoteUnavailable(_)) => return self.serve_stale(name, allow_stale, e),
            Err(e) => return Err(e),
        };

        let Some(remote_version) = grant.version else {
            return Err(self.forget_missing(name, record).await);
        };

        let cached = match self.store.get_pinned(name) {
            Some(entry) if entry.version == remote_version => Some(entry),
            Some(entry) => {
                self.store.unpin(name);
                debug!("Cached {} is at version {}, server has {}", name, entry.version, remote_version);
                None
            }
            None => None,
        };
        let binding = match cached {
            Some(entry) => {
                self.counters.revalidations.fetch_add(1, Ordering::Relaxed);
                debug!("{} revalidated at version {} without fetch", name, remote_version);
                ReadBinding::of(entry, false)
            }
            None => {
                let file = match self.remote.fetch(name).await {
                    Ok(file) => file,
                    Err(ProxyError::NotFound(_)) => return Err(self.forget_missing(name, record).await),
                    Err(e @ ProxyError::RemoteUnavailable(_)) => return self.serve_stale(name, allow_stale, e),
                    Err(e) => return Err(e),
                };
                self.counters.fetches.fetch_add(1, Ordering::Relaxed);
                debug!("Fetched {} version {} ({} bytes)", name, file.version, file.content.len());
                match self.store.put_pinned(name, file.content.clone(), file.version) {
                    Ok(evicted) => self.release_evicted(evicted),
                    Err(e) => {
                        self.release_remote(name).await;
                        self.reset(record, name);
                        return Err(e);
                    }
                }
                ReadBinding {
                    version: file.version,
                    content: file.content,
                    stale: false,
                }
            }
        };

        record.lease = self.lease_until(name, LeaseMode::Read, requested_at, grant.ttl);
        record.state = ConsistencyState::ReadValid;
        if slot.invalidations.load(Ordering::SeqCst) != epoch {
            // Serve what was fetched, but revalidate on the next operation
            debug!("{} was invalidated while it was being fetched", name);
            record.state = ConsistencyState::Invalid;
        }
        Ok(binding)
    }

    fn serve_stale(&self, name: &str, allow_stale: bool, err: ProxyError) -> Result<ReadBinding> {
        if allow_stale {
            if let Some(entry) = self.store.get_pinned(name) {
                self.counters.stale_reads.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Serving cached {} version {} while the file server is unreachable: {}",
                    name, entry.version, err
                );
                return Ok(ReadBinding::of(entry, true));
            }
        }
        Err(err)
    }

    /// The file is gone remotely: drop the lease and whatever copy is unused
    async fn forget_missing(&self, name: &str, record: &mut FileRecord) -> ProxyError {
        if let Err(e) = self.remote.release_lease(name).await {
            debug!("Failed to release lease on missing {}: {}", name, e);
        }
        match self.store.remove(name) {
            Ok(_) | Err(ProxyError::CacheMiss(_)) => {}
            Err(e) => debug!("Keeping local copy of removed {}: {}", name, e),
        }
        self.reset(record, name);
        ProxyError::NotFound(name.to_string())
    }

    /// Open `name` for reading. The binding carries the content of the
    /// version current at open time, and the cached copy stays pinned until
    /// `close_read`; later commits are seen by the next open.
    pub async fn open_read(self: &Arc<Self>, name: &str, allow_stale: bool) -> Result<ReadBinding> {
        let slot = self.slot(name);
        let mut record = slot.record.lock().await;
        self.refresh(&slot, &mut record, name);
        self.pin_readable(name, &slot, &mut record, allow_stale).await
    }

    pub fn close_read(&self, name: &str) {
        self.store.unpin(name);
    }

    /// Drive `name` to `WriteValid` and check out a private buffer.
    ///
    /// Waits for any other local writer of the same file first, then for the
    /// server's write lease.
    pub async fn open_write(self: &Arc<Self>, name: &str, mode: OpenMode) -> Result<WriteSession> {
        let slot = self.slot(name);
        let permit = match tokio::time::timeout(
            self.config.write_gate_timeout,
            slot.write_gate.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(ProxyError::InternalError(format!(
                    "write gate for {} is closed",
                    name
                )))
            }
            Err(_) => {
                return Err(ProxyError::LeaseTimeout(format!(
                    "{} is still being written by another local client",
                    name
                )))
            }
        };

        let mut record = slot.record.lock().await;
        self.refresh(&slot, &mut record, name);

        let guard = WriteLeaseGuard {
            manager: self.clone(),
            name: name.to_string(),
            permit: Some(permit),
        };
        let requested_at = Instant::now();
        self.counters.lease_requests.fetch_add(1, Ordering::Relaxed);
        let grant = match self.remote.request_lease(name, LeaseMode::Write).await {
            Ok(grant) => grant,
            // The server may still grant after the transport gave up; the guard releases it
            Err(e) if is_transport_failure(&e) => return Err(e),
            Err(e) => {
                drop(guard.disarm());
                return Err(e);
            }
        };

        match self.prepare_write(name, mode, grant.version).await {
            Ok(base_version) => {
                record.state = ConsistencyState::WriteValid;
                record.lease = self.lease_until(name, LeaseMode::Write, requested_at, grant.ttl);
                let content = self.store.peek(name).map(|e| e.content).unwrap_or_default();
                debug!("Opened {} for writing at version {}", name, base_version);
                Ok(WriteSession {
                    name: name.to_string(),
                    base_version,
                    buffer: content.to_vec(),
                    dirty: false,
                    closed: false,
                    _permit: guard.disarm(),
                })
            }
            Err(e) => {
                self.release_remote(name).await;
                self.reset(&mut record, name);
                drop(guard.disarm());
                Err(e)
            }
        }
    }

    /// Make the cached copy current for writing and pin it; returns the base version
    async fn prepare_write(self: &Arc<Self>, name: &str, mode: OpenMode, remote: Option<Version>) -> Result<Version> {
        match remote {
            None => {
                if !mode.creates() {
                    return Err(ProxyError::NotFound(name.to_string()));
                }
                if self.store.peek(name).is_some_and(|e| e.version != 0) {
                    // Copy of a file that was removed remotely
                    self.store.remove(name)?;
                }
                if self.store.get_pinned(name).is_none() {
                    let evicted = self.store.put_pinned(name, Bytes::new(), 0)?;
                    self.release_evicted(evicted);
                }
                Ok(0)
            }
            Some(version) => {
                if mode.exclusive() {
                    return Err(ProxyError::AlreadyExists(name.to_string()));
                }
                match self.store.get_pinned(name) {
                    Some(entry) if entry.version == version => {}
                    cached => {
                        if cached.is_some() {
                            self.store.unpin(name);
                        }
                        let file = self.remote.fetch(name).await?;
                        self.counters.fetches.fetch_add(1, Ordering::Relaxed);
                        let evicted = self.store.put_pinned(name, file.content, file.version)?;
                        self.release_evicted(evicted);
                    }
                }
                Ok(version)
            }
        }
    }

    /// Write into the session buffer; no remote traffic
    pub async fn write(self: &Arc<Self>, session: &mut WriteSession, offset: u64, data: &[u8]) -> Result<usize> {
        if session.closed {
            return Err(ProxyError::InvalidRequest(format!("{} is already closed", session.name)));
        }
        let slot = self.slot(&session.name);
        let mut record = slot.record.lock().await;
        self.refresh(&slot, &mut record, &session.name);
        if record.state != ConsistencyState::WriteValid {
            return Err(ProxyError::LeaseTimeout(format!(
                "write lease on {} was revoked",
                session.name
            )));
        }

        let start = usize::try_from(offset)
            .map_err(|_| ProxyError::InvalidRequest(format!("offset {} out of range", offset)))?;
        let end = start
            .checked_add(data.len())
            .ok_or_else(|| ProxyError::InvalidRequest(format!("offset {} out of range", offset)))?;
        if end > session.buffer.len() {
            let evicted = self.store.reserve(&session.name, end as u64)?;
            self.release_evicted(evicted);
            session.buffer.resize(end, 0);
        }
        session.buffer[start..end].copy_from_slice(data);

        if !session.dirty {
            self.store.mark_dirty(&session.name)?;
            session.dirty = true;
        }
        Ok(data.len())
    }

    /// Commit a dirty session (or just let go of a clean one) and release the
    /// write lease. On failure the session stays open and dirty so the caller
    /// can retry or discard.
    pub async fn close_write(self: &Arc<Self>, session: &mut WriteSession) -> Result<Version> {
        if session.closed {
            return Ok(session.base_version);
        }
        let name = session.name.clone();
        let slot = self.slot(&name);
        let mut record = slot.record.lock().await;
        self.refresh(&slot, &mut record, &name);

        if !session.dirty {
            self.release_remote(&name).await;
            self.reset(&mut record, &name);
            self.store.unpin(&name);
            session.closed = true;
            debug!("Closed {} without modifications", name);
            return Ok(session.base_version);
        }

        let now = Instant::now();
        if record.state != ConsistencyState::WriteValid || !record.lease.covers(LeaseMode::Write, now) {
            info!("Re-acquiring write lease on {} before commit", name);
            self.counters.lease_requests.fetch_add(1, Ordering::Relaxed);
            let grant = self.remote.request_lease(&name, LeaseMode::Write).await?;
            record.state = ConsistencyState::WriteValid;
            record.lease = self.lease_until(&name, LeaseMode::Write, now, grant.ttl);
        }

        let content = Bytes::from(session.buffer.clone());
        let version = match self.remote.commit(&name, content.clone(), session.base_version).await {
            Ok(version) => version,
            Err(e) => {
                if matches!(e, ProxyError::Conflict { .. }) {
                    self.counters.conflicts.fetch_add(1, Ordering::Relaxed);
                }
                warn!("Commit of {} failed: {}", name, e);
                return Err(e);
            }
        };
        self.counters.commits.fetch_add(1, Ordering::Relaxed);

        match self.store.commit_local(&name, content, version) {
            Ok(evicted) => self.release_evicted(evicted),
            Err(e) => {
                warn!("Dropping local copy of {} after commit: {}", name, e);
                if let Err(e) = self.store.discard(&name) {
                    debug!("Nothing to discard for {}: {}", name, e);
                }
            }
        }
        self.release_remote(&name).await;
        self.reset(&mut record, &name);
        self.store.unpin(&name);

        session.closed = true;
        session.dirty = false;
        session.base_version = version;
        info!("Committed {} at version {}", name, version);
        Ok(version)
    }

    /// Drop the session's modifications and release the write lease
    pub async fn discard_write(&self, session: &mut WriteSession) {
        if session.closed {
            return;
        }
        let name = session.name.clone();
        let slot = self.slot(&name);
        let mut record = slot.record.lock().await;

        self.store.unpin(&name);
        if let Err(e) = self.store.discard(&name) {
            debug!("Nothing to discard for {}: {}", name, e);
        }
        self.release_remote(&name).await;
        self.reset(&mut record, &name);
        session.closed = true;
        session.dirty = false;
    }

    /// Remove `name` remotely and drop the local copy if nobody uses it
    pub async fn unlink(&self, name: &str) -> Result<()> {
        let slot = self.slot(name);
        let mut record = slot.record.lock().await;
        self.refresh(&slot, &mut record, name);

        self.remote.remove(name).await?;
        match self.store.remove(name) {
            Ok(_) | Err(ProxyError::CacheMiss(_)) => {}
            Err(e) => debug!("Local copy of unlinked {} kept: {}", name, e),
        }
        self.reset(&mut record, name);
        info!("Unlinked {}", name);
        Ok(())
    }

    async fn release_remote(&self, name: &str) {
        if let Err(e) = self.remote.release_lease(name).await {
            warn!("Failed to release lease on {}: {}", name, e);
        }
    }

    fn release_evicted(self: &Arc<Self>, names: Vec<String>) {
        if names.is_empty() {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            for name in names {
                this.release_if_uncached(&name).await;
            }
        });
    }

    /// Release the read lease on an evicted file, unless it came back meanwhile
    async fn release_if_uncached(&self, name: &str) {
        let Some(slot) = self.slots.get(name).map(|s| s.clone()) else {
            return;
        };
        {
            let mut record = slot.record.lock().await;
            if self.store.contains(name)
                || record.state == ConsistencyState::WriteValid
                || record.lease.mode != LeaseMode::Read
            {
                return;
            }
            self.release_remote(name).await;
            self.reset(&mut record, name);
            debug!("Released read lease on evicted {}", name);
        }
        drop(slot);
        self.slots
            .remove_if(name, |_, slot| Arc::strong_count(slot) == 1 && !self.store.contains(name));
    }

    /// Release every lease still held; used at shutdown after sessions closed
    pub async fn release_all(&self) {
        let slots: Vec<(String, Arc<FileSlot>)> = self
            .slots
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let mut released = 0;
        for (name, slot) in slots {
            let mut record = slot.record.lock().await;
            if record.lease.mode != LeaseMode::None {
                self.release_remote(&name).await;
                self.reset(&mut record, &name);
                released += 1;
            }
        }
        info!("Released {} leases", released);
    }

    /// Current state of `name`, taking pending invalidations into account
    pub async fn state_of(&self, name: &str) -> ConsistencyState {
        let Some(slot) = self.slots.get(name).map(|s| s.clone()) else {
            return ConsistencyState::Invalid;
        };
        let mut record = slot.record.lock().await;
        self.refresh(&slot, &mut record, name);
        if record.state == ConsistencyState::ReadValid && !record.lease.covers(LeaseMode::Read, Instant::now()) {
            return ConsistencyState::Invalid;
        }
        record.state
    }

    pub fn stats(&self) -> ConsistencyStats {
        ConsistencyStats {
            lease_requests: self.counters.lease_requests.load(Ordering::Relaxed),
            fetches: self.counters.fetches.load(Ordering::Relaxed),
            revalidations: self.counters.revalidations.load(Ordering::Relaxed),
            invalidations_received: self.counters.invalidations.load(Ordering::Relaxed),
            commits: self.counters.commits.load(Ordering::Relaxed),
            conflicts: self.counters.conflicts.load(Ordering::Relaxed),
            stale_reads: self.counters.stale_reads.load(Ordering::Relaxed),
            tracked_files: self.slots.len() as u64,
        }
    }
}

impl InvalidationListener for ConsistencyManager {
    fn invalidate(&self, name: &str) {
        self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
        match self.slots.get(name) {
            Some(slot) => {
                slot.invalidations.fetch_add(1, Ordering::SeqCst);
                debug!("Invalidation received for {}", name);
            }
            None => debug!("Invalidation received for untracked {}", name),
        }
    }
}
