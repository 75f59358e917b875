//! File Server Module
//!
//! The authoritative store every proxy talks to. It owns the committed
//! content, hands out versions from one global counter, and tracks per-file
//! leases per proxy:
//!
//! - any number of proxies may hold a Read lease while nobody holds Write
//! - a Write lease is granted only after every other holder was sent an
//!   invalidation and either acknowledged it or saw its lease expire
//! - requests that conflict with a live lease wait up to
//!   `lease_wait_timeout`, then fail with `LeaseTimeout`
//!
//! Invalidations reach proxies through a per-proxy mailbox: a direct
//! callback for in-process proxies, or a queue drained by HTTP long-polls.

use crate::cache_types::{LeaseGrant, LeaseMode, ProxyId, RemoteFile, Version};
use crate::config::{LeaseConfig, ServerConfig};
use crate::remote_store::{normalize_name, InvalidationListener, RemoteStore};
use crate::{ProxyError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// One invalidation queued for a polling proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invalidation {
    pub seq: u64,
    pub name: String,
}

#[derive(Default)]
struct QueuedMailbox {
    pending: Mutex<VecDeque<Invalidation>>,
    acks: Mutex<HashMap<u64, oneshot::Sender<()>>>,
    notify: Notify,
}

#[derive(Clone)]
enum Mailbox {
    Direct(Weak<dyn InvalidationListener>),
    Queued(Arc<QueuedMailbox>),
}

struct StoredFile {
    content: Bytes,
    version: Version,
}

#[derive(Default)]
struct LeaseTable {
    readers: HashMap<ProxyId, Instant>,
    writer: Option<(ProxyId, Instant)>,
}

impl LeaseTable {
    fn is_empty(&self) -> bool {
        self.readers.is_empty() && self.writer.is_none()
    }
}

#[derive(Default)]
struct ServerState {
    files: HashMap<String, StoredFile>,
    leases: HashMap<String, LeaseTable>,
}

enum Attempt {
    Granted(LeaseGrant),
    /// Writer installed; these holders must be invalidated before the grant
    Revoke {
        grant: LeaseGrant,
        readers: Vec<(ProxyId, Instant)>,
    },
    Blocked {
        until: Instant,
    },
}

#[derive(Default)]
struct ServerCounters {
    commits: AtomicU64,
    conflicts: AtomicU64,
    invalidations_sent: AtomicU64,
    lease_timeouts: AtomicU64,
    broken_leases: AtomicU64,
}

/// Snapshot of server state for `/stats` and tests
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerStats {
    pub files: u64,
    pub total_bytes: u64,
    pub read_leases: u64,
    pub write_leases: u64,
    pub registered_proxies: u64,
    pub latest_version: Version,
    pub commits: u64,
    pub conflicts: u64,
    pub invalidations_sent: u64,
    pub lease_timeouts: u64,
    pub broken_leases: u64,
}

pub struct FileServer {
    leases: LeaseConfig,
    root_dir: Option<PathBuf>,
    state: Mutex<ServerState>,
    /// Next version to hand out; starts at 1
    next_version: AtomicU64,
    next_seq: AtomicU64,
    mailboxes: DashMap<ProxyId, Mailbox>,
    lease_changes: DashMap<String, Arc<Notify>>,
    counters: ServerCounters,
}

/// Clears a half-installed write lease if the requesting future is dropped
/// while invalidations are still outstanding.
struct PendingWrite<'a> {
    server: &'a FileServer,
    proxy: &'a str,
    name: &'a str,
    armed: bool,
}

impl PendingWrite<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingWrite<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!("Write lease request for {} by {} abandoned", self.name, self.proxy);
            self.server.release_lease(self.proxy, self.name);
        }
    }
}

impl FileServer {
    /// Empty in-memory server
    pub fn new(leases: LeaseConfig) -> Self {
        Self {
            leases,
            root_dir: None,
            state: Mutex::new(ServerState::default()),
            next_version: AtomicU64::new(1),
            next_seq: AtomicU64::new(1),
            mailboxes: DashMap::new(),
            lease_changes: DashMap::new(),
            counters: ServerCounters::default(),
        }
    }

    /// Server seeded from `root_dir` (if configured) that writes commits through to it
    pub fn open(config: &ServerConfig) -> Result<Self> {
        let mut server = Self::new(config.leases.clone());
        if let Some(root) = &config.root_dir {
            std::fs::create_dir_all(root).map_err(|e| {
                ProxyError::IoError(format!("Failed to create root directory {:?}: {}", root, e))
            })?;
            let files = load_root(root, &server.next_version)?;
            info!("Loaded {} files from {:?}", files.len(), root);
            server.lock_state().files = files;
            server.root_dir = Some(root.clone());
        }
        Ok(server)
    }

    fn lock_state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lease_notify(&self, name: &str) -> Arc<Notify> {
        self.lease_changes
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn lease_changed(&self, name: &str) {
        if let Some(notify) = self.lease_changes.get(name) {
            notify.notify_waiters();
        }
    }

    /// Deliver invalidations for `proxy` by calling `listener` directly
    pub fn register_direct(&self, proxy: &str, listener: Arc<dyn InvalidationListener>) {
        info!("Proxy {} registered for direct invalidations", proxy);
        self.mailboxes
            .insert(proxy.to_string(), Mailbox::Direct(Arc::downgrade(&listener)));
    }

    /// Queue invalidations for `proxy` until it polls; keeps an existing queue
    pub fn register_queued(&self, proxy: &str) {
        let mut created = false;
        self.mailboxes.entry(proxy.to_string()).or_insert_with(|| {
            created = true;
            Mailbox::Queued(Arc::new(QueuedMailbox::default()))
        });
        if created {
            info!("Proxy {} registered for polled invalidations", proxy);
        }
    }

    /// Forget a proxy: drop its mailbox and every lease it holds
    pub fn disconnect(&self, proxy: &str) {
        self.mailboxes.remove(proxy);
        let touched: Vec<String> = {
            let mut state = self.lock_state();
            let mut touched = Vec::new();
            for (name, table) in state.leases.iter_mut() {
                let had_reader = table.readers.remove(proxy).is_some();
                let had_writer = table.writer.as_ref().is_some_and(|(p, _)| p == proxy);
                if had_writer {
                    table.writer = None;
                }
                if had_reader || had_writer {
                    touched.push(name.clone());
                }
            }
            state.leases.retain(|_, table| !table.is_empty());
            touched
        };
        for name in &touched {
            self.lease_changed(name);
        }
        info!("Proxy {} disconnected, released {} leases", proxy, touched.len());
    }

    /// Acknowledge earlier invalidations, then wait up to `wait` for new ones
    pub async fn poll_invalidations(
        &self,
        proxy: &str,
        acks: &[u64],
        wait: Duration,
    ) -> Result<Vec<Invalidation>> {
        let mailbox = match self.mailboxes.get(proxy).map(|m| m.clone()) {
            Some(Mailbox::Queued(mailbox)) => mailbox,
            _ => {
                return Err(ProxyError::InvalidRequest(format!(
                    "proxy {} is not registered for polling",
                    proxy
                )))
            }
        };

        {
            let mut pending_acks = mailbox.acks.lock().unwrap_or_else(|p| p.into_inner());
            for seq in acks {
                if let Some(tx) = pending_acks.remove(seq) {
                    let _ = tx.send(());
                }
            }
        }

        let empty = mailbox
            .pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_empty();
        if empty {
            let _ = tokio::time::timeout(wait, mailbox.notify.notified()).await;
        }

        let drained: Vec<Invalidation> = mailbox
            .pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();
        Ok(drained)
    }

    /// Send one invalidation; the receiver fires once the proxy acknowledged it
    fn deliver(&self, proxy: &str, name: &str) -> Option<oneshot::Receiver<()>> {
        let mailbox = self.mailboxes.get(proxy).map(|m| m.clone())?;
        self.counters.invalidations_sent.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        match mailbox {
            Mailbox::Direct(listener) => {
                let listener = listener.upgrade()?;
                listener.invalidate(name);
                let _ = tx.send(());
            }
            Mailbox::Queued(queue) => {
                let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
                queue
                    .acks
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .insert(seq, tx);
                queue
                    .pending
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .push_back(Invalidation {
                        seq,
                        name: name.to_string(),
                    });
                queue.notify.notify_one();
            }
        }
        debug!("Invalidation for {} sent to {}", name, proxy);
        Some(rx)
    }

    /// Invalidate every revoked reader and wait for its ack or its lease expiry
    async fn await_revocations(&self, name: &str, readers: Vec<(ProxyId, Instant)>) {
        let waits = readers.into_iter().map(|(proxy, expires)| {
            let ack = self.deliver(&proxy, name);
            let deadline = tokio::time::Instant::from_std(expires);
            async move {
                match ack {
                    Some(rx) => match tokio::time::timeout_at(deadline, rx).await {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) => tokio::time::sleep_until(deadline).await,
                        Err(_) => warn!(
                            "Proxy {} did not acknowledge invalidation of {} before its lease expired",
                            proxy, name
                        ),
                    },
                    None => tokio::time::sleep_until(deadline).await,
                }
            }
        });
        futures::future::join_all(waits).await;
    }

    fn try_grant(&self, proxy: &str, name: &str, mode: LeaseMode) -> Attempt {
        let now = Instant::now();
        let mut state = self.lock_state();
        let version = state.files.get(name).map(|f| f.version);
        let table = state.leases.entry(name.to_string()).or_default();

        if let Some((holder, expires)) = table.writer.clone() {
            if holder != proxy {
                if expires > now {
                    return Attempt::Blocked { until: expires };
                }
                warn!("Breaking expired write lease on {} held by {}", name, holder);
                self.counters.broken_leases.fetch_add(1, Ordering::Relaxed);
                table.writer = None;
                // Its content is no longer protected; the ack is not awaited
                let _ = self.deliver(&holder, name);
            }
        }
        table.readers.retain(|_, expires| *expires > now);

        match mode {
            LeaseMode::Write => {
                let ttl = self.leases.write_lease_ttl;
                let readers: Vec<(ProxyId, Instant)> = table
                    .readers
                    .iter()
                    .filter(|(p, _)| p.as_str() != proxy)
                    .map(|(p, e)| (p.clone(), *e))
                    .collect();
                table.readers.clear();
                table.writer = Some((proxy.to_string(), now + ttl));
                let grant = LeaseGrant {
                    mode: LeaseMode::Write,
                    version,
                    ttl,
                };
                if readers.is_empty() {
                    Attempt::Granted(grant)
                } else {
                    Attempt::Revoke { grant, readers }
                }
            }
            _ => {
                let ttl = self.leases.read_lease_ttl;
                table.readers.insert(proxy.to_string(), now + ttl);
                Attempt::Granted(LeaseGrant {
                    mode: LeaseMode::Read,
                    version,
                    ttl,
                })
            }
        }
    }

    pub async fn request_lease(&self, proxy: &str, name: &str, mode: LeaseMode) -> Result<LeaseGrant> {
        let name = normalize_name(name)?;
        if mode == LeaseMode::None {
            self.release_lease(proxy, &name);
            return Ok(LeaseGrant {
                mode,
                version: self.stat(&name),
                ttl: Duration::ZERO,
            });
        }

        let deadline = Instant::now() + self.leases.lease_wait_timeout;
        loop {
            let notify = self.lease_notify(&name);
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_grant(proxy, &name, mode) {
                Attempt::Granted(grant) => {
                    debug!("Granted {:?} lease on {} to {}", grant.mode, name, proxy);
                    return Ok(grant);
                }
                Attempt::Revoke { grant, readers } => {
                    debug!(
                        "Write lease on {} for {} waits for {} readers",
                        name,
                        proxy,
                        readers.len()
                    );
                    let pending = PendingWrite {
                        server: self,
                        proxy,
                        name: &name,
                        armed: true,
                    };
                    self.await_revocations(&name, readers).await;
                    pending.disarm();
                    debug!("Granted Write lease on {} to {}", name, proxy);
                    return Ok(grant);
                }
                Attempt::Blocked { until } => {
                    let now = Instant::now();
                    if now >= deadline {
                        self.counters.lease_timeouts.fetch_add(1, Ordering::Relaxed);
                        return Err(ProxyError::LeaseTimeout(format!(
                            "{:?} lease on {} for {} not granted within {:?}",
                            mode, name, proxy, self.leases.lease_wait_timeout
                        )));
                    }
                    let wake = tokio::time::Instant::from_std(until.min(deadline));
                    let _ = tokio::time::timeout_at(wake, notified).await;
                }
            }
        }
    }

    pub fn release_lease(&self, proxy: &str, name: &str) {
        let Ok(name) = normalize_name(name) else {
            return;
        };
        let name = name.as_str();
        let released = {
            let mut state = self.lock_state();
            match state.leases.get_mut(name) {
                Some(table) => {
                    let had_reader = table.readers.remove(proxy).is_some();
                    let had_writer = table.writer.as_ref().is_some_and(|(p, _)| p == proxy);
                    if had_writer {
                        table.writer = None;
                    }
                    if table.is_empty() {
                        state.leases.remove(name);
                    }
                    had_reader || had_writer
                }
                None => false,
            }
        };
        if released {
            debug!("Lease on {} released by {}", name, proxy);
            self.lease_changed(name);
        }
    }

    fn holds_write(&self, proxy: &str, name: &str) -> bool {
        self.lock_state()
            .leases
            .get(name)
            .and_then(|t| t.writer.as_ref())
            .is_some_and(|(p, _)| p == proxy)
    }

    pub fn fetch(&self, name: &str) -> Result<RemoteFile> {
        let name = normalize_name(name)?;
        let state = self.lock_state();
        state
            .files
            .get(&name)
            .map(|f| RemoteFile {
                content: f.content.clone(),
                version: f.version,
            })
            .ok_or(ProxyError::NotFound(name))
    }

    pub fn stat(&self, name: &str) -> Option<Version> {
        let name = normalize_name(name).ok()?;
        self.lock_state().files.get(&name).map(|f| f.version)
    }

    /// Install new content; `proxy` must hold the write lease
    pub async fn commit(&self, proxy: &str, name: &str, content: Bytes, expected: Version) -> Result<Version> {
        let name = normalize_name(name)?;
        let version = {
            let mut state = self.lock_state();
            let current = state.files.get(&name).map(|f| f.version).unwrap_or(0);
            let writer = state
                .leases
                .get(&name)
                .and_then(|t| t.writer.as_ref())
                .map(|(p, _)| p.clone());
            match writer {
                Some(ref holder) if holder == proxy => {}
                Some(_) => {
                    self.counters.conflicts.fetch_add(1, Ordering::Relaxed);
                    return Err(ProxyError::Conflict {
                        name,
                        expected,
                        current,
                    });
                }
                None => {
                    return Err(ProxyError::LeaseTimeout(format!(
                        "{} holds no write lease on {}",
                        proxy, name
                    )))
                }
            }
            if current != expected {
                self.counters.conflicts.fetch_add(1, Ordering::Relaxed);
                return Err(ProxyError::Conflict {
                    name,
                    expected,
                    current,
                });
            }
            let version = self.next_version.fetch_add(1, Ordering::SeqCst);
            state.files.insert(
                name.clone(),
                StoredFile {
                    content: content.clone(),
                    version,
                },
            );
            version
        };
        self.counters.commits.fetch_add(1, Ordering::Relaxed);
        info!(
            "Committed {} version {} ({} bytes) from {}",
            name,
            version,
            content.len(),
            proxy
        );
        self.persist(&name, Some(&content)).await;
        Ok(version)
    }

    /// Delete a file; other proxies are invalidated through a write lease
    pub async fn remove(&self, proxy: &str, name: &str) -> Result<()> {
        let name = normalize_name(name)?;
        let held = self.holds_write(proxy, &name);
        if !held {
            self.request_lease(proxy, &name, LeaseMode::Write).await?;
        }
        let existed = self.lock_state().files.remove(&name).is_some();
        if !held {
            self.release_lease(proxy, &name);
        }
        if !existed {
            return Err(ProxyError::NotFound(name));
        }
        info!("Removed {} on behalf of {}", name, proxy);
        self.persist(&name, None).await;
        Ok(())
    }

    async fn persist(&self, name: &str, content: Option<&Bytes>) {
        let Some(root) = &self.root_dir else {
            return;
        };
        let path = root.join(name);
        let result = match content {
            Some(content) => {
                if let Some(parent) = path.parent() {
                    if let Err(e) = tokio::fs::create_dir_all(parent).await {
                        error!("Failed to create {:?}: {}", parent, e);
                        return;
                    }
                }
                tokio::fs::write(&path, content).await
            }
            None => match tokio::fs::remove_file(&path).await {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                other => other,
            },
        };
        if let Err(e) = result {
            error!("Failed to write through {:?}: {}", path, e);
        }
    }

    pub fn stats(&self) -> ServerStats {
        let state = self.lock_state();
        let now = Instant::now();
        let mut stats = ServerStats {
            files: state.files.len() as u64,
            total_bytes: state.files.values().map(|f| f.content.len() as u64).sum(),
            registered_proxies: self.mailboxes.len() as u64,
            latest_version: self.next_version.load(Ordering::SeqCst) - 1,
            commits: self.counters.commits.load(Ordering::Relaxed),
            conflicts: self.counters.conflicts.load(Ordering::Relaxed),
            invalidations_sent: self.counters.invalidations_sent.load(Ordering::Relaxed),
            lease_timeouts: self.counters.lease_timeouts.load(Ordering::Relaxed),
            broken_leases: self.counters.broken_leases.load(Ordering::Relaxed),
            ..Default::default()
        };
        for table in state.leases.values() {
            stats.read_leases += table.readers.values().filter(|e| **e > now).count() as u64;
            stats.write_leases += u64::from(table.writer.is_some());
        }
        stats
    }
}

fn load_root(root: &Path, next_version: &AtomicU64) -> Result<HashMap<String, StoredFile>> {
    let mut files = HashMap::new();
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| ProxyError::IoError(format!("Failed to scan {:?}: {}", root, e)))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let name = match normalize_name(&relative.to_string_lossy()) {
            Ok(name) => name,
            Err(e) => {
                warn!("Skipping {:?}: {}", entry.path(), e);
                continue;
            }
        };
        let content = std::fs::read(entry.path())?;
        let version = next_version.fetch_add(1, Ordering::SeqCst);
        debug!("Seeded {} version {} ({} bytes)", name, version, content.len());
        files.insert(
            name,
            StoredFile {
                content: Bytes::from(content),
                version,
            },
        );
    }
    Ok(files)
}

/// In-process transport: a proxy talking to a `FileServer` in the same process
pub struct LocalRemoteStore {
    server: Arc<FileServer>,
    proxy_id: ProxyId,
    /// Artificial delay before every call
    latency: Duration,
}

impl LocalRemoteStore {
    pub fn new(server: Arc<FileServer>, proxy_id: impl Into<ProxyId>) -> Self {
        Self {
            server,
            proxy_id: proxy_id.into(),
            latency: Duration::ZERO,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn server(&self) -> &Arc<FileServer> {
        &self.server
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[async_trait]
impl RemoteStore for LocalRemoteStore {
    fn proxy_id(&self) -> &str {
        &self.proxy_id
    }

    async fn fetch(&self, name: &str) -> Result<RemoteFile> {
        self.delay().await;
        self.server.fetch(name)
    }

    async fn stat(&self, name: &str) -> Result<Option<Version>> {
        self.delay().await;
        Ok(self.server.stat(name))
    }

    async fn commit(&self, name: &str, content: Bytes, expected: Version) -> Result<Version> {
        self.delay().await;
        self.server.commit(&self.proxy_id, name, content, expected).await
    }

    async fn request_lease(&self, name: &str, mode: LeaseMode) -> Result<LeaseGrant> {
        self.delay().await;
        self.server.request_lease(&self.proxy_id, name, mode).await
    }

    async fn release_lease(&self, name: &str) -> Result<()> {
        self.delay().await;
        self.server.release_lease(&self.proxy_id, name);
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.delay().await;
        self.server.remove(&self.proxy_id, name).await
    }

    async fn subscribe(&self, listener: Arc<dyn InvalidationListener>) -> Result<()> {
        self.server.register_direct(&self.proxy_id, listener);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingListener {
        names: Mutex<Vec<String>>,
    }

    impl InvalidationListener for RecordingListener {
        fn invalidate(&self, name: &str) {
            self.names.lock().unwrap().push(name.to_string());
        }
    }

    fn lease_config(wait_ms: u64) -> LeaseConfig {
        LeaseConfig {
            read_lease_ttl: Duration::from_secs(5),
            write_lease_ttl: Duration::from_secs(5),
            lease_wait_timeout: Duration::from_millis(wait_ms),
        }
    }

    async fn write_file(server: &FileServer, proxy: &str, name: &str, content: &str) -> Result<Version> {
        let grant = server.request_lease(proxy, name, LeaseMode::Write).await?;
        let version = server
            .commit(proxy, name, Bytes::from(content.to_string()), grant.version.unwrap_or(0))
            .await?;
        server.release_lease(proxy, name);
        Ok(version)
    }

    #[tokio::test]
    async fn test_versions_are_global_and_never_reused() -> Result<()> {
        let server = FileServer::new(lease_config(100));
        let a1 = write_file(&server, "p1", "A", "a").await?;
        let b1 = write_file(&server, "p1", "B", "b").await?;
        let a2 = write_file(&server, "p1", "A", "aa").await?;
        assert!(a1 < b1 && b1 < a2);

        server.remove("p1", "A").await?;
        assert_eq!(server.stat("A"), None);
        let a3 = write_file(&server, "p1", "A", "again").await?;
        assert!(a3 > a2);
        Ok(())
    }

    #[tokio::test]
    async fn test_commit_checks_expected_version_and_lease() -> Result<()> {
        let server = FileServer::new(lease_config(100));
        let v1 = write_file(&server, "p1", "A", "one").await?;

        // No lease held
        let err = server.commit("p1", "A", Bytes::from("x"), v1).await.unwrap_err();
        assert!(matches!(err, ProxyError::LeaseTimeout(_)));

        server.request_lease("p1", "A", LeaseMode::Write).await?;
        let err = server.commit("p1", "A", Bytes::from("x"), v1 - 1).await.unwrap_err();
        assert_eq!(
            err,
            ProxyError::Conflict {
                name: "A".to_string(),
                expected: v1 - 1,
                current: v1
            }
        );

        // Another proxy cannot commit while p1 holds the write lease
        let err = server.commit("p2", "A", Bytes::from("y"), v1).await.unwrap_err();
        assert!(matches!(err, ProxyError::Conflict { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn test_write_lease_invalidates_direct_readers() -> Result<()> {
        let server = FileServer::new(lease_config(100));
        write_file(&server, "p1", "F", "v1").await?;

        let listener = Arc::new(RecordingListener::default());
        server.register_direct("p1", listener.clone());
        server.request_lease("p1", "F", LeaseMode::Read).await?;

        server.request_lease("p2", "F", LeaseMode::Write).await?;
        assert_eq!(*listener.names.lock().unwrap(), vec!["F".to_string()]);

        // p1 can no longer read until p2 lets go
        let err = server.request_lease("p1", "F", LeaseMode::Read).await.unwrap_err();
        assert!(matches!(err, ProxyError::LeaseTimeout(_)));
        server.release_lease("p2", "F");
        server.request_lease("p1", "F", LeaseMode::Read).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_write_grant_waits_for_polled_ack() -> Result<()> {
        let server = Arc::new(FileServer::new(lease_config(1_000)));
        write_file(&server, "p1", "F", "v1").await?;
        server.register_queued("p1");
        server.request_lease("p1", "F", LeaseMode::Read).await?;

        let writer = {
            let server = server.clone();
            tokio::spawn(async move { server.request_lease("p2", "F", LeaseMode::Write).await })
        };

        let batch = server.poll_invalidations("p1", &[], Duration::from_secs(1)).await?;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].name, "F");

        // Not granted before the ack
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!writer.is_finished());

        let seqs: Vec<u64> = batch.iter().map(|i| i.seq).collect();
        let next = server.poll_invalidations("p1", &seqs, Duration::from_millis(10)).await?;
        assert!(next.is_empty());

        let grant = writer.await.unwrap()?;
        assert_eq!(grant.mode, LeaseMode::Write);
        Ok(())
    }

    #[tokio::test]
    async fn test_competing_writer_times_out() -> Result<()> {
        let server = FileServer::new(lease_config(50));
        server.request_lease("p1", "F", LeaseMode::Write).await?;
        let err = server.request_lease("p2", "F", LeaseMode::Write).await.unwrap_err();
        assert!(matches!(err, ProxyError::LeaseTimeout(_)));
        assert_eq!(server.stats().lease_timeouts, 1);

        // Same proxy may re-request its own lease
        server.request_lease("p1", "F", LeaseMode::Write).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_expired_write_lease_is_broken() -> Result<()> {
        let server = FileServer::new(LeaseConfig {
            read_lease_ttl: Duration::from_secs(5),
            write_lease_ttl: Duration::from_millis(30),
            lease_wait_timeout: Duration::from_secs(1),
        });
        let listener = Arc::new(RecordingListener::default());
        server.register_direct("p1", listener.clone());
        server.request_lease("p1", "F", LeaseMode::Write).await?;

        let grant = server.request_lease("p2", "F", LeaseMode::Write).await?;
        assert_eq!(grant.mode, LeaseMode::Write);
        assert_eq!(server.stats().broken_leases, 1);
        assert_eq!(*listener.names.lock().unwrap(), vec!["F".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_abandoned_write_request_clears_writer() -> Result<()> {
        let server = FileServer::new(lease_config(1_000));
        // p1 has no mailbox, so a writer would wait for its lease to expire
        server.request_lease("p1", "F", LeaseMode::Read).await?;

        let attempt = tokio::time::timeout(
            Duration::from_millis(30),
            server.request_lease("p2", "F", LeaseMode::Write),
        )
        .await;
        assert!(attempt.is_err());

        let grant = tokio::time::timeout(
            Duration::from_millis(200),
            server.request_lease("p3", "F", LeaseMode::Read),
        )
        .await
        .expect("reader blocked by abandoned writer")?;
        assert_eq!(grant.mode, LeaseMode::Read);
        Ok(())
    }

    #[tokio::test]
    async fn test_root_dir_seed_and_write_through() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("A"), b"alpha").unwrap();
        std::fs::write(dir.path().join("sub/B"), b"beta").unwrap();

        let config = ServerConfig {
            root_dir: Some(dir.path().to_path_buf()),
            leases: lease_config(100),
            ..Default::default()
        };
        let server = FileServer::open(&config)?;
        assert_eq!(server.fetch("A")?.content, Bytes::from("alpha"));
        assert_eq!(server.fetch("/sub//B")?.content, Bytes::from("beta"));
        assert!(matches!(server.fetch("missing"), Err(ProxyError::NotFound(_))));

        write_file(&server, "p1", "new/C", "gamma").await?;
        assert_eq!(std::fs::read(dir.path().join("new/C")).unwrap(), b"gamma");

        server.remove("p1", "A").await?;
        assert!(!dir.path().join("A").exists());
        assert!(matches!(server.remove("p1", "A").await, Err(ProxyError::NotFound(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_disconnect_releases_leases() -> Result<()> {
        let server = FileServer::new(lease_config(50));
        server.register_queued("p1");
        server.request_lease("p1", "F", LeaseMode::Write).await?;
        server.disconnect("p1");
        assert_eq!(server.stats().write_leases, 0);
        server.request_lease("p2", "F", LeaseMode::Write).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_local_store_latency() -> Result<()> {
        let server = Arc::new(FileServer::new(lease_config(100)));
        let store = LocalRemoteStore::new(server, "p1").with_latency(Duration::from_millis(20));
        let start = Instant::now();
        assert_eq!(store.stat("A").await?, None);
        assert!(start.elapsed() >= Duration::from_millis(20));
        Ok(())
    }
}
