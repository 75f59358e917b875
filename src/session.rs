//! Proxy Session Module
//!
//! Entry point for client file operations. Each client (identified by an
//! opaque id) owns a handle table; handles are numbered from 0 and the lowest
//! free number is reused first. A read handle keeps the content of the
//! version it opened, so every read through it sees one version even while
//! other proxies commit; write handles own a checked-out `WriteSession` that
//! is committed on close.

use crate::cache_store::SharedCacheStore;
use crate::cache_types::{CacheStats, FileHandle, OpenOptions, SeekOrigin};
use crate::config::Config;
use crate::consistency::{ConsistencyManager, ConsistencyStats, WriteSession};
use crate::remote_store::{normalize_name, RemoteStore};
use crate::{ProxyError, Result};
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

enum OpenFile {
    Reader {
        name: String,
        content: Bytes,
        cursor: u64,
        closed: bool,
    },
    Writer {
        session: WriteSession,
        cursor: u64,
    },
}

impl OpenFile {
    fn name(&self) -> &str {
        match self {
            OpenFile::Reader { name, .. } => name,
            OpenFile::Writer { session, .. } => session.name(),
        }
    }

    /// Closed by a concurrent caller that reached the handle first
    fn is_closed(&self) -> bool {
        match self {
            OpenFile::Reader { closed, .. } => *closed,
            OpenFile::Writer { session, .. } => session.is_closed(),
        }
    }

    fn read_at(&self, offset: u64, len: usize) -> Bytes {
        match self {
            OpenFile::Reader { content, .. } => {
                let start = usize::try_from(offset).unwrap_or(usize::MAX).min(content.len());
                let end = start.saturating_add(len).min(content.len());
                content.slice(start..end)
            }
            OpenFile::Writer { session, .. } => session.read_at(offset, len),
        }
    }
}

type SharedHandle = Arc<tokio::sync::Mutex<OpenFile>>;

/// Per-client open file table
struct HandleTable {
    slots: Vec<Option<SharedHandle>>,
    limit: usize,
}

impl HandleTable {
    fn new(limit: usize) -> Self {
        Self {
            slots: Vec::new(),
            limit,
        }
    }

    fn open_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    fn has_capacity(&self) -> bool {
        self.open_count() < self.limit
    }

    fn allocate(&mut self, file: SharedHandle) -> Result<FileHandle> {
        if let Some(free) = self.slots.iter().position(|s| s.is_none()) {
            self.slots[free] = Some(file);
            return Ok(free as FileHandle);
        }
        if self.slots.len() >= self.limit {
            return Err(ProxyError::TooManyOpenFiles(format!(
                "limit of {} open files reached",
                self.limit
            )));
        }
        self.slots.push(Some(file));
        Ok((self.slots.len() - 1) as FileHandle)
    }

    fn get(&self, handle: FileHandle) -> Result<SharedHandle> {
        self.slots
            .get(handle as usize)
            .and_then(|s| s.clone())
            .ok_or(ProxyError::BadHandle(handle))
    }

    /// Free `handle` if it still refers to `file`
    fn release(&mut self, handle: FileHandle, file: &SharedHandle) {
        if let Some(slot) = self.slots.get_mut(handle as usize) {
            if slot.as_ref().is_some_and(|f| Arc::ptr_eq(f, file)) {
                *slot = None;
            }
        }
        while matches!(self.slots.last(), Some(None)) {
            self.slots.pop();
        }
    }

    fn drain(&mut self) -> Vec<(FileHandle, SharedHandle)> {
        self.slots
            .drain(..)
            .enumerate()
            .filter_map(|(i, s)| s.map(|f| (i as FileHandle, f)))
            .collect()
    }
}

struct ClientState {
    client_id: String,
    handles: Mutex<HandleTable>,
    closed: AtomicBool,
}

impl ClientState {
    fn handles(&self) -> MutexGuard<'_, HandleTable> {
        self.handles.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Snapshot for `/stats`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxyStats {
    pub proxy_id: String,
    pub clients: u64,
    pub open_handles: u64,
    pub cache: CacheStats,
    pub consistency: ConsistencyStats,
}

/// One caching proxy: cache store, consistency manager and client sessions
pub struct FileProxy {
    consistency: Arc<ConsistencyManager>,
    clients: DashMap<String, Arc<ClientState>>,
    max_open_files: usize,
}

impl FileProxy {
    /// Build a proxy without subscribing to invalidations
    pub fn new(remote: Arc<dyn RemoteStore>, config: &Config) -> Arc<Self> {
        let store = Arc::new(SharedCacheStore::new(
            config.cache.max_cache_size,
            config.cache.max_entries,
        ));
        Arc::new(Self {
            consistency: ConsistencyManager::new(store, remote, config.consistency.clone()),
            clients: DashMap::new(),
            max_open_files: config.proxy.max_open_files,
        })
    }

    /// Build a proxy and register it for the server's invalidations
    pub async fn start(remote: Arc<dyn RemoteStore>, config: &Config) -> Result<Arc<Self>> {
        let proxy = Self::new(remote, config);
        proxy.consistency.subscribe().await?;
        info!(
            "Proxy {} started (cache {} bytes, {} open files per client)",
            proxy.proxy_id(),
            config.cache.max_cache_size,
            config.proxy.max_open_files
        );
        Ok(proxy)
    }

    pub fn proxy_id(&self) -> &str {
        self.consistency.proxy_id()
    }

    pub fn consistency(&self) -> &Arc<ConsistencyManager> {
        &self.consistency
    }

    pub fn store(&self) -> &Arc<SharedCacheStore> {
        self.consistency.store()
    }

    /// Session for `client_id`, created on first use
    pub fn session(self: &Arc<Self>, client_id: &str) -> ProxySession {
        let client = self
            .clients
            .entry(client_id.to_string())
            .or_insert_with(|| {
                debug!("New client session {}", client_id);
                Arc::new(ClientState {
                    client_id: client_id.to_string(),
                    handles: Mutex::new(HandleTable::new(self.max_open_files)),
                    closed: AtomicBool::new(false),
                })
            })
            .clone();
        ProxySession {
            proxy: self.clone(),
            client,
        }
    }

    /// Close every handle of `client_id`, committing dirty files.
    ///
    /// A commit that fails here is logged and its modifications discarded,
    /// since nobody is left to retry it. Returns the number of handles closed.
    pub async fn client_done(&self, client_id: &str) -> usize {
        let Some((_, client)) = self.clients.remove(client_id) else {
            return 0;
        };
        client.closed.store(true, Ordering::SeqCst);
        let handles = client.handles().drain();
        let count = handles.len();

        for (handle, file) in handles {
            let mut file = file.lock().await;
            if file.is_closed() {
                continue;
            }
            match &mut *file {
                OpenFile::Reader { name, closed, .. } => {
                    self.consistency.close_read(name);
                    *closed = true;
                }
                OpenFile::Writer { session, .. } => {
                    if let Err(e) = self.consistency.close_write(session).await {
                        error!(
                            "Discarding changes to {} (client {}, handle {}): {}",
                            session.name(),
                            client_id,
                            handle,
                            e
                        );
                        self.consistency.discard_write(session).await;
                    }
                }
            }
        }
        info!("Client {} done, closed {} handles", client_id, count);
        count
    }

    /// Tear down every client session and release all leases
    pub async fn shutdown(&self) {
        let clients: Vec<String> = self.clients.iter().map(|e| e.key().clone()).collect();
        let mut closed = 0;
        for client_id in clients {
            closed += self.client_done(&client_id).await;
        }
        self.consistency.release_all().await;
        info!("Proxy {} shut down, closed {} handles", self.proxy_id(), closed);
    }

    pub fn stats(&self) -> ProxyStats {
        ProxyStats {
            proxy_id: self.proxy_id().to_string(),
            clients: self.clients.len() as u64,
            open_handles: self
                .clients
                .iter()
                .map(|c| c.handles().open_count() as u64)
                .sum(),
            cache: self.store().get_stats(),
            consistency: self.consistency.stats(),
        }
    }
}

/// File operations on behalf of one client
#[derive(Clone)]
pub struct ProxySession {
    proxy: Arc<FileProxy>,
    client: Arc<ClientState>,
}

impl ProxySession {
    pub fn client_id(&self) -> &str {
        &self.client.client_id
    }

    fn handle(&self, handle: FileHandle) -> Result<SharedHandle> {
        self.client.handles().get(handle)
    }

    fn consistency(&self) -> &Arc<ConsistencyManager> {
        &self.proxy.consistency
    }

    pub async fn open(&self, name: &str, options: impl Into<OpenOptions>) -> Result<FileHandle> {
        let options = options.into();
        let name = normalize_name(name)?;
        if self.client.closed.load(Ordering::SeqCst) {
            return Err(ProxyError::InvalidRequest(format!(
                "client {} is already done",
                self.client.client_id
            )));
        }
        if !self.client.handles().has_capacity() {
            return Err(ProxyError::TooManyOpenFiles(format!(
                "client {} has too many open files",
                self.client.client_id
            )));
        }

        let file = if options.mode.is_write() {
            let session = self.consistency().open_write(&name, options.mode).await?;
            OpenFile::Writer { session, cursor: 0 }
        } else {
            let binding = self.consistency().open_read(&name, options.allow_stale).await?;
            debug!(
                "Client {} reads {} at version {}{}",
                self.client.client_id,
                name,
                binding.version,
                if binding.stale { " (stale)" } else { "" }
            );
            OpenFile::Reader {
                name: name.clone(),
                content: binding.content,
                cursor: 0,
                closed: false,
            }
        };

        let shared = Arc::new(tokio::sync::Mutex::new(file));
        let allocated = self.client.handles().allocate(shared.clone());
        match allocated {
            Ok(handle) => {
                debug!(
                    "Client {} opened {} as handle {} ({:?})",
                    self.client.client_id, name, handle, options.mode
                );
                Ok(handle)
            }
            Err(e) => {
                let mut file = shared.lock().await;
                self.abandon(&mut file).await;
                Err(e)
            }
        }
    }

    async fn abandon(&self, file: &mut OpenFile) {
        match file {
            OpenFile::Reader { name, closed, .. } => {
                if !*closed {
                    self.consistency().close_read(name);
                    *closed = true;
                }
            }
            OpenFile::Writer { session, .. } => self.consistency().discard_write(session).await,
        }
    }

    /// Lock an open handle; handles closed meanwhile are `BadHandle`
    async fn lock_open(&self, handle: FileHandle) -> Result<(SharedHandle, tokio::sync::OwnedMutexGuard<OpenFile>)> {
        let shared = self.handle(handle)?;
        let file = shared.clone().lock_owned().await;
        if file.is_closed() {
            return Err(ProxyError::BadHandle(handle));
        }
        Ok((shared, file))
    }

    /// Positional read; does not move the cursor
    pub async fn read(&self, handle: FileHandle, range: Range<u64>) -> Result<Bytes> {
        let (_, file) = self.lock_open(handle).await?;
        let len = usize::try_from(range.end.saturating_sub(range.start)).unwrap_or(usize::MAX);
        Ok(file.read_at(range.start, len))
    }

    /// Read up to `len` bytes at the cursor and advance it
    pub async fn read_next(&self, handle: FileHandle, len: usize) -> Result<Bytes> {
        let (_, mut file) = self.lock_open(handle).await?;
        let offset = match &*file {
            OpenFile::Reader { cursor, .. } | OpenFile::Writer { cursor, .. } => *cursor,
        };
        let data = file.read_at(offset, len);
        match &mut *file {
            OpenFile::Reader { cursor, .. } | OpenFile::Writer { cursor, .. } => {
                *cursor += data.len() as u64
            }
        }
        Ok(data)
    }

    /// Write at the cursor and advance it; read handles fail with `BadHandle`
    pub async fn write(&self, handle: FileHandle, data: &[u8]) -> Result<usize> {
        let (_, mut file) = self.lock_open(handle).await?;
        match &mut *file {
            OpenFile::Reader { .. } => Err(ProxyError::BadHandle(handle)),
            OpenFile::Writer { session, cursor } => {
                let written = self.consistency().write(session, *cursor, data).await?;
                *cursor += written as u64;
                Ok(written)
            }
        }
    }

    /// Move the cursor; returns the new absolute position
    pub async fn seek(&self, handle: FileHandle, origin: SeekOrigin) -> Result<u64> {
        let (_, mut file) = self.lock_open(handle).await?;
        let (cursor, size) = match &mut *file {
            OpenFile::Reader { cursor, content, .. } => (cursor, content.len() as u64),
            OpenFile::Writer { session, cursor } => {
                let size = session.len();
                (cursor, size)
            }
        };
        let target = match origin {
            SeekOrigin::Start(pos) => Some(pos),
            SeekOrigin::Current(delta) => cursor.checked_add_signed(delta),
            SeekOrigin::End(delta) => size.checked_add_signed(delta),
        };
        let target = target.ok_or_else(|| {
            ProxyError::InvalidRequest(format!("seek to {:?} lands before the start of the file", origin))
        })?;
        *cursor = target;
        Ok(target)
    }

    /// Close a handle, committing a dirty write session. On a failed commit
    /// the handle stays open so the caller can retry or `discard`.
    pub async fn close(&self, handle: FileHandle) -> Result<()> {
        let (shared, mut file) = self.lock_open(handle).await?;
        match &mut *file {
            OpenFile::Reader { name, closed, .. } => {
                self.consistency().close_read(name);
                *closed = true;
            }
            OpenFile::Writer { session, .. } => {
                self.consistency().close_write(session).await?;
            }
        }
        debug!("Client {} closed handle {} ({})", self.client.client_id, handle, file.name());
        drop(file);
        self.client.handles().release(handle, &shared);
        Ok(())
    }

    /// Drop pending modifications and close the handle
    pub async fn discard(&self, handle: FileHandle) -> Result<()> {
        let (shared, mut file) = self.lock_open(handle).await?;
        if let OpenFile::Writer { session, .. } = &*file {
            if session.is_dirty() {
                warn!(
                    "Client {} discards modifications to {}",
                    self.client.client_id,
                    session.name()
                );
            }
        }
        self.abandon(&mut file).await;
        drop(file);
        self.client.handles().release(handle, &shared);
        Ok(())
    }

    pub async fn unlink(&self, name: &str) -> Result<()> {
        let name = normalize_name(name)?;
        self.consistency().unlink(&name).await
    }

    /// Close all handles of this client
    pub async fn done(&self) -> usize {
        self.proxy.client_done(&self.client.client_id).await
    }

    pub fn open_handles(&self) -> usize {
        self.client.handles().open_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_types::OpenMode;
    use crate::config::LeaseConfig;
    use crate::file_server::{FileServer, LocalRemoteStore};
    use std::time::Duration;

    fn setup(max_open_files: usize) -> (Arc<FileServer>, Arc<FileProxy>) {
        let server = Arc::new(FileServer::new(LeaseConfig {
            lease_wait_timeout: Duration::from_millis(200),
            ..Default::default()
        }));
        let mut config = Config::default();
        config.proxy.max_open_files = max_open_files;
        config.cache.max_cache_size = 1024;
        config.consistency.write_gate_timeout = Duration::from_millis(100);
        let proxy = FileProxy::new(Arc::new(LocalRemoteStore::new(server.clone(), "p1")), &config);
        (server, proxy)
    }

    #[tokio::test]
    async fn test_write_then_read_with_cursor() -> Result<()> {
        let (_server, proxy) = setup(8);
        let session = proxy.session("c1");

        let fd = session.open("notes.txt", OpenMode::Create).await?;
        assert_eq!(session.write(fd, b"hello ").await?, 6);
        assert_eq!(session.write(fd, b"world").await?, 5);
        session.close(fd).await?;

        let fd = session.open("notes.txt", OpenMode::Read).await?;
        assert_eq!(session.read_next(fd, 5).await?, Bytes::from("hello"));
        assert_eq!(session.read_next(fd, 100).await?, Bytes::from(" world"));
        assert!(session.read_next(fd, 100).await?.is_empty());

        assert_eq!(session.seek(fd, SeekOrigin::End(-5)).await?, 6);
        assert_eq!(session.read_next(fd, 5).await?, Bytes::from("world"));
        assert_eq!(session.read(fd, 0..4).await?, Bytes::from("hell"));
        assert!(matches!(
            session.seek(fd, SeekOrigin::Current(-100)).await,
            Err(ProxyError::InvalidRequest(_))
        ));
        session.close(fd).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_handles_reuse_lowest_free_number() -> Result<()> {
        let (_server, proxy) = setup(3);
        let session = proxy.session("c1");
        for name in ["a", "b", "c"] {
            let fd = session.open(name, OpenMode::Create).await?;
            session.close(fd).await?;
        }

        let a = session.open("a", OpenMode::Read).await?;
        let b = session.open("b", OpenMode::Read).await?;
        let c = session.open("c", OpenMode::Read).await?;
        assert_eq!((a, b, c), (0, 1, 2));
        assert!(matches!(
            session.open("a", OpenMode::Read).await,
            Err(ProxyError::TooManyOpenFiles(_))
        ));

        session.close(b).await?;
        assert_eq!(session.open("c", OpenMode::Read).await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_bad_handles() -> Result<()> {
        let (_server, proxy) = setup(8);
        let session = proxy.session("c1");
        assert_eq!(session.close(7).await, Err(ProxyError::BadHandle(7)));

        let fd = session.open("f", OpenMode::Create).await?;
        session.close(fd).await?;
        assert_eq!(session.read_next(fd, 1).await, Err(ProxyError::BadHandle(fd)));

        let fd = session.open("f", OpenMode::Read).await?;
        assert_eq!(session.write(fd, b"x").await, Err(ProxyError::BadHandle(fd)));
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_close_unpins_once() -> Result<()> {
        let (_server, proxy) = setup(8);
        let session = proxy.session("c1");
        let fd = session.open("shared", OpenMode::Create).await?;
        session.write(fd, b"pinned").await?;
        session.close(fd).await?;

        let kept = session.open("shared", OpenMode::Read).await?;
        let fd = session.open("shared", OpenMode::Read).await?;
        assert_eq!(proxy.store().peek("shared").map(|e| e.pins), Some(2));

        let (first, second) = tokio::join!(session.close(fd), session.close(fd));
        assert!(first.is_ok() != second.is_ok());
        assert!(matches!(first.or(second), Ok(())));
        assert_eq!(session.close(fd).await, Err(ProxyError::BadHandle(fd)));
        assert_eq!(proxy.store().peek("shared").map(|e| e.pins), Some(1));

        assert_eq!(session.read(kept, 0..u64::MAX).await?, Bytes::from("pinned"));
        session.close(kept).await?;
        assert_eq!(proxy.store().peek("shared").map(|e| e.pins), Some(0));
        proxy.store().validate_consistency()?;
        Ok(())
    }

    #[tokio::test]
    async fn test_handles_are_per_client() -> Result<()> {
        let (_server, proxy) = setup(8);
        let first = proxy.session("c1");
        let second = proxy.session("c2");
        let fd = first.open("f", OpenMode::Create).await?;
        assert_eq!(second.close(fd).await, Err(ProxyError::BadHandle(fd)));
        first.close(fd).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_client_done_commits_dirty_handles() -> Result<()> {
        let (server, proxy) = setup(8);
        let session = proxy.session("c1");
        let fd = session.open("draft", OpenMode::Create).await?;
        session.write(fd, b"unsaved").await?;
        let reader = session.open("draft", OpenMode::Read).await;
        // Nothing committed yet: the file does not exist remotely
        assert!(matches!(reader, Err(ProxyError::NotFound(_))));

        assert_eq!(session.done().await, 1);
        assert_eq!(server.fetch("draft")?.content, Bytes::from("unsaved"));
        assert_eq!(proxy.stats().open_handles, 0);
        proxy.store().validate_consistency()?;
        Ok(())
    }

    #[tokio::test]
    async fn test_discard_after_conflict() -> Result<()> {
        let (server, proxy) = setup(8);
        let session = proxy.session("c1");
        let fd = session.open("f", OpenMode::Create).await?;
        session.close(fd).await?;

        let fd = session.open("f", OpenMode::Write).await?;
        session.write(fd, b"mine").await?;

        // Someone removes the file behind the proxy's back while it holds the lease
        server.remove("p1", "f").await?;
        assert!(matches!(session.close(fd).await, Err(ProxyError::Conflict { .. })));
        assert_eq!(session.open_handles(), 1);

        session.discard(fd).await?;
        assert_eq!(session.open_handles(), 0);
        assert!(!proxy.store().peek("f").is_some_and(|e| e.dirty));
        Ok(())
    }

    #[tokio::test]
    async fn test_unlink_and_recreate() -> Result<()> {
        let (_server, proxy) = setup(8);
        let session = proxy.session("c1");
        let fd = session.open("tmp", OpenMode::CreateNew).await?;
        session.write(fd, b"1").await?;
        session.close(fd).await?;

        session.unlink("tmp").await?;
        assert!(matches!(
            session.open("tmp", OpenMode::Read).await,
            Err(ProxyError::NotFound(_))
        ));
        assert!(matches!(session.unlink("tmp").await, Err(ProxyError::NotFound(_))));

        let fd = session.open("tmp", OpenMode::CreateNew).await?;
        session.close(fd).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_names_rejected() {
        let (_server, proxy) = setup(8);
        let session = proxy.session("c1");
        assert!(matches!(
            session.open("../outside", OpenMode::Read).await,
            Err(ProxyError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() -> Result<()> {
        let (server, proxy) = setup(8);
        let a = proxy.session("c1");
        let b = proxy.session("c2");
        let fd = a.open("x", OpenMode::Create).await?;
        a.write(fd, b"x").await?;
        b.open("x", OpenMode::Create).await.unwrap_err();

        proxy.shutdown().await;
        assert_eq!(proxy.stats().clients, 0);
        assert_eq!(server.fetch("x")?.content, Bytes::from("x"));
        assert_eq!(server.stats().read_leases + server.stats().write_leases, 0);
        Ok(())
    }
}
