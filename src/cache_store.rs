//! Cache Store Module
//!
//! Holds cached file content and per-file metadata for one proxy instance.
//! Every successful `get`/`put` refreshes the entry's LRU position; admission
//! goes through the `EvictionEngine`, which never selects dirty or pinned
//! entries.
//!
//! `CacheStore` is the single-threaded core. `SharedCacheStore` wraps it in a
//! mutex that is only held for the duration of one lookup or admission and
//! never across remote calls.

use crate::cache_types::{CacheEntry, CacheStats, Version};
use crate::eviction::EvictionEngine;
use crate::{ProxyError, Result};
use bytes::Bytes;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Cache store with LRU admission control
pub struct CacheStore {
    entries: HashMap<String, CacheEntry>,
    eviction: EvictionEngine,
    current_size: u64,
    hit_count: u64,
    miss_count: u64,
    admission_count: u64,
    rejected_admissions: u64,
}

impl CacheStore {
    /// Create a store holding at most `max_size` bytes and `max_entries` files (0 = unlimited)
    pub fn new(max_size: u64, max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            eviction: EvictionEngine::new(max_size, max_entries),
            current_size: 0,
            hit_count: 0,
            miss_count: 0,
            admission_count: 0,
            rejected_admissions: 0,
        }
    }

    /// Snapshot of an entry; refreshes its LRU position
    pub fn get(&mut self, name: &str) -> Option<CacheEntry> {
        match self.entries.get(name) {
            Some(entry) => {
                let snapshot = entry.clone();
                self.eviction.touch(name);
                self.hit_count += 1;
                debug!("Cache hit for {} (version {})", name, snapshot.version);
                Some(snapshot)
            }
            None => {
                self.miss_count += 1;
                debug!("Cache miss for {}", name);
                None
            }
        }
    }

    /// Look at an entry without touching recency or statistics
    pub fn peek(&self, name: &str) -> Option<&CacheEntry> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Admit new content or replace the cached copy of `name`.
    ///
    /// Returns the names evicted to make room. Fails with `Busy` when the
    /// cached copy has uncommitted modifications, with `StaleVersion` when
    /// `version` is older than the cached one and with `CapacityExceeded` when
    /// no combination of evictable entries frees enough space.
    pub fn put(&mut self, name: &str, content: Bytes, version: Version) -> Result<Vec<String>> {
        if let Some(existing) = self.entries.get(name) {
            if existing.dirty {
                return Err(ProxyError::Busy(format!(
                    "{} has uncommitted local modifications",
                    name
                )));
            }
            if version < existing.version {
                return Err(ProxyError::StaleVersion {
                    name: name.to_string(),
                    cached: existing.version,
                    offered: version,
                });
            }
        }

        let new_size = content.len() as u64;
        let evicted = self.admit(name, new_size)?;

        let pins = self.entries.get(name).map(|e| e.pins).unwrap_or(0);
        let mut entry = CacheEntry::new(name, content, version);
        entry.pins = pins;
        self.install(entry);
        self.eviction.insert(name);
        self.admission_count += 1;

        debug!(
            "Stored {} in cache (version {}, {} bytes, {} evicted)",
            name,
            version,
            new_size,
            evicted.len()
        );
        Ok(evicted)
    }

    /// Flag pending local modifications; the entry is no longer evictable
    pub fn mark_dirty(&mut self, name: &str) -> Result<()> {
        let entry = self.entry_mut(name)?;
        if !entry.dirty {
            entry.dirty = true;
            debug!("Marked {} dirty", name);
        }
        Ok(())
    }

    pub fn pin(&mut self, name: &str) -> Result<()> {
        let entry = self.entry_mut(name)?;
        entry.pins += 1;
        Ok(())
    }

    /// `get` and `pin` in one step; the returned snapshot includes the new pin
    pub fn get_pinned(&mut self, name: &str) -> Option<CacheEntry> {
        self.pin(name).ok()?;
        self.get(name)
    }

    /// `put` and `pin` in one step, so the admitted entry cannot be evicted
    /// before its first reader holds it
    pub fn put_pinned(&mut self, name: &str, content: Bytes, version: Version) -> Result<Vec<String>> {
        let evicted = self.put(name, content, version)?;
        self.pin(name)?;
        Ok(evicted)
    }

    pub fn unpin(&mut self, name: &str) {
        if let Some(entry) = self.entries.get_mut(name) {
            entry.pins = entry.pins.saturating_sub(1);
        }
    }

    /// Grow the accounted size of `name` to `new_size` while a writer extends it
    pub fn reserve(&mut self, name: &str, new_size: u64) -> Result<Vec<String>> {
        let current = self.entry_mut(name)?.size;
        if new_size <= current {
            return Ok(Vec::new());
        }

        let evicted = self.admit(name, new_size)?;
        self.current_size = self.current_size - current + new_size;
        if let Some(entry) = self.entries.get_mut(name) {
            entry.size = new_size;
        }
        Ok(evicted)
    }

    /// Install content that was just committed to the remote store and clear the dirty flag
    pub fn commit_local(&mut self, name: &str, content: Bytes, version: Version) -> Result<Vec<String>> {
        let existing_version = self.entry_mut(name)?.version;
        if version <= existing_version {
            return Err(ProxyError::StaleVersion {
                name: name.to_string(),
                cached: existing_version,
                offered: version,
            });
        }

        let new_size = content.len() as u64;
        let evicted = self.admit(name, new_size)?;

        let old_size = self.entries.get(name).map(|e| e.size).unwrap_or(0);
        if let Some(entry) = self.entries.get_mut(name) {
            entry.content = content;
            entry.version = version;
            entry.size = new_size;
            entry.dirty = false;
            entry.cached_at = Utc::now();
        }
        self.current_size = self.current_size - old_size + new_size;
        self.eviction.touch(name);

        debug!("Committed {} locally at version {}", name, version);
        Ok(evicted)
    }

    /// Drop pending local modifications of `name`.
    ///
    /// Entries that never reached the remote store (version 0) and are not
    /// pinned any more are removed entirely.
    pub fn discard(&mut self, name: &str) -> Result<()> {
        let entry = self.entry_mut(name)?;
        let was_dirty = entry.dirty;
        entry.dirty = false;
        let content_size = entry.content.len() as u64;
        let reserved = entry.size;
        entry.size = content_size;
        let remove_entirely = entry.version == 0 && entry.pins == 0;
        self.current_size = self.current_size - reserved + content_size;

        if remove_entirely {
            self.drop_entry(name);
        }
        if was_dirty {
            warn!("Discarded uncommitted modifications of {}", name);
        }
        Ok(())
    }

    /// Remove an entry; fails with `Busy` if it is dirty or pinned
    pub fn remove(&mut self, name: &str) -> Result<CacheEntry> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| ProxyError::CacheMiss(name.to_string()))?;
        if !entry.is_evictable() {
            return Err(ProxyError::Busy(format!(
                "{} is in use (dirty: {}, pins: {})",
                name, entry.dirty, entry.pins
            )));
        }
        self.drop_entry(name)
            .ok_or_else(|| ProxyError::CacheMiss(name.to_string()))
    }

    /// Names from most to least recently used
    pub fn names_mru_first(&self) -> Vec<String> {
        self.eviction.names_mru_first()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn current_size(&self) -> u64 {
        self.current_size
    }

    pub fn get_stats(&self) -> CacheStats {
        CacheStats {
            current_size: self.current_size,
            max_size: self.eviction.max_size(),
            entries_count: self.entries.len() as u64,
            max_entries: self.eviction.max_entries() as u64,
            hit_count: self.hit_count,
            miss_count: self.miss_count,
            admission_count: self.admission_count,
            eviction_count: self.eviction.eviction_count(),
            rejected_admissions: self.rejected_admissions,
            dirty_entries: self.entries.values().filter(|e| e.dirty).count() as u64,
            last_eviction: self.eviction.last_eviction(),
        }
    }

    /// Check that the LRU list and the entry table agree and that size accounting is exact
    pub fn validate_consistency(&self) -> Result<()> {
        if self.eviction.len() != self.entries.len() {
            return Err(ProxyError::InternalError(format!(
                "LRU list has {} names but {} entries are cached",
                self.eviction.len(),
                self.entries.len()
            )));
        }

        for name in self.eviction.names_lru_first() {
            if !self.entries.contains_key(name) {
                return Err(ProxyError::InternalError(format!(
                    "LRU list contains non-existent entry: {}",
                    name
                )));
            }
        }

        let calculated: u64 = self.entries.values().map(|e| e.size).sum();
        if calculated != self.current_size {
            return Err(ProxyError::InternalError(format!(
                "Size mismatch: calculated {} vs tracked {}",
                calculated, self.current_size
            )));
        }

        let stats = self.get_stats();
        if stats.current_size > stats.max_size
            || (stats.max_entries > 0 && stats.entries_count > stats.max_entries)
        {
            return Err(ProxyError::InternalError(format!(
                "Cache over capacity: {} bytes / {} entries",
                stats.current_size, stats.entries_count
            )));
        }

        Ok(())
    }

    /// Plan and apply evictions so that `name` can hold `new_size` bytes
    fn admit(&mut self, name: &str, new_size: u64) -> Result<Vec<String>> {
        let plan = match self
            .eviction
            .plan_admission(&self.entries, self.current_size, name, new_size)
        {
            Ok(plan) => plan,
            Err(e) => {
                self.rejected_admissions += 1;
                warn!("Admission of {} rejected: {}", name, e);
                return Err(e);
            }
        };

        for victim in &plan.victims {
            if let Some(entry) = self.entries.remove(victim) {
                self.current_size = self.current_size.saturating_sub(entry.size);
                self.eviction.record_eviction(victim);
                info!(
                    "Evicted {} (version {}, {} bytes) to admit {}",
                    victim, entry.version, entry.size, name
                );
            }
        }
        Ok(plan.victims)
    }

    fn install(&mut self, entry: CacheEntry) {
        if let Some(old) = self.entries.remove(&entry.name) {
            self.current_size = self.current_size.saturating_sub(old.size);
        }
        self.current_size += entry.size;
        self.entries.insert(entry.name.clone(), entry);
    }

    fn drop_entry(&mut self, name: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(name)?;
        self.current_size = self.current_size.saturating_sub(entry.size);
        self.eviction.remove(name);
        debug!("Removed {} from cache", name);
        Some(entry)
    }

    fn entry_mut(&mut self, name: &str) -> Result<&mut CacheEntry> {
        self.entries
            .get_mut(name)
            .ok_or_else(|| ProxyError::CacheMiss(name.to_string()))
    }
}

/// Thread-safe wrapper around `CacheStore`
pub struct SharedCacheStore {
    inner: Mutex<CacheStore>,
}

impl SharedCacheStore {
    pub fn new(max_size: u64, max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(CacheStore::new(max_size, max_entries)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheStore> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, name: &str) -> Option<CacheEntry> {
        self.lock().get(name)
    }

    pub fn peek(&self, name: &str) -> Option<CacheEntry> {
        self.lock().peek(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains(name)
    }

    pub fn put(&self, name: &str, content: Bytes, version: Version) -> Result<Vec<String>> {
        self.lock().put(name, content, version)
    }

    pub fn mark_dirty(&self, name: &str) -> Result<()> {
        self.lock().mark_dirty(name)
    }

    pub fn pin(&self, name: &str) -> Result<()> {
        self.lock().pin(name)
    }

    pub fn get_pinned(&self, name: &str) -> Option<CacheEntry> {
        self.lock().get_pinned(name)
    }

    pub fn put_pinned(&self, name: &str, content: Bytes, version: Version) -> Result<Vec<String>> {
        self.lock().put_pinned(name, content, version)
    }

    pub fn unpin(&self, name: &str) {
        self.lock().unpin(name)
    }

    pub fn reserve(&self, name: &str, new_size: u64) -> Result<Vec<String>> {
        self.lock().reserve(name, new_size)
    }

    pub fn commit_local(&self, name: &str, content: Bytes, version: Version) -> Result<Vec<String>> {
        self.lock().commit_local(name, content, version)
    }

    pub fn discard(&self, name: &str) -> Result<()> {
        self.lock().discard(name)
    }

    pub fn remove(&self, name: &str) -> Result<CacheEntry> {
        self.lock().remove(name)
    }

    pub fn names_mru_first(&self) -> Vec<String> {
        self.lock().names_mru_first()
    }

    pub fn get_stats(&self) -> CacheStats {
        self.lock().get_stats()
    }

    pub fn validate_consistency(&self) -> Result<()> {
        self.lock().validate_consistency()
    }
}
