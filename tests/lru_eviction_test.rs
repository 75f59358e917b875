//! LRU eviction through the proxy and directly on the cache store.
//!
//! Property: with capacity C and N > C distinct admissions, the cache holds
//! exactly the last C names, most recent first.

use bytes::Bytes;
use file_proxy::cache_store::SharedCacheStore;
use file_proxy::cache_types::{LeaseMode, OpenMode};
use file_proxy::config::{Config, LeaseConfig};
use file_proxy::file_server::{FileServer, LocalRemoteStore};
use file_proxy::session::FileProxy;
use file_proxy::{ProxyError, Result};
use quickcheck::{QuickCheck, TestResult};
use std::sync::Arc;
use std::time::Duration;

async fn seed(server: &FileServer, name: &str, content: &str) -> Result<u64> {
    let grant = server.request_lease("seeder", name, LeaseMode::Write).await?;
    let version = server
        .commit("seeder", name, Bytes::from(content.to_string()), grant.version.unwrap_or(0))
        .await?;
    server.release_lease("seeder", name);
    Ok(version)
}

async fn read_whole(proxy: &Arc<FileProxy>, name: &str) -> Result<Bytes> {
    let session = proxy.session("reader");
    let fd = session.open(name, OpenMode::Read).await?;
    let data = session.read(fd, 0..u64::MAX).await?;
    session.close(fd).await?;
    Ok(data)
}

fn proxy_with_capacity(server: &Arc<FileServer>, max_entries: usize, max_size: u64) -> Arc<FileProxy> {
    let mut config = Config::default();
    config.cache.max_entries = max_entries;
    config.cache.max_cache_size = max_size;
    FileProxy::new(Arc::new(LocalRemoteStore::new(server.clone(), "p1")), &config)
}

#[tokio::test]
async fn test_reading_fourth_file_evicts_least_recent() -> Result<()> {
    let server = Arc::new(FileServer::new(LeaseConfig::default()));
    for name in ["A", "B", "C", "D"] {
        seed(&server, name, &format!("content of {}", name)).await?;
    }
    let proxy = proxy_with_capacity(&server, 3, 1024 * 1024);

    for name in ["A", "B", "C"] {
        read_whole(&proxy, name).await?;
    }
    assert_eq!(proxy.store().names_mru_first(), vec!["C", "B", "A"]);

    assert_eq!(read_whole(&proxy, "D").await?, Bytes::from("content of D"));
    assert_eq!(proxy.store().names_mru_first(), vec!["D", "C", "B"]);
    assert!(!proxy.store().contains("A"));

    // Evicted files come back from the server
    let fetches = proxy.stats().consistency.fetches;
    assert_eq!(read_whole(&proxy, "A").await?, Bytes::from("content of A"));
    assert_eq!(proxy.stats().consistency.fetches, fetches + 1);
    assert!(!proxy.store().contains("B"));
    Ok(())
}

#[tokio::test]
async fn test_recent_read_protects_entry() -> Result<()> {
    let server = Arc::new(FileServer::new(LeaseConfig::default()));
    for name in ["A", "B", "C", "D"] {
        seed(&server, name, name).await?;
    }
    let proxy = proxy_with_capacity(&server, 3, 1024 * 1024);

    for name in ["A", "B", "C", "A"] {
        read_whole(&proxy, name).await?;
    }
    read_whole(&proxy, "D").await?;
    assert_eq!(proxy.store().names_mru_first(), vec!["D", "A", "C"]);
    Ok(())
}

#[tokio::test]
async fn test_open_reader_pins_entry() -> Result<()> {
    let server = Arc::new(FileServer::new(LeaseConfig::default()));
    for name in ["A", "B"] {
        seed(&server, name, "0123456789").await?;
    }
    let proxy = proxy_with_capacity(&server, 0, 10);

    let session = proxy.session("slow");
    let fd = session.open("A", OpenMode::Read).await?;

    let result = read_whole(&proxy, "B").await;
    assert!(matches!(result, Err(ProxyError::CapacityExceeded(_))));

    session.close(fd).await?;
    assert_eq!(read_whole(&proxy, "B").await?, Bytes::from("0123456789"));
    assert!(!proxy.store().contains("A"));
    Ok(())
}

#[tokio::test]
async fn test_evicted_read_lease_is_released() -> Result<()> {
    let server = Arc::new(FileServer::new(LeaseConfig::default()));
    for name in ["A", "B"] {
        seed(&server, name, name).await?;
    }
    let proxy = proxy_with_capacity(&server, 1, 1024);

    read_whole(&proxy, "A").await?;
    read_whole(&proxy, "B").await?;

    let mut read_leases = server.stats().read_leases;
    for _ in 0..50 {
        if read_leases == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        read_leases = server.stats().read_leases;
    }
    assert_eq!(read_leases, 1);
    Ok(())
}

fn last_c_remain(capacity: u8, admissions: u8) -> TestResult {
    let capacity = (capacity % 8) as usize + 1;
    let admissions = (admissions % 32) as usize;
    if admissions <= capacity {
        return TestResult::discard();
    }

    let store = SharedCacheStore::new(u64::MAX, capacity);
    for i in 0..admissions {
        if store.put(&format!("f{}", i), Bytes::from(vec![b'x'; i % 5]), i as u64 + 1).is_err() {
            return TestResult::failed();
        }
    }

    let expected: Vec<String> = (admissions - capacity..admissions)
        .rev()
        .map(|i| format!("f{}", i))
        .collect();
    TestResult::from_bool(store.names_mru_first() == expected && store.validate_consistency().is_ok())
}

#[test]
fn prop_last_c_admissions_remain() {
    QuickCheck::new()
        .tests(200)
        .quickcheck(last_c_remain as fn(u8, u8) -> TestResult);
}

fn size_bound_keeps_newest(entry_size: u8, fits: u8, extra: u8) -> TestResult {
    let entry_size = entry_size as u64 % 64 + 1;
    let fits = fits as usize % 6 + 1;
    let extra = extra as usize % 10 + 1;

    let store = SharedCacheStore::new(entry_size * fits as u64, 0);
    let total = fits + extra;
    for i in 0..total {
        let content = Bytes::from(vec![b'y'; entry_size as usize]);
        if store.put(&format!("f{}", i), content, i as u64 + 1).is_err() {
            return TestResult::failed();
        }
    }

    let names = store.names_mru_first();
    let expected: Vec<String> = (extra..total).rev().map(|i| format!("f{}", i)).collect();
    TestResult::from_bool(names == expected && store.get_stats().current_size <= entry_size * fits as u64)
}

#[test]
fn prop_size_capacity_keeps_newest_entries() {
    QuickCheck::new()
        .tests(200)
        .quickcheck(size_bound_keeps_newest as fn(u8, u8, u8) -> TestResult);
}
