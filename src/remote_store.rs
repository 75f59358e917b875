//! Remote Store Module
//!
//! The seam between a proxy and the authoritative file server. Two transports
//! implement [`RemoteStore`]: the in-process `LocalRemoteStore` (see
//! `file_server`) and the HTTP client `HttpRemoteStore` (see `remote_http`).

use crate::cache_types::{LeaseGrant, LeaseMode, RemoteFile, Version};
use crate::{ProxyError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// Operations a proxy performs against the file server.
///
/// Every call is made on behalf of one proxy; the transport carries the
/// proxy's identity so the server can track leases per proxy.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Identity of the proxy this client speaks for
    fn proxy_id(&self) -> &str;

    /// Latest committed content, `NotFound` if the file does not exist
    async fn fetch(&self, name: &str) -> Result<RemoteFile>;

    /// Latest committed version without the content
    async fn stat(&self, name: &str) -> Result<Option<Version>>;

    /// Install new content if the current version is still `expected`
    /// (0 for a file that does not exist yet). Returns the new version or
    /// `Conflict`.
    async fn commit(&self, name: &str, content: Bytes, expected: Version) -> Result<Version>;

    /// Ask for a lease; a Write grant arrives only after every other proxy's
    /// lease on the file was invalidated or expired.
    async fn request_lease(&self, name: &str, mode: LeaseMode) -> Result<LeaseGrant>;

    async fn release_lease(&self, name: &str) -> Result<()>;

    /// Delete the file, invalidating other proxies like a write does
    async fn remove(&self, name: &str) -> Result<()>;

    /// Route invalidations for this proxy to `listener`
    async fn subscribe(&self, listener: Arc<dyn InvalidationListener>) -> Result<()>;
}

/// Receives server-initiated invalidations.
///
/// Called synchronously from the delivering transport; implementations must
/// not block.
pub trait InvalidationListener: Send + Sync {
    fn invalidate(&self, name: &str);
}

/// Canonical form of a file name: relative, `/`-separated, no `.`/`..`
/// segments and no empty components.
pub fn normalize_name(raw: &str) -> Result<String> {
    let mut parts = Vec::new();
    for part in raw.split(['/', '\\']) {
        match part {
            "" | "." => continue,
            ".." => {
                return Err(ProxyError::InvalidRequest(format!(
                    "file name escapes the store root: {}",
                    raw
                )))
            }
            p => parts.push(p),
        }
    }
    if parts.is_empty() {
        return Err(ProxyError::InvalidRequest(format!("empty file name: {:?}", raw)));
    }
    Ok(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("A").unwrap(), "A");
        assert_eq!(normalize_name("/dir//b.txt").unwrap(), "dir/b.txt");
        assert_eq!(normalize_name("./x/./y").unwrap(), "x/y");
        assert!(matches!(normalize_name("../etc/passwd"), Err(ProxyError::InvalidRequest(_))));
        assert!(matches!(normalize_name("a/../../b"), Err(ProxyError::InvalidRequest(_))));
        assert!(matches!(normalize_name("//"), Err(ProxyError::InvalidRequest(_))));
    }
}
