use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;

use super::fs::FilesystemBackend;
use super::memory::InMemoryBackend;
use super::{BackendConfig, BackendError, CacheKey};

/// A content-addressable store of compiled artifacts.
///
/// Implementations are shared between concurrently running operations and must not assume
/// any ordering between them.
#[async_trait]
pub trait CacheBackend: fmt::Debug + Send + Sync {
    /// A short name used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Looks up the entry for `key`, returning `None` when there is none.
    async fn get(&self, key: &CacheKey) -> Result<Option<Bytes>, BackendError>;

    /// Stores `contents` under `key`, replacing any previous entry.
    async fn put(&self, key: &CacheKey, contents: Bytes) -> Result<(), BackendError>;

    /// Removes all entries that were stored in the `[start, end)` time range.
    ///
    /// Returns the number of removed entries.
    async fn doom_between(&self, start: SystemTime, end: SystemTime)
    -> Result<usize, BackendError>;
}

/// Opens a [`CacheBackend`].
///
/// Opening may be slow, so the coordinator runs it as a background operation and keeps
/// incoming requests waiting until it completes.
#[async_trait]
pub trait BackendFactory: fmt::Debug + Send + Sync {
    async fn open(&self) -> Result<Arc<dyn CacheBackend>, BackendError>;
}

#[async_trait]
impl BackendFactory for BackendConfig {
    async fn open(&self) -> Result<Arc<dyn CacheBackend>, BackendError> {
        Ok(match self {
            BackendConfig::Filesystem(cfg) => Arc::new(FilesystemBackend::open(&cfg.path).await?),
            BackendConfig::InMemory(cfg) => Arc::new(InMemoryBackend::new(cfg.capacity)),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::caching::{FilesystemBackendConfig, InMemoryBackendConfig};

    #[tokio::test]
    async fn test_open_configured_backend() {
        artifactcache_test::setup();
        let cache_dir = artifactcache_test::tempdir();
        let path = cache_dir.path().join("artifacts");

        let config = BackendConfig::Filesystem(FilesystemBackendConfig { path: path.clone() });
        let backend = config.open().await.unwrap();
        assert_eq!(backend.name(), "filesystem");
        assert!(path.is_dir());

        let config = BackendConfig::InMemory(InMemoryBackendConfig { capacity: 1024 });
        let backend = config.open().await.unwrap();
        assert_eq!(backend.name(), "in_memory");

        let key = CacheKey::for_testing("foo");
        backend.put(&key, Bytes::from_static(b"compiled")).await.unwrap();
        assert_eq!(
            backend.get(&key).await.unwrap(),
            Some(Bytes::from_static(b"compiled"))
        );

        let now = SystemTime::now();
        let removed = backend
            .doom_between(now - Duration::from_secs(60), now + Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(backend.get(&key).await.unwrap(), None);
    }
}
