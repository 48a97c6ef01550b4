use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;

use super::{BackendError, CacheBackend, CacheKey};

/// An artifact saved in the in-memory moka cache.
#[derive(Clone, Debug)]
struct StoredArtifact {
    /// When the artifact was stored, used by [`CacheBackend::doom_between`].
    stored_at: SystemTime,
    contents: Bytes,
}

/// A [`CacheBackend`] keeping artifacts in memory, bounded by their total size.
#[derive(Debug)]
pub struct InMemoryBackend {
    cache: moka::future::Cache<CacheKey, StoredArtifact>,
}

impl InMemoryBackend {
    pub fn new(capacity: u64) -> Self {
        let cache = moka::future::Cache::builder()
            .max_capacity(capacity)
            .name("artifacts")
            // NOTE: we count the bookkeeping structures to the weight as well
            .weigher(|_k, v: &StoredArtifact| {
                let size = std::mem::size_of::<(CacheKey, StoredArtifact)>() + v.contents.len();
                size.try_into().unwrap_or(u32::MAX)
            })
            .build();

        Self { cache }
    }
}

#[async_trait]
impl CacheBackend for InMemoryBackend {
    fn name(&self) -> &'static str {
        "in_memory"
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<Bytes>, BackendError> {
        Ok(self.cache.get(key).await.map(|stored| stored.contents))
    }

    async fn put(&self, key: &CacheKey, contents: Bytes) -> Result<(), BackendError> {
        let stored = StoredArtifact {
            stored_at: SystemTime::now(),
            contents,
        };
        self.cache.insert(key.clone(), stored).await;
        Ok(())
    }

    async fn doom_between(
        &self,
        start: SystemTime,
        end: SystemTime,
    ) -> Result<usize, BackendError> {
        let doomed: Vec<_> = self
            .cache
            .iter()
            .filter(|(_, stored)| start <= stored.stored_at && stored.stored_at < end)
            .map(|(key, _)| key)
            .collect();

        for key in &doomed {
            self.cache.invalidate(key.as_ref()).await;
        }
        Ok(doomed.len())
    }
}
