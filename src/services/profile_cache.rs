//! Read-through profile cache in front of the index.

use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;

use crate::error::Result;
use crate::models::Profile;
use crate::services::index::Index;

const DEFAULT_TTL: Duration = Duration::from_secs(60);
const DEFAULT_CAPACITY: u64 = 10_000;

#[derive(Clone)]
pub struct ProfileCache {
    index: Arc<dyn Index>,
    cache: Cache<String, Profile>,
}

impl ProfileCache {
    pub fn new(index: Arc<dyn Index>) -> Self {
        Self::with_ttl(index, DEFAULT_TTL)
    }

    pub fn with_ttl(index: Arc<dyn Index>, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(DEFAULT_CAPACITY)
            .time_to_live(ttl)
            .build();
        Self { index, cache }
    }

    /// Errors, `NotFound` included, are returned without being cached.
    pub async fn get(&self, address: &str) -> Result<Profile> {
        let index = self.index.clone();
        let key = address.to_string();
        self.cache
            .try_get_with(key.clone(), async move { index.get_profile(&key).await })
            .await
            .map_err(|e| (*e).clone())
    }

    pub async fn invalidate(&self, address: &str) {
        self.cache.invalidate(address).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::models::ProfileParams;
    use crate::services::index::MemoryIndex;

    fn params(first_name: &str) -> ProfileParams {
        ProfileParams {
            address: "a".to_string(),
            first_name: first_name.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_serves_cached_until_invalidated() {
        let index = Arc::new(MemoryIndex::new());
        let cache = ProfileCache::new(index.clone());

        index.set_profile(&params("Ann")).await.unwrap();
        assert_eq!(cache.get("a").await.unwrap().first_name, "Ann");

        index.set_profile(&params("Anna")).await.unwrap();
        assert_eq!(cache.get("a").await.unwrap().first_name, "Ann");

        cache.invalidate("a").await;
        assert_eq!(cache.get("a").await.unwrap().first_name, "Anna");
    }

    #[tokio::test]
    async fn test_not_found_is_not_cached() {
        let index = Arc::new(MemoryIndex::new());
        let cache = ProfileCache::new(index.clone());

        assert!(matches!(cache.get("a").await, Err(Error::NotFound)));
        index.set_profile(&params("Ann")).await.unwrap();
        assert!(cache.get("a").await.is_ok());
    }
}
