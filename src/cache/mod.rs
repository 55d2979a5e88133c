//! Read-through TTL caching.
//!
//! Caches are write-through with invalidation on mutation: reads may return
//! a value stale by at most the TTL, and nothing with security consequences
//! may rely on a cache hit to grant access - the authoritative check always
//! falls through to the database.

use std::hash::Hash;
use std::time::Duration;

use moka::future::Cache;
use serde::Deserialize;

/// Cache configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Bound on staleness, in seconds.
    pub ttl_secs: u64,
    /// Maximum number of entries.
    pub capacity: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 60,
            capacity: 10_000,
        }
    }
}

/// Build a TTL cache from configuration.
pub fn build_cache<K, V>(config: &CacheConfig) -> Cache<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    Cache::builder()
        .max_capacity(config.capacity)
        .time_to_live(Duration::from_secs(config.ttl_secs.max(1)))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_get_invalidate() {
        let cache: Cache<String, bool> = build_cache(&CacheConfig::default());

        cache.insert("k".to_string(), true).await;
        assert_eq!(cache.get("k").await, Some(true));

        cache.invalidate("k").await;
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn test_capacity_is_bounded() {
        let cache: Cache<u64, u64> = build_cache(&CacheConfig {
            ttl_secs: 60,
            capacity: 4,
        });

        for i in 0..64u64 {
            cache.insert(i, i).await;
        }
        cache.run_pending_tasks().await;
        assert!(cache.entry_count() <= 4);
    }
}
