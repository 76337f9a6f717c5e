// Bounded metadata response cache with single-flight fetch
//
// Concurrent misses on the same key share one upstream call; entries
// expire after a TTL and total retained bytes are capped.

use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use serde_json::Value;
use stratus_core::{Result, ServiceError};
use tracing::debug;

/// Cache bounds, taken from the process configuration
#[derive(Debug, Clone)]
pub struct CmrCacheConfig {
    pub ttl: Duration,
    pub max_bytes: u64,
}

impl Default for CmrCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(600),
            max_bytes: 32 * 1024 * 1024,
        }
    }
}

/// Process-wide cache of catalog responses keyed by query hash
#[derive(Clone)]
pub struct CmrCache {
    inner: Cache<String, Arc<Value>>,
}

impl CmrCache {
    pub fn new(config: CmrCacheConfig) -> Self {
        let inner = Cache::builder()
            .time_to_live(config.ttl)
            .max_capacity(config.max_bytes)
            .weigher(|_key: &String, value: &Arc<Value>| {
                approximate_size(value.as_ref()).min(u32::MAX as usize) as u32
            })
            .build();
        Self { inner }
    }

    /// Return the cached response for `key`, or run `fetch` to produce it.
    ///
    /// Concurrent callers with the same key are coalesced: exactly one
    /// fetch runs and every caller receives its result. A failed fetch is
    /// not cached.
    pub async fn get_or_fetch<F, Fut>(&self, key: String, fetch: F) -> Result<Arc<Value>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Value>>,
    {
        self.inner
            .try_get_with(key.clone(), async move {
                debug!(%key, "catalog cache miss");
                fetch().await.map(Arc::new)
            })
            .await
            .map_err(|e: Arc<ServiceError>| clone_error(&e))
    }

    /// Number of live entries (eventually consistent).
    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }

    #[cfg(test)]
    pub async fn sync(&self) {
        self.inner.run_pending_tasks().await;
    }
}

/// Rough in-memory footprint of a JSON value, for the byte-cap weigher.
fn approximate_size(value: &Value) -> usize {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) => 16,
        Value::String(s) => 16 + s.len(),
        Value::Array(items) => 16 + items.iter().map(approximate_size).sum::<usize>(),
        Value::Object(map) => {
            16 + map
                .iter()
                .map(|(k, v)| k.len() + approximate_size(v))
                .sum::<usize>()
        }
    }
}

fn clone_error(err: &ServiceError) -> ServiceError {
    match err {
        ServiceError::RequestValidation(m) => ServiceError::RequestValidation(m.clone()),
        ServiceError::NotFound(m) => ServiceError::NotFound(m.clone()),
        ServiceError::Authorization(m) => ServiceError::Authorization(m.clone()),
        ServiceError::Conflict(m) => ServiceError::Conflict(m.clone()),
        ServiceError::UpstreamUnavailable(m) => ServiceError::UpstreamUnavailable(m.clone()),
        ServiceError::Unsupported(m) => ServiceError::Unsupported(m.clone()),
        ServiceError::Server(m) => ServiceError::Server(m.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn concurrent_misses_share_one_fetch() {
        let cache = CmrCache::new(CmrCacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let fetch = |calls: Arc<AtomicUsize>| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(json!({"hits": 42}))
        };

        let (a, b) = tokio::join!(
            cache.get_or_fetch("k".to_string(), || fetch(calls.clone())),
            cache.get_or_fetch("k".to_string(), || fetch(calls.clone())),
        );

        assert_eq!(*a.unwrap(), json!({"hits": 42}));
        assert_eq!(*b.unwrap(), json!({"hits": 42}));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_fetch_is_not_cached() {
        let cache = CmrCache::new(CmrCacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let counting = calls.clone();
        let err = cache
            .get_or_fetch("k".to_string(), || async move {
                counting.fetch_add(1, Ordering::SeqCst);
                Err(ServiceError::UpstreamUnavailable("503".to_string()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::UpstreamUnavailable(_)));

        let counting = calls.clone();
        let value = cache
            .get_or_fetch("k".to_string(), || async move {
                counting.fetch_add(1, Ordering::SeqCst);
                Ok(json!(1))
            })
            .await
            .unwrap();
        assert_eq!(*value, json!(1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let cache = CmrCache::new(CmrCacheConfig {
            ttl: Duration::from_millis(30),
            max_bytes: 1024,
        });

        cache
            .get_or_fetch("k".to_string(), || async { Ok(json!("v")) })
            .await
            .unwrap();
        cache.sync().await;
        assert_eq!(cache.entry_count(), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        cache.sync().await;
        assert_eq!(cache.entry_count(), 0);
    }
}
