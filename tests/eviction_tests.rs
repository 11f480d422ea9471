//! Integration tests for FIFO eviction of the runtime partition.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use common::key;
use offline_tier::cache::entry::{RequestKey, StoredResponse};
use offline_tier::cache::evictor::Evictor;
use offline_tier::cache::manager::CacheStoreManager;
use offline_tier::cache::storage::{CacheError, CacheStorage, MemoryStorage};
use offline_tier::config::CacheConfig;
use offline_tier::metrics::Metrics;

fn entry(i: usize) -> (RequestKey, StoredResponse) {
    (
        key(&format!("/api/cases/{i}")),
        StoredResponse::ok("application/json", format!("{{\"id\":{i}}}")),
    )
}

#[tokio::test]
async fn test_runtime_partition_holds_at_most_150() {
    let cache = CacheStoreManager::new(Arc::new(MemoryStorage::new()), &CacheConfig::default());
    for i in 0..151 {
        let (k, v) = entry(i);
        assert!(cache.put_runtime(k, v).await);
    }

    let runtime = cache.open(cache.runtime_name()).await.unwrap();
    let keys = runtime.keys().await.unwrap();
    assert_eq!(keys.len(), 150);
    assert!(!keys.contains(&entry(0).0));
    assert_eq!(keys.first(), Some(&entry(1).0));
}

#[tokio::test]
async fn test_access_does_not_refresh_order() {
    let config = CacheConfig {
        max_runtime_entries: 3,
        ..Default::default()
    };
    let cache = CacheStoreManager::new(Arc::new(MemoryStorage::new()), &config);
    for i in 0..3 {
        let (k, v) = entry(i);
        cache.put_runtime(k, v).await;
    }

    // Reading the oldest entry must not save it.
    assert!(cache.lookup_any(&entry(0).0).await.is_some());
    let (k, v) = entry(3);
    cache.put_runtime(k, v).await;

    assert!(cache.lookup_any(&entry(0).0).await.is_none());
    assert!(cache.lookup_any(&entry(1).0).await.is_some());
}

#[tokio::test]
async fn test_rewrite_moves_entry_to_newest() {
    let config = CacheConfig {
        max_runtime_entries: 2,
        ..Default::default()
    };
    let cache = CacheStoreManager::new(Arc::new(MemoryStorage::new()), &config);
    let (k0, v0) = entry(0);
    let (k1, v1) = entry(1);
    cache.put_runtime(k0.clone(), v0.clone()).await;
    cache.put_runtime(k1.clone(), v1).await;
    cache.put_runtime(k0.clone(), v0).await;

    let (k2, v2) = entry(2);
    cache.put_runtime(k2.clone(), v2).await;

    let runtime = cache.open(cache.runtime_name()).await.unwrap();
    assert_eq!(runtime.keys().await.unwrap(), vec![k0, k2]);
}

#[tokio::test]
async fn test_enforce_limit_with_explicit_bound() {
    let cache = CacheStoreManager::new(Arc::new(MemoryStorage::new()), &CacheConfig::default());
    for i in 0..10 {
        let (k, v) = entry(i);
        cache.put_runtime(k, v).await;
    }

    let runtime = cache.open(cache.runtime_name()).await.unwrap();
    let report = cache.enforce_limit(&runtime, 4).await.unwrap();
    assert_eq!(report.evicted.len(), 6);
    assert_eq!(report.remaining, 4);
    assert_eq!(report.evicted[0], entry(0).0);

    assert_eq!(cache.delete_oldest(&runtime).await.unwrap(), Some(entry(6).0));
    assert_eq!(runtime.len().await.unwrap(), 3);
}

/// Storage whose deletes can be made to fail.
struct FlakyDeletes {
    inner: MemoryStorage,
    fail: AtomicBool,
}

#[async_trait]
impl CacheStorage for FlakyDeletes {
    async fn open(&self, partition: &str) -> Result<(), CacheError> {
        self.inner.open(partition).await
    }

    async fn partitions(&self) -> Result<Vec<String>, CacheError> {
        self.inner.partitions().await
    }

    async fn delete_partition(&self, partition: &str) -> Result<bool, CacheError> {
        self.inner.delete_partition(partition).await
    }

    async fn get(
        &self,
        partition: &str,
        key: &RequestKey,
    ) -> Result<Option<StoredResponse>, CacheError> {
        self.inner.get(partition, key).await
    }

    async fn put(
        &self,
        partition: &str,
        key: RequestKey,
        response: StoredResponse,
    ) -> Result<(), CacheError> {
        self.inner.put(partition, key, response).await
    }

    async fn put_all(
        &self,
        partition: &str,
        entries: Vec<(RequestKey, StoredResponse)>,
    ) -> Result<(), CacheError> {
        self.inner.put_all(partition, entries).await
    }

    async fn delete(&self, partition: &str, key: &RequestKey) -> Result<bool, CacheError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CacheError::Io(std::io::Error::other("device busy")));
        }
        self.inner.delete(partition, key).await
    }

    async fn keys(&self, partition: &str) -> Result<Vec<RequestKey>, CacheError> {
        self.inner.keys(partition).await
    }
}

#[tokio::test]
async fn test_failed_delete_keeps_write_and_is_retried_later() {
    let storage = Arc::new(FlakyDeletes {
        inner: MemoryStorage::new(),
        fail: AtomicBool::new(true),
    });
    let config = CacheConfig {
        max_runtime_entries: 2,
        ..Default::default()
    };
    let metrics = Metrics::new().unwrap();
    let cache = CacheStoreManager::new(storage.clone(), &config).with_metrics(metrics.clone());

    for i in 0..3 {
        let (k, v) = entry(i);
        assert!(cache.put_runtime(k, v).await);
    }
    // The third write landed; only its trim failed.
    assert_eq!(storage.len(cache.runtime_name()).await.unwrap(), 3);
    assert_eq!(metrics.runtime_writes.get(), 3);
    assert_eq!(metrics.write_failures.get(), 0);
    assert_eq!(metrics.eviction_failures.get(), 1);

    let direct = Evictor::new(2).enforce_limit(storage.as_ref(), cache.runtime_name()).await;
    assert!(direct.is_err());

    storage.fail.store(false, Ordering::SeqCst);
    let (k, v) = entry(3);
    assert!(cache.put_runtime(k, v).await);
    let keys = storage.keys(cache.runtime_name()).await.unwrap();
    assert_eq!(keys, vec![entry(2).0, entry(3).0]);
    assert_eq!(metrics.evictions.get(), 2);
}
