//! Eviction policy: FIFO by insertion order.
//!
//! Reads never refresh an entry's position; only a write does (a re-put
//! moves the key to the newest slot). The enforcement loop is bounded by
//! the excess observed when it starts.

use tracing::{debug, warn};

use crate::cache::entry::RequestKey;
use crate::cache::storage::{CacheError, CacheStorage};

/// Outcome of one enforcement cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Keys removed, oldest first.
    pub evicted: Vec<RequestKey>,
    /// Entry count when the cycle finished.
    pub remaining: usize,
}

/// FIFO eviction over one partition.
#[derive(Debug, Clone, Copy)]
pub struct Evictor {
    max_entries: usize,
}

impl Evictor {
    pub fn new(max_entries: usize) -> Self {
        Self { max_entries }
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Remove the single least-recently inserted entry.
    pub async fn delete_oldest(
        storage: &dyn CacheStorage,
        partition: &str,
    ) -> Result<Option<RequestKey>, CacheError> {
        let Some(oldest) = storage.oldest(partition).await? else {
            return Ok(None);
        };
        storage.delete(partition, &oldest).await?;
        debug!(partition, key = %oldest, "Evicted oldest entry");
        Ok(Some(oldest))
    }

    /// Delete oldest entries until the partition holds at most
    /// `max_entries`.
    ///
    /// Runs at most `count - max_entries` deletions, using the count seen
    /// on entry. A failed delete aborts the cycle; the next write retries.
    pub async fn enforce_limit(
        &self,
        storage: &dyn CacheStorage,
        partition: &str,
    ) -> Result<EvictionReport, CacheError> {
        let count = storage.len(partition).await?;
        let budget = count.saturating_sub(self.max_entries);
        let mut report = EvictionReport {
            evicted: Vec::with_capacity(budget),
            remaining: count,
        };

        for _ in 0..budget {
            if storage.len(partition).await? <= self.max_entries {
                break;
            }
            match Self::delete_oldest(storage, partition).await {
                Ok(Some(key)) => report.evicted.push(key),
                Ok(None) => break,
                Err(e) => {
                    warn!(
                        partition,
                        evicted = report.evicted.len(),
                        error = %e,
                        "Eviction cycle aborted"
                    );
                    return Err(e);
                }
            }
        }

        report.remaining = storage.len(partition).await?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::StoredResponse;
    use crate::cache::storage::MemoryStorage;
    use url::Url;

    fn key(i: usize) -> RequestKey {
        RequestKey::get(&Url::parse(&format!("http://localhost/api/item/{i}")).unwrap())
    }

    #[tokio::test]
    async fn test_enforce_limit_removes_oldest_first() {
        let storage = MemoryStorage::new();
        for i in 0..5 {
            storage
                .put("runtime", key(i), StoredResponse::ok("application/json", "{}"))
                .await
                .unwrap();
        }

        let report = Evictor::new(3).enforce_limit(&storage, "runtime").await.unwrap();
        assert_eq!(report.evicted, vec![key(0), key(1)]);
        assert_eq!(report.remaining, 3);
        assert_eq!(storage.oldest("runtime").await.unwrap(), Some(key(2)));
    }

    #[tokio::test]
    async fn test_under_limit_is_noop() {
        let storage = MemoryStorage::new();
        storage
            .put("runtime", key(0), StoredResponse::ok("text/plain", "x"))
            .await
            .unwrap();

        let report = Evictor::new(3).enforce_limit(&storage, "runtime").await.unwrap();
        assert!(report.evicted.is_empty());
        assert_eq!(report.remaining, 1);
    }

    #[tokio::test]
    async fn test_delete_oldest_on_empty_partition() {
        let storage = MemoryStorage::new();
        let evicted = Evictor::delete_oldest(&storage, "missing").await.unwrap();
        assert!(evicted.is_none());
    }
}
