//! Cache storage capability.
//!
//! The host owns the actual storage; the core only talks to it through
//! [`CacheStorage`]. Partitions are named, keep their creation order, and
//! hold entries in insertion order (the order FIFO eviction follows).

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::cache::entry::{RequestKey, StoredResponse};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Entry metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("Storage quota exceeded ({limit} entries)")]
    QuotaExceeded { limit: usize },

    #[error("Partial-content response cannot be cached: {0}")]
    PartialContent(RequestKey),

    #[error("Invalid partition name: {0:?}")]
    InvalidPartitionName(String),

    #[error("Partition not found: {0}")]
    PartitionNotFound(String),
}

/// Per-partition storage operations provided by the host.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Create the partition if absent. Idempotent.
    async fn open(&self, partition: &str) -> Result<(), CacheError>;

    /// Existing partition names, in creation order.
    async fn partitions(&self) -> Result<Vec<String>, CacheError>;

    /// Delete a whole partition. Returns whether it existed.
    async fn delete_partition(&self, partition: &str) -> Result<bool, CacheError>;

    async fn get(
        &self,
        partition: &str,
        key: &RequestKey,
    ) -> Result<Option<StoredResponse>, CacheError>;

    /// Store an entry, replacing any entry with the same key. The written
    /// entry becomes the newest in insertion order.
    async fn put(
        &self,
        partition: &str,
        key: RequestKey,
        response: StoredResponse,
    ) -> Result<(), CacheError>;

    /// Store a batch atomically: either every entry is written or none is.
    async fn put_all(
        &self,
        partition: &str,
        entries: Vec<(RequestKey, StoredResponse)>,
    ) -> Result<(), CacheError>;

    /// Delete one entry. Returns whether it existed.
    async fn delete(&self, partition: &str, key: &RequestKey) -> Result<bool, CacheError>;

    /// Entry keys, oldest insertion first.
    async fn keys(&self, partition: &str) -> Result<Vec<RequestKey>, CacheError>;

    async fn len(&self, partition: &str) -> Result<usize, CacheError> {
        Ok(self.keys(partition).await?.len())
    }

    /// The least-recently inserted key.
    async fn oldest(&self, partition: &str) -> Result<Option<RequestKey>, CacheError> {
        Ok(self.keys(partition).await?.into_iter().next())
    }
}

/// Entries of one partition, indexed by key and ordered by insertion sequence.
#[derive(Debug)]
pub struct OrderedEntries<V> {
    next_seq: u64,
    index: HashMap<RequestKey, u64>,
    order: BTreeMap<u64, (RequestKey, V)>,
}

impl<V> Default for OrderedEntries<V> {
    fn default() -> Self {
        Self {
            next_seq: 0,
            index: HashMap::new(),
            order: BTreeMap::new(),
        }
    }
}

impl<V> OrderedEntries<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert as the newest entry. Returns the assigned sequence number and
    /// the replaced value, if any.
    pub fn insert(&mut self, key: RequestKey, value: V) -> (u64, Option<(u64, V)>) {
        let seq = self.next_seq;
        let replaced = self.insert_at(seq, key, value);
        (seq, replaced)
    }

    /// Insert with an explicit sequence number (used when reloading
    /// persisted entries).
    pub fn insert_at(&mut self, seq: u64, key: RequestKey, value: V) -> Option<(u64, V)> {
        let replaced = self.remove(&key);
        self.next_seq = self.next_seq.max(seq + 1);
        self.index.insert(key.clone(), seq);
        self.order.insert(seq, (key, value));
        replaced
    }

    /// Sequence number the next [`insert`](Self::insert) will assign.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn get(&self, key: &RequestKey) -> Option<&V> {
        let seq = self.index.get(key)?;
        self.order.get(seq).map(|(_, v)| v)
    }

    pub fn seq_of(&self, key: &RequestKey) -> Option<u64> {
        self.index.get(key).copied()
    }

    pub fn remove(&mut self, key: &RequestKey) -> Option<(u64, V)> {
        let seq = self.index.remove(key)?;
        self.order.remove(&seq).map(|(_, v)| (seq, v))
    }

    pub fn oldest(&self) -> Option<&RequestKey> {
        self.order.values().next().map(|(k, _)| k)
    }

    pub fn keys(&self) -> impl Iterator<Item = &RequestKey> {
        self.order.values().map(|(k, _)| k)
    }

    pub fn contains(&self, key: &RequestKey) -> bool {
        self.index.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// In-memory storage backend.
///
/// An optional quota caps the total number of entries across partitions;
/// writes beyond it fail with [`CacheError::QuotaExceeded`].
pub struct MemoryStorage {
    partitions: RwLock<Vec<(String, OrderedEntries<StoredResponse>)>>,
    quota: Option<usize>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            partitions: RwLock::new(Vec::new()),
            quota: None,
        }
    }

    pub fn with_quota(max_entries: usize) -> Self {
        Self {
            quota: Some(max_entries),
            ..Self::new()
        }
    }

    fn check_quota(
        &self,
        partitions: &[(String, OrderedEntries<StoredResponse>)],
        partition: &str,
        incoming: &[&RequestKey],
    ) -> Result<(), CacheError> {
        let Some(limit) = self.quota else {
            return Ok(());
        };
        let current: usize = partitions.iter().map(|(_, e)| e.len()).sum();
        let target = partitions.iter().find(|(n, _)| n == partition).map(|(_, e)| e);
        let added = incoming
            .iter()
            .filter(|k| !target.is_some_and(|e| e.contains(k)))
            .count();
        if current + added > limit {
            return Err(CacheError::QuotaExceeded { limit });
        }
        Ok(())
    }
}

fn find_mut<'a>(
    partitions: &'a mut Vec<(String, OrderedEntries<StoredResponse>)>,
    name: &str,
) -> &'a mut OrderedEntries<StoredResponse> {
    let pos = match partitions.iter().position(|(n, _)| n == name) {
        Some(pos) => pos,
        None => {
            partitions.push((name.to_string(), OrderedEntries::new()));
            partitions.len() - 1
        }
    };
    &mut partitions[pos].1
}

#[async_trait]
impl CacheStorage for MemoryStorage {
    async fn open(&self, partition: &str) -> Result<(), CacheError> {
        let mut partitions = self.partitions.write().await;
        find_mut(&mut partitions, partition);
        Ok(())
    }

    async fn partitions(&self) -> Result<Vec<String>, CacheError> {
        let partitions = self.partitions.read().await;
        Ok(partitions.iter().map(|(n, _)| n.clone()).collect())
    }

    async fn delete_partition(&self, partition: &str) -> Result<bool, CacheError> {
        let mut partitions = self.partitions.write().await;
        let before = partitions.len();
        partitions.retain(|(n, _)| n != partition);
        Ok(partitions.len() != before)
    }

    async fn get(
        &self,
        partition: &str,
        key: &RequestKey,
    ) -> Result<Option<StoredResponse>, CacheError> {
        let partitions = self.partitions.read().await;
        Ok(partitions
            .iter()
            .find(|(n, _)| n == partition)
            .and_then(|(_, e)| e.get(key).cloned()))
    }

    async fn put(
        &self,
        partition: &str,
        key: RequestKey,
        response: StoredResponse,
    ) -> Result<(), CacheError> {
        let mut partitions = self.partitions.write().await;
        self.check_quota(&partitions, partition, &[&key])?;
        find_mut(&mut partitions, partition).insert(key, response);
        Ok(())
    }

    async fn put_all(
        &self,
        partition: &str,
        entries: Vec<(RequestKey, StoredResponse)>,
    ) -> Result<(), CacheError> {
        let mut partitions = self.partitions.write().await;
        let keys: Vec<&RequestKey> = entries.iter().map(|(k, _)| k).collect();
        self.check_quota(&partitions, partition, &keys)?;
        let target = find_mut(&mut partitions, partition);
        for (key, response) in entries {
            target.insert(key, response);
        }
        Ok(())
    }

    async fn delete(&self, partition: &str, key: &RequestKey) -> Result<bool, CacheError> {
        let mut partitions = self.partitions.write().await;
        Ok(partitions
            .iter_mut()
            .find(|(n, _)| n == partition)
            .is_some_and(|(_, e)| e.remove(key).is_some()))
    }

    async fn keys(&self, partition: &str) -> Result<Vec<RequestKey>, CacheError> {
        let partitions = self.partitions.read().await;
        Ok(partitions
            .iter()
            .find(|(n, _)| n == partition)
            .map(|(_, e)| e.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn len(&self, partition: &str) -> Result<usize, CacheError> {
        let partitions = self.partitions.read().await;
        Ok(partitions
            .iter()
            .find(|(n, _)| n == partition)
            .map_or(0, |(_, e)| e.len()))
    }

    async fn oldest(&self, partition: &str) -> Result<Option<RequestKey>, CacheError> {
        let partitions = self.partitions.read().await;
        Ok(partitions
            .iter()
            .find(|(n, _)| n == partition)
            .and_then(|(_, e)| e.oldest().cloned()))
    }
}
