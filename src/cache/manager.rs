//! Cache store manager: owns the static and runtime partitions.
//!
//! The manager is the only component that writes to storage. It:
//! - Opens partitions by name (idempotent)
//! - Performs cross-partition lookups in partition creation order
//! - Writes runtime entries best-effort and enforces the FIFO bound
//! - Pre-caches the asset manifest atomically at install
//! - Purges partitions whose names are no longer current at activation

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::try_join_all;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::entry::{RequestKey, StoredResponse};
use crate::cache::evictor::{EvictionReport, Evictor};
use crate::cache::manifest::{AssetManifest, ManifestError};
use crate::cache::storage::{CacheError, CacheStorage};
use crate::config::CacheConfig;
use crate::metrics::Metrics;
use crate::net::fetcher::{FetchError, Fetcher};

#[derive(Error, Debug)]
pub enum PrecacheError {
    #[error("Invalid manifest: {0}")]
    Manifest(#[from] ManifestError),

    #[error("Failed to fetch {path}: {source}")]
    Fetch {
        path: String,
        #[source]
        source: FetchError,
    },

    #[error("Asset {path} answered with status {status}")]
    BadStatus { path: String, status: u16 },

    #[error("Failed to write static partition: {0}")]
    Cache(#[from] CacheError),
}

/// Handle on one named partition.
#[derive(Clone)]
pub struct Partition {
    name: String,
    storage: Arc<dyn CacheStorage>,
}

impl Partition {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up an entry. Storage errors are logged and read as a miss.
    pub async fn lookup(&self, key: &RequestKey) -> Option<StoredResponse> {
        match self.storage.get(&self.name, key).await {
            Ok(found) => found,
            Err(e) => {
                warn!(partition = %self.name, key = %key, error = %e, "Cache read failed");
                None
            }
        }
    }

    pub async fn keys(&self) -> Result<Vec<RequestKey>, CacheError> {
        self.storage.keys(&self.name).await
    }

    pub async fn len(&self) -> Result<usize, CacheError> {
        self.storage.len(&self.name).await
    }

    pub async fn delete(&self, key: &RequestKey) -> Result<bool, CacheError> {
        self.storage.delete(&self.name, key).await
    }
}

/// Owns partition naming, runtime bounds and write policy.
pub struct CacheStoreManager {
    storage: Arc<dyn CacheStorage>,
    static_name: String,
    runtime_name: String,
    evictor: Evictor,
    metrics: Option<Metrics>,
}

impl CacheStoreManager {
    pub fn new(storage: Arc<dyn CacheStorage>, config: &CacheConfig) -> Self {
        Self {
            storage,
            static_name: config.static_partition(),
            runtime_name: config.runtime_partition(),
            evictor: Evictor::new(config.max_runtime_entries),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn storage(&self) -> &Arc<dyn CacheStorage> {
        &self.storage
    }

    pub fn static_name(&self) -> &str {
        &self.static_name
    }

    pub fn runtime_name(&self) -> &str {
        &self.runtime_name
    }

    pub fn max_runtime_entries(&self) -> usize {
        self.evictor.max_entries()
    }

    /// Open a partition, creating it if absent.
    pub async fn open(&self, name: &str) -> Result<Partition, CacheError> {
        self.storage.open(name).await?;
        Ok(Partition {
            name: name.to_string(),
            storage: self.storage.clone(),
        })
    }

    /// Search every partition in creation order; first hit wins.
    pub async fn lookup_any(&self, key: &RequestKey) -> Option<StoredResponse> {
        let partitions = match self.storage.partitions().await {
            Ok(p) => p,
            Err(e) => {
                warn!(key = %key, error = %e, "Cannot list partitions for lookup");
                return None;
            }
        };
        for name in partitions {
            match self.storage.get(&name, key).await {
                Ok(Some(found)) => return Some(found),
                Ok(None) => {}
                Err(e) => warn!(partition = %name, key = %key, error = %e, "Cache read failed"),
            }
        }
        None
    }

    /// Store a snapshot, replacing any entry for the key. Writes to the
    /// runtime partition run the eviction check afterwards; a failed trim
    /// leaves the write in place and is retried by the next write.
    pub async fn put(
        &self,
        partition: &Partition,
        key: RequestKey,
        response: StoredResponse,
    ) -> Result<(), CacheError> {
        if response.status == 206 {
            return Err(CacheError::PartialContent(key));
        }
        self.storage.put(&partition.name, key, response).await?;
        if partition.name == self.runtime_name {
            if let Err(e) = self.enforce_limit(partition, self.evictor.max_entries()).await {
                if let Some(m) = &self.metrics {
                    m.eviction_failures.inc();
                }
                debug!(partition = %partition.name, error = %e, "Eviction deferred to next write");
            }
        }
        Ok(())
    }

    /// Remove the least-recently inserted entry of a partition.
    pub async fn delete_oldest(&self, partition: &Partition) -> Result<Option<RequestKey>, CacheError> {
        Evictor::delete_oldest(self.storage.as_ref(), &partition.name).await
    }

    /// Evict oldest-first until the partition holds at most `max_entries`.
    pub async fn enforce_limit(
        &self,
        partition: &Partition,
        max_entries: usize,
    ) -> Result<EvictionReport, CacheError> {
        let evictor = if max_entries == self.evictor.max_entries() {
            self.evictor
        } else {
            Evictor::new(max_entries)
        };
        let report = evictor
            .enforce_limit(self.storage.as_ref(), &partition.name)
            .await?;
        if !report.evicted.is_empty() {
            if let Some(m) = &self.metrics {
                m.evictions.inc_by(report.evicted.len() as u64);
            }
            debug!(
                partition = %partition.name,
                evicted = report.evicted.len(),
                remaining = report.remaining,
                "Runtime partition trimmed"
            );
        }
        Ok(report)
    }

    /// Persist a response to the runtime partition. Never fails: any
    /// storage error is recorded and dropped. Returns whether the write
    /// landed.
    pub async fn put_runtime(&self, key: RequestKey, response: StoredResponse) -> bool {
        let result = async {
            let runtime = self.open(&self.runtime_name).await?;
            self.put(&runtime, key.clone(), response).await
        }
        .await;

        match result {
            Ok(()) => {
                if let Some(m) = &self.metrics {
                    m.runtime_writes.inc();
                }
                true
            }
            Err(e) => {
                if let Some(m) = &self.metrics {
                    m.write_failures.inc();
                }
                debug!(key = %key, error = %e, "Runtime cache write dropped");
                false
            }
        }
    }

    /// Delete every partition whose name is not in `known`. Returns the
    /// names deleted.
    pub async fn purge_unknown_partitions(
        &self,
        known: &HashSet<String>,
    ) -> Result<Vec<String>, CacheError> {
        let mut deleted = Vec::new();
        for name in self.storage.partitions().await? {
            if known.contains(&name) {
                continue;
            }
            match self.storage.delete_partition(&name).await {
                Ok(true) => deleted.push(name),
                Ok(false) => {}
                Err(e) => warn!(partition = %name, error = %e, "Failed to delete stale partition"),
            }
        }
        if !deleted.is_empty() {
            info!(deleted = ?deleted, "Purged stale partitions");
        }
        Ok(deleted)
    }

    /// Populate the static partition with every manifest asset, or with
    /// none of them.
    pub async fn precache(
        &self,
        manifest: &AssetManifest,
        origin: &Url,
        fetcher: &dyn Fetcher,
    ) -> Result<usize, PrecacheError> {
        let requests = manifest.requests(origin)?;
        let static_partition = self.open(&self.static_name).await?;

        let fetches = requests.iter().map(|request| async move {
            let path = request.url.path().to_string();
            let response = fetcher
                .fetch(request)
                .await
                .map_err(|source| PrecacheError::Fetch {
                    path: path.clone(),
                    source,
                })?;
            if !response.is_ok() {
                return Err(PrecacheError::BadStatus {
                    path,
                    status: response.status,
                });
            }
            Ok::<_, PrecacheError>((request.key(), response))
        });
        let entries = try_join_all(fetches).await?;
        let count = entries.len();

        self.storage.put_all(static_partition.name(), entries).await?;
        info!(
            partition = %self.static_name,
            assets = count,
            "Static partition populated"
        );
        Ok(count)
    }

    /// Entry count of every partition, in creation order.
    pub async fn partition_sizes(&self) -> Result<Vec<(String, usize)>, CacheError> {
        let mut sizes = Vec::new();
        for name in self.storage.partitions().await? {
            let len = self.storage.len(&name).await?;
            sizes.push((name, len));
        }
        Ok(sizes)
    }
}
