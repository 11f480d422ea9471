//! Disk-backed cache storage.
//!
//! Persists partitions across restarts. Layout under the storage root:
//!
//! ```text
//! <root>/<partition>/partition.json          creation order marker
//! <root>/<partition>/<seq>.json              entry metadata (key, status, headers)
//! <root>/<partition>/<seq>.body              zstd-compressed body
//! ```
//!
//! The metadata file is written after the body, through a temporary file
//! renamed into place, and acts as the commit marker. On load, bodies
//! without metadata, unreadable metadata and stray temporary files are
//! discarded.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cache::entry::{RequestKey, StoredResponse};
use crate::cache::storage::{CacheError, CacheStorage, OrderedEntries};

const PARTITION_MARKER: &str = "partition.json";
const TEMP_SUFFIX: &str = "tmp";

#[derive(Debug, Serialize, Deserialize)]
struct PartitionMarker {
    name: String,
    created: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntryMeta {
    key: RequestKey,
    status: u16,
    headers: Vec<(String, String)>,
}

struct DiskPartition {
    name: String,
    dir: PathBuf,
    created: u64,
    entries: OrderedEntries<EntryMeta>,
}

impl DiskPartition {
    fn meta_path(&self, seq: u64) -> PathBuf {
        self.dir.join(format!("{seq:020}.json"))
    }

    fn body_path(&self, seq: u64) -> PathBuf {
        self.dir.join(format!("{seq:020}.body"))
    }

    fn temp_meta_path(&self, seq: u64) -> PathBuf {
        self.dir.join(format!("{seq:020}.json.{TEMP_SUFFIX}"))
    }
}

struct DiskState {
    partitions: Vec<DiskPartition>,
    next_created: u64,
}

/// Storage backend persisting partitions under a root directory.
pub struct DiskStorage {
    root: PathBuf,
    zstd_level: i32,
    state: Mutex<DiskState>,
}

fn validate_name(name: &str) -> Result<(), CacheError> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(CacheError::InvalidPartitionName(name.to_string()))
    }
}

async fn remove_if_exists(path: &Path) -> Result<(), CacheError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Best-effort removal of a leftover file; failures are logged.
async fn discard(path: &Path) {
    if let Err(e) = remove_if_exists(path).await {
        warn!(path = %path.display(), error = %e, "Failed to remove cache file");
    }
}

impl DiskStorage {
    /// Open the storage root, creating it if needed, and load every
    /// persisted partition.
    pub async fn open_root(root: impl Into<PathBuf>, zstd_level: i32) -> Result<Self, CacheError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;

        let mut partitions = Vec::new();
        let mut dirs = fs::read_dir(&root).await?;
        while let Some(dir) = dirs.next_entry().await? {
            if !dir.metadata().await?.is_dir() {
                continue;
            }
            match Self::load_partition(&dir.path()).await {
                Ok(Some(partition)) => partitions.push(partition),
                Ok(None) => {}
                Err(e) => warn!(path = %dir.path().display(), error = %e, "Skipping unreadable partition"),
            }
        }
        partitions.sort_by_key(|p| p.created);
        let next_created = partitions.last().map_or(0, |p| p.created + 1);

        info!(
            root = %root.display(),
            partitions = partitions.len(),
            entries = partitions.iter().map(|p| p.entries.len()).sum::<usize>(),
            "Loaded persisted cache partitions"
        );

        Ok(Self {
            root,
            zstd_level,
            state: Mutex::new(DiskState {
                partitions,
                next_created,
            }),
        })
    }

    async fn load_partition(dir: &Path) -> Result<Option<DiskPartition>, CacheError> {
        let marker = match fs::read(dir.join(PARTITION_MARKER)).await {
            Ok(data) => serde_json::from_slice::<PartitionMarker>(&data)?,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut partition = DiskPartition {
            name: marker.name,
            dir: dir.to_path_buf(),
            created: marker.created,
            entries: OrderedEntries::new(),
        };

        let mut metas = Vec::new();
        let mut bodies = Vec::new();
        let mut files = fs::read_dir(dir).await?;
        while let Some(file) = files.next_entry().await? {
            let path = file.path();
            let extension = path.extension().and_then(|e| e.to_str());
            if extension == Some(TEMP_SUFFIX) {
                debug!(path = %path.display(), "Removing interrupted metadata write");
                discard(&path).await;
                continue;
            }
            let Some(seq) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            else {
                continue;
            };
            match extension {
                Some("json") => match serde_json::from_slice::<EntryMeta>(&fs::read(&path).await?) {
                    Ok(meta) => metas.push((seq, meta)),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Discarding unreadable entry metadata");
                        discard(&path).await;
                    }
                },
                Some("body") => bodies.push((seq, path)),
                _ => {}
            }
        }

        // Ascending replay: a key persisted twice keeps its newest sequence.
        metas.sort_by_key(|(seq, _)| *seq);
        for (seq, meta) in metas {
            let key = meta.key.clone();
            if let Some((stale, _)) = partition.entries.insert_at(seq, key, meta) {
                discard(&partition.meta_path(stale)).await;
            }
        }

        let committed: HashSet<u64> = partition
            .entries
            .keys()
            .filter_map(|k| partition.entries.seq_of(k))
            .collect();
        for (seq, path) in bodies {
            if !committed.contains(&seq) {
                debug!(path = %path.display(), "Removing uncommitted body");
                discard(&path).await;
            }
        }

        Ok(Some(partition))
    }

    fn partition_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    async fn ensure_partition<'a>(
        &self,
        state: &'a mut DiskState,
        name: &str,
    ) -> Result<&'a mut DiskPartition, CacheError> {
        validate_name(name)?;
        if let Some(pos) = state.partitions.iter().position(|p| p.name == name) {
            return Ok(&mut state.partitions[pos]);
        }

        let dir = self.partition_dir(name);
        // Leftovers of a partition that failed to load are not reused.
        if fs::try_exists(&dir).await? {
            warn!(partition = name, path = %dir.display(), "Clearing unloaded partition directory");
            fs::remove_dir_all(&dir).await?;
        }
        fs::create_dir_all(&dir).await?;
        let marker = PartitionMarker {
            name: name.to_string(),
            created: state.next_created,
        };
        fs::write(dir.join(PARTITION_MARKER), serde_json::to_vec(&marker)?).await?;
        debug!(partition = name, "Created partition");

        state.next_created += 1;
        state.partitions.push(DiskPartition {
            name: name.to_string(),
            dir,
            created: marker.created,
            entries: OrderedEntries::new(),
        });
        let last = state.partitions.len() - 1;
        Ok(&mut state.partitions[last])
    }

    /// Write body then metadata for one entry at `seq`.
    async fn write_entry(
        &self,
        partition: &DiskPartition,
        seq: u64,
        meta: &EntryMeta,
        body: &[u8],
    ) -> Result<(), CacheError> {
        let compressed = zstd::encode_all(body, self.zstd_level)?;
        fs::write(partition.body_path(seq), &compressed).await?;
        let temp = partition.temp_meta_path(seq);
        fs::write(&temp, serde_json::to_vec(meta)?).await?;
        fs::rename(&temp, partition.meta_path(seq)).await?;
        Ok(())
    }

    async fn remove_entry_files(partition: &DiskPartition, seq: u64) -> Result<(), CacheError> {
        remove_if_exists(&partition.meta_path(seq)).await?;
        remove_if_exists(&partition.temp_meta_path(seq)).await?;
        remove_if_exists(&partition.body_path(seq)).await
    }
}

fn split(response: StoredResponse, key: RequestKey) -> (EntryMeta, bytes::Bytes) {
    (
        EntryMeta {
            key,
            status: response.status,
            headers: response.headers,
        },
        response.body,
    )
}

#[async_trait]
impl CacheStorage for DiskStorage {
    async fn open(&self, partition: &str) -> Result<(), CacheError> {
        let mut state = self.state.lock().await;
        self.ensure_partition(&mut state, partition).await?;
        Ok(())
    }

    async fn partitions(&self) -> Result<Vec<String>, CacheError> {
        let state = self.state.lock().await;
        Ok(state.partitions.iter().map(|p| p.name.clone()).collect())
    }

    async fn delete_partition(&self, partition: &str) -> Result<bool, CacheError> {
        let mut state = self.state.lock().await;
        let Some(pos) = state.partitions.iter().position(|p| p.name == partition) else {
            return Ok(false);
        };
        fs::remove_dir_all(&state.partitions[pos].dir).await?;
        state.partitions.remove(pos);
        Ok(true)
    }

    async fn get(
        &self,
        partition: &str,
        key: &RequestKey,
    ) -> Result<Option<StoredResponse>, CacheError> {
        let (path, meta) = {
            let state = self.state.lock().await;
            let Some(p) = state.partitions.iter().find(|p| p.name == partition) else {
                return Ok(None);
            };
            let (Some(seq), Some(meta)) = (p.entries.seq_of(key), p.entries.get(key)) else {
                return Ok(None);
            };
            (p.body_path(seq), meta.clone())
        };

        // A concurrent overwrite or delete may remove the body once the
        // lock is released; that reads as a miss.
        let compressed = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let body = zstd::decode_all(compressed.as_slice())?;
        Ok(Some(StoredResponse::new(meta.status, meta.headers, body)))
    }

    async fn put(
        &self,
        partition: &str,
        key: RequestKey,
        response: StoredResponse,
    ) -> Result<(), CacheError> {
        self.put_all(partition, vec![(key, response)]).await
    }

    async fn put_all(
        &self,
        partition: &str,
        entries: Vec<(RequestKey, StoredResponse)>,
    ) -> Result<(), CacheError> {
        let mut state = self.state.lock().await;
        let p = self.ensure_partition(&mut state, partition).await?;

        let mut seq = p.entries.next_seq();
        let mut staged: Vec<(u64, EntryMeta)> = Vec::with_capacity(entries.len());
        for (key, response) in entries {
            let (meta, body) = split(response, key);
            if let Err(e) = self.write_entry(p, seq, &meta, &body).await {
                // Roll back every file of this batch before reporting.
                for written in staged.iter().map(|(s, _)| *s).chain(std::iter::once(seq)) {
                    if let Err(cleanup) = Self::remove_entry_files(p, written).await {
                        warn!(partition, seq = written, error = %cleanup, "Failed to roll back staged entry");
                    }
                }
                return Err(e);
            }
            staged.push((seq, meta));
            seq += 1;
        }

        for (seq, meta) in staged {
            let key = meta.key.clone();
            if let Some((old_seq, _)) = p.entries.insert_at(seq, key, meta) {
                if let Err(e) = Self::remove_entry_files(p, old_seq).await {
                    warn!(partition, seq = old_seq, error = %e, "Failed to remove replaced entry files");
                }
            }
        }
        Ok(())
    }

    async fn delete(&self, partition: &str, key: &RequestKey) -> Result<bool, CacheError> {
        let mut state = self.state.lock().await;
        let Some(p) = state.partitions.iter_mut().find(|p| p.name == partition) else {
            return Ok(false);
        };
        let Some((seq, _)) = p.entries.remove(key) else {
            return Ok(false);
        };
        Self::remove_entry_files(p, seq).await?;
        Ok(true)
    }

    async fn keys(&self, partition: &str) -> Result<Vec<RequestKey>, CacheError> {
        let state = self.state.lock().await;
        Ok(state
            .partitions
            .iter()
            .find(|p| p.name == partition)
            .map(|p| p.entries.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn len(&self, partition: &str) -> Result<usize, CacheError> {
        let state = self.state.lock().await;
        Ok(state
            .partitions
            .iter()
            .find(|p| p.name == partition)
            .map_or(0, |p| p.entries.len()))
    }
}
