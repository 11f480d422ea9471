//! Versioned cache partitions.
//!
//! This module contains the cache data structures and policies:
//! - [`entry`]: RequestKey and StoredResponse snapshots
//! - [`storage`]: the CacheStorage capability and the in-memory backend
//! - [`disk`]: persistent backend (zstd-compressed bodies)
//! - [`evictor`]: FIFO eviction by insertion order
//! - [`manifest`]: the static asset list
//! - [`manager`]: partition ownership, runtime writes, pre-cache, purge

pub mod disk;
pub mod entry;
pub mod evictor;
pub mod manager;
pub mod manifest;
pub mod storage;
