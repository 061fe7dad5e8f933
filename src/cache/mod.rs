//! Lookup cache for key-to-mapping resolution.
//!
//! The cache is a handle owned by the manager and passed to the operation
//! engine, which invalidates entries after every committed change. Entries
//! are never trusted for writes; they only short-circuit `lookup`.

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;
use uuid::Uuid;

use crate::key::ShardKey;
use crate::mapping::Mapping;

pub trait LookupCache: Send + Sync {
    /// Cached mapping covering `key` in the given shard map.
    fn lookup(&self, shard_map_id: Uuid, key: &ShardKey) -> Option<Mapping>;

    fn insert(&self, mapping: &Mapping);

    fn invalidate_mapping(&self, mapping_id: Uuid);

    fn invalidate_shard_map(&self, shard_map_id: Uuid);
}

/// Cache that never holds anything.
pub struct NoCache;

impl LookupCache for NoCache {
    fn lookup(&self, _shard_map_id: Uuid, _key: &ShardKey) -> Option<Mapping> {
        None
    }

    fn insert(&self, _mapping: &Mapping) {}

    fn invalidate_mapping(&self, _mapping_id: Uuid) {}

    fn invalidate_shard_map(&self, _shard_map_id: Uuid) {}
}

/// In-memory cache keyed by shard map, ordered by range low bound.
#[derive(Default)]
pub struct MappingCache {
    maps: DashMap<Uuid, BTreeMap<ShardKey, Mapping>>,
    /// mapping id -> (shard map id, low bound)
    index: DashMap<Uuid, (Uuid, ShardKey)>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MappingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// (hits, misses) since creation.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

impl LookupCache for MappingCache {
    fn lookup(&self, shard_map_id: Uuid, key: &ShardKey) -> Option<Mapping> {
        let found = self.maps.get(&shard_map_id).and_then(|entries| {
            if entries
                .keys()
                .next()
                .map_or(false, |low| low.key_type() != key.key_type())
            {
                return None;
            }
            entries
                .range(..=key.clone())
                .next_back()
                .map(|(_, m)| m)
                .filter(|m| m.range.contains(key))
                .cloned()
        });
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    fn insert(&self, mapping: &Mapping) {
        self.invalidate_mapping(mapping.id);
        let low = mapping.range.low().clone();
        let mut entries = self.maps.entry(mapping.shard_map_id).or_default();
        // A cached neighbour with the same low bound is stale by definition.
        if let Some(old) = entries.insert(low.clone(), mapping.clone()) {
            self.index.remove(&old.id);
        }
        self.index.insert(mapping.id, (mapping.shard_map_id, low));
    }

    fn invalidate_mapping(&self, mapping_id: Uuid) {
        if let Some((_, (shard_map_id, low))) = self.index.remove(&mapping_id) {
            if let Some(mut entries) = self.maps.get_mut(&shard_map_id) {
                entries.remove(&low);
            }
            trace!(mapping_id = %mapping_id, "Invalidated cached mapping");
        }
    }

    fn invalidate_shard_map(&self, shard_map_id: Uuid) {
        if let Some((_, entries)) = self.maps.remove(&shard_map_id) {
            for mapping in entries.values() {
                self.index.remove(&mapping.id);
            }
            trace!(shard_map_id = %shard_map_id, "Invalidated cached shard map");
        }
    }
}
