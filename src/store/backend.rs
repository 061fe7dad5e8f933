//! Sled-backed shard map stores.
//!
//! Each scope (the global map and every shard's local map) is one sled
//! database with four trees:
//! - `shard_maps`: shard map records keyed by id
//! - `shards`: shard records keyed by id
//! - `mappings`: mapping records keyed by id
//! - `operations`: operation log entries keyed by id (global store only)
//!
//! Values are bincode-encoded. Transactions are serialized by a mutex so
//! compare-then-write is atomic, and the staged writes of one transaction are
//! committed to all trees in a single sled transaction.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    Compare, ConflictKind, MapStore, Query, Rows, StoreEntity, StoreError, StoreOp,
    StoreProvider, StoreResult, StoreScope,
};
use crate::mapping::{LockOwnerId, Mapping, Shard, ShardMap};
use crate::operation::OperationLogEntry;

/// Configuration for sled-backed stores.
#[derive(Clone, Debug)]
pub struct BackendConfig {
    /// Root directory; the global store and each local store get their own
    /// subdirectory.
    pub data_dir: PathBuf,

    /// Use throwaway in-memory databases instead of `data_dir`.
    pub temporary: bool,

    /// Flush interval in milliseconds. How often sled flushes dirty pages to disk.
    pub flush_interval_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            temporary: false,
            flush_interval_ms: 1000,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum Family {
    ShardMaps,
    Shards,
    Mappings,
    Operations,
}

/// One global or local store backed by a sled database.
pub struct SledStore {
    scope: StoreScope,

    db: sled::Db,

    shard_maps_tree: sled::Tree,
    shards_tree: sled::Tree,
    mappings_tree: sled::Tree,
    operations_tree: sled::Tree,

    /// Serializes transactions so guards and writes see the same state.
    write_lock: Mutex<()>,
}

impl SledStore {
    /// Opens (or creates) the store for `scope` at `path`.
    pub fn open(scope: StoreScope, path: Option<PathBuf>, flush_interval_ms: u64) -> StoreResult<Arc<Self>> {
        let mut config = sled::Config::new().flush_every_ms(Some(flush_interval_ms));
        match &path {
            Some(path) => {
                debug!("Opening {} store at {:?}", scope, path);
                std::fs::create_dir_all(path)?;
                config = config.path(path);
            }
            None => {
                debug!("Opening temporary {} store", scope);
                config = config.temporary(true);
            }
        }

        let db = config.open().map_err(|e| {
            StoreError::Config(format!("Failed to open sled database for {}: {}", scope, e))
        })?;

        let shard_maps_tree = db.open_tree("shard_maps")?;
        let shards_tree = db.open_tree("shards")?;
        let mappings_tree = db.open_tree("mappings")?;
        let operations_tree = db.open_tree("operations")?;

        Ok(Arc::new(Self {
            scope,
            db,
            shard_maps_tree,
            shards_tree,
            mappings_tree,
            operations_tree,
            write_lock: Mutex::new(()),
        }))
    }

    fn tree(&self, family: Family) -> &sled::Tree {
        match family {
            Family::ShardMaps => &self.shard_maps_tree,
            Family::Shards => &self.shards_tree,
            Family::Mappings => &self.mappings_tree,
            Family::Operations => &self.operations_tree,
        }
    }

    fn get<T: DeserializeOwned>(&self, family: Family, id: Uuid) -> StoreResult<Option<T>> {
        match self.tree(family).get(id.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(&self, family: Family) -> StoreResult<Vec<T>> {
        let mut out = Vec::new();
        for item in self.tree(family).iter() {
            let (_k, v) = item?;
            out.push(bincode::deserialize(&v)?);
        }
        Ok(out)
    }

    /// Flushes all pending writes to disk.
    pub fn flush(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Approximate on-disk size in bytes.
    pub fn size(&self) -> u64 {
        self.db.size_on_disk().unwrap_or(0)
    }

    fn check(&self, compare: &Compare) -> StoreResult<()> {
        match compare {
            Compare::ShardMapExists(id) => {
                self.get::<ShardMap>(Family::ShardMaps, *id)?
                    .ok_or_else(|| StoreError::not_found(StoreEntity::ShardMap, id))?;
            }
            Compare::ShardMapNameFree(name) => {
                let taken = self
                    .scan::<ShardMap>(Family::ShardMaps)?
                    .into_iter()
                    .any(|m| &m.name == name);
                if taken {
                    return Err(StoreError::conflict(ConflictKind::ShardMapNameTaken, name.clone()));
                }
            }
            Compare::ShardMapHasNoShards(id) => {
                let has = self
                    .scan::<Shard>(Family::Shards)?
                    .into_iter()
                    .any(|s| s.shard_map_id == *id);
                if has {
                    return Err(StoreError::conflict(
                        ConflictKind::ShardMapHasShards,
                        id.to_string(),
                    ));
                }
            }
            Compare::ShardExists(id) => {
                self.get::<Shard>(Family::Shards, *id)?
                    .ok_or_else(|| StoreError::not_found(StoreEntity::Shard, id))?;
            }
            Compare::ShardAbsent(id) => {
                if self.get::<Shard>(Family::Shards, *id)?.is_some() {
                    return Err(StoreError::conflict(ConflictKind::AlreadyExists, id.to_string()));
                }
            }
            Compare::ShardVersion { shard_id, version } => {
                let shard = self
                    .get::<Shard>(Family::Shards, *shard_id)?
                    .ok_or_else(|| StoreError::not_found(StoreEntity::Shard, shard_id))?;
                if shard.version != *version {
                    return Err(StoreError::VersionMismatch(format!(
                        "shard {} is at version {}, expected {}",
                        shard_id, shard.version, version
                    )));
                }
            }
            Compare::ShardLocationFree {
                shard_map_id,
                location,
            } => {
                let taken = self
                    .scan::<Shard>(Family::Shards)?
                    .into_iter()
                    .any(|s| s.shard_map_id == *shard_map_id && &s.location == location);
                if taken {
                    return Err(StoreError::conflict(
                        ConflictKind::ShardLocationTaken,
                        location.to_string(),
                    ));
                }
            }
            Compare::NoMappingsOnShard(shard_id) => {
                let has = self
                    .scan::<Mapping>(Family::Mappings)?
                    .into_iter()
                    .any(|m| m.shard_id == *shard_id);
                if has {
                    return Err(StoreError::conflict(
                        ConflictKind::ShardHasMappings,
                        shard_id.to_string(),
                    ));
                }
            }
            Compare::MappingExists(id) => {
                self.get::<Mapping>(Family::Mappings, *id)?
                    .ok_or_else(|| StoreError::not_found(StoreEntity::Mapping, id))?;
            }
            Compare::MappingAbsent(id) => {
                if self.get::<Mapping>(Family::Mappings, *id)?.is_some() {
                    return Err(StoreError::conflict(ConflictKind::AlreadyExists, id.to_string()));
                }
            }
            Compare::MappingVersion {
                mapping_id,
                version,
            } => {
                let mapping = self.mapping(*mapping_id)?;
                if mapping.version != *version {
                    return Err(StoreError::VersionMismatch(format!(
                        "mapping {} is at version {}, expected {}",
                        mapping_id, mapping.version, version
                    )));
                }
            }
            Compare::MappingLockedBy { mapping_id, owner } => {
                let mapping = self.mapping(*mapping_id)?;
                if !owner.is_force() && mapping.lock_owner != *owner {
                    return Err(StoreError::conflict(
                        ConflictKind::LockOwnerMismatch,
                        format!(
                            "mapping {} is locked by {}, not {}",
                            mapping_id, mapping.lock_owner, owner
                        ),
                    ));
                }
            }
            Compare::MappingNotPending {
                mapping_id,
                operation_id,
            } => {
                let mapping = self.mapping(*mapping_id)?;
                match mapping.pending_operation {
                    Some(pending) if pending != *operation_id => {
                        return Err(StoreError::conflict(
                            ConflictKind::PendingOperation,
                            format!("mapping {} is being modified by operation {}", mapping_id, pending),
                        ));
                    }
                    _ => {}
                }
            }
            Compare::RangeFree {
                shard_map_id,
                range,
                ignoring,
            } => {
                let overlap = self
                    .scan::<Mapping>(Family::Mappings)?
                    .into_iter()
                    .find(|m| {
                        m.shard_map_id == *shard_map_id
                            && !ignoring.contains(&m.id)
                            && m.range.key_type() == range.key_type()
                            && m.range.intersects(range)
                    });
                if let Some(existing) = overlap {
                    return Err(StoreError::conflict(
                        ConflictKind::RangeOverlap,
                        format!("{} overlaps {}", range, existing.range),
                    ));
                }
            }
            Compare::OperationExists(id) => {
                self.get::<OperationLogEntry>(Family::Operations, *id)?
                    .ok_or_else(|| StoreError::not_found(StoreEntity::Operation, id))?;
            }
        }
        Ok(())
    }

    fn mapping(&self, id: Uuid) -> StoreResult<Mapping> {
        self.get::<Mapping>(Family::Mappings, id)?
            .ok_or_else(|| StoreError::not_found(StoreEntity::Mapping, id))
    }

    fn commit(&self, staged: Staged<'_>) -> StoreResult<()> {
        let mut batches: HashMap<Family, sled::Batch> = HashMap::new();
        for ((family, id), value) in staged.writes {
            let batch = batches.entry(family).or_default();
            match value {
                Some(bytes) => batch.insert(id.as_bytes().to_vec(), bytes),
                None => batch.remove(id.as_bytes().to_vec()),
            }
        }
        let take = |batches: &mut HashMap<Family, sled::Batch>, family: Family| {
            batches.remove(&family).unwrap_or_default()
        };
        let shard_maps = take(&mut batches, Family::ShardMaps);
        let shards = take(&mut batches, Family::Shards);
        let mappings = take(&mut batches, Family::Mappings);
        let operations = take(&mut batches, Family::Operations);

        (
            &self.shard_maps_tree,
            &self.shards_tree,
            &self.mappings_tree,
            &self.operations_tree,
        )
            .transaction(|(sm, sh, mp, op)| {
                sm.apply_batch(&shard_maps)?;
                sh.apply_batch(&shards)?;
                mp.apply_batch(&mappings)?;
                op.apply_batch(&operations)?;
                Ok::<(), ConflictableTransactionError<()>>(())
            })
            .map_err(|e: TransactionError<()>| match e {
                TransactionError::Storage(e) => StoreError::Sled(e),
                TransactionError::Abort(()) => {
                    StoreError::Config("sled transaction aborted".to_string())
                }
            })
    }
}

/// Writes of one transaction, visible to later ops of the same transaction.
struct Staged<'a> {
    store: &'a SledStore,
    writes: BTreeMap<(Family, Uuid), Option<Vec<u8>>>,
}

impl<'a> Staged<'a> {
    fn new(store: &'a SledStore) -> Self {
        Self {
            store,
            writes: BTreeMap::new(),
        }
    }

    fn get<T: DeserializeOwned>(&self, family: Family, id: Uuid) -> StoreResult<Option<T>> {
        match self.writes.get(&(family, id)) {
            Some(Some(bytes)) => Ok(Some(bincode::deserialize(bytes)?)),
            Some(None) => Ok(None),
            None => self.store.get(family, id),
        }
    }

    fn scan<T: DeserializeOwned>(&self, family: Family) -> StoreResult<Vec<(Uuid, T)>> {
        let mut merged: BTreeMap<Uuid, Vec<u8>> = BTreeMap::new();
        for item in self.store.tree(family).iter() {
            let (k, v) = item?;
            let id = Uuid::from_slice(&k)
                .map_err(|e| StoreError::Serialization(format!("bad record key: {}", e)))?;
            merged.insert(id, v.to_vec());
        }
        for ((f, id), value) in &self.writes {
            if *f != family {
                continue;
            }
            match value {
                Some(bytes) => {
                    merged.insert(*id, bytes.clone());
                }
                None => {
                    merged.remove(id);
                }
            }
        }
        merged
            .into_iter()
            .map(|(id, bytes)| Ok((id, bincode::deserialize(&bytes)?)))
            .collect()
    }

    fn put<T: Serialize>(&mut self, family: Family, id: Uuid, value: &T) -> StoreResult<()> {
        self.writes
            .insert((family, id), Some(bincode::serialize(value)?));
        Ok(())
    }

    fn delete(&mut self, family: Family, id: Uuid) {
        self.writes.insert((family, id), None);
    }

    fn apply(&mut self, op: StoreOp) -> StoreResult<()> {
        match op {
            StoreOp::PutShardMap(map) => self.put(Family::ShardMaps, map.id, &map)?,
            StoreOp::DeleteShardMap(id) => self.delete(Family::ShardMaps, id),
            StoreOp::PutShard(shard) => self.put(Family::Shards, shard.id, &shard)?,
            StoreOp::DeleteShard(id) => self.delete(Family::Shards, id),
            StoreOp::BumpShardVersion(id) => {
                let mut shard: Shard = self
                    .get(Family::Shards, id)?
                    .ok_or_else(|| StoreError::not_found(StoreEntity::Shard, id))?;
                shard.version += 1;
                self.put(Family::Shards, id, &shard)?;
            }
            StoreOp::PutMapping(mapping) => self.put(Family::Mappings, mapping.id, &mapping)?,
            StoreOp::DeleteMapping(id) => self.delete(Family::Mappings, id),
            StoreOp::DeleteMappingsForShard(shard_id) => {
                let doomed: Vec<Uuid> = self
                    .scan::<Mapping>(Family::Mappings)?
                    .into_iter()
                    .filter(|(_, m)| m.shard_id == shard_id)
                    .map(|(id, _)| id)
                    .collect();
                for id in doomed {
                    self.delete(Family::Mappings, id);
                }
            }
            StoreOp::SetMappingPending {
                mapping_id,
                operation_id,
            } => {
                // Absent mappings are skipped so undo stays idempotent.
                if let Some(mut mapping) = self.get::<Mapping>(Family::Mappings, mapping_id)? {
                    mapping.pending_operation = operation_id;
                    self.put(Family::Mappings, mapping_id, &mapping)?;
                }
            }
            StoreOp::SetMappingLockOwner { mapping_id, owner } => {
                let mut mapping: Mapping = self
                    .get(Family::Mappings, mapping_id)?
                    .ok_or_else(|| StoreError::not_found(StoreEntity::Mapping, mapping_id))?;
                mapping.lock_owner = owner;
                self.put(Family::Mappings, mapping_id, &mapping)?;
            }
            StoreOp::UnlockMappings {
                shard_map_id,
                owner,
            } => {
                let locked: Vec<(Uuid, Mapping)> = self
                    .scan::<Mapping>(Family::Mappings)?
                    .into_iter()
                    .filter(|(_, m)| m.shard_map_id == shard_map_id && !m.lock_owner.is_none())
                    .filter(|(_, m)| owner.map_or(true, |o| m.lock_owner == o))
                    .collect();
                for (id, mut mapping) in locked {
                    mapping.lock_owner = LockOwnerId::NONE;
                    self.put(Family::Mappings, id, &mapping)?;
                }
            }
            StoreOp::PutOperation(entry) => self.put(Family::Operations, entry.id, &entry)?,
            StoreOp::DeleteOperation(id) => self.delete(Family::Operations, id),
        }
        Ok(())
    }
}

impl MapStore for SledStore {
    fn scope(&self) -> &StoreScope {
        &self.scope
    }

    fn read(&self, query: Query) -> StoreResult<Rows> {
        let mut rows = Rows::default();
        match query {
            Query::ShardMaps => rows.shard_maps = self.scan(Family::ShardMaps)?,
            Query::ShardMapById(id) => rows.shard_maps.extend(self.get::<ShardMap>(Family::ShardMaps, id)?),
            Query::ShardMapByName(name) => {
                rows.shard_maps = self
                    .scan::<ShardMap>(Family::ShardMaps)?
                    .into_iter()
                    .filter(|m| m.name == name)
                    .collect();
            }
            Query::Shards { shard_map_id } => {
                rows.shards = self
                    .scan::<Shard>(Family::Shards)?
                    .into_iter()
                    .filter(|s| s.shard_map_id == shard_map_id)
                    .collect();
            }
            Query::ShardById(id) => rows.shards.extend(self.get::<Shard>(Family::Shards, id)?),
            Query::ShardByLocation {
                shard_map_id,
                location,
            } => {
                rows.shards = self
                    .scan::<Shard>(Family::Shards)?
                    .into_iter()
                    .filter(|s| s.location == location)
                    .filter(|s| shard_map_id.map_or(true, |id| s.shard_map_id == id))
                    .collect();
            }
            Query::Mappings {
                shard_map_id,
                shard_id,
            } => {
                rows.mappings = self
                    .scan::<Mapping>(Family::Mappings)?
                    .into_iter()
                    .filter(|m| m.shard_map_id == shard_map_id)
                    .filter(|m| shard_id.map_or(true, |id| m.shard_id == id))
                    .collect();
                rows.mappings.sort_by(|a, b| a.range.cmp(&b.range));
            }
            Query::MappingById(id) => rows.mappings.extend(self.get::<Mapping>(Family::Mappings, id)?),
            Query::MappingsIntersecting {
                shard_map_id,
                range,
            } => {
                rows.mappings = self
                    .scan::<Mapping>(Family::Mappings)?
                    .into_iter()
                    .filter(|m| {
                        m.shard_map_id == shard_map_id
                            && m.range.key_type() == range.key_type()
                            && m.range.intersects(&range)
                    })
                    .collect();
                rows.mappings.sort_by(|a, b| a.range.cmp(&b.range));
            }
            Query::Operations => rows.operations = self.scan(Family::Operations)?,
            Query::OperationById(id) => rows.operations.extend(self.get::<OperationLogEntry>(Family::Operations, id)?),
        }
        Ok(rows)
    }

    fn txn(&self, compares: Vec<Compare>, ops: Vec<StoreOp>) -> StoreResult<()> {
        let _guard = self.write_lock.lock();

        for compare in &compares {
            self.check(compare)?;
        }

        let op_count = ops.len();
        let mut staged = Staged::new(self);
        for op in ops {
            staged.apply(op)?;
        }
        self.commit(staged)?;

        debug!(
            scope = %self.scope,
            compares = compares.len(),
            ops = op_count,
            "Committed store transaction"
        );
        Ok(())
    }
}

/// Opens sled stores on demand, one database per scope, and keeps them open.
pub struct SledStoreProvider {
    config: BackendConfig,
    stores: Mutex<HashMap<StoreScope, Arc<SledStore>>>,
}

impl SledStoreProvider {
    pub fn new(config: BackendConfig) -> StoreResult<Self> {
        if !config.temporary {
            std::fs::create_dir_all(&config.data_dir)?;
        }
        info!(
            "Store provider initialized at {:?} (temporary={}, flush_interval={}ms)",
            config.data_dir, config.temporary, config.flush_interval_ms
        );
        Ok(Self {
            config,
            stores: Mutex::new(HashMap::new()),
        })
    }

    /// In-memory provider, used by tests and benchmarks.
    pub fn temporary() -> Self {
        Self {
            config: BackendConfig {
                temporary: true,
                ..Default::default()
            },
            stores: Mutex::new(HashMap::new()),
        }
    }

    fn path_for(&self, scope: &StoreScope) -> Option<PathBuf> {
        if self.config.temporary {
            return None;
        }
        let dir = match scope {
            StoreScope::Global => "global".to_string(),
            StoreScope::Local(location) => format!(
                "local/{}_{}_{}_{}",
                location.protocol,
                sanitize(&location.server),
                location.port,
                sanitize(&location.database)
            ),
        };
        Some(self.config.data_dir.join(dir))
    }

    /// Flushes every open store.
    pub fn flush(&self) -> StoreResult<()> {
        for store in self.stores.lock().values() {
            store.flush()?;
        }
        Ok(())
    }
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

impl StoreProvider for SledStoreProvider {
    fn connect(&self, scope: &StoreScope) -> StoreResult<Arc<dyn MapStore>> {
        let mut stores = self.stores.lock();
        if let Some(store) = stores.get(scope) {
            return Ok(store.clone());
        }
        let store = SledStore::open(
            scope.clone(),
            self.path_for(scope),
            self.config.flush_interval_ms,
        )?;
        stores.insert(scope.clone(), store.clone());
        Ok(store)
    }
}
