//! Store access layer for global and local shard maps.
//!
//! A shard map's metadata lives in two kinds of stores: the single global
//! store (GSM) holding the authoritative directory, and one local store (LSM)
//! per shard holding that shard's slice of it. Both expose the same narrow
//! contract:
//!
//! 1. **Reads** return [`Rows`] for a [`Query`].
//! 2. **Transactions** evaluate a list of [`Compare`] guards atomically and,
//!    only if every guard holds, apply a list of [`StoreOp`] writes in order.
//!
//! Guard failures surface as `VersionMismatch`, `NotFound` or `Conflict`,
//! which is how the operation engine implements optimistic concurrency.

pub mod backend;
pub mod fault;

pub use backend::{BackendConfig, SledStore, SledStoreProvider};
pub use fault::{Fault, FaultyStoreProvider};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::key::ShardRange;
use crate::mapping::{LockOwnerId, Mapping, Shard, ShardLocation, ShardMap};
use crate::operation::OperationLogEntry;

/// Record family a store error refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StoreEntity {
    ShardMap,
    Shard,
    Mapping,
    Operation,
}

impl fmt::Display for StoreEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreEntity::ShardMap => f.write_str("shard map"),
            StoreEntity::Shard => f.write_str("shard"),
            StoreEntity::Mapping => f.write_str("mapping"),
            StoreEntity::Operation => f.write_str("operation"),
        }
    }
}

/// Why a guard rejected a transaction, when it is not a plain version or
/// existence failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConflictKind {
    ShardMapNameTaken,
    ShardMapHasShards,
    ShardLocationTaken,
    AlreadyExists,
    ShardHasMappings,
    RangeOverlap,
    LockOwnerMismatch,
    PendingOperation,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store operation timed out: {0}")]
    Timeout(String),

    #[error("Version mismatch: {0}")]
    VersionMismatch(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: StoreEntity, id: String },

    #[error("Conflict ({kind:?}): {detail}")]
    Conflict { kind: ConflictKind, detail: String },

    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout(_))
    }

    pub(crate) fn not_found(entity: StoreEntity, id: impl fmt::Display) -> Self {
        StoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub(crate) fn conflict(kind: ConflictKind, detail: impl Into<String>) -> Self {
        StoreError::Conflict {
            kind,
            detail: detail.into(),
        }
    }
}

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Which store a connection talks to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StoreScope {
    Global,
    Local(ShardLocation),
}

impl fmt::Display for StoreScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreScope::Global => f.write_str("global"),
            StoreScope::Local(location) => write!(f, "local({})", location),
        }
    }
}

#[derive(Clone, Debug)]
pub enum Query {
    ShardMaps,
    ShardMapById(Uuid),
    ShardMapByName(String),
    Shards { shard_map_id: Uuid },
    ShardById(Uuid),
    ShardByLocation {
        shard_map_id: Option<Uuid>,
        location: ShardLocation,
    },
    Mappings {
        shard_map_id: Uuid,
        shard_id: Option<Uuid>,
    },
    MappingById(Uuid),
    MappingsIntersecting {
        shard_map_id: Uuid,
        range: ShardRange,
    },
    Operations,
    OperationById(Uuid),
}

/// Result set of a read. Only the family matching the query is populated.
#[derive(Clone, Debug, Default)]
pub struct Rows {
    pub shard_maps: Vec<ShardMap>,
    pub shards: Vec<Shard>,
    pub mappings: Vec<Mapping>,
    pub operations: Vec<OperationLogEntry>,
}

impl Rows {
    pub fn is_empty(&self) -> bool {
        self.shard_maps.is_empty()
            && self.shards.is_empty()
            && self.mappings.is_empty()
            && self.operations.is_empty()
    }
}

/// Transaction guard. Every guard must hold for the writes to apply.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Compare {
    ShardMapExists(Uuid),
    ShardMapNameFree(String),
    ShardMapHasNoShards(Uuid),
    ShardExists(Uuid),
    ShardAbsent(Uuid),
    ShardVersion {
        shard_id: Uuid,
        version: u64,
    },
    ShardLocationFree {
        shard_map_id: Uuid,
        location: ShardLocation,
    },
    NoMappingsOnShard(Uuid),
    MappingExists(Uuid),
    MappingAbsent(Uuid),
    MappingVersion {
        mapping_id: Uuid,
        version: u64,
    },
    /// Holds when the current owner equals `owner`, or `owner` is `FORCE`.
    MappingLockedBy {
        mapping_id: Uuid,
        owner: LockOwnerId,
    },
    /// Holds when the mapping is not pending, or pending under `operation_id`.
    MappingNotPending {
        mapping_id: Uuid,
        operation_id: Uuid,
    },
    /// No mapping outside `ignoring` intersects `range`.
    RangeFree {
        shard_map_id: Uuid,
        range: ShardRange,
        ignoring: Vec<Uuid>,
    },
    OperationExists(Uuid),
}

/// Write applied by a transaction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum StoreOp {
    PutShardMap(ShardMap),
    DeleteShardMap(Uuid),
    PutShard(Shard),
    DeleteShard(Uuid),
    BumpShardVersion(Uuid),
    PutMapping(Mapping),
    DeleteMapping(Uuid),
    DeleteMappingsForShard(Uuid),
    SetMappingPending {
        mapping_id: Uuid,
        operation_id: Option<Uuid>,
    },
    SetMappingLockOwner {
        mapping_id: Uuid,
        owner: LockOwnerId,
    },
    /// Clears lock owners in a shard map; `owner: None` clears every lock.
    UnlockMappings {
        shard_map_id: Uuid,
        owner: Option<LockOwnerId>,
    },
    PutOperation(OperationLogEntry),
    DeleteOperation(Uuid),
}

/// A connection to one global or local store.
pub trait MapStore: Send + Sync {
    fn scope(&self) -> &StoreScope;

    fn read(&self, query: Query) -> StoreResult<Rows>;

    fn txn(&self, compares: Vec<Compare>, ops: Vec<StoreOp>) -> StoreResult<()>;
}

/// Hands out connections by scope.
pub trait StoreProvider: Send + Sync {
    fn connect(&self, scope: &StoreScope) -> StoreResult<Arc<dyn MapStore>>;
}

/// Convenience reads shared by the engine, recovery and the manager.
pub(crate) trait MapStoreExt {
    fn shard_map_by_name(&self, name: &str) -> StoreResult<Option<ShardMap>>;
    fn shard_map_by_id(&self, id: Uuid) -> StoreResult<Option<ShardMap>>;
    fn shard_by_id(&self, id: Uuid) -> StoreResult<Option<Shard>>;
    fn shard_by_location(
        &self,
        shard_map_id: Option<Uuid>,
        location: &ShardLocation,
    ) -> StoreResult<Option<Shard>>;
    fn mapping_by_id(&self, id: Uuid) -> StoreResult<Option<Mapping>>;
    fn mappings(&self, shard_map_id: Uuid, shard_id: Option<Uuid>) -> StoreResult<Vec<Mapping>>;
    fn operation_by_id(&self, id: Uuid) -> StoreResult<Option<OperationLogEntry>>;
}

impl<S: MapStore + ?Sized> MapStoreExt for S {
    fn shard_map_by_name(&self, name: &str) -> StoreResult<Option<ShardMap>> {
        Ok(self
            .read(Query::ShardMapByName(name.to_string()))?
            .shard_maps
            .pop())
    }

    fn shard_map_by_id(&self, id: Uuid) -> StoreResult<Option<ShardMap>> {
        Ok(self.read(Query::ShardMapById(id))?.shard_maps.pop())
    }

    fn shard_by_id(&self, id: Uuid) -> StoreResult<Option<Shard>> {
        Ok(self.read(Query::ShardById(id))?.shards.pop())
    }

    fn shard_by_location(
        &self,
        shard_map_id: Option<Uuid>,
        location: &ShardLocation,
    ) -> StoreResult<Option<Shard>> {
        Ok(self
            .read(Query::ShardByLocation {
                shard_map_id,
                location: location.clone(),
            })?
            .shards
            .pop())
    }

    fn mapping_by_id(&self, id: Uuid) -> StoreResult<Option<Mapping>> {
        Ok(self.read(Query::MappingById(id))?.mappings.pop())
    }

    fn mappings(&self, shard_map_id: Uuid, shard_id: Option<Uuid>) -> StoreResult<Vec<Mapping>> {
        Ok(self
            .read(Query::Mappings {
                shard_map_id,
                shard_id,
            })?
            .mappings)
    }

    fn operation_by_id(&self, id: Uuid) -> StoreResult<Option<OperationLogEntry>> {
        Ok(self.read(Query::OperationById(id))?.operations.pop())
    }
}
