//! # shardmap: shard map management with global/local consistency and recovery
//!
//! A shard map assigns key ranges (or single keys) to shards. The
//! authoritative copy lives in a global store; every shard keeps a local copy
//! of its own part. This crate keeps the two in step and repairs them when
//! they drift:
//!
//! - **Keys and ranges**: typed keys normalized to order-preserving bytes
//! - **Store operations**: two-phase global/local mutations with a durable
//!   operation log, undo and replay
//! - **Recovery**: sweep-line comparison of global and local mappings,
//!   resolution, per-shard rebuild and full global rebuild
//! - **Lookup cache**: invalidated after every committed change
//!
//! # Usage
//!
//! ```bash
//! shardmap --data-dir ./data create-shard-map orders --kind range --key-type int32
//! shardmap --data-dir ./data add-shard orders --shard srv1/db0
//! shardmap --data-dir ./data add-mapping orders --shard srv1/db0 --low 0 --high 100
//! shardmap --data-dir ./data detect --shard srv1/db0
//! ```

// Core modules
pub mod cache;
pub mod error;
pub mod key;
pub mod manager;
pub mod mapping;
pub mod operation;
pub mod recovery;
pub mod retry;
pub mod store;

// Re-export main types at crate root for convenience
pub use error::{ErrorKind, ShardManagementError, ShardResult};
pub use key::{ShardKey, ShardKeyType, ShardRange};
pub use manager::{ManagerConfig, ShardMapManager};
pub use mapping::{
    LockOwnerId, Mapping, MappingStatus, Shard, ShardLocation, ShardMap, ShardMapKind,
    ShardStatus,
};
pub use recovery::{
    MappingDifference, MappingDifferenceResolution, MappingLocation, RecoveryManager,
    RecoveryToken,
};
pub use store::{BackendConfig, SledStoreProvider};
