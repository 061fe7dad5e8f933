//! Two-phase store operations with undo.
//!
//! Every change to a shard map runs as an operation that touches the global
//! store before and after the local stores of the shards involved:
//!
//! ```text
//! DoGlobalPreLocalExecute -> DoLocalSourceExecute -> [DoLocalTargetExecute]
//!     -> DoGlobalPostLocalExecute -> Done
//! ```
//!
//! The pre step validates preconditions and persists an [`OperationLogEntry`]
//! in the global store. Local steps apply the change to each shard's local
//! map. The post step commits the final global state and removes the log
//! entry. Any failure walks the undo chain
//! (`UndoGlobalPostLocalExecute -> UndoLocalTargetExecute ->
//! UndoLocalSourceExecute -> UndoGlobalPreLocalExecute`) from the point
//! reached. Entries left behind by a crash are replayed by
//! [`replay_pending_operations`].

pub mod engine;
pub mod kinds;
pub mod replay;
pub mod sweeper;

pub use engine::{OperationContext, StoreOperation};
pub use kinds::{LockMode, OperationKind};
pub use replay::{replay_pending_operations, ReplayOutcome, ReplaySummary};
pub use sweeper::OperationSweeper;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::mapping::ShardMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationState {
    DoGlobalPreLocalExecute,
    DoLocalSourceExecute,
    DoLocalTargetExecute,
    DoGlobalPostLocalExecute,
    UndoGlobalPostLocalExecute,
    UndoLocalTargetExecute,
    UndoLocalSourceExecute,
    UndoGlobalPreLocalExecute,
    Done,
}

impl OperationState {
    pub fn is_undo(self) -> bool {
        matches!(
            self,
            OperationState::UndoGlobalPostLocalExecute
                | OperationState::UndoLocalTargetExecute
                | OperationState::UndoLocalSourceExecute
                | OperationState::UndoGlobalPreLocalExecute
        )
    }

    /// Where undo starts for an operation interrupted in this state.
    pub fn undo_entry(self) -> OperationState {
        match self {
            OperationState::DoGlobalPreLocalExecute => OperationState::UndoGlobalPreLocalExecute,
            OperationState::DoLocalSourceExecute => OperationState::UndoLocalSourceExecute,
            OperationState::DoLocalTargetExecute => OperationState::UndoLocalTargetExecute,
            OperationState::DoGlobalPostLocalExecute => OperationState::UndoGlobalPostLocalExecute,
            other => other,
        }
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Short operation code stored with each log entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationCode {
    AddShard,
    RemoveShard,
    UpdateShard,
    AttachShard,
    DetachShard,
    AddMapping,
    RemoveMapping,
    UpdateMapping,
    ReplaceMappings,
    LockOrUnlockMappings,
    ReplaceMappingsGlobal,
    ReplaceMappingsLocal,
}

impl fmt::Display for OperationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Persisted record of an in-flight operation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OperationLogEntry {
    pub id: Uuid,
    pub code: OperationCode,
    pub shard_map: ShardMap,
    /// Before and after state of everything the operation touches.
    pub kind: OperationKind,
    pub state: OperationState,
    pub created_at: DateTime<Utc>,
}

impl OperationLogEntry {
    pub fn new(shard_map: ShardMap, kind: OperationKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            code: kind.code(),
            shard_map,
            kind,
            state: OperationState::DoGlobalPreLocalExecute,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_undo_entry_points() {
        assert_eq!(
            OperationState::DoLocalSourceExecute.undo_entry(),
            OperationState::UndoLocalSourceExecute
        );
        assert_eq!(
            OperationState::DoLocalTargetExecute.undo_entry(),
            OperationState::UndoLocalTargetExecute
        );
        assert_eq!(
            OperationState::UndoLocalSourceExecute.undo_entry(),
            OperationState::UndoLocalSourceExecute
        );
        assert!(OperationState::UndoGlobalPreLocalExecute.is_undo());
        assert!(!OperationState::Done.is_undo());
    }
}
