//! Replay of operation log entries left behind by interrupted operations.
//!
//! Entries whose local steps all committed (`DoGlobalPostLocalExecute`) are
//! completed forward. Entries stopped before or during a local step are undone
//! backward. Entries already undoing continue from their recorded undo state.

use chrono::Utc;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use super::engine::{OperationContext, StoreOperation};
use crate::error::ShardResult;
use crate::store::{Query, StoreScope};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplayOutcome {
    Completed,
    Undone,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReplaySummary {
    pub completed: usize,
    pub undone: usize,
    /// Younger than the grace period, or blocked by an unreachable store.
    pub deferred: usize,
    pub failed: usize,
}

impl ReplaySummary {
    pub fn is_empty(&self) -> bool {
        self.completed + self.undone + self.deferred + self.failed == 0
    }
}

/// Replays pending entries, optionally restricted to one shard map.
///
/// Entries younger than `min_age` are assumed to belong to operations still
/// in flight and are left alone.
pub fn replay_pending_operations(
    ctx: &OperationContext,
    shard_map_id: Option<Uuid>,
    min_age: Duration,
) -> ShardResult<ReplaySummary> {
    let gsm = ctx.connect(&StoreScope::Global)?;
    let mut entries = gsm.read(Query::Operations)?.operations;
    entries.retain(|e| shard_map_id.map_or(true, |id| e.shard_map.id == id));
    entries.sort_by_key(|e| e.created_at);

    let mut summary = ReplaySummary::default();
    let now = Utc::now();
    for entry in entries {
        let age = (now - entry.created_at).to_std().unwrap_or_default();
        if age < min_age {
            debug!(operation_id = %entry.id, "Skipping recent operation log entry");
            summary.deferred += 1;
            continue;
        }
        let id = entry.id;
        match StoreOperation::resume(ctx, entry).replay() {
            Ok(ReplayOutcome::Completed) => summary.completed += 1,
            Ok(ReplayOutcome::Undone) => summary.undone += 1,
            Err(err) if err.is_transient() => {
                warn!(operation_id = %id, "Replay deferred, store unreachable: {}", err);
                summary.deferred += 1;
            }
            Err(err) => {
                warn!(operation_id = %id, "Replay failed: {}", err);
                summary.failed += 1;
            }
        }
    }
    Ok(summary)
}
