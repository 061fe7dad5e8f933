//! Background sweeper for pending operation log entries.
//!
//! Operations interrupted by a crash or an unreachable shard leave their log
//! entry in the global store. The sweeper periodically replays those entries
//! so stuck mappings are released even when nobody touches their shard map.

use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info, warn};

use super::engine::OperationContext;
use super::replay::{replay_pending_operations, ReplaySummary};

/// Periodic replayer of pending operations.
pub struct OperationSweeper {
    ctx: OperationContext,

    /// How often to sweep.
    interval: Duration,

    /// Entries younger than this are assumed to be in flight.
    grace_period: Duration,
}

impl OperationSweeper {
    pub fn new(ctx: OperationContext, interval: Duration, grace_period: Duration) -> Self {
        Self {
            ctx,
            interval,
            grace_period,
        }
    }

    /// Spawns a background tokio task that sweeps until aborted.
    ///
    /// Returns a JoinHandle that can be awaited or aborted.
    pub fn run(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run_periodic().await;
        })
    }

    async fn run_periodic(&self) {
        let mut ticker = interval(self.interval);

        info!(
            "Starting operation sweeper with interval: {:?}, grace period: {:?}",
            self.interval, self.grace_period
        );

        loop {
            ticker.tick().await;
            self.sweep_once().await;
        }
    }

    /// Runs one sweep over every shard map.
    pub async fn sweep_once(&self) -> Option<ReplaySummary> {
        let ctx = self.ctx.clone();
        let grace = self.grace_period;
        // Store calls block; keep them off the runtime's worker threads.
        let result =
            tokio::task::spawn_blocking(move || replay_pending_operations(&ctx, None, grace)).await;

        match result {
            Ok(Ok(summary)) => {
                if summary.is_empty() {
                    debug!("Operation sweep found nothing to replay");
                } else {
                    info!(
                        completed = summary.completed,
                        undone = summary.undone,
                        deferred = summary.deferred,
                        failed = summary.failed,
                        "Operation sweep finished"
                    );
                }
                Some(summary)
            }
            Ok(Err(e)) => {
                warn!("Operation sweep failed: {}", e);
                None
            }
            Err(e) => {
                warn!("Operation sweep task panicked: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::NoCache;
    use crate::key::ShardKeyType;
    use crate::mapping::{Shard, ShardLocation, ShardMap, ShardMapKind};
    use crate::operation::{OperationKind, StoreOperation};
    use crate::retry::NoRetry;
    use crate::store::{BackendConfig, FaultyStoreProvider, SledStoreProvider, StoreOp, StoreScope};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sweeper_creation() {
        let ctx = OperationContext::new(
            Arc::new(SledStoreProvider::temporary()),
            Arc::new(NoCache),
            Arc::new(NoRetry),
        );
        let sweeper = OperationSweeper::new(ctx, Duration::from_secs(10), Duration::from_secs(30));
        assert_eq!(sweeper.interval, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_sweep_once_replays_stuck_operation() {
        let temp_dir = TempDir::new().unwrap();
        let sled = SledStoreProvider::new(BackendConfig {
            data_dir: temp_dir.path().to_path_buf(),
            temporary: false,
            flush_interval_ms: 100,
        })
        .unwrap();
        let faults = Arc::new(FaultyStoreProvider::new(Arc::new(sled)));
        let ctx = OperationContext::new(faults.clone(), Arc::new(NoCache), Arc::new(NoRetry));

        let map = ShardMap::new("orders", ShardMapKind::Range, ShardKeyType::Int32);
        ctx.connect(&StoreScope::Global)
            .unwrap()
            .txn(vec![], vec![StoreOp::PutShardMap(map.clone())])
            .unwrap();
        let shard = Shard::new(&map, ShardLocation::new("srv", "db0"));
        let local = StoreScope::Local(shard.location.clone());
        faults.set_unreachable(&local, true);
        let result =
            StoreOperation::new(&ctx, map, OperationKind::AddShard { shard }).execute();
        assert!(result.is_err());
        faults.set_unreachable(&local, false);

        let sweeper = OperationSweeper::new(ctx, Duration::from_secs(60), Duration::ZERO);
        let summary = sweeper.sweep_once().await.unwrap();
        assert_eq!(summary.undone, 1);

        let summary = sweeper.sweep_once().await.unwrap();
        assert!(summary.is_empty());
    }

    #[tokio::test]
    async fn test_run_can_be_aborted() {
        let ctx = OperationContext::new(
            Arc::new(SledStoreProvider::temporary()),
            Arc::new(NoCache),
            Arc::new(NoRetry),
        );
        let handle =
            OperationSweeper::new(ctx, Duration::from_millis(10), Duration::ZERO).run();
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
    }
}
