//! Operation engine: runs one operation's steps in order and undoes them on
//! failure.

use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::kinds::StepPlan;
use super::replay::ReplayOutcome;
use super::{OperationKind, OperationLogEntry, OperationState};
use crate::cache::LookupCache;
use crate::error::{ShardManagementError, ShardResult};
use crate::mapping::{ShardLocation, ShardMap};
use crate::retry::{retry_call, RetryPolicy};
use crate::store::{
    Compare, MapStore, MapStoreExt, StoreEntity, StoreError, StoreOp, StoreProvider, StoreScope,
};

/// Collaborators every operation needs. Owned by the manager.
#[derive(Clone)]
pub struct OperationContext {
    pub provider: Arc<dyn StoreProvider>,
    pub cache: Arc<dyn LookupCache>,
    pub retry: Arc<dyn RetryPolicy>,
}

impl OperationContext {
    pub fn new(
        provider: Arc<dyn StoreProvider>,
        cache: Arc<dyn LookupCache>,
        retry: Arc<dyn RetryPolicy>,
    ) -> Self {
        Self {
            provider,
            cache,
            retry,
        }
    }

    pub(crate) fn connect(&self, scope: &StoreScope) -> ShardResult<Arc<dyn MapStore>> {
        retry_call(self.retry.as_ref(), "connect", || {
            Ok(self.provider.connect(scope)?)
        })
    }
}

/// One in-flight operation.
pub struct StoreOperation<'a> {
    ctx: &'a OperationContext,
    entry: OperationLogEntry,
}

fn is_operation_not_found(err: &ShardManagementError) -> bool {
    matches!(
        err,
        ShardManagementError::Store(StoreError::NotFound {
            entity: StoreEntity::Operation,
            ..
        })
    )
}

impl<'a> StoreOperation<'a> {
    pub fn new(ctx: &'a OperationContext, shard_map: ShardMap, kind: OperationKind) -> Self {
        Self {
            ctx,
            entry: OperationLogEntry::new(shard_map, kind),
        }
    }

    /// Picks up an entry read back from the global store.
    pub(crate) fn resume(ctx: &'a OperationContext, entry: OperationLogEntry) -> Self {
        Self { ctx, entry }
    }

    pub fn id(&self) -> Uuid {
        self.entry.id
    }

    pub fn state(&self) -> OperationState {
        self.entry.state
    }

    /// Runs the operation to completion, or undoes whatever part of it ran.
    pub fn execute(mut self) -> ShardResult<()> {
        info!(
            operation_id = %self.entry.id,
            code = %self.entry.code,
            shard_map = %self.entry.shard_map.name,
            "Starting operation"
        );
        let gsm = self.ctx.connect(&StoreScope::Global)?;

        if let Err(err) = self.do_global_pre(&gsm) {
            return Err(self.handle_global_pre_error(&gsm, err));
        }

        if let Some(location) = self.entry.kind.source_location().cloned() {
            let plan = self.entry.kind.local_source(&self.entry.shard_map);
            if let Err(err) = self.do_local(&location, plan) {
                return Err(self.handle_local_error(
                    &gsm,
                    OperationState::UndoLocalSourceExecute,
                    err,
                ));
            }
            let next = if self.entry.kind.target_location().is_some() {
                OperationState::DoLocalTargetExecute
            } else {
                OperationState::DoGlobalPostLocalExecute
            };
            self.advance(&gsm, next);
        }

        if let Some(location) = self.entry.kind.target_location().cloned() {
            let plan = self.entry.kind.local_target(&self.entry.shard_map);
            if let Err(err) = self.do_local(&location, plan) {
                return Err(self.handle_local_error(
                    &gsm,
                    OperationState::UndoLocalTargetExecute,
                    err,
                ));
            }
            self.advance(&gsm, OperationState::DoGlobalPostLocalExecute);
        }

        self.entry.state = OperationState::DoGlobalPostLocalExecute;
        self.finish_forward(&gsm)
    }

    /// Drives a log entry left behind by an interrupted operation to a
    /// terminal state.
    pub(crate) fn replay(mut self) -> ShardResult<ReplayOutcome> {
        info!(
            operation_id = %self.entry.id,
            code = %self.entry.code,
            state = %self.entry.state,
            "Replaying pending operation"
        );
        let gsm = self.ctx.connect(&StoreScope::Global)?;
        match self.entry.state {
            OperationState::DoGlobalPostLocalExecute => {
                self.finish_forward(&gsm)?;
                Ok(ReplayOutcome::Completed)
            }
            OperationState::Done => {
                self.run_global(&gsm, "delete log entry", Vec::new(), vec![StoreOp::DeleteOperation(self.entry.id)])?;
                Ok(ReplayOutcome::Completed)
            }
            state => {
                self.undo_from(&gsm, state.undo_entry())?;
                self.invalidate_cache();
                Ok(ReplayOutcome::Undone)
            }
        }
    }

    fn first_state_after_pre(&self) -> OperationState {
        if self.entry.kind.source_location().is_some() {
            OperationState::DoLocalSourceExecute
        } else {
            OperationState::DoGlobalPostLocalExecute
        }
    }

    fn do_global_pre(&mut self, gsm: &Arc<dyn MapStore>) -> ShardResult<()> {
        let plan = self
            .entry
            .kind
            .global_pre(self.entry.id, &self.entry.shard_map);
        let mut logged = self.entry.clone();
        logged.state = self.first_state_after_pre();

        let mut ops = plan.ops;
        ops.push(StoreOp::PutOperation(logged.clone()));
        self.run_global(gsm, "global pre-local step", plan.compares, ops)?;
        self.entry.state = logged.state;
        debug!(operation_id = %self.entry.id, "Global pre-local step committed");
        Ok(())
    }

    fn handle_global_pre_error(
        &mut self,
        gsm: &Arc<dyn MapStore>,
        err: ShardManagementError,
    ) -> ShardManagementError {
        self.invalidate_cache();
        if err.is_transient() {
            // The transaction may have committed before the fault was reported.
            match gsm.operation_by_id(self.entry.id) {
                Ok(Some(_)) => {
                    if let Err(undo_err) =
                        self.undo_from(gsm, OperationState::UndoGlobalPreLocalExecute)
                    {
                        warn!(
                            operation_id = %self.entry.id,
                            "Could not roll back global pre-local step: {}", undo_err
                        );
                    }
                }
                Ok(None) => {}
                Err(read_err) => warn!(
                    operation_id = %self.entry.id,
                    "Could not check for a logged operation: {}", read_err
                ),
            }
        }
        debug!(operation_id = %self.entry.id, "Global pre-local step failed: {}", err);
        err
    }

    fn do_local(&self, location: &ShardLocation, plan: StepPlan) -> ShardResult<()> {
        if plan.ops.is_empty() && plan.compares.is_empty() {
            return Ok(());
        }
        let scope = StoreScope::Local(location.clone());
        retry_call(self.ctx.retry.as_ref(), "local step", || {
            let lsm = self.ctx.provider.connect(&scope)?;
            lsm.txn(plan.compares.clone(), plan.ops.clone())?;
            Ok(())
        })?;
        debug!(
            operation_id = %self.entry.id,
            location = %location,
            "Local step committed"
        );
        Ok(())
    }

    fn handle_local_error(
        &mut self,
        gsm: &Arc<dyn MapStore>,
        undo_state: OperationState,
        err: ShardManagementError,
    ) -> ShardManagementError {
        warn!(
            operation_id = %self.entry.id,
            "Local step failed, undoing operation: {}", err
        );
        if let Err(undo_err) = self.undo_from(gsm, undo_state) {
            warn!(
                operation_id = %self.entry.id,
                state = %self.entry.state,
                "Undo did not finish, operation left for replay: {}", undo_err
            );
        }
        self.invalidate_cache();
        err
    }

    /// Persists the current step so replay knows where to resume.
    fn advance(&mut self, gsm: &Arc<dyn MapStore>, state: OperationState) {
        self.entry.state = state;
        let result = self.run_global(
            gsm,
            "advance operation state",
            vec![Compare::OperationExists(self.entry.id)],
            vec![StoreOp::PutOperation(self.entry.clone())],
        );
        if let Err(err) = result {
            warn!(
                operation_id = %self.entry.id,
                state = %state,
                "Could not persist operation state: {}", err
            );
        }
    }

    fn finish_forward(&mut self, gsm: &Arc<dyn MapStore>) -> ShardResult<()> {
        match self.do_global_post(gsm) {
            Ok(()) => {
                self.entry.state = OperationState::Done;
                self.invalidate_cache();
                info!(
                    operation_id = %self.entry.id,
                    code = %self.entry.code,
                    "Operation completed"
                );
                Ok(())
            }
            Err(err) if err.is_transient() => {
                warn!(
                    operation_id = %self.entry.id,
                    "Global post-local step did not complete, operation left for replay: {}", err
                );
                self.invalidate_cache();
                Err(err)
            }
            Err(err) => {
                warn!(
                    operation_id = %self.entry.id,
                    "Global post-local step rejected, undoing operation: {}", err
                );
                if let Err(undo_err) =
                    self.undo_from(gsm, OperationState::UndoGlobalPostLocalExecute)
                {
                    warn!(
                        operation_id = %self.entry.id,
                        state = %self.entry.state,
                        "Undo did not finish, operation left for replay: {}", undo_err
                    );
                }
                self.invalidate_cache();
                Err(err)
            }
        }
    }

    /// Commits the final global state. A transient fault is ambiguous here,
    /// so the log entry is re-read before retrying: if it is gone, the
    /// commit landed.
    fn do_global_post(&self, gsm: &Arc<dyn MapStore>) -> ShardResult<()> {
        let plan = self
            .entry
            .kind
            .global_post(self.entry.id, &self.entry.shard_map);
        let mut compares = vec![Compare::OperationExists(self.entry.id)];
        compares.extend(plan.compares);
        let mut ops = plan.ops;
        ops.push(StoreOp::DeleteOperation(self.entry.id));

        let mut attempt = 1;
        loop {
            let err: ShardManagementError = match gsm.txn(compares.clone(), ops.clone()) {
                Ok(()) => return Ok(()),
                Err(err) => err.into(),
            };
            if attempt > 1 && is_operation_not_found(&err) {
                debug!(operation_id = %self.entry.id, "Global post-local step found already committed");
                return Ok(());
            }
            if !err.is_transient() {
                return Err(err);
            }
            if let Ok(None) = gsm.operation_by_id(self.entry.id) {
                debug!(
                    operation_id = %self.entry.id,
                    "Global post-local step committed despite: {}", err
                );
                return Ok(());
            }
            if !self.ctx.retry.should_retry(err.kind(), attempt) {
                return Err(err);
            }
            let delay = self.ctx.retry.backoff(attempt);
            warn!(
                operation_id = %self.entry.id,
                attempt,
                "Global post-local step failed, retrying: {}", err
            );
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
            attempt += 1;
        }
    }

    /// Walks the undo chain from `start` to `Done`. On failure the state
    /// reached is persisted so replay continues from there.
    fn undo_from(&mut self, gsm: &Arc<dyn MapStore>, start: OperationState) -> ShardResult<()> {
        let mut state = start;
        loop {
            self.entry.state = state;
            state = match state {
                OperationState::UndoGlobalPostLocalExecute => {
                    // The post step is a single transaction; if it failed nothing landed.
                    if self.entry.kind.target_location().is_some() {
                        OperationState::UndoLocalTargetExecute
                    } else {
                        OperationState::UndoLocalSourceExecute
                    }
                }
                OperationState::UndoLocalTargetExecute => {
                    if let Some(location) = self.entry.kind.target_location().cloned() {
                        let plan = self.entry.kind.undo_local_target(&self.entry.shard_map);
                        if let Err(err) = self.do_local(&location, plan) {
                            self.advance(gsm, state);
                            return Err(err);
                        }
                    }
                    OperationState::UndoLocalSourceExecute
                }
                OperationState::UndoLocalSourceExecute => {
                    if let Some(location) = self.entry.kind.source_location().cloned() {
                        let plan = self.entry.kind.undo_local_source(&self.entry.shard_map);
                        if let Err(err) = self.do_local(&location, plan) {
                            self.advance(gsm, state);
                            return Err(err);
                        }
                    }
                    OperationState::UndoGlobalPreLocalExecute
                }
                OperationState::UndoGlobalPreLocalExecute => {
                    let plan = self
                        .entry
                        .kind
                        .undo_global_pre(self.entry.id, &self.entry.shard_map);
                    let mut ops = plan.ops;
                    ops.push(StoreOp::DeleteOperation(self.entry.id));
                    let mut compares = vec![Compare::OperationExists(self.entry.id)];
                    compares.extend(plan.compares);
                    match self.run_global(gsm, "undo global pre-local step", compares, ops) {
                        Ok(()) => {}
                        // Someone else already finished this entry.
                        Err(err) if is_operation_not_found(&err) => {}
                        Err(err) => return Err(err),
                    }
                    OperationState::Done
                }
                OperationState::Done => {
                    info!(operation_id = %self.entry.id, "Operation undone");
                    return Ok(());
                }
                other => {
                    return Err(ShardManagementError::InvalidArgument(format!(
                        "{} is not an undo state",
                        other
                    )))
                }
            };
        }
    }

    fn run_global(
        &self,
        gsm: &Arc<dyn MapStore>,
        what: &str,
        compares: Vec<Compare>,
        ops: Vec<StoreOp>,
    ) -> ShardResult<()> {
        retry_call(self.ctx.retry.as_ref(), what, || {
            gsm.txn(compares.clone(), ops.clone())?;
            Ok(())
        })
    }

    fn invalidate_cache(&self) {
        if self.entry.kind.invalidates_shard_map() {
            self.ctx.cache.invalidate_shard_map(self.entry.shard_map.id);
        }
        for id in self.entry.kind.touched_mappings() {
            self.ctx.cache.invalidate_mapping(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MappingCache;
    use crate::key::{ShardKey, ShardKeyType, ShardRange};
    use crate::mapping::{LockOwnerId, Mapping, MappingStatus, Shard, ShardMapKind};
    use crate::operation::LockMode;
    use crate::retry::ExponentialBackoff;
    use crate::store::{Fault, FaultyStoreProvider, Query, SledStoreProvider};

    struct Harness {
        faults: Arc<FaultyStoreProvider>,
        ctx: OperationContext,
        map: ShardMap,
    }

    impl Harness {
        fn new() -> Self {
            let faults = Arc::new(FaultyStoreProvider::new(Arc::new(
                SledStoreProvider::temporary(),
            )));
            let ctx = OperationContext::new(
                faults.clone(),
                Arc::new(MappingCache::new()),
                Arc::new(ExponentialBackoff::immediate(2)),
            );
            let map = ShardMap::new("orders", ShardMapKind::Range, ShardKeyType::Int32);
            ctx.connect(&StoreScope::Global)
                .unwrap()
                .txn(vec![], vec![StoreOp::PutShardMap(map.clone())])
                .unwrap();
            Self { faults, ctx, map }
        }

        fn gsm(&self) -> Arc<dyn MapStore> {
            self.ctx.connect(&StoreScope::Global).unwrap()
        }

        fn lsm(&self, shard: &Shard) -> Arc<dyn MapStore> {
            self.ctx
                .connect(&StoreScope::Local(shard.location.clone()))
                .unwrap()
        }

        fn run(&self, kind: OperationKind) -> ShardResult<()> {
            StoreOperation::new(&self.ctx, self.map.clone(), kind).execute()
        }

        fn add_shard(&self, database: &str) -> Shard {
            let shard = Shard::new(&self.map, ShardLocation::new("srv", database));
            self.run(OperationKind::AddShard {
                shard: shard.clone(),
            })
            .unwrap();
            self.gsm().shard_by_id(shard.id).unwrap().unwrap()
        }

        fn add_mapping(&self, shard: &Shard, low: i32, high: i32) -> Mapping {
            let range =
                ShardRange::new(ShardKey::new(low).unwrap(), ShardKey::new(high).unwrap()).unwrap();
            let m = Mapping::new_range(&self.map, shard, range, MappingStatus::Online).unwrap();
            let shard = self.gsm().shard_by_id(shard.id).unwrap().unwrap();
            self.run(OperationKind::ReplaceMappings {
                source: shard.clone(),
                target: shard,
                removed: vec![],
                added: vec![m.clone()],
                lock_owner: LockOwnerId::NONE,
            })
            .unwrap();
            m
        }

        fn pending_entries(&self) -> Vec<OperationLogEntry> {
            self.gsm().read(Query::Operations).unwrap().operations
        }
    }

    #[test]
    fn test_add_shard_writes_both_stores() {
        let h = Harness::new();
        let shard = h.add_shard("db0");
        assert_eq!(shard.version, 1);
        assert!(h.lsm(&shard).shard_by_id(shard.id).unwrap().is_some());
        assert!(h.lsm(&shard).shard_map_by_id(h.map.id).unwrap().is_some());
        assert!(h.pending_entries().is_empty());
    }

    #[test]
    fn test_add_mapping_bumps_shard_version() {
        let h = Harness::new();
        let shard = h.add_shard("db0");
        let m = h.add_mapping(&shard, 1, 10);

        let global = h.gsm().mapping_by_id(m.id).unwrap().unwrap();
        assert!(global.pending_operation.is_none());
        assert!(h.lsm(&shard).mapping_by_id(m.id).unwrap().is_some());
        assert_eq!(h.gsm().shard_by_id(shard.id).unwrap().unwrap().version, 2);
    }

    #[test]
    fn test_overlapping_add_is_rejected_before_local_write() {
        let h = Harness::new();
        let shard = h.add_shard("db0");
        h.add_mapping(&shard, 1, 10);

        let range = ShardRange::new(ShardKey::new(5i32).unwrap(), ShardKey::new(20i32).unwrap())
            .unwrap();
        let shard = h.gsm().shard_by_id(shard.id).unwrap().unwrap();
        let m = Mapping::new_range(&h.map, &shard, range, MappingStatus::Online).unwrap();
        let err = h
            .run(OperationKind::ReplaceMappings {
                source: shard.clone(),
                target: shard.clone(),
                removed: vec![],
                added: vec![m.clone()],
                lock_owner: LockOwnerId::NONE,
            })
            .unwrap_err();
        assert!(matches!(err, ShardManagementError::MappingRangeAlreadyMapped(_)));
        assert!(h.lsm(&shard).mapping_by_id(m.id).unwrap().is_none());
        assert!(h.pending_entries().is_empty());
    }

    #[test]
    fn test_stale_shard_version_is_version_mismatch() {
        let h = Harness::new();
        let shard = h.add_shard("db0");
        h.add_mapping(&shard, 1, 10);

        // `shard` still carries version 1
        let range = ShardRange::new(ShardKey::new(10i32).unwrap(), ShardKey::new(20i32).unwrap())
            .unwrap();
        let m = Mapping::new_range(&h.map, &shard, range, MappingStatus::Online).unwrap();
        let err = h
            .run(OperationKind::ReplaceMappings {
                source: shard.clone(),
                target: shard.clone(),
                removed: vec![],
                added: vec![m],
                lock_owner: LockOwnerId::NONE,
            })
            .unwrap_err();
        assert!(matches!(err, ShardManagementError::VersionMismatch(_)));
    }

    #[test]
    fn test_local_failure_undoes_global_pre() {
        let h = Harness::new();
        let shard = h.add_shard("db0");
        let m = h.add_mapping(&shard, 1, 10);
        let shard = h.gsm().shard_by_id(shard.id).unwrap().unwrap();
        let local = StoreScope::Local(shard.location.clone());

        // Both forward attempts fail, the undo goes through.
        h.faults.fail_next(&local, 2, Fault::Unavailable);
        let err = h
            .run(OperationKind::ReplaceMappings {
                source: shard.clone(),
                target: shard.clone(),
                removed: vec![m.clone()],
                added: vec![m.with_status(MappingStatus::Offline)],
                lock_owner: LockOwnerId::NONE,
            })
            .unwrap_err();
        assert!(err.is_transient());

        let global = h.gsm().mapping_by_id(m.id).unwrap().unwrap();
        assert!(global.same_record(&m));
        assert!(global.pending_operation.is_none());
        assert!(h.lsm(&shard).mapping_by_id(m.id).unwrap().unwrap().same_record(&m));
        assert!(h.pending_entries().is_empty());
    }

    #[test]
    fn test_unreachable_shard_leaves_entry_then_replay_undoes() {
        let h = Harness::new();
        let shard = h.add_shard("db0");
        let m = h.add_mapping(&shard, 1, 10);
        let shard = h.gsm().shard_by_id(shard.id).unwrap().unwrap();
        let local = StoreScope::Local(shard.location.clone());

        h.faults.set_unreachable(&local, true);
        let kind = OperationKind::ReplaceMappings {
            source: shard.clone(),
            target: shard.clone(),
            removed: vec![m.clone()],
            added: vec![m.with_status(MappingStatus::Offline)],
            lock_owner: LockOwnerId::NONE,
        };
        assert!(h.run(kind.clone()).is_err());

        let entries = h.pending_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].state, OperationState::UndoLocalSourceExecute);

        // The mapping stays claimed by the stuck operation.
        let err = h.run(kind).unwrap_err();
        assert!(matches!(err, ShardManagementError::VersionMismatch(_)));

        h.faults.set_unreachable(&local, false);
        let entry = h.pending_entries().pop().unwrap();
        let outcome = StoreOperation::resume(&h.ctx, entry).replay().unwrap();
        assert_eq!(outcome, ReplayOutcome::Undone);
        assert!(h.pending_entries().is_empty());
        let global = h.gsm().mapping_by_id(m.id).unwrap().unwrap();
        assert!(global.pending_operation.is_none());
        assert_eq!(global.status, MappingStatus::Online);
    }

    #[test]
    fn test_timeout_after_post_commit_is_success() {
        let h = Harness::new();
        let shard = h.add_shard("db0");
        // pre, state advance, post
        h.faults.script(
            &StoreScope::Global,
            vec![None, None, Some(Fault::CommitThenTimeout)],
        );
        let m = h.add_mapping(&shard, 1, 10);
        assert!(h.gsm().mapping_by_id(m.id).unwrap().is_some());
        assert!(h.pending_entries().is_empty());
    }

    #[test]
    fn test_lost_post_step_completes_on_replay() {
        let h = Harness::new();
        let shard = h.add_shard("db0");
        let range = ShardRange::new(ShardKey::new(1i32).unwrap(), ShardKey::new(10i32).unwrap())
            .unwrap();
        let m = Mapping::new_range(&h.map, &shard, range, MappingStatus::Online).unwrap();
        h.faults.script(
            &StoreScope::Global,
            vec![None, None, Some(Fault::Unavailable), Some(Fault::Unavailable)],
        );
        let err = h
            .run(OperationKind::ReplaceMappings {
                source: shard.clone(),
                target: shard.clone(),
                removed: vec![],
                added: vec![m.clone()],
                lock_owner: LockOwnerId::NONE,
            })
            .unwrap_err();
        assert!(err.is_transient());
        assert!(h.gsm().mapping_by_id(m.id).unwrap().is_none());
        assert!(h.lsm(&shard).mapping_by_id(m.id).unwrap().is_some());

        let entry = h.pending_entries().pop().unwrap();
        assert_eq!(entry.state, OperationState::DoGlobalPostLocalExecute);
        let outcome = StoreOperation::resume(&h.ctx, entry).replay().unwrap();
        assert_eq!(outcome, ReplayOutcome::Completed);
        assert!(h.gsm().mapping_by_id(m.id).unwrap().is_some());
    }

    #[test]
    fn test_move_between_shards() {
        let h = Harness::new();
        let a = h.add_shard("db0");
        let b = h.add_shard("db1");
        let m = h.add_mapping(&a, 1, 10);
        let a = h.gsm().shard_by_id(a.id).unwrap().unwrap();
        let moved = m.moved_to(&b);

        h.run(OperationKind::ReplaceMappings {
            source: a.clone(),
            target: b.clone(),
            removed: vec![m.clone()],
            added: vec![moved.clone()],
            lock_owner: LockOwnerId::NONE,
        })
        .unwrap();

        assert!(h.gsm().mapping_by_id(m.id).unwrap().is_none());
        assert_eq!(h.gsm().mapping_by_id(moved.id).unwrap().unwrap().shard_id, b.id);
        assert!(h.lsm(&a).mapping_by_id(m.id).unwrap().is_none());
        assert!(h.lsm(&b).mapping_by_id(moved.id).unwrap().is_some());
        assert_eq!(h.gsm().shard_by_id(a.id).unwrap().unwrap().version, 3);
        assert_eq!(h.gsm().shard_by_id(b.id).unwrap().unwrap().version, 2);
    }

    #[test]
    fn test_lock_owner_is_enforced() {
        let h = Harness::new();
        let shard = h.add_shard("db0");
        let m = h.add_mapping(&shard, 1, 10);
        let owner = LockOwnerId::new();

        h.run(OperationKind::LockMappings {
            mode: LockMode::Lock(m.clone()),
            owner,
        })
        .unwrap();
        assert_eq!(h.gsm().mapping_by_id(m.id).unwrap().unwrap().lock_owner, owner);
        assert!(h.lsm(&shard).mapping_by_id(m.id).unwrap().unwrap().lock_owner.is_none());

        let shard = h.gsm().shard_by_id(shard.id).unwrap().unwrap();
        let err = h
            .run(OperationKind::ReplaceMappings {
                source: shard.clone(),
                target: shard.clone(),
                removed: vec![m.clone()],
                added: vec![],
                lock_owner: LockOwnerId::new(),
            })
            .unwrap_err();
        assert!(matches!(err, ShardManagementError::MappingLockOwnerMismatch(_)));

        h.run(OperationKind::LockMappings {
            mode: LockMode::UnlockAll,
            owner: LockOwnerId::NONE,
        })
        .unwrap();
        assert!(h.gsm().mapping_by_id(m.id).unwrap().unwrap().lock_owner.is_none());
    }
}
