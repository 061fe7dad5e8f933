//! Shard map manager: the outward surface of the crate.
//!
//! The manager owns the store provider, the lookup cache and the retry
//! policy, and hands them to every operation it runs. Shard map creation and
//! deletion are single global transactions; everything touching a shard goes
//! through the operation engine.

mod config;

pub use config::ManagerConfig;

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::cache::{LookupCache, MappingCache, NoCache};
use crate::error::{ShardManagementError, ShardResult};
use crate::key::{KeyError, ShardKey, ShardKeyType, ShardRange};
use crate::mapping::{
    LockOwnerId, Mapping, MappingStatus, Shard, ShardLocation, ShardMap, ShardMapKind,
    ShardStatus,
};
use crate::operation::{
    replay_pending_operations, LockMode, OperationContext, OperationKind, OperationSweeper,
    ReplaySummary, StoreOperation,
};
use crate::recovery::RecoveryManager;
use crate::retry::retry_call;
use crate::store::{
    Compare, MapStore, MapStoreExt, Query, SledStoreProvider, StoreOp, StoreProvider, StoreScope,
};

pub struct ShardMapManager {
    config: ManagerConfig,
    ctx: OperationContext,
    recovery: RecoveryManager,
}

impl ShardMapManager {
    pub fn new(provider: Arc<dyn StoreProvider>, config: ManagerConfig) -> Self {
        let cache: Arc<dyn LookupCache> = if config.cache_enabled {
            Arc::new(MappingCache::new())
        } else {
            Arc::new(NoCache)
        };
        let ctx = OperationContext::new(provider, cache, Arc::new(config.retry_policy()));
        let recovery = RecoveryManager::new(ctx.clone());
        Self {
            config,
            ctx,
            recovery,
        }
    }

    /// Opens sled stores under `config.backend`.
    pub fn open(config: ManagerConfig) -> ShardResult<Self> {
        let provider = SledStoreProvider::new(config.backend.clone())?;
        Ok(Self::new(Arc::new(provider), config))
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn context(&self) -> &OperationContext {
        &self.ctx
    }

    pub fn recovery_manager(&self) -> &RecoveryManager {
        &self.recovery
    }

    /// Background replayer using this manager's collaborators.
    pub fn sweeper(&self) -> OperationSweeper {
        OperationSweeper::new(
            self.ctx.clone(),
            self.config.sweep_interval,
            self.config.replay_grace,
        )
    }

    pub fn create_shard_map(
        &self,
        name: &str,
        kind: ShardMapKind,
        key_type: ShardKeyType,
    ) -> ShardResult<ShardMap> {
        if name.trim().is_empty() {
            return Err(ShardManagementError::InvalidArgument(
                "shard map name must not be empty".to_string(),
            ));
        }
        let shard_map = ShardMap::new(name, kind, key_type);
        self.global_txn(
            "create shard map",
            vec![Compare::ShardMapNameFree(name.to_string())],
            vec![StoreOp::PutShardMap(shard_map.clone())],
        )?;
        info!(shard_map = %name, id = %shard_map.id, "Created shard map");
        Ok(shard_map)
    }

    pub fn get_shard_map(&self, name: &str) -> ShardResult<ShardMap> {
        self.gsm()?
            .shard_map_by_name(name)?
            .ok_or_else(|| ShardManagementError::ShardMapDoesNotExist(name.to_string()))
    }

    pub fn list_shard_maps(&self) -> ShardResult<Vec<ShardMap>> {
        let mut maps = self.gsm()?.read(Query::ShardMaps)?.shard_maps;
        maps.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(maps)
    }

    /// Deletes an empty shard map.
    pub fn delete_shard_map(&self, shard_map: &ShardMap) -> ShardResult<()> {
        self.global_txn(
            "delete shard map",
            vec![
                Compare::ShardMapExists(shard_map.id),
                Compare::ShardMapHasNoShards(shard_map.id),
            ],
            vec![StoreOp::DeleteShardMap(shard_map.id)],
        )?;
        self.ctx.cache.invalidate_shard_map(shard_map.id);
        info!(shard_map = %shard_map.name, "Deleted shard map");
        Ok(())
    }

    /// Registers a new, empty shard. A location whose local store already
    /// holds a shard of this map must be attached instead.
    pub fn add_shard(&self, shard_map: &ShardMap, location: ShardLocation) -> ShardResult<Shard> {
        location.validate()?;
        self.before_mutation(shard_map)?;

        let lsm = self.ctx.connect(&StoreScope::Local(location.clone()))?;
        let existing = lsm.read(Query::Shards {
            shard_map_id: shard_map.id,
        })?;
        if !existing.shards.is_empty() {
            return Err(ShardManagementError::ShardAlreadyExists(format!(
                "{} already holds a shard of '{}'; attach it instead",
                location, shard_map.name
            )));
        }

        let shard = Shard::new(shard_map, location);
        self.run(
            shard_map,
            OperationKind::AddShard {
                shard: shard.clone(),
            },
        )?;
        Ok(shard)
    }

    pub fn get_shards(&self, shard_map: &ShardMap) -> ShardResult<Vec<Shard>> {
        let mut shards = self
            .gsm()?
            .read(Query::Shards {
                shard_map_id: shard_map.id,
            })?
            .shards;
        shards.sort_by(|a, b| a.location.cmp(&b.location));
        Ok(shards)
    }

    pub fn get_shard(&self, shard_map: &ShardMap, location: &ShardLocation) -> ShardResult<Shard> {
        self.gsm()?
            .shard_by_location(Some(shard_map.id), location)?
            .ok_or_else(|| ShardManagementError::ShardDoesNotExist(location.to_string()))
    }

    pub fn update_shard_status(
        &self,
        shard_map: &ShardMap,
        shard: &Shard,
        status: ShardStatus,
    ) -> ShardResult<Shard> {
        self.before_mutation(shard_map)?;
        let before = self.current_shard(shard_map, shard.id)?;
        let mut after = before.clone();
        after.status = status;
        after.version += 1;
        self.run(
            shard_map,
            OperationKind::UpdateShard {
                before,
                after: after.clone(),
            },
        )?;
        Ok(after)
    }

    /// Removes a shard that has no mappings left.
    pub fn remove_shard(&self, shard_map: &ShardMap, shard: &Shard) -> ShardResult<()> {
        self.before_mutation(shard_map)?;
        let shard = self.current_shard(shard_map, shard.id)?;
        self.run(shard_map, OperationKind::RemoveShard { shard })
    }

    pub fn add_range_mapping(
        &self,
        shard_map: &ShardMap,
        shard: &Shard,
        range: ShardRange,
        status: MappingStatus,
    ) -> ShardResult<Mapping> {
        let mapping = Mapping::new_range(shard_map, shard, range, status)?;
        self.add_mapping(shard_map, shard, mapping)
    }

    pub fn add_point_mapping(
        &self,
        shard_map: &ShardMap,
        shard: &Shard,
        key: ShardKey,
        status: MappingStatus,
    ) -> ShardResult<Mapping> {
        if shard_map.kind != ShardMapKind::List {
            return Err(ShardManagementError::InvalidArgument(format!(
                "shard map '{}' is not a list shard map",
                shard_map.name
            )));
        }
        let mapping = Mapping::new_point(shard_map, shard, key, status)?;
        self.add_mapping(shard_map, shard, mapping)
    }

    fn add_mapping(
        &self,
        shard_map: &ShardMap,
        shard: &Shard,
        mapping: Mapping,
    ) -> ShardResult<Mapping> {
        self.before_mutation(shard_map)?;
        let shard = self.current_shard(shard_map, shard.id)?;
        self.replace(
            shard_map,
            &shard,
            &shard,
            Vec::new(),
            vec![mapping.clone()],
            LockOwnerId::NONE,
        )?;
        Ok(mapping)
    }

    /// Mappings of a shard map, optionally restricted to one shard, ordered
    /// by range.
    pub fn get_mappings(
        &self,
        shard_map: &ShardMap,
        shard: Option<&Shard>,
    ) -> ShardResult<Vec<Mapping>> {
        Ok(self.gsm()?.mappings(shard_map.id, shard.map(|s| s.id))?)
    }

    pub fn get_mappings_for_range(
        &self,
        shard_map: &ShardMap,
        range: &ShardRange,
    ) -> ShardResult<Vec<Mapping>> {
        range.check_type(shard_map.key_type)?;
        Ok(self
            .gsm()?
            .read(Query::MappingsIntersecting {
                shard_map_id: shard_map.id,
                range: range.clone(),
            })?
            .mappings)
    }

    pub fn get_mapping(&self, shard_map: &ShardMap, mapping_id: Uuid) -> ShardResult<Mapping> {
        let mapping = self
            .gsm()?
            .mapping_by_id(mapping_id)?
            .ok_or_else(|| ShardManagementError::MappingDoesNotExist(mapping_id.to_string()))?;
        mapping.check_owner(shard_map)?;
        Ok(mapping)
    }

    /// Resolves `key` to its mapping. Cached entries are served first; a
    /// miss reads the global map and fills the cache.
    pub fn lookup(&self, shard_map: &ShardMap, key: &ShardKey) -> ShardResult<Mapping> {
        if key.key_type() != shard_map.key_type {
            return Err(KeyError::TypeMismatch {
                left: shard_map.key_type,
                right: key.key_type(),
            }
            .into());
        }
        if let Some(mapping) = self.ctx.cache.lookup(shard_map.id, key) {
            debug!(shard_map = %shard_map.name, key = %key, "Lookup served from cache");
            return Ok(mapping);
        }

        let point = ShardRange::point(key.clone())?;
        let mapping = self
            .gsm()?
            .read(Query::MappingsIntersecting {
                shard_map_id: shard_map.id,
                range: point,
            })?
            .mappings
            .into_iter()
            .next()
            .ok_or_else(|| {
                ShardManagementError::MappingDoesNotExist(format!(
                    "no mapping for key {} in '{}'",
                    key, shard_map.name
                ))
            })?;
        if !mapping.is_online() {
            return Err(ShardManagementError::MappingIsOffline(format!(
                "mapping {} for key {}",
                mapping.range, key
            )));
        }
        self.ctx.cache.insert(&mapping);
        Ok(mapping)
    }

    /// Removes an offline mapping.
    pub fn remove_mapping(
        &self,
        shard_map: &ShardMap,
        mapping: &Mapping,
        lock_owner: LockOwnerId,
    ) -> ShardResult<()> {
        mapping.check_owner(shard_map)?;
        require_offline(mapping)?;
        self.before_mutation(shard_map)?;
        let shard = self.current_shard(shard_map, mapping.shard_id)?;
        self.replace(
            shard_map,
            &shard,
            &shard,
            vec![mapping.clone()],
            Vec::new(),
            lock_owner,
        )
    }

    /// Changes a mapping's status in place; the id is kept and the version
    /// bumped.
    pub fn update_mapping_status(
        &self,
        shard_map: &ShardMap,
        mapping: &Mapping,
        status: MappingStatus,
        lock_owner: LockOwnerId,
    ) -> ShardResult<Mapping> {
        mapping.check_owner(shard_map)?;
        self.before_mutation(shard_map)?;
        let shard = self.current_shard(shard_map, mapping.shard_id)?;
        let updated = mapping.with_status(status);
        self.replace(
            shard_map,
            &shard,
            &shard,
            vec![mapping.clone()],
            vec![updated.clone()],
            lock_owner,
        )?;
        Ok(updated)
    }

    /// Moves an offline mapping to another shard under a fresh id.
    pub fn move_mapping(
        &self,
        shard_map: &ShardMap,
        mapping: &Mapping,
        target: &Shard,
        lock_owner: LockOwnerId,
    ) -> ShardResult<Mapping> {
        mapping.check_owner(shard_map)?;
        require_offline(mapping)?;
        self.before_mutation(shard_map)?;
        let source = self.current_shard(shard_map, mapping.shard_id)?;
        let target = self.current_shard(shard_map, target.id)?;
        let mut moved = mapping.moved_to(&target);
        moved.lock_owner = mapping.lock_owner;
        self.replace(
            shard_map,
            &source,
            &target,
            vec![mapping.clone()],
            vec![moved.clone()],
            lock_owner,
        )?;
        Ok(moved)
    }

    /// Splits a range mapping at `key` into two fresh mappings.
    pub fn split_mapping(
        &self,
        shard_map: &ShardMap,
        mapping: &Mapping,
        key: &ShardKey,
        lock_owner: LockOwnerId,
    ) -> ShardResult<(Mapping, Mapping)> {
        mapping.check_owner(shard_map)?;
        self.before_mutation(shard_map)?;
        let shard = self.current_shard(shard_map, mapping.shard_id)?;
        let (mut left, mut right) = mapping.split_at(key)?;
        left.lock_owner = mapping.lock_owner;
        right.lock_owner = mapping.lock_owner;
        self.replace(
            shard_map,
            &shard,
            &shard,
            vec![mapping.clone()],
            vec![left.clone(), right.clone()],
            lock_owner,
        )?;
        Ok((left, right))
    }

    /// Merges two adjacent mappings of one shard into a fresh mapping.
    pub fn merge_mappings(
        &self,
        shard_map: &ShardMap,
        left: &Mapping,
        right: &Mapping,
        lock_owner: LockOwnerId,
    ) -> ShardResult<Mapping> {
        left.check_owner(shard_map)?;
        right.check_owner(shard_map)?;
        if left.status != right.status {
            return Err(ShardManagementError::InvalidArgument(
                "mappings with different status cannot be merged".to_string(),
            ));
        }
        self.before_mutation(shard_map)?;
        let shard = self.current_shard(shard_map, left.shard_id)?;
        let mut merged = left.merge_with(right)?;
        merged.lock_owner = left.lock_owner;
        self.replace(
            shard_map,
            &shard,
            &shard,
            vec![left.clone(), right.clone()],
            vec![merged.clone()],
            lock_owner,
        )?;
        Ok(merged)
    }

    pub fn lock_mapping(
        &self,
        shard_map: &ShardMap,
        mapping: &Mapping,
        owner: LockOwnerId,
    ) -> ShardResult<()> {
        if owner.is_none() || owner.is_force() {
            return Err(ShardManagementError::InvalidArgument(format!(
                "{} cannot be used as a lock owner",
                owner
            )));
        }
        mapping.check_owner(shard_map)?;
        self.lock_op(shard_map, LockMode::Lock(mapping.clone()), owner)
    }

    /// Unlocks a mapping held by `owner`; `LockOwnerId::FORCE` unlocks
    /// regardless of the holder.
    pub fn unlock_mapping(
        &self,
        shard_map: &ShardMap,
        mapping: &Mapping,
        owner: LockOwnerId,
    ) -> ShardResult<()> {
        mapping.check_owner(shard_map)?;
        self.lock_op(shard_map, LockMode::Unlock(mapping.clone()), owner)
    }

    pub fn unlock_all_for_owner(&self, shard_map: &ShardMap, owner: LockOwnerId) -> ShardResult<()> {
        self.lock_op(shard_map, LockMode::UnlockAllForOwner, owner)
    }

    pub fn unlock_all(&self, shard_map: &ShardMap) -> ShardResult<()> {
        self.lock_op(shard_map, LockMode::UnlockAll, LockOwnerId::FORCE)
    }

    /// Current lock owner of a mapping as held by the global map.
    pub fn get_lock_owner(&self, shard_map: &ShardMap, mapping: &Mapping) -> ShardResult<LockOwnerId> {
        Ok(self.get_mapping(shard_map, mapping.id)?.lock_owner)
    }

    /// Replays pending operations older than `min_age`, for one shard map
    /// or all of them.
    pub fn replay_pending_operations(
        &self,
        shard_map: Option<&ShardMap>,
        min_age: Duration,
    ) -> ShardResult<ReplaySummary> {
        replay_pending_operations(&self.ctx, shard_map.map(|m| m.id), min_age)
    }

    fn lock_op(&self, shard_map: &ShardMap, mode: LockMode, owner: LockOwnerId) -> ShardResult<()> {
        self.before_mutation(shard_map)?;
        self.run(shard_map, OperationKind::LockMappings { mode, owner })
    }

    fn replace(
        &self,
        shard_map: &ShardMap,
        source: &Shard,
        target: &Shard,
        removed: Vec<Mapping>,
        added: Vec<Mapping>,
        lock_owner: LockOwnerId,
    ) -> ShardResult<()> {
        self.run(
            shard_map,
            OperationKind::ReplaceMappings {
                source: source.clone(),
                target: target.clone(),
                removed,
                added,
                lock_owner,
            },
        )
    }

    fn run(&self, shard_map: &ShardMap, kind: OperationKind) -> ShardResult<()> {
        StoreOperation::new(&self.ctx, shard_map.clone(), kind).execute()
    }

    fn before_mutation(&self, shard_map: &ShardMap) -> ShardResult<()> {
        if !self.config.replay_on_access {
            return Ok(());
        }
        let summary =
            replay_pending_operations(&self.ctx, Some(shard_map.id), self.config.replay_grace)?;
        if !summary.is_empty() {
            info!(
                shard_map = %shard_map.name,
                completed = summary.completed,
                undone = summary.undone,
                deferred = summary.deferred,
                failed = summary.failed,
                "Replayed pending operations"
            );
        }
        Ok(())
    }

    fn current_shard(&self, shard_map: &ShardMap, shard_id: Uuid) -> ShardResult<Shard> {
        let shard = self
            .gsm()?
            .shard_by_id(shard_id)?
            .ok_or_else(|| ShardManagementError::ShardDoesNotExist(shard_id.to_string()))?;
        shard.check_owner(shard_map)?;
        Ok(shard)
    }

    fn gsm(&self) -> ShardResult<Arc<dyn MapStore>> {
        self.ctx.connect(&StoreScope::Global)
    }

    fn global_txn(&self, what: &str, compares: Vec<Compare>, ops: Vec<StoreOp>) -> ShardResult<()> {
        let gsm = self.gsm()?;
        retry_call(self.ctx.retry.as_ref(), what, || {
            Ok(gsm.txn(compares.clone(), ops.clone())?)
        })
    }
}

fn require_offline(mapping: &Mapping) -> ShardResult<()> {
    if mapping.is_online() {
        return Err(ShardManagementError::MappingIsNotOffline(format!(
            "mapping {} must be taken offline first",
            mapping.range
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::store::FaultyStoreProvider;

    fn test_config() -> ManagerConfig {
        ManagerConfig {
            retry_max_attempts: 2,
            retry_initial_delay: Duration::ZERO,
            retry_max_delay: Duration::ZERO,
            replay_grace: Duration::ZERO,
            ..Default::default()
        }
    }

    fn range(low: i32, high: i32) -> ShardRange {
        ShardRange::new(ShardKey::new(low).unwrap(), ShardKey::new(high).unwrap()).unwrap()
    }

    fn setup() -> (ShardMapManager, ShardMap, Shard) {
        let manager =
            ShardMapManager::new(Arc::new(SledStoreProvider::temporary()), test_config());
        let map = manager
            .create_shard_map("orders", ShardMapKind::Range, ShardKeyType::Int32)
            .unwrap();
        let shard = manager
            .add_shard(&map, ShardLocation::new("srv", "db0"))
            .unwrap();
        (manager, map, shard)
    }

    #[test]
    fn test_shard_map_lifecycle() {
        let manager =
            ShardMapManager::new(Arc::new(SledStoreProvider::temporary()), test_config());
        let map = manager
            .create_shard_map("orders", ShardMapKind::Range, ShardKeyType::Int32)
            .unwrap();
        let err = manager
            .create_shard_map("orders", ShardMapKind::List, ShardKeyType::Int64)
            .unwrap_err();
        assert!(matches!(err, ShardManagementError::ShardMapAlreadyExists(_)));

        let shard = manager
            .add_shard(&map, ShardLocation::new("srv", "db0"))
            .unwrap();
        let err = manager.delete_shard_map(&map).unwrap_err();
        assert!(matches!(err, ShardManagementError::ShardMapHasShards(_)));

        manager.remove_shard(&map, &shard).unwrap();
        manager.delete_shard_map(&map).unwrap();
        assert!(manager.list_shard_maps().unwrap().is_empty());
    }

    #[test]
    fn test_add_shard_refuses_populated_location() {
        let (manager, map, shard) = setup();
        let err = manager.add_shard(&map, shard.location.clone()).unwrap_err();
        assert!(matches!(err, ShardManagementError::ShardAlreadyExists(_)));
    }

    #[test]
    fn test_lookup_and_cache_invalidation() {
        let (manager, map, shard) = setup();
        let m = manager
            .add_range_mapping(&map, &shard, range(1, 10), MappingStatus::Online)
            .unwrap();

        let key = ShardKey::new(5i32).unwrap();
        assert_eq!(manager.lookup(&map, &key).unwrap().id, m.id);
        // second lookup comes from the cache
        assert_eq!(manager.lookup(&map, &key).unwrap().id, m.id);

        manager
            .update_mapping_status(&map, &m, MappingStatus::Offline, LockOwnerId::NONE)
            .unwrap();
        let err = manager.lookup(&map, &key).unwrap_err();
        assert!(matches!(err, ShardManagementError::MappingIsOffline(_)));

        let err = manager
            .lookup(&map, &ShardKey::new(50i32).unwrap())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_remove_requires_offline() {
        let (manager, map, shard) = setup();
        let m = manager
            .add_range_mapping(&map, &shard, range(1, 10), MappingStatus::Online)
            .unwrap();
        let err = manager
            .remove_mapping(&map, &m, LockOwnerId::NONE)
            .unwrap_err();
        assert!(matches!(err, ShardManagementError::MappingIsNotOffline(_)));

        let offline = manager
            .update_mapping_status(&map, &m, MappingStatus::Offline, LockOwnerId::NONE)
            .unwrap();
        manager
            .remove_mapping(&map, &offline, LockOwnerId::NONE)
            .unwrap();
        assert!(manager.get_mappings(&map, None).unwrap().is_empty());
    }

    #[test]
    fn test_split_and_merge() {
        let (manager, map, shard) = setup();
        let m = manager
            .add_range_mapping(&map, &shard, range(1, 10), MappingStatus::Online)
            .unwrap();
        let (left, right) = manager
            .split_mapping(&map, &m, &ShardKey::new(5i32).unwrap(), LockOwnerId::NONE)
            .unwrap();
        assert_eq!(left.range, range(1, 5));
        assert_eq!(right.range, range(5, 10));
        assert_eq!(manager.get_mappings(&map, Some(&shard)).unwrap().len(), 2);

        let merged = manager
            .merge_mappings(&map, &left, &right, LockOwnerId::NONE)
            .unwrap();
        assert_eq!(merged.range, range(1, 10));
        let all = manager.get_mappings(&map, None).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, merged.id);
    }

    #[test]
    fn test_locks() {
        let (manager, map, shard) = setup();
        let m = manager
            .add_range_mapping(&map, &shard, range(1, 10), MappingStatus::Online)
            .unwrap();
        let owner = LockOwnerId::new();
        manager.lock_mapping(&map, &m, owner).unwrap();
        assert_eq!(manager.get_lock_owner(&map, &m).unwrap(), owner);

        let err = manager
            .update_mapping_status(&map, &m, MappingStatus::Offline, LockOwnerId::new())
            .unwrap_err();
        assert!(matches!(err, ShardManagementError::MappingLockOwnerMismatch(_)));

        let err = manager.unlock_mapping(&map, &m, LockOwnerId::new()).unwrap_err();
        assert!(matches!(err, ShardManagementError::MappingLockOwnerMismatch(_)));

        manager.unlock_all_for_owner(&map, owner).unwrap();
        assert!(manager.get_lock_owner(&map, &m).unwrap().is_none());

        assert!(manager.lock_mapping(&map, &m, LockOwnerId::FORCE).is_err());
    }

    #[test]
    fn test_move_between_shards() {
        let (manager, map, a) = setup();
        let b = manager
            .add_shard(&map, ShardLocation::new("srv", "db1"))
            .unwrap();
        let m = manager
            .add_range_mapping(&map, &a, range(1, 10), MappingStatus::Offline)
            .unwrap();
        let moved = manager
            .move_mapping(&map, &m, &b, LockOwnerId::NONE)
            .unwrap();
        assert_ne!(moved.id, m.id);
        assert_eq!(moved.shard_id, b.id);
        assert!(manager.get_mappings(&map, Some(&a)).unwrap().is_empty());
        assert_eq!(manager.get_mappings(&map, Some(&b)).unwrap().len(), 1);
    }

    #[test]
    fn test_replay_on_access_clears_stuck_operation() {
        let faults = Arc::new(FaultyStoreProvider::new(Arc::new(
            SledStoreProvider::temporary(),
        )));
        let manager = ShardMapManager::new(faults.clone(), test_config());
        let map = manager
            .create_shard_map("orders", ShardMapKind::Range, ShardKeyType::Int32)
            .unwrap();
        let location = ShardLocation::new("srv", "db0");
        let shard = manager.add_shard(&map, location.clone()).unwrap();

        // The shard goes away in the middle of an add.
        faults.set_unreachable(&StoreScope::Local(location.clone()), true);
        let err = manager
            .add_range_mapping(&map, &shard, range(1, 10), MappingStatus::Online)
            .unwrap_err();
        assert!(err.is_transient());
        faults.set_unreachable(&StoreScope::Local(location), false);

        // The next mutation undoes the stuck entry first, so the range is free.
        manager
            .add_range_mapping(&map, &shard, range(1, 10), MappingStatus::Online)
            .unwrap();
        let summary = manager
            .replay_pending_operations(Some(&map), Duration::ZERO)
            .unwrap();
        assert!(summary.is_empty());
    }
}
