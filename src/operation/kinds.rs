//! Per-kind step bodies.
//!
//! Each operation kind describes its steps as pure functions returning the
//! guards and writes for one store. The engine owns sequencing, log entry
//! bookkeeping, retries and cache invalidation; nothing here does I/O.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

use super::OperationCode;
use crate::mapping::{LockOwnerId, Mapping, Shard, ShardLocation, ShardMap};
use crate::store::{Compare, StoreOp};

/// Guards and writes for one transaction.
#[derive(Clone, Debug, Default)]
pub struct StepPlan {
    pub compares: Vec<Compare>,
    pub ops: Vec<StoreOp>,
}

impl StepPlan {
    fn new(compares: Vec<Compare>, ops: Vec<StoreOp>) -> Self {
        Self { compares, ops }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum LockMode {
    Lock(Mapping),
    Unlock(Mapping),
    UnlockAllForOwner,
    UnlockAll,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum OperationKind {
    AddShard {
        shard: Shard,
    },
    RemoveShard {
        shard: Shard,
    },
    /// Status change; `after.version` is `before.version + 1`.
    UpdateShard {
        before: Shard,
        after: Shard,
    },
    /// Registers a shard found at a new location, rewriting its local records.
    AttachShard {
        shard: Shard,
        previous: Shard,
        local_mappings: Vec<Mapping>,
    },
    /// Global only; local contents are left alone.
    DetachShard {
        shard: Shard,
    },
    /// Add, remove, update, move, split and merge of mappings. `removed`
    /// live on `source`, `added` land on `target`.
    ReplaceMappings {
        source: Shard,
        target: Shard,
        removed: Vec<Mapping>,
        added: Vec<Mapping>,
        lock_owner: LockOwnerId,
    },
    LockMappings {
        mode: LockMode,
        owner: LockOwnerId,
    },
    /// Recovery repair writing the global store only.
    ReplaceMappingsGlobal {
        shard: Shard,
        removed: Vec<Mapping>,
        added: Vec<Mapping>,
    },
    /// Recovery repair writing one shard's local store only.
    ReplaceMappingsLocal {
        shard: Shard,
        removed: Vec<Mapping>,
        added: Vec<Mapping>,
    },
}

fn ids(mappings: &[Mapping]) -> Vec<Uuid> {
    mappings.iter().map(|m| m.id).collect()
}

fn cleared(mapping: &Mapping) -> Mapping {
    let mut m = mapping.clone();
    m.pending_operation = None;
    m
}

impl OperationKind {
    pub fn code(&self) -> OperationCode {
        match self {
            OperationKind::AddShard { .. } => OperationCode::AddShard,
            OperationKind::RemoveShard { .. } => OperationCode::RemoveShard,
            OperationKind::UpdateShard { .. } => OperationCode::UpdateShard,
            OperationKind::AttachShard { .. } => OperationCode::AttachShard,
            OperationKind::DetachShard { .. } => OperationCode::DetachShard,
            OperationKind::ReplaceMappings { removed, added, .. } => {
                match (removed.as_slice(), added.as_slice()) {
                    ([], [_]) => OperationCode::AddMapping,
                    ([_], []) => OperationCode::RemoveMapping,
                    ([r], [a]) if r.id == a.id => OperationCode::UpdateMapping,
                    _ => OperationCode::ReplaceMappings,
                }
            }
            OperationKind::LockMappings { .. } => OperationCode::LockOrUnlockMappings,
            OperationKind::ReplaceMappingsGlobal { .. } => OperationCode::ReplaceMappingsGlobal,
            OperationKind::ReplaceMappingsLocal { .. } => OperationCode::ReplaceMappingsLocal,
        }
    }

    /// Shard whose local store is written by the source step.
    pub fn source_location(&self) -> Option<&ShardLocation> {
        match self {
            OperationKind::AddShard { shard }
            | OperationKind::RemoveShard { shard }
            | OperationKind::AttachShard { shard, .. }
            | OperationKind::ReplaceMappingsLocal { shard, .. } => Some(&shard.location),
            OperationKind::UpdateShard { before, .. } => Some(&before.location),
            OperationKind::ReplaceMappings { source, .. } => Some(&source.location),
            OperationKind::DetachShard { .. }
            | OperationKind::LockMappings { .. }
            | OperationKind::ReplaceMappingsGlobal { .. } => None,
        }
    }

    /// Second shard of a cross-shard move.
    pub fn target_location(&self) -> Option<&ShardLocation> {
        match self {
            OperationKind::ReplaceMappings { source, target, .. } if source.id != target.id => {
                Some(&target.location)
            }
            _ => None,
        }
    }

    /// Mapping ids whose cached copies are stale once the operation ends.
    pub fn touched_mappings(&self) -> Vec<Uuid> {
        match self {
            OperationKind::ReplaceMappings { removed, added, .. }
            | OperationKind::ReplaceMappingsGlobal { removed, added, .. }
            | OperationKind::ReplaceMappingsLocal { removed, added, .. } => {
                let mut out = ids(removed);
                out.extend(ids(added));
                out
            }
            OperationKind::LockMappings {
                mode: LockMode::Lock(m) | LockMode::Unlock(m),
                ..
            } => vec![m.id],
            _ => Vec::new(),
        }
    }

    /// True when every cached entry of the shard map must be dropped.
    pub fn invalidates_shard_map(&self) -> bool {
        matches!(
            self,
            OperationKind::RemoveShard { .. }
                | OperationKind::UpdateShard { .. }
                | OperationKind::AttachShard { .. }
                | OperationKind::DetachShard { .. }
        )
    }

    pub fn global_pre(&self, op_id: Uuid, map: &ShardMap) -> StepPlan {
        let mut compares = vec![Compare::ShardMapExists(map.id)];
        let mut ops = Vec::new();
        match self {
            OperationKind::AddShard { shard } | OperationKind::AttachShard { shard, .. } => {
                compares.push(Compare::ShardAbsent(shard.id));
                compares.push(Compare::ShardLocationFree {
                    shard_map_id: map.id,
                    location: shard.location.clone(),
                });
            }
            OperationKind::RemoveShard { shard } => {
                compares.push(Compare::ShardVersion {
                    shard_id: shard.id,
                    version: shard.version,
                });
                compares.push(Compare::NoMappingsOnShard(shard.id));
            }
            OperationKind::UpdateShard { before, .. } => {
                compares.push(Compare::ShardVersion {
                    shard_id: before.id,
                    version: before.version,
                });
            }
            OperationKind::DetachShard { shard } => {
                compares.push(Compare::ShardExists(shard.id));
            }
            OperationKind::ReplaceMappings {
                source,
                target,
                removed,
                added,
                lock_owner,
            } => {
                compares.extend(shard_versions(source, target));
                compares.extend(removed_guards(op_id, removed, Some(*lock_owner)));
                let removed_ids = ids(removed);
                for a in added {
                    if !removed_ids.contains(&a.id) {
                        compares.push(Compare::MappingAbsent(a.id));
                    }
                    compares.push(Compare::RangeFree {
                        shard_map_id: map.id,
                        range: a.range.clone(),
                        ignoring: removed_ids.clone(),
                    });
                }
                ops.extend(mark_pending(removed, Some(op_id)));
            }
            OperationKind::LockMappings { mode, owner } => {
                compares.extend(lock_guards(op_id, mode, *owner));
            }
            OperationKind::ReplaceMappingsGlobal { shard, removed, .. } => {
                compares.push(Compare::ShardExists(shard.id));
                compares.extend(removed_guards(op_id, removed, None));
                ops.extend(mark_pending(removed, Some(op_id)));
            }
            // The global store may have lost the shard; only the map is required.
            OperationKind::ReplaceMappingsLocal { .. } => {}
        }
        StepPlan::new(compares, ops)
    }

    pub fn local_source(&self, map: &ShardMap) -> StepPlan {
        let ops = match self {
            OperationKind::AddShard { shard } => {
                vec![StoreOp::PutShardMap(map.clone()), StoreOp::PutShard(shard.clone())]
            }
            OperationKind::RemoveShard { shard } => vec![
                StoreOp::DeleteMappingsForShard(shard.id),
                StoreOp::DeleteShard(shard.id),
            ],
            OperationKind::UpdateShard { after, .. } => vec![StoreOp::PutShard(after.clone())],
            OperationKind::AttachShard {
                shard,
                local_mappings,
                ..
            } => {
                let mut ops = vec![StoreOp::PutShardMap(map.clone()), StoreOp::PutShard(shard.clone())];
                ops.extend(
                    local_mappings
                        .iter()
                        .map(|m| StoreOp::PutMapping(m.relocated(&shard.location).local_copy())),
                );
                ops
            }
            OperationKind::ReplaceMappings {
                source,
                target,
                removed,
                added,
                ..
            } => {
                let mut ops: Vec<StoreOp> =
                    removed.iter().map(|r| StoreOp::DeleteMapping(r.id)).collect();
                if source.id == target.id {
                    ops.extend(added.iter().map(|a| StoreOp::PutMapping(a.local_copy())));
                }
                ops
            }
            OperationKind::ReplaceMappingsLocal { removed, added, .. } => {
                let mut ops: Vec<StoreOp> =
                    removed.iter().map(|r| StoreOp::DeleteMapping(r.id)).collect();
                ops.extend(added.iter().map(|a| StoreOp::PutMapping(a.local_copy())));
                ops
            }
            OperationKind::DetachShard { .. }
            | OperationKind::LockMappings { .. }
            | OperationKind::ReplaceMappingsGlobal { .. } => Vec::new(),
        };
        StepPlan::new(Vec::new(), ops)
    }

    pub fn local_target(&self, _map: &ShardMap) -> StepPlan {
        match self {
            OperationKind::ReplaceMappings {
                source,
                target,
                added,
                ..
            } if source.id != target.id => StepPlan::new(
                Vec::new(),
                added.iter().map(|a| StoreOp::PutMapping(a.local_copy())).collect(),
            ),
            _ => StepPlan::default(),
        }
    }

    pub fn global_post(&self, op_id: Uuid, map: &ShardMap) -> StepPlan {
        let mut compares = Vec::new();
        let mut ops = Vec::new();
        match self {
            OperationKind::AddShard { shard } | OperationKind::AttachShard { shard, .. } => {
                compares.push(Compare::ShardAbsent(shard.id));
                compares.push(Compare::ShardLocationFree {
                    shard_map_id: map.id,
                    location: shard.location.clone(),
                });
                ops.push(StoreOp::PutShard(shard.clone()));
            }
            OperationKind::RemoveShard { shard } => {
                compares.push(Compare::ShardVersion {
                    shard_id: shard.id,
                    version: shard.version,
                });
                compares.push(Compare::NoMappingsOnShard(shard.id));
                ops.push(StoreOp::DeleteShard(shard.id));
            }
            OperationKind::UpdateShard { before, after } => {
                compares.push(Compare::ShardVersion {
                    shard_id: before.id,
                    version: before.version,
                });
                ops.push(StoreOp::PutShard(after.clone()));
            }
            OperationKind::DetachShard { shard } => {
                compares.push(Compare::ShardExists(shard.id));
                ops.push(StoreOp::DeleteMappingsForShard(shard.id));
                ops.push(StoreOp::DeleteShard(shard.id));
            }
            OperationKind::ReplaceMappings {
                source,
                target,
                removed,
                added,
                ..
            } => {
                compares.extend(shard_versions(source, target));
                compares.extend(removed_guards(op_id, removed, None));
                compares.extend(ranges_free(map, removed, added));
                ops.extend(removed.iter().map(|r| StoreOp::DeleteMapping(r.id)));
                ops.extend(added.iter().map(|a| StoreOp::PutMapping(cleared(a))));
                ops.push(StoreOp::BumpShardVersion(source.id));
                if source.id != target.id {
                    ops.push(StoreOp::BumpShardVersion(target.id));
                }
            }
            OperationKind::LockMappings { mode, owner } => {
                compares.extend(lock_guards(op_id, mode, *owner));
                ops.push(match mode {
                    LockMode::Lock(m) => StoreOp::SetMappingLockOwner {
                        mapping_id: m.id,
                        owner: *owner,
                    },
                    LockMode::Unlock(m) => StoreOp::SetMappingLockOwner {
                        mapping_id: m.id,
                        owner: LockOwnerId::NONE,
                    },
                    LockMode::UnlockAllForOwner => StoreOp::UnlockMappings {
                        shard_map_id: map.id,
                        owner: Some(*owner),
                    },
                    LockMode::UnlockAll => StoreOp::UnlockMappings {
                        shard_map_id: map.id,
                        owner: None,
                    },
                });
            }
            OperationKind::ReplaceMappingsGlobal {
                shard,
                removed,
                added,
            } => {
                compares.push(Compare::ShardExists(shard.id));
                compares.extend(removed_guards(op_id, removed, None));
                compares.extend(ranges_free(map, removed, added));
                ops.extend(removed.iter().map(|r| StoreOp::DeleteMapping(r.id)));
                ops.extend(added.iter().map(|a| StoreOp::PutMapping(cleared(a))));
                ops.push(StoreOp::BumpShardVersion(shard.id));
            }
            OperationKind::ReplaceMappingsLocal { .. } => {}
        }
        StepPlan::new(compares, ops)
    }

    pub fn undo_local_target(&self, _map: &ShardMap) -> StepPlan {
        match self {
            OperationKind::ReplaceMappings {
                source,
                target,
                added,
                ..
            } if source.id != target.id => StepPlan::new(
                Vec::new(),
                added.iter().map(|a| StoreOp::DeleteMapping(a.id)).collect(),
            ),
            _ => StepPlan::default(),
        }
    }

    pub fn undo_local_source(&self, map: &ShardMap) -> StepPlan {
        let ops = match self {
            OperationKind::AddShard { shard } => vec![StoreOp::DeleteShard(shard.id)],
            OperationKind::RemoveShard { shard } => {
                vec![StoreOp::PutShardMap(map.clone()), StoreOp::PutShard(shard.clone())]
            }
            OperationKind::UpdateShard { before, .. } => vec![StoreOp::PutShard(before.clone())],
            OperationKind::AttachShard {
                previous,
                local_mappings,
                ..
            } => {
                let mut ops = vec![StoreOp::PutShard(previous.clone())];
                ops.extend(local_mappings.iter().map(|m| StoreOp::PutMapping(m.clone())));
                ops
            }
            OperationKind::ReplaceMappings {
                source,
                target,
                removed,
                added,
                ..
            } => {
                let mut ops = Vec::new();
                if source.id == target.id {
                    ops.extend(added.iter().map(|a| StoreOp::DeleteMapping(a.id)));
                }
                ops.extend(removed.iter().map(|r| StoreOp::PutMapping(r.local_copy())));
                ops
            }
            OperationKind::ReplaceMappingsLocal { removed, added, .. } => {
                let mut ops: Vec<StoreOp> =
                    added.iter().map(|a| StoreOp::DeleteMapping(a.id)).collect();
                ops.extend(removed.iter().map(|r| StoreOp::PutMapping(r.local_copy())));
                ops
            }
            OperationKind::DetachShard { .. }
            | OperationKind::LockMappings { .. }
            | OperationKind::ReplaceMappingsGlobal { .. } => Vec::new(),
        };
        StepPlan::new(Vec::new(), ops)
    }

    pub fn undo_global_pre(&self, _op_id: Uuid, _map: &ShardMap) -> StepPlan {
        let ops = match self {
            OperationKind::ReplaceMappings { removed, .. }
            | OperationKind::ReplaceMappingsGlobal { removed, .. } => mark_pending(removed, None),
            _ => Vec::new(),
        };
        StepPlan::new(Vec::new(), ops)
    }
}

fn shard_versions(source: &Shard, target: &Shard) -> Vec<Compare> {
    let mut out = vec![Compare::ShardVersion {
        shard_id: source.id,
        version: source.version,
    }];
    if source.id != target.id {
        out.push(Compare::ShardVersion {
            shard_id: target.id,
            version: target.version,
        });
    }
    out
}

fn removed_guards(op_id: Uuid, removed: &[Mapping], owner: Option<LockOwnerId>) -> Vec<Compare> {
    let mut out = Vec::new();
    for r in removed {
        out.push(Compare::MappingVersion {
            mapping_id: r.id,
            version: r.version,
        });
        if let Some(owner) = owner {
            out.push(Compare::MappingLockedBy {
                mapping_id: r.id,
                owner,
            });
        }
        out.push(Compare::MappingNotPending {
            mapping_id: r.id,
            operation_id: op_id,
        });
    }
    out
}

fn ranges_free(map: &ShardMap, removed: &[Mapping], added: &[Mapping]) -> Vec<Compare> {
    let removed_ids = ids(removed);
    added
        .iter()
        .map(|a| Compare::RangeFree {
            shard_map_id: map.id,
            range: a.range.clone(),
            ignoring: removed_ids.clone(),
        })
        .collect()
}

fn mark_pending(mappings: &[Mapping], op: Option<Uuid>) -> Vec<StoreOp> {
    let mut seen = HashSet::new();
    mappings
        .iter()
        .filter(|m| seen.insert(m.id))
        .map(|m| StoreOp::SetMappingPending {
            mapping_id: m.id,
            operation_id: op,
        })
        .collect()
}

fn lock_guards(op_id: Uuid, mode: &LockMode, owner: LockOwnerId) -> Vec<Compare> {
    match mode {
        LockMode::Lock(m) => vec![
            Compare::MappingLockedBy {
                mapping_id: m.id,
                owner: LockOwnerId::NONE,
            },
            Compare::MappingNotPending {
                mapping_id: m.id,
                operation_id: op_id,
            },
        ],
        LockMode::Unlock(m) => vec![Compare::MappingLockedBy {
            mapping_id: m.id,
            owner,
        }],
        LockMode::UnlockAllForOwner | LockMode::UnlockAll => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{ShardKey, ShardKeyType, ShardRange};
    use crate::mapping::{MappingStatus, ShardMapKind};

    fn fixture() -> (ShardMap, Shard, Shard) {
        let map = ShardMap::new("orders", ShardMapKind::Range, ShardKeyType::Int32);
        let a = Shard::new(&map, ShardLocation::new("srv", "db0"));
        let b = Shard::new(&map, ShardLocation::new("srv", "db1"));
        (map, a, b)
    }

    fn mapping(map: &ShardMap, shard: &Shard, low: i32, high: i32) -> Mapping {
        let range =
            ShardRange::new(ShardKey::new(low).unwrap(), ShardKey::new(high).unwrap()).unwrap();
        Mapping::new_range(map, shard, range, MappingStatus::Online).unwrap()
    }

    #[test]
    fn test_codes() {
        let (map, a, _) = fixture();
        let m = mapping(&map, &a, 1, 10);
        let add = OperationKind::ReplaceMappings {
            source: a.clone(),
            target: a.clone(),
            removed: vec![],
            added: vec![m.clone()],
            lock_owner: LockOwnerId::NONE,
        };
        assert_eq!(add.code(), OperationCode::AddMapping);

        let update = OperationKind::ReplaceMappings {
            source: a.clone(),
            target: a.clone(),
            removed: vec![m.clone()],
            added: vec![m.with_status(MappingStatus::Offline)],
            lock_owner: LockOwnerId::NONE,
        };
        assert_eq!(update.code(), OperationCode::UpdateMapping);
    }

    #[test]
    fn test_same_shard_replace_has_no_target_step() {
        let (map, a, _) = fixture();
        let m = mapping(&map, &a, 1, 10);
        let (l, r) = m.split_at(&ShardKey::new(5i32).unwrap()).unwrap();
        let kind = OperationKind::ReplaceMappings {
            source: a.clone(),
            target: a.clone(),
            removed: vec![m.clone()],
            added: vec![l, r],
            lock_owner: LockOwnerId::NONE,
        };
        assert!(kind.target_location().is_none());
        assert!(kind.local_target(&map).ops.is_empty());

        // deletes come before puts
        let ops = kind.local_source(&map).ops;
        assert_eq!(ops.len(), 3);
        assert!(matches!(ops[0], StoreOp::DeleteMapping(id) if id == m.id));
        assert!(matches!(ops[1], StoreOp::PutMapping(_)));
    }

    #[test]
    fn test_move_splits_work_between_shards() {
        let (map, a, b) = fixture();
        let m = mapping(&map, &a, 1, 10);
        let moved = m.moved_to(&b);
        let kind = OperationKind::ReplaceMappings {
            source: a.clone(),
            target: b.clone(),
            removed: vec![m.clone()],
            added: vec![moved.clone()],
            lock_owner: LockOwnerId::NONE,
        };
        assert_eq!(kind.source_location(), Some(&a.location));
        assert_eq!(kind.target_location(), Some(&b.location));
        assert_eq!(kind.local_source(&map).ops.len(), 1);
        assert_eq!(kind.local_target(&map).ops.len(), 1);

        let post = kind.global_post(Uuid::new_v4(), &map);
        let bumps = post
            .ops
            .iter()
            .filter(|op| matches!(op, StoreOp::BumpShardVersion(_)))
            .count();
        assert_eq!(bumps, 2);
    }

    #[test]
    fn test_pre_marks_removed_mappings_pending() {
        let (map, a, _) = fixture();
        let m = mapping(&map, &a, 1, 10);
        let op_id = Uuid::new_v4();
        let kind = OperationKind::ReplaceMappings {
            source: a.clone(),
            target: a.clone(),
            removed: vec![m.clone()],
            added: vec![],
            lock_owner: LockOwnerId::NONE,
        };
        let pre = kind.global_pre(op_id, &map);
        assert!(pre.ops.iter().any(|op| matches!(
            op,
            StoreOp::SetMappingPending { mapping_id, operation_id: Some(o) }
                if *mapping_id == m.id && *o == op_id
        )));
        let undo = kind.undo_global_pre(op_id, &map);
        assert!(matches!(
            undo.ops[0],
            StoreOp::SetMappingPending { operation_id: None, .. }
        ));
    }

    #[test]
    fn test_lock_is_global_only() {
        let (map, a, _) = fixture();
        let m = mapping(&map, &a, 1, 10);
        let kind = OperationKind::LockMappings {
            mode: LockMode::Lock(m),
            owner: LockOwnerId::new(),
        };
        assert!(kind.source_location().is_none());
        assert!(kind.local_source(&map).ops.is_empty());
    }
}
