//! Recovery: detection and repair of divergence between the global shard map
//! and the local copies kept on each shard.
//!
//! Detection produces one token per (shard, shard map) pair. Tokens hold a
//! snapshot of both sides and are consumed by a resolution or a rebuild,
//! discarded explicitly, or superseded by the next detection of the same pair.
//! Every repair of an existing shard runs through the operation engine, so
//! an interrupted repair is replayed like any other operation.

pub mod compare;

pub use compare::{compare_mappings, MappingDifference, MappingLocation};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ShardManagementError, ShardResult};
use crate::key::ShardRange;
use crate::mapping::{Mapping, Shard, ShardLocation, ShardMap};
use crate::operation::{OperationContext, OperationKind, StoreOperation};
use crate::retry::retry_call;
use crate::store::{MapStore, MapStoreExt, Query, StoreOp, StoreScope};

/// Handle to one detection result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecoveryToken(Uuid);

impl RecoveryToken {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn id(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for RecoveryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Which side wins when resolving a token.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MappingDifferenceResolution {
    /// The shard's local mappings are authoritative; the global map is rewritten.
    KeepShardMapping,
    /// The global map is authoritative; the shard's local mappings are rewritten.
    KeepShardMapMapping,
}

#[derive(Clone)]
struct RecoveryState {
    location: ShardLocation,
    shard_map: ShardMap,
    local_shard: Shard,
    global_shard: Option<Shard>,
    shard_map_mappings: Vec<Mapping>,
    shard_mappings: Vec<Mapping>,
    comparison: Vec<MappingDifference>,
}

impl RecoveryState {
    fn conflicts(&self) -> Vec<ShardRange> {
        let mut out: Vec<ShardRange> = self
            .comparison
            .iter()
            .filter(|d| d.is_conflict())
            .map(|d| d.range.clone())
            .collect();
        out.dedup();
        out
    }
}

pub struct RecoveryManager {
    ctx: OperationContext,
    tokens: DashMap<RecoveryToken, RecoveryState>,
}

impl RecoveryManager {
    pub fn new(ctx: OperationContext) -> Self {
        Self {
            ctx,
            tokens: DashMap::new(),
        }
    }

    /// Compares the shard at `location` with the global map, one token per
    /// shard map found in the shard's local store.
    pub fn detect_mapping_differences(
        &self,
        location: &ShardLocation,
        shard_map_name: Option<&str>,
    ) -> ShardResult<Vec<RecoveryToken>> {
        location.validate()?;
        let lsm = self.ctx.connect(&StoreScope::Local(location.clone()))?;
        let gsm = self.ctx.connect(&StoreScope::Global)?;

        let mut tokens = Vec::new();
        for shard_map in local_shard_maps(lsm.as_ref(), shard_map_name)? {
            let Some(local_shard) = find_local_shard(lsm.as_ref(), &shard_map, location)? else {
                warn!(
                    shard_map = %shard_map.name,
                    location = %location,
                    "Local store has a shard map but no shard record, skipping"
                );
                continue;
            };
            let shard_mappings = lsm.mappings(shard_map.id, Some(local_shard.id))?;
            let global_shard = gsm.shard_by_location(Some(shard_map.id), location)?;
            let shard_map_mappings = match &global_shard {
                Some(shard) => gsm.mappings(shard_map.id, Some(shard.id))?,
                None => Vec::new(),
            };
            let comparison = compare_mappings(&shard_map_mappings, &shard_mappings)?;

            // A fresh snapshot supersedes older tokens for the same pair.
            let before = self.tokens.len();
            self.tokens.retain(|_, state| {
                state.location != *location || state.shard_map.id != shard_map.id
            });
            let superseded = before.saturating_sub(self.tokens.len());
            if superseded > 0 {
                debug!(
                    shard_map = %shard_map.name,
                    location = %location,
                    superseded,
                    "Dropped superseded recovery tokens"
                );
            }

            let token = RecoveryToken::new();
            let conflicts = comparison.iter().filter(|d| d.is_conflict()).count();
            info!(
                token = %token,
                shard_map = %shard_map.name,
                location = %location,
                registered = global_shard.is_some(),
                conflicts,
                "Detected mapping differences"
            );
            self.tokens.insert(
                token,
                RecoveryState {
                    location: location.clone(),
                    shard_map,
                    local_shard,
                    global_shard,
                    shard_map_mappings,
                    shard_mappings,
                    comparison,
                },
            );
            tokens.push(token);
        }
        Ok(tokens)
    }

    /// Conflicting sub-ranges, ordered by range.
    pub fn get_mapping_differences(
        &self,
        token: RecoveryToken,
    ) -> ShardResult<Vec<(ShardRange, MappingLocation)>> {
        let state = self.state(token)?;
        Ok(state
            .comparison
            .iter()
            .filter(|d| d.is_conflict())
            .map(|d| (d.range.clone(), d.location))
            .collect())
    }

    /// Every classified sub-range, agreeing ones included.
    pub fn get_mapping_comparison(
        &self,
        token: RecoveryToken,
    ) -> ShardResult<Vec<MappingDifference>> {
        Ok(self.state(token)?.comparison)
    }

    pub fn shard_location(&self, token: RecoveryToken) -> ShardResult<ShardLocation> {
        Ok(self.state(token)?.location)
    }

    pub fn shard_map(&self, token: RecoveryToken) -> ShardResult<ShardMap> {
        Ok(self.state(token)?.shard_map)
    }

    /// Forgets a token without acting on it. Returns false if it was unknown.
    pub fn discard_token(&self, token: RecoveryToken) -> bool {
        self.tokens.remove(&token).is_some()
    }

    /// Number of tokens not yet consumed.
    pub fn outstanding_tokens(&self) -> usize {
        self.tokens.len()
    }

    /// Makes the losing side match the winning side on every conflicting
    /// sub-range. Mappings touching only agreeing sub-ranges are not written.
    /// The token is consumed on success.
    pub fn resolve_mapping_differences(
        &self,
        token: RecoveryToken,
        resolution: MappingDifferenceResolution,
    ) -> ShardResult<()> {
        let state = self.state(token)?;
        let conflicts = state.conflicts();
        if conflicts.is_empty() {
            self.tokens.remove(&token);
            return Ok(());
        }

        let (trusted, untrusted) = match resolution {
            MappingDifferenceResolution::KeepShardMapping => {
                (&state.shard_mappings, &state.shard_map_mappings)
            }
            MappingDifferenceResolution::KeepShardMapMapping => {
                self.ensure_local_unchanged(&state)?;
                (&state.shard_map_mappings, &state.shard_mappings)
            }
        };

        let groups = repair_groups(trusted, untrusted, &conflicts);
        info!(
            token = %token,
            shard_map = %state.shard_map.name,
            location = %state.location,
            ?resolution,
            groups = groups.len(),
            "Resolving mapping differences"
        );

        for (removed, added) in groups {
            let kind = match resolution {
                MappingDifferenceResolution::KeepShardMapping => {
                    let shard = state.global_shard.clone().ok_or_else(|| {
                        ShardManagementError::ShardDoesNotExist(format!(
                            "{} is not registered in shard map '{}'; attach it first",
                            state.location, state.shard_map.name
                        ))
                    })?;
                    let added = added
                        .iter()
                        .map(|m| global_record(m, &shard, &removed))
                        .collect();
                    OperationKind::ReplaceMappingsGlobal {
                        shard,
                        removed,
                        added,
                    }
                }
                MappingDifferenceResolution::KeepShardMapMapping => {
                    let added = added
                        .iter()
                        .map(|m| local_record(m, &state.local_shard, &state.location))
                        .collect();
                    OperationKind::ReplaceMappingsLocal {
                        shard: state.local_shard.clone(),
                        removed,
                        added,
                    }
                }
            };
            StoreOperation::new(&self.ctx, state.shard_map.clone(), kind).execute()?;
        }

        self.tokens.remove(&token);
        Ok(())
    }

    /// Rewrites the shard's local mappings from the global map, except on
    /// `ranges_to_keep`, where the shard's own mappings are kept. Each range
    /// must be a conflicting sub-range reported for this token. The token is
    /// consumed on success.
    pub fn rebuild_mappings_on_shard(
        &self,
        token: RecoveryToken,
        ranges_to_keep: &[ShardRange],
    ) -> ShardResult<()> {
        let state = self.state(token)?;
        let conflicts = state.conflicts();
        for range in ranges_to_keep {
            if !conflicts.contains(range) {
                return Err(ShardManagementError::InvalidArgument(format!(
                    "range {} was not reported as a difference for token {}",
                    range, token
                )));
            }
        }
        self.ensure_local_unchanged(&state)?;

        let target: Vec<Mapping> = rebuilt_mappings(&state, ranges_to_keep)
            .into_iter()
            .map(|m| local_record(&m, &state.local_shard, &state.location))
            .collect();

        let unchanged = |m: &Mapping, set: &[Mapping]| {
            set.iter()
                .any(|o| o.same_record(m) && o.range == m.range && o.status == m.status)
        };
        let removed: Vec<Mapping> = state
            .shard_mappings
            .iter()
            .filter(|m| !unchanged(m, &target))
            .cloned()
            .collect();
        let added: Vec<Mapping> = target
            .iter()
            .filter(|m| !unchanged(m, &state.shard_mappings))
            .cloned()
            .collect();

        info!(
            token = %token,
            shard_map = %state.shard_map.name,
            location = %state.location,
            kept = ranges_to_keep.len(),
            removed = removed.len(),
            added = added.len(),
            "Rebuilding mappings on shard"
        );

        if !removed.is_empty() || !added.is_empty() {
            let kind = OperationKind::ReplaceMappingsLocal {
                shard: state.local_shard.clone(),
                removed,
                added,
            };
            StoreOperation::new(&self.ctx, state.shard_map.clone(), kind).execute()?;
        }

        self.tokens.remove(&token);
        Ok(())
    }

    /// Rebuilds the global map from the local stores at `locations`.
    ///
    /// Everything is validated before anything is written; overlapping
    /// claims fail with `DataIntegrity`. The global writes commit in one
    /// transaction. Returns the number of mappings restored.
    pub fn rebuild_mappings_on_shard_map_manager_from_shards(
        &self,
        locations: &[ShardLocation],
    ) -> ShardResult<usize> {
        let mut seen = HashSet::new();
        let mut restored: BTreeMap<Uuid, Vec<RestoredShard>> = BTreeMap::new();
        for location in locations {
            if !seen.insert(location.clone()) {
                continue;
            }
            location.validate()?;
            let lsm = self.ctx.connect(&StoreScope::Local(location.clone()))?;
            for shard_map in local_shard_maps(lsm.as_ref(), None)? {
                let Some(mut shard) = find_local_shard(lsm.as_ref(), &shard_map, location)? else {
                    continue;
                };
                let mappings = lsm
                    .mappings(shard_map.id, Some(shard.id))?
                    .into_iter()
                    .map(|m| m.relocated(location))
                    .collect();
                shard.location = location.clone();
                restored.entry(shard_map.id).or_default().push(RestoredShard {
                    shard_map,
                    shard,
                    mappings,
                });
            }
        }

        let gsm = self.ctx.connect(&StoreScope::Global)?;
        let mut problems = Vec::new();
        let mut ops = Vec::new();
        let mut count = 0;
        for group in restored.values() {
            // The global definition wins when it survived; otherwise the first shard's.
            let (shard_map, origin) = match gsm.shard_map_by_id(group[0].shard_map.id)? {
                Some(existing) => (existing, "the global store".to_string()),
                None => (
                    group[0].shard_map.clone(),
                    group[0].shard.location.to_string(),
                ),
            };
            let mut accepted = Vec::with_capacity(group.len());
            for r in group {
                if r.shard_map.name != shard_map.name
                    || r.shard_map.kind != shard_map.kind
                    || r.shard_map.key_type != shard_map.key_type
                {
                    problems.push(format!(
                        "shard map {} is defined differently on {} and {}",
                        shard_map.id, origin, r.shard.location
                    ));
                    continue;
                }
                accepted.push(r);
            }
            if let Some(existing) = gsm.shard_map_by_name(&shard_map.name)? {
                if existing.id != shard_map.id {
                    problems.push(format!(
                        "shard map name '{}' is taken by another shard map",
                        shard_map.name
                    ));
                }
            }

            let restored_ids: HashSet<Uuid> = accepted.iter().map(|r| r.shard.id).collect();
            let restored_locations: HashSet<&ShardLocation> =
                accepted.iter().map(|r| &r.shard.location).collect();
            let replaced: Vec<Shard> = gsm
                .read(Query::Shards {
                    shard_map_id: shard_map.id,
                })?
                .shards
                .into_iter()
                .filter(|s| {
                    restored_ids.contains(&s.id) || restored_locations.contains(&s.location)
                })
                .collect();
            let replaced_ids: HashSet<Uuid> = replaced.iter().map(|s| s.id).collect();

            // Claims of another key type cannot be ordered against the rest.
            let mut claims: Vec<&Mapping> = Vec::new();
            for m in accepted.iter().flat_map(|r| r.mappings.iter()) {
                if m.range.check_type(shard_map.key_type).is_err() {
                    problems.push(format!(
                        "mapping {} on {} has a {} range in {} shard map '{}'",
                        m.id,
                        m.location,
                        m.range.key_type(),
                        shard_map.key_type,
                        shard_map.name
                    ));
                    continue;
                }
                claims.push(m);
            }
            let remaining = gsm.mappings(shard_map.id, None)?;
            claims.extend(remaining.iter().filter(|m| {
                !replaced_ids.contains(&m.shard_id)
                    && m.range.check_type(shard_map.key_type).is_ok()
            }));
            claims.sort_by(|a, b| a.range.cmp(&b.range));
            problems.extend(overlap_problems(&claims));

            ops.push(StoreOp::PutShardMap(shard_map.clone()));
            for shard in &replaced {
                ops.push(StoreOp::DeleteMappingsForShard(shard.id));
                ops.push(StoreOp::DeleteShard(shard.id));
            }
            for r in accepted {
                ops.push(StoreOp::PutShard(r.shard.clone()));
                ops.extend(r.mappings.iter().cloned().map(StoreOp::PutMapping));
                count += r.mappings.len();
            }
        }

        if !problems.is_empty() {
            warn!(problems = problems.len(), "Refusing to rebuild global shard map");
            return Err(ShardManagementError::DataIntegrity(problems.join("; ")));
        }

        retry_call(self.ctx.retry.as_ref(), "rebuild global shard map", || {
            Ok(gsm.txn(Vec::new(), ops.clone())?)
        })?;
        for shard_map_id in restored.keys() {
            self.ctx.cache.invalidate_shard_map(*shard_map_id);
        }
        info!(
            shard_maps = restored.len(),
            mappings = count,
            "Rebuilt global shard map from shards"
        );
        Ok(count)
    }

    /// Registers the shard found at `location` in the global map, one shard
    /// map at a time. Its local records are rewritten to the new location.
    /// Mappings are not copied; run detection afterwards to reconcile them.
    pub fn attach_shard(
        &self,
        location: &ShardLocation,
        shard_map_name: Option<&str>,
    ) -> ShardResult<Vec<Shard>> {
        location.validate()?;
        let lsm = self.ctx.connect(&StoreScope::Local(location.clone()))?;
        let gsm = self.ctx.connect(&StoreScope::Global)?;

        let mut attached = Vec::new();
        for local_map in local_shard_maps(lsm.as_ref(), shard_map_name)? {
            let Some(previous) = find_local_shard(lsm.as_ref(), &local_map, location)? else {
                continue;
            };
            let shard_map = gsm.shard_map_by_id(local_map.id)?.ok_or_else(|| {
                ShardManagementError::ShardMapDoesNotExist(local_map.name.clone())
            })?;
            let mut shard = previous.clone();
            shard.location = location.clone();
            let local_mappings = lsm.mappings(shard_map.id, Some(previous.id))?;

            info!(
                shard_map = %shard_map.name,
                from = %previous.location,
                to = %location,
                "Attaching shard"
            );
            let kind = OperationKind::AttachShard {
                shard: shard.clone(),
                previous,
                local_mappings,
            };
            StoreOperation::new(&self.ctx, shard_map, kind).execute()?;
            attached.push(shard);
        }

        if attached.is_empty() {
            return Err(ShardManagementError::ShardDoesNotExist(format!(
                "no shard found at {}",
                location
            )));
        }
        Ok(attached)
    }

    /// Removes the shard at `location` and its mappings from the global map.
    /// The shard's local store is left untouched.
    pub fn detach_shard(
        &self,
        location: &ShardLocation,
        shard_map_name: Option<&str>,
    ) -> ShardResult<usize> {
        location.validate()?;
        let gsm = self.ctx.connect(&StoreScope::Global)?;
        let shard_maps = match shard_map_name {
            Some(name) => vec![gsm
                .shard_map_by_name(name)?
                .ok_or_else(|| ShardManagementError::ShardMapDoesNotExist(name.to_string()))?],
            None => gsm.read(Query::ShardMaps)?.shard_maps,
        };

        let mut detached = 0;
        for shard_map in shard_maps {
            let Some(shard) = gsm.shard_by_location(Some(shard_map.id), location)? else {
                continue;
            };
            info!(shard_map = %shard_map.name, location = %location, "Detaching shard");
            StoreOperation::new(&self.ctx, shard_map, OperationKind::DetachShard { shard })
                .execute()?;
            detached += 1;
        }

        if detached == 0 {
            return Err(ShardManagementError::ShardDoesNotExist(format!(
                "no shard registered at {}",
                location
            )));
        }
        Ok(detached)
    }

    fn state(&self, token: RecoveryToken) -> ShardResult<RecoveryState> {
        self.tokens
            .get(&token)
            .map(|s| s.clone())
            .ok_or(ShardManagementError::UnknownRecoveryToken(token.0))
    }

    fn ensure_local_unchanged(&self, state: &RecoveryState) -> ShardResult<()> {
        let lsm = self.ctx.connect(&StoreScope::Local(state.location.clone()))?;
        let current = lsm.mappings(state.shard_map.id, Some(state.local_shard.id))?;
        let same = current.len() == state.shard_mappings.len()
            && current.iter().all(|m| {
                state
                    .shard_mappings
                    .iter()
                    .any(|s| s.same_record(m) && s.range == m.range)
            });
        if !same {
            return Err(ShardManagementError::VersionMismatch(format!(
                "mappings on {} changed since detection; detect again",
                state.location
            )));
        }
        Ok(())
    }
}

struct RestoredShard {
    shard_map: ShardMap,
    shard: Shard,
    mappings: Vec<Mapping>,
}

fn local_shard_maps(lsm: &dyn MapStore, name: Option<&str>) -> ShardResult<Vec<ShardMap>> {
    let mut maps = lsm.read(Query::ShardMaps)?.shard_maps;
    if let Some(name) = name {
        maps.retain(|m| m.name == name);
        if maps.is_empty() {
            return Err(ShardManagementError::ShardMapDoesNotExist(name.to_string()));
        }
    }
    Ok(maps)
}

/// The shard record a local store keeps for `shard_map`. After a copy to a
/// new server the record still names the old location.
fn find_local_shard(
    lsm: &dyn MapStore,
    shard_map: &ShardMap,
    location: &ShardLocation,
) -> ShardResult<Option<Shard>> {
    let mut shards = lsm
        .read(Query::Shards {
            shard_map_id: shard_map.id,
        })?
        .shards;
    if let Some(pos) = shards.iter().position(|s| &s.location == location) {
        return Ok(Some(shards.swap_remove(pos)));
    }
    Ok(shards.pop())
}

/// Splits the repair into independent (removed, added) groups.
///
/// Untrusted mappings touching a conflict are removed and trusted mappings
/// touching a conflict are added. Removing a mapping can uncover agreeing
/// territory, so trusted mappings overlapping a removed one are added too,
/// and untrusted mappings overlapping an added one are removed, until
/// nothing changes. Connected mappings end up in the same group.
fn repair_groups(
    trusted: &[Mapping],
    untrusted: &[Mapping],
    conflicts: &[ShardRange],
) -> Vec<(Vec<Mapping>, Vec<Mapping>)> {
    let linked = |a: &Mapping, b: &Mapping| a.id == b.id || a.range.intersects(&b.range);
    let touches = |m: &Mapping| conflicts.iter().any(|c| m.range.intersects(c));

    let mut take_t: Vec<bool> = trusted.iter().map(touches).collect();
    let mut take_u: Vec<bool> = untrusted.iter().map(touches).collect();
    loop {
        let mut changed = false;
        for (i, t) in trusted.iter().enumerate() {
            if !take_t[i] && untrusted.iter().zip(&take_u).any(|(u, on)| *on && linked(t, u)) {
                take_t[i] = true;
                changed = true;
            }
        }
        for (j, u) in untrusted.iter().enumerate() {
            if !take_u[j] && trusted.iter().zip(&take_t).any(|(t, on)| *on && linked(t, u)) {
                take_u[j] = true;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    // (is_trusted, mapping)
    let mut items: Vec<(bool, &Mapping)> = trusted
        .iter()
        .zip(&take_t)
        .filter(|(_, on)| **on)
        .map(|(m, _)| (true, m))
        .chain(
            untrusted
                .iter()
                .zip(&take_u)
                .filter(|(_, on)| **on)
                .map(|(m, _)| (false, m)),
        )
        .collect();
    items.sort_by(|a, b| a.1.range.cmp(&b.1.range));

    let mut group_of: Vec<Option<usize>> = vec![None; items.len()];
    let mut groups = Vec::new();
    for start in 0..items.len() {
        if group_of[start].is_some() {
            continue;
        }
        let group = groups.len();
        group_of[start] = Some(group);
        let mut stack = vec![start];
        let (mut removed, mut added) = (Vec::new(), Vec::new());
        while let Some(i) = stack.pop() {
            let (is_trusted, m) = items[i];
            if is_trusted {
                added.push(m.clone());
            } else {
                removed.push(m.clone());
            }
            for j in 0..items.len() {
                if group_of[j].is_none() && linked(m, items[j].1) {
                    group_of[j] = Some(group);
                    stack.push(j);
                }
            }
        }
        removed.sort_by(|a: &Mapping, b: &Mapping| a.range.cmp(&b.range));
        added.sort_by(|a: &Mapping, b: &Mapping| a.range.cmp(&b.range));
        groups.push((removed, added));
    }
    groups
}

/// A local record written into the global map under `shard`. A lock held on
/// the record being replaced survives.
fn global_record(m: &Mapping, shard: &Shard, removed: &[Mapping]) -> Mapping {
    let mut out = m.clone();
    out.shard_id = shard.id;
    out.location = shard.location.clone();
    out.pending_operation = None;
    if let Some(old) = removed.iter().find(|r| r.id == m.id) {
        out.lock_owner = old.lock_owner;
    }
    out
}

fn local_record(m: &Mapping, shard: &Shard, location: &ShardLocation) -> Mapping {
    let mut out = m.local_copy();
    out.shard_id = shard.id;
    out.location = location.clone();
    out
}

/// One problem per claim overlapping an earlier claim, named against the
/// earlier claim reaching furthest. `claims` must be sorted by range and
/// share one key type.
fn overlap_problems(claims: &[&Mapping]) -> Vec<String> {
    let mut problems = Vec::new();
    let mut furthest: Option<&Mapping> = None;
    for m in claims {
        if let Some(prev) = furthest {
            if m.range.low() < prev.range.high() {
                problems.push(format!(
                    "range {} on {} overlaps range {} on {}",
                    prev.range, prev.location, m.range, m.location
                ));
            }
        }
        if furthest.map_or(true, |prev| m.range.high() > prev.range.high()) {
            furthest = Some(*m);
        }
    }
    problems
}

/// Target local mappings for a rebuild: the shard's own records on kept
/// ranges, the global records everywhere else. Adjacent pieces of one record
/// from one side are coalesced; a single run covering the whole record keeps
/// it verbatim, anything else becomes a fresh mapping.
fn rebuilt_mappings(state: &RecoveryState, keep: &[ShardRange]) -> Vec<Mapping> {
    // (range, source record, taken from the shard)
    let mut runs: Vec<(ShardRange, &Mapping, bool)> = Vec::new();
    let mut i = 0;
    while i < state.comparison.len() {
        let range = state.comparison[i].range.clone();
        let mut global = None;
        let mut local = None;
        while i < state.comparison.len() && state.comparison[i].range == range {
            let d = &state.comparison[i];
            global = global.or(d.shard_map_mapping.as_ref());
            local = local.or(d.shard_mapping.as_ref());
            i += 1;
        }
        let from_shard = keep.contains(&range);
        let Some(m) = (if from_shard { local } else { global }) else {
            continue;
        };
        if let Some((run, source, side)) = runs.last_mut() {
            if *side == from_shard && source.same_record(m) && run.high() == range.low() {
                if let Ok(merged) = ShardRange::new(run.low().clone(), range.high().clone()) {
                    *run = merged;
                    continue;
                }
            }
        }
        runs.push((range, m, from_shard));
    }

    let mut counts: HashMap<(Uuid, u64, bool), usize> = HashMap::new();
    for (_, m, side) in &runs {
        *counts.entry((m.id, m.version, *side)).or_default() += 1;
    }
    runs.into_iter()
        .map(|(run, m, side)| {
            let single = counts.get(&(m.id, m.version, side)).copied().unwrap_or(0) == 1;
            if single && m.range == run {
                m.clone()
            } else {
                m.piece(run)
            }
        })
        .collect()
}
