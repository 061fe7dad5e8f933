//! Sweep-line comparison of a shard's global and local mappings.
//!
//! Both mapping sets are cut at every distinct range boundary found on either
//! side. Each resulting sub-range is then classified by which side covers it
//! and whether both sides hold the same record (id and version) there.

use serde::Serialize;
use std::fmt;

use crate::key::{KeyResult, ShardKey, ShardRange};
use crate::mapping::Mapping;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum MappingLocation {
    MappingInShardMapOnly,
    MappingInShardOnly,
    MappingInShardMapAndShard,
}

impl fmt::Display for MappingLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            MappingLocation::MappingInShardMapOnly => "shard map only",
            MappingLocation::MappingInShardOnly => "shard only",
            MappingLocation::MappingInShardMapAndShard => "shard map and shard",
        };
        f.write_str(text)
    }
}

/// Classification of one disjoint sub-range.
#[derive(Clone, Debug)]
pub struct MappingDifference {
    pub range: ShardRange,
    pub location: MappingLocation,
    /// Global record covering the sub-range, if any.
    pub shard_map_mapping: Option<Mapping>,
    /// Local record covering the sub-range, if any.
    pub shard_mapping: Option<Mapping>,
}

impl MappingDifference {
    pub fn is_conflict(&self) -> bool {
        self.location != MappingLocation::MappingInShardMapAndShard
    }
}

/// Mapping in `sorted` (ordered by range) covering `sub`.
fn covering<'a>(sorted: &'a [Mapping], sub: &ShardRange) -> Option<&'a Mapping> {
    let idx = sorted.partition_point(|m| m.range.low() <= sub.low());
    sorted[..idx]
        .iter()
        .rev()
        .find(|m| m.range.contains_range(sub))
}

/// Compares global and local mappings of one shard.
///
/// Output is ordered by `(range, location)`. A sub-range where both sides
/// hold different records yields two entries, one per side.
pub fn compare_mappings(
    shard_map_mappings: &[Mapping],
    shard_mappings: &[Mapping],
) -> KeyResult<Vec<MappingDifference>> {
    let mut gsm: Vec<Mapping> = shard_map_mappings.to_vec();
    let mut lsm: Vec<Mapping> = shard_mappings.to_vec();

    let mut bounds: Vec<ShardKey> = Vec::with_capacity((gsm.len() + lsm.len()) * 2);
    if let Some(first) = gsm.first().or_else(|| lsm.first()) {
        let key_type = first.range.key_type();
        for m in gsm.iter().chain(lsm.iter()) {
            m.range.check_type(key_type)?;
            bounds.push(m.range.low().clone());
            bounds.push(m.range.high().clone());
        }
    }
    bounds.sort();
    bounds.dedup();

    gsm.sort_by(|a, b| a.range.cmp(&b.range));
    lsm.sort_by(|a, b| a.range.cmp(&b.range));

    let mut out = Vec::new();
    for pair in bounds.windows(2) {
        let sub = ShardRange::new(pair[0].clone(), pair[1].clone())?;
        let global = covering(&gsm, &sub);
        let local = covering(&lsm, &sub);
        match (global, local) {
            (None, None) => {}
            (Some(g), Some(l)) if g.same_record(l) => out.push(MappingDifference {
                range: sub,
                location: MappingLocation::MappingInShardMapAndShard,
                shard_map_mapping: Some(g.clone()),
                shard_mapping: Some(l.clone()),
            }),
            (g, l) => {
                if let Some(g) = g {
                    out.push(MappingDifference {
                        range: sub.clone(),
                        location: MappingLocation::MappingInShardMapOnly,
                        shard_map_mapping: Some(g.clone()),
                        shard_mapping: None,
                    });
                }
                if let Some(l) = l {
                    out.push(MappingDifference {
                        range: sub,
                        location: MappingLocation::MappingInShardOnly,
                        shard_map_mapping: None,
                        shard_mapping: Some(l.clone()),
                    });
                }
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::ShardKeyType;
    use crate::mapping::{MappingStatus, Shard, ShardLocation, ShardMap, ShardMapKind};

    fn range(low: i32, high: i32) -> ShardRange {
        ShardRange::new(ShardKey::new(low).unwrap(), ShardKey::new(high).unwrap()).unwrap()
    }

    fn fixture() -> (ShardMap, Shard) {
        let map = ShardMap::new("orders", ShardMapKind::Range, ShardKeyType::Int32);
        let shard = Shard::new(&map, ShardLocation::new("srv", "db0"));
        (map, shard)
    }

    fn mapping(map: &ShardMap, shard: &Shard, low: i32, high: i32) -> Mapping {
        Mapping::new_range(map, shard, range(low, high), MappingStatus::Online).unwrap()
    }

    fn conflicts(diffs: &[MappingDifference]) -> Vec<(ShardRange, MappingLocation)> {
        diffs
            .iter()
            .filter(|d| d.is_conflict())
            .map(|d| (d.range.clone(), d.location))
            .collect()
    }

    #[test]
    fn test_identical_sides_agree() {
        let (map, shard) = fixture();
        let m = mapping(&map, &shard, 1, 10);
        let diffs = compare_mappings(&[m.clone()], &[m]).unwrap();
        assert_eq!(diffs.len(), 1);
        assert!(!diffs[0].is_conflict());
    }

    #[test]
    fn test_widened_local_range() {
        let (map, shard) = fixture();
        let global = mapping(&map, &shard, 1, 10);
        let mut local = global.clone();
        local.range = range(0, 11);

        let diffs = compare_mappings(&[global], &[local]).unwrap();
        assert_eq!(
            conflicts(&diffs),
            vec![
                (range(0, 1), MappingLocation::MappingInShardOnly),
                (range(10, 11), MappingLocation::MappingInShardOnly),
            ]
        );
    }

    #[test]
    fn test_version_mismatch_reports_both_sides() {
        let (map, shard) = fixture();
        let global = mapping(&map, &shard, 1, 10);
        let local = global.with_status(MappingStatus::Offline);

        let diffs = compare_mappings(&[global], &[local]).unwrap();
        assert_eq!(
            conflicts(&diffs),
            vec![
                (range(1, 10), MappingLocation::MappingInShardMapOnly),
                (range(1, 10), MappingLocation::MappingInShardOnly),
            ]
        );
    }

    #[test]
    fn test_open_ended_and_gaps() {
        let (map, shard) = fixture();
        let open = Mapping::new_range(
            &map,
            &shard,
            ShardRange::new(ShardKey::new(20i32).unwrap(), ShardKey::max(ShardKeyType::Int32))
                .unwrap(),
            MappingStatus::Online,
        )
        .unwrap();
        let low = mapping(&map, &shard, 1, 5);

        let diffs = compare_mappings(&[low.clone()], &[low, open.clone()]).unwrap();
        let found = conflicts(&diffs);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, open.range);
        assert_eq!(found[0].1, MappingLocation::MappingInShardOnly);
    }

    #[test]
    fn test_mixed_key_types_are_rejected() {
        let (map, shard) = fixture();
        let a = mapping(&map, &shard, 1, 5);
        let mut b = a.clone();
        b.range = ShardRange::new(ShardKey::new(1i64).unwrap(), ShardKey::new(5i64).unwrap())
            .unwrap();
        assert!(compare_mappings(&[a], &[b]).is_err());
    }

    #[test]
    fn test_empty_sides() {
        assert!(compare_mappings(&[], &[]).unwrap().is_empty());
    }
}
