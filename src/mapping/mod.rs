//! Shard map domain entities.
//!
//! Everything here is plain data. Relationships are expressed through ids
//! (`shard_map_id`, `shard_id`) and resolved by whoever owns the store
//! handle; no entity holds a reference to another.
//!
//! Equality and hashing of [`ShardMap`], [`Shard`] and [`Mapping`] are by id,
//! which is what the global and local maps correlate on. Use
//! [`Mapping::same_record`] to compare id and version together.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

use crate::error::{ShardManagementError, ShardResult};
use crate::key::{ShardKey, ShardKeyType, ShardRange};

/// Transport used to reach a shard's backing store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SqlProtocol {
    Default,
    Tcp,
    NamedPipes,
    SharedMemory,
}

impl SqlProtocol {
    pub fn parse(text: &str) -> Option<Self> {
        match text.to_ascii_lowercase().as_str() {
            "default" => Some(Self::Default),
            "tcp" => Some(Self::Tcp),
            "np" | "namedpipes" => Some(Self::NamedPipes),
            "lpc" | "sharedmemory" => Some(Self::SharedMemory),
            _ => None,
        }
    }
}

impl fmt::Display for SqlProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SqlProtocol::Default => "default",
            SqlProtocol::Tcp => "tcp",
            SqlProtocol::NamedPipes => "np",
            SqlProtocol::SharedMemory => "lpc",
        };
        f.write_str(name)
    }
}

/// Physical address of one shard. Equality covers all four fields.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardLocation {
    pub server: String,
    pub database: String,
    pub protocol: SqlProtocol,
    pub port: u16,
}

impl ShardLocation {
    pub fn new(server: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            database: database.into(),
            protocol: SqlProtocol::Default,
            port: 0,
        }
    }

    pub fn with_protocol(mut self, protocol: SqlProtocol, port: u16) -> Self {
        self.protocol = protocol;
        self.port = port;
        self
    }

    /// Parses `[protocol:]server[,port]/database`, the form `Display` writes.
    pub fn parse(text: &str) -> ShardResult<Self> {
        let invalid = || {
            ShardManagementError::InvalidArgument(format!(
                "invalid shard location {:?}, expected [protocol:]server[,port]/database",
                text
            ))
        };
        let (address, database) = text.trim().rsplit_once('/').ok_or_else(invalid)?;
        let (protocol, address) = match address.split_once(':') {
            Some((proto, rest)) => (SqlProtocol::parse(proto).ok_or_else(invalid)?, rest),
            None => (SqlProtocol::Default, address),
        };
        let (server, port) = match address.split_once(',') {
            Some((server, port)) => (server, port.parse::<u16>().map_err(|_| invalid())?),
            None => (address, 0),
        };
        let location = Self::new(server, database).with_protocol(protocol, port);
        location.validate()?;
        Ok(location)
    }

    pub fn validate(&self) -> ShardResult<()> {
        if self.server.trim().is_empty() {
            return Err(ShardManagementError::InvalidArgument(
                "shard location server must not be empty".to_string(),
            ));
        }
        if self.database.trim().is_empty() {
            return Err(ShardManagementError::InvalidArgument(
                "shard location database must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for ShardLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{},{}/{}",
            self.protocol, self.server, self.port, self.database
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShardMapKind {
    List,
    Range,
}

impl fmt::Display for ShardMapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardMapKind::List => f.write_str("list"),
            ShardMapKind::Range => f.write_str("range"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShardMap {
    pub id: Uuid,
    pub name: String,
    pub kind: ShardMapKind,
    pub key_type: ShardKeyType,
}

impl ShardMap {
    pub fn new(name: impl Into<String>, kind: ShardMapKind, key_type: ShardKeyType) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            kind,
            key_type,
        }
    }
}

impl PartialEq for ShardMap {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ShardMap {}

impl Hash for ShardMap {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShardStatus {
    Offline,
    Online,
}

impl ShardStatus {
    pub fn from_code(code: i32) -> ShardResult<Self> {
        match code {
            0 => Ok(Self::Offline),
            1 => Ok(Self::Online),
            other => Err(ShardManagementError::InvalidStatusCode(other)),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Self::Offline => 0,
            Self::Online => 1,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Shard {
    pub id: Uuid,
    pub shard_map_id: Uuid,
    pub location: ShardLocation,
    /// Bumped by every operation that changes the shard or its mappings.
    pub version: u64,
    pub status: ShardStatus,
}

impl Shard {
    pub fn new(shard_map: &ShardMap, location: ShardLocation) -> Self {
        Self {
            id: Uuid::new_v4(),
            shard_map_id: shard_map.id,
            location,
            version: 1,
            status: ShardStatus::Online,
        }
    }

    pub fn check_owner(&self, shard_map: &ShardMap) -> ShardResult<()> {
        if self.shard_map_id != shard_map.id {
            return Err(ShardManagementError::InvalidArgument(format!(
                "shard {} does not belong to shard map '{}'",
                self.location, shard_map.name
            )));
        }
        Ok(())
    }
}

impl PartialEq for Shard {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Shard {}

impl Hash for Shard {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MappingStatus {
    Offline,
    Online,
}

impl MappingStatus {
    pub fn from_code(code: i32) -> ShardResult<Self> {
        match code {
            0 => Ok(Self::Offline),
            1 => Ok(Self::Online),
            other => Err(ShardManagementError::InvalidStatusCode(other)),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Self::Offline => 0,
            Self::Online => 1,
        }
    }
}

impl fmt::Display for MappingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MappingStatus::Offline => f.write_str("offline"),
            MappingStatus::Online => f.write_str("online"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MappingKind {
    Point,
    Range,
}

/// Token identifying who holds a mapping lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockOwnerId(pub Uuid);

impl LockOwnerId {
    /// Unlocked.
    pub const NONE: LockOwnerId = LockOwnerId(Uuid::nil());

    /// Bypasses ownership checks on unlock and remove.
    pub const FORCE: LockOwnerId = LockOwnerId(Uuid::from_u128(u128::MAX));

    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }

    pub fn is_force(&self) -> bool {
        *self == Self::FORCE
    }
}

impl Default for LockOwnerId {
    fn default() -> Self {
        Self::NONE
    }
}

impl fmt::Display for LockOwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Assignment of a key range (or single key) to a shard.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Mapping {
    pub id: Uuid,
    pub shard_map_id: Uuid,
    pub shard_id: Uuid,
    pub location: ShardLocation,
    pub range: ShardRange,
    pub kind: MappingKind,
    pub status: MappingStatus,
    /// Only meaningful in the global map; local copies carry `NONE`.
    pub lock_owner: LockOwnerId,
    pub version: u64,
    /// Id of the operation currently rewriting this mapping, if any.
    pub pending_operation: Option<Uuid>,
}

impl Mapping {
    pub fn new_range(
        shard_map: &ShardMap,
        shard: &Shard,
        range: ShardRange,
        status: MappingStatus,
    ) -> ShardResult<Self> {
        if shard_map.kind != ShardMapKind::Range {
            return Err(ShardManagementError::InvalidArgument(format!(
                "shard map '{}' is not a range shard map",
                shard_map.name
            )));
        }
        if range.is_empty() {
            return Err(ShardManagementError::InvalidArgument(format!(
                "range {} is empty",
                range
            )));
        }
        Self::build(shard_map, shard, range, MappingKind::Range, status)
    }

    pub fn new_point(
        shard_map: &ShardMap,
        shard: &Shard,
        key: ShardKey,
        status: MappingStatus,
    ) -> ShardResult<Self> {
        if key.is_max() {
            return Err(crate::key::KeyError::MaxValueUnrepresentable(key.key_type()).into());
        }
        let range = ShardRange::point(key)?;
        Self::build(shard_map, shard, range, MappingKind::Point, status)
    }

    fn build(
        shard_map: &ShardMap,
        shard: &Shard,
        range: ShardRange,
        kind: MappingKind,
        status: MappingStatus,
    ) -> ShardResult<Self> {
        shard.check_owner(shard_map)?;
        range.check_type(shard_map.key_type)?;
        Ok(Self {
            id: Uuid::new_v4(),
            shard_map_id: shard_map.id,
            shard_id: shard.id,
            location: shard.location.clone(),
            range,
            kind,
            status,
            lock_owner: LockOwnerId::NONE,
            version: 1,
            pending_operation: None,
        })
    }

    /// Verifies a record read back from a store belongs to `shard_map`.
    pub fn check_owner(&self, shard_map: &ShardMap) -> ShardResult<()> {
        if self.shard_map_id != shard_map.id {
            return Err(ShardManagementError::InvalidArgument(format!(
                "mapping {} belongs to shard map {}, not '{}'",
                self.id, self.shard_map_id, shard_map.name
            )));
        }
        self.range.check_type(shard_map.key_type)?;
        Ok(())
    }

    pub fn is_online(&self) -> bool {
        self.status == MappingStatus::Online
    }

    /// Same id and same version.
    pub fn same_record(&self, other: &Mapping) -> bool {
        self.id == other.id && self.version == other.version
    }

    /// Status change in place: id kept, version bumped.
    pub fn with_status(&self, status: MappingStatus) -> Mapping {
        let mut next = self.clone();
        next.status = status;
        next.version += 1;
        next.pending_operation = None;
        next
    }

    /// The same mapping moved to `shard` under a fresh id.
    pub fn moved_to(&self, shard: &Shard) -> Mapping {
        let mut next = self.retired_copy();
        next.shard_id = shard.id;
        next.location = shard.location.clone();
        next
    }

    /// Splits into two fresh mappings at `key`.
    pub fn split_at(&self, key: &ShardKey) -> ShardResult<(Mapping, Mapping)> {
        let (left, right) = self.range.split_at(key).ok_or_else(|| {
            ShardManagementError::InvalidArgument(format!(
                "split point {} is not strictly inside {}",
                key, self.range
            ))
        })?;
        let mut l = self.retired_copy();
        l.range = left;
        let mut r = self.retired_copy();
        r.range = right;
        Ok((l, r))
    }

    /// Merges with the adjacent mapping on its right into a fresh mapping.
    pub fn merge_with(&self, right: &Mapping) -> ShardResult<Mapping> {
        if self.shard_id != right.shard_id {
            return Err(ShardManagementError::InvalidArgument(
                "only mappings on the same shard can be merged".to_string(),
            ));
        }
        if !self.range.is_adjacent_to(&right.range) {
            return Err(ShardManagementError::InvalidArgument(format!(
                "ranges {} and {} are not adjacent",
                self.range, right.range
            )));
        }
        let mut merged = self.retired_copy();
        merged.range = ShardRange::new(self.range.low().clone(), right.range.high().clone())?;
        Ok(merged)
    }

    /// Copy of this mapping re-pointed at another location, keeping id and
    /// version. Used when a shard is reattached under a new address.
    pub fn relocated(&self, location: &ShardLocation) -> Mapping {
        let mut next = self.clone();
        next.location = location.clone();
        next
    }

    /// The form stored in a shard's local map.
    pub fn local_copy(&self) -> Mapping {
        let mut local = self.clone();
        local.lock_owner = LockOwnerId::NONE;
        local.pending_operation = None;
        local
    }

    /// Fresh mapping covering `range`, a part of this mapping's range.
    pub fn piece(&self, range: ShardRange) -> Mapping {
        let mut next = self.retired_copy();
        next.kind = self.kind;
        next.range = range;
        next
    }

    fn retired_copy(&self) -> Mapping {
        let mut next = self.clone();
        next.id = Uuid::new_v4();
        next.version = 1;
        next.lock_owner = LockOwnerId::NONE;
        next.pending_operation = None;
        next.kind = MappingKind::Range;
        next
    }
}

impl PartialEq for Mapping {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Mapping {}

impl Hash for Mapping {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {} ({}, v{})",
            self.id, self.range, self.location, self.status, self.version
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (ShardMap, Shard) {
        let map = ShardMap::new("orders", ShardMapKind::Range, ShardKeyType::Int32);
        let shard = Shard::new(&map, ShardLocation::new("db1", "shard_a"));
        (map, shard)
    }

    fn range(low: i32, high: i32) -> ShardRange {
        ShardRange::new(ShardKey::new(low).unwrap(), ShardKey::new(high).unwrap()).unwrap()
    }

    #[test]
    fn test_status_from_code() {
        assert_eq!(MappingStatus::from_code(0).unwrap(), MappingStatus::Offline);
        assert_eq!(MappingStatus::from_code(1).unwrap(), MappingStatus::Online);
        assert!(matches!(
            MappingStatus::from_code(7),
            Err(ShardManagementError::InvalidStatusCode(7))
        ));
        assert!(ShardStatus::from_code(-1).is_err());
    }

    #[test]
    fn test_location_parse() {
        let loc = ShardLocation::parse("tcp:srv1,1433/orders_0").unwrap();
        assert_eq!(loc.protocol, SqlProtocol::Tcp);
        assert_eq!(loc.port, 1433);
        assert_eq!(ShardLocation::parse(&loc.to_string()).unwrap(), loc);

        let plain = ShardLocation::parse("srv1/orders_0").unwrap();
        assert_eq!(plain, ShardLocation::new("srv1", "orders_0"));

        assert!(ShardLocation::parse("srv1").is_err());
        assert!(ShardLocation::parse("srv1/").is_err());
        assert!(ShardLocation::parse("bogus:srv1/db").is_err());
    }

    #[test]
    fn test_new_mapping_gets_fresh_id() {
        let (map, shard) = fixture();
        let a = Mapping::new_range(&map, &shard, range(1, 10), MappingStatus::Online).unwrap();
        let b = Mapping::new_range(&map, &shard, range(1, 10), MappingStatus::Online).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.version, 1);
        assert!(a.lock_owner.is_none());
    }

    #[test]
    fn test_new_mapping_rejects_foreign_shard_and_key_type() {
        let (map, _) = fixture();
        let other = ShardMap::new("other", ShardMapKind::Range, ShardKeyType::Int32);
        let foreign = Shard::new(&other, ShardLocation::new("db2", "shard_b"));
        assert!(Mapping::new_range(&map, &foreign, range(1, 2), MappingStatus::Online).is_err());

        let (map, shard) = fixture();
        let wide = ShardRange::new(ShardKey::new(1i64).unwrap(), ShardKey::new(2i64).unwrap())
            .unwrap();
        assert!(matches!(
            Mapping::new_range(&map, &shard, wide, MappingStatus::Online),
            Err(ShardManagementError::Key(_))
        ));
    }

    #[test]
    fn test_point_mapping_covers_one_key() {
        let map = ShardMap::new("users", ShardMapKind::List, ShardKeyType::Int64);
        let shard = Shard::new(&map, ShardLocation::new("db1", "users_0"));
        let m = Mapping::new_point(&map, &shard, ShardKey::new(42i64).unwrap(), MappingStatus::Online)
            .unwrap();
        assert_eq!(m.kind, MappingKind::Point);
        assert!(m.range.is_point());
        assert!(m.range.contains(&ShardKey::new(42i64).unwrap()));
    }

    #[test]
    fn test_equality_is_by_id() {
        let (map, shard) = fixture();
        let m = Mapping::new_range(&map, &shard, range(1, 10), MappingStatus::Online).unwrap();
        let offline = m.with_status(MappingStatus::Offline);
        assert_eq!(m, offline);
        assert!(!m.same_record(&offline));
        assert_eq!(offline.version, 2);
    }

    #[test]
    fn test_split_and_merge_create_new_ids() {
        let (map, shard) = fixture();
        let m = Mapping::new_range(&map, &shard, range(1, 10), MappingStatus::Online).unwrap();
        let (l, r) = m.split_at(&ShardKey::new(5i32).unwrap()).unwrap();
        assert_ne!(l.id, m.id);
        assert_ne!(r.id, m.id);
        assert_eq!(l.range, range(1, 5));
        assert_eq!(r.range, range(5, 10));

        let merged = l.merge_with(&r).unwrap();
        assert_eq!(merged.range, range(1, 10));
        assert_ne!(merged.id, l.id);
        assert!(r.merge_with(&l).is_err());
    }

    #[test]
    fn test_check_owner() {
        let (map, shard) = fixture();
        let m = Mapping::new_range(&map, &shard, range(1, 10), MappingStatus::Online).unwrap();
        assert!(m.check_owner(&map).is_ok());
        let other = ShardMap::new("orders", ShardMapKind::Range, ShardKeyType::Int32);
        assert!(m.check_owner(&other).is_err());
    }

    #[test]
    fn test_location_display_and_validation() {
        let loc = ShardLocation::new("srv", "db").with_protocol(SqlProtocol::Tcp, 1433);
        assert_eq!(loc.to_string(), "tcp:srv,1433/db");
        assert!(loc.validate().is_ok());
        assert!(ShardLocation::new("", "db").validate().is_err());
    }
}
