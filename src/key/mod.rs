//! Typed, totally ordered shard keys.
//!
//! A [`ShardKey`] carries its [`ShardKeyType`] and a normalized byte string in
//! which unsigned lexicographic comparison equals the natural ordering of the
//! logical value:
//!
//! - signed integers and tick counts are big-endian with the sign bit flipped
//! - GUIDs are byte-shuffled so node bytes are compared first
//! - trailing zero bytes are trimmed for every type
//!
//! Each type has two special values. **min** is the empty byte sequence (for
//! fixed-width types this is also the smallest representable value).
//! **max** is +infinity: it has no byte sequence and no logical value.
//!
//! Keys of different types are never comparable. [`ShardKey::try_cmp`]
//! reports the mismatch as [`KeyError::TypeMismatch`]; the `Ord`/`PartialEq`
//! implementations treat it as a programmer fault and panic.

mod normalize;
pub mod range;

pub use range::ShardRange;

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeDelta};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use thiserror::Error;
use uuid::Uuid;

/// Maximum length of a variable binary key, in bytes.
pub const MAX_BINARY_KEY_LENGTH: usize = 128;

/// Key model errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("Shard key type mismatch: {left} cannot be compared with {right}")]
    TypeMismatch {
        left: ShardKeyType,
        right: ShardKeyType,
    },

    #[error("Value of {len} bytes is out of range for {key_type} (max {max} bytes)")]
    ValueOutOfRange {
        key_type: ShardKeyType,
        len: usize,
        max: usize,
    },

    #[error("The maximum value of {0} is not representable")]
    MaxValueUnrepresentable(ShardKeyType),

    #[error("The maximum value of {0} cannot be incremented")]
    MaxValueCannotBeIncremented(ShardKeyType),

    #[error("Value cannot be represented as {0}")]
    Unrepresentable(ShardKeyType),

    #[error("Invalid range: low {low} is greater than high {high}")]
    InvalidRange { low: String, high: String },

    #[error("Cannot parse {text:?} as {key_type}")]
    Parse { key_type: ShardKeyType, text: String },
}

pub type KeyResult<T> = Result<T, KeyError>;

/// The logical type of a shard key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ShardKeyType {
    Int32,
    Int64,
    Guid,
    Binary,
    DateTime,
    TimeSpan,
    DateTimeOffset,
}

impl ShardKeyType {
    /// Width of the normalized representation. Variable binary keys may be
    /// shorter than this.
    pub fn byte_width(self) -> usize {
        match self {
            ShardKeyType::Int32 => 4,
            ShardKeyType::Int64 | ShardKeyType::DateTime | ShardKeyType::TimeSpan => 8,
            ShardKeyType::Guid | ShardKeyType::DateTimeOffset => 16,
            ShardKeyType::Binary => MAX_BINARY_KEY_LENGTH,
        }
    }

    pub fn is_fixed_width(self) -> bool {
        self != ShardKeyType::Binary
    }

    /// Parses the names used on the command line (`int32`, `guid`, ...).
    pub fn parse(text: &str) -> Option<Self> {
        match text.to_lowercase().as_str() {
            "int32" | "int" => Some(ShardKeyType::Int32),
            "int64" | "long" => Some(ShardKeyType::Int64),
            "guid" | "uuid" => Some(ShardKeyType::Guid),
            "binary" | "varbinary" => Some(ShardKeyType::Binary),
            "datetime" => Some(ShardKeyType::DateTime),
            "timespan" => Some(ShardKeyType::TimeSpan),
            "datetimeoffset" => Some(ShardKeyType::DateTimeOffset),
            _ => None,
        }
    }
}

impl fmt::Display for ShardKeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShardKeyType::Int32 => "int32",
            ShardKeyType::Int64 => "int64",
            ShardKeyType::Guid => "guid",
            ShardKeyType::Binary => "binary",
            ShardKeyType::DateTime => "datetime",
            ShardKeyType::TimeSpan => "timespan",
            ShardKeyType::DateTimeOffset => "datetimeoffset",
        };
        f.write_str(name)
    }
}

/// A native key value before normalization.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyValue {
    Int32(i32),
    Int64(i64),
    Guid(Uuid),
    Binary(Vec<u8>),
    DateTime(NaiveDateTime),
    TimeSpan(TimeDelta),
    DateTimeOffset(DateTime<FixedOffset>),
}

impl KeyValue {
    pub fn key_type(&self) -> ShardKeyType {
        match self {
            KeyValue::Int32(_) => ShardKeyType::Int32,
            KeyValue::Int64(_) => ShardKeyType::Int64,
            KeyValue::Guid(_) => ShardKeyType::Guid,
            KeyValue::Binary(_) => ShardKeyType::Binary,
            KeyValue::DateTime(_) => ShardKeyType::DateTime,
            KeyValue::TimeSpan(_) => ShardKeyType::TimeSpan,
            KeyValue::DateTimeOffset(_) => ShardKeyType::DateTimeOffset,
        }
    }

    fn normalize(&self) -> KeyResult<Vec<u8>> {
        let bytes = match self {
            KeyValue::Int32(v) => normalize::encode_i32(*v),
            KeyValue::Int64(v) => normalize::encode_i64(*v),
            KeyValue::Guid(v) => normalize::encode_guid(v),
            KeyValue::Binary(v) => {
                if v.len() > MAX_BINARY_KEY_LENGTH {
                    return Err(KeyError::ValueOutOfRange {
                        key_type: ShardKeyType::Binary,
                        len: v.len(),
                        max: MAX_BINARY_KEY_LENGTH,
                    });
                }
                v.clone()
            }
            KeyValue::DateTime(v) => normalize::encode_i64(normalize::datetime_to_ticks(v)?),
            KeyValue::TimeSpan(v) => {
                normalize::encode_i64(normalize::delta_to_ticks(*v, ShardKeyType::TimeSpan)?)
            }
            KeyValue::DateTimeOffset(v) => normalize::encode_datetime_offset(v)?,
        };
        Ok(normalize::trim(bytes))
    }
}

impl From<i32> for KeyValue {
    fn from(v: i32) -> Self {
        KeyValue::Int32(v)
    }
}

impl From<i64> for KeyValue {
    fn from(v: i64) -> Self {
        KeyValue::Int64(v)
    }
}

impl From<Uuid> for KeyValue {
    fn from(v: Uuid) -> Self {
        KeyValue::Guid(v)
    }
}

impl From<Vec<u8>> for KeyValue {
    fn from(v: Vec<u8>) -> Self {
        KeyValue::Binary(v)
    }
}

impl From<&[u8]> for KeyValue {
    fn from(v: &[u8]) -> Self {
        KeyValue::Binary(v.to_vec())
    }
}

impl From<NaiveDateTime> for KeyValue {
    fn from(v: NaiveDateTime) -> Self {
        KeyValue::DateTime(v)
    }
}

impl From<TimeDelta> for KeyValue {
    fn from(v: TimeDelta) -> Self {
        KeyValue::TimeSpan(v)
    }
}

impl From<DateTime<FixedOffset>> for KeyValue {
    fn from(v: DateTime<FixedOffset>) -> Self {
        KeyValue::DateTimeOffset(v)
    }
}

/// A normalized, typed shard key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShardKey {
    key_type: ShardKeyType,
    /// Normalized bytes; `None` is +infinity.
    value: Option<Vec<u8>>,
}

impl ShardKey {
    /// Builds a key from a native value, detecting its type.
    pub fn new(value: impl Into<KeyValue>) -> KeyResult<Self> {
        let value = value.into();
        Ok(Self {
            key_type: value.key_type(),
            value: Some(value.normalize()?),
        })
    }

    /// Builds a key from already-normalized bytes.
    ///
    /// Bytes longer than the type's width are rejected. With `strict`, fixed
    /// width types must be given either no bytes (min) or exactly the full
    /// width, as produced by [`ShardKey::raw_padded`].
    pub fn from_raw(key_type: ShardKeyType, raw: &[u8], strict: bool) -> KeyResult<Self> {
        let width = key_type.byte_width();
        if raw.len() > width
            || (strict && key_type.is_fixed_width() && !raw.is_empty() && raw.len() != width)
        {
            return Err(KeyError::ValueOutOfRange {
                key_type,
                len: raw.len(),
                max: width,
            });
        }
        Ok(Self {
            key_type,
            value: Some(normalize::trim(raw.to_vec())),
        })
    }

    pub fn min(key_type: ShardKeyType) -> Self {
        Self {
            key_type,
            value: Some(Vec::new()),
        }
    }

    pub fn max(key_type: ShardKeyType) -> Self {
        Self {
            key_type,
            value: None,
        }
    }

    pub fn key_type(&self) -> ShardKeyType {
        self.key_type
    }

    pub fn is_min(&self) -> bool {
        matches!(&self.value, Some(v) if v.is_empty())
    }

    pub fn is_max(&self) -> bool {
        self.value.is_none()
    }

    /// Normalized (trimmed) bytes, or `None` for +infinity.
    pub fn raw(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    /// Normalized bytes padded back to the type's width (variable binary keys
    /// are returned as-is).
    pub fn raw_padded(&self) -> KeyResult<Vec<u8>> {
        let raw = self
            .raw()
            .ok_or(KeyError::MaxValueUnrepresentable(self.key_type))?;
        if self.key_type.is_fixed_width() {
            Ok(normalize::pad(raw, self.key_type.byte_width()))
        } else {
            Ok(raw.to_vec())
        }
    }

    /// Decodes the logical value. Fails for +infinity.
    pub fn value(&self) -> KeyResult<KeyValue> {
        let raw = self
            .raw()
            .ok_or(KeyError::MaxValueUnrepresentable(self.key_type))?;
        let value = match self.key_type {
            ShardKeyType::Int32 => KeyValue::Int32(normalize::decode_i32(raw)),
            ShardKeyType::Int64 => KeyValue::Int64(normalize::decode_i64(raw)),
            ShardKeyType::Guid => KeyValue::Guid(normalize::decode_guid(raw)),
            ShardKeyType::Binary => KeyValue::Binary(raw.to_vec()),
            ShardKeyType::DateTime => {
                KeyValue::DateTime(normalize::ticks_to_datetime(normalize::decode_i64(raw))?)
            }
            ShardKeyType::TimeSpan => {
                KeyValue::TimeSpan(normalize::ticks_to_delta(normalize::decode_i64(raw)))
            }
            ShardKeyType::DateTimeOffset => {
                KeyValue::DateTimeOffset(normalize::decode_datetime_offset(raw)?)
            }
        };
        Ok(value)
    }

    /// Returns the least key strictly greater than this one.
    ///
    /// Overflowing the type's width yields +infinity; incrementing +infinity
    /// is an error.
    pub fn next_key(&self) -> KeyResult<Self> {
        let raw = self
            .raw()
            .ok_or(KeyError::MaxValueCannotBeIncremented(self.key_type))?;
        Ok(Self {
            key_type: self.key_type,
            value: normalize::increment(raw, self.key_type.byte_width()),
        })
    }

    /// Type-checked comparison.
    pub fn try_cmp(&self, other: &ShardKey) -> KeyResult<Ordering> {
        if self.key_type != other.key_type {
            return Err(KeyError::TypeMismatch {
                left: self.key_type,
                right: other.key_type,
            });
        }
        Ok(match (&self.value, &other.value) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => a.cmp(b),
        })
    }

    /// Parses a textual key for the given type. `+inf` and `max` denote
    /// +infinity, `min` the type's minimum.
    pub fn parse(key_type: ShardKeyType, text: &str) -> KeyResult<Self> {
        let text = text.trim();
        let parse_err = || KeyError::Parse {
            key_type,
            text: text.to_string(),
        };
        match text {
            "+inf" | "max" => return Ok(Self::max(key_type)),
            "min" => return Ok(Self::min(key_type)),
            _ => {}
        }
        let value = match key_type {
            ShardKeyType::Int32 => KeyValue::Int32(text.parse().map_err(|_| parse_err())?),
            ShardKeyType::Int64 => KeyValue::Int64(text.parse().map_err(|_| parse_err())?),
            ShardKeyType::Guid => KeyValue::Guid(Uuid::parse_str(text).map_err(|_| parse_err())?),
            ShardKeyType::Binary => {
                let hex = text.strip_prefix("0x").unwrap_or(text);
                if hex.len() % 2 != 0 {
                    return Err(parse_err());
                }
                let bytes = (0..hex.len())
                    .step_by(2)
                    .map(|i| u8::from_str_radix(&hex[i..i + 2], 16))
                    .collect::<Result<Vec<u8>, _>>()
                    .map_err(|_| parse_err())?;
                KeyValue::Binary(bytes)
            }
            ShardKeyType::DateTime => KeyValue::DateTime(
                NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
                    .map_err(|_| parse_err())?,
            ),
            ShardKeyType::TimeSpan => {
                let ticks: i64 = text.parse().map_err(|_| parse_err())?;
                KeyValue::TimeSpan(normalize::ticks_to_delta(ticks))
            }
            ShardKeyType::DateTimeOffset => KeyValue::DateTimeOffset(
                DateTime::parse_from_rfc3339(text).map_err(|_| parse_err())?,
            ),
        };
        Self::new(value)
    }

    fn cmp_checked(&self, other: &ShardKey) -> Ordering {
        match self.try_cmp(other) {
            Ok(ordering) => ordering,
            Err(e) => panic!("{}", e),
        }
    }
}

impl PartialEq for ShardKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp_checked(other) == Ordering::Equal
    }
}

impl Eq for ShardKey {}

impl PartialOrd for ShardKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// # Panics
///
/// Panics when the keys have different types.
impl Ord for ShardKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp_checked(other)
    }
}

impl Hash for ShardKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key_type.hash(state);
        self.value.hash(state);
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_max() {
            return f.write_str("+inf");
        }
        match self.value() {
            Ok(KeyValue::Int32(v)) => write!(f, "{}", v),
            Ok(KeyValue::Int64(v)) => write!(f, "{}", v),
            Ok(KeyValue::Guid(v)) => write!(f, "{}", v),
            Ok(KeyValue::Binary(v)) => {
                f.write_str("0x")?;
                for b in v {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
            Ok(KeyValue::DateTime(v)) => write!(f, "{}", v.format("%Y-%m-%dT%H:%M:%S%.f")),
            Ok(KeyValue::TimeSpan(v)) => write!(f, "{}", v),
            Ok(KeyValue::DateTimeOffset(v)) => write!(f, "{}", v.to_rfc3339()),
            Err(_) => write!(f, "<invalid {}>", self.key_type),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    fn sample_keys() -> Vec<ShardKey> {
        let dt = NaiveDate::from_ymd_opt(2020, 5, 17)
            .unwrap()
            .and_hms_opt(8, 30, 0)
            .unwrap();
        let offset = FixedOffset::east_opt(3600).unwrap();
        vec![
            ShardKey::new(-7i32).unwrap(),
            ShardKey::new(i32::MAX - 1).unwrap(),
            ShardKey::new(42i64).unwrap(),
            ShardKey::new(Uuid::new_v4()).unwrap(),
            ShardKey::new(vec![0x01u8, 0x02]).unwrap(),
            ShardKey::new(dt).unwrap(),
            ShardKey::new(TimeDelta::seconds(90)).unwrap(),
            ShardKey::new(offset.from_local_datetime(&dt).unwrap()).unwrap(),
        ]
    }

    #[test]
    fn test_next_key_is_strictly_increasing() {
        for key in sample_keys() {
            let next = key.next_key().unwrap();
            let next_next = next.next_key().unwrap();
            assert!(next > key, "next_key not greater for {}", key);
            assert!(next_next > next, "next_key not monotonic for {}", key);
        }
    }

    #[test]
    fn test_next_key_of_max_faults() {
        let max = ShardKey::max(ShardKeyType::Int64);
        assert_eq!(
            max.next_key().unwrap_err(),
            KeyError::MaxValueCannotBeIncremented(ShardKeyType::Int64)
        );
    }

    #[test]
    fn test_next_key_overflow_is_infinity() {
        let key = ShardKey::new(i32::MAX).unwrap();
        assert!(key.next_key().unwrap().is_max());
    }

    #[test]
    fn test_value_round_trip_through_raw() {
        for key in sample_keys() {
            let value = key.value().unwrap();
            let raw = key.raw_padded().unwrap();
            let restored = ShardKey::from_raw(key.key_type(), &raw, true).unwrap();
            assert_eq!(restored.value().unwrap(), value);
        }
    }

    #[test]
    fn test_min_value_normalizes_to_empty() {
        let key = ShardKey::new(i32::MIN).unwrap();
        assert!(key.is_min());
        assert_eq!(key, ShardKey::min(ShardKeyType::Int32));
    }

    #[test]
    fn test_binary_trailing_zeros_are_insignificant() {
        let a = ShardKey::new(vec![0x05u8, 0x00, 0x00]).unwrap();
        let b = ShardKey::new(vec![0x05u8]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.raw(), Some(&[0x05u8][..]));
    }

    #[test]
    fn test_ordering_matches_logical_order() {
        let values = [-100i64, -1, 0, 1, 99, i64::MAX];
        let keys: Vec<ShardKey> = values.iter().map(|v| ShardKey::new(*v).unwrap()).collect();
        for pair in keys.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        assert!(keys[keys.len() - 1] < ShardKey::max(ShardKeyType::Int64));
    }

    #[test]
    fn test_type_mismatch_is_reported() {
        let a = ShardKey::new(1i32).unwrap();
        let b = ShardKey::new(1i64).unwrap();
        assert!(matches!(a.try_cmp(&b), Err(KeyError::TypeMismatch { .. })));
    }

    #[test]
    #[should_panic]
    fn test_type_mismatch_panics_in_ord() {
        let a = ShardKey::new(1i32).unwrap();
        let b = ShardKey::new(1i64).unwrap();
        let _ = a < b;
    }

    #[test]
    fn test_raw_too_long_is_out_of_range() {
        let err = ShardKey::from_raw(ShardKeyType::Int32, &[1, 2, 3, 4, 5], false).unwrap_err();
        assert!(matches!(err, KeyError::ValueOutOfRange { len: 5, max: 4, .. }));
        assert!(ShardKey::from_raw(ShardKeyType::Int32, &[1, 2], true).is_err());
        assert!(ShardKey::from_raw(ShardKeyType::Binary, &[1, 2], true).is_ok());
    }

    #[test]
    fn test_max_value_is_unrepresentable() {
        let max = ShardKey::max(ShardKeyType::Guid);
        assert_eq!(
            max.value().unwrap_err(),
            KeyError::MaxValueUnrepresentable(ShardKeyType::Guid)
        );
    }

    #[test]
    fn test_parse_and_display() {
        let key = ShardKey::parse(ShardKeyType::Int32, "17").unwrap();
        assert_eq!(key.to_string(), "17");
        let bin = ShardKey::parse(ShardKeyType::Binary, "0x0a0b").unwrap();
        assert_eq!(bin.to_string(), "0x0a0b");
        assert!(ShardKey::parse(ShardKeyType::Int64, "+inf").unwrap().is_max());
        assert!(ShardKey::parse(ShardKeyType::Int32, "abc").is_err());
    }
}
