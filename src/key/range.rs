//! Half-open key ranges.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use super::{KeyError, KeyResult, ShardKey, ShardKeyType};

/// A half-open range `[low, high)` over keys of one type.
///
/// `high` may be +infinity. Ordering and hashing follow `(low, high)`.
/// Operations that compare against a key or range of another type panic;
/// use [`ShardRange::check_type`] first when the input is untrusted.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardRange {
    low: ShardKey,
    high: ShardKey,
}

impl ShardRange {
    pub fn new(low: ShardKey, high: ShardKey) -> KeyResult<Self> {
        if low.try_cmp(&high)? == Ordering::Greater {
            return Err(KeyError::InvalidRange {
                low: low.to_string(),
                high: high.to_string(),
            });
        }
        Ok(Self { low, high })
    }

    /// The single-key range `[key, next_key(key))`.
    pub fn point(key: ShardKey) -> KeyResult<Self> {
        let high = key.next_key()?;
        Ok(Self { low: key, high })
    }

    /// `[min, +inf)` for the given type.
    pub fn full(key_type: ShardKeyType) -> Self {
        Self {
            low: ShardKey::min(key_type),
            high: ShardKey::max(key_type),
        }
    }

    pub fn low(&self) -> &ShardKey {
        &self.low
    }

    pub fn high(&self) -> &ShardKey {
        &self.high
    }

    pub fn key_type(&self) -> ShardKeyType {
        self.low.key_type()
    }

    pub fn check_type(&self, key_type: ShardKeyType) -> KeyResult<()> {
        if self.key_type() != key_type {
            return Err(KeyError::TypeMismatch {
                left: self.key_type(),
                right: key_type,
            });
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.low == self.high
    }

    /// True if the range covers exactly one key.
    pub fn is_point(&self) -> bool {
        matches!(self.low.next_key(), Ok(next) if next == self.high)
    }

    pub fn contains(&self, key: &ShardKey) -> bool {
        &self.low <= key && key < &self.high
    }

    /// True if `other` lies entirely within this range.
    pub fn contains_range(&self, other: &ShardRange) -> bool {
        self.low <= other.low && other.high <= self.high
    }

    pub fn intersects(&self, other: &ShardRange) -> bool {
        self.intersect(other).is_some()
    }

    /// The overlapping sub-range, or `None` when the ranges do not overlap.
    pub fn intersect(&self, other: &ShardRange) -> Option<ShardRange> {
        let low = std::cmp::max(&self.low, &other.low);
        let high = std::cmp::min(&self.high, &other.high);
        if low < high {
            Some(ShardRange {
                low: low.clone(),
                high: high.clone(),
            })
        } else {
            None
        }
    }

    /// Splits at `key`, which must lie strictly inside the range.
    pub fn split_at(&self, key: &ShardKey) -> Option<(ShardRange, ShardRange)> {
        if key <= &self.low || key >= &self.high {
            return None;
        }
        Some((
            ShardRange {
                low: self.low.clone(),
                high: key.clone(),
            },
            ShardRange {
                low: key.clone(),
                high: self.high.clone(),
            },
        ))
    }

    /// True if this range ends exactly where `next` begins.
    pub fn is_adjacent_to(&self, next: &ShardRange) -> bool {
        self.high == next.low
    }
}

impl fmt::Display for ShardRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.low, self.high)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(low: i32, high: Option<i32>) -> ShardRange {
        let high = match high {
            Some(h) => ShardKey::new(h).unwrap(),
            None => ShardKey::max(ShardKeyType::Int32),
        };
        ShardRange::new(ShardKey::new(low).unwrap(), high).unwrap()
    }

    #[test]
    fn test_new_rejects_inverted_bounds() {
        let err = ShardRange::new(ShardKey::new(10i32).unwrap(), ShardKey::new(1i32).unwrap());
        assert!(matches!(err, Err(KeyError::InvalidRange { .. })));
    }

    #[test]
    fn test_new_rejects_mixed_types() {
        let err = ShardRange::new(ShardKey::new(1i32).unwrap(), ShardKey::new(5i64).unwrap());
        assert!(matches!(err, Err(KeyError::TypeMismatch { .. })));
    }

    #[test]
    fn test_contains_is_half_open() {
        let r = range(1, Some(10));
        assert!(r.contains(&ShardKey::new(1i32).unwrap()));
        assert!(r.contains(&ShardKey::new(9i32).unwrap()));
        assert!(!r.contains(&ShardKey::new(10i32).unwrap()));
        assert!(range(5, None).contains(&ShardKey::new(i32::MAX).unwrap()));
    }

    #[test]
    fn test_intersect_is_commutative() {
        let pairs = [
            (range(1, Some(10)), range(5, Some(20))),
            (range(1, Some(10)), range(10, Some(20))),
            (range(0, None), range(3, Some(4))),
            (range(7, Some(8)), range(1, Some(5))),
        ];
        for (a, b) in pairs.iter() {
            assert_eq!(a.intersect(b), b.intersect(a));
            assert_eq!(a.intersects(b), a.intersect(b).is_some());
        }
        assert_eq!(
            range(1, Some(10)).intersect(&range(5, Some(20))),
            Some(range(5, Some(10)))
        );
        assert_eq!(range(1, Some(10)).intersect(&range(10, Some(20))), None);
    }

    #[test]
    fn test_ordering_is_lexicographic_on_bounds() {
        let mut ranges = vec![range(5, Some(6)), range(1, None), range(1, Some(3))];
        ranges.sort();
        assert_eq!(
            ranges,
            vec![range(1, Some(3)), range(1, None), range(5, Some(6))]
        );
    }

    #[test]
    fn test_point_range() {
        let r = ShardRange::point(ShardKey::new(4i32).unwrap()).unwrap();
        assert!(r.is_point());
        assert!(r.contains(&ShardKey::new(4i32).unwrap()));
        assert!(!r.contains(&ShardKey::new(5i32).unwrap()));
        assert!(!range(4, Some(6)).is_point());
    }

    #[test]
    fn test_split_at() {
        let (left, right) = range(1, Some(10)).split_at(&ShardKey::new(4i32).unwrap()).unwrap();
        assert_eq!(left, range(1, Some(4)));
        assert_eq!(right, range(4, Some(10)));
        assert!(left.is_adjacent_to(&right));
        assert!(range(1, Some(10)).split_at(&ShardKey::new(1i32).unwrap()).is_none());
    }
}
