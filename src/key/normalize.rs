//! Byte-level normalization helpers.
//!
//! Every key type is reduced to a byte string whose unsigned lexicographic
//! order equals the natural order of the logical value. The helpers here are
//! the only place that knows the per-type layouts.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeDelta, TimeZone};
use uuid::Uuid;

use super::{KeyError, KeyResult, ShardKeyType};

/// Ticks are 100ns units, the resolution used for every time-based key type.
pub(crate) const TICKS_PER_SECOND: i64 = 10_000_000;
const NANOS_PER_TICK: i64 = 100;

/// Order in which RFC 4122 bytes are laid out so that byte comparison matches
/// a `uniqueidentifier` comparison (node bytes are most significant).
const GUID_ORDER: [usize; 16] = [10, 11, 12, 13, 14, 15, 8, 9, 7, 6, 5, 4, 3, 2, 1, 0];

pub(crate) fn encode_i32(value: i32) -> Vec<u8> {
    ((value as u32) ^ 0x8000_0000).to_be_bytes().to_vec()
}

pub(crate) fn decode_i32(bytes: &[u8]) -> i32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&pad(bytes, 4));
    (u32::from_be_bytes(buf) ^ 0x8000_0000) as i32
}

pub(crate) fn encode_i64(value: i64) -> Vec<u8> {
    ((value as u64) ^ 0x8000_0000_0000_0000).to_be_bytes().to_vec()
}

pub(crate) fn decode_i64(bytes: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&pad(bytes, 8));
    (u64::from_be_bytes(buf) ^ 0x8000_0000_0000_0000) as i64
}

pub(crate) fn encode_guid(value: &Uuid) -> Vec<u8> {
    let src = value.as_bytes();
    GUID_ORDER.iter().map(|&i| src[i]).collect()
}

pub(crate) fn decode_guid(bytes: &[u8]) -> Uuid {
    let padded = pad(bytes, 16);
    let mut out = [0u8; 16];
    for (pos, &i) in GUID_ORDER.iter().enumerate() {
        out[i] = padded[pos];
    }
    Uuid::from_bytes(out)
}

fn epoch() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or_default()
}

/// Converts a duration to 100ns ticks, truncating sub-tick precision.
pub(crate) fn delta_to_ticks(delta: TimeDelta, key_type: ShardKeyType) -> KeyResult<i64> {
    let secs = delta.num_seconds();
    let sub_nanos = (delta - TimeDelta::seconds(secs))
        .num_nanoseconds()
        .unwrap_or(0);
    secs.checked_mul(TICKS_PER_SECOND)
        .and_then(|t| t.checked_add(sub_nanos / NANOS_PER_TICK))
        .ok_or(KeyError::Unrepresentable(key_type))
}

pub(crate) fn ticks_to_delta(ticks: i64) -> TimeDelta {
    let secs = ticks.div_euclid(TICKS_PER_SECOND);
    let rem = ticks.rem_euclid(TICKS_PER_SECOND);
    TimeDelta::seconds(secs) + TimeDelta::nanoseconds(rem * NANOS_PER_TICK)
}

pub(crate) fn datetime_to_ticks(value: &NaiveDateTime) -> KeyResult<i64> {
    delta_to_ticks(value.signed_duration_since(epoch()), ShardKeyType::DateTime)
}

pub(crate) fn ticks_to_datetime(ticks: i64) -> KeyResult<NaiveDateTime> {
    epoch()
        .checked_add_signed(ticks_to_delta(ticks))
        .ok_or(KeyError::Unrepresentable(ShardKeyType::DateTime))
}

pub(crate) fn encode_datetime_offset(value: &DateTime<FixedOffset>) -> KeyResult<Vec<u8>> {
    let utc_ticks = datetime_to_ticks(&value.naive_utc())?;
    let offset_ticks = value.offset().local_minus_utc() as i64 * TICKS_PER_SECOND;
    let mut out = encode_i64(utc_ticks);
    out.extend_from_slice(&encode_i64(offset_ticks));
    Ok(out)
}

pub(crate) fn decode_datetime_offset(bytes: &[u8]) -> KeyResult<DateTime<FixedOffset>> {
    let padded = pad(bytes, 16);
    let utc = ticks_to_datetime(decode_i64(&padded[..8]))?;
    let offset_secs = decode_i64(&padded[8..]) / TICKS_PER_SECOND;
    let offset = i32::try_from(offset_secs)
        .ok()
        .and_then(FixedOffset::east_opt)
        .ok_or(KeyError::Unrepresentable(ShardKeyType::DateTimeOffset))?;
    Ok(offset.from_utc_datetime(&utc))
}

/// Removes trailing zero bytes. Order is preserved because every shorter
/// sequence compares as if it were zero-padded.
pub(crate) fn trim(mut bytes: Vec<u8>) -> Vec<u8> {
    while bytes.last() == Some(&0) {
        bytes.pop();
    }
    bytes
}

pub(crate) fn pad(bytes: &[u8], width: usize) -> Vec<u8> {
    let mut out = bytes.to_vec();
    if out.len() < width {
        out.resize(width, 0);
    }
    out
}

/// Big-endian increment of a fixed-width byte string.
/// Returns `None` when the carry runs off the most significant byte.
pub(crate) fn increment(bytes: &[u8], width: usize) -> Option<Vec<u8>> {
    let mut out = pad(bytes, width);
    for byte in out.iter_mut().rev() {
        if *byte == u8::MAX {
            *byte = 0;
        } else {
            *byte += 1;
            return Some(trim(out));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_flip_orders_integers() {
        assert!(encode_i32(-1) < encode_i32(0));
        assert!(encode_i32(i32::MIN) < encode_i32(-1));
        assert!(encode_i64(i64::MAX) > encode_i64(1));
        assert_eq!(decode_i32(&encode_i32(-42)), -42);
        assert_eq!(decode_i64(&encode_i64(i64::MIN)), i64::MIN);
    }

    #[test]
    fn test_guid_node_bytes_are_most_significant() {
        let low = Uuid::parse_str("ffffffff-ffff-ffff-ffff-000000000000").unwrap();
        let high = Uuid::parse_str("00000000-0000-0000-0000-000000000001").unwrap();
        assert!(encode_guid(&low) < encode_guid(&high));
        assert_eq!(decode_guid(&encode_guid(&high)), high);
    }

    #[test]
    fn test_increment_carries() {
        assert_eq!(increment(&[0x00, 0xff], 2), Some(vec![0x01]));
        assert_eq!(increment(&[0x01], 2), Some(vec![0x01, 0x01]));
        assert_eq!(increment(&[0xff, 0xff], 2), None);
    }

    #[test]
    fn test_ticks_round_trip_negative_delta() {
        let delta = TimeDelta::milliseconds(-1500);
        let ticks = delta_to_ticks(delta, ShardKeyType::TimeSpan).unwrap();
        assert_eq!(ticks, -15_000_000);
        assert_eq!(ticks_to_delta(ticks), delta);
    }
}
