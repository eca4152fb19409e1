//! Column encodings shared by the stores.
//!
//! Status and timing columns are `NOT NULL`; an unset instant is stored as
//! the zero instant `0001-01-01T00:00:00Z` and an unset execution budget as
//! `0` seconds.

use chrono::{DateTime, Utc};
use std::time::Duration;

const ZERO_UNIX_SECONDS: i64 = -62_135_596_800;

/// `0001-01-01T00:00:00Z`.
pub fn zero_instant() -> DateTime<Utc> {
    DateTime::from_timestamp(ZERO_UNIX_SECONDS, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub fn encode_instant(at: Option<DateTime<Utc>>) -> DateTime<Utc> {
    at.unwrap_or_else(zero_instant)
}

pub fn decode_instant(at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    (at > zero_instant()).then_some(at)
}

pub fn encode_max_time(max_time: Option<Duration>) -> i32 {
    max_time
        .map(|d| i32::try_from(d.as_secs()).unwrap_or(i32::MAX))
        .unwrap_or(0)
}

pub fn decode_max_time(seconds: i32) -> Option<Duration> {
    (seconds > 0).then(|| Duration::from_secs(seconds as u64))
}
