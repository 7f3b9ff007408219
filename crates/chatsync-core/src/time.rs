//! Conversion between chat store timestamps and UTC.
//!
//! The chat store records instants as nanoseconds since 2001-01-01T00:00:00Z.
//! Databases written by older OS releases store whole seconds instead; any
//! magnitude below [`LEGACY_SECONDS_THRESHOLD`] is read as seconds.

use chrono::{DateTime, TimeZone, Utc};

/// Seconds between the Unix epoch and 2001-01-01T00:00:00Z.
pub const APPLE_EPOCH_OFFSET_SECS: i64 = 978_307_200;

/// Raw values below this are seconds rather than nanoseconds.
pub const LEGACY_SECONDS_THRESHOLD: i64 = 1_000_000_000_000;

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Convert a store timestamp into UTC. Returns `None` for 0 (unset).
pub fn from_apple_time(raw: i64) -> Option<DateTime<Utc>> {
    if raw == 0 {
        return None;
    }
    let (secs, nanos) = if raw.abs() < LEGACY_SECONDS_THRESHOLD {
        (raw, 0)
    } else {
        (raw.div_euclid(NANOS_PER_SEC), raw.rem_euclid(NANOS_PER_SEC))
    };
    Utc.timestamp_opt(secs + APPLE_EPOCH_OFFSET_SECS, nanos as u32)
        .single()
}

/// Convert a UTC instant into store nanoseconds, for use as a query bound.
pub fn to_apple_time(instant: DateTime<Utc>) -> i64 {
    let secs = instant.timestamp() - APPLE_EPOCH_OFFSET_SECS;
    secs.saturating_mul(NANOS_PER_SEC)
        .saturating_add(i64::from(instant.timestamp_subsec_nanos()))
}
