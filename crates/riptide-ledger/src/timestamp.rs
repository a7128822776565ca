//! Timestamp helpers.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall clock in milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Median of a set of timestamps.
///
/// Even-length inputs average the two middle values, halving each before
/// adding so the sum cannot overflow.
#[must_use]
pub fn median_timestamp(timestamps: &[u64]) -> u64 {
    if timestamps.is_empty() {
        return 0;
    }

    let mut sorted = timestamps.to_vec();
    sorted.sort_unstable();

    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] / 2) + (sorted[mid] / 2)
    } else {
        sorted[mid]
    }
}

/// Mean of a set of timestamps.
#[must_use]
pub fn mean_timestamp(timestamps: &[u64]) -> u64 {
    if timestamps.is_empty() {
        return 0;
    }

    let len = timestamps.len() as u64;
    timestamps.iter().map(|timestamp| timestamp / len).sum()
}
