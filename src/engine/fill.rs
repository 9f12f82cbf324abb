//! Gap filling for sparse bucket sequences.
//!
//! Rollups only contain buckets that saw data. Presentation needs a dense,
//! calendar-aligned sequence covering the whole requested range, so gaps are
//! filled with zero-valued buckets. Output buckets are strictly increasing,
//! contiguous, and non-overlapping by construction.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::clock::{TimeRange, Unit};

/// Expands sparse rows into a dense sequence covering `[start, end)` stepped
/// by `unit`.
///
/// Rows are keyed by their aligned instant; a row whose key matches an
/// aligned step is emitted unchanged, every other step gets `zero(step)`.
/// Rows outside the range (or off-alignment) are dropped.
pub fn fill_series<T>(
    rows: Vec<T>,
    range: TimeRange,
    unit: Unit,
    bucket_of: impl Fn(&T) -> DateTime<Utc>,
    zero: impl Fn(DateTime<Utc>) -> T,
) -> Vec<T> {
    let mut by_key: HashMap<i64, T> = HashMap::with_capacity(rows.len());
    for row in rows {
        by_key.insert(bucket_of(&row).timestamp(), row);
    }

    let mut out = Vec::new();
    let mut current = range.start;
    while current < range.end {
        let entry = match by_key.remove(&current.timestamp()) {
            Some(row) => row,
            None => zero(current),
        };
        out.push(entry);
        current = unit.step(current);
    }

    out
}

/// Rounds to two decimal places.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Average duration across a range: the mean of per-bucket averages over
/// buckets that had data, rounded to two decimals.
///
/// Zero-filled gaps are excluded from the denominator; this is intentionally
/// an average of averages, not a count-weighted mean.
pub fn range_avg_duration(bucket_averages: &[f64]) -> f64 {
    if bucket_averages.is_empty() {
        return 0.0;
    }

    let sum: f64 = bucket_averages.iter().sum();
    round2(sum / bucket_averages.len() as f64)
}
