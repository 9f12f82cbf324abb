//! Typed queries over the CCU rollup tables.
//!
//! The collector writes one rollup row per renderer per bucket into
//! `renderer_stats_minutely`, `renderer_stats_hourly`, and
//! `renderer_stats_daily` (signal_key, renderer_group Nullable(String),
//! bucket DateTime, avg/max/min/median/p95/p99 CCU as Float64). Per-bucket
//! stats here are sums across renderer rows; the pre-aggregated values are
//! carried through unchanged, never recomputed.

use std::fmt::Write;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

use crate::clock::{TimeRange, Unit};

use super::ReadStore;

/// Rollup table resolutions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Minutely,
    Hourly,
    Daily,
}

impl Resolution {
    /// Returns the rollup table backing this resolution.
    pub fn table(&self) -> &'static str {
        match self {
            Resolution::Minutely => "renderer_stats_minutely",
            Resolution::Hourly => "renderer_stats_hourly",
            Resolution::Daily => "renderer_stats_daily",
        }
    }

    /// Returns the coarse resolution serving a request unit: hourly rollups
    /// for hour aggregation, daily rollups for everything coarser.
    pub fn coarse_for(unit: Unit) -> Self {
        match unit {
            Unit::Hour => Resolution::Hourly,
            Unit::Day | Unit::Month | Unit::Year => Resolution::Daily,
        }
    }
}

/// Pre-aggregated concurrency statistics for one bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CcuStat {
    pub time: DateTime<Utc>,
    pub avg_ccu: f64,
    pub max_ccu: f64,
    pub min_ccu: f64,
    pub median_ccu: f64,
    pub p95_ccu: f64,
    pub p99_ccu: f64,
    pub renderer_count: u64,
}

impl CcuStat {
    /// Returns an all-zero stat for a gap bucket.
    pub fn zero(time: DateTime<Utc>) -> Self {
        Self {
            time,
            avg_ccu: 0.0,
            max_ccu: 0.0,
            min_ccu: 0.0,
            median_ccu: 0.0,
            p95_ccu: 0.0,
            p99_ccu: 0.0,
            renderer_count: 0,
        }
    }
}

const STAT_SUMS: &str = "sum(avg_ccu) AS avg_ccu, sum(max_ccu) AS max_ccu, \
     sum(min_ccu) AS min_ccu, sum(median_ccu) AS median_ccu, \
     sum(p95_ccu) AS p95_ccu, sum(p99_ccu) AS p99_ccu, \
     count() AS renderer_count";

impl ReadStore {
    /// Per-bucket CCU sums grouped at the requested unit, bucket ascending.
    pub async fn fetch_ccu_series(
        &self,
        resolution: Resolution,
        unit: Unit,
        signal_key: &str,
        range: TimeRange,
        renderer_group: Option<&str>,
    ) -> Result<Vec<CcuStat>> {
        let mut sql = String::with_capacity(512);
        let _ = write!(
            sql,
            "SELECT toUnixTimestamp({}) AS time_key, {STAT_SUMS} FROM {}.{}",
            bucket_expr(unit),
            self.database(),
            resolution.table(),
        );
        push_filters(&mut sql, signal_key, Some(range), renderer_group);
        sql.push_str(" GROUP BY time_key ORDER BY time_key ASC");

        let mut handle = self.handle().await?;
        let block = handle
            .query(sql.as_str())
            .fetch_all()
            .await
            .with_context(|| format!("querying {} series", resolution.table()))?;

        let mut out = Vec::with_capacity(block.row_count());
        for row in block.rows() {
            let ts: u32 = row.get("time_key").context("reading time_key")?;
            out.push(CcuStat {
                time: decode_timestamp(ts)?,
                avg_ccu: row.get("avg_ccu").context("reading avg_ccu")?,
                max_ccu: row.get("max_ccu").context("reading max_ccu")?,
                min_ccu: row.get("min_ccu").context("reading min_ccu")?,
                median_ccu: row.get("median_ccu").context("reading median_ccu")?,
                p95_ccu: row.get("p95_ccu").context("reading p95_ccu")?,
                p99_ccu: row.get("p99_ccu").context("reading p99_ccu")?,
                renderer_count: row.get("renderer_count").context("reading renderer_count")?,
            });
        }

        Ok(out)
    }

    /// The single bucket with the highest summed max CCU in range, at the
    /// table's native resolution.
    pub async fn fetch_ccu_peak(
        &self,
        resolution: Resolution,
        signal_key: &str,
        range: TimeRange,
        renderer_group: Option<&str>,
    ) -> Result<Option<CcuStat>> {
        let mut sql = String::with_capacity(512);
        let _ = write!(
            sql,
            "SELECT toUnixTimestamp(bucket) AS time_key, {STAT_SUMS} FROM {}.{}",
            self.database(),
            resolution.table(),
        );
        push_filters(&mut sql, signal_key, Some(range), renderer_group);
        sql.push_str(" GROUP BY time_key ORDER BY max_ccu DESC LIMIT 1");

        let mut handle = self.handle().await?;
        let block = handle
            .query(sql.as_str())
            .fetch_all()
            .await
            .with_context(|| format!("querying {} peak", resolution.table()))?;

        let Some(row) = block.rows().next() else {
            return Ok(None);
        };

        let ts: u32 = row.get("time_key").context("reading time_key")?;
        Ok(Some(CcuStat {
            time: decode_timestamp(ts)?,
            avg_ccu: row.get("avg_ccu").context("reading avg_ccu")?,
            max_ccu: row.get("max_ccu").context("reading max_ccu")?,
            min_ccu: row.get("min_ccu").context("reading min_ccu")?,
            median_ccu: row.get("median_ccu").context("reading median_ccu")?,
            p95_ccu: row.get("p95_ccu").context("reading p95_ccu")?,
            p99_ccu: row.get("p99_ccu").context("reading p99_ccu")?,
            renderer_count: row.get("renderer_count").context("reading renderer_count")?,
        }))
    }

    /// The earliest bucket known to this resolution, if any.
    pub async fn fetch_first_bucket(
        &self,
        resolution: Resolution,
        signal_key: &str,
        renderer_group: Option<&str>,
    ) -> Result<Option<DateTime<Utc>>> {
        let mut sql = String::with_capacity(256);
        let _ = write!(
            sql,
            "SELECT toUnixTimestamp(bucket) AS time_key FROM {}.{}",
            self.database(),
            resolution.table(),
        );
        push_filters(&mut sql, signal_key, None, renderer_group);
        sql.push_str(" ORDER BY bucket ASC LIMIT 1");

        let mut handle = self.handle().await?;
        let block = handle
            .query(sql.as_str())
            .fetch_all()
            .await
            .with_context(|| format!("querying {} first bucket", resolution.table()))?;

        let Some(row) = block.rows().next() else {
            return Ok(None);
        };

        let ts: u32 = row.get("time_key").context("reading time_key")?;
        Ok(Some(decode_timestamp(ts)?))
    }

    /// Distinct non-null renderer groups across all rollup tables.
    pub async fn fetch_history_groups(&self, signal_key: &str) -> Result<Vec<String>> {
        let mut sql = String::with_capacity(512);
        sql.push_str("SELECT DISTINCT renderer_group FROM (");
        for (idx, resolution) in [Resolution::Minutely, Resolution::Hourly, Resolution::Daily]
            .iter()
            .enumerate()
        {
            if idx > 0 {
                sql.push_str(" UNION ALL ");
            }
            let _ = write!(
                sql,
                "SELECT renderer_group FROM {}.{} WHERE signal_key = '{}' \
                 AND renderer_group IS NOT NULL",
                self.database(),
                resolution.table(),
                escape_sql(signal_key),
            );
        }
        sql.push(')');

        let mut handle = self.handle().await?;
        let block = handle
            .query(sql.as_str())
            .fetch_all()
            .await
            .context("querying history renderer groups")?;

        let mut out = Vec::with_capacity(block.row_count());
        for row in block.rows() {
            let group: Option<&str> = row.get("renderer_group").context("reading group")?;
            if let Some(group) = group {
                out.push(group.to_string());
            }
        }

        Ok(out)
    }
}

/// Returns the ClickHouse expression truncating `bucket` to a unit start.
fn bucket_expr(unit: Unit) -> &'static str {
    match unit {
        Unit::Hour => "toStartOfHour(bucket)",
        Unit::Day => "toStartOfDay(bucket)",
        Unit::Month => "toDateTime(toStartOfMonth(bucket))",
        Unit::Year => "toDateTime(toStartOfYear(bucket))",
    }
}

/// Appends the shared WHERE clause: signal key, optional bucket range,
/// optional renderer group.
fn push_filters(
    sql: &mut String,
    signal_key: &str,
    range: Option<TimeRange>,
    renderer_group: Option<&str>,
) {
    let _ = write!(sql, " WHERE signal_key = '{}'", escape_sql(signal_key));

    if let Some(range) = range {
        let _ = write!(
            sql,
            " AND bucket >= toDateTime({}) AND bucket < toDateTime({})",
            range.start.timestamp(),
            range.end.timestamp(),
        );
    }

    if let Some(group) = renderer_group {
        let _ = write!(sql, " AND renderer_group = '{}'", escape_sql(group));
    }
}

/// Escapes single quotes and backslashes for SQL string literals.
pub(crate) fn escape_sql(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\'' => escaped.push_str("\\'"),
            '\\' => escaped.push_str("\\\\"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Decodes a `toUnixTimestamp` column value into a UTC instant.
pub(crate) fn decode_timestamp(ts: u32) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(i64::from(ts), 0)
        .single()
        .context("decoding bucket timestamp")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_sql() {
        assert_eq!(escape_sql("hello"), "hello");
        assert_eq!(escape_sql("it's"), "it\\'s");
        assert_eq!(escape_sql("back\\slash"), "back\\\\slash");
    }

    #[test]
    fn test_resolution_tables() {
        assert_eq!(Resolution::Minutely.table(), "renderer_stats_minutely");
        assert_eq!(Resolution::Hourly.table(), "renderer_stats_hourly");
        assert_eq!(Resolution::Daily.table(), "renderer_stats_daily");
    }

    #[test]
    fn test_coarse_resolution_for_unit() {
        assert_eq!(Resolution::coarse_for(Unit::Hour), Resolution::Hourly);
        assert_eq!(Resolution::coarse_for(Unit::Day), Resolution::Daily);
        assert_eq!(Resolution::coarse_for(Unit::Month), Resolution::Daily);
        assert_eq!(Resolution::coarse_for(Unit::Year), Resolution::Daily);
    }

    #[test]
    fn test_bucket_expr_per_unit() {
        assert_eq!(bucket_expr(Unit::Hour), "toStartOfHour(bucket)");
        assert_eq!(bucket_expr(Unit::Day), "toStartOfDay(bucket)");
        assert_eq!(bucket_expr(Unit::Month), "toDateTime(toStartOfMonth(bucket))");
        assert_eq!(bucket_expr(Unit::Year), "toDateTime(toStartOfYear(bucket))");
    }

    #[test]
    fn test_push_filters_full() {
        let start = decode_timestamp(1_714_521_600).expect("valid ts");
        let end = decode_timestamp(1_714_608_000).expect("valid ts");

        let mut sql = String::new();
        push_filters(
            &mut sql,
            "key'1",
            Some(TimeRange::new(start, end)),
            Some("group-a"),
        );

        assert_eq!(
            sql,
            " WHERE signal_key = 'key\\'1' \
             AND bucket >= toDateTime(1714521600) AND bucket < toDateTime(1714608000) \
             AND renderer_group = 'group-a'"
        );
    }

    #[test]
    fn test_push_filters_minimal() {
        let mut sql = String::new();
        push_filters(&mut sql, "k", None, None);
        assert_eq!(sql, " WHERE signal_key = 'k'");
    }

    #[test]
    fn test_zero_stat() {
        let t = decode_timestamp(0).expect("valid ts");
        let zero = CcuStat::zero(t);
        assert_eq!(zero.max_ccu, 0.0);
        assert_eq!(zero.renderer_count, 0);
        assert_eq!(zero.time, t);
    }
}
