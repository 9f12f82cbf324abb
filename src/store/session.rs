//! Raw viewer session and live renderer queries.
//!
//! `viewer_history` holds one row per finished viewer session; `renderers`
//! holds the live renderer registry. Session rows come back ordered by start
//! time and are folded into calendar buckets on the way out, so callers see
//! the per-bucket shape (count, average duration, embedded items) directly.

use std::fmt::Write;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::clock::{TimeRange, Unit};

use super::rollup::{decode_timestamp, escape_sql};
use super::ReadStore;

/// One finished viewer session, as stored.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub session_id: String,
    pub viewer_id: String,
    pub viewer_ip: String,
    pub viewer_agent: String,
    pub is_internal_user: bool,
    pub is_host: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_sec: Option<f64>,
}

/// Sessions folded into one calendar bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionBucketRow {
    pub bucket: DateTime<Utc>,
    pub count: u64,
    pub avg_duration_sec: f64,
    pub items: Vec<SessionRecord>,
}

/// One live renderer registry row.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RendererRow {
    pub renderer_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub renderer_group: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl ReadStore {
    /// Session rows in range, folded into per-unit buckets with items
    /// ordered by start time.
    pub async fn fetch_session_buckets(
        &self,
        signal_key: &str,
        range: TimeRange,
        renderer_group: Option<&str>,
        unit: Unit,
    ) -> Result<Vec<SessionBucketRow>> {
        let mut sql = String::with_capacity(512);
        let _ = write!(
            sql,
            "SELECT session_id, viewer_id, viewer_ip, viewer_agent, \
             is_internal_user, is_host, \
             toUnixTimestamp(started_at) AS started_ts, \
             toUnixTimestamp(ended_at) AS ended_ts, duration_sec \
             FROM {}.viewer_history WHERE signal_key = '{}' \
             AND started_at >= toDateTime({}) AND started_at < toDateTime({})",
            self.database(),
            escape_sql(signal_key),
            range.start.timestamp(),
            range.end.timestamp(),
        );
        if let Some(group) = renderer_group {
            let _ = write!(sql, " AND renderer_group = '{}'", escape_sql(group));
        }
        sql.push_str(" ORDER BY started_at ASC");

        let mut handle = self.handle().await?;
        let block = handle
            .query(sql.as_str())
            .fetch_all()
            .await
            .context("querying viewer sessions")?;

        let mut records = Vec::with_capacity(block.row_count());
        for row in block.rows() {
            let session_id: &str = row.get("session_id").context("reading session_id")?;
            let viewer_id: &str = row.get("viewer_id").context("reading viewer_id")?;
            let viewer_ip: &str = row.get("viewer_ip").context("reading viewer_ip")?;
            let viewer_agent: &str = row.get("viewer_agent").context("reading viewer_agent")?;
            let started_ts: u32 = row.get("started_ts").context("reading started_ts")?;
            let ended_ts: Option<u32> = row.get("ended_ts").context("reading ended_ts")?;
            let is_internal_user: u8 = row
                .get("is_internal_user")
                .context("reading is_internal_user")?;
            let is_host: u8 = row.get("is_host").context("reading is_host")?;

            records.push(SessionRecord {
                session_id: session_id.to_string(),
                viewer_id: viewer_id.to_string(),
                viewer_ip: viewer_ip.to_string(),
                viewer_agent: viewer_agent.to_string(),
                is_internal_user: is_internal_user != 0,
                is_host: is_host != 0,
                started_at: decode_timestamp(started_ts)?,
                ended_at: ended_ts.map(decode_timestamp).transpose()?,
                duration_sec: row.get("duration_sec").context("reading duration_sec")?,
            });
        }

        Ok(fold_session_buckets(records, unit))
    }

    /// Distinct non-null renderer groups in the live registry.
    pub async fn fetch_live_groups(&self, signal_key: &str) -> Result<Vec<String>> {
        let mut sql = String::with_capacity(256);
        let _ = write!(
            sql,
            "SELECT DISTINCT renderer_group FROM {}.renderers \
             WHERE signal_key = '{}' AND renderer_group IS NOT NULL",
            self.database(),
            escape_sql(signal_key),
        );

        let mut handle = self.handle().await?;
        let block = handle
            .query(sql.as_str())
            .fetch_all()
            .await
            .context("querying live renderer groups")?;

        let mut out = Vec::with_capacity(block.row_count());
        for row in block.rows() {
            let group: Option<&str> = row.get("renderer_group").context("reading group")?;
            if let Some(group) = group {
                out.push(group.to_string());
            }
        }

        Ok(out)
    }

    /// Live renderer rows for a signal key, optionally filtered by group.
    pub async fn fetch_live_renderers(
        &self,
        signal_key: &str,
        renderer_group: Option<&str>,
    ) -> Result<Vec<RendererRow>> {
        let mut sql = String::with_capacity(256);
        let _ = write!(
            sql,
            "SELECT renderer_id, renderer_group, toUnixTimestamp(started_at) AS started_ts \
             FROM {}.renderers WHERE signal_key = '{}'",
            self.database(),
            escape_sql(signal_key),
        );
        if let Some(group) = renderer_group {
            let _ = write!(sql, " AND renderer_group = '{}'", escape_sql(group));
        }
        sql.push_str(" ORDER BY renderer_id ASC");

        let mut handle = self.handle().await?;
        let block = handle
            .query(sql.as_str())
            .fetch_all()
            .await
            .context("querying live renderers")?;

        let mut out = Vec::with_capacity(block.row_count());
        for row in block.rows() {
            let renderer_id: &str = row.get("renderer_id").context("reading renderer_id")?;
            let renderer_group: Option<&str> = row.get("renderer_group").context("reading group")?;
            let started_ts: u32 = row.get("started_ts").context("reading started_ts")?;
            out.push(RendererRow {
                renderer_id: renderer_id.to_string(),
                renderer_group: renderer_group.map(str::to_string),
                started_at: decode_timestamp(started_ts)?,
            });
        }

        Ok(out)
    }
}

/// Folds start-time-ordered session records into calendar buckets.
///
/// The per-bucket average duration is the mean over sessions that have a
/// duration; sessions without one count toward `count` but not the average.
pub fn fold_session_buckets(records: Vec<SessionRecord>, unit: Unit) -> Vec<SessionBucketRow> {
    struct Accum {
        bucket: DateTime<Utc>,
        items: Vec<SessionRecord>,
        duration_sum: f64,
        duration_count: u64,
    }

    impl Accum {
        fn finish(self) -> SessionBucketRow {
            let avg_duration_sec = if self.duration_count > 0 {
                self.duration_sum / self.duration_count as f64
            } else {
                0.0
            };
            SessionBucketRow {
                bucket: self.bucket,
                count: self.items.len() as u64,
                avg_duration_sec,
                items: self.items,
            }
        }
    }

    let mut out = Vec::new();
    let mut current: Option<Accum> = None;

    for record in records {
        let bucket = unit.truncate(record.started_at);

        match current.as_mut() {
            Some(acc) if acc.bucket == bucket => {
                if let Some(duration) = record.duration_sec {
                    acc.duration_sum += duration;
                    acc.duration_count += 1;
                }
                acc.items.push(record);
            }
            _ => {
                if let Some(done) = current.take() {
                    out.push(done.finish());
                }
                let mut acc = Accum {
                    bucket,
                    items: Vec::new(),
                    duration_sum: 0.0,
                    duration_count: 0,
                };
                if let Some(duration) = record.duration_sec {
                    acc.duration_sum += duration;
                    acc.duration_count += 1;
                }
                acc.items.push(record);
                current = Some(acc);
            }
        }
    }

    if let Some(done) = current.take() {
        out.push(done.finish());
    }

    out
}
