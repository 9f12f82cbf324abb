//! Hybrid-resolution aggregation engine.
//!
//! Coarse rollups (hourly/daily) are only trustworthy up to the settlement
//! boundary; everything after it must be read from the minutely store. The
//! engine splits each request at the boundary, runs the two legs
//! concurrently, and reconciles them into one answer. Fan-out queries use
//! fail-fast joins: when any concurrent leg fails the whole operation fails,
//! rather than returning a silently degraded answer.

pub mod fill;

use std::collections::{btree_map, BTreeMap, BTreeSet};
use std::future::Future;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::clock::{Format, SettlementClock, TimeRange, Unit};
use crate::store::rollup::{CcuStat, Resolution};
use crate::store::session::{RendererRow, SessionBucketRow, SessionRecord};
use crate::store::ReadStore;
use crate::ua::{self, ParsedUserAgent};

use self::fill::{fill_series, range_avg_duration, round2};

/// Read-side storage operations the engine depends on.
pub trait MetricsStore: Send + Sync {
    /// Per-bucket CCU sums grouped at the requested unit, bucket ascending.
    fn ccu_series(
        &self,
        resolution: Resolution,
        unit: Unit,
        signal_key: &str,
        range: TimeRange,
        renderer_group: Option<&str>,
    ) -> impl Future<Output = Result<Vec<CcuStat>>> + Send;

    /// The bucket with the highest summed max CCU in range, or none.
    fn ccu_peak(
        &self,
        resolution: Resolution,
        signal_key: &str,
        range: TimeRange,
        renderer_group: Option<&str>,
    ) -> impl Future<Output = Result<Option<CcuStat>>> + Send;

    /// The earliest bucket known to a resolution, or none.
    fn first_bucket(
        &self,
        resolution: Resolution,
        signal_key: &str,
        renderer_group: Option<&str>,
    ) -> impl Future<Output = Result<Option<DateTime<Utc>>>> + Send;

    /// Session rows in range folded into calendar buckets; the format code
    /// is mapped to a unit with an hour default inside this raw-bucketing
    /// path.
    fn session_buckets(
        &self,
        signal_key: &str,
        range: TimeRange,
        renderer_group: Option<&str>,
        format_code: &str,
    ) -> impl Future<Output = Result<Vec<SessionBucketRow>>> + Send;

    /// Distinct non-null groups in the live renderer registry.
    fn live_groups(&self, signal_key: &str) -> impl Future<Output = Result<Vec<String>>> + Send;

    /// Distinct non-null groups across the historical rollup tables.
    fn history_groups(&self, signal_key: &str)
        -> impl Future<Output = Result<Vec<String>>> + Send;

    /// Live renderer rows for a signal key.
    fn live_renderers(
        &self,
        signal_key: &str,
        renderer_group: Option<&str>,
    ) -> impl Future<Output = Result<Vec<RendererRow>>> + Send;
}

impl MetricsStore for ReadStore {
    async fn ccu_series(
        &self,
        resolution: Resolution,
        unit: Unit,
        signal_key: &str,
        range: TimeRange,
        renderer_group: Option<&str>,
    ) -> Result<Vec<CcuStat>> {
        self.fetch_ccu_series(resolution, unit, signal_key, range, renderer_group)
            .await
    }

    async fn ccu_peak(
        &self,
        resolution: Resolution,
        signal_key: &str,
        range: TimeRange,
        renderer_group: Option<&str>,
    ) -> Result<Option<CcuStat>> {
        self.fetch_ccu_peak(resolution, signal_key, range, renderer_group)
            .await
    }

    async fn first_bucket(
        &self,
        resolution: Resolution,
        signal_key: &str,
        renderer_group: Option<&str>,
    ) -> Result<Option<DateTime<Utc>>> {
        self.fetch_first_bucket(resolution, signal_key, renderer_group)
            .await
    }

    async fn session_buckets(
        &self,
        signal_key: &str,
        range: TimeRange,
        renderer_group: Option<&str>,
        format_code: &str,
    ) -> Result<Vec<SessionBucketRow>> {
        let unit = Unit::from_format_code(format_code);
        self.fetch_session_buckets(signal_key, range, renderer_group, unit)
            .await
    }

    async fn live_groups(&self, signal_key: &str) -> Result<Vec<String>> {
        self.fetch_live_groups(signal_key).await
    }

    async fn history_groups(&self, signal_key: &str) -> Result<Vec<String>> {
        self.fetch_history_groups(signal_key).await
    }

    async fn live_renderers(
        &self,
        signal_key: &str,
        renderer_group: Option<&str>,
    ) -> Result<Vec<RendererRow>> {
        self.fetch_live_renderers(signal_key, renderer_group).await
    }
}

/// Session record with parsed client metadata.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedSession {
    pub session_id: String,
    pub viewer_id: String,
    pub viewer_ip: String,
    pub viewer_agent: ParsedUserAgent,
    pub is_internal_user: bool,
    pub is_host: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_sec: Option<f64>,
}

impl EnrichedSession {
    fn from_record(record: SessionRecord) -> Self {
        Self {
            viewer_agent: ua::parse(&record.viewer_agent),
            session_id: record.session_id,
            viewer_id: record.viewer_id,
            viewer_ip: record.viewer_ip,
            is_internal_user: record.is_internal_user,
            is_host: record.is_host,
            started_at: record.started_at,
            ended_at: record.ended_at,
            duration_sec: record.duration_sec,
        }
    }
}

/// One dense viewer bucket.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerBucket {
    pub time: DateTime<Utc>,
    pub count: u64,
    pub avg_duration_sec: f64,
    pub items: Vec<EnrichedSession>,
}

impl ViewerBucket {
    fn from_row(row: SessionBucketRow) -> Self {
        Self {
            time: row.bucket,
            count: row.count,
            avg_duration_sec: round2(row.avg_duration_sec),
            items: row
                .items
                .into_iter()
                .map(EnrichedSession::from_record)
                .collect(),
        }
    }

    fn zero(time: DateTime<Utc>) -> Self {
        Self {
            time,
            count: 0,
            avg_duration_sec: 0.0,
            items: Vec::new(),
        }
    }
}

/// Composed answer for an aggregate request.
#[derive(Debug, Clone)]
pub struct AggregateResult {
    pub total_viewers: u64,
    pub total_avg_duration_sec: f64,
    pub ccu: Option<CcuStat>,
    pub viewers: Vec<ViewerBucket>,
}

/// Renderer group label wrapper for the groups listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupValue {
    pub value: String,
}

/// Splits a request range at the settlement boundary into a coarse
/// (settled) leg and a fine (fresh) leg.
///
/// The legs tile the request exactly: `[start, min(end, boundary))` and
/// `[max(start, boundary), end)`. An empty range yields neither leg.
pub fn split_at_boundary(
    boundary: DateTime<Utc>,
    range: TimeRange,
) -> (Option<TimeRange>, Option<TimeRange>) {
    if range.is_empty() {
        return (None, None);
    }

    let coarse = if range.start < boundary {
        Some(TimeRange::new(range.start, range.end.min(boundary)))
    } else {
        None
    };

    let fine = if range.end > boundary {
        Some(TimeRange::new(range.start.max(boundary), range.end))
    } else {
        None
    };

    (coarse, fine)
}

/// Merges the two peak candidates into one. The coarse (settled) result
/// wins ties to keep the answer deterministic.
pub fn reconcile_peak(coarse: Option<CcuStat>, fine: Option<CcuStat>) -> Option<CcuStat> {
    match (coarse, fine) {
        (Some(coarse), Some(fine)) => {
            if fine.max_ccu > coarse.max_ccu {
                Some(fine)
            } else {
                Some(coarse)
            }
        }
        (Some(coarse), None) => Some(coarse),
        (None, Some(fine)) => Some(fine),
        (None, None) => None,
    }
}

/// Unions the two legs' bucket rows into one time-ordered set.
///
/// The legs cover disjoint sub-ranges, but a month or year bucket straddling
/// the boundary surfaces from both legs; those collisions sum, which equals
/// what a single query over the whole range would have produced.
fn merge_series(coarse: Vec<CcuStat>, fine: Vec<CcuStat>) -> Vec<CcuStat> {
    let mut by_time: BTreeMap<i64, CcuStat> = BTreeMap::new();

    for stat in coarse.into_iter().chain(fine) {
        match by_time.entry(stat.time.timestamp()) {
            btree_map::Entry::Vacant(entry) => {
                entry.insert(stat);
            }
            btree_map::Entry::Occupied(mut entry) => {
                let merged = entry.get_mut();
                merged.avg_ccu += stat.avg_ccu;
                merged.max_ccu += stat.max_ccu;
                merged.min_ccu += stat.min_ccu;
                merged.median_ccu += stat.median_ccu;
                merged.p95_ccu += stat.p95_ccu;
                merged.p99_ccu += stat.p99_ccu;
                merged.renderer_count += stat.renderer_count;
            }
        }
    }

    by_time.into_values().collect()
}

/// Hybrid-resolution aggregation engine over a read-side store.
pub struct Engine<S> {
    store: S,
    clock: SettlementClock,
}

impl<S: MetricsStore> Engine<S> {
    pub fn new(store: S, clock: SettlementClock) -> Self {
        Self { store, clock }
    }

    /// Returns the settlement clock used for boundaries and range parsing.
    pub fn clock(&self) -> &SettlementClock {
        &self.clock
    }

    /// Dense hybrid CCU series covering `[start, end)` at the format's unit.
    pub async fn ccu_series(
        &self,
        signal_key: &str,
        format: Format,
        range: TimeRange,
        renderer_group: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<CcuStat>> {
        if range.is_empty() {
            return Ok(Vec::new());
        }

        let unit = format.unit();
        let boundary = self.clock.boundary_for(unit, now);
        let (coarse_range, fine_range) = split_at_boundary(boundary, range);
        let coarse_resolution = Resolution::coarse_for(unit);

        debug!(
            signal_key,
            unit = unit.as_str(),
            %boundary,
            coarse = coarse_range.is_some(),
            fine = fine_range.is_some(),
            "dispatching ccu series",
        );

        let coarse = async {
            match coarse_range {
                Some(leg) => {
                    self.store
                        .ccu_series(coarse_resolution, unit, signal_key, leg, renderer_group)
                        .await
                }
                None => Ok(Vec::new()),
            }
        };
        let fine = async {
            match fine_range {
                Some(leg) => {
                    self.store
                        .ccu_series(Resolution::Minutely, unit, signal_key, leg, renderer_group)
                        .await
                }
                None => Ok(Vec::new()),
            }
        };

        let (coarse_rows, fine_rows) = tokio::try_join!(coarse, fine)?;
        let merged = merge_series(coarse_rows, fine_rows);

        Ok(fill_series(
            merged,
            range,
            unit,
            |stat| stat.time,
            CcuStat::zero,
        ))
    }

    /// Peak CCU bucket in range, reconciled across both resolutions.
    pub async fn ccu_peak(
        &self,
        signal_key: &str,
        unit: Unit,
        range: TimeRange,
        renderer_group: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<CcuStat>> {
        if range.is_empty() {
            return Ok(None);
        }

        let boundary = self.clock.boundary_for(unit, now);
        let (coarse_range, fine_range) = split_at_boundary(boundary, range);
        let coarse_resolution = Resolution::coarse_for(unit);

        let coarse = async {
            match coarse_range {
                Some(leg) => {
                    self.store
                        .ccu_peak(coarse_resolution, signal_key, leg, renderer_group)
                        .await
                }
                None => Ok(None),
            }
        };
        let fine = async {
            match fine_range {
                Some(leg) => {
                    self.store
                        .ccu_peak(Resolution::Minutely, signal_key, leg, renderer_group)
                        .await
                }
                None => Ok(None),
            }
        };

        let (coarse_peak, fine_peak) = tokio::try_join!(coarse, fine)?;

        Ok(reconcile_peak(coarse_peak, fine_peak))
    }

    /// Full aggregate: dense enriched viewer buckets plus the peak CCU,
    /// fetched concurrently.
    pub async fn aggregate(
        &self,
        signal_key: &str,
        format: Format,
        range: TimeRange,
        renderer_group: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<AggregateResult> {
        let unit = format.unit();

        let sessions = async {
            if range.is_empty() {
                Ok(Vec::new())
            } else {
                self.store
                    .session_buckets(signal_key, range, renderer_group, format.code())
                    .await
            }
        };
        let peak = self.ccu_peak(signal_key, unit, range, renderer_group, now);

        let (raw_buckets, ccu) = tokio::try_join!(sessions, peak)?;

        let total_viewers: u64 = raw_buckets.iter().map(|row| row.count).sum();
        let bucket_averages: Vec<f64> = raw_buckets
            .iter()
            .map(|row| row.avg_duration_sec)
            .collect();
        let total_avg_duration_sec = range_avg_duration(&bucket_averages);

        let enriched: Vec<ViewerBucket> = raw_buckets
            .into_iter()
            .map(ViewerBucket::from_row)
            .collect();
        let viewers = fill_series(enriched, range, unit, |b| b.time, ViewerBucket::zero);

        Ok(AggregateResult {
            total_viewers,
            total_avg_duration_sec,
            ccu,
            viewers,
        })
    }

    /// Earliest known bucket: settled daily rollups first, minutely as the
    /// fallback when the daily store has nothing.
    pub async fn started_at(
        &self,
        signal_key: &str,
        renderer_group: Option<&str>,
    ) -> Result<Option<DateTime<Utc>>> {
        if let Some(first) = self
            .store
            .first_bucket(Resolution::Daily, signal_key, renderer_group)
            .await?
        {
            return Ok(Some(first));
        }

        self.store
            .first_bucket(Resolution::Minutely, signal_key, renderer_group)
            .await
    }

    /// Distinct renderer groups across live and historical sources, scanned
    /// concurrently.
    pub async fn groups(&self, signal_key: &str) -> Result<Vec<GroupValue>> {
        let (live, history) = tokio::try_join!(
            self.store.live_groups(signal_key),
            self.store.history_groups(signal_key),
        )?;

        let distinct: BTreeSet<String> = live.into_iter().chain(history).collect();

        Ok(distinct
            .into_iter()
            .map(|value| GroupValue { value })
            .collect())
    }

    /// Live renderers for a signal key.
    pub async fn renderers(
        &self,
        signal_key: &str,
        renderer_group: Option<&str>,
    ) -> Result<Vec<RendererRow>> {
        self.store.live_renderers(signal_key, renderer_group).await
    }
}
