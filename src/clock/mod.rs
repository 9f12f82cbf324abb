//! Settlement boundaries and calendar arithmetic.
//!
//! Rollup jobs only finalize a time bucket some minutes after the bucket
//! closes in the business timezone. The [`SettlementClock`] computes, for a
//! given instant, the latest boundary before which the coarse rollups can be
//! trusted. All methods take `now` explicitly so behavior is a pure function
//! of wall-clock time.

use anyhow::{bail, Context, Result};
use chrono::{
    DateTime, Datelike, Duration as ChronoDuration, FixedOffset, Months, NaiveDate, NaiveDateTime,
    NaiveTime, TimeZone, Timelike, Utc,
};

/// External aggregation format codes accepted by the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Hour,
    Day,
    Month,
    Year,
}

impl Format {
    /// Parses an external format code. Unknown codes are rejected.
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "h" => Some(Format::Hour),
            "d" => Some(Format::Day),
            "m" => Some(Format::Month),
            "y" => Some(Format::Year),
            _ => None,
        }
    }

    /// Returns the wire code for this format.
    pub fn code(&self) -> &'static str {
        match self {
            Format::Hour => "h",
            Format::Day => "d",
            Format::Month => "m",
            Format::Year => "y",
        }
    }

    /// Returns the calendar unit this format aggregates by.
    pub fn unit(&self) -> Unit {
        match self {
            Format::Hour => Unit::Hour,
            Format::Day => Unit::Day,
            Format::Month => Unit::Month,
            Format::Year => Unit::Year,
        }
    }
}

/// Calendar unit used for bucket alignment and stepping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Unit {
    Hour,
    Day,
    Month,
    Year,
}

impl Unit {
    /// Maps an external format code to its unit, defaulting to hour.
    ///
    /// Only the raw session bucketing path uses this lossy mapping; request
    /// validation rejects unknown codes before any query runs.
    pub fn from_format_code(code: &str) -> Self {
        match Format::from_code(code) {
            Some(format) => format.unit(),
            None => Unit::Hour,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Unit::Hour => "hour",
            Unit::Day => "day",
            Unit::Month => "month",
            Unit::Year => "year",
        }
    }

    /// Truncates an instant down to the enclosing calendar-aligned bucket
    /// start, in UTC.
    pub fn truncate(self, t: DateTime<Utc>) -> DateTime<Utc> {
        let date = t.date_naive();
        let naive = match self {
            Unit::Hour => date.and_hms_opt(t.hour(), 0, 0),
            Unit::Day => date.and_hms_opt(0, 0, 0),
            Unit::Month => NaiveDate::from_ymd_opt(date.year(), date.month(), 1)
                .and_then(|d| d.and_hms_opt(0, 0, 0)),
            Unit::Year => {
                NaiveDate::from_ymd_opt(date.year(), 1, 1).and_then(|d| d.and_hms_opt(0, 0, 0))
            }
        }
        .expect("truncation of a valid datetime is always a valid datetime");

        Utc.from_utc_datetime(&naive)
    }

    /// Advances an instant by exactly one unit, using calendar arithmetic
    /// for months and years.
    pub fn step(self, t: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Unit::Hour => t + ChronoDuration::hours(1),
            Unit::Day => t + ChronoDuration::days(1),
            Unit::Month => t
                .checked_add_months(Months::new(1))
                .expect("month arithmetic within supported range"),
            Unit::Year => t
                .checked_add_months(Months::new(12))
                .expect("year arithmetic within supported range"),
        }
    }
}

/// Half-open UTC time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

/// Computes safe settlement boundaries against a configured business
/// timezone.
#[derive(Debug, Clone)]
pub struct SettlementClock {
    business_tz: FixedOffset,
    daily_close: ChronoDuration,
    hourly_close: ChronoDuration,
}

impl SettlementClock {
    /// Creates a clock for the given business timezone and settlement close
    /// windows.
    pub fn new(
        business_tz: FixedOffset,
        daily_close: std::time::Duration,
        hourly_close: std::time::Duration,
    ) -> Result<Self> {
        let daily_close =
            ChronoDuration::from_std(daily_close).context("daily close window out of range")?;
        let hourly_close =
            ChronoDuration::from_std(hourly_close).context("hourly close window out of range")?;

        if daily_close >= ChronoDuration::days(1) {
            bail!("daily close window must be shorter than one day");
        }
        if hourly_close >= ChronoDuration::hours(1) {
            bail!("hourly close window must be shorter than one hour");
        }

        Ok(Self {
            business_tz,
            daily_close,
            hourly_close,
        })
    }

    /// Returns the latest instant before which daily rollups are finalized.
    ///
    /// Daily rollup jobs finish within the close window after local
    /// midnight; until then the current day's rollup cannot be trusted and
    /// the boundary stays at the previous day's start.
    pub fn safe_daily_boundary(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let local = now.with_timezone(&self.business_tz);
        let day_start = local - local.time().signed_duration_since(NaiveTime::MIN);

        let boundary = if local < day_start + self.daily_close {
            day_start - ChronoDuration::days(1)
        } else {
            day_start
        };

        boundary.with_timezone(&Utc)
    }

    /// Returns the latest instant before which hourly rollups are finalized.
    pub fn safe_hourly_boundary(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let local = now.with_timezone(&self.business_tz);
        let into_hour = ChronoDuration::minutes(i64::from(local.minute()))
            + ChronoDuration::seconds(i64::from(local.second()))
            + ChronoDuration::nanoseconds(i64::from(local.timestamp_subsec_nanos()));
        let hour_start = local - into_hour;

        let boundary = if local < hour_start + self.hourly_close {
            hour_start - ChronoDuration::hours(1)
        } else {
            hour_start
        };

        boundary.with_timezone(&Utc)
    }

    /// Returns the settlement boundary appropriate for a request unit:
    /// hourly for hour aggregation, daily for everything coarser.
    pub fn boundary_for(&self, unit: Unit, now: DateTime<Utc>) -> DateTime<Utc> {
        match unit {
            Unit::Hour => self.safe_hourly_boundary(now),
            Unit::Day | Unit::Month | Unit::Year => self.safe_daily_boundary(now),
        }
    }

    /// Parses a request datetime string and normalizes it to UTC.
    ///
    /// Strings carrying an explicit offset or zone marker are parsed as-is;
    /// strings without one are interpreted in the business timezone.
    pub fn parse_range_datetime(&self, s: &str) -> Result<DateTime<Utc>> {
        let s = s.trim();
        if s.is_empty() {
            bail!("empty datetime");
        }

        if has_explicit_zone(s) {
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Ok(dt.with_timezone(&Utc));
            }
            for fmt in ["%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%d %H:%M:%S%.f%z"] {
                if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
                    return Ok(dt.with_timezone(&Utc));
                }
            }
            bail!("unrecognized zoned datetime {s:?}");
        }

        let naive = parse_naive_datetime(s)?;
        let local = self
            .business_tz
            .from_local_datetime(&naive)
            .single()
            .with_context(|| format!("resolving local datetime {s:?}"))?;

        Ok(local.with_timezone(&Utc))
    }
}

/// Returns true when the string ends in a `Z` or `±HH[:]MM` zone marker.
fn has_explicit_zone(s: &str) -> bool {
    if s.ends_with('Z') || s.ends_with('z') {
        return true;
    }

    let bytes = s.as_bytes();

    // ±HH:MM
    if bytes.len() >= 6 {
        let tail = &bytes[bytes.len() - 6..];
        if (tail[0] == b'+' || tail[0] == b'-')
            && tail[3] == b':'
            && [tail[1], tail[2], tail[4], tail[5]]
                .iter()
                .all(u8::is_ascii_digit)
        {
            return true;
        }
    }

    // ±HHMM
    if bytes.len() >= 5 {
        let tail = &bytes[bytes.len() - 5..];
        if (tail[0] == b'+' || tail[0] == b'-') && tail[1..].iter().all(u8::is_ascii_digit) {
            return true;
        }
    }

    false
}

/// Parses an offset-less datetime string in a handful of accepted shapes.
fn parse_naive_datetime(s: &str) -> Result<NaiveDateTime> {
    for fmt in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(dt);
        }
    }

    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(date.and_time(NaiveTime::MIN));
    }

    bail!("unrecognized datetime {s:?}")
}

/// Parses a `±HH:MM` (or `±HHMM`, `±HH`) UTC offset string.
pub fn parse_utc_offset(s: &str) -> Result<FixedOffset> {
    let s = s.trim();
    let (sign, rest) = match s.as_bytes().first() {
        Some(b'+') => (1, &s[1..]),
        Some(b'-') => (-1, &s[1..]),
        _ => bail!("utc offset {s:?} must start with '+' or '-'"),
    };

    let (hours_str, minutes_str) = if let Some((h, m)) = rest.split_once(':') {
        (h, m)
    } else if rest.len() == 4 {
        rest.split_at(2)
    } else {
        (rest, "0")
    };

    let hours: i32 = hours_str
        .parse()
        .with_context(|| format!("parsing utc offset hours in {s:?}"))?;
    let minutes: i32 = minutes_str
        .parse()
        .with_context(|| format!("parsing utc offset minutes in {s:?}"))?;

    if hours > 23 || minutes > 59 {
        bail!("utc offset {s:?} out of range");
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .with_context(|| format!("utc offset {s:?} out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kst_clock() -> SettlementClock {
        SettlementClock::new(
            parse_utc_offset("+09:00").expect("valid offset"),
            std::time::Duration::from_secs(45 * 60),
            std::time::Duration::from_secs(40 * 60),
        )
        .expect("valid clock")
    }

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s)
            .expect("valid rfc3339")
            .with_timezone(&Utc)
    }

    #[test]
    fn test_daily_boundary_before_settlement() {
        let clock = kst_clock();
        // 2025-05-01T00:10 business time: the current day is not settled.
        let now = utc("2025-04-30T15:10:00Z");
        assert_eq!(clock.safe_daily_boundary(now), utc("2025-04-29T15:00:00Z"));
    }

    #[test]
    fn test_daily_boundary_after_settlement() {
        let clock = kst_clock();
        // 2025-05-01T01:00 business time: today's rollup is settled.
        let now = utc("2025-04-30T16:00:00Z");
        assert_eq!(clock.safe_daily_boundary(now), utc("2025-04-30T15:00:00Z"));
    }

    #[test]
    fn test_daily_boundary_exactly_at_threshold() {
        let clock = kst_clock();
        // 00:45 business time is the first trusted instant.
        let now = utc("2025-04-30T15:45:00Z");
        assert_eq!(clock.safe_daily_boundary(now), utc("2025-04-30T15:00:00Z"));
    }

    #[test]
    fn test_hourly_boundary_before_settlement() {
        let clock = kst_clock();
        // 10:39 business time: the 10:00 bucket is not yet settled.
        let now = utc("2025-05-01T01:39:00Z");
        assert_eq!(clock.safe_hourly_boundary(now), utc("2025-05-01T00:00:00Z"));
    }

    #[test]
    fn test_hourly_boundary_after_settlement() {
        let clock = kst_clock();
        let now = utc("2025-05-01T01:41:00Z");
        assert_eq!(clock.safe_hourly_boundary(now), utc("2025-05-01T01:00:00Z"));
    }

    #[test]
    fn test_boundary_for_unit() {
        let clock = kst_clock();
        let now = utc("2025-05-01T06:10:00Z");
        assert_eq!(
            clock.boundary_for(Unit::Hour, now),
            clock.safe_hourly_boundary(now)
        );
        for unit in [Unit::Day, Unit::Month, Unit::Year] {
            assert_eq!(clock.boundary_for(unit, now), clock.safe_daily_boundary(now));
        }
    }

    #[test]
    fn test_truncate_hour_and_day() {
        let t = utc("2025-05-01T10:42:31.5Z");
        assert_eq!(Unit::Hour.truncate(t), utc("2025-05-01T10:00:00Z"));
        assert_eq!(Unit::Day.truncate(t), utc("2025-05-01T00:00:00Z"));
    }

    #[test]
    fn test_truncate_month_and_year() {
        let t = utc("2025-05-13T10:42:31Z");
        assert_eq!(Unit::Month.truncate(t), utc("2025-05-01T00:00:00Z"));
        assert_eq!(Unit::Year.truncate(t), utc("2025-01-01T00:00:00Z"));
    }

    #[test]
    fn test_step_calendar_units() {
        assert_eq!(
            Unit::Hour.step(utc("2025-05-01T10:00:00Z")),
            utc("2025-05-01T11:00:00Z")
        );
        assert_eq!(
            Unit::Day.step(utc("2025-05-01T00:00:00Z")),
            utc("2025-05-02T00:00:00Z")
        );
        assert_eq!(
            Unit::Month.step(utc("2025-01-31T00:00:00Z")),
            utc("2025-02-28T00:00:00Z")
        );
        assert_eq!(
            Unit::Year.step(utc("2024-02-29T00:00:00Z")),
            utc("2025-02-28T00:00:00Z")
        );
    }

    #[test]
    fn test_parse_with_explicit_zone() {
        let clock = kst_clock();
        assert_eq!(
            clock
                .parse_range_datetime("2025-05-01T09:00:00+09:00")
                .expect("should parse"),
            utc("2025-05-01T00:00:00Z")
        );
        assert_eq!(
            clock
                .parse_range_datetime("2025-05-01T00:00:00Z")
                .expect("should parse"),
            utc("2025-05-01T00:00:00Z")
        );
        assert_eq!(
            clock
                .parse_range_datetime("2025-05-01T09:00:00+0900")
                .expect("should parse"),
            utc("2025-05-01T00:00:00Z")
        );
    }

    #[test]
    fn test_parse_without_zone_uses_business_timezone() {
        let clock = kst_clock();
        assert_eq!(
            clock
                .parse_range_datetime("2025-05-01T09:00:00")
                .expect("should parse"),
            utc("2025-05-01T00:00:00Z")
        );
        assert_eq!(
            clock
                .parse_range_datetime("2025-05-01")
                .expect("should parse"),
            utc("2025-04-30T15:00:00Z")
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let clock = kst_clock();
        assert!(clock.parse_range_datetime("").is_err());
        assert!(clock.parse_range_datetime("yesterday").is_err());
    }

    #[test]
    fn test_format_codes() {
        assert_eq!(Format::from_code("h"), Some(Format::Hour));
        assert_eq!(Format::from_code("d"), Some(Format::Day));
        assert_eq!(Format::from_code("m"), Some(Format::Month));
        assert_eq!(Format::from_code("y"), Some(Format::Year));
        assert_eq!(Format::from_code("w"), None);
        assert_eq!(Format::Month.unit(), Unit::Month);
    }

    #[test]
    fn test_lossy_unit_mapping_defaults_to_hour() {
        assert_eq!(Unit::from_format_code("d"), Unit::Day);
        assert_eq!(Unit::from_format_code("nope"), Unit::Hour);
    }

    #[test]
    fn test_parse_utc_offset_forms() {
        assert_eq!(
            parse_utc_offset("+09:00").expect("should parse"),
            FixedOffset::east_opt(9 * 3600).expect("valid offset")
        );
        assert_eq!(
            parse_utc_offset("-0530").expect("should parse"),
            FixedOffset::west_opt(5 * 3600 + 30 * 60).expect("valid offset")
        );
        assert_eq!(
            parse_utc_offset("+9").expect("should parse"),
            FixedOffset::east_opt(9 * 3600).expect("valid offset")
        );
        assert!(parse_utc_offset("09:00").is_err());
        assert!(parse_utc_offset("+25:00").is_err());
    }

    #[test]
    fn test_clock_rejects_oversized_close_windows() {
        let tz = parse_utc_offset("+09:00").expect("valid offset");
        assert!(SettlementClock::new(
            tz,
            std::time::Duration::from_secs(86_400),
            std::time::Duration::from_secs(40 * 60),
        )
        .is_err());
        assert!(SettlementClock::new(
            tz,
            std::time::Duration::from_secs(45 * 60),
            std::time::Duration::from_secs(3_600),
        )
        .is_err());
    }
}
