//! Ranged queries over the daily log files: candidate-file enumeration,
//! series listing, event gathering through the file cache, and equal-width
//! bucket downsampling.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, TimeZone, Utc};
use serde::Serialize;
use tracing::warn;

use crate::cache::with_cached_file;
use crate::error::{TsdbError, TsdbResult};
use crate::format;
use crate::value::{Event, Value};

/// Parse a query timestamp: epoch seconds (|n| < 10^10), epoch milliseconds,
/// or ISO-8601 with `Z` allowed and naive datetimes read as UTC.
pub fn parse_timestamp(value: &str) -> TsdbResult<i64> {
    let value = value.trim();
    if value.is_empty() {
        return Err(TsdbError::BadRequest("timestamp value is empty".into()));
    }

    let digits = value.strip_prefix('-').unwrap_or(value);
    if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
        let n: i64 = value
            .parse()
            .map_err(|_| TsdbError::BadRequest(format!("timestamp out of range: {value}")))?;
        if n.unsigned_abs() < 10_000_000_000 {
            return Ok(n * 1000);
        }
        return Ok(n);
    }

    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(value) {
        return Ok(dt.timestamp_millis());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(value, fmt) {
            return Ok(Utc.from_utc_datetime(&naive).timestamp_millis());
        }
    }
    if let Ok(date) = chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        if let Some(naive) = date.and_hms_opt(0, 0, 0) {
            return Ok(Utc.from_utc_datetime(&naive).timestamp_millis());
        }
    }
    Err(TsdbError::BadRequest(format!(
        "unparseable timestamp: {value:?}"
    )))
}

fn utc_day(timestamp_ms: i64) -> Option<NaiveDate> {
    Utc.timestamp_millis_opt(timestamp_ms)
        .single()
        .map(|dt| dt.date_naive())
}

/// UTC dates covered by the window, inclusive on both ends.
pub fn day_range_utc(start_ms: i64, end_ms: i64) -> Vec<NaiveDate> {
    let (Some(start_day), Some(end_day)) = (utc_day(start_ms), utc_day(end_ms)) else {
        return Vec::new();
    };
    let mut days = Vec::new();
    let mut day = start_day;
    while day <= end_day {
        days.push(day);
        match day.succ_opt() {
            Some(next) => day = next,
            None => break,
        }
    }
    days
}

pub fn daily_file_name(day: NaiveDate) -> String {
    format!("data_{}.tsdb", day.format("%Y-%m-%d"))
}

/// Existing daily files for the window; falls back to `data.tsdb` when no
/// daily file matches.
pub fn find_candidate_files(data_dir: &Path, start_ms: i64, end_ms: i64) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for day in day_range_utc(start_ms, end_ms) {
        let path = data_dir.join(daily_file_name(day));
        if path.is_file() {
            files.push(path);
        }
    }
    if files.is_empty() {
        let fallback = data_dir.join("data.tsdb");
        if fallback.is_file() {
            files.push(fallback);
        }
    }
    files
}

/// Series names in one file; unparseable or unreadable files count as empty.
pub fn list_series_in_file(path: &Path) -> Vec<String> {
    match with_cached_file(path, |cache| {
        let mut names: Vec<String> = cache.series_events.keys().cloned().collect();
        names.sort();
        names
    }) {
        Ok(names) => names,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "skipping unreadable file");
            Vec::new()
        }
    }
}

pub fn series_format_id_in_file(path: &Path, series: &str) -> TsdbResult<Option<u8>> {
    with_cached_file(path, |cache| cache.series_format_ids.get(series).copied())
}

/// Events of `series` within `[start_ms, end_ms]` from one file. When the
/// file's events already lie inside the window they are returned without
/// filtering.
pub fn read_events_for_series(
    path: &Path,
    series: &str,
    start_ms: i64,
    end_ms: i64,
) -> TsdbResult<Vec<Event>> {
    with_cached_file(path, |cache| {
        let Some(events) = cache.series_events.get(series) else {
            return Vec::new();
        };
        if events.is_empty() {
            return Vec::new();
        }
        let first = events[0].timestamp_ms as i64;
        let last = events[events.len() - 1].timestamp_ms as i64;
        if start_ms <= first && last <= end_ms {
            return events.clone();
        }
        events
            .iter()
            .filter(|e| {
                let ts = e.timestamp_ms as i64;
                start_ms <= ts && ts <= end_ms
            })
            .cloned()
            .collect()
    })
}

/// One point of a query response: raw events pass through, downsampled
/// buckets carry the aggregate.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Point {
    Raw {
        timestamp: u64,
        value: Value,
    },
    Bucket {
        timestamp: i64,
        start: i64,
        end: i64,
        count: usize,
        min: f64,
        avg: f64,
        max: f64,
    },
}

/// Equal-width bucketing of numeric events into at most `max_events`
/// count/min/avg/max points. Returns `(downsampled, points)`; inputs at or
/// under the limit pass through unchanged.
pub fn downsample_numeric_events(
    events: &[Event],
    max_events: usize,
    start_ms: i64,
    end_ms: i64,
    decimal_places: u32,
) -> (bool, Vec<Point>) {
    if events.len() <= max_events {
        let points = events
            .iter()
            .map(|e| Point::Raw {
                timestamp: e.timestamp_ms,
                value: e.value.clone(),
            })
            .collect();
        return (false, points);
    }

    let start_ts = start_ms;
    let end_ts = end_ms.max(start_ts);
    let span = (end_ts - start_ts + 1).max(1);
    let bucket_width = ((span + max_events as i64 - 1) / max_events as i64).max(1);

    let mut buckets: Vec<Vec<&Event>> = vec![Vec::new(); max_events];
    for event in events {
        let idx = ((event.timestamp_ms as i64 - start_ts) / bucket_width)
            .clamp(0, max_events as i64 - 1) as usize;
        buckets[idx].push(event);
    }

    let mut points = Vec::new();
    for (i, bucket) in buckets.iter().enumerate() {
        if bucket.is_empty() {
            continue;
        }
        let values: Vec<f64> = bucket
            .iter()
            .map(|e| e.value.as_f64().unwrap_or_default())
            .collect();
        let b_start = start_ts + i as i64 * bucket_width;
        let b_end = (b_start + bucket_width - 1).min(end_ts);
        let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let avg = values.iter().sum::<f64>() / values.len() as f64;
        points.push(Point::Bucket {
            timestamp: (b_start + b_end).div_euclid(2),
            start: b_start,
            end: b_end,
            count: bucket.len(),
            min: format::round_to(min, decimal_places),
            avg: format::round_to(avg, decimal_places),
            max: format::round_to(max, decimal_places),
        });
    }
    (true, points)
}

#[derive(Debug, Serialize)]
pub struct SeriesResponse {
    pub start: i64,
    pub end: i64,
    pub files: Vec<String>,
    pub series: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct EventsResponse {
    pub series: String,
    pub start: i64,
    pub end: i64,
    #[serde(rename = "requestedMaxEvents")]
    pub requested_max_events: usize,
    #[serde(rename = "returnedPoints")]
    pub returned_points: usize,
    pub downsampled: bool,
    pub files: Vec<String>,
    pub points: Vec<Point>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

fn file_basename(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// The /series listing: union of series names over the window's candidate
/// files.
pub fn list_series(data_dir: &Path, start_ms: i64, end_ms: i64) -> SeriesResponse {
    let files = find_candidate_files(data_dir, start_ms, end_ms);
    let mut names = BTreeSet::new();
    for path in &files {
        names.extend(list_series_in_file(path));
    }
    SeriesResponse {
        start: start_ms,
        end: end_ms,
        files: files.iter().map(|p| file_basename(p)).collect(),
        series: names.into_iter().collect(),
    }
}

/// The /events query: gather, merge, then downsample numeric series or
/// truncate textual ones.
pub fn query_events(
    data_dir: &Path,
    series: &str,
    start_ms: i64,
    end_ms: i64,
    max_events: usize,
) -> TsdbResult<EventsResponse> {
    let files = find_candidate_files(data_dir, start_ms, end_ms);
    let mut events: Vec<Event> = Vec::new();
    let mut max_decimal_places = 0u32;
    for path in &files {
        events.extend(read_events_for_series(path, series, start_ms, end_ms)?);
        let format_id = series_format_id_in_file(path, series)?;
        max_decimal_places = max_decimal_places.max(format::decimal_places(format_id));
    }
    events.sort_by_key(|e| e.timestamp_ms);

    let all_numeric = events.iter().all(|e| e.value.is_numeric());
    let (downsampled, points, note) = if all_numeric {
        let (downsampled, points) =
            downsample_numeric_events(&events, max_events, start_ms, end_ms, max_decimal_places);
        (downsampled, points, None)
    } else {
        let points: Vec<Point> = events
            .iter()
            .take(max_events)
            .map(|e| Point::Raw {
                timestamp: e.timestamp_ms,
                value: e.value.clone(),
            })
            .collect();
        let note = (events.len() > max_events).then(|| {
            "Series is non-numeric; returned first maxEvents without min/avg/max aggregation."
                .to_string()
        });
        (false, points, note)
    };

    Ok(EventsResponse {
        series: series.to_string(),
        start: start_ms,
        end: end_ms,
        requested_max_events: max_events,
        returned_points: points.len(),
        downsampled,
        files: files.iter().map(|p| file_basename(p)).collect(),
        points,
        note,
    })
}
