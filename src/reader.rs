//! Strict whole-file parsing into an in-memory event list plus the
//! per-series format map, and the human-readable dump built on top of it.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::Path;

use chrono::{TimeZone, Utc};

use crate::entry::{check_header, ChannelDef, ChannelTable, EntryScanner, ScannedEntry, HEADER_LEN};
use crate::error::TsdbResult;
use crate::format;
use crate::value::{Event, Value};

#[derive(Debug, Default)]
pub struct TimeSeriesDb {
    events: Vec<(u64, String, Value)>,
    series_points: BTreeMap<String, Vec<Event>>,
    series_format_ids: HashMap<String, u8>,
}

impl TimeSeriesDb {
    fn append(&mut self, series: &str, timestamp_ms: u64, value: Value) {
        self.series_points
            .entry(series.to_string())
            .or_default()
            .push(Event::new(timestamp_ms, value.clone()));
        self.events.push((timestamp_ms, series.to_string(), value));
    }

    fn set_series_format_id(&mut self, series: &str, format_id: u8) {
        self.series_format_ids.insert(series.to_string(), format_id);
    }

    pub fn list_series(&self) -> Vec<String> {
        self.series_points.keys().cloned().collect()
    }

    pub fn series_values(&self, series: &str) -> Vec<(u64, Value)> {
        self.series_points
            .get(series)
            .map(|points| {
                points
                    .iter()
                    .map(|p| (p.timestamp_ms, p.value.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All events in on-disk order.
    pub fn events(&self) -> &[(u64, String, Value)] {
        &self.events
    }

    pub fn series_format_id(&self, series: &str) -> Option<u8> {
        self.series_format_ids.get(series).copied()
    }

    pub fn dump(&self, out: &mut impl Write) -> std::io::Result<()> {
        writeln!(
            out,
            "TimeSeriesDB dump: series={} events={}",
            self.series_points.len(),
            self.events.len()
        )?;
        writeln!(out, "Series:")?;
        for series in self.list_series() {
            match self.series_format_ids.get(&series) {
                Some(&format_id) => writeln!(
                    out,
                    "  - {}: format=0x{:02x} ({})",
                    series,
                    format_id,
                    format::describe(format_id)
                )?,
                None => writeln!(out, "  - {}: format=unknown", series)?,
            }
        }
        writeln!(out, "Events:")?;
        let mut prev_ts: Option<u64> = None;
        for (idx, (timestamp_ms, series, value)) in self.events.iter().enumerate() {
            let rel_text = rel_text(prev_ts, *timestamp_ms);
            prev_ts = Some(*timestamp_ms);
            let format_text = match self.series_format_ids.get(series) {
                Some(format_id) => format!("0x{format_id:02x}"),
                None => "??".to_string(),
            };
            writeln!(
                out,
                "  [{}] ts_abs={} ({}) ts_rel={} series={} format={} value={}",
                idx,
                timestamp_ms,
                format_ts(*timestamp_ms),
                rel_text,
                series,
                format_text,
                display_value(value),
            )?;
        }
        Ok(())
    }
}

fn rel_text(prev: Option<u64>, ts: u64) -> String {
    match prev {
        Some(prev) if ts >= prev => format!("+{}", ts - prev),
        _ => "ABS".to_string(),
    }
}

fn format_ts(timestamp_ms: u64) -> String {
    match Utc.timestamp_millis_opt(timestamp_ms as i64).single() {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        None => format!("{timestamp_ms}ms"),
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::Double(v) => format!("{v:?}"),
        Value::Text(t) => format!("{t:?}"),
    }
}

/// Parse a complete log file. Every structural problem (bad header, unknown
/// tag, undefined channel, value before timestamp, truncated entry) is an
/// error here; tolerant tail handling lives in the file cache.
pub fn read_tsdb_file(path: impl AsRef<Path>) -> TsdbResult<TimeSeriesDb> {
    read_with_dump(path.as_ref(), None, 0)
}

/// Parse while streaming a dump to `out`; `verbose > 0` adds one line per
/// physical entry with its byte offset and raw bytes.
pub fn dump_tsdb_file(path: impl AsRef<Path>, out: &mut impl Write, verbose: u8) -> TsdbResult<()> {
    read_with_dump(path.as_ref(), Some(out), verbose)?;
    Ok(())
}

fn read_with_dump(
    path: &Path,
    mut dump_out: Option<&mut dyn Write>,
    verbose: u8,
) -> TsdbResult<TimeSeriesDb> {
    let raw = std::fs::read(path)?;
    check_header(&raw, path)?;

    let mut db = TimeSeriesDb::default();
    let mut channels = ChannelTable::new();
    let body = &raw[HEADER_LEN..];
    let mut scanner = EntryScanner::new(body, HEADER_LEN);
    let mut prev_event_ts: Option<u64> = None;

    if let Some(out) = dump_out.as_deref_mut() {
        writeln!(out, "Events:")?;
    }

    loop {
        let entry_start = scanner.offset();
        let Some(entry) = scanner.next_entry(&channels)? else {
            break;
        };
        let entry_bytes = &body[entry_start..scanner.offset()];
        match entry {
            ScannedEntry::Value {
                channel_id,
                timestamp_ms,
                value,
            } => {
                // Channel presence was already checked by the scanner.
                let Some(def) = channels.get(&channel_id) else {
                    continue;
                };
                let series = def.series.clone();
                let format_id = def.format_id;
                if let Some(out) = dump_out.as_deref_mut() {
                    if verbose > 0 {
                        writeln!(
                            out,
                            "        @{:08x}: {} (value ch={} format=0x{:02x})",
                            HEADER_LEN + entry_start,
                            hex_bytes(entry_bytes),
                            channel_id,
                            format_id
                        )?;
                    }
                    let rel = rel_text(prev_event_ts, timestamp_ms);
                    prev_event_ts = Some(timestamp_ms);
                    writeln!(
                        out,
                        "  [{}] ts_abs={} ({}) ts_rel={} series={} format=0x{:02x} value={}",
                        db.events.len(),
                        timestamp_ms,
                        format_ts(timestamp_ms),
                        rel,
                        series,
                        format_id,
                        display_value(&value),
                    )?;
                }
                db.append(&series, timestamp_ms, value);
            }
            ScannedEntry::Time { timestamp_ms, kind } => {
                if let Some(out) = dump_out.as_deref_mut() {
                    if verbose > 0 {
                        use crate::entry::TimeKind;
                        let what = match kind {
                            TimeKind::Absolute => format!("ts_abs={timestamp_ms}"),
                            TimeKind::Relative { width, delta } => {
                                format!("ts_rel{width}=+{delta} -> {timestamp_ms}")
                            }
                        };
                        writeln!(
                            out,
                            "        @{:08x}: {} ({})",
                            HEADER_LEN + entry_start,
                            hex_bytes(entry_bytes),
                            what
                        )?;
                    }
                }
            }
            ScannedEntry::Define {
                channel_id,
                format_id,
                series,
            } => {
                if let Some(out) = dump_out.as_deref_mut() {
                    if verbose > 0 {
                        writeln!(
                            out,
                            "        @{:08x}: {} (def ch={} format=0x{:02x} name={:?})",
                            HEADER_LEN + entry_start,
                            hex_bytes(entry_bytes),
                            channel_id,
                            format_id,
                            series
                        )?;
                    }
                }
                db.set_series_format_id(&series, format_id);
                channels.insert(
                    channel_id,
                    ChannelDef {
                        format_id,
                        series,
                    },
                );
            }
            ScannedEntry::Eof => {
                if let Some(out) = dump_out.as_deref_mut() {
                    if verbose > 0 {
                        writeln!(
                            out,
                            "        @{:08x}: {} (eof)",
                            HEADER_LEN + entry_start,
                            hex_bytes(entry_bytes)
                        )?;
                    }
                }
                break;
            }
        }
    }

    if let Some(out) = dump_out.as_deref_mut() {
        writeln!(
            out,
            "TimeSeriesDB dump: series={} events={}",
            db.series_points.len(),
            db.events.len()
        )?;
        writeln!(out, "Series:")?;
        for series in db.list_series() {
            match db.series_format_ids.get(&series) {
                Some(&format_id) => writeln!(
                    out,
                    "  - {}: format=0x{:02x} ({})",
                    series,
                    format_id,
                    format::describe(format_id)
                )?,
                None => writeln!(out, "  - {}: format=unknown", series)?,
            }
        }
    }

    Ok(db)
}

fn hex_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}
