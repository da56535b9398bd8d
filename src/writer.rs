//! Stream-appending log writer. Channels are defined on first use, the
//! timestamp cursor is delta-encoded, and every value is flushed to storage
//! as soon as it is written.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use byteorder::{LittleEndian, WriteBytesExt};
use chrono::Utc;

use crate::entry::{
    ENTRY_CHANNEL_DEF_16, ENTRY_CHANNEL_DEF_8, ENTRY_EOF, ENTRY_TIME_ABSOLUTE, ENTRY_TIME_REL_16,
    ENTRY_TIME_REL_24, ENTRY_TIME_REL_32, ENTRY_TIME_REL_8, MAX_CHANNEL_8BIT, TSDB_MAGIC,
    TSDB_VERSION,
};
use crate::error::{TsdbError, TsdbResult};
use crate::format::{FORMAT_DOUBLE, FORMAT_STRING_U64};

pub(crate) fn write_file_header(out: &mut impl Write) -> std::io::Result<()> {
    out.write_all(&TSDB_MAGIC)?;
    out.write_u32::<LittleEndian>(TSDB_VERSION)
}

pub(crate) fn write_channel_definition(
    out: &mut impl Write,
    channel_id: u16,
    format_id: u8,
    series: &str,
) -> TsdbResult<()> {
    let name_bytes = series.as_bytes();
    if name_bytes.len() > 255 {
        return Err(TsdbError::SeriesNameTooLong {
            name: series.to_string(),
            len: name_bytes.len(),
        });
    }
    if channel_id <= MAX_CHANNEL_8BIT {
        out.write_all(&[
            ENTRY_CHANNEL_DEF_8,
            channel_id as u8,
            format_id,
            name_bytes.len() as u8,
        ])?;
    } else {
        out.write_u8(ENTRY_CHANNEL_DEF_16)?;
        out.write_u16::<LittleEndian>(channel_id)?;
        out.write_all(&[format_id, name_bytes.len() as u8])?;
    }
    out.write_all(name_bytes)?;
    Ok(())
}

/// Emit the timestamp-cursor entry for `new_ts` and return the updated
/// cursor. A regression in time forces an absolute reset; a zero delta emits
/// nothing.
pub(crate) fn write_timestamp_entry(
    out: &mut impl Write,
    current: Option<u64>,
    new_ts: u64,
) -> std::io::Result<u64> {
    let current = match current {
        Some(current) if new_ts >= current => current,
        _ => {
            out.write_u8(ENTRY_TIME_ABSOLUTE)?;
            out.write_u64::<LittleEndian>(new_ts)?;
            return Ok(new_ts);
        }
    };
    let delta = new_ts - current;
    if delta == 0 {
        return Ok(new_ts);
    }
    if delta <= 0xFF {
        out.write_all(&[ENTRY_TIME_REL_8, delta as u8])?;
    } else if delta <= 0xFFFF {
        out.write_u8(ENTRY_TIME_REL_16)?;
        out.write_u16::<LittleEndian>(delta as u16)?;
    } else if delta <= 0xFF_FFFF {
        out.write_u8(ENTRY_TIME_REL_24)?;
        out.write_all(&(delta as u32).to_le_bytes()[..3])?;
    } else if delta <= 0xFFFF_FFFF {
        out.write_u8(ENTRY_TIME_REL_32)?;
        out.write_u32::<LittleEndian>(delta as u32)?;
    } else {
        out.write_u8(ENTRY_TIME_ABSOLUTE)?;
        out.write_u64::<LittleEndian>(new_ts)?;
    }
    Ok(new_ts)
}

/// The 1-byte or 3-byte framing in front of a value payload.
pub(crate) fn write_value_framing(out: &mut impl Write, channel_id: u16) -> std::io::Result<()> {
    if channel_id <= MAX_CHANNEL_8BIT {
        out.write_u8(channel_id as u8)
    } else {
        out.write_u8(crate::entry::ENTRY_VALUE_16)?;
        out.write_u16::<LittleEndian>(channel_id)
    }
}

pub(crate) fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

pub struct TsdbWriter {
    file: Option<File>,
    series_to_channel: HashMap<String, (u16, u8)>,
    next_channel_id: u32,
    current_timestamp_ms: Option<u64>,
}

impl TsdbWriter {
    /// Create a fresh log file and write the 12-byte header.
    pub fn create(path: impl AsRef<Path>) -> TsdbResult<Self> {
        let mut file = File::create(path)?;
        write_file_header(&mut file)?;
        Ok(TsdbWriter {
            file: Some(file),
            series_to_channel: HashMap::new(),
            next_channel_id: 0,
            current_timestamp_ms: None,
        })
    }

    fn file_mut(&mut self) -> TsdbResult<&mut File> {
        self.file.as_mut().ok_or(TsdbError::WriterClosed)
    }

    fn ensure_channel(&mut self, series: &str, format_id: u8) -> TsdbResult<u16> {
        if let Some(&(channel_id, existing)) = self.series_to_channel.get(series) {
            if existing != format_id {
                return Err(TsdbError::FormatMismatch {
                    series: series.to_string(),
                    existing,
                    requested: format_id,
                });
            }
            return Ok(channel_id);
        }
        if self.next_channel_id > 0xFFFF {
            return Err(TsdbError::ChannelIdsExhausted);
        }
        let channel_id = self.next_channel_id as u16;
        self.next_channel_id += 1;
        write_channel_definition(self.file_mut()?, channel_id, format_id, series)?;
        self.series_to_channel
            .insert(series.to_string(), (channel_id, format_id));
        Ok(channel_id)
    }

    fn write_timestamp(&mut self, timestamp_ms: u64) -> TsdbResult<()> {
        let current = self.current_timestamp_ms;
        let file = self.file_mut()?;
        let updated = write_timestamp_entry(file, current, timestamp_ms)?;
        self.current_timestamp_ms = Some(updated);
        Ok(())
    }

    fn append_value_entry(&mut self, channel_id: u16, payload: &[u8]) -> TsdbResult<()> {
        let file = self.file_mut()?;
        write_value_framing(file, channel_id)?;
        file.write_all(payload)?;
        file.flush()?;
        Ok(())
    }

    /// Append a double value; pins the series to format 0x01 on first use.
    /// `timestamp_ms == None` stamps the event with the current time.
    pub fn add(&mut self, series: &str, value: f64, timestamp_ms: Option<u64>) -> TsdbResult<()> {
        if self.file.is_none() {
            return Err(TsdbError::WriterClosed);
        }
        let ts = timestamp_ms.unwrap_or_else(now_ms);
        self.write_timestamp(ts)?;
        let channel_id = self.ensure_channel(series, FORMAT_DOUBLE)?;
        self.append_value_entry(channel_id, &value.to_le_bytes())
    }

    /// Append a string value; pins the series to format 0x0B on first use.
    pub fn add_string(
        &mut self,
        series: &str,
        value: &str,
        timestamp_ms: Option<u64>,
    ) -> TsdbResult<()> {
        if self.file.is_none() {
            return Err(TsdbError::WriterClosed);
        }
        let ts = timestamp_ms.unwrap_or_else(now_ms);
        let raw = value.as_bytes();
        let mut payload = Vec::with_capacity(8 + raw.len());
        payload.extend_from_slice(&(raw.len() as u64).to_le_bytes());
        payload.extend_from_slice(raw);
        self.write_timestamp(ts)?;
        let channel_id = self.ensure_channel(series, FORMAT_STRING_U64)?;
        self.append_value_entry(channel_id, &payload)
    }

    /// Close the writer; `mark_complete` appends the EOF marker. Closing an
    /// already-closed writer is a no-op.
    pub fn close(&mut self, mark_complete: bool) -> TsdbResult<()> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };
        if mark_complete {
            file.write_u8(ENTRY_EOF)?;
            file.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::read_tsdb_file;
    use crate::value::Value;
    use tempfile::tempdir;

    #[test]
    fn numeric_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sample.tsdb");

        let mut writer = TsdbWriter::create(&path).unwrap();
        writer.add("pv.power", 123.5, Some(1000)).unwrap();
        writer.add("pv.power", 124.25, Some(1500)).unwrap();
        writer.close(true).unwrap();

        let db = read_tsdb_file(&path).unwrap();
        assert_eq!(db.list_series(), vec!["pv.power".to_string()]);
        assert_eq!(
            db.series_values("pv.power"),
            vec![
                (1000, Value::Double(123.5)),
                (1500, Value::Double(124.25)),
            ]
        );
    }

    #[test]
    fn format_is_locked_by_first_value_kind() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("format_lock.tsdb");

        let mut writer = TsdbWriter::create(&path).unwrap();
        writer.add("series1", 1.23, Some(1)).unwrap();
        let err = writer.add_string("series1", "nope", Some(2)).unwrap_err();
        assert!(matches!(err, TsdbError::FormatMismatch { .. }));
        writer.close(false).unwrap();
    }

    #[test]
    fn time_regression_forces_absolute_reset() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("timestamps.tsdb");

        let mut writer = TsdbWriter::create(&path).unwrap();
        writer.add("a", 1.0, Some(2000)).unwrap();
        writer.add("a", 2.0, Some(2000)).unwrap();
        writer.add("a", 3.0, Some(2100)).unwrap();
        writer.add("a", 4.0, Some(1000)).unwrap();
        writer.close(false).unwrap();

        let db = read_tsdb_file(&path).unwrap();
        assert_eq!(
            db.series_values("a"),
            vec![
                (2000, Value::Double(1.0)),
                (2000, Value::Double(2.0)),
                (2100, Value::Double(3.0)),
                (1000, Value::Double(4.0)),
            ]
        );

        // The regression to 1000 must appear on disk as a second AbsTS entry.
        let raw = std::fs::read(&path).unwrap();
        let mut tail = vec![ENTRY_TIME_ABSOLUTE];
        tail.extend_from_slice(&1000u64.to_le_bytes());
        assert!(raw
            .windows(tail.len())
            .any(|window| window == tail.as_slice()));
    }

    #[test]
    fn close_twice_is_a_noop_and_add_after_close_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("closed.tsdb");

        let mut writer = TsdbWriter::create(&path).unwrap();
        writer.add("a", 1.0, Some(1)).unwrap();
        writer.close(true).unwrap();
        writer.close(true).unwrap();
        assert!(matches!(
            writer.add("a", 2.0, Some(2)),
            Err(TsdbError::WriterClosed)
        ));
    }

    #[test]
    fn delta_widths_match_the_gap() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("deltas.tsdb");

        let mut writer = TsdbWriter::create(&path).unwrap();
        writer.add("a", 1.0, Some(0)).unwrap();
        writer.add("a", 2.0, Some(200)).unwrap(); // rel8
        writer.add("a", 3.0, Some(200 + 1_000)).unwrap(); // rel16
        writer.add("a", 4.0, Some(200 + 1_000 + 100_000)).unwrap(); // rel24
        writer
            .add("a", 5.0, Some(200 + 1_000 + 100_000 + 20_000_000))
            .unwrap(); // rel32
        writer.close(false).unwrap();

        let raw = std::fs::read(&path).unwrap();
        for tag in [
            ENTRY_TIME_REL_8,
            ENTRY_TIME_REL_16,
            ENTRY_TIME_REL_24,
            ENTRY_TIME_REL_32,
        ] {
            assert!(raw.contains(&tag), "expected tag 0x{tag:02x} in log");
        }

        let db = read_tsdb_file(&path).unwrap();
        let timestamps: Vec<u64> = db
            .series_values("a")
            .into_iter()
            .map(|(ts, _)| ts)
            .collect();
        assert_eq!(timestamps, vec![0, 200, 1_200, 101_200, 20_101_200]);
    }
}
