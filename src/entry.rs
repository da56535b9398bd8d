//! Entry-level framing of a log file: the tag table and a scanner that
//! yields one fully-consumed entry at a time.

use std::collections::HashMap;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};

use crate::codec;
use crate::error::{TsdbError, TsdbResult};
use crate::format;
use crate::value::Value;

pub const TSDB_MAGIC: [u8; 8] = *b"TSDB\x00\x00\x00\x00";
pub const TSDB_VERSION: u32 = 1;
pub const HEADER_LEN: usize = 12;

pub const ENTRY_TIME_ABSOLUTE: u8 = 0xF0;
pub const ENTRY_TIME_REL_8: u8 = 0xF1;
pub const ENTRY_TIME_REL_16: u8 = 0xF2;
pub const ENTRY_TIME_REL_24: u8 = 0xF3;
pub const ENTRY_TIME_REL_32: u8 = 0xF4;
pub const ENTRY_CHANNEL_DEF_8: u8 = 0xF5;
pub const ENTRY_CHANNEL_DEF_16: u8 = 0xF6;
pub const ENTRY_EOF: u8 = 0xFE;
pub const ENTRY_VALUE_16: u8 = 0xFF;

/// Channel ids up to this value use the 1-byte value framing; larger ids use
/// the 3-byte `Value-16` variant.
pub const MAX_CHANNEL_8BIT: u16 = 0xEF;

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelDef {
    pub format_id: u8,
    pub series: String,
}

pub type ChannelTable = HashMap<u16, ChannelDef>;

/// Verify magic and version of the 12-byte file header.
pub fn check_header(raw: &[u8], path: &Path) -> TsdbResult<()> {
    if raw.len() < HEADER_LEN {
        return Err(TsdbError::FileTooSmall(path.to_path_buf()));
    }
    if raw[..8] != TSDB_MAGIC {
        return Err(TsdbError::InvalidTag(path.to_path_buf()));
    }
    let version = LittleEndian::read_u32(&raw[8..12]);
    if version != TSDB_VERSION {
        return Err(TsdbError::UnsupportedVersion {
            version,
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeKind {
    Absolute,
    Relative { width: u8, delta: u64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScannedEntry {
    /// A value entry, stamped with the timestamp cursor at the time it was
    /// read. The caller resolves `channel_id` against its channel table.
    Value {
        channel_id: u16,
        timestamp_ms: u64,
        value: Value,
    },
    /// A timestamp-cursor entry. The scanner has already applied it; this is
    /// surfaced for byte-level dumps only.
    Time { timestamp_ms: u64, kind: TimeKind },
    Define {
        channel_id: u16,
        format_id: u8,
        series: String,
    },
    Eof,
}

/// Sequential entry scanner over a byte slice starting right after the file
/// header (or at any entry boundary for incremental parsing).
///
/// An entry is consumed only once it parses completely: on a truncation
/// error the internal offset is rewound to the entry's first byte, so the
/// caller can stop and retry from `offset()` later.
pub struct EntryScanner<'a> {
    data: &'a [u8],
    offset: usize,
    base_offset: usize,
    current_ts: Option<u64>,
}

impl<'a> EntryScanner<'a> {
    pub fn new(data: &'a [u8], base_offset: usize) -> Self {
        Self::resume(data, base_offset, None)
    }

    /// Resume scanning mid-file with a previously recorded timestamp cursor.
    pub fn resume(data: &'a [u8], base_offset: usize, current_ts: Option<u64>) -> Self {
        EntryScanner {
            data,
            offset: 0,
            base_offset,
            current_ts,
        }
    }

    /// Bytes consumed so far, counted from the start of the slice.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn current_timestamp(&self) -> Option<u64> {
        self.current_ts
    }

    /// Parse the next entry, or `None` at the end of the slice.
    pub fn next_entry(&mut self, channels: &ChannelTable) -> TsdbResult<Option<ScannedEntry>> {
        if self.offset >= self.data.len() {
            return Ok(None);
        }
        let entry_start = self.offset;
        match self.parse_one(channels) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                if e.is_truncation() {
                    self.offset = entry_start;
                }
                Err(e)
            }
        }
    }

    fn parse_one(&mut self, channels: &ChannelTable) -> TsdbResult<ScannedEntry> {
        let data = self.data;
        let tag = data[self.offset];
        let tag_offset = self.offset;
        let mut offset = self.offset + 1;

        if tag as u16 <= MAX_CHANNEL_8BIT {
            let entry = self.value_entry(tag as u16, offset, channels)?;
            return Ok(entry);
        }

        let entry = match tag {
            ENTRY_VALUE_16 => {
                let (channel_id, next) = codec::read_u16(data, offset, "16-bit channel id")?;
                self.value_entry(channel_id, next, channels)?
            }
            ENTRY_TIME_ABSOLUTE => {
                let (ts, next) = codec::read_u64(data, offset, "absolute timestamp")?;
                self.current_ts = Some(ts);
                self.offset = next;
                ScannedEntry::Time {
                    timestamp_ms: ts,
                    kind: TimeKind::Absolute,
                }
            }
            ENTRY_TIME_REL_8 => {
                let (rel, next) = codec::read_u8(data, offset, "relative timestamp (8-bit)")?;
                self.relative_time(rel as u64, 8, next)?
            }
            ENTRY_TIME_REL_16 => {
                let (rel, next) = codec::read_u16(data, offset, "relative timestamp (16-bit)")?;
                self.relative_time(rel as u64, 16, next)?
            }
            ENTRY_TIME_REL_24 => {
                let (rel, next) = codec::read_u24(data, offset)?;
                self.relative_time(rel as u64, 24, next)?
            }
            ENTRY_TIME_REL_32 => {
                let (rel, next) = codec::read_u32(data, offset, "relative timestamp (32-bit)")?;
                self.relative_time(rel as u64, 32, next)?
            }
            ENTRY_CHANNEL_DEF_8 => {
                codec::ensure_available(data, offset, 3, "8-bit channel definition")?;
                let channel_id = data[offset] as u16;
                let format_id = data[offset + 1];
                let name_len = data[offset + 2] as usize;
                offset += 3;
                let (series, next) = codec::read_utf8(data, offset, name_len, "channel name")?;
                self.offset = next;
                ScannedEntry::Define {
                    channel_id,
                    format_id,
                    series,
                }
            }
            ENTRY_CHANNEL_DEF_16 => {
                codec::ensure_available(data, offset, 4, "16-bit channel definition")?;
                let channel_id = LittleEndian::read_u16(&data[offset..]);
                let format_id = data[offset + 2];
                let name_len = data[offset + 3] as usize;
                offset += 4;
                let (series, next) = codec::read_utf8(data, offset, name_len, "channel name")?;
                self.offset = next;
                ScannedEntry::Define {
                    channel_id,
                    format_id,
                    series,
                }
            }
            ENTRY_EOF => {
                self.offset = offset;
                ScannedEntry::Eof
            }
            _ => {
                return Err(TsdbError::UnknownEntry {
                    tag,
                    offset: self.base_offset + tag_offset,
                })
            }
        };
        Ok(entry)
    }

    fn value_entry(
        &mut self,
        channel_id: u16,
        offset: usize,
        channels: &ChannelTable,
    ) -> TsdbResult<ScannedEntry> {
        let timestamp_ms = self.current_ts.ok_or(TsdbError::ValueBeforeTimestamp)?;
        let def = channels
            .get(&channel_id)
            .ok_or(TsdbError::UndefinedChannel(channel_id))?;
        let (value, next) = format::read_value(self.data, offset, def.format_id)?;
        self.offset = next;
        Ok(ScannedEntry::Value {
            channel_id,
            timestamp_ms,
            value,
        })
    }

    fn relative_time(&mut self, delta: u64, width: u8, next: usize) -> TsdbResult<ScannedEntry> {
        let current = self.current_ts.ok_or(TsdbError::RelativeBeforeAbsolute)?;
        let updated = current + delta;
        self.current_ts = Some(updated);
        self.offset = next;
        Ok(ScannedEntry::Time {
            timestamp_ms: updated,
            kind: TimeKind::Relative { width, delta },
        })
    }
}
