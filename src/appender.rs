//! Resume-friendly appending. Opening scans the existing log to rebuild the
//! channel table, the timestamp cursor and the retained-name dedupe cache,
//! then truncates a trailing EOF marker so the file stays "open".

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::entry::{
    check_header, ChannelDef, ChannelTable, EntryScanner, ScannedEntry, ENTRY_EOF, HEADER_LEN,
};
use crate::error::{TsdbError, TsdbResult};
use crate::format::{self, FORMAT_STRING_U64};
use crate::value::{Observation, Value};
use crate::writer::{
    write_channel_definition, write_file_header, write_timestamp_entry, write_value_framing,
};

/// Series whose name ends with this suffix carry retained device names;
/// consecutive identical string values are dropped.
pub const RETAINED_NAME_SUFFIX: &str = "/name";

#[derive(Debug, Default)]
struct AppendState {
    series_to_channel: HashMap<String, u16>,
    series_to_format: HashMap<String, u8>,
    next_channel_id: u32,
    current_timestamp_ms: Option<u64>,
    latest_name_values: HashMap<String, String>,
}

/// Scan a log to reconstruct appendable state. A truncated trailing entry is
/// tolerated: parsing stops there and appending resumes at the file end.
fn scan_state(path: &Path) -> TsdbResult<AppendState> {
    let raw = std::fs::read(path)?;
    check_header(&raw, path)?;

    let mut channels = ChannelTable::new();
    let mut state = AppendState::default();
    let body = &raw[HEADER_LEN..];
    let mut scanner = EntryScanner::new(body, HEADER_LEN);

    loop {
        match scanner.next_entry(&channels) {
            Ok(None) => break,
            Ok(Some(ScannedEntry::Eof)) => break,
            Ok(Some(ScannedEntry::Value {
                channel_id, value, ..
            })) => {
                if let (Some(def), Value::Text(text)) = (channels.get(&channel_id), &value) {
                    if def.series.ends_with(RETAINED_NAME_SUFFIX) {
                        state
                            .latest_name_values
                            .insert(def.series.clone(), text.clone());
                    }
                }
            }
            Ok(Some(ScannedEntry::Define {
                channel_id,
                format_id,
                series,
            })) => {
                channels.insert(
                    channel_id,
                    ChannelDef {
                        format_id,
                        series,
                    },
                );
            }
            Ok(Some(ScannedEntry::Time { .. })) => {}
            Err(e) if e.is_truncation() => {
                debug!(path = %path.display(), "partial trailing entry, resuming after it");
                break;
            }
            Err(e) => return Err(e),
        }
    }

    state.current_timestamp_ms = scanner.current_timestamp();
    for (&channel_id, def) in &channels {
        state
            .series_to_channel
            .insert(def.series.clone(), channel_id);
        state.series_to_format.insert(def.series.clone(), def.format_id);
    }
    state.next_channel_id = channels
        .keys()
        .map(|&id| id as u32 + 1)
        .max()
        .unwrap_or(0);
    Ok(state)
}

pub struct TsdbAppender {
    path: PathBuf,
    series_to_channel: HashMap<String, u16>,
    series_to_format: HashMap<String, u8>,
    next_channel_id: u32,
    current_timestamp_ms: Option<u64>,
    latest_name_values: HashMap<String, String>,
}

impl TsdbAppender {
    /// Open a possibly-crashed, possibly-clean log for appending. A missing
    /// file is created lazily on the first batch.
    pub fn open(path: impl Into<PathBuf>) -> TsdbResult<Self> {
        let path = path.into();
        let state = if path.exists() {
            scan_state(&path)?
        } else {
            AppendState::default()
        };
        Ok(TsdbAppender {
            path,
            series_to_channel: state.series_to_channel,
            series_to_format: state.series_to_format,
            next_channel_id: state.next_channel_id,
            current_timestamp_ms: state.current_timestamp_ms,
            latest_name_values: state.latest_name_values,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the header for new or empty files, and drop a trailing EOF
    /// marker so the log becomes appendable again.
    fn ensure_file_ready(&self) -> TsdbResult<()> {
        if !self.path.exists() {
            let mut file = File::create(&self.path)?;
            write_file_header(&mut file)?;
            return Ok(());
        }
        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        let size = file.seek(SeekFrom::End(0))?;
        if size == 0 {
            write_file_header(&mut file)?;
            return Ok(());
        }
        file.seek(SeekFrom::End(-1))?;
        let mut last = [0u8; 1];
        std::io::Read::read_exact(&mut file, &mut last)?;
        if last[0] == ENTRY_EOF {
            file.set_len(size - 1)?;
        }
        Ok(())
    }

    fn ensure_series_definition(
        &mut self,
        file: &mut File,
        series: &str,
        format_id: u8,
    ) -> TsdbResult<u16> {
        if let Some(&channel_id) = self.series_to_channel.get(series) {
            let existing = self.series_to_format[series];
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
        write_channel_definition(file, channel_id, format_id, series)?;
        self.series_to_channel.insert(series.to_string(), channel_id);
        self.series_to_format.insert(series.to_string(), format_id);
        Ok(channel_id)
    }

    /// Append a batch of `(timestamp_ms, series, observation)` events in
    /// order. Retained-name duplicates are skipped; numeric series reuse
    /// their pinned format, falling back to the decimals-hinted double
    /// format on first definition.
    pub fn append_events(&mut self, events: &[(u64, String, Observation)]) -> TsdbResult<()> {
        if events.is_empty() {
            return Ok(());
        }
        self.ensure_file_ready()?;
        let mut file = OpenOptions::new().append(true).open(&self.path)?;

        for (timestamp_ms, series, observation) in events {
            if let Observation::Text(text) = observation {
                if series.ends_with(RETAINED_NAME_SUFFIX)
                    && self.latest_name_values.get(series) == Some(text)
                {
                    continue;
                }
            }

            let (format_id, value) = match observation {
                Observation::Text(text) => (FORMAT_STRING_U64, Value::Text(text.clone())),
                Observation::Numeric { value, decimals } => {
                    let format_id = self
                        .series_to_format
                        .get(series)
                        .copied()
                        .unwrap_or_else(|| format::double_format_for_decimals(*decimals));
                    (format_id, Value::Double(*value))
                }
            };
            let payload =
                format::encode_value(&value, format_id).ok_or_else(|| TsdbError::CannotEncode {
                    series: series.clone(),
                    format_id,
                })?;

            let channel_id = self.ensure_series_definition(&mut file, series, format_id)?;
            self.current_timestamp_ms = Some(write_timestamp_entry(
                &mut file,
                self.current_timestamp_ms,
                *timestamp_ms,
            )?);
            write_value_framing(&mut file, channel_id)?;
            file.write_all(&payload)?;

            if let Observation::Text(text) = observation {
                if series.ends_with(RETAINED_NAME_SUFFIX) {
                    self.latest_name_values
                        .insert(series.clone(), text.clone());
                }
            }
        }
        file.flush()?;
        Ok(())
    }

}
