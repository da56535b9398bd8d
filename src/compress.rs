//! Two-pass log rewrite: parse everything, pick the narrowest lossless
//! format per series, then emit an equivalent log with freshly assigned
//! channel ids and a terminal EOF marker.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use byteorder::WriteBytesExt;
use indexmap::IndexMap;

use crate::entry::ENTRY_EOF;
use crate::error::{TsdbError, TsdbResult};
use crate::format;
use crate::reader::read_tsdb_file;
use crate::value::Value;
use crate::writer::{
    write_channel_definition, write_file_header, write_timestamp_entry, write_value_framing,
};

/// Rewrite `input` into `output`, returning the chosen format per series in
/// first-write order. Event order and timestamps are preserved exactly.
pub fn compress_tsdb_file(input: &Path, output: &Path) -> TsdbResult<IndexMap<String, u8>> {
    let db = read_tsdb_file(input)?;
    let events = db.events();
    if events.is_empty() {
        return Err(TsdbError::EmptyInput);
    }

    // Group values per series, preserving first-seen order for channel
    // assignment.
    let mut per_series: IndexMap<String, Vec<Value>> = IndexMap::new();
    for (_ts, series, value) in events {
        per_series
            .entry(series.clone())
            .or_default()
            .push(value.clone());
    }

    let mut chosen: IndexMap<String, u8> = IndexMap::new();
    for (series, values) in &per_series {
        chosen.insert(series.clone(), format::select_format(series, values)?);
    }

    let mut out = BufWriter::new(File::create(output)?);
    write_file_header(&mut out)?;

    for (index, (series, &format_id)) in chosen.iter().enumerate() {
        write_channel_definition(&mut out, index as u16, format_id, series)?;
    }

    let mut current_ts: Option<u64> = None;
    for (timestamp_ms, series, value) in events {
        current_ts = Some(write_timestamp_entry(&mut out, current_ts, *timestamp_ms)?);

        let (channel_index, _, &format_id) =
            chosen.get_full(series).ok_or_else(|| TsdbError::CannotEncode {
                series: series.clone(),
                format_id: 0,
            })?;
        let payload =
            format::encode_value(value, format_id).ok_or_else(|| TsdbError::CannotEncode {
                series: series.clone(),
                format_id,
            })?;
        write_value_framing(&mut out, channel_index as u16)?;
        out.write_all(&payload)?;
    }

    out.write_u8(ENTRY_EOF)?;
    out.flush()?;
    Ok(chosen)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{FORMAT_STRING_U8, FORMAT_DOUBLE};
    use crate::writer::TsdbWriter;
    use tempfile::tempdir;

    #[test]
    fn narrows_numerics_to_scaled_u16() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("input.tsdb");
        let output = dir.path().join("output.tsdb");

        let mut writer = TsdbWriter::create(&input).unwrap();
        writer.add("pv.power", 101.9, Some(1000)).unwrap();
        writer.add("pv.power", 0.0, Some(1100)).unwrap();
        writer.add("pv.power", 210.0, Some(1200)).unwrap();
        writer.close(true).unwrap();

        let chosen = compress_tsdb_file(&input, &output).unwrap();
        assert_eq!(chosen["pv.power"], 0xA1);

        let db = read_tsdb_file(&output).unwrap();
        assert_eq!(db.series_format_id("pv.power"), Some(0xA1));
        assert_eq!(
            db.series_values("pv.power"),
            vec![
                (1000, Value::Double(101.9)),
                (1100, Value::Double(0.0)),
                (1200, Value::Double(210.0)),
            ]
        );

        let old_size = std::fs::metadata(&input).unwrap().len();
        let new_size = std::fs::metadata(&output).unwrap().len();
        assert!(new_size < old_size);
    }

    #[test]
    fn picks_smallest_string_prefix() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("input_strings.tsdb");
        let output = dir.path().join("output_strings.tsdb");

        let mut writer = TsdbWriter::create(&input).unwrap();
        writer.add_string("state", "on", Some(1000)).unwrap();
        writer.add_string("state", "off", Some(2000)).unwrap();
        writer.close(true).unwrap();

        let chosen = compress_tsdb_file(&input, &output).unwrap();
        assert_eq!(chosen["state"], FORMAT_STRING_U8);

        let db = read_tsdb_file(&output).unwrap();
        assert_eq!(
            db.series_values("state"),
            vec![
                (1000, Value::Text("on".into())),
                (2000, Value::Text("off".into())),
            ]
        );
    }

    #[test]
    fn preserves_interleaved_event_order() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("mixed.tsdb");
        let output = dir.path().join("mixed_out.tsdb");

        let mut writer = TsdbWriter::create(&input).unwrap();
        writer.add("n", 1.0, Some(10)).unwrap();
        writer.add_string("s", "a", Some(20)).unwrap();
        writer.add("n", 2.0, Some(30)).unwrap();
        writer.add_string("s", "b", Some(5)).unwrap(); // time regression
        writer.close(true).unwrap();

        compress_tsdb_file(&input, &output).unwrap();
        let before = read_tsdb_file(&input).unwrap();
        let after = read_tsdb_file(&output).unwrap();
        assert_eq!(before.events(), after.events());
    }

    #[test]
    fn keeps_double_when_nothing_narrower_fits() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("wide.tsdb");
        let output = dir.path().join("wide_out.tsdb");

        let mut writer = TsdbWriter::create(&input).unwrap();
        writer.add("precise", 12_345.678_9, Some(1)).unwrap();
        writer.close(true).unwrap();

        let chosen = compress_tsdb_file(&input, &output).unwrap();
        assert_eq!(chosen["precise"], FORMAT_DOUBLE);

        let db = read_tsdb_file(&output).unwrap();
        assert_eq!(
            db.series_values("precise"),
            vec![(1, Value::Double(12_345.678_9))]
        );
    }

    #[test]
    fn empty_input_is_rejected() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("empty.tsdb");
        let output = dir.path().join("empty_out.tsdb");

        let mut writer = TsdbWriter::create(&input).unwrap();
        writer.close(true).unwrap();

        assert!(matches!(
            compress_tsdb_file(&input, &output),
            Err(TsdbError::EmptyInput)
        ));
    }
}
