//! End-to-end flows across the writer, appender, compressor, cache and
//! query engine, against real files in temp directories.

use chrono::{TimeZone, Utc};
use tempfile::tempdir;

use tsdb::appender::TsdbAppender;
use tsdb::compress::compress_tsdb_file;
use tsdb::demo::generate_demo_data;
use tsdb::format::is_equal_6_digits;
use tsdb::query::{self, Point};
use tsdb::reader::read_tsdb_file;
use tsdb::value::{Observation, Value};
use tsdb::writer::TsdbWriter;

#[test]
fn roundtrip_double_and_string_values() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("sample.tsdb");

    let mut writer = TsdbWriter::create(&path).unwrap();
    writer.add("pv.power", 123.5, Some(1000)).unwrap();
    writer.add_string("status.mode", "running", Some(1000)).unwrap();
    writer.add("pv.power", 124.25, Some(1500)).unwrap();
    writer.add_string("status.mode", "idle", Some(2300)).unwrap();
    writer.close(true).unwrap();

    let db = read_tsdb_file(&path).unwrap();
    assert_eq!(
        db.list_series(),
        vec!["pv.power".to_string(), "status.mode".to_string()]
    );
    assert_eq!(
        db.series_values("pv.power"),
        vec![(1000, Value::Double(123.5)), (1500, Value::Double(124.25))]
    );
    assert_eq!(
        db.series_values("status.mode"),
        vec![
            (1000, Value::Text("running".into())),
            (2300, Value::Text("idle".into())),
        ]
    );
}

#[test]
fn appender_resumes_after_clean_and_unclean_close() {
    let dir = tempdir().unwrap();

    for mark_complete in [true, false] {
        let path = dir
            .path()
            .join(format!("resume_{mark_complete}.tsdb"));
        let mut writer = TsdbWriter::create(&path).unwrap();
        writer.add("a", 1.0, Some(1000)).unwrap();
        writer.add("a", 2.0, Some(2000)).unwrap();
        writer.close(mark_complete).unwrap();

        let mut appender = TsdbAppender::open(&path).unwrap();
        appender
            .append_events(&[
                (3000, "a".to_string(), Observation::numeric(3.0)),
                (3000, "b".to_string(), Observation::text("fresh")),
            ])
            .unwrap();

        let db = read_tsdb_file(&path).unwrap();
        assert_eq!(
            db.series_values("a"),
            vec![
                (1000, Value::Double(1.0)),
                (2000, Value::Double(2.0)),
                (3000, Value::Double(3.0)),
            ],
            "mark_complete={mark_complete}"
        );
        assert_eq!(
            db.series_values("b"),
            vec![(3000, Value::Text("fresh".into()))]
        );
    }
}

#[test]
fn compression_is_lossless_at_six_digits_and_smaller() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("compress_me.tsdb");
    let output = dir.path().join("compressed.tsdb");

    let mut writer = TsdbWriter::create(&input).unwrap();
    for i in 0..200u64 {
        writer
            .add(
                "pv.power",
                100.0 + (i % 10) as f64 / 10.0,
                Some(1_700_000_000_000 + i * 1000),
            )
            .unwrap();
    }
    writer.add_string("state", "on", Some(1_700_000_199_000)).unwrap();
    writer.close(true).unwrap();

    let chosen = compress_tsdb_file(&input, &output).unwrap();
    assert_eq!(chosen["pv.power"], 0xA1);
    assert_eq!(chosen["state"], 0x08);

    let before = read_tsdb_file(&input).unwrap();
    let after = read_tsdb_file(&output).unwrap();
    assert_eq!(before.events().len(), after.events().len());
    for ((ts_a, name_a, val_a), (ts_b, name_b, val_b)) in
        before.events().iter().zip(after.events())
    {
        assert_eq!(ts_a, ts_b);
        assert_eq!(name_a, name_b);
        match (val_a, val_b) {
            (Value::Double(a), Value::Double(b)) => assert!(is_equal_6_digits(*a, *b)),
            (a, b) => assert_eq!(a, b),
        }
    }

    let old_size = std::fs::metadata(&input).unwrap().len();
    let new_size = std::fs::metadata(&output).unwrap().len();
    assert!(new_size < old_size);
}

#[test]
fn queries_observe_appends_through_the_cache() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("data_1970-01-01.tsdb");
    let window_end = 86_400_000 - 1;

    let mut appender = TsdbAppender::open(&path).unwrap();
    appender
        .append_events(&[
            (1000, "pv.power".to_string(), Observation::numeric(10.0)),
            (2000, "pv.power".to_string(), Observation::numeric(20.0)),
        ])
        .unwrap();

    let response = query::query_events(dir.path(), "pv.power", 0, window_end, 100).unwrap();
    assert_eq!(response.returned_points, 2);
    assert_eq!(response.files, vec!["data_1970-01-01.tsdb".to_string()]);

    // Readers across threads observe a consistent snapshot while more data
    // arrives.
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let data_dir = dir.path().to_path_buf();
            std::thread::spawn(move || {
                let response =
                    query::query_events(&data_dir, "pv.power", 0, window_end, 100).unwrap();
                assert!(response.returned_points >= 2);
            })
        })
        .collect();
    appender
        .append_events(&[(3000, "pv.power".to_string(), Observation::numeric(30.0))])
        .unwrap();
    for handle in handles {
        handle.join().unwrap();
    }

    let response = query::query_events(dir.path(), "pv.power", 0, window_end, 100).unwrap();
    assert_eq!(response.returned_points, 3);
    assert!(!response.downsampled);

    // Only the events inside the window are returned.
    let response = query::query_events(dir.path(), "pv.power", 1500, 2500, 100).unwrap();
    assert_eq!(response.returned_points, 1);
}

#[test]
fn demo_data_feeds_the_query_surface() {
    let dir = tempdir().unwrap();
    let files = generate_demo_data(1, dir.path(), None).unwrap();
    assert_eq!(files.len(), 1);

    let day = Utc::now().date_naive();
    let start_ms = Utc
        .from_utc_datetime(&day.and_hms_opt(0, 0, 0).unwrap())
        .timestamp_millis();
    let end_ms = start_ms + 86_400_000 - 1;

    let listing = query::list_series(dir.path(), start_ms, end_ms);
    assert!(listing.series.contains(&"solar/ac/power".to_string()));

    let response =
        query::query_events(dir.path(), "solar/ac/power", start_ms, end_ms, 10).unwrap();
    assert!(response.downsampled);
    assert!(response.returned_points <= 10);
    let total: usize = response
        .points
        .iter()
        .map(|p| match p {
            Point::Bucket { count, .. } => *count,
            Point::Raw { .. } => 0,
        })
        .sum();
    assert_eq!(total, 288); // every 5-minute step lands in some bucket

    for point in &response.points {
        let Point::Bucket {
            timestamp,
            start,
            end,
            min,
            avg,
            max,
            ..
        } = point
        else {
            panic!("expected bucket points");
        };
        assert!(start <= timestamp && timestamp <= end);
        assert!(*start >= start_ms && *end <= end_ms);
        assert!(min <= avg && avg <= max);
    }
}

#[test]
fn channels_past_the_one_byte_range_use_wide_framing() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("many.tsdb");
    let output = dir.path().join("many_out.tsdb");

    // 300 series forces channel ids past 0xEF, so both the writer and the
    // compressor must switch to the 16-bit definitions and value framing.
    let mut writer = TsdbWriter::create(&path).unwrap();
    for i in 0..300u64 {
        writer
            .add(&format!("sensor/{i:03}"), i as f64, Some(1000 + i))
            .unwrap();
    }
    writer.close(true).unwrap();

    let db = read_tsdb_file(&path).unwrap();
    assert_eq!(db.list_series().len(), 300);
    assert_eq!(
        db.series_values("sensor/299"),
        vec![(1299, Value::Double(299.0))]
    );

    compress_tsdb_file(&path, &output).unwrap();
    let compressed = read_tsdb_file(&output).unwrap();
    assert_eq!(compressed.events().len(), 300);
    assert_eq!(
        compressed.series_values("sensor/299"),
        vec![(1299, Value::Double(299.0))]
    );
}

#[test]
fn compressed_files_stay_appendable_for_matching_formats() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("cycle.tsdb");
    let output = dir.path().join("cycle_out.tsdb");

    let mut writer = TsdbWriter::create(&input).unwrap();
    writer.add("power", 10.5, Some(1000)).unwrap();
    writer.add("power", 11.5, Some(2000)).unwrap();
    writer.close(true).unwrap();
    compress_tsdb_file(&input, &output).unwrap();

    // The compressed log pinned `power` to a scaled format; appending a
    // value representable in it succeeds, one that is not fails.
    let mut appender = TsdbAppender::open(&output).unwrap();
    appender
        .append_events(&[(3000, "power".to_string(), Observation::numeric(12.5))])
        .unwrap();
    let err = appender
        .append_events(&[(4000, "power".to_string(), Observation::numeric(0.125))])
        .unwrap_err();
    assert!(matches!(err, tsdb::TsdbError::CannotEncode { .. }));

    let db = read_tsdb_file(&output).unwrap();
    assert_eq!(
        db.series_values("power"),
        vec![
            (1000, Value::Double(10.5)),
            (2000, Value::Double(11.5)),
            (3000, Value::Double(12.5)),
        ]
    );
}
