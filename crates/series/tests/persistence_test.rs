//! Dump/restore scenarios.
//!
//! These tests verify that a dump carries everything a series owns:
//! - raw samples for both chunk encodings
//! - labels, retention and chunk budget
//! - outgoing rules including the open bucket of every accumulator
//! - rule links (`sourceKey`) after a source or destination is restored

use alopex_series::{
    codec, Aggregation, ChunkEncoding, Namespace, RangeQuery, Sample, SeriesError, SeriesOptions,
    TimeSeriesDb,
};
use proptest::prelude::*;
use std::fs::File;
use tempfile::TempDir;

fn values(samples: &[Sample]) -> Vec<(i64, f64)> {
    samples.iter().map(|s| (s.timestamp, s.value)).collect()
}

// ============================================================================
// Sample Preservation
// ============================================================================

/// A single sample survives dump, delete and restore.
#[test]
fn test_simple_dump_restore() {
    let db = TimeSeriesDb::default();
    db.create_series("test_key", Some(SeriesOptions::default().uncompressed()))
        .unwrap();
    db.append("test_key", 1, 1.0).unwrap();

    let dump = db.save("test_key").unwrap();
    db.delete_series("test_key").unwrap();
    db.load("test_key", &dump).unwrap();

    assert_eq!(
        db.range("test_key", RangeQuery::all()).unwrap(),
        vec![Sample::new(1, 1.0)]
    );
}

/// Samples, rules and links of a series with four rules survive a restore.
#[test]
fn test_dump_with_rules_and_labels() {
    let start_ts = 1_511_885_909;
    let samples_count = 1500;
    let key = "tester";
    let db = TimeSeriesDb::default();
    db.create_series(
        key,
        Some(
            SeriesOptions::default()
                .with_retention_ms(0)
                .with_chunk_size(360)
                .with_label("name", "brown")
                .with_label("color", "pink"),
        ),
    )
    .unwrap();

    let rules = [
        ("tester_agg_avg_10", Aggregation::Avg),
        ("tester_agg_max_10", Aggregation::Max),
        ("tester_agg_sum_10", Aggregation::Sum),
        ("tester_agg_stds_10", Aggregation::StdS),
    ];
    for (dest, kind) in rules {
        db.create_series(dest, None).unwrap();
        db.create_rule(key, dest, kind, 10).unwrap();
    }
    for i in 0..samples_count {
        db.append(key, start_ts + i, 5.0).unwrap();
    }

    let data = db.save(key).unwrap();
    let avg_data = db.save("tester_agg_avg_10").unwrap();
    db.delete_series(key).unwrap();
    db.delete_series("tester_agg_avg_10").unwrap();
    db.load(key, &data).unwrap();
    db.load("tester_agg_avg_10", &avg_data).unwrap();

    let expected: Vec<(i64, f64)> = (0..samples_count).map(|i| (start_ts + i, 5.0)).collect();
    let actual = db
        .range(key, RangeQuery::new(start_ts, start_ts + samples_count))
        .unwrap();
    assert_eq!(values(&actual), expected);

    let first_three = db
        .range(
            key,
            RangeQuery::new(start_ts, start_ts + samples_count).with_count(3),
        )
        .unwrap();
    assert_eq!(values(&first_three), expected[..3].to_vec());

    let info = db.info(key).unwrap();
    let reported: Vec<(String, i64, String)> = info
        .rules
        .iter()
        .map(|r| (r.dest_key.clone(), r.bucket_duration_ms, r.aggregation.to_string()))
        .collect();
    assert_eq!(
        reported,
        vec![
            ("tester_agg_avg_10".to_string(), 10, "AVG".to_string()),
            ("tester_agg_max_10".to_string(), 10, "MAX".to_string()),
            ("tester_agg_sum_10".to_string(), 10, "SUM".to_string()),
            ("tester_agg_stds_10".to_string(), 10, "STD.S".to_string()),
        ]
    );
    assert_eq!(
        info.labels,
        vec![
            ("name".to_string(), "brown".to_string()),
            ("color".to_string(), "pink".to_string()),
        ]
    );
    for (dest, _) in rules {
        assert_eq!(db.info(dest).unwrap().source_key.as_deref(), Some(key));
    }
}

// ============================================================================
// Aggregation Context
// ============================================================================

/// Open buckets resume after every series is dumped, deleted and restored.
///
/// If the accumulator state were lost, the second bucket would only reflect
/// the sample added after the restore.
#[test]
fn test_aggregation_context_survives_restore() {
    let start_ts = 3;
    let key = "tester";
    let dests = [
        ("tester_agg_avg_3", Aggregation::Avg),
        ("tester_agg_min_3", Aggregation::Min),
        ("tester_agg_sum_3", Aggregation::Sum),
        ("tester_agg_std_3", Aggregation::StdS),
    ];

    let db = TimeSeriesDb::default();
    db.create_series(key, None).unwrap();
    for (dest, kind) in dests {
        db.create_series(dest, None).unwrap();
        db.create_rule(key, dest, kind, 3).unwrap();
    }
    for i in 0..4 {
        db.append(key, start_ts + i, i as f64).unwrap();
    }

    let mut dumps = vec![(key, db.save(key).unwrap())];
    for (dest, _) in dests {
        dumps.push((dest, db.save(dest).unwrap()));
    }
    for (name, _) in &dumps {
        db.delete_series(name).unwrap();
    }
    assert!(db.is_empty());
    for (name, dump) in &dumps {
        db.load(name, dump).unwrap();
    }

    db.append(key, start_ts + 4, 4.0).unwrap();
    db.append(key, start_ts + 14, 0.0).unwrap();

    let query = RangeQuery::new(start_ts, start_ts + 4);
    assert_eq!(
        values(&db.range("tester_agg_avg_3", query).unwrap()),
        vec![(3, 1.0), (6, 3.5)]
    );
    assert_eq!(
        values(&db.range("tester_agg_min_3", query).unwrap()),
        vec![(3, 0.0), (6, 3.0)]
    );
    assert_eq!(
        values(&db.range("tester_agg_sum_3", query).unwrap()),
        vec![(3, 3.0), (6, 7.0)]
    );
    let std = db.range("tester_agg_std_3", query).unwrap();
    assert_eq!(std[0], Sample::new(3, 1.0));
    assert_eq!(std[1].timestamp, 6);
    assert!((std[1].value - 0.7071).abs() < 1e-4);
}

/// A restored run produces the same destination as an uninterrupted one.
#[test]
fn test_restore_matches_uninterrupted_run() {
    let kinds = [
        Aggregation::Avg,
        Aggregation::Range,
        Aggregation::Count,
        Aggregation::First,
        Aggregation::Last,
        Aggregation::StdP,
        Aggregation::VarS,
    ];
    let input: Vec<(i64, f64)> = (0..97).map(|i| (i * 7, (i as f64 * 0.37).sin())).collect();
    let split = 50;

    let build = || {
        let db = TimeSeriesDb::default();
        db.create_series("src", None).unwrap();
        for kind in kinds {
            let dest = format!("dst_{kind}");
            db.create_series(&dest, None).unwrap();
            db.create_rule("src", &dest, kind, 60).unwrap();
        }
        db
    };

    let straight = build();
    for &(ts, v) in &input {
        straight.append("src", ts, v).unwrap();
    }

    let resumed = build();
    for &(ts, v) in &input[..split] {
        resumed.append("src", ts, v).unwrap();
    }
    let dump = resumed.save("src").unwrap();
    resumed.delete_series("src").unwrap();
    resumed.load("src", &dump).unwrap();
    for &(ts, v) in &input[split..] {
        resumed.append("src", ts, v).unwrap();
    }

    for kind in kinds {
        let dest = format!("dst_{kind}");
        let a = straight.range(&dest, RangeQuery::all()).unwrap();
        let b = resumed.range(&dest, RangeQuery::all()).unwrap();
        assert!(!a.is_empty());
        assert_eq!(values(&a), values(&b), "{kind} diverged after restore");
    }
}

// ============================================================================
// Retention and Empty Series
// ============================================================================

/// A series trimmed by retention dumps and restores to the same range.
#[test]
fn test_dump_trimmed_series() {
    let start_ts = 1_589_461_305_983;
    let db = TimeSeriesDb::default();
    db.create_series(
        "test_key",
        Some(
            SeriesOptions::default()
                .with_retention_ms(3000)
                .with_chunk_size(160)
                .uncompressed(),
        ),
    )
    .unwrap();
    for i in 1..120 {
        db.append("test_key", start_ts + i * 1000, i as f64).unwrap();
    }

    let before = db.range("test_key", RangeQuery::all()).unwrap();
    assert_eq!(
        values(&before),
        vec![
            (1_589_461_421_983, 116.0),
            (1_589_461_422_983, 117.0),
            (1_589_461_423_983, 118.0),
            (1_589_461_424_983, 119.0),
        ]
    );

    let dump = db.save("test_key").unwrap();
    db.delete_series("test_key").unwrap();
    db.load("test_key", &dump).unwrap();
    assert_eq!(db.range("test_key", RangeQuery::all()).unwrap(), before);
}

/// Aggregated ranges over an empty series are empty, and it still dumps.
#[test]
fn test_empty_series() {
    let db = TimeSeriesDb::default();
    db.create_series("tester", None).unwrap();
    for name in [
        "avg", "sum", "min", "max", "range", "first", "last", "std.p", "std.s", "var.p", "var.s",
    ] {
        let kind: Aggregation = name.parse().unwrap();
        let result = db
            .range("tester", RangeQuery::all().with_aggregation(kind, 1000))
            .unwrap();
        assert!(result.is_empty(), "{name} returned {result:?}");
    }
    assert!(!db.save("tester").unwrap().is_empty());
}

// ============================================================================
// Rule Links
// ============================================================================

/// Restoring a deleted source re-links its surviving destination.
#[test]
fn test_restore_source_relinks_destination() {
    let db = TimeSeriesDb::default();
    db.create_series("ts1", None).unwrap();
    db.create_series("ts2", None).unwrap();
    db.create_rule("ts1", "ts2", "avg".parse().unwrap(), 60_000)
        .unwrap();
    assert_eq!(db.info("ts2").unwrap().source_key.as_deref(), Some("ts1"));
    assert_eq!(db.info("ts1").unwrap().rules.len(), 1);

    let data = db.save("ts1").unwrap();
    db.delete_series("ts1").unwrap();
    assert_eq!(db.info("ts2").unwrap().source_key, None);
    db.load("ts1", &data).unwrap();

    assert_eq!(db.info("ts1").unwrap().rules.len(), 1);
    assert_eq!(db.info("ts2").unwrap().source_key.as_deref(), Some("ts1"));
}

/// A restored source whose destination is gone fails only when a bucket closes.
#[test]
fn test_missing_destination_resolved_lazily() {
    let db = TimeSeriesDb::default();
    db.create_series("src", None).unwrap();
    db.create_series("dst", None).unwrap();
    db.create_rule("src", "dst", Aggregation::Sum, 10).unwrap();
    db.append("src", 1, 1.0).unwrap();

    let dump = db.save("src").unwrap();
    db.delete_series("src").unwrap();
    db.delete_series("dst").unwrap();
    db.load("src", &dump).unwrap();

    db.append("src", 2, 1.0).unwrap();
    assert!(matches!(
        db.append("src", 11, 1.0),
        Err(SeriesError::DestinationMissing(name)) if name == "dst"
    ));

    db.create_series("dst", None).unwrap();
    db.append("src", 11, 1.0).unwrap();
    assert_eq!(
        db.range("dst", RangeQuery::all()).unwrap(),
        vec![Sample::new(0, 2.0)]
    );
}

// ============================================================================
// Corruption and Files
// ============================================================================

/// Every damaged dump is rejected without touching the keyspace.
#[test]
fn test_corrupt_dumps_rejected() {
    let db = TimeSeriesDb::default();
    db.create_series("a", None).unwrap();
    for ts in 0..100 {
        db.append("a", ts, ts as f64).unwrap();
    }
    let dump = db.save("a").unwrap();

    for cut in [0, 3, 6, 10, dump.len() / 2, dump.len() - 1] {
        let err = db.load("b", &dump[..cut]).unwrap_err();
        assert!(err.is_corrupt(), "cut at {cut}: {err:?}");
    }

    let mut flipped = dump.clone();
    flipped[20] ^= 0x01;
    assert!(matches!(
        db.load("b", &flipped),
        Err(SeriesError::ChecksumMismatch { .. })
    ));

    let mut future = dump.clone();
    future[4..6].copy_from_slice(&7u16.to_le_bytes());
    assert!(matches!(
        db.load("b", &future),
        Err(SeriesError::UnsupportedVersion(7))
    ));

    assert!(!db.contains("b"));
    assert_eq!(db.len(), 1);
}

/// A dump written to disk restores the same series.
#[test]
fn test_dump_to_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("series.dump");

    let db = TimeSeriesDb::default();
    db.create_series("disk", Some(SeriesOptions::default().with_chunk_size(128)))
        .unwrap();
    db.create_series("disk_max", None).unwrap();
    db.create_rule("disk", "disk_max", Aggregation::Max, 100)
        .unwrap();
    for ts in 0..1000 {
        db.append("disk", ts, (ts % 17) as f64).unwrap();
    }

    {
        let handle = db.keyspace().lookup("disk").unwrap();
        let series = handle.read().unwrap();
        let mut file = File::create(&path).unwrap();
        codec::write_to(&series, &mut file).unwrap();
    }

    let restored = codec::read_from(&mut File::open(&path).unwrap()).unwrap();
    let original = db.range("disk", RangeQuery::all()).unwrap();
    let reloaded: Vec<Sample> = restored.range(i64::MIN, i64::MAX, None).collect();
    assert_eq!(original, reloaded);
    assert_eq!(restored.rules().len(), 1);
    assert_eq!(restored.rules()[0].accumulator().bucket_start(), Some(900));
}

proptest! {
    /// Restoring mid-stream and continuing yields exactly what an
    /// uninterrupted run produces, for the source and its destination.
    #[test]
    fn test_restore_matches_uninterrupted(
        compressed in any::<bool>(),
        kind in 0usize..Aggregation::ALL.len(),
        bucket in 1i64..200,
        points in prop::collection::vec((1i64..50, -1e6f64..1e6), 2..300),
        split in 0.0f64..1.0,
    ) {
        let encoding = if compressed {
            ChunkEncoding::Compressed
        } else {
            ChunkEncoding::Uncompressed
        };
        let kind = Aggregation::ALL[kind];
        let build = || {
            let db = TimeSeriesDb::default();
            db.create_series("src", Some(SeriesOptions::default().with_encoding(encoding).with_chunk_size(96)))
                .unwrap();
            db.create_series("dst", None).unwrap();
            db.create_rule("src", "dst", kind, bucket).unwrap();
            db
        };

        let mut ts = 0;
        let samples: Vec<(i64, f64)> = points
            .into_iter()
            .map(|(delta, value)| {
                ts += delta;
                (ts, value)
            })
            .collect();
        let cut = (samples.len() as f64 * split) as usize;

        let uninterrupted = build();
        let interrupted = build();
        for &(ts, value) in &samples[..cut] {
            uninterrupted.append("src", ts, value).unwrap();
            interrupted.append("src", ts, value).unwrap();
        }

        let restored = TimeSeriesDb::default();
        restored.load("dst", &interrupted.save("dst").unwrap()).unwrap();
        restored.load("src", &interrupted.save("src").unwrap()).unwrap();
        for &(ts, value) in &samples[cut..] {
            uninterrupted.append("src", ts, value).unwrap();
            restored.append("src", ts, value).unwrap();
        }

        for name in ["src", "dst"] {
            let expected = uninterrupted.range(name, RangeQuery::all()).unwrap();
            let actual = restored.range(name, RangeQuery::all()).unwrap();
            prop_assert_eq!(expected.len(), actual.len());
            for (e, a) in expected.iter().zip(&actual) {
                prop_assert_eq!(e.timestamp, a.timestamp);
                prop_assert_eq!(e.value.to_bits(), a.value.to_bits());
            }
        }
        let dst_info = restored.info("dst").unwrap();
        prop_assert_eq!(dst_info.source_key.as_deref(), Some("src"));
    }
}
