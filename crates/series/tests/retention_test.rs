//! Retention trimming and chunk rollover.

use alopex_series::{ChunkEncoding, Sample, Series, SeriesOptions};
use proptest::prelude::*;

fn encodings() -> impl Strategy<Value = ChunkEncoding> {
    prop_oneof![Just(ChunkEncoding::Uncompressed), Just(ChunkEncoding::Compressed)]
}

proptest! {
    /// After every append no retained chunk ends before `latest - retention`,
    /// except the one holding the newest sample.
    #[test]
    fn test_retention_invariant(
        encoding in encodings(),
        retention in 1u64..5_000,
        deltas in prop::collection::vec(1i64..400, 1..400),
    ) {
        let options = SeriesOptions::default()
            .with_encoding(encoding)
            .with_chunk_size(64)
            .with_retention_ms(retention);
        let mut series = Series::new("r", options).unwrap();

        let mut ts = 0;
        for delta in deltas {
            ts += delta;
            series.append(Sample::new(ts, 1.0)).unwrap();

            let floor = ts - retention as i64;
            let chunks = series.chunks();
            prop_assert!(!chunks.is_empty());
            for chunk in &chunks[..chunks.len() - 1] {
                prop_assert!(chunk.last_timestamp().unwrap() >= floor);
            }
            prop_assert_eq!(chunks.last().unwrap().last_timestamp(), Some(ts));

            // Whatever the range returns lies inside the window.
            let returned: Vec<Sample> = series.range(i64::MIN, i64::MAX, None).collect();
            prop_assert!(returned.iter().all(|s| s.timestamp >= floor));
            prop_assert_eq!(returned.last().map(|s| s.timestamp), Some(ts));
        }
    }

    /// The sample count always matches what a full scan sees without retention.
    #[test]
    fn test_total_samples_tracks_chunks(
        encoding in encodings(),
        count in 1usize..600,
    ) {
        let options = SeriesOptions::default()
            .with_encoding(encoding)
            .with_chunk_size(128);
        let mut series = Series::new("n", options).unwrap();
        for i in 0..count {
            series.append(Sample::new(i as i64 * 10, i as f64)).unwrap();
        }
        prop_assert_eq!(series.total_samples(), count as u64);
        prop_assert_eq!(series.range(i64::MIN, i64::MAX, None).count(), count);
    }
}

#[test]
fn test_trim_never_drops_last_chunk() {
    let options = SeriesOptions::default()
        .uncompressed()
        .with_chunk_size(160)
        .with_retention_ms(1);
    let mut series = Series::new("t", options).unwrap();
    for i in 0..10 {
        series.append(Sample::new(i, 0.0)).unwrap();
    }
    series.append(Sample::new(1_000_000, 0.0)).unwrap();
    assert_eq!(series.chunk_count(), 1);
    assert_eq!(series.total_samples(), 1);
    assert_eq!(series.first_timestamp(), Some(1_000_000));
}

#[test]
fn test_uncompressed_chunks_hold_budget_samples() {
    let options = SeriesOptions::default()
        .uncompressed()
        .with_chunk_size(160)
        .with_retention_ms(3000);
    let mut series = Series::new("t", options).unwrap();
    let start = 1_589_461_305_983_i64;
    for i in 1..120 {
        series
            .append(Sample::new(start + i * 1000, i as f64))
            .unwrap();
    }
    // Chunks of ten samples; only the chunk holding 111..=119 survives,
    // and the range clamps it to the window.
    assert_eq!(series.chunk_count(), 1);
    assert_eq!(series.total_samples(), 9);
    let tail: Vec<f64> = series
        .range(i64::MIN, i64::MAX, None)
        .map(|s| s.value)
        .collect();
    assert_eq!(tail, vec![116.0, 117.0, 118.0, 119.0]);
}
