//! Compaction rules.

use crate::aggregation::{bucket_start, Accumulator, Aggregation};
use crate::chunk::{Sample, Timestamp};
use crate::error::{Result, SeriesError};

/// A standing directive that aggregates a source series into a destination.
///
/// The rule is owned by its source series and names the destination only by
/// key; the destination is resolved through a [`crate::Namespace`] whenever
/// a bucket is flushed.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionRule {
    dest_key: String,
    aggregation: Aggregation,
    bucket_duration_ms: i64,
    accumulator: Accumulator,
}

impl CompactionRule {
    /// Creates a rule with an empty accumulator.
    ///
    /// # Errors
    ///
    /// Returns `SeriesError::InvalidBucket` if `bucket_duration_ms <= 0`.
    pub fn new(
        dest_key: impl Into<String>,
        aggregation: Aggregation,
        bucket_duration_ms: i64,
    ) -> Result<Self> {
        Self::with_accumulator(dest_key, aggregation, bucket_duration_ms, Accumulator::new())
    }

    /// Creates a rule resuming from a persisted accumulator.
    pub(crate) fn with_accumulator(
        dest_key: impl Into<String>,
        aggregation: Aggregation,
        bucket_duration_ms: i64,
        accumulator: Accumulator,
    ) -> Result<Self> {
        if bucket_duration_ms <= 0 {
            return Err(SeriesError::InvalidBucket(bucket_duration_ms));
        }
        Ok(Self {
            dest_key: dest_key.into(),
            aggregation,
            bucket_duration_ms,
            accumulator,
        })
    }

    /// Name of the destination series.
    pub fn dest_key(&self) -> &str {
        &self.dest_key
    }

    /// Aggregation applied to each bucket.
    pub fn aggregation(&self) -> Aggregation {
        self.aggregation
    }

    /// Bucket width in milliseconds.
    pub fn bucket_duration_ms(&self) -> i64 {
        self.bucket_duration_ms
    }

    /// State of the currently open bucket.
    pub fn accumulator(&self) -> &Accumulator {
        &self.accumulator
    }

    /// Bucket that `timestamp` falls into.
    pub fn bucket_for(&self, timestamp: Timestamp) -> Timestamp {
        bucket_start(timestamp, self.bucket_duration_ms)
    }

    /// Checks whether a sample at `timestamp` can be observed.
    ///
    /// Returns the start of the bucket that observing it would flush, if any.
    ///
    /// # Errors
    ///
    /// Returns `SeriesError::StaleCompactionInput` if `timestamp` maps to a
    /// bucket older than the open one.
    pub fn pending_flush(&self, timestamp: Timestamp) -> Result<Option<Timestamp>> {
        let bucket = self.bucket_for(timestamp);
        match self.accumulator.bucket_start() {
            Some(open) if bucket < open => Err(SeriesError::StaleCompactionInput {
                timestamp,
                bucket_start: open,
                destination: self.dest_key.clone(),
            }),
            Some(open) if bucket > open && !self.accumulator.is_empty() => Ok(Some(open)),
            _ => Ok(None),
        }
    }

    /// Feeds a newly stored source sample into the rule.
    ///
    /// When the sample crosses into a later bucket the open bucket is
    /// finalized and returned as `(bucket_start, value)`, and the
    /// accumulator restarts at the new bucket.
    ///
    /// # Errors
    ///
    /// Returns `SeriesError::StaleCompactionInput` if the sample is older
    /// than the open bucket; the accumulator is left untouched.
    pub fn observe(&mut self, sample: Sample) -> Result<Option<Sample>> {
        self.pending_flush(sample.timestamp)?;
        let bucket = self.bucket_for(sample.timestamp);

        let flushed = match self.accumulator.bucket_start() {
            Some(open) if open == bucket => None,
            Some(open) => {
                let flushed = self
                    .accumulator
                    .finalize(self.aggregation)
                    .map(|value| Sample::new(open, value));
                self.accumulator.reset(bucket);
                flushed
            }
            None => {
                self.accumulator.reset(bucket);
                None
            }
        };

        self.accumulator.update(sample.timestamp, sample.value);
        Ok(flushed)
    }
}
