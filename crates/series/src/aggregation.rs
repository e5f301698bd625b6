//! Aggregation kinds and the streaming per-bucket accumulator.
//!
//! The accumulator keeps every running statistic at once (sum, extremes,
//! first/last and Welford moments) so any kind can be finalized in O(1) and
//! the whole state can be persisted and resumed mid-bucket.

use crate::chunk::{Sample, Timestamp};
use crate::error::{Result, SeriesError};
use std::fmt;
use std::str::FromStr;

/// Aggregation function of a compaction rule or an aggregated range query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Aggregation {
    /// Arithmetic mean.
    Avg = 0,
    /// Sum of values.
    Sum = 1,
    /// Smallest value.
    Min = 2,
    /// Largest value.
    Max = 3,
    /// `max - min`.
    Range = 4,
    /// Number of samples.
    Count = 5,
    /// Earliest value in the bucket.
    First = 6,
    /// Latest value in the bucket.
    Last = 7,
    /// Population standard deviation.
    StdP = 8,
    /// Sample standard deviation.
    StdS = 9,
    /// Population variance.
    VarP = 10,
    /// Sample variance.
    VarS = 11,
}

impl Aggregation {
    /// Every supported kind, in wire-tag order.
    pub const ALL: [Aggregation; 12] = [
        Self::Avg,
        Self::Sum,
        Self::Min,
        Self::Max,
        Self::Range,
        Self::Count,
        Self::First,
        Self::Last,
        Self::StdP,
        Self::StdS,
        Self::VarP,
        Self::VarS,
    ];

    /// Creates an Aggregation from its u8 wire tag.
    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }

    /// Upper-case name as reported by series info.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Avg => "AVG",
            Self::Sum => "SUM",
            Self::Min => "MIN",
            Self::Max => "MAX",
            Self::Range => "RANGE",
            Self::Count => "COUNT",
            Self::First => "FIRST",
            Self::Last => "LAST",
            Self::StdP => "STD.P",
            Self::StdS => "STD.S",
            Self::VarP => "VAR.P",
            Self::VarS => "VAR.S",
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Aggregation {
    type Err = SeriesError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| SeriesError::InvalidArgument(format!("unknown aggregation: {s}")))
    }
}

/// Returns `floor(timestamp / bucket_ms) * bucket_ms`.
///
/// A bucket whose start would fall below `Timestamp::MIN` starts at
/// `Timestamp::MIN` instead.
pub fn bucket_start(timestamp: Timestamp, bucket_ms: i64) -> Timestamp {
    timestamp.saturating_sub(timestamp.rem_euclid(bucket_ms))
}

/// Running state of one open bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct Accumulator {
    pub(crate) bucket_start: Option<Timestamp>,
    pub(crate) count: u64,
    pub(crate) sum: f64,
    pub(crate) min: f64,
    pub(crate) max: f64,
    pub(crate) first: f64,
    pub(crate) first_ts: Timestamp,
    pub(crate) last: f64,
    pub(crate) last_ts: Timestamp,
    pub(crate) mean: f64,
    pub(crate) m2: f64,
}

impl Default for Accumulator {
    fn default() -> Self {
        Self {
            bucket_start: None,
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            first: 0.0,
            first_ts: 0,
            last: 0.0,
            last_ts: 0,
            mean: 0.0,
            m2: 0.0,
        }
    }
}

impl Accumulator {
    /// Creates an accumulator with no open bucket.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start of the open bucket, if any.
    pub fn bucket_start(&self) -> Option<Timestamp> {
        self.bucket_start
    }

    /// Number of observations in the open bucket.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Returns true if no observation has been recorded since the last reset.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Records one observation in the open bucket.
    ///
    /// Observations may arrive out of order; FIRST and LAST follow the
    /// earliest and latest timestamps seen, not arrival order.
    pub fn update(&mut self, timestamp: Timestamp, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        if self.count == 1 || timestamp < self.first_ts {
            self.first = value;
            self.first_ts = timestamp;
        }
        if self.count == 1 || timestamp >= self.last_ts {
            self.last = value;
            self.last_ts = timestamp;
        }

        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    /// Computes the aggregate of the open bucket without changing state.
    ///
    /// Returns `None` when nothing has been observed. Sample variants
    /// (`STD.S`, `VAR.S`) yield `0.0` for a single observation.
    pub fn finalize(&self, kind: Aggregation) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        let n = self.count as f64;
        let sample_variance = || {
            if self.count < 2 {
                0.0
            } else {
                self.m2 / (n - 1.0)
            }
        };
        Some(match kind {
            Aggregation::Avg => self.sum / n,
            Aggregation::Sum => self.sum,
            Aggregation::Min => self.min,
            Aggregation::Max => self.max,
            Aggregation::Range => self.max - self.min,
            Aggregation::Count => n,
            Aggregation::First => self.first,
            Aggregation::Last => self.last,
            Aggregation::StdP => (self.m2 / n).sqrt(),
            Aggregation::StdS => sample_variance().sqrt(),
            Aggregation::VarP => self.m2 / n,
            Aggregation::VarS => sample_variance(),
        })
    }

    /// Clears all running state and opens `bucket_start`.
    pub fn reset(&mut self, bucket_start: Timestamp) {
        *self = Self {
            bucket_start: Some(bucket_start),
            ..Self::default()
        };
    }
}

/// Aggregates an ascending sample stream into fixed buckets.
///
/// Each emitted sample is stamped with its bucket start. Empty input yields
/// an empty result for every kind.
pub fn aggregate_buckets<I>(samples: I, kind: Aggregation, bucket_ms: i64) -> Result<Vec<Sample>>
where
    I: IntoIterator<Item = Sample>,
{
    if bucket_ms <= 0 {
        return Err(SeriesError::InvalidBucket(bucket_ms));
    }

    let mut result = Vec::new();
    let mut acc = Accumulator::new();

    for sample in samples {
        let bucket = bucket_start(sample.timestamp, bucket_ms);
        match acc.bucket_start() {
            Some(open) if open == bucket => {}
            Some(open) => {
                if let Some(value) = acc.finalize(kind) {
                    result.push(Sample::new(open, value));
                }
                acc.reset(bucket);
            }
            None => acc.reset(bucket),
        }
        acc.update(sample.timestamp, sample.value);
    }

    if let (Some(open), Some(value)) = (acc.bucket_start(), acc.finalize(kind)) {
        result.push(Sample::new(open, value));
    }

    Ok(result)
}
