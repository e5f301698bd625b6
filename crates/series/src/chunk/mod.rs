//! Sample chunks: bounded, ordered runs of samples owned by a series.
//!
//! A [`Chunk`] is either [`UncompressedChunk`] (16 bytes per sample) or
//! [`GorillaChunk`] (delta-of-delta timestamps, XOR values). Both keep their
//! samples strictly ascending by timestamp and never reorder them.

pub mod gorilla;
pub mod uncompressed;

pub use gorilla::{GorillaChunk, GorillaIter};
pub use uncompressed::{UncompressedChunk, SAMPLE_SIZE};

use crate::config::{ChunkEncoding, DuplicatePolicy};
use crate::error::{Result, SeriesError};

/// Millisecond timestamp.
pub type Timestamp = i64;

/// A single `(timestamp, value)` observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Timestamp in milliseconds.
    pub timestamp: Timestamp,
    /// Observed value.
    pub value: f64,
}

impl Sample {
    /// Creates a new sample.
    pub fn new(timestamp: Timestamp, value: f64) -> Self {
        Self { timestamp, value }
    }
}

impl From<(Timestamp, f64)> for Sample {
    fn from((timestamp, value): (Timestamp, f64)) -> Self {
        Self { timestamp, value }
    }
}

/// What an upsert did to the chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// A new sample was stored.
    Inserted,
    /// An existing sample was changed by the duplicate policy.
    Updated,
    /// An existing sample was left as is by the duplicate policy.
    Kept,
}

/// Inserts or merges `sample` into an ascending vector.
fn upsert_sorted(
    samples: &mut Vec<Sample>,
    sample: Sample,
    policy: DuplicatePolicy,
) -> Result<UpsertOutcome> {
    match samples.binary_search_by_key(&sample.timestamp, |s| s.timestamp) {
        Ok(idx) => {
            let stored = samples[idx].value;
            let merged = policy
                .resolve(stored, sample.value)
                .ok_or(SeriesError::DuplicateSample {
                    timestamp: sample.timestamp,
                })?;
            if merged.to_bits() == stored.to_bits() {
                Ok(UpsertOutcome::Kept)
            } else {
                samples[idx].value = merged;
                Ok(UpsertOutcome::Updated)
            }
        }
        Err(idx) => {
            samples.insert(idx, sample);
            Ok(UpsertOutcome::Inserted)
        }
    }
}

/// A bounded, ordered container of samples.
#[derive(Debug, Clone)]
pub enum Chunk {
    /// Fixed-width samples.
    Uncompressed(UncompressedChunk),
    /// Gorilla-compressed samples.
    Compressed(GorillaChunk),
}

impl Chunk {
    /// Creates an empty chunk of the given encoding.
    pub fn new(encoding: ChunkEncoding, budget: usize) -> Self {
        match encoding {
            ChunkEncoding::Uncompressed => Self::Uncompressed(UncompressedChunk::with_budget(budget)),
            ChunkEncoding::Compressed => Self::Compressed(GorillaChunk::new()),
        }
    }

    /// Builds a chunk from an ascending run of samples.
    pub fn from_samples(encoding: ChunkEncoding, samples: Vec<Sample>) -> Self {
        match encoding {
            ChunkEncoding::Uncompressed => Self::Uncompressed(UncompressedChunk::from_samples(samples)),
            ChunkEncoding::Compressed => Self::Compressed(GorillaChunk::from_samples(&samples)),
        }
    }

    /// Encoding of this chunk.
    pub fn encoding(&self) -> ChunkEncoding {
        match self {
            Self::Uncompressed(_) => ChunkEncoding::Uncompressed,
            Self::Compressed(_) => ChunkEncoding::Compressed,
        }
    }

    /// Appends a sample strictly newer than [`Chunk::last_timestamp`].
    pub fn push(&mut self, sample: Sample) {
        match self {
            Self::Uncompressed(c) => c.push(sample),
            Self::Compressed(c) => c.push(sample),
        }
    }

    /// Inserts `sample` at its ordered position or merges it with the stored
    /// sample of the same timestamp.
    ///
    /// # Errors
    ///
    /// Returns `SeriesError::DuplicateSample` when the timestamp exists and
    /// the policy is [`DuplicatePolicy::Block`].
    pub fn upsert(&mut self, sample: Sample, policy: DuplicatePolicy) -> Result<UpsertOutcome> {
        match self {
            Self::Uncompressed(c) => upsert_sorted(c.samples_mut(), sample, policy),
            Self::Compressed(c) => {
                let mut samples: Vec<Sample> = c.iter().collect();
                let outcome = upsert_sorted(&mut samples, sample, policy)?;
                if outcome != UpsertOutcome::Kept {
                    *c = GorillaChunk::from_samples(&samples);
                }
                Ok(outcome)
            }
        }
    }

    /// Moves the newer half of the samples into a new chunk and returns it.
    pub fn split_off_half(&mut self) -> Chunk {
        match self {
            Self::Uncompressed(c) => {
                let mid = c.len() / 2;
                let tail = c.samples_mut().split_off(mid);
                Self::Uncompressed(UncompressedChunk::from_samples(tail))
            }
            Self::Compressed(c) => {
                let mut head: Vec<Sample> = c.iter().collect();
                let tail = head.split_off(head.len() / 2);
                *c = GorillaChunk::from_samples(&head);
                Self::Compressed(GorillaChunk::from_samples(&tail))
            }
        }
    }

    /// Iterates the samples in ascending order.
    pub fn iter(&self) -> ChunkIter<'_> {
        match self {
            Self::Uncompressed(c) => ChunkIter::Uncompressed(c.as_slice().iter()),
            Self::Compressed(c) => ChunkIter::Compressed(c.iter()),
        }
    }

    /// Number of stored samples.
    pub fn len(&self) -> usize {
        match self {
            Self::Uncompressed(c) => c.len(),
            Self::Compressed(c) => c.len(),
        }
    }

    /// Returns true if the chunk holds no samples.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// First stored timestamp.
    pub fn first_timestamp(&self) -> Option<Timestamp> {
        match self {
            Self::Uncompressed(c) => c.first_timestamp(),
            Self::Compressed(c) => c.first_timestamp(),
        }
    }

    /// Last stored timestamp.
    pub fn last_timestamp(&self) -> Option<Timestamp> {
        match self {
            Self::Uncompressed(c) => c.last_timestamp(),
            Self::Compressed(c) => c.last_timestamp(),
        }
    }

    /// Encoded payload size in bytes.
    pub fn size_bytes(&self) -> usize {
        match self {
            Self::Uncompressed(c) => c.size_bytes(),
            Self::Compressed(c) => c.size_bytes(),
        }
    }

    /// Returns true once the payload has reached `budget` bytes.
    pub fn is_full(&self, budget: usize) -> bool {
        self.size_bytes() >= budget
    }
}

/// Iterator over the samples of a [`Chunk`].
#[derive(Debug, Clone)]
pub enum ChunkIter<'a> {
    /// Iterator over an uncompressed chunk.
    Uncompressed(std::slice::Iter<'a, Sample>),
    /// Iterator over a compressed chunk.
    Compressed(GorillaIter<'a>),
}

impl Iterator for ChunkIter<'_> {
    type Item = Sample;

    fn next(&mut self) -> Option<Sample> {
        match self {
            Self::Uncompressed(it) => it.next().copied(),
            Self::Compressed(it) => it.next(),
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match self {
            Self::Uncompressed(it) => it.size_hint(),
            Self::Compressed(it) => it.size_hint(),
        }
    }
}
