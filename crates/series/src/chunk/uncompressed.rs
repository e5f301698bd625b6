//! Fixed-width sample chunk.

use super::{Sample, Timestamp};

/// Bytes one sample occupies in an uncompressed chunk.
pub const SAMPLE_SIZE: usize = 16;

/// A chunk storing samples as a plain sorted vector.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UncompressedChunk {
    samples: Vec<Sample>,
}

impl UncompressedChunk {
    /// Creates an empty chunk sized for `budget` bytes.
    pub fn with_budget(budget: usize) -> Self {
        Self {
            samples: Vec::with_capacity(budget / SAMPLE_SIZE),
        }
    }

    /// Wraps an ascending run of samples.
    pub fn from_samples(samples: Vec<Sample>) -> Self {
        Self { samples }
    }

    /// Appends a sample newer than every stored one.
    pub fn push(&mut self, sample: Sample) {
        self.samples.push(sample);
    }

    /// Stored samples in ascending order.
    pub fn as_slice(&self) -> &[Sample] {
        &self.samples
    }

    /// Mutable access for in-place upserts; callers keep the order intact.
    pub(crate) fn samples_mut(&mut self) -> &mut Vec<Sample> {
        &mut self.samples
    }

    /// Number of stored samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns true if the chunk holds no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// First stored timestamp.
    pub fn first_timestamp(&self) -> Option<Timestamp> {
        self.samples.first().map(|s| s.timestamp)
    }

    /// Last stored timestamp.
    pub fn last_timestamp(&self) -> Option<Timestamp> {
        self.samples.last().map(|s| s.timestamp)
    }

    /// Payload size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.samples.len() * SAMPLE_SIZE
    }
}
