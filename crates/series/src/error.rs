//! Error and Result types for series storage, compaction and persistence.

use crate::chunk::Timestamp;
use std::io;
use thiserror::Error;

/// A convenience `Result` type for series operations.
pub type Result<T> = std::result::Result<T, SeriesError>;

/// The error type for series operations.
#[derive(Debug, Error)]
pub enum SeriesError {
    /// Append violates the series' ordering policy.
    #[error("Out of order: timestamp {timestamp} is older than the series allows (last {last})")]
    OutOfOrder {
        /// Timestamp of the rejected sample.
        timestamp: Timestamp,
        /// Timestamp of the newest sample in the series.
        last: Timestamp,
    },

    /// A sample already exists at this timestamp and the duplicate policy is BLOCK.
    #[error("Duplicate sample at timestamp {timestamp}")]
    DuplicateSample {
        /// Timestamp of the rejected sample.
        timestamp: Timestamp,
    },

    /// The destination already has an incoming compaction rule.
    #[error("Duplicate rule: destination {0} already has a source")]
    DuplicateRule(String),

    /// No rule from the source to the given destination.
    #[error("Rule not found: {source_key} -> {destination}")]
    RuleNotFound {
        /// Source series name.
        source_key: String,
        /// Destination series name.
        destination: String,
    },

    /// Bucket duration must be strictly positive.
    #[error("Invalid bucket duration: {0}")]
    InvalidBucket(i64),

    /// Creating the rule would make the rule graph cyclic.
    #[error("Cyclic rule: {source_key} -> {destination} would close a cycle")]
    CyclicRule {
        /// Source series name.
        source_key: String,
        /// Destination series name.
        destination: String,
    },

    /// A compaction input is older than a rule's open bucket.
    #[error("Stale compaction input: timestamp {timestamp} precedes open bucket {bucket_start} of rule -> {destination}")]
    StaleCompactionInput {
        /// Timestamp of the rejected sample.
        timestamp: Timestamp,
        /// Start of the currently open bucket.
        bucket_start: Timestamp,
        /// Destination of the rule that rejected the sample.
        destination: String,
    },

    /// A rule destination could not be resolved when a bucket had to be flushed.
    #[error("Destination missing: {0}")]
    DestinationMissing(String),

    /// Requested series does not exist.
    #[error("Series not found: {0}")]
    SeriesNotFound(String),

    /// A series with this name already exists.
    #[error("Series already exists: {0}")]
    SeriesExists(String),

    /// Invalid argument supplied by the command layer.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Persisted buffer has a format version this build cannot read.
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u16),

    /// Invalid magic bytes at the start of a persisted buffer.
    #[error("Invalid magic bytes: expected ATSS, got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Persisted buffer checksum does not match its content.
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// CRC32 stored in the buffer.
        expected: u32,
        /// CRC32 computed over the buffer.
        actual: u32,
    },

    /// Malformed persisted bytes (truncation, unknown tag, bad length).
    #[error("Corrupt encoding: {0}")]
    CorruptEncoding(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SeriesError {
    /// Returns true if the error describes malformed persisted bytes.
    pub fn is_corrupt(&self) -> bool {
        matches!(
            self,
            Self::CorruptEncoding(_) | Self::ChecksumMismatch { .. } | Self::InvalidMagic(_)
        )
    }
}
