//! Series and database configuration.

use crate::error::{Result, SeriesError};
use std::fmt;
use std::str::FromStr;

/// Default retention window: unbounded.
pub const DEFAULT_RETENTION_MS: u64 = 0;

/// Default chunk byte budget (4 KB).
pub const DEFAULT_CHUNK_SIZE_BYTES: usize = 4096;

/// Largest accepted chunk byte budget (1 MB).
pub const MAX_CHUNK_SIZE_BYTES: usize = 1024 * 1024;

/// On-heap encoding of a series' chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ChunkEncoding {
    /// Fixed-width 16 bytes per sample.
    Uncompressed = 0,
    /// Gorilla delta-of-delta timestamps and XOR values.
    #[default]
    Compressed = 1,
}

impl ChunkEncoding {
    /// Creates a ChunkEncoding from a u8 value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Uncompressed),
            1 => Some(Self::Compressed),
            _ => None,
        }
    }
}

impl fmt::Display for ChunkEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uncompressed => f.write_str("uncompressed"),
            Self::Compressed => f.write_str("compressed"),
        }
    }
}

/// How an append resolves a sample whose timestamp is already stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum DuplicatePolicy {
    /// Reject the new sample.
    #[default]
    Block = 0,
    /// Keep the stored value.
    First = 1,
    /// Overwrite with the new value.
    Last = 2,
    /// Keep the smaller value.
    Min = 3,
    /// Keep the larger value.
    Max = 4,
    /// Store the sum of both values.
    Sum = 5,
}

impl DuplicatePolicy {
    /// Creates a DuplicatePolicy from a u8 value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Block),
            1 => Some(Self::First),
            2 => Some(Self::Last),
            3 => Some(Self::Min),
            4 => Some(Self::Max),
            5 => Some(Self::Sum),
            _ => None,
        }
    }

    /// Merges `incoming` into `stored`.
    ///
    /// Returns `None` when the policy rejects duplicates.
    pub fn resolve(self, stored: f64, incoming: f64) -> Option<f64> {
        match self {
            Self::Block => None,
            Self::First => Some(stored),
            Self::Last => Some(incoming),
            Self::Min => Some(stored.min(incoming)),
            Self::Max => Some(stored.max(incoming)),
            Self::Sum => Some(stored + incoming),
        }
    }
}

impl FromStr for DuplicatePolicy {
    type Err = SeriesError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "block" => Ok(Self::Block),
            "first" => Ok(Self::First),
            "last" => Ok(Self::Last),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            "sum" => Ok(Self::Sum),
            other => Err(SeriesError::InvalidArgument(format!(
                "unknown duplicate policy: {other}"
            ))),
        }
    }
}

/// Per-series options supplied on create.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesOptions {
    /// Maximum age of retained samples in milliseconds (0 = unbounded).
    pub retention_ms: u64,
    /// Byte budget of a single chunk.
    pub chunk_size_bytes: usize,
    /// Chunk encoding.
    pub encoding: ChunkEncoding,
    /// Duplicate timestamp handling.
    pub duplicate_policy: DuplicatePolicy,
    /// Opaque key/value metadata.
    pub labels: Vec<(String, String)>,
}

impl Default for SeriesOptions {
    fn default() -> Self {
        Self {
            retention_ms: DEFAULT_RETENTION_MS,
            chunk_size_bytes: DEFAULT_CHUNK_SIZE_BYTES,
            encoding: ChunkEncoding::default(),
            duplicate_policy: DuplicatePolicy::default(),
            labels: Vec::new(),
        }
    }
}

impl SeriesOptions {
    /// Sets the retention window.
    pub fn with_retention_ms(mut self, retention_ms: u64) -> Self {
        self.retention_ms = retention_ms;
        self
    }

    /// Sets the chunk byte budget.
    pub fn with_chunk_size(mut self, chunk_size_bytes: usize) -> Self {
        self.chunk_size_bytes = chunk_size_bytes;
        self
    }

    /// Sets the chunk encoding.
    pub fn with_encoding(mut self, encoding: ChunkEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Shorthand for [`ChunkEncoding::Uncompressed`].
    pub fn uncompressed(self) -> Self {
        self.with_encoding(ChunkEncoding::Uncompressed)
    }

    /// Sets the duplicate policy.
    pub fn with_duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.duplicate_policy = policy;
        self
    }

    /// Adds a label.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.push((key.into(), value.into()));
        self
    }

    /// Checks the options for values the store cannot honour.
    ///
    /// # Errors
    ///
    /// Returns `SeriesError::InvalidArgument` for a chunk size that is zero,
    /// not a multiple of 8, or larger than [`MAX_CHUNK_SIZE_BYTES`].
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size_bytes == 0
            || self.chunk_size_bytes % 8 != 0
            || self.chunk_size_bytes > MAX_CHUNK_SIZE_BYTES
        {
            return Err(SeriesError::InvalidArgument(format!(
                "chunk size must be a positive multiple of 8 up to {MAX_CHUNK_SIZE_BYTES}, got {}",
                self.chunk_size_bytes
            )));
        }
        Ok(())
    }
}

impl From<&DbConfig> for SeriesOptions {
    fn from(config: &DbConfig) -> Self {
        Self {
            retention_ms: config.default_retention_ms,
            chunk_size_bytes: config.default_chunk_size_bytes,
            encoding: config.default_encoding,
            duplicate_policy: config.default_duplicate_policy,
            labels: Vec::new(),
        }
    }
}

/// Database-wide defaults applied to series created without explicit options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbConfig {
    /// Retention for new series.
    pub default_retention_ms: u64,
    /// Chunk byte budget for new series.
    pub default_chunk_size_bytes: usize,
    /// Chunk encoding for new series.
    pub default_encoding: ChunkEncoding,
    /// Duplicate policy for new series.
    pub default_duplicate_policy: DuplicatePolicy,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            default_retention_ms: DEFAULT_RETENTION_MS,
            default_chunk_size_bytes: DEFAULT_CHUNK_SIZE_BYTES,
            default_encoding: ChunkEncoding::default(),
            default_duplicate_policy: DuplicatePolicy::default(),
        }
    }
}

impl DbConfig {
    /// Sets the default retention window.
    pub fn with_retention_ms(mut self, retention_ms: u64) -> Self {
        self.default_retention_ms = retention_ms;
        self
    }

    /// Sets the default chunk byte budget.
    pub fn with_chunk_size(mut self, chunk_size_bytes: usize) -> Self {
        self.default_chunk_size_bytes = chunk_size_bytes;
        self
    }

    /// Sets the default chunk encoding.
    pub fn with_encoding(mut self, encoding: ChunkEncoding) -> Self {
        self.default_encoding = encoding;
        self
    }

    /// Sets the default duplicate policy.
    pub fn with_duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.default_duplicate_policy = policy;
        self
    }
}
