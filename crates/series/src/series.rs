//! Series store: one named series, its chunks, retention and outgoing rules.

use crate::aggregation::{aggregate_buckets, Aggregation};
use crate::chunk::{Chunk, ChunkIter, Sample, Timestamp, UpsertOutcome};
use crate::config::{ChunkEncoding, DuplicatePolicy, SeriesOptions};
use crate::error::{Result, SeriesError};
use crate::rule::CompactionRule;
use std::mem;
use tracing::debug;

/// Result of a successful append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    /// How the sample was stored.
    pub stored: UpsertOutcome,
    /// True if the append created a chunk (rollover or split).
    pub new_chunk: bool,
    /// Chunks dropped by the retention pass that followed the append.
    pub trimmed_chunks: usize,
}

impl AppendOutcome {
    /// Returns true if a sample was added rather than merged into an existing one.
    pub fn is_new_sample(&self) -> bool {
        self.stored == UpsertOutcome::Inserted
    }
}

/// Where an incoming timestamp lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Placement {
    /// Newer than every stored sample.
    Append,
    /// Matches a stored sample in chunk `idx`.
    Existing(usize),
    /// Older than the newest sample; goes into chunk `idx`.
    Insert(usize),
}

impl Placement {
    pub(crate) fn is_new(self) -> bool {
        !matches!(self, Self::Existing(_))
    }
}

/// Rule summary reported by [`Series::info`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleInfo {
    /// Destination series.
    pub dest_key: String,
    /// Bucket width in milliseconds.
    pub bucket_duration_ms: i64,
    /// Aggregation kind.
    pub aggregation: Aggregation,
}

/// Snapshot of a series' metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesInfo {
    /// Number of stored samples.
    pub total_samples: u64,
    /// Approximate heap footprint in bytes.
    pub memory_usage: usize,
    /// Oldest stored timestamp.
    pub first_timestamp: Option<Timestamp>,
    /// Newest stored timestamp.
    pub last_timestamp: Option<Timestamp>,
    /// Retention window in milliseconds.
    pub retention_ms: u64,
    /// Number of chunks.
    pub chunk_count: usize,
    /// Chunk byte budget.
    pub chunk_size_bytes: usize,
    /// Chunk encoding.
    pub encoding: ChunkEncoding,
    /// Duplicate policy.
    pub duplicate_policy: DuplicatePolicy,
    /// Labels.
    pub labels: Vec<(String, String)>,
    /// Source series if this series is a rule destination.
    pub source_key: Option<String>,
    /// Outgoing rules in creation order.
    pub rules: Vec<RuleInfo>,
}

/// A single time series.
#[derive(Debug, Clone)]
pub struct Series {
    name: String,
    options: SeriesOptions,
    chunks: Vec<Chunk>,
    total_samples: u64,
    last_sample: Option<Sample>,
    source_key: Option<String>,
    rules: Vec<CompactionRule>,
}

impl Series {
    /// Creates an empty series.
    ///
    /// # Errors
    ///
    /// Returns `SeriesError::InvalidArgument` if the options fail validation.
    pub fn new(name: impl Into<String>, options: SeriesOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            name: name.into(),
            options,
            chunks: Vec::new(),
            total_samples: 0,
            last_sample: None,
            source_key: None,
            rules: Vec::new(),
        })
    }

    /// Reassembles a series from decoded parts. Chunks must be non-empty and
    /// ascending across the whole sequence.
    pub(crate) fn from_parts(
        name: String,
        options: SeriesOptions,
        chunks: Vec<Chunk>,
        source_key: Option<String>,
        rules: Vec<CompactionRule>,
    ) -> Self {
        let total_samples = chunks.iter().map(|c| c.len() as u64).sum();
        let last_sample = chunks.last().and_then(|c| c.iter().last());
        Self {
            name,
            options,
            chunks,
            total_samples,
            last_sample,
            source_key,
            rules,
        }
    }

    /// Series name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Renames the series (used when restoring under a new key).
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Creation options.
    pub fn options(&self) -> &SeriesOptions {
        &self.options
    }

    /// Labels.
    pub fn labels(&self) -> &[(String, String)] {
        &self.options.labels
    }

    /// Source series, set iff this series is the destination of a rule.
    pub fn source_key(&self) -> Option<&str> {
        self.source_key.as_deref()
    }

    /// Sets or clears the source series.
    pub fn set_source_key(&mut self, source_key: Option<String>) {
        self.source_key = source_key;
    }

    /// Outgoing rules in creation order.
    pub fn rules(&self) -> &[CompactionRule] {
        &self.rules
    }

    pub(crate) fn rules_mut(&mut self) -> &mut [CompactionRule] {
        &mut self.rules
    }

    /// Stored chunks, oldest first.
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Oldest stored timestamp.
    pub fn first_timestamp(&self) -> Option<Timestamp> {
        self.chunks.first().and_then(Chunk::first_timestamp)
    }

    /// Newest stored sample.
    pub fn last_sample(&self) -> Option<Sample> {
        self.last_sample
    }

    /// Number of stored samples.
    pub fn total_samples(&self) -> u64 {
        self.total_samples
    }

    /// Number of chunks.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Approximate heap footprint in bytes.
    pub fn memory_usage(&self) -> usize {
        let labels: usize = self
            .options
            .labels
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum();
        let chunks: usize = self
            .chunks
            .iter()
            .map(|c| mem::size_of::<Chunk>() + c.size_bytes())
            .sum();
        let rules: usize = self
            .rules
            .iter()
            .map(|r| mem::size_of::<CompactionRule>() + r.dest_key().len())
            .sum();
        mem::size_of::<Self>()
            + self.name.len()
            + self.source_key.as_ref().map_or(0, String::len)
            + labels
            + chunks
            + rules
    }

    /// Oldest timestamp still inside the retention window.
    fn retention_floor(&self) -> Option<Timestamp> {
        if self.options.retention_ms == 0 {
            return None;
        }
        let retention = i64::try_from(self.options.retention_ms).unwrap_or(i64::MAX);
        self.last_sample
            .map(|last| last.timestamp.saturating_sub(retention))
    }

    /// Decides where a sample at `timestamp` would be stored.
    ///
    /// # Errors
    ///
    /// Returns `SeriesError::OutOfOrder` if the timestamp is older than the
    /// retention window or older than the first retained sample.
    pub(crate) fn placement(&self, timestamp: Timestamp) -> Result<Placement> {
        let Some(last) = self.last_sample else {
            return Ok(Placement::Append);
        };
        if timestamp > last.timestamp {
            return Ok(Placement::Append);
        }

        let out_of_order = SeriesError::OutOfOrder {
            timestamp,
            last: last.timestamp,
        };
        let idx = self
            .chunks
            .partition_point(|c| c.first_timestamp().is_some_and(|first| first <= timestamp));
        if idx == 0 {
            return Err(out_of_order);
        }
        if self.retention_floor().is_some_and(|floor| timestamp < floor) {
            return Err(out_of_order);
        }
        let idx = idx - 1;

        let exists = self.chunks[idx]
            .iter()
            .take_while(|s| s.timestamp <= timestamp)
            .any(|s| s.timestamp == timestamp);
        if exists {
            return Ok(Placement::Existing(idx));
        }
        Ok(Placement::Insert(idx))
    }

    /// Decides where `sample` would be stored under `policy` without storing it.
    ///
    /// # Errors
    ///
    /// Returns the error [`Series::append_with_policy`] would return.
    pub(crate) fn check_append(
        &self,
        sample: Sample,
        policy: DuplicatePolicy,
    ) -> Result<Placement> {
        let placement = self.placement(sample.timestamp)?;
        if matches!(placement, Placement::Existing(_)) && policy == DuplicatePolicy::Block {
            return Err(SeriesError::DuplicateSample {
                timestamp: sample.timestamp,
            });
        }
        Ok(placement)
    }

    /// Stores a sample under the series' duplicate policy.
    ///
    /// Rules are not consulted; compaction goes through the engine.
    ///
    /// # Errors
    ///
    /// Returns `SeriesError::OutOfOrder` for inserts the policy forbids and
    /// `SeriesError::DuplicateSample` for a duplicate under BLOCK.
    pub fn append(&mut self, sample: Sample) -> Result<AppendOutcome> {
        self.append_with_policy(sample, self.options.duplicate_policy)
    }

    pub(crate) fn append_with_policy(
        &mut self,
        sample: Sample,
        policy: DuplicatePolicy,
    ) -> Result<AppendOutcome> {
        let placement = self.placement(sample.timestamp)?;
        let budget = self.options.chunk_size_bytes;
        let mut new_chunk = false;

        let stored = match placement {
            Placement::Append => {
                match self.chunks.last_mut() {
                    Some(active) if !active.is_full(budget) => active.push(sample),
                    _ => {
                        let mut chunk = Chunk::new(self.options.encoding, budget);
                        chunk.push(sample);
                        self.chunks.push(chunk);
                        new_chunk = true;
                        debug!(
                            "Series {} opened chunk {} at {}",
                            self.name,
                            self.chunks.len(),
                            sample.timestamp
                        );
                    }
                }
                self.last_sample = Some(sample);
                UpsertOutcome::Inserted
            }
            Placement::Existing(idx) | Placement::Insert(idx) => {
                let outcome = self.chunks[idx].upsert(sample, policy)?;
                if self.chunks[idx].size_bytes() > budget && self.chunks[idx].len() > 1 {
                    let tail = self.chunks[idx].split_off_half();
                    self.chunks.insert(idx + 1, tail);
                    new_chunk = true;
                    debug!("Series {} split chunk {} on insert", self.name, idx);
                }
                if outcome == UpsertOutcome::Updated
                    && self.last_sample.is_some_and(|l| l.timestamp == sample.timestamp)
                {
                    self.last_sample = self.chunks.last().and_then(|c| c.iter().last());
                }
                outcome
            }
        };

        let trimmed_chunks = if stored == UpsertOutcome::Inserted {
            self.total_samples += 1;
            self.trim()
        } else {
            0
        };

        Ok(AppendOutcome {
            stored,
            new_chunk,
            trimmed_chunks,
        })
    }

    /// Drops chunks that end before `latest - retention`.
    ///
    /// The chunk holding the newest sample is always kept. Returns the number
    /// of chunks removed.
    pub fn trim(&mut self) -> usize {
        let Some(floor) = self.retention_floor() else {
            return 0;
        };
        let expired = self
            .chunks
            .partition_point(|c| c.last_timestamp().is_some_and(|last| last < floor));
        let expired = expired.min(self.chunks.len().saturating_sub(1));
        if expired == 0 {
            return 0;
        }

        let removed: usize = self.chunks.drain(..expired).map(|c| c.len()).sum();
        self.total_samples -= removed as u64;
        debug!(
            "Series {} trimmed {} chunks ({} samples) older than {}",
            self.name, expired, removed, floor
        );
        expired
    }

    /// Returns the samples in `[from, to]` in ascending order.
    ///
    /// Samples older than the retention window are never returned. `limit`
    /// keeps only the first `limit` samples.
    pub fn range(&self, from: Timestamp, to: Timestamp, limit: Option<usize>) -> RangeIter<'_> {
        let from = self.retention_floor().map_or(from, |floor| from.max(floor));
        let start = self
            .chunks
            .partition_point(|c| c.last_timestamp().is_some_and(|last| last < from));
        RangeIter {
            chunks: self.chunks[start..].iter(),
            current: None,
            from,
            to,
            remaining: limit,
        }
    }

    /// Aggregates `[from, to]` into buckets of `bucket_ms`.
    ///
    /// # Errors
    ///
    /// Returns `SeriesError::InvalidBucket` if `bucket_ms <= 0`.
    pub fn range_aggregated(
        &self,
        from: Timestamp,
        to: Timestamp,
        aggregation: Aggregation,
        bucket_ms: i64,
        limit: Option<usize>,
    ) -> Result<Vec<Sample>> {
        let mut buckets = aggregate_buckets(self.range(from, to, None), aggregation, bucket_ms)?;
        if let Some(limit) = limit {
            buckets.truncate(limit);
        }
        Ok(buckets)
    }

    /// Adds an outgoing rule.
    ///
    /// # Errors
    ///
    /// Returns `SeriesError::DuplicateRule` if a rule to `dest_key` exists and
    /// `SeriesError::InvalidBucket` if `bucket_duration_ms <= 0`.
    pub fn add_rule(
        &mut self,
        dest_key: impl Into<String>,
        aggregation: Aggregation,
        bucket_duration_ms: i64,
    ) -> Result<()> {
        let rule = CompactionRule::new(dest_key, aggregation, bucket_duration_ms)?;
        if self.rules.iter().any(|r| r.dest_key() == rule.dest_key()) {
            return Err(SeriesError::DuplicateRule(rule.dest_key().to_string()));
        }
        debug!(
            "Series {} added rule -> {} ({}, {}ms)",
            self.name,
            rule.dest_key(),
            aggregation,
            bucket_duration_ms
        );
        self.rules.push(rule);
        Ok(())
    }

    /// Removes the outgoing rule to `dest_key`.
    ///
    /// # Errors
    ///
    /// Returns `SeriesError::RuleNotFound` if there is no such rule.
    pub fn remove_rule(&mut self, dest_key: &str) -> Result<CompactionRule> {
        let idx = self
            .rules
            .iter()
            .position(|r| r.dest_key() == dest_key)
            .ok_or_else(|| SeriesError::RuleNotFound {
                source_key: self.name.clone(),
                destination: dest_key.to_string(),
            })?;
        debug!("Series {} removed rule -> {}", self.name, dest_key);
        Ok(self.rules.remove(idx))
    }

    /// Returns a metadata snapshot.
    pub fn info(&self) -> SeriesInfo {
        SeriesInfo {
            total_samples: self.total_samples,
            memory_usage: self.memory_usage(),
            first_timestamp: self.first_timestamp(),
            last_timestamp: self.last_sample.map(|s| s.timestamp),
            retention_ms: self.options.retention_ms,
            chunk_count: self.chunks.len(),
            chunk_size_bytes: self.options.chunk_size_bytes,
            encoding: self.options.encoding,
            duplicate_policy: self.options.duplicate_policy,
            labels: self.options.labels.clone(),
            source_key: self.source_key.clone(),
            rules: self
                .rules
                .iter()
                .map(|r| RuleInfo {
                    dest_key: r.dest_key().to_string(),
                    bucket_duration_ms: r.bucket_duration_ms(),
                    aggregation: r.aggregation(),
                })
                .collect(),
        }
    }
}

/// Lazy ascending scan over a time range of a [`Series`].
///
/// Cloning the iterator restarts nothing; clone before consuming to scan the
/// same range twice.
#[derive(Debug, Clone)]
pub struct RangeIter<'a> {
    chunks: std::slice::Iter<'a, Chunk>,
    current: Option<ChunkIter<'a>>,
    from: Timestamp,
    to: Timestamp,
    remaining: Option<usize>,
}

impl RangeIter<'_> {
    fn finish(&mut self) {
        self.remaining = Some(0);
    }
}

impl Iterator for RangeIter<'_> {
    type Item = Sample;

    fn next(&mut self) -> Option<Sample> {
        if self.remaining == Some(0) {
            return None;
        }
        loop {
            if let Some(sample) = self.current.as_mut().and_then(Iterator::next) {
                if sample.timestamp < self.from {
                    continue;
                }
                if sample.timestamp > self.to {
                    self.finish();
                    return None;
                }
                if let Some(remaining) = self.remaining.as_mut() {
                    *remaining -= 1;
                }
                return Some(sample);
            }

            let chunk = self.chunks.next()?;
            if chunk.first_timestamp().is_some_and(|first| first > self.to) {
                self.finish();
                return None;
            }
            self.current = Some(chunk.iter());
        }
    }
}
