//! Command facade over a keyspace of series.
//!
//! [`TimeSeriesDb`] receives parsed command arguments from a host layer and
//! wires the series store, the compaction engine and the codec together.

use crate::aggregation::Aggregation;
use crate::chunk::{Sample, Timestamp};
use crate::codec;
use crate::compaction::CompactionEngine;
use crate::config::{DbConfig, SeriesOptions};
use crate::error::{Result, SeriesError};
use crate::namespace::{read_series, write_series, Keyspace, Namespace, SeriesHandle};
use crate::series::{Series, SeriesInfo};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Parameters of a range query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeQuery {
    /// Inclusive lower bound.
    pub from: Timestamp,
    /// Inclusive upper bound.
    pub to: Timestamp,
    /// Maximum number of results, counted from the start.
    pub count: Option<usize>,
    /// Aggregation and bucket width applied to the range.
    pub aggregation: Option<(Aggregation, i64)>,
}

impl RangeQuery {
    /// Query over `[from, to]`.
    pub fn new(from: Timestamp, to: Timestamp) -> Self {
        Self {
            from,
            to,
            count: None,
            aggregation: None,
        }
    }

    /// Query over the whole series (`-` to `+`).
    pub fn all() -> Self {
        Self::new(Timestamp::MIN, Timestamp::MAX)
    }

    /// Keeps only the first `count` results.
    pub fn with_count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    /// Aggregates the range into buckets of `bucket_ms`.
    pub fn with_aggregation(mut self, aggregation: Aggregation, bucket_ms: i64) -> Self {
        self.aggregation = Some((aggregation, bucket_ms));
        self
    }
}

impl Default for RangeQuery {
    fn default() -> Self {
        Self::all()
    }
}

/// A keyspace of time series with compaction rules and dump/restore.
///
/// # Examples
/// ```rust,ignore
/// use alopex_series::{Aggregation, DbConfig, RangeQuery, TimeSeriesDb};
///
/// let db = TimeSeriesDb::new(DbConfig::default());
/// db.create_series("cpu", None)?;
/// db.create_series("cpu_avg", None)?;
/// db.create_rule("cpu", "cpu_avg", Aggregation::Avg, 60_000)?;
/// db.append("cpu", 1_000, 0.5)?;
/// let samples = db.range("cpu", RangeQuery::all())?;
/// ```
#[derive(Debug, Default)]
pub struct TimeSeriesDb {
    config: DbConfig,
    keyspace: Keyspace,
    /// Serializes changes to the rule graph (rules, deletes, restores).
    rule_graph: Mutex<()>,
}

impl TimeSeriesDb {
    /// Creates an empty database.
    pub fn new(config: DbConfig) -> Self {
        Self {
            config,
            keyspace: Keyspace::new(),
            rule_graph: Mutex::new(()),
        }
    }

    /// Database defaults.
    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    /// Underlying keyspace.
    pub fn keyspace(&self) -> &Keyspace {
        &self.keyspace
    }

    fn handle(&self, name: &str) -> Result<SeriesHandle> {
        self.keyspace
            .lookup(name)
            .ok_or_else(|| SeriesError::SeriesNotFound(name.to_string()))
    }

    /// Names of the series holding a rule into `name`, whether or not
    /// `name` exists. Takes one read lock at a time.
    fn sources_of(&self, name: &str) -> Vec<String> {
        self.keyspace
            .names()
            .into_iter()
            .filter(|source| {
                self.keyspace.lookup(source).is_some_and(|handle| {
                    read_series(&handle)
                        .rules()
                        .iter()
                        .any(|rule| rule.dest_key() == name)
                })
            })
            .collect()
    }

    /// Creates a series, filling unset options from the database defaults.
    ///
    /// A restored rule already pointing at `name` becomes its `sourceKey`.
    ///
    /// # Errors
    ///
    /// Returns `SeriesError::SeriesExists` if the name is taken and
    /// `SeriesError::InvalidArgument` for invalid options.
    pub fn create_series(&self, name: &str, options: Option<SeriesOptions>) -> Result<()> {
        let options = options.unwrap_or_else(|| SeriesOptions::from(&self.config));
        let mut series = Series::new(name, options)?;

        let _graph = self.rule_graph.lock().unwrap_or_else(|err| err.into_inner());
        series.set_source_key(self.sources_of(name).into_iter().next());
        self.keyspace.insert(series)?;
        debug!("Created series {}", name);
        Ok(())
    }

    /// Deletes a series and detaches it from the rule graph.
    ///
    /// Destinations of the series lose their `sourceKey`; the rule pointing
    /// at it from its source is removed.
    pub fn delete_series(&self, name: &str) -> Result<()> {
        let _graph = self.rule_graph.lock().unwrap_or_else(|err| err.into_inner());
        let handle = self
            .keyspace
            .remove(name)
            .ok_or_else(|| SeriesError::SeriesNotFound(name.to_string()))?;

        let (source, destinations): (Option<String>, Vec<String>) = {
            let series = read_series(&handle);
            (
                series.source_key().map(str::to_string),
                series
                    .rules()
                    .iter()
                    .map(|r| r.dest_key().to_string())
                    .collect(),
            )
        };

        for dest_key in &destinations {
            if let Some(dest) = self.keyspace.lookup(dest_key) {
                let mut dest = write_series(&dest);
                if dest.source_key() == Some(name) {
                    dest.set_source_key(None);
                }
            }
        }
        if let Some(source) = source {
            if let Some(src) = self.keyspace.lookup(&source) {
                if write_series(&src).remove_rule(name).is_err() {
                    debug!("Source {} of {} had no rule to it", source, name);
                }
            }
        }

        debug!(
            "Deleted series {} ({} destinations detached)",
            name,
            destinations.len()
        );
        Ok(())
    }

    /// Appends one sample, compacting it into every rule destination.
    ///
    /// Returns the stored timestamp.
    pub fn append(&self, name: &str, timestamp: Timestamp, value: f64) -> Result<Timestamp> {
        let handle = self.handle(name)?;
        CompactionEngine::new(&self.keyspace).append(&handle, Sample::new(timestamp, value))?;
        Ok(timestamp)
    }

    /// Appends several samples, each independently.
    pub fn append_many(&self, samples: &[(&str, Timestamp, f64)]) -> Vec<Result<Timestamp>> {
        samples
            .iter()
            .map(|&(name, timestamp, value)| self.append(name, timestamp, value))
            .collect()
    }

    /// Runs a range query.
    ///
    /// # Errors
    ///
    /// Returns `SeriesError::SeriesNotFound` for an unknown series and
    /// `SeriesError::InvalidBucket` for a non-positive aggregation bucket.
    pub fn range(&self, name: &str, query: RangeQuery) -> Result<Vec<Sample>> {
        let handle = self.handle(name)?;
        let series = read_series(&handle);
        match query.aggregation {
            Some((aggregation, bucket_ms)) => {
                series.range_aggregated(query.from, query.to, aggregation, bucket_ms, query.count)
            }
            None => Ok(series.range(query.from, query.to, query.count).collect()),
        }
    }

    /// Creates a compaction rule `source -> destination`.
    ///
    /// # Errors
    ///
    /// - `SeriesError::InvalidBucket` if `bucket_ms <= 0`
    /// - `SeriesError::SeriesNotFound` if either series is missing
    /// - `SeriesError::CyclicRule` if the rule would close a cycle
    /// - `SeriesError::DuplicateRule` if the destination already has a source
    pub fn create_rule(
        &self,
        source: &str,
        destination: &str,
        aggregation: Aggregation,
        bucket_ms: i64,
    ) -> Result<()> {
        if bucket_ms <= 0 {
            return Err(SeriesError::InvalidBucket(bucket_ms));
        }
        let _graph = self.rule_graph.lock().unwrap_or_else(|err| err.into_inner());
        let src = self.handle(source)?;
        let dst = self.handle(destination)?;

        if CompactionEngine::new(&self.keyspace).would_create_cycle(source, destination) {
            return Err(SeriesError::CyclicRule {
                source_key: source.to_string(),
                destination: destination.to_string(),
            });
        }
        if read_series(&dst).source_key().is_some() {
            return Err(SeriesError::DuplicateRule(destination.to_string()));
        }

        write_series(&src).add_rule(destination, aggregation, bucket_ms)?;
        write_series(&dst).set_source_key(Some(source.to_string()));
        Ok(())
    }

    /// Deletes the rule `source -> destination`.
    ///
    /// # Errors
    ///
    /// Returns `SeriesError::SeriesNotFound` for an unknown source and
    /// `SeriesError::RuleNotFound` if there is no such rule.
    pub fn delete_rule(&self, source: &str, destination: &str) -> Result<()> {
        let _graph = self.rule_graph.lock().unwrap_or_else(|err| err.into_inner());
        let src = self.handle(source)?;
        write_series(&src).remove_rule(destination)?;
        if let Some(dst) = self.keyspace.lookup(destination) {
            let mut dst = write_series(&dst);
            if dst.source_key() == Some(source) {
                dst.set_source_key(None);
            }
        }
        Ok(())
    }

    /// Returns series metadata.
    pub fn info(&self, name: &str) -> Result<SeriesInfo> {
        let handle = self.handle(name)?;
        let info = read_series(&handle).info();
        Ok(info)
    }

    /// Dumps a series, including open compaction buckets.
    pub fn save(&self, name: &str) -> Result<Vec<u8>> {
        let handle = self.handle(name)?;
        let series = read_series(&handle);
        let bytes = codec::encode_series(&series)?;
        debug!("Saved series {} ({} bytes)", name, bytes.len());
        Ok(bytes)
    }

    /// Restores a dump under `name`.
    ///
    /// The restored rules obey the same graph constraints as `create_rule`,
    /// including rules held by series whose destinations do not exist yet.
    /// Existing destinations of the restored rules are pointed back at
    /// `name`; missing ones are resolved when compaction next needs them.
    /// The `sourceKey` of the restored series is taken from the live rule
    /// graph, not from the dump.
    ///
    /// # Errors
    ///
    /// Returns `SeriesError::SeriesExists` if `name` is taken, the decode
    /// error for a rejected buffer, `SeriesError::CyclicRule` if a restored
    /// rule would close a cycle, or `SeriesError::DuplicateRule` if a
    /// restored rule targets a series that already has a source. A rejected
    /// load changes nothing.
    pub fn load(&self, name: &str, bytes: &[u8]) -> Result<()> {
        if self.keyspace.contains(name) {
            return Err(SeriesError::SeriesExists(name.to_string()));
        }
        let mut series = codec::decode_series(bytes).inspect_err(|err| {
            warn!("Rejected dump for {}: {}", name, err);
        })?;
        series.set_name(name);

        let _graph = self.rule_graph.lock().unwrap_or_else(|err| err.into_inner());
        self.check_restored_rules(&series)
            .inspect_err(|err| warn!("Rejected rules of dump for {}: {}", name, err))?;
        series.set_source_key(self.sources_of(name).into_iter().next());
        let handle = self.keyspace.insert(series)?;
        let linked = codec::link_destinations(&self.keyspace, &handle);
        debug!(
            "Loaded series {} ({} bytes, {} destinations linked)",
            name,
            bytes.len(),
            linked
        );
        Ok(())
    }

    /// Validates the outgoing rules of a series about to be restored.
    ///
    /// Callers must hold the rule graph lock.
    fn check_restored_rules(&self, series: &Series) -> Result<()> {
        let engine = CompactionEngine::new(&self.keyspace);
        for rule in series.rules() {
            let destination = rule.dest_key();
            if engine.would_create_cycle(series.name(), destination) {
                return Err(SeriesError::CyclicRule {
                    source_key: series.name().to_string(),
                    destination: destination.to_string(),
                });
            }
            if !self.sources_of(destination).is_empty() {
                return Err(SeriesError::DuplicateRule(destination.to_string()));
            }
        }
        Ok(())
    }

    /// Returns true if the series exists.
    pub fn contains(&self, name: &str) -> bool {
        self.keyspace.contains(name)
    }

    /// Number of series.
    pub fn len(&self) -> usize {
        self.keyspace.len()
    }

    /// Returns true if there are no series.
    pub fn is_empty(&self) -> bool {
        self.keyspace.is_empty()
    }

    /// Series names in ascending order.
    pub fn names(&self) -> Vec<String> {
        self.keyspace.names()
    }
}
