//! Alopex Series - chunked time series store with streaming compaction
//!
//! This crate provides the storage and compaction core of a time series
//! extension: bounded sample chunks, retention trimming, aggregation rules
//! that stream a source series into downsampled destinations, and a
//! versioned dump format that preserves open aggregation buckets.
//!
//! # Components
//!
//! - [`Series`]: ordered chunks, retention window, duplicate policy, range scans
//! - [`Chunk`]: uncompressed or Gorilla-compressed run of samples
//! - [`Accumulator`] / [`Aggregation`]: O(1) per-bucket running statistics
//! - [`CompactionRule`] / [`CompactionEngine`]: bucketed fan-out into destinations
//! - [`codec`]: dump/restore of one series with its rule state
//! - [`TimeSeriesDb`]: command facade over a [`Keyspace`]
//!
//! # Example
//!
//! ```rust,ignore
//! use alopex_series::{Aggregation, RangeQuery, SeriesOptions, TimeSeriesDb};
//!
//! let db = TimeSeriesDb::default();
//! db.create_series("temp", Some(SeriesOptions::default().with_retention_ms(86_400_000)))?;
//! db.create_series("temp_avg", None)?;
//! db.create_rule("temp", "temp_avg", Aggregation::Avg, 60_000)?;
//!
//! db.append("temp", 1_000, 21.5)?;
//! db.append("temp", 61_000, 22.0)?; // closes the first minute in temp_avg
//!
//! let dump = db.save("temp")?;
//! db.delete_series("temp")?;
//! db.load("temp", &dump)?;
//! ```

#![deny(missing_docs)]

pub mod aggregation;
pub mod chunk;
pub mod codec;
pub mod compaction;
pub mod config;
pub mod db;
pub mod error;
pub mod namespace;
pub mod rule;
pub mod series;

pub use aggregation::{aggregate_buckets, Accumulator, Aggregation};
pub use chunk::{Chunk, Sample, Timestamp, UpsertOutcome};
pub use codec::{decode_series, encode_series};
pub use compaction::CompactionEngine;
pub use config::{ChunkEncoding, DbConfig, DuplicatePolicy, SeriesOptions};
pub use db::{RangeQuery, TimeSeriesDb};
pub use error::{Result, SeriesError};
pub use namespace::{Keyspace, Namespace, SeriesHandle};
pub use rule::CompactionRule;
pub use series::{AppendOutcome, RangeIter, RuleInfo, Series, SeriesInfo};
