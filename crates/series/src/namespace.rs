//! Name-based series lookup.
//!
//! Rules refer to their destinations by key only. The compaction engine and
//! the restore path resolve those keys through a [`Namespace`], which keeps
//! the core usable against any host keyspace or a plain map in tests.

use crate::error::{Result, SeriesError};
use crate::series::Series;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Shared handle to a series guarded by its single-writer lock.
pub type SeriesHandle = Arc<RwLock<Series>>;

/// Read-locks a series, recovering from poisoning.
pub fn read_series(handle: &SeriesHandle) -> RwLockReadGuard<'_, Series> {
    handle.read().unwrap_or_else(|err| err.into_inner())
}

/// Write-locks a series, recovering from poisoning.
pub fn write_series(handle: &SeriesHandle) -> RwLockWriteGuard<'_, Series> {
    handle.write().unwrap_or_else(|err| err.into_inner())
}

/// Lookup capability from series name to handle.
pub trait Namespace: Send + Sync {
    /// Returns the series registered under `name`.
    fn lookup(&self, name: &str) -> Option<SeriesHandle>;
}

impl Namespace for HashMap<String, SeriesHandle> {
    fn lookup(&self, name: &str) -> Option<SeriesHandle> {
        self.get(name).cloned()
    }
}

/// In-memory keyspace of series.
///
/// The map lock is never held while a series lock is acquired.
///
/// # Examples
/// ```rust,ignore
/// use alopex_series::{Keyspace, Series, SeriesOptions};
///
/// let keyspace = Keyspace::new();
/// keyspace.insert(Series::new("cpu", SeriesOptions::default())?)?;
/// assert!(keyspace.contains("cpu"));
/// ```
#[derive(Debug, Default)]
pub struct Keyspace {
    series: RwLock<HashMap<String, SeriesHandle>>,
}

impl Keyspace {
    /// Creates an empty keyspace.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a series under its own name.
    ///
    /// # Errors
    ///
    /// Returns `SeriesError::SeriesExists` if the name is taken.
    pub fn insert(&self, series: Series) -> Result<SeriesHandle> {
        let mut map = self.series.write().unwrap_or_else(|err| err.into_inner());
        if map.contains_key(series.name()) {
            return Err(SeriesError::SeriesExists(series.name().to_string()));
        }
        let name = series.name().to_string();
        let handle = Arc::new(RwLock::new(series));
        map.insert(name, Arc::clone(&handle));
        Ok(handle)
    }

    /// Unregisters a series and returns its handle.
    pub fn remove(&self, name: &str) -> Option<SeriesHandle> {
        let mut map = self.series.write().unwrap_or_else(|err| err.into_inner());
        map.remove(name)
    }

    /// Returns true if `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        let map = self.series.read().unwrap_or_else(|err| err.into_inner());
        map.contains_key(name)
    }

    /// Number of registered series.
    pub fn len(&self) -> usize {
        let map = self.series.read().unwrap_or_else(|err| err.into_inner());
        map.len()
    }

    /// Returns true if no series is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered names in ascending order.
    pub fn names(&self) -> Vec<String> {
        let map = self.series.read().unwrap_or_else(|err| err.into_inner());
        let mut names: Vec<String> = map.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Namespace for Keyspace {
    fn lookup(&self, name: &str) -> Option<SeriesHandle> {
        let map = self.series.read().unwrap_or_else(|err| err.into_inner());
        map.get(name).cloned()
    }
}
