//! Compaction engine: fans appended samples out through rule chains.
//!
//! An append write-locks its source and every series reachable from it
//! through rules, in name order, before anything is stored. The cascade of
//! bucket flushes is then validated against the locked state and applied
//! through an explicit work queue. The locks are held until the queue is
//! drained, so each destination receives its buckets in order.

use crate::chunk::Sample;
use crate::config::DuplicatePolicy;
use crate::error::{Result, SeriesError};
use crate::namespace::{read_series, write_series, Namespace, SeriesHandle};
use crate::series::{AppendOutcome, Series};
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::{Arc, RwLockWriteGuard};
use tracing::{debug, warn};

/// Write guards of every series an append may touch, keyed by name.
type Guards<'h> = BTreeMap<&'h str, RwLockWriteGuard<'h, Series>>;

/// Series reachable from an append's source, resolved by name.
struct Reach {
    root: String,
    members: BTreeMap<String, SeriesHandle>,
    missing: BTreeSet<String>,
}

impl Reach {
    /// Locks every member in name order.
    fn lock(&self) -> Guards<'_> {
        self.members
            .iter()
            .map(|(name, handle)| (name.as_str(), write_series(handle)))
            .collect()
    }
}

/// Applies appends to a series and its downstream rule destinations.
pub struct CompactionEngine<'a> {
    namespace: &'a dyn Namespace,
}

impl<'a> CompactionEngine<'a> {
    /// Creates an engine resolving destinations through `namespace`.
    pub fn new(namespace: &'a dyn Namespace) -> Self {
        Self { namespace }
    }

    /// Appends `sample` to the series behind `handle` and compacts it into
    /// every rule destination, transitively.
    ///
    /// The append is all or nothing: every store and flush it would cause is
    /// checked first, and on any failure no series is changed.
    ///
    /// # Errors
    ///
    /// Returns the storage error of the source or of a destination
    /// (`OutOfOrder`, `DuplicateSample`), `StaleCompactionInput` if a sample
    /// is older than a rule's open bucket anywhere along the chain, or
    /// `DestinationMissing` if a bucket would be flushed into a series that
    /// does not exist.
    pub fn append(&self, handle: &SeriesHandle, sample: Sample) -> Result<AppendOutcome> {
        loop {
            let reach = self.resolve(handle);
            let mut guards = reach.lock();
            if !self.is_current(&reach, &guards) {
                debug!("Rule graph below {} changed while locking, retrying", reach.root);
                continue;
            }

            let root = reach.root.as_str();
            let policy = guards
                .get(root)
                .map(|series| series.options().duplicate_policy)
                .ok_or_else(|| SeriesError::SeriesNotFound(root.to_string()))?;
            Self::check(&guards, root, sample, policy)?;
            return Self::apply(&mut guards, root, sample, policy);
        }
    }

    /// Collects the series reachable from `handle`, one read lock at a time.
    fn resolve(&self, handle: &SeriesHandle) -> Reach {
        let root = read_series(handle).name().to_string();
        let mut members = BTreeMap::from([(root.clone(), Arc::clone(handle))]);
        let mut missing = BTreeSet::new();

        let mut stack = vec![Arc::clone(handle)];
        while let Some(current) = stack.pop() {
            let destinations: Vec<String> = read_series(&current)
                .rules()
                .iter()
                .map(|r| r.dest_key().to_string())
                .collect();
            for dest_key in destinations {
                if members.contains_key(&dest_key) || missing.contains(&dest_key) {
                    continue;
                }
                match self.namespace.lookup(&dest_key) {
                    Some(dest) => {
                        stack.push(Arc::clone(&dest));
                        members.insert(dest_key, dest);
                    }
                    None => {
                        missing.insert(dest_key);
                    }
                }
            }
        }

        Reach {
            root,
            members,
            missing,
        }
    }

    /// Returns true if the locked rules still point at the resolved series.
    fn is_current(&self, reach: &Reach, guards: &Guards<'_>) -> bool {
        guards.values().all(|series| {
            series.rules().iter().all(|rule| {
                let dest_key = rule.dest_key();
                match (reach.members.get(dest_key), self.namespace.lookup(dest_key)) {
                    (Some(locked), Some(current)) => Arc::ptr_eq(locked, &current),
                    (None, None) => reach.missing.contains(dest_key),
                    _ => false,
                }
            })
        })
    }

    /// Walks the cascade `sample` would cause without changing anything.
    ///
    /// Every series receives at most one sample per append: a destination
    /// has a single source and the rule graph is acyclic.
    fn check(
        guards: &Guards<'_>,
        root: &str,
        sample: Sample,
        policy: DuplicatePolicy,
    ) -> Result<()> {
        let mut queue = VecDeque::from([(root.to_string(), sample, policy)]);
        while let Some((name, sample, policy)) = queue.pop_front() {
            let series = guards
                .get(name.as_str())
                .ok_or_else(|| SeriesError::DestinationMissing(name.clone()))?;
            if !series.check_append(sample, policy)?.is_new() {
                continue;
            }
            for rule in series.rules() {
                let Some(open) = rule.pending_flush(sample.timestamp)? else {
                    continue;
                };
                if let Some(value) = rule.accumulator().finalize(rule.aggregation()) {
                    queue.push_back((
                        rule.dest_key().to_string(),
                        Sample::new(open, value),
                        DuplicatePolicy::Last,
                    ));
                }
            }
        }
        Ok(())
    }

    /// Stores `sample` in the root and drains the flushes it causes.
    ///
    /// Destination writes use `DuplicatePolicy::Last`, so a rewritten bucket
    /// replaces whatever the destination held at that timestamp.
    fn apply(
        guards: &mut Guards<'_>,
        root: &str,
        sample: Sample,
        policy: DuplicatePolicy,
    ) -> Result<AppendOutcome> {
        let mut queue = VecDeque::new();
        let outcome = Self::store(guards, root, sample, policy, &mut queue)?;
        while let Some((dest_key, sample)) = queue.pop_front() {
            Self::store(guards, &dest_key, sample, DuplicatePolicy::Last, &mut queue)
                .inspect_err(|err| warn!("Compaction into {} failed: {}", dest_key, err))?;
        }
        Ok(outcome)
    }

    /// Stores one sample and queues the buckets it flushes.
    fn store(
        guards: &mut Guards<'_>,
        name: &str,
        sample: Sample,
        policy: DuplicatePolicy,
        queue: &mut VecDeque<(String, Sample)>,
    ) -> Result<AppendOutcome> {
        let series = guards
            .get_mut(name)
            .ok_or_else(|| SeriesError::DestinationMissing(name.to_string()))?;
        let outcome = series.append_with_policy(sample, policy)?;
        if !outcome.is_new_sample() {
            return Ok(outcome);
        }

        for rule in series.rules_mut() {
            if let Some(flushed) = rule.observe(sample)? {
                debug!(
                    "Flushed bucket {} of {} -> {} ({}): {}",
                    flushed.timestamp,
                    name,
                    rule.dest_key(),
                    rule.aggregation(),
                    flushed.value
                );
                queue.push_back((rule.dest_key().to_string(), flushed));
            }
        }
        Ok(outcome)
    }

    /// Returns true if a rule `source -> destination` would close a cycle.
    ///
    /// Walks the rule graph from `destination`; callers must not hold a
    /// write lock on any series while checking.
    pub fn would_create_cycle(&self, source: &str, destination: &str) -> bool {
        if source == destination {
            return true;
        }
        let mut seen = HashSet::new();
        let mut stack = vec![destination.to_string()];
        while let Some(name) = stack.pop() {
            if name == source {
                return true;
            }
            if !seen.insert(name.clone()) {
                continue;
            }
            if let Some(handle) = self.namespace.lookup(&name) {
                let series = read_series(&handle);
                stack.extend(series.rules().iter().map(|r| r.dest_key().to_string()));
            }
        }
        false
    }
}
