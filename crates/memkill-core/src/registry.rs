//! Registry of in-flight job executions.
//!
//! The registry is the single shared mutable structure in the system. Job
//! execution threads insert a [`JobRecord`] when a job starts and remove it
//! when the job finishes; the watchdog thread reads point-in-time snapshots
//! to sum whitelisted memory allowances and to poll for drain during
//! escalation.
//!
//! # Invariants
//!
//! - A given [`JobId`] appears at most once; absence means "not currently
//!   running".
//! - Readers never observe a partially constructed record: inserts and
//!   removals happen atomically under the write lock.
//! - A panicking worker thread must not disable the registry, so poisoned
//!   locks are recovered rather than propagated.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Identifier of one in-flight job execution.
///
/// Unique per execution attempt, supplied by the embedding worker framework
/// (a Sidekiq-style jid, a UUID, or similar).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Creates a job id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Metadata for one running job.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    worker_type: String,
    queue: String,
    #[serde(skip)]
    started_at: Instant,
    started_at_utc: DateTime<Utc>,
}

impl JobRecord {
    /// Creates a record for a job that started at `started_at`.
    pub fn new(worker_type: impl Into<String>, queue: impl Into<String>, started_at: Instant) -> Self {
        Self {
            worker_type: worker_type.into(),
            queue: queue.into(),
            started_at,
            started_at_utc: Utc::now(),
        }
    }

    /// The worker type, used to look up a whitelisted memory allowance.
    #[must_use]
    pub fn worker_type(&self) -> &str {
        &self.worker_type
    }

    /// The queue the job was pulled from.
    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Monotonic start instant.
    #[must_use]
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Wall-clock start time, for operator inspection.
    #[must_use]
    pub fn started_at_utc(&self) -> DateTime<Utc> {
        self.started_at_utc
    }

    /// How long the job has been running as of `now`.
    #[must_use]
    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started_at)
    }
}

/// Thread-safe mapping of [`JobId`] to [`JobRecord`].
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
}

impl JobRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a record for `id`.
    ///
    /// Returns `false` (leaving the existing record untouched) if the id is
    /// already present; one execution attempt registers exactly once.
    pub fn insert(&self, id: JobId, record: JobRecord) -> bool {
        let mut jobs = self.write();
        match jobs.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(record);
                true
            }
        }
    }

    /// Removes the record for `id`, returning it if it was present.
    pub fn remove(&self, id: &JobId) -> Option<JobRecord> {
        self.write().remove(id)
    }

    /// Returns a consistent point-in-time copy of all running jobs.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<JobId, JobRecord> {
        self.read().clone()
    }

    /// Returns whether `id` is currently registered.
    #[must_use]
    pub fn contains(&self, id: &JobId) -> bool {
        self.read().contains_key(id)
    }

    /// Number of jobs currently running.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Returns whether no jobs are currently running.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<JobId, JobRecord>> {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<JobId, JobRecord>> {
        self.jobs.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use proptest::prelude::*;

    use super::*;

    fn record(worker_type: &str) -> JobRecord {
        JobRecord::new(worker_type, "default", Instant::now())
    }

    #[test]
    fn test_insert_and_remove() {
        let registry = JobRegistry::new();
        let id = JobId::from("jid-1");

        assert!(registry.insert(id.clone(), record("ImportWorker")));
        assert!(registry.contains(&id));
        assert_eq!(registry.len(), 1);

        let removed = registry.remove(&id).expect("record should be present");
        assert_eq!(removed.worker_type(), "ImportWorker");
        assert!(!registry.contains(&id));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_insert_is_rejected() {
        let registry = JobRegistry::new();
        let id = JobId::from("jid-1");

        assert!(registry.insert(id.clone(), record("A")));
        assert!(!registry.insert(id.clone(), record("B")));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot[&id].worker_type(), "A");
    }

    #[test]
    fn test_remove_unknown_id_is_none() {
        let registry = JobRegistry::new();
        assert!(registry.remove(&JobId::from("nope")).is_none());
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let registry = JobRegistry::new();
        let id = JobId::from("jid-1");
        registry.insert(id.clone(), record("A"));

        let snapshot = registry.snapshot();
        registry.remove(&id);

        assert!(snapshot.contains_key(&id));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_record_elapsed_saturates_before_start() {
        let start = Instant::now();
        let record = JobRecord::new("A", "default", start + Duration::from_secs(10));
        assert_eq!(record.elapsed(start), Duration::ZERO);
    }

    #[test]
    fn test_concurrent_begin_end_from_many_threads() {
        let registry = Arc::new(JobRegistry::new());
        let mut handles = Vec::new();

        for t in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(std::thread::spawn(move || {
                for i in 0..100 {
                    let id = JobId::new(format!("jid-{t}-{i}"));
                    assert!(registry.insert(id.clone(), record("W")));
                    assert!(registry.remove(&id).is_some());
                }
            }));
        }

        for handle in handles {
            handle.join().expect("worker thread should not panic");
        }
        assert!(registry.is_empty());
    }

    proptest! {
        // A job id is reported present exactly between its begin and its
        // matching end, for arbitrary interleaved begin/end sequences.
        #[test]
        fn test_presence_matches_begin_end_history(
            ops in prop::collection::vec((0u8..16, any::<bool>()), 0..64)
        ) {
            let registry = JobRegistry::new();
            let mut model: HashSet<u8> = HashSet::new();

            for (key, begin) in ops {
                let id = JobId::new(format!("jid-{key}"));
                if begin {
                    let inserted = registry.insert(id.clone(), record("W"));
                    prop_assert_eq!(inserted, !model.contains(&key));
                    model.insert(key);
                } else {
                    let removed = registry.remove(&id);
                    prop_assert_eq!(removed.is_some(), model.contains(&key));
                    model.remove(&key);
                }

                prop_assert_eq!(registry.len(), model.len());
                for key in &model {
                    let id = JobId::new(format!("jid-{key}"));
                    prop_assert!(registry.contains(&id));
                }
            }
        }
    }
}
