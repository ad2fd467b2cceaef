//! Job tracking and cooperative per-job cancellation.
//!
//! The [`JobMonitor`] owns the [`JobRegistry`] and pairs every running job
//! with a [`CancelFlag`]. Registration is scoped: [`JobMonitor::begin`]
//! returns a [`JobGuard`] whose `Drop` impl de-registers the job on every
//! exit path, including unwinding, so registration and de-registration are
//! paired exactly once per execution attempt.
//!
//! Cancellation is cooperative, not preemptive. [`JobMonitor::cancel`] sets
//! the job's flag; the running job observes it at its next checkpoint (the
//! retry boundary in the execution middleware) and aborts instead of
//! proceeding. A job that never checks back in can only be stopped by the
//! watchdog's process-level signals.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::registry::{JobId, JobRecord, JobRegistry};

const COMPONENT: &str = "job_monitor";

/// Job-local cancellation token.
///
/// Cloneable and shareable across threads; setting it is idempotent.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Creates an unset flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the job as cancelled.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Returns whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Tracks running jobs and routes cancellation requests to them.
pub struct JobMonitor {
    registry: Arc<JobRegistry>,
    clock: Arc<dyn Clock>,
    flags: RwLock<HashMap<JobId, CancelFlag>>,
}

impl JobMonitor {
    /// Creates a monitor over `registry` using `clock` for start timestamps.
    pub fn new(registry: Arc<JobRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry,
            clock,
            flags: RwLock::new(HashMap::new()),
        }
    }

    /// The registry this monitor feeds.
    #[must_use]
    pub fn registry(&self) -> Arc<JobRegistry> {
        Arc::clone(&self.registry)
    }

    /// Registers a job and returns the guard that owns its registration.
    ///
    /// The record is removed when the guard drops, whether the job body
    /// returns, errors, or unwinds.
    pub fn begin(&self, id: JobId, worker_type: &str, queue: &str) -> JobGuard<'_> {
        let record = JobRecord::new(worker_type, queue, self.clock.now());
        if !self.registry.insert(id.clone(), record) {
            warn!(
                component = COMPONENT,
                job_id = %id,
                "job id already registered; keeping the existing record"
            );
        }

        let flag = CancelFlag::new();
        self.flags
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), flag.clone());

        JobGuard {
            monitor: self,
            id,
            flag,
        }
    }

    /// Runs `f` with the job registered for its duration.
    pub fn within_job<T>(
        &self,
        id: JobId,
        worker_type: &str,
        queue: &str,
        f: impl FnOnce(&JobGuard<'_>) -> T,
    ) -> T {
        let guard = self.begin(id, worker_type, queue);
        f(&guard)
    }

    /// Requests cancellation of the job with `id`.
    ///
    /// Returns `true` if the job was running and has been signalled. An
    /// unknown id is a silent no-op returning `false`: the race between a
    /// cancellation request and natural job completion is expected.
    pub fn cancel(&self, id: &JobId) -> bool {
        let flags = self.flags.read().unwrap_or_else(PoisonError::into_inner);
        match flags.get(id) {
            Some(flag) => {
                flag.cancel();
                info!(
                    component = COMPONENT,
                    action = "cancel",
                    job_id = %id,
                    "cancellation requested for running job"
                );
                true
            }
            None => {
                debug!(
                    component = COMPONENT,
                    job_id = %id,
                    "cancel requested for unknown job id; it already finished"
                );
                false
            }
        }
    }

    /// Point-in-time snapshot of all running jobs.
    #[must_use]
    pub fn jobs(&self) -> HashMap<JobId, JobRecord> {
        self.registry.snapshot()
    }

    fn finish(&self, id: &JobId) {
        self.registry.remove(id);
        self.flags
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }
}

impl fmt::Debug for JobMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobMonitor")
            .field("running", &self.registry.len())
            .finish_non_exhaustive()
    }
}

/// Owns one job's registration; de-registers on drop.
#[derive(Debug)]
pub struct JobGuard<'a> {
    monitor: &'a JobMonitor,
    id: JobId,
    flag: CancelFlag,
}

impl JobGuard<'_> {
    /// The id of the tracked job.
    #[must_use]
    pub fn id(&self) -> &JobId {
        &self.id
    }

    /// Cooperative cancellation checkpoint.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.is_cancelled()
    }
}

impl Drop for JobGuard<'_> {
    fn drop(&mut self) {
        self.monitor.finish(&self.id);
    }
}
