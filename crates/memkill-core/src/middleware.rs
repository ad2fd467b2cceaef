//! Execution middleware: outcome tagging and dead-lettering.
//!
//! Wraps a single job execution attempt. The wrapper registers the job with
//! the [`JobMonitor`], runs the body under the registration guard, and maps
//! the body's result to a [`JobOutcome`] for the outer retry framework to
//! dispatch on:
//!
//! - the body returns `Ok` → [`JobOutcome::Completed`]
//! - the body returns `Err` and the job was cancelled → the job is moved to
//!   the dead-letter sink and reported [`JobOutcome::Cancelled`], which the
//!   retry framework must treat as terminal
//! - the body returns `Err` otherwise → [`JobOutcome::Retryable`]
//!
//! Cancellation converts a would-be retry into a terminal failure; it never
//! requeues.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::monitor::{JobGuard, JobMonitor};
use crate::registry::JobId;

const COMPONENT: &str = "execution_middleware";

/// Tagged outcome of one execution attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The job body completed successfully.
    Completed,
    /// The job body failed and may be requeued for another attempt.
    Retryable {
        /// Rendered error from the job body.
        error: String,
    },
    /// The job was cancelled mid-flight and dead-lettered; never retried.
    Cancelled,
}

impl JobOutcome {
    /// Whether the outer retry framework may requeue the job.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }

    /// Stable label for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Retryable { .. } => "retryable",
            Self::Cancelled => "cancelled",
        }
    }
}

/// A job moved to the terminal dead set.
#[derive(Debug, Clone, Serialize)]
pub struct DeadJob {
    /// Identifier of the cancelled execution.
    pub id: JobId,
    /// Worker type of the cancelled job.
    pub worker_type: String,
    /// Queue the job was pulled from.
    pub queue: String,
    /// Rendered error the job died with.
    pub reason: String,
    /// When the job was dead-lettered.
    pub killed_at: DateTime<Utc>,
}

/// Destination for cancelled jobs.
///
/// In a full deployment this is backed by the worker framework's dead set;
/// [`InMemoryDeadSet`] serves embedded and test use.
pub trait DeadLetterSink: Send + Sync {
    /// Records `job` as terminally dead.
    fn kill(&self, job: DeadJob);
}

/// Dead-letter sink holding entries in memory.
#[derive(Debug, Default)]
pub struct InMemoryDeadSet {
    jobs: Mutex<Vec<DeadJob>>,
}

impl InMemoryDeadSet {
    /// Creates an empty dead set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies out the dead entries, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<DeadJob> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of dead entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns whether the dead set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DeadLetterSink for InMemoryDeadSet {
    fn kill(&self, job: DeadJob) {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(job);
    }
}

/// Wraps job executions with registration, cancellation handling and
/// dead-lettering.
pub struct ExecutionMiddleware {
    monitor: Arc<JobMonitor>,
    dead_letters: Arc<dyn DeadLetterSink>,
}

impl ExecutionMiddleware {
    /// Creates a middleware routing cancelled jobs to `dead_letters`.
    pub fn new(monitor: Arc<JobMonitor>, dead_letters: Arc<dyn DeadLetterSink>) -> Self {
        Self {
            monitor,
            dead_letters,
        }
    }

    /// Executes one job attempt and reports its outcome.
    ///
    /// The body receives the registration guard and should use
    /// [`JobGuard::is_cancelled`] as its cooperative checkpoint, returning
    /// an error to reach the retry boundary early. A cancellation that
    /// lands after the body already succeeded is benign and reported as
    /// [`JobOutcome::Completed`].
    pub fn execute<E: fmt::Display>(
        &self,
        id: JobId,
        worker_type: &str,
        queue: &str,
        body: impl FnOnce(&JobGuard<'_>) -> Result<(), E>,
    ) -> JobOutcome {
        self.monitor
            .within_job(id.clone(), worker_type, queue, |guard| {
                match body(guard) {
                    Ok(()) => JobOutcome::Completed,
                    Err(error) if guard.is_cancelled() => {
                        self.dead_letters.kill(DeadJob {
                            id: id.clone(),
                            worker_type: worker_type.to_owned(),
                            queue: queue.to_owned(),
                            reason: error.to_string(),
                            killed_at: Utc::now(),
                        });
                        info!(
                            component = COMPONENT,
                            action = "dead_letter",
                            job_id = %id,
                            worker_type,
                            "cancelled job moved to dead set; retries suppressed"
                        );
                        JobOutcome::Cancelled
                    }
                    Err(error) => JobOutcome::Retryable {
                        error: error.to_string(),
                    },
                }
            })
    }
}

impl fmt::Debug for ExecutionMiddleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionMiddleware")
            .field("monitor", &self.monitor)
            .finish_non_exhaustive()
    }
}
