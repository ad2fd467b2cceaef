//! Per-worker-type memory allowances.
//!
//! Whitelisted worker types declare an expected memory footprint in
//! kilobytes. While such a job is running, its allowance is added to the
//! effective soft limit so that legitimately large jobs do not trip the
//! watchdog. The hard limit is never adjusted.
//!
//! How an allowance scales with a job's elapsed running time is a pluggable
//! policy: [`FullAllowance`] (the default) grants the declared amount for
//! the whole run, [`LinearGrowth`] treats the declaration as a growth rate
//! in kilobytes per second.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use memkill_core::registry::{JobId, JobRecord};

/// Whitelist of worker types allowed to contribute soft-limit headroom.
#[derive(Debug, Clone, Default)]
pub struct WorkerAllowances {
    declared_kb: HashMap<String, u64>,
}

impl WorkerAllowances {
    /// Creates a whitelist from a `worker_type -> declared kB` mapping.
    #[must_use]
    pub fn new(declared_kb: HashMap<String, u64>) -> Self {
        Self { declared_kb }
    }

    /// Declared allowance for `worker_type`, or `None` when the type is not
    /// whitelisted.
    #[must_use]
    pub fn lookup(&self, worker_type: &str) -> Option<u64> {
        self.declared_kb.get(worker_type).copied()
    }
}

/// How a running job's declared allowance scales with elapsed time.
pub trait AllowancePolicy: Send + Sync {
    /// Kilobytes of soft-limit headroom granted to one running job.
    fn allowance_kb(&self, declared_kb: u64, elapsed: Duration) -> u64;
}

/// The declared allowance counts in full once the job has started.
#[derive(Debug, Clone, Copy, Default)]
pub struct FullAllowance;

impl AllowancePolicy for FullAllowance {
    fn allowance_kb(&self, declared_kb: u64, _elapsed: Duration) -> u64 {
        declared_kb
    }
}

/// The declared allowance is a growth rate: kilobytes per second of
/// elapsed running time.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearGrowth;

impl AllowancePolicy for LinearGrowth {
    fn allowance_kb(&self, declared_kb: u64, elapsed: Duration) -> u64 {
        declared_kb.saturating_mul(elapsed.as_secs())
    }
}

/// Sums the allowances of all running whitelisted jobs.
///
/// Jobs whose worker type is not whitelisted contribute zero rather than
/// failing the computation.
#[must_use]
pub fn rss_increase_by_jobs(
    jobs: &HashMap<JobId, JobRecord>,
    allowances: &WorkerAllowances,
    policy: &dyn AllowancePolicy,
    now: Instant,
) -> u64 {
    jobs.values()
        .map(|record| match allowances.lookup(record.worker_type()) {
            Some(declared_kb) => policy.allowance_kb(declared_kb, record.elapsed(now)),
            None => 0,
        })
        .fold(0, u64::saturating_add)
}
