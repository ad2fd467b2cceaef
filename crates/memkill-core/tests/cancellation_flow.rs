//! End-to-end cancellation: an operator cancels one in-flight job, the
//! execution middleware diverts it to the dead set instead of the retry
//! path, and the registry ends the attempt with no trace of the job.

use std::sync::Arc;
use std::time::Duration;

use memkill_core::clock::SystemClock;
use memkill_core::middleware::{DeadLetterSink, ExecutionMiddleware, InMemoryDeadSet, JobOutcome};
use memkill_core::monitor::JobMonitor;
use memkill_core::registry::{JobId, JobRegistry};

struct Fixture {
    monitor: Arc<JobMonitor>,
    dead_set: Arc<InMemoryDeadSet>,
}

impl Fixture {
    fn new() -> Self {
        let registry = Arc::new(JobRegistry::new());
        Self {
            monitor: Arc::new(JobMonitor::new(registry, Arc::new(SystemClock))),
            dead_set: Arc::new(InMemoryDeadSet::new()),
        }
    }

    fn middleware(&self) -> ExecutionMiddleware {
        ExecutionMiddleware::new(
            Arc::clone(&self.monitor),
            Arc::clone(&self.dead_set) as Arc<dyn DeadLetterSink>,
        )
    }
}

#[test]
fn operator_cancels_one_job_while_others_keep_running() {
    let fixture = Fixture::new();
    let monitor = Arc::clone(&fixture.monitor);
    let target = JobId::from("jid-cancel-me");

    // An unrelated job occupies the registry for the whole scenario.
    let bystander = fixture.monitor.begin(JobId::from("jid-bystander"), "MailWorker", "mail");

    let worker = {
        let middleware = fixture.middleware();
        let id = target.clone();
        std::thread::spawn(move || {
            middleware.execute(id, "ImportWorker", "imports", |guard| {
                loop {
                    if guard.is_cancelled() {
                        return Err("import aborted by operator");
                    }
                    std::thread::sleep(Duration::from_millis(2));
                }
            })
        })
    };

    while !fixture.monitor.registry().contains(&target) {
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(fixture.monitor.cancel(&target));

    let outcome = worker.join().expect("worker thread should not panic");
    assert_eq!(outcome, JobOutcome::Cancelled);
    assert!(!outcome.should_retry());

    // The cancelled job is gone from the registry and dead-lettered; the
    // bystander is untouched.
    assert!(!fixture.monitor.registry().contains(&target));
    assert!(fixture.monitor.registry().contains(bystander.id()));
    assert!(!bystander.is_cancelled());

    let dead = fixture.dead_set.entries();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, target);
    assert_eq!(dead[0].reason, "import aborted by operator");

    // Cancelling again after completion is a silent no-op.
    assert!(!fixture.monitor.cancel(&target));
}

#[test]
fn completed_and_failed_jobs_never_reach_the_dead_set() {
    let fixture = Fixture::new();
    let middleware = fixture.middleware();

    let ok = middleware.execute(JobId::from("jid-ok"), "MailWorker", "mail", |_guard| {
        Ok::<_, String>(())
    });
    let failed = middleware.execute(JobId::from("jid-err"), "MailWorker", "mail", |_guard| {
        Err("smtp timeout")
    });

    assert_eq!(ok, JobOutcome::Completed);
    assert!(failed.should_retry());
    assert!(fixture.dead_set.is_empty());
    assert!(fixture.monitor.registry().is_empty());
}
