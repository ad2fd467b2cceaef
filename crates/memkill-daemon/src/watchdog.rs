//! Memory watchdog daemon.
//!
//! An independent thread that samples resident memory once per interval and
//! drives the escalation state machine. The watchdog owns its state
//! exclusively; no other component reads or writes it.
//!
//! # State machine
//!
//! ```text
//! NORMAL ──rss > soft──► SOFT_EXCEEDED ──held > balloon──► ESCALATING
//!   ▲                         │
//!   └────rss <= soft──────────┘
//!
//! any state ──rss > hard──► ESCALATING
//! ```
//!
//! The soft limit is raised by the summed allowances of running whitelisted
//! jobs; the hard limit is absolute and bypasses the grace window entirely.
//! `ESCALATING` is terminal: the escalator sequence runs once and the
//! daemon exits its loop, leaving restart to the process supervisor.

use std::fmt;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use memkill_core::clock::{Clock, SystemClock};
use memkill_core::config::Config;
use memkill_core::registry::JobRegistry;

use crate::allowance::{AllowancePolicy, FullAllowance, WorkerAllowances, rss_increase_by_jobs};
use crate::escalator::{EscalationPlan, SignalEscalator};
use crate::sampler::{ProcStatusSampler, RssSampler, SampleError};
use crate::signal::{ProcessSignaller, SelfSignaller, SignalError};

const COMPONENT: &str = "memory_watchdog";

/// Escalation state, owned solely by the watchdog thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationState {
    /// Memory within limits.
    Normal,
    /// Soft limit breached; waiting out the grace-balloon window.
    SoftExceeded {
        /// When the current breach started.
        breach_started: Instant,
    },
    /// Limits exceeded for good; the escalator sequence has been triggered.
    Escalating,
}

/// What tripped the escalation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscalationTrigger {
    /// Resident memory exceeded the absolute hard limit.
    HardLimitExceeded {
        /// Sampled RSS in kilobytes.
        rss_kb: u64,
        /// The hard limit in kilobytes.
        limit_kb: u64,
    },
    /// Resident memory stayed above the effective soft limit past the
    /// grace-balloon window.
    SoftLimitExceeded {
        /// Sampled RSS in kilobytes.
        rss_kb: u64,
        /// The effective soft limit in kilobytes at the deciding tick.
        limit_kb: u64,
        /// How long the breach had been held.
        held: Duration,
    },
}

impl fmt::Display for EscalationTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HardLimitExceeded { rss_kb, limit_kb } => {
                write!(f, "current rss {rss_kb} kB exceeds hard limit {limit_kb} kB")
            }
            Self::SoftLimitExceeded {
                rss_kb,
                limit_kb,
                held,
            } => write!(
                f,
                "current rss {rss_kb} kB held above soft limit {limit_kb} kB for {}s",
                held.as_secs()
            ),
        }
    }
}

enum TickStatus {
    Checked,
    Escalated,
}

/// The watchdog daemon: sampling loop, state machine and escalation.
pub struct MemoryWatchdog {
    soft_limit_kb: u64,
    hard_limit_kb: u64,
    check_interval: Duration,
    grace_balloon: Duration,
    allowances: WorkerAllowances,
    policy: Box<dyn AllowancePolicy>,
    sampler: Box<dyn RssSampler>,
    signaller: Arc<dyn ProcessSignaller>,
    clock: Arc<dyn Clock>,
    registry: Arc<JobRegistry>,
    plan: EscalationPlan,
    state: EscalationState,
}

impl MemoryWatchdog {
    /// Creates a watchdog for the current process from `config`.
    ///
    /// Defaults: `/proc/self/status` sampling, self-signalling, the system
    /// clock, and the full-allowance policy. Override with the `with_*`
    /// builders.
    ///
    /// # Errors
    ///
    /// Returns [`SignalError::UnknownSignal`] if a configured signal name
    /// does not resolve.
    pub fn new(config: &Config, registry: Arc<JobRegistry>) -> Result<Self, SignalError> {
        let plan = EscalationPlan::from_config(&config.escalation)?;
        Ok(Self {
            soft_limit_kb: config.limits.soft_limit_kb,
            hard_limit_kb: config.limits.hard_limit_kb,
            check_interval: config.watchdog.check_interval(),
            grace_balloon: config.watchdog.grace_balloon(),
            allowances: WorkerAllowances::new(config.allowances.clone()),
            policy: Box::new(FullAllowance),
            sampler: Box::new(ProcStatusSampler::for_self()),
            signaller: Arc::new(SelfSignaller),
            clock: Arc::new(SystemClock),
            registry,
            plan,
            state: EscalationState::Normal,
        })
    }

    /// Replaces the RSS sampler.
    #[must_use]
    pub fn with_sampler(mut self, sampler: Box<dyn RssSampler>) -> Self {
        self.sampler = sampler;
        self
    }

    /// Replaces the signaller.
    #[must_use]
    pub fn with_signaller(mut self, signaller: Arc<dyn ProcessSignaller>) -> Self {
        self.signaller = signaller;
        self
    }

    /// Replaces the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the allowance scaling policy.
    #[must_use]
    pub fn with_allowance_policy(mut self, policy: Box<dyn AllowancePolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Overrides the sampling interval, for pacing finer than the
    /// second-granular configuration.
    #[must_use]
    pub fn with_check_interval(mut self, check_interval: Duration) -> Self {
        self.check_interval = check_interval;
        self
    }

    /// Current escalation state.
    #[must_use]
    pub fn state(&self) -> EscalationState {
        self.state
    }

    /// Soft limit plus the summed allowances of running whitelisted jobs.
    #[must_use]
    pub fn effective_soft_limit_kb(&self, now: Instant) -> u64 {
        let jobs = self.registry.snapshot();
        self.soft_limit_kb.saturating_add(rss_increase_by_jobs(
            &jobs,
            &self.allowances,
            self.policy.as_ref(),
            now,
        ))
    }

    /// Spawns the watchdog on its own named thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS refuses to spawn the thread.
    pub fn spawn(self) -> std::io::Result<WatchdogHandle> {
        let (stop_tx, stop_rx) = mpsc::sync_channel(1);
        let thread = std::thread::Builder::new()
            .name("memkill-watchdog".to_owned())
            .spawn(move || self.run(&stop_rx))?;
        Ok(WatchdogHandle { stop_tx, thread })
    }

    /// Runs the sampling loop until stopped or escalated.
    ///
    /// The stop channel doubles as interval pacing: a message (or a dropped
    /// sender) wakes the loop immediately.
    pub fn run(mut self, stop: &Receiver<()>) {
        info!(
            component = COMPONENT,
            action = "start",
            pid = self.signaller.pid(),
            check_interval_secs = self.check_interval.as_secs_f64(),
            "starting memory watchdog daemon"
        );

        loop {
            match self.tick() {
                Ok(TickStatus::Escalated) => break,
                Ok(TickStatus::Checked) => {}
                Err(error) => warn!(
                    component = COMPONENT,
                    error = %error,
                    "watchdog tick failed; retrying next interval"
                ),
            }

            match stop.recv_timeout(self.check_interval) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }

        warn!(
            component = COMPONENT,
            action = "stop",
            pid = self.signaller.pid(),
            "stopping memory watchdog daemon"
        );
    }

    /// One sampling tick: sample RSS, advance the state machine, escalate
    /// if it decided so.
    fn tick(&mut self) -> Result<TickStatus, SampleError> {
        let rss_kb = self.sampler.sample_kb()?;
        let now = self.clock.now();

        let Some(trigger) = self.evaluate(rss_kb, now) else {
            return Ok(TickStatus::Checked);
        };

        let running_jobs = serde_json::to_string(&self.registry.snapshot())
            .unwrap_or_else(|_| "{}".to_owned());
        warn!(
            component = COMPONENT,
            action = "escalate",
            reason = %trigger,
            running_jobs = %running_jobs,
            "memory limit exceeded; escalating"
        );
        SignalEscalator::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.signaller),
            Arc::clone(&self.clock),
            self.plan.clone(),
        )
        .escalate();
        Ok(TickStatus::Escalated)
    }

    /// Advances the state machine for one sample.
    fn evaluate(&mut self, rss_kb: u64, now: Instant) -> Option<EscalationTrigger> {
        if rss_kb > self.hard_limit_kb {
            self.state = EscalationState::Escalating;
            return Some(EscalationTrigger::HardLimitExceeded {
                rss_kb,
                limit_kb: self.hard_limit_kb,
            });
        }

        let soft_limit_kb = self.effective_soft_limit_kb(now);
        if rss_kb > soft_limit_kb {
            match self.state {
                EscalationState::SoftExceeded { breach_started } => {
                    let held = now.saturating_duration_since(breach_started);
                    if held > self.grace_balloon {
                        self.state = EscalationState::Escalating;
                        return Some(EscalationTrigger::SoftLimitExceeded {
                            rss_kb,
                            limit_kb: soft_limit_kb,
                            held,
                        });
                    }
                }
                EscalationState::Normal | EscalationState::Escalating => {
                    self.state = EscalationState::SoftExceeded { breach_started: now };
                    info!(
                        component = COMPONENT,
                        action = "soft_limit_exceeded",
                        rss_kb,
                        soft_limit_kb,
                        grace_balloon_secs = self.grace_balloon.as_secs(),
                        "soft limit exceeded; grace window started"
                    );
                }
            }
            return None;
        }

        if matches!(self.state, EscalationState::SoftExceeded { .. }) {
            info!(
                component = COMPONENT,
                action = "balloon_deflated",
                rss_kb,
                soft_limit_kb,
                "memory back under the soft limit; returning to normal"
            );
        }
        self.state = EscalationState::Normal;
        None
    }
}

/// Handle to a spawned watchdog thread.
#[derive(Debug)]
pub struct WatchdogHandle {
    stop_tx: SyncSender<()>,
    thread: JoinHandle<()>,
}

impl WatchdogHandle {
    /// Stops the daemon and joins its thread.
    pub fn stop(self) {
        let _ = self.stop_tx.try_send(());
        if self.thread.join().is_err() {
            warn!(component = COMPONENT, "watchdog thread panicked");
        }
    }

    /// Whether the daemon thread has exited (stopped or escalated).
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use nix::sys::signal::Signal;

    use memkill_core::clock::ManualClock;
    use memkill_core::registry::{JobId, JobRecord};

    use crate::signal::SignalScope;

    use super::*;

    struct ScriptedSampler {
        values: Mutex<VecDeque<u64>>,
    }

    impl ScriptedSampler {
        fn new(values: &[u64]) -> Self {
            Self {
                values: Mutex::new(values.iter().copied().collect()),
            }
        }
    }

    impl RssSampler for ScriptedSampler {
        fn sample_kb(&self) -> Result<u64, SampleError> {
            self.values
                .lock()
                .expect("sampler lock")
                .pop_front()
                .ok_or(SampleError::Parse {
                    path: "scripted".to_owned(),
                    reason: "script exhausted".to_owned(),
                })
        }
    }

    struct FailingSampler;

    impl RssSampler for FailingSampler {
        fn sample_kb(&self) -> Result<u64, SampleError> {
            Err(SampleError::Parse {
                path: "failing".to_owned(),
                reason: "always fails".to_owned(),
            })
        }
    }

    #[derive(Debug, Default)]
    struct RecordingSignaller {
        sent: Mutex<Vec<(SignalScope, Signal)>>,
    }

    impl RecordingSignaller {
        fn sent(&self) -> Vec<(SignalScope, Signal)> {
            self.sent.lock().expect("signaller lock").clone()
        }
    }

    impl ProcessSignaller for RecordingSignaller {
        fn pid(&self) -> i32 {
            12345
        }

        fn is_group_leader(&self) -> bool {
            true
        }

        fn send(&self, scope: SignalScope, signal: Signal) -> Result<(), SignalError> {
            self.sent.lock().expect("signaller lock").push((scope, signal));
            Ok(())
        }
    }

    struct Harness {
        watchdog: MemoryWatchdog,
        registry: Arc<JobRegistry>,
        signaller: Arc<RecordingSignaller>,
        clock: Arc<ManualClock>,
    }

    // soft 200 kB, hard 300 kB, grace balloon 5 s, escalation waits 1 s.
    fn harness(rss_script: &[u64], allowances: &[(&str, u64)]) -> Harness {
        let mut config = Config::from_toml(
            r#"
            [limits]
            soft_limit_kb = 200
            hard_limit_kb = 300

            [watchdog]
            check_interval_secs = 2
            grace_balloon_secs = 5

            [escalation]
            grace_time_secs = 1
            shutdown_wait_secs = 1
            kill_wait_secs = 1
            "#,
        )
        .expect("test config");

        for (worker, kb) in allowances {
            config.allowances.insert((*worker).to_owned(), *kb);
        }

        let registry = Arc::new(JobRegistry::new());
        let signaller = Arc::new(RecordingSignaller::default());
        let clock = Arc::new(ManualClock::new());
        let watchdog = MemoryWatchdog::new(&config, Arc::clone(&registry))
            .expect("watchdog")
            .with_sampler(Box::new(ScriptedSampler::new(rss_script)))
            .with_signaller(Arc::clone(&signaller) as Arc<dyn ProcessSignaller>)
            .with_clock(Arc::clone(&clock) as Arc<dyn Clock>);

        Harness {
            watchdog,
            registry,
            signaller,
            clock,
        }
    }

    /// Drives one tick and advances the clock by the check interval,
    /// mirroring the daemon loop's pacing.
    fn tick(h: &mut Harness) -> TickStatus {
        let status = h.watchdog.tick().expect("tick");
        h.clock.advance(Duration::from_secs(2));
        status
    }

    #[test]
    fn test_hard_limit_escalates_on_first_tick() {
        let mut h = harness(&[400], &[]);

        assert!(matches!(tick(&mut h), TickStatus::Escalated));
        assert_eq!(h.watchdog.state(), EscalationState::Escalating);
        assert_eq!(
            h.signaller.sent(),
            vec![
                (SignalScope::Process, Signal::SIGTSTP),
                (SignalScope::Process, Signal::SIGTERM),
                (SignalScope::Group, Signal::SIGKILL),
            ]
        );
    }

    #[test]
    fn test_hard_limit_bypasses_grace_even_mid_window() {
        let mut h = harness(&[250, 400], &[]);

        assert!(matches!(tick(&mut h), TickStatus::Checked));
        assert!(matches!(
            h.watchdog.state(),
            EscalationState::SoftExceeded { .. }
        ));

        assert!(matches!(tick(&mut h), TickStatus::Escalated));
        assert_eq!(h.signaller.sent().len(), 3);
    }

    #[test]
    fn test_soft_breach_escalates_only_after_grace_window() {
        // Sampled every 2 s with a 5 s balloon: breaches at t=0, 2, 4 stay
        // within grace; the t=6 sample has held the breach for 6 s > 5 s.
        let mut h = harness(&[250, 250, 250, 250], &[]);

        assert!(matches!(tick(&mut h), TickStatus::Checked));
        assert!(matches!(tick(&mut h), TickStatus::Checked));
        assert!(matches!(tick(&mut h), TickStatus::Checked));
        assert!(h.signaller.sent().is_empty());

        assert!(matches!(tick(&mut h), TickStatus::Escalated));
        assert_eq!(h.signaller.sent().len(), 3);
    }

    #[test]
    fn test_soft_breach_recovers_within_grace_window() {
        let mut h = harness(&[250, 100], &[]);

        assert!(matches!(tick(&mut h), TickStatus::Checked));
        assert!(matches!(tick(&mut h), TickStatus::Checked));

        assert_eq!(h.watchdog.state(), EscalationState::Normal);
        assert!(h.signaller.sent().is_empty());
    }

    #[test]
    fn test_recovery_resets_the_grace_window() {
        // Breach, recover, breach again: the second breach starts a fresh
        // window rather than inheriting the first breach's start time.
        let mut h = harness(&[250, 100, 250, 250], &[]);

        for _ in 0..4 {
            assert!(matches!(tick(&mut h), TickStatus::Checked));
        }
        assert!(matches!(
            h.watchdog.state(),
            EscalationState::SoftExceeded { .. }
        ));
        assert!(h.signaller.sent().is_empty());
    }

    #[test]
    fn test_whitelisted_allowances_raise_the_soft_limit() {
        let mut h = harness(&[250, 250], &[("ImportWorker", 60)]);
        let now = h.clock.now();
        h.registry.insert(
            JobId::from("jid-1"),
            JobRecord::new("ImportWorker", "imports", now),
        );

        // Effective soft limit is 200 + 60 = 260 kB; 250 kB stays normal.
        assert_eq!(h.watchdog.effective_soft_limit_kb(now), 260);
        assert!(matches!(tick(&mut h), TickStatus::Checked));
        assert_eq!(h.watchdog.state(), EscalationState::Normal);

        // Once the job finishes the headroom goes away.
        h.registry.remove(&JobId::from("jid-1"));
        assert!(matches!(tick(&mut h), TickStatus::Checked));
        assert!(matches!(
            h.watchdog.state(),
            EscalationState::SoftExceeded { .. }
        ));
    }

    #[test]
    fn test_two_whitelisted_jobs_both_count() {
        let h = harness(&[], &[("ImportWorker", 10)]);
        let now = h.clock.now();
        h.registry.insert(
            JobId::from("jid-1"),
            JobRecord::new("ImportWorker", "imports", now),
        );
        h.registry.insert(
            JobId::from("jid-2"),
            JobRecord::new("ImportWorker", "imports", now),
        );

        assert_eq!(h.watchdog.effective_soft_limit_kb(now), 220);
    }

    #[test]
    fn test_non_whitelisted_job_contributes_nothing() {
        let h = harness(&[], &[("ImportWorker", 60)]);
        let now = h.clock.now();
        h.registry.insert(
            JobId::from("jid-1"),
            JobRecord::new("MailWorker", "mail", now),
        );

        assert_eq!(h.watchdog.effective_soft_limit_kb(now), 200);
    }

    #[test]
    fn test_sampler_error_does_not_change_state() {
        let config = Config::from_toml(
            r#"
            [limits]
            soft_limit_kb = 200
            hard_limit_kb = 300
            "#,
        )
        .expect("test config");
        let registry = Arc::new(JobRegistry::new());
        let signaller = Arc::new(RecordingSignaller::default());
        let mut watchdog = MemoryWatchdog::new(&config, registry)
            .expect("watchdog")
            .with_sampler(Box::new(FailingSampler))
            .with_signaller(Arc::clone(&signaller) as Arc<dyn ProcessSignaller>);

        assert!(watchdog.tick().is_err());
        assert_eq!(watchdog.state(), EscalationState::Normal);
        assert!(signaller.sent().is_empty());
    }

    #[test]
    fn test_spawned_daemon_stops_on_handle() {
        let config = Config::default();
        let registry = Arc::new(JobRegistry::new());
        let watchdog = MemoryWatchdog::new(&config, registry)
            .expect("watchdog")
            .with_sampler(Box::new(ScriptedSampler::new(&[100; 1024])))
            .with_check_interval(Duration::from_millis(5));

        let handle = watchdog.spawn().expect("spawn");
        std::thread::sleep(Duration::from_millis(25));
        assert!(!handle.is_finished());
        handle.stop();
    }
}
