//! Signal escalation sequence.
//!
//! Once the watchdog decides the process must go, the escalator walks a
//! strict three-step sequence:
//!
//! 1. stop-intake signal to the process, then poll the job registry until
//!    it drains or the grace window elapses
//! 2. graceful-shutdown signal, same drain polling over the shutdown window
//! 3. forced kill after an unconditional wait, delivered to the whole
//!    process group when the process leads it, to the process alone
//!    otherwise
//!
//! Drain polling exits early only on an empty registry and never extends
//! past its deadline. A step whose signal fails to send is logged and the
//! sequence continues; the forced kill always executes.

use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use tracing::{info, warn};

use memkill_core::clock::Clock;
use memkill_core::config::EscalationConfig;
use memkill_core::registry::JobRegistry;

use crate::signal::{ProcessSignaller, SignalError, SignalScope, parse_signal};

const COMPONENT: &str = "signal_escalator";

/// Interval between registry polls while waiting for drain.
pub const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Why the stop-intake signal is sent.
pub const STOP_INTAKE_REASON: &str = "stop fetching new jobs";

/// Why the graceful-shutdown signal is sent.
pub const GRACEFUL_SHUTDOWN_REASON: &str = "gracefully shut down";

/// Why the forced kill is sent.
pub const FORCE_KILL_REASON: &str = "die";

/// Resolved escalation sequence: three signals and their wait windows.
#[derive(Debug, Clone)]
pub struct EscalationPlan {
    /// Drain window after the stop-intake signal.
    pub grace_time: Duration,
    /// Stop-intake signal.
    pub stop_signal: Signal,
    /// Drain window after the graceful-shutdown signal.
    pub shutdown_wait: Duration,
    /// Graceful-shutdown signal.
    pub term_signal: Signal,
    /// Unconditional wait before the forced kill.
    pub kill_wait: Duration,
    /// Forced-kill signal.
    pub kill_signal: Signal,
}

impl EscalationPlan {
    /// Resolves the configured signal names into a plan.
    ///
    /// # Errors
    ///
    /// Returns [`SignalError::UnknownSignal`] if a configured name does not
    /// resolve on this platform.
    pub fn from_config(config: &EscalationConfig) -> Result<Self, SignalError> {
        Ok(Self {
            grace_time: config.grace_time(),
            stop_signal: parse_signal(&config.stop_signal)?,
            shutdown_wait: config.shutdown_wait(),
            term_signal: parse_signal(&config.term_signal)?,
            kill_wait: config.kill_wait(),
            kill_signal: parse_signal(&config.kill_signal)?,
        })
    }
}

/// Executes the escalation sequence against a signaller.
pub struct SignalEscalator {
    registry: Arc<JobRegistry>,
    signaller: Arc<dyn ProcessSignaller>,
    clock: Arc<dyn Clock>,
    plan: EscalationPlan,
}

impl SignalEscalator {
    /// Creates an escalator over `registry`, delivering via `signaller`.
    pub fn new(
        registry: Arc<JobRegistry>,
        signaller: Arc<dyn ProcessSignaller>,
        clock: Arc<dyn Clock>,
        plan: EscalationPlan,
    ) -> Self {
        Self {
            registry,
            signaller,
            clock,
            plan,
        }
    }

    /// Runs the three escalation steps strictly in order.
    pub fn escalate(&self) {
        self.signal_and_wait(self.plan.grace_time, self.plan.stop_signal, STOP_INTAKE_REASON);
        self.signal_and_wait(
            self.plan.shutdown_wait,
            self.plan.term_signal,
            GRACEFUL_SHUTDOWN_REASON,
        );
        self.force_kill(self.plan.kill_wait, self.plan.kill_signal, FORCE_KILL_REASON);
    }

    /// Sends `sig` to the process, then polls the registry until it drains
    /// or `wait` elapses.
    fn signal_and_wait(&self, wait: Duration, sig: Signal, reason: &str) {
        warn!(
            component = COMPONENT,
            action = "signal",
            signal = sig.as_str(),
            scope = SignalScope::Process.as_str(),
            pid = self.signaller.pid(),
            reason,
            wait_secs = wait.as_secs(),
            "sending signal and waiting for running jobs to finish"
        );
        if let Err(error) = self.signaller.send(SignalScope::Process, sig) {
            warn!(
                component = COMPONENT,
                error = %error,
                "signal delivery failed; escalation continues"
            );
        }

        let deadline = self.clock.now() + wait;
        loop {
            if self.registry.is_empty() {
                info!(
                    component = COMPONENT,
                    action = "drained",
                    signal = sig.as_str(),
                    "all running jobs finished"
                );
                return;
            }
            let now = self.clock.now();
            if now >= deadline {
                break;
            }
            self.clock.sleep(WAIT_POLL_INTERVAL.min(deadline - now));
        }

        warn!(
            component = COMPONENT,
            action = "deadline_exceeded",
            signal = sig.as_str(),
            running_jobs = self.registry.len(),
            "jobs still running after wait window"
        );
    }

    /// Waits `wait` unconditionally, then delivers the forced kill to the
    /// scope picked from a single group-leadership query.
    fn force_kill(&self, wait: Duration, sig: Signal, reason: &str) {
        let scope = if self.signaller.is_group_leader() {
            SignalScope::Group
        } else {
            SignalScope::Process
        };

        warn!(
            component = COMPONENT,
            action = "force_kill_wait",
            signal = sig.as_str(),
            scope = scope.as_str(),
            wait_secs = wait.as_secs(),
            "waiting unconditionally before forced kill"
        );
        self.clock.sleep(wait);

        warn!(
            component = COMPONENT,
            action = "signal",
            signal = sig.as_str(),
            scope = scope.as_str(),
            pid = self.signaller.pid(),
            reason,
            "sending forced kill"
        );
        if let Err(error) = self.signaller.send(scope, sig) {
            warn!(
                component = COMPONENT,
                error = %error,
                "forced kill delivery failed"
            );
        }
    }
}
