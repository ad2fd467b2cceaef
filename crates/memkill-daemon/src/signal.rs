//! Process and process-group signalling.
//!
//! The escalator needs two distinct delivery scopes: the watched process
//! alone, and its entire process group. [`ProcessSignaller`] is the seam
//! between the escalation logic and the OS; [`SelfSignaller`] is the
//! production implementation targeting the current process via `nix`.

use nix::sys::signal::{self, Signal};
use nix::unistd;
use thiserror::Error;

/// Delivery scope for a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalScope {
    /// The watched process only.
    Process,
    /// The watched process's entire process group.
    Group,
}

impl SignalScope {
    /// Stable label for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Process => "process",
            Self::Group => "group",
        }
    }
}

/// Signalling errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SignalError {
    /// The configured signal name is not a known signal.
    #[error("unknown signal name '{name}'")]
    UnknownSignal {
        /// The name that failed to resolve.
        name: String,
    },

    /// The kernel rejected the signal.
    #[error("failed to send {signal} to {scope}: {source}")]
    SendFailed {
        /// Signal that failed to send.
        signal: &'static str,
        /// Scope it was aimed at.
        scope: &'static str,
        /// Underlying errno.
        #[source]
        source: nix::errno::Errno,
    },
}

/// Resolves a conventional `SIG*` name to a [`Signal`].
///
/// # Errors
///
/// Returns [`SignalError::UnknownSignal`] for names the platform does not
/// know.
pub fn parse_signal(name: &str) -> Result<Signal, SignalError> {
    Signal::iterator()
        .find(|signal| signal.as_str() == name)
        .ok_or_else(|| SignalError::UnknownSignal {
            name: name.to_owned(),
        })
}

/// Delivers signals on behalf of the escalator.
pub trait ProcessSignaller: Send + Sync {
    /// PID of the watched process, for logging.
    fn pid(&self) -> i32;

    /// Whether the watched process leads its process group. Queried once
    /// at escalation time to pick the forced-kill scope.
    fn is_group_leader(&self) -> bool;

    /// Sends `signal` to the given scope.
    ///
    /// # Errors
    ///
    /// Returns [`SignalError::SendFailed`] if the kernel rejects the send.
    fn send(&self, scope: SignalScope, signal: Signal) -> Result<(), SignalError>;
}

/// Signals the current process (the one the watchdog runs inside).
#[derive(Debug, Clone, Copy, Default)]
pub struct SelfSignaller;

impl ProcessSignaller for SelfSignaller {
    fn pid(&self) -> i32 {
        unistd::getpid().as_raw()
    }

    fn is_group_leader(&self) -> bool {
        unistd::getpgrp() == unistd::getpid()
    }

    fn send(&self, scope: SignalScope, sig: Signal) -> Result<(), SignalError> {
        let result = match scope {
            SignalScope::Process => signal::kill(unistd::getpid(), sig),
            SignalScope::Group => signal::killpg(unistd::getpgrp(), sig),
        };
        result.map_err(|source| SignalError::SendFailed {
            signal: sig.as_str(),
            scope: scope.as_str(),
            source,
        })
    }
}
