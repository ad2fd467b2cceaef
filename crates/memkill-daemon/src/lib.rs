//! Memory watchdog daemon for worker pools.
//!
//! Runs an independent thread inside (or alongside) a worker process that
//! periodically samples resident memory, adjusts the soft limit by the
//! declared allowances of whitelisted running jobs, and escalates through a
//! configurable signal sequence when limits are breached:
//!
//! 1. stop-intake signal, then wait for the job registry to drain
//! 2. graceful-shutdown signal, same drain polling
//! 3. forced kill to the whole process group (or the process alone when not
//!    group leader) after an unconditional wait
//!
//! The hard limit escalates immediately; the soft limit only after a
//! sustained breach outlasting the configured grace-balloon window. The
//! process is expected to be restarted by a supervisor after escalation.
//!
//! Job tracking, cancellation and configuration live in `memkill-core`.

pub mod allowance;
pub mod escalator;
pub mod sampler;
pub mod signal;
pub mod watchdog;

pub use allowance::{AllowancePolicy, FullAllowance, LinearGrowth, WorkerAllowances};
pub use escalator::{EscalationPlan, SignalEscalator};
pub use sampler::{ProcStatusSampler, RssSampler, SampleError};
pub use signal::{ProcessSignaller, SelfSignaller, SignalError, SignalScope, parse_signal};
pub use watchdog::{EscalationState, EscalationTrigger, MemoryWatchdog, WatchdogHandle};
