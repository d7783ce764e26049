//! Self-healing sandbox for executing arbitrary 32-bit opcodes.
//!
//! One [`Sandbox`] owns the guarded executable region, the watchdog timer
//! and the process-wide fault handlers. [`Sandbox::run`] patches the opcode
//! into the trampoline slot, establishes a `sigsetjmp` checkpoint, arms the
//! watchdog and calls into the region; a fault or watchdog expiry lands in
//! the signal handler, which `siglongjmp`s back so the next opcode can run
//! in the same process.

pub(crate) mod checkpoint;
pub mod region;
mod signals;
pub mod trampoline;
mod watchdog;

pub use signals::SignalError;
pub use watchdog::{Watchdog, WatchdogError};

use crate::sandbox::checkpoint::checkpoint_save;
use crate::sandbox::region::{InsnPage, RegionError};
use crate::sandbox::signals::EXEC_STATE;
use std::mem;
use std::time::Duration;
use thiserror::Error;

/// Default watchdog timeout, generous next to the cost of one instruction.
pub const DEFAULT_TIMEOUT_US: u64 = 200;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error(transparent)]
    Region(#[from] RegionError),
    #[error(transparent)]
    Signal(#[from] SignalError),
    #[error(transparent)]
    Watchdog(#[from] WatchdogError),
}

/// How one opcode attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    /// Ran to completion and returned through the trampoline epilogue.
    Clean,
    /// The watchdog had to interrupt it.
    TimedOut,
    /// Raised the contained fault signal.
    Faulted(i32),
}

impl ExecOutcome {
    pub fn is_clean(&self) -> bool {
        matches!(self, ExecOutcome::Clean)
    }

    pub fn signal_name(&self) -> Option<&'static str> {
        match *self {
            ExecOutcome::Faulted(sig) => {
                Some(signal_hook::low_level::signal_name(sig).unwrap_or("<unknown>"))
            }
            _ => None,
        }
    }
}

/// Instrumentation points around one attempt.
///
/// `pre` runs after the watchdog is armed, `post` before it is disarmed, so
/// a hook that hangs is interrupted like the opcode itself. `exec` defaults
/// to a plain call into the trampoline; hooks that need to bracket the
/// attempt tighter than pre/post (register capture) override it.
pub trait ExecHook {
    fn pre(&mut self) {}

    /// # Safety
    /// `entry` must point at the mapped trampoline; the override must call
    /// it at most once and must not unwind.
    unsafe fn exec(&mut self, entry: *const u8) {
        invoke(entry)
    }

    fn post(&mut self) {}
}

pub struct NopHook;

impl ExecHook for NopHook {}

/// Call the trampoline at `entry`.
///
/// # Safety
/// `entry` must be the entry point of a mapped, executable trampoline.
pub unsafe fn invoke(entry: *const u8) {
    let f: unsafe extern "C" fn() = mem::transmute(entry);
    f()
}

pub struct Sandbox {
    page: InsnPage,
    watchdog: Watchdog,
    timeout: Duration,
}

impl Sandbox {
    /// Set up handlers, region and watchdog on the calling thread. The
    /// watchdog targets this thread, so `run` must stay on it.
    pub fn new(timeout: Duration) -> Result<Self, SandboxError> {
        signals::install()?;
        let page = InsnPage::init()?;
        let watchdog = Watchdog::new()?;
        Ok(Sandbox {
            page,
            watchdog,
            timeout,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Execute one opcode under the given hook and classify the outcome.
    pub fn run(&mut self, opcode: u32, hook: &mut dyn ExecHook) -> Result<ExecOutcome, SandboxError> {
        let timeout = self.timeout;
        let mut slot = self.page.begin_write()?;
        slot.install(opcode.to_le_bytes());
        EXEC_STATE.begin_attempt();
        // The checkpoint lives in this frame; the handler jumps straight
        // back to the sigsetjmp below with a nonzero return.
        let resumed = unsafe { checkpoint_save!() };
        if resumed == 0 {
            self.watchdog.arm(timeout);
            hook.pre();
            unsafe { hook.exec(slot.entry()) };
            hook.post();
        }
        self.watchdog.disarm();
        let (signal, timed_out) = EXEC_STATE.finish_attempt();
        // Restore R+X before reporting.
        drop(slot);
        Ok(classify(signal, timed_out))
    }
}

fn classify(signal: i32, timed_out: bool) -> ExecOutcome {
    if signal == 0 {
        ExecOutcome::Clean
    } else if timed_out {
        ExecOutcome::TimedOut
    } else {
        ExecOutcome::Faulted(signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_outcomes() {
        assert_eq!(classify(0, false), ExecOutcome::Clean);
        assert_eq!(classify(libc::SIGILL, false), ExecOutcome::Faulted(libc::SIGILL));
        assert_eq!(classify(libc::SIGRTMIN(), true), ExecOutcome::TimedOut);
        // A fault that raced the watchdog still counts as a timeout.
        assert_eq!(classify(libc::SIGSEGV, true), ExecOutcome::TimedOut);
    }

    #[test]
    fn outcome_signal_names() {
        assert_eq!(ExecOutcome::Clean.signal_name(), None);
        assert_eq!(ExecOutcome::TimedOut.signal_name(), None);
        assert_eq!(ExecOutcome::Faulted(libc::SIGILL).signal_name(), Some("SIGILL"));
    }
}
