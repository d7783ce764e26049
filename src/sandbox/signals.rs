//! Fault handling for sandboxed execution.
//!
//! One handler serves every fault and timer signal. Handlers run on a
//! dedicated alternate stack because a scrambled or zeroed stack pointer is
//! an expected outcome of executing arbitrary opcodes. The handler only
//! touches the static attempt state and `siglongjmp`s back to the
//! checkpoint; anything that allocates or locks is off limits there.

use crate::sandbox::checkpoint;
use std::io;
use std::mem;
use std::os::raw::c_int;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use thiserror::Error;

const SIG_STACK_SIZE: usize = 64 * 1024;

static mut SIG_STACK: [u8; SIG_STACK_SIZE] = [0; SIG_STACK_SIZE];

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("failed to install alternate signal stack: {0}")]
    AltStack(io::Error),
    #[error("failed to install handler for signal {0}: {1}")]
    Handler(c_int, io::Error),
}

/// Shared state between the attempt loop and the signal handler.
pub(crate) struct ExecState {
    executing: AtomicBool,
    last_signal: AtomicI32,
    timed_out: AtomicBool,
}

pub(crate) static EXEC_STATE: ExecState = ExecState {
    executing: AtomicBool::new(false),
    last_signal: AtomicI32::new(0),
    timed_out: AtomicBool::new(false),
};

impl ExecState {
    /// Reset per-attempt flags, then open the execution window.
    pub(crate) fn begin_attempt(&self) {
        self.last_signal.store(0, Ordering::SeqCst);
        self.timed_out.store(false, Ordering::SeqCst);
        self.executing.store(true, Ordering::SeqCst);
    }

    /// Close the window and report `(last_signal, timed_out)` for the
    /// attempt that just ended.
    pub(crate) fn finish_attempt(&self) -> (c_int, bool) {
        self.executing.store(false, Ordering::SeqCst);
        (
            self.last_signal.load(Ordering::SeqCst),
            self.timed_out.load(Ordering::SeqCst),
        )
    }
}

/// The real-time signal the watchdog timer delivers.
pub(crate) fn watchdog_signal() -> c_int {
    libc::SIGRTMIN()
}

/// Fault and timer signals routed through the recovery handler.
fn monitored_signals() -> [c_int; 7] {
    [
        libc::SIGILL,
        libc::SIGSEGV,
        libc::SIGBUS,
        libc::SIGFPE,
        libc::SIGTRAP,
        libc::SIGVTALRM,
        watchdog_signal(),
    ]
}

extern "C" fn on_fault(sig: c_int, _info: *mut libc::siginfo_t, _ctx: *mut libc::c_void) {
    EXEC_STATE.last_signal.store(sig, Ordering::SeqCst);
    if !EXEC_STATE.executing.load(Ordering::SeqCst) {
        // A fault in our own code, not in the slot. The checkpoint is not
        // valid, so report on raw fd 2 and bail out of the process.
        let name = signal_hook::low_level::signal_name(sig).unwrap_or("<unknown>");
        unsafe {
            let msg = b"fatal signal outside sandboxed execution: ";
            libc::write(2, msg.as_ptr() as *const _, msg.len());
            libc::write(2, name.as_ptr() as *const _, name.len());
            libc::write(2, b"\n".as_ptr() as *const _, 1);
            libc::_exit(1);
        }
    }
    if sig == watchdog_signal() || sig == libc::SIGVTALRM {
        EXEC_STATE.timed_out.store(true, Ordering::SeqCst);
    }
    unsafe { checkpoint::restore(sig) }
}

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Install the alternate stack and the recovery handler for every monitored
/// signal. Idempotent.
pub(crate) fn install() -> Result<(), SignalError> {
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }
    unsafe {
        let ss = libc::stack_t {
            ss_sp: SIG_STACK.as_mut_ptr() as *mut libc::c_void,
            ss_flags: 0,
            ss_size: SIG_STACK_SIZE,
        };
        if libc::sigaltstack(&ss, ptr::null_mut()) != 0 {
            return Err(SignalError::AltStack(io::Error::last_os_error()));
        }
        let handler: extern "C" fn(c_int, *mut libc::siginfo_t, *mut libc::c_void) = on_fault;
        for &sig in &monitored_signals() {
            let mut sa: libc::sigaction = mem::zeroed();
            sa.sa_sigaction = handler as usize;
            sa.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
            if sig == watchdog_signal() || sig == libc::SIGVTALRM {
                sa.sa_flags |= libc::SA_NODEFER;
            }
            libc::sigemptyset(&mut sa.sa_mask);
            if libc::sigaction(sig, &sa, ptr::null_mut()) != 0 {
                return Err(SignalError::Handler(sig, io::Error::last_os_error()));
            }
        }
    }
    Ok(())
}
