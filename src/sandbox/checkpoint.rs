//! The recovery checkpoint the fault handler jumps back to.
//!
//! `sigsetjmp` records the attempt loop's register state and signal mask;
//! the handler escapes a broken attempt with `siglongjmp`, which also
//! restores the mask so the next attempt starts with signals deliverable.
//!
//! `sigsetjmp` must execute in the stack frame that will still be live when
//! the jump happens, so it is exposed as a macro the sandbox expands
//! directly inside its attempt function, not as a wrapper call.

use std::cell::UnsafeCell;
use std::os::raw::c_int;

// Large enough for glibc/musl jmp_buf on every supported target.
#[repr(C, align(16))]
pub struct JmpBuf(pub [u64; 64]);

struct CheckpointCell(UnsafeCell<JmpBuf>);

// Single scanning thread by construction; see sandbox::Sandbox.
unsafe impl Sync for CheckpointCell {}

static CHECKPOINT: CheckpointCell = CheckpointCell(UnsafeCell::new(JmpBuf([0; 64])));

pub(crate) fn env() -> *mut JmpBuf {
    CHECKPOINT.0.get()
}

extern "C" {
    // glibc exports sigsetjmp under this name; the public symbol is a macro.
    #[link_name = "__sigsetjmp"]
    pub(crate) fn sigsetjmp(env: *mut JmpBuf, savemask: c_int) -> c_int;
    fn siglongjmp(env: *mut JmpBuf, val: c_int) -> !;
}

/// Expands to the raw `sigsetjmp` call, anchoring the checkpoint in the
/// caller's own frame. Returns 0 when the checkpoint is recorded and the
/// `restore` value when re-entered from the handler.
macro_rules! checkpoint_save {
    () => {
        crate::sandbox::checkpoint::sigsetjmp(crate::sandbox::checkpoint::env(), 1)
    };
}
pub(crate) use checkpoint_save;

/// Jump back to the checkpoint. Async-signal-safe; only meaningful after
/// `checkpoint_save!` has run in a still-live frame.
pub(crate) unsafe fn restore(val: c_int) -> ! {
    siglongjmp(env(), if val == 0 { 1 } else { val })
}
