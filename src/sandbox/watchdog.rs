//! Microsecond watchdog for runaway opcodes.
//!
//! A POSIX per-process timer on `CLOCK_MONOTONIC`, created once and armed
//! as a one-shot before every attempt. `SIGEV_THREAD_ID` pins delivery to
//! the scanning thread itself, so the recovery handler runs on the thread
//! whose checkpoint it jumps back to.

use crate::sandbox::signals;
use std::io;
use std::mem;
use std::ptr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("failed to create watchdog timer: {0}")]
pub struct WatchdogError(io::Error);

pub struct Watchdog {
    timer: libc::timer_t,
}

impl Watchdog {
    /// Create the timer, targeting the calling thread. Must be called on
    /// the thread that will run the attempts.
    pub fn new() -> Result<Self, WatchdogError> {
        unsafe {
            let tid = libc::syscall(libc::SYS_gettid) as libc::c_int;
            let mut sev: libc::sigevent = mem::zeroed();
            sev.sigev_notify = libc::SIGEV_THREAD_ID;
            sev.sigev_signo = signals::watchdog_signal();
            sev.sigev_notify_thread_id = tid;
            let mut timer: libc::timer_t = mem::zeroed();
            if libc::timer_create(libc::CLOCK_MONOTONIC, &mut sev, &mut timer) != 0 {
                return Err(WatchdogError(io::Error::last_os_error()));
            }
            Ok(Watchdog { timer })
        }
    }

    /// Arm a one-shot expiry `timeout` from now. Re-arming before expiry
    /// replaces the previous deadline.
    pub fn arm(&self, timeout: Duration) {
        self.settime(timeout);
    }

    /// Cancel any pending expiry. An expiry that already fired leaves its
    /// signal in flight; the handler's timed-out marking covers that race.
    pub fn disarm(&self) {
        self.settime(Duration::from_secs(0));
    }

    fn settime(&self, timeout: Duration) {
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: timeout.as_secs() as libc::time_t,
                tv_nsec: timeout.subsec_nanos() as libc::c_long,
            },
        };
        // Cannot fail for a valid timer with a valid spec.
        unsafe {
            libc::timer_settime(self.timer, 0, &spec, ptr::null_mut());
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        unsafe {
            libc::timer_delete(self.timer);
        }
    }
}
