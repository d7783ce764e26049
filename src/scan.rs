//! Range scanning loop and CPU pinning.

use crate::bitmap::RangeBitmap;
use crate::sandbox::{ExecOutcome, NopHook, Sandbox, SandboxError};
use crate::util::stop_soon;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ScanStats {
    tested: AtomicU64,
    clean: AtomicU64,
    faulted: AtomicU64,
    timed_out: AtomicU64,
}

impl ScanStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn inc_tested(&self) {
        self.tested.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_clean(&self) {
        self.clean.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_faulted(&self) {
        self.faulted.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_timed_out(&self) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tested(&self) -> u64 {
        self.tested.load(Ordering::Relaxed)
    }

    pub fn report(&self) {
        log::info!(
            "tested {}, clean/faulted/timed-out {}/{}/{}",
            self.tested.load(Ordering::Relaxed),
            self.clean.load(Ordering::Relaxed),
            self.faulted.load(Ordering::Relaxed),
            self.timed_out.load(Ordering::Relaxed)
        );
    }
}

/// Run every opcode of `bitmap`'s range through the sandbox and mark the
/// outcomes. Returns `false` if a stop request cut the range short.
pub fn scan_range(
    sandbox: &mut Sandbox,
    bitmap: &mut RangeBitmap,
    stats: &ScanStats,
) -> Result<bool, SandboxError> {
    let mut hook = NopHook;
    for opcode in bitmap.start()..bitmap.end() {
        if stop_soon() {
            return Ok(false);
        }
        match sandbox.run(opcode, &mut hook)? {
            ExecOutcome::Clean => {
                bitmap.mark_exec(opcode);
                stats.inc_clean();
            }
            ExecOutcome::TimedOut => {
                bitmap.mark_timeout(opcode);
                stats.inc_timed_out();
            }
            ExecOutcome::Faulted(_) => stats.inc_faulted(),
        }
        stats.inc_tested();
    }
    Ok(true)
}

/// Pin the scanning thread to `core` and lock the address space, keeping
/// attempt timing stable enough for a microsecond watchdog.
pub fn pin_to_cpu(core: usize) -> nix::Result<()> {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::sys::mman::{mlockall, MlockAllFlags};
    use nix::unistd::Pid;

    let mut cpu_set = CpuSet::new();
    cpu_set.set(core)?;
    sched_setaffinity(Pid::from_raw(0), &cpu_set)?;
    mlockall(MlockAllFlags::MCL_CURRENT | MlockAllFlags::MCL_FUTURE)?;
    Ok(())
}
