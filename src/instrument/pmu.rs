//! Load/store counting via the CPU performance monitoring unit.
//!
//! Two raw hardware events, architecturally LD_RETIRED and ST_RETIRED on
//! Arm PMUv3 cores, counted around a single trampoline call. perf may be
//! unavailable (no PMU driver, paranoid sysctl, wrong raw type for the
//! core); counter setup therefore degrades to warnings and zero readings
//! instead of failing the probe.

use crate::sandbox::ExecHook;
use std::fmt;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;

// Raw PMU event numbers: memory-read and memory-write instructions retired.
const EV_LD_RETIRED: u64 = 0x0006;
const EV_ST_RETIRED: u64 = 0x0007;
// perf event type id of the first dynamically registered PMU.
const PERF_TYPE_RAW_PMU: u32 = 8;

// _IO('$', 0..3)
const PERF_EVENT_IOC_ENABLE: libc::c_ulong = 0x2400;
const PERF_EVENT_IOC_DISABLE: libc::c_ulong = 0x2401;
const PERF_EVENT_IOC_RESET: libc::c_ulong = 0x2403;

const ATTR_DISABLED: u64 = 1 << 0;
const ATTR_PINNED: u64 = 1 << 2;
const ATTR_EXCLUDE_KERNEL: u64 = 1 << 5;
const ATTR_EXCLUDE_HV: u64 = 1 << 6;

// perf_event_attr, PERF_ATTR_SIZE_VER7 layout with everything past the
// flag word zeroed.
#[repr(C)]
struct PerfEventAttr {
    type_: u32,
    size: u32,
    config: u64,
    sample_period: u64,
    sample_type: u64,
    read_format: u64,
    flags: u64,
    _reserved: [u64; 10],
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PmuResult {
    pub ld_count: u64,
    pub st_count: u64,
}

impl fmt::Display for PmuResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loads: {}, stores: {}", self.ld_count, self.st_count)
    }
}

/// Counter control surface, split out so the hook protocol can be tested
/// without PMU hardware.
pub trait CounterGroup {
    fn reset(&mut self);
    fn enable(&mut self);
    fn disable(&mut self);
    fn read(&mut self) -> PmuResult;
}

pub struct PmuCounters {
    ld_fd: RawFd,
    st_fd: RawFd,
}

/// Open the load and store counters for the calling thread. Failures are
/// logged and leave the corresponding counter reading as zero.
pub fn init_memory_monitor() -> PmuCounters {
    let ld_fd = match open_counter(EV_LD_RETIRED) {
        Ok(fd) => fd,
        Err(e) => {
            log::warn!("load counter unavailable: {}", e);
            -1
        }
    };
    let st_fd = match open_counter(EV_ST_RETIRED) {
        Ok(fd) => fd,
        Err(e) => {
            log::warn!("store counter unavailable: {}", e);
            -1
        }
    };
    PmuCounters { ld_fd, st_fd }
}

fn open_counter(config: u64) -> io::Result<RawFd> {
    let mut attr: PerfEventAttr = unsafe { mem::zeroed() };
    attr.type_ = PERF_TYPE_RAW_PMU;
    attr.size = mem::size_of::<PerfEventAttr>() as u32;
    attr.config = config;
    attr.flags = ATTR_DISABLED | ATTR_PINNED | ATTR_EXCLUDE_KERNEL | ATTR_EXCLUDE_HV;
    let fd = unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            &attr as *const PerfEventAttr,
            0,  // this thread
            -1, // any cpu
            -1, // no group
            0,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd as RawFd)
}

impl PmuCounters {
    pub fn available(&self) -> bool {
        self.ld_fd >= 0 || self.st_fd >= 0
    }

    fn each_fd(&self, req: libc::c_ulong) {
        for &fd in &[self.ld_fd, self.st_fd] {
            if fd >= 0 {
                unsafe {
                    libc::ioctl(fd, req, 0);
                }
            }
        }
    }

    fn read_fd(fd: RawFd) -> u64 {
        if fd < 0 {
            return 0;
        }
        let mut buf = [0u8; 8];
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n == 8 {
            u64::from_ne_bytes(buf)
        } else {
            0
        }
    }
}

impl CounterGroup for PmuCounters {
    fn reset(&mut self) {
        self.each_fd(PERF_EVENT_IOC_RESET);
    }

    fn enable(&mut self) {
        self.each_fd(PERF_EVENT_IOC_ENABLE);
    }

    fn disable(&mut self) {
        self.each_fd(PERF_EVENT_IOC_DISABLE);
    }

    fn read(&mut self) -> PmuResult {
        PmuResult {
            ld_count: Self::read_fd(self.ld_fd),
            st_count: Self::read_fd(self.st_fd),
        }
    }
}

impl Drop for PmuCounters {
    fn drop(&mut self) {
        for &fd in &[self.ld_fd, self.st_fd] {
            if fd >= 0 {
                unsafe {
                    libc::close(fd);
                }
            }
        }
    }
}

/// Hook that brackets one attempt with counter reads and reports the delta.
pub struct CounterHook<'a, C> {
    counters: &'a mut C,
    base: PmuResult,
    pub result: PmuResult,
}

impl<'a, C: CounterGroup> CounterHook<'a, C> {
    pub fn new(counters: &'a mut C) -> Self {
        CounterHook {
            counters,
            base: PmuResult::default(),
            result: PmuResult::default(),
        }
    }
}

impl<C: CounterGroup> ExecHook for CounterHook<'_, C> {
    fn pre(&mut self) {
        self.counters.reset();
        self.counters.enable();
        self.base = self.counters.read();
    }

    fn post(&mut self) {
        self.counters.disable();
        let end = self.counters.read();
        self.result = PmuResult {
            ld_count: end.ld_count.saturating_sub(self.base.ld_count),
            st_count: end.st_count.saturating_sub(self.base.st_count),
        };
    }
}
