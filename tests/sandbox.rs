//! End-to-end sandbox tests.
//!
//! Everything lives in one test function on purpose: the watchdog timer
//! delivers to the thread that created the sandbox, and the test harness
//! runs each `#[test]` on its own thread. One function, one thread, one
//! sandbox shared by all scenarios.

#![cfg(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "arm"))]

use opscan::bitmap::RangeBitmap;
use opscan::instrument::pmu::{CounterGroup, CounterHook, PmuResult};
use opscan::instrument::regs::RegDiffHook;
use opscan::sandbox::{ExecOutcome, NopHook, Sandbox};
use opscan::scan::{scan_range, ScanStats};
use std::time::Duration;

// Known-behavior opcodes as little-endian 32-bit slot values. MIXED_* is a
// contiguous range holding both clean and faulting encodings; MIXED_CLEAN
// lists the opcodes in it that must execute.
#[cfg(target_arch = "x86_64")]
mod insn {
    pub const NOP: u32 = 0x9090_9090; // nop x4
    pub const ILL: u32 = 0x9090_0B0F; // ud2
    pub const LOOP: u32 = 0x9090_FEEB; // jmp $
    pub const BAD_LOAD: u32 = 0x9090_008B; // mov eax, [rax] with rax = 0

    // cwde, cdq, far call (#UD in 64-bit mode), fwait.
    pub const MIXED_START: u32 = 0x9090_9098;
    pub const MIXED_END: u32 = 0x9090_909C;
    pub const MIXED_CLEAN: &[u32] = &[0x9090_9098, 0x9090_9099, 0x9090_909B];
}
#[cfg(target_arch = "aarch64")]
mod insn {
    pub const NOP: u32 = 0xD503_201F;
    pub const ILL: u32 = 0x0000_0000; // udf #0
    pub const LOOP: u32 = 0x1400_0000; // b .
    pub const BAD_LOAD: u32 = 0xF940_0000; // ldr x0, [x0] with x0 = 0

    // The hint space requires Rt == 0b11111; the neighbors of nop decode
    // into the unallocated part of that space and raise SIGILL.
    pub const MIXED_START: u32 = 0xD503_201E;
    pub const MIXED_END: u32 = 0xD503_2022;
    pub const MIXED_CLEAN: &[u32] = &[0xD503_201F];
}
#[cfg(target_arch = "arm")]
mod insn {
    pub const NOP: u32 = 0xE1A0_0000;
    pub const ILL: u32 = 0xE7F0_00F0; // udf
    pub const LOOP: u32 = 0xEAFF_FFFE; // b .
    pub const BAD_LOAD: u32 = 0xE590_0000; // ldr r0, [r0] with r0 = 0

    // ldr r0, [lr, #imm] faults (lr is zeroed); crossing the base-register
    // boundary turns it into ldr r0, [pc, #imm], a readable load from the
    // code page.
    pub const MIXED_START: u32 = 0xE59E_FFFE;
    pub const MIXED_END: u32 = 0xE59F_0002;
    pub const MIXED_CLEAN: &[u32] = &[0xE59F_0000, 0xE59F_0001];
}

#[test]
fn sandbox_survives_every_outcome() {
    let mut sandbox =
        Sandbox::new(Duration::from_micros(2000)).expect("sandbox setup failed");
    let mut hook = NopHook;

    // A benign opcode completes and the process is still here.
    assert_eq!(sandbox.run(insn::NOP, &mut hook).unwrap(), ExecOutcome::Clean);

    // An undefined encoding faults with SIGILL and execution recovers.
    match sandbox.run(insn::ILL, &mut hook).unwrap() {
        ExecOutcome::Faulted(sig) => assert_eq!(sig, libc::SIGILL),
        other => panic!("expected SIGILL fault, got {:?}", other),
    }
    assert_eq!(sandbox.run(insn::NOP, &mut hook).unwrap(), ExecOutcome::Clean);

    // A wild load through a zeroed register faults with SIGSEGV.
    match sandbox.run(insn::BAD_LOAD, &mut hook).unwrap() {
        ExecOutcome::Faulted(sig) => assert_eq!(sig, libc::SIGSEGV),
        other => panic!("expected SIGSEGV fault, got {:?}", other),
    }

    // An opcode that never retires is cut short by the watchdog, twice in
    // a row, and a clean opcode still works afterwards.
    assert_eq!(sandbox.run(insn::LOOP, &mut hook).unwrap(), ExecOutcome::TimedOut);
    assert_eq!(sandbox.run(insn::LOOP, &mut hook).unwrap(), ExecOutcome::TimedOut);
    assert_eq!(sandbox.run(insn::NOP, &mut hook).unwrap(), ExecOutcome::Clean);

    // Same opcode, same verdict.
    let first = sandbox.run(insn::ILL, &mut hook).unwrap();
    let second = sandbox.run(insn::ILL, &mut hook).unwrap();
    assert_eq!(first, second);

    scan_marks_bitmap(&mut sandbox);
    reg_hook_runs_through_protocol(&mut sandbox);
    counter_hook_runs_through_protocol(&mut sandbox);
}

fn scan_marks_bitmap(sandbox: &mut Sandbox) {
    let mut bitmap = RangeBitmap::new(insn::MIXED_START, insn::MIXED_END).unwrap();
    let stats = ScanStats::new();
    let completed = scan_range(sandbox, &mut bitmap, &stats).unwrap();
    assert!(completed);
    assert_eq!(stats.tested(), (insn::MIXED_END - insn::MIXED_START) as u64);
    // Exec bits set exactly where the encoding executes; faulting opcodes
    // leave both arrays untouched.
    for opcode in insn::MIXED_START..insn::MIXED_END {
        let clean = insn::MIXED_CLEAN.contains(&opcode);
        assert_eq!(bitmap.executed(opcode), clean, "exec bit of {:#010x}", opcode);
        assert!(!bitmap.timed_out(opcode), "timeout bit of {:#010x}", opcode);
    }
    // Out-of-range opcodes stay unmarked.
    assert!(!bitmap.executed(insn::MIXED_END));
    // Faults alone produce no timeout record.
    let (mut exec, mut timeout) = (Vec::new(), Vec::new());
    assert!(!bitmap.flush(&mut exec, &mut timeout).unwrap());
    assert!(timeout.is_empty());
    assert!(!exec.is_empty());
}

fn reg_hook_runs_through_protocol(sandbox: &mut Sandbox) {
    let mut hook = RegDiffHook::new();
    let outcome = sandbox.run(insn::NOP, &mut hook).unwrap();
    assert_eq!(outcome, ExecOutcome::Clean);
    // Both snapshots ran; a live thread has a nonzero stack pointer.
    let sp = opscan::instrument::regs::REG_NAMES
        .iter()
        .position(|&n| n == "sp" || n == "rsp")
        .unwrap();
    assert_ne!(hook.before.gpr[sp], 0);
    assert_ne!(hook.after.gpr[sp], 0);

    // A faulting opcode never reaches the post-exec snapshot.
    let mut hook = RegDiffHook::new();
    let outcome = sandbox.run(insn::ILL, &mut hook).unwrap();
    assert!(!outcome.is_clean());
    assert_eq!(hook.after.gpr[sp], 0);
}

struct ScriptedCounters {
    readings: Vec<PmuResult>,
    enables: usize,
    disables: usize,
}

impl CounterGroup for ScriptedCounters {
    fn reset(&mut self) {}
    fn enable(&mut self) {
        self.enables += 1;
    }
    fn disable(&mut self) {
        self.disables += 1;
    }
    fn read(&mut self) -> PmuResult {
        self.readings.remove(0)
    }
}

fn counter_hook_runs_through_protocol(sandbox: &mut Sandbox) {
    let mut counters = ScriptedCounters {
        readings: vec![
            PmuResult { ld_count: 100, st_count: 40 },
            PmuResult { ld_count: 103, st_count: 41 },
        ],
        enables: 0,
        disables: 0,
    };
    let outcome = {
        let mut hook = CounterHook::new(&mut counters);
        let outcome = sandbox.run(insn::NOP, &mut hook).unwrap();
        assert_eq!(hook.result, PmuResult { ld_count: 3, st_count: 1 });
        outcome
    };
    assert_eq!(outcome, ExecOutcome::Clean);
    assert_eq!(counters.enables, 1);
    assert_eq!(counters.disables, 1);
}
