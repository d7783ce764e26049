//! In-process register snapshots.
//!
//! [`RegisterStates::capture`] stores the current general purpose registers
//! and arithmetic flags into the struct it is called on. It is an in-process
//! snapshot, so the register the compiler picks to hold the destination
//! pointer reads back as that pointer rather than its pre-call value; diffs
//! of two captures taken around a trampoline call are still meaningful
//! because the same register is polluted in both.

use crate::sandbox::{self, ExecHook};
use std::fmt;

#[cfg(target_arch = "x86_64")]
pub type Reg = u64;
#[cfg(target_arch = "aarch64")]
pub type Reg = u64;
#[cfg(target_arch = "arm")]
pub type Reg = u32;

#[cfg(target_arch = "x86_64")]
pub const GPR_COUNT: usize = 16;
#[cfg(target_arch = "aarch64")]
pub const GPR_COUNT: usize = 32;
#[cfg(target_arch = "arm")]
pub const GPR_COUNT: usize = 16;

#[cfg(target_arch = "x86_64")]
pub const REG_NAMES: [&str; GPR_COUNT] = [
    "rax", "rbx", "rcx", "rdx", "rsi", "rdi", "rbp", "rsp", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15",
];
#[cfg(target_arch = "aarch64")]
pub const REG_NAMES: [&str; GPR_COUNT] = [
    "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13",
    "x14", "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26",
    "x27", "x28", "x29", "x30", "sp",
];
#[cfg(target_arch = "arm")]
pub const REG_NAMES: [&str; GPR_COUNT] = [
    "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11", "r12", "sp",
    "lr", "pc",
];

#[cfg(target_arch = "x86_64")]
const FLAGS_NAME: &str = "rflags";
#[cfg(target_arch = "aarch64")]
const FLAGS_NAME: &str = "nzcv";
#[cfg(target_arch = "arm")]
const FLAGS_NAME: &str = "cpsr";

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisterStates {
    pub gpr: [Reg; GPR_COUNT],
    pub flags: Reg,
}

impl Default for RegisterStates {
    fn default() -> Self {
        RegisterStates {
            gpr: [0; GPR_COUNT],
            flags: 0,
        }
    }
}

impl RegisterStates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the current register file into `self`.
    #[cfg(target_arch = "x86_64")]
    #[inline(never)]
    pub fn capture(&mut self) {
        unsafe {
            std::arch::asm!(
                "mov [rdi + 0x00], rax",
                "mov [rdi + 0x08], rbx",
                "mov [rdi + 0x10], rcx",
                "mov [rdi + 0x18], rdx",
                "mov [rdi + 0x20], rsi",
                "mov [rdi + 0x28], rdi",
                "mov [rdi + 0x30], rbp",
                "mov [rdi + 0x38], rsp",
                "mov [rdi + 0x40], r8",
                "mov [rdi + 0x48], r9",
                "mov [rdi + 0x50], r10",
                "mov [rdi + 0x58], r11",
                "mov [rdi + 0x60], r12",
                "mov [rdi + 0x68], r13",
                "mov [rdi + 0x70], r14",
                "mov [rdi + 0x78], r15",
                "pushfq",
                "pop qword ptr [rdi + 0x80]",
                in("rdi") self as *mut Self,
            );
        }
    }

    #[cfg(target_arch = "aarch64")]
    #[inline(never)]
    pub fn capture(&mut self) {
        unsafe {
            std::arch::asm!(
                "stp x0, x1, [{ptr}]",
                "stp x2, x3, [{ptr}, #16]",
                "stp x4, x5, [{ptr}, #32]",
                "stp x6, x7, [{ptr}, #48]",
                "stp x8, x9, [{ptr}, #64]",
                "stp x10, x11, [{ptr}, #80]",
                "stp x12, x13, [{ptr}, #96]",
                "stp x14, x15, [{ptr}, #112]",
                "stp x16, x17, [{ptr}, #128]",
                "stp x18, x19, [{ptr}, #144]",
                "stp x20, x21, [{ptr}, #160]",
                "stp x22, x23, [{ptr}, #176]",
                "stp x24, x25, [{ptr}, #192]",
                "stp x26, x27, [{ptr}, #208]",
                "stp x28, x29, [{ptr}, #224]",
                "str x30, [{ptr}, #240]",
                "mov {tmp}, sp",
                "str {tmp}, [{ptr}, #248]",
                "mrs {tmp}, nzcv",
                "str {tmp}, [{ptr}, #256]",
                ptr = in(reg) self as *mut Self,
                tmp = out(reg) _,
            );
        }
    }

    #[cfg(target_arch = "arm")]
    #[inline(never)]
    pub fn capture(&mut self) {
        unsafe {
            std::arch::asm!(
                "stm {ptr}, {{r0-r12}}",
                "str sp, [{ptr}, #52]",
                "str lr, [{ptr}, #56]",
                "str pc, [{ptr}, #60]",
                "mrs {tmp}, cpsr",
                "str {tmp}, [{ptr}, #64]",
                ptr = in(reg) self as *mut Self,
                tmp = out(reg) _,
            );
        }
    }

    /// Registers whose value changed between `self` and `after`, as
    /// `(name, before, after)`.
    pub fn diff(&self, after: &RegisterStates) -> Vec<(&'static str, Reg, Reg)> {
        let mut changed = Vec::new();
        for (i, name) in REG_NAMES.iter().enumerate() {
            if self.gpr[i] != after.gpr[i] {
                changed.push((*name, self.gpr[i], after.gpr[i]));
            }
        }
        if self.flags != after.flags {
            changed.push((FLAGS_NAME, self.flags, after.flags));
        }
        changed
    }
}

impl fmt::Display for RegisterStates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, name) in REG_NAMES.iter().enumerate() {
            writeln!(f, "{:>6} = {:#018x}", name, self.gpr[i])?;
        }
        write!(f, "{:>6} = {:#018x}", FLAGS_NAME, self.flags)
    }
}

/// Hook that snapshots the register file immediately before and after the
/// trampoline call.
pub struct RegDiffHook {
    pub before: RegisterStates,
    pub after: RegisterStates,
}

impl RegDiffHook {
    pub fn new() -> Self {
        RegDiffHook {
            before: RegisterStates::new(),
            after: RegisterStates::new(),
        }
    }
}

impl Default for RegDiffHook {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecHook for RegDiffHook {
    unsafe fn exec(&mut self, entry: *const u8) {
        self.before.capture();
        sandbox::invoke(entry);
        self.after.capture();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_reports_changed_registers() {
        let a = RegisterStates::new();
        let mut b = RegisterStates::new();
        b.gpr[0] = 0xdead;
        b.flags = 1;
        let diff = a.diff(&b);
        assert_eq!(diff.len(), 2);
        assert_eq!(diff[0], (REG_NAMES[0], 0, 0xdead));
        assert_eq!(diff[1].0, FLAGS_NAME);
    }

    #[test]
    fn capture_fills_stack_pointer() {
        let mut regs = RegisterStates::new();
        regs.capture();
        let sp_idx = REG_NAMES.iter().position(|&n| n == "sp" || n == "rsp").unwrap();
        assert_ne!(regs.gpr[sp_idx], 0);
    }
}
