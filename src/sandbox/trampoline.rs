//! Hand-assembled execution trampolines.
//!
//! A trampoline is a flat machine-code blob with a 4-byte instruction slot
//! in the middle. The prologue saves the callee-saved state, stashes the
//! stack pointer in a caller-saved FP/SIMD register and zeroes every general
//! purpose register plus the arithmetic flags, so each opcode under test runs
//! from the same machine state. The epilogue undoes all of it and returns.

/// Width of the patchable slot. All supported encodings are rewritten as one
/// little-endian 32-bit word (four one-byte nops on x86_64).
pub const INSN_SLOT_LEN: usize = 4;

pub struct Trampoline {
    pub code: Vec<u8>,
    pub slot_offset: usize,
}

#[cfg(target_arch = "aarch64")]
pub fn native() -> Trampoline {
    // Slot starts after 6 stp + 2 sp-stash + 31 movz + 1 msr words.
    let mut words: Vec<u32> = vec![
        0xA9BF_7BFD, // stp x29, x30, [sp, #-16]!
        0xA9BF_73FB, // stp x27, x28, [sp, #-16]!
        0xA9BF_6BF9, // stp x25, x26, [sp, #-16]!
        0xA9BF_63F7, // stp x23, x24, [sp, #-16]!
        0xA9BF_5BF5, // stp x21, x22, [sp, #-16]!
        0xA9BF_53F3, // stp x19, x20, [sp, #-16]!
        0x9100_03E9, // mov x9, sp
        0x9E67_013F, // fmov d31, x9
    ];
    // movz x0..x30, #0
    words.extend((0..31).map(|n| 0xD280_0000 | n));
    let slot = words.len() + 1;
    words.extend([
        0xD51B_421F, // msr nzcv, xzr
        0xD503_201F, // slot: nop
        0x9E66_03E9, // fmov x9, d31
        0x9100_013F, // mov sp, x9
        0xA8C1_53F3, // ldp x19, x20, [sp], #16
        0xA8C1_5BF5, // ldp x21, x22, [sp], #16
        0xA8C1_63F7, // ldp x23, x24, [sp], #16
        0xA8C1_6BF9, // ldp x25, x26, [sp], #16
        0xA8C1_73FB, // ldp x27, x28, [sp], #16
        0xA8C1_7BFD, // ldp x29, x30, [sp], #16
        0xD65F_03C0, // ret
    ]);
    Trampoline {
        code: words.iter().flat_map(|w| w.to_le_bytes()).collect(),
        slot_offset: slot * 4,
    }
}

#[cfg(target_arch = "arm")]
pub fn native() -> Trampoline {
    let mut words: Vec<u32> = vec![
        0xE92D_5FFF, // push {r0-r12, lr}
        0xEE00_DA10, // vmov s0, sp
    ];
    // mov r0..r12, #0
    words.extend((0..13).map(|n| 0xE3A0_0000 | (n << 12)));
    words.push(0xE3A0_E000); // mov lr, #0
    words.push(0xE3A0_D000); // mov sp, #0
    let slot = words.len() + 1;
    words.extend([
        0xE328_F000, // msr cpsr_f, #0
        0xE1A0_0000, // slot: nop (mov r0, r0)
        0xEE10_DA10, // vmov sp, s0
        0xE8BD_5FFF, // pop {r0-r12, lr}
        0xE12F_FF1E, // bx lr
    ]);
    Trampoline {
        code: words.iter().flat_map(|w| w.to_le_bytes()).collect(),
        slot_offset: slot * 4,
    }
}

#[cfg(target_arch = "x86_64")]
pub fn native() -> Trampoline {
    let mut code: Vec<u8> = vec![
        0x53, // push rbx
        0x55, // push rbp
        0x41, 0x54, // push r12
        0x41, 0x55, // push r13
        0x41, 0x56, // push r14
        0x41, 0x57, // push r15
        0x66, 0x4C, 0x0F, 0x6E, 0xFC, // movq xmm15, rsp
        0x31, 0xC0, // xor eax, eax
        0x31, 0xDB, // xor ebx, ebx
        0x31, 0xC9, // xor ecx, ecx
        0x31, 0xD2, // xor edx, edx
        0x31, 0xF6, // xor esi, esi
        0x31, 0xFF, // xor edi, edi
        0x31, 0xED, // xor ebp, ebp
        0x45, 0x31, 0xC0, // xor r8d, r8d
        0x45, 0x31, 0xC9, // xor r9d, r9d
        0x45, 0x31, 0xD2, // xor r10d, r10d
        0x45, 0x31, 0xDB, // xor r11d, r11d
        0x45, 0x31, 0xE4, // xor r12d, r12d
        0x45, 0x31, 0xED, // xor r13d, r13d
        0x45, 0x31, 0xF6, // xor r14d, r14d
        0x45, 0x31, 0xFF, // xor r15d, r15d
        0x31, 0xE4, // xor esp, esp (also clears the status flags)
    ];
    let slot = code.len();
    code.extend([
        0x90, 0x90, 0x90, 0x90, // slot: nop nop nop nop
        0x66, 0x4C, 0x0F, 0x7E, 0xFC, // movq rsp, xmm15
        0x41, 0x5F, // pop r15
        0x41, 0x5E, // pop r14
        0x41, 0x5D, // pop r13
        0x41, 0x5C, // pop r12
        0x5D, // pop rbp
        0x5B, // pop rbx
        0xC3, // ret
    ]);
    Trampoline {
        code,
        slot_offset: slot,
    }
}

#[cfg(not(any(target_arch = "aarch64", target_arch = "arm", target_arch = "x86_64")))]
compile_error!("no trampoline for this target architecture");

/// Make instruction fetch see freshly written code in `[start, start+len)`.
///
/// Harvard-style caches on the Arm targets need explicit maintenance; x86_64
/// keeps its instruction cache coherent with stores.
pub unsafe fn flush_icache(start: *const u8, len: usize) {
    #[cfg(target_arch = "aarch64")]
    {
        let ctr: u64;
        std::arch::asm!("mrs {}, ctr_el0", out(reg) ctr);
        let dline = 4usize << ((ctr >> 16) & 0xF);
        let iline = 4usize << (ctr & 0xF);
        let begin = start as usize;
        let end = begin + len;
        let mut addr = begin & !(dline - 1);
        while addr < end {
            std::arch::asm!("dc cvau, {}", in(reg) addr);
            addr += dline;
        }
        std::arch::asm!("dsb ish");
        let mut addr = begin & !(iline - 1);
        while addr < end {
            std::arch::asm!("ic ivau, {}", in(reg) addr);
            addr += iline;
        }
        std::arch::asm!("dsb ish", "isb");
    }
    #[cfg(target_arch = "arm")]
    {
        // __ARM_NR_cacheflush
        libc::syscall(0x0f0002, start as usize, start as usize + len, 0usize);
    }
    #[cfg(target_arch = "x86_64")]
    {
        let _ = (start, len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_inside_blob() {
        let t = native();
        assert!(t.slot_offset + INSN_SLOT_LEN < t.code.len());
        assert_eq!(t.slot_offset % 4, 0);
    }

    #[test]
    fn slot_holds_nop() {
        let t = native();
        let slot = &t.code[t.slot_offset..t.slot_offset + INSN_SLOT_LEN];
        #[cfg(target_arch = "aarch64")]
        assert_eq!(slot, &0xD503_201Fu32.to_le_bytes());
        #[cfg(target_arch = "arm")]
        assert_eq!(slot, &0xE1A0_0000u32.to_le_bytes());
        #[cfg(target_arch = "x86_64")]
        assert_eq!(slot, &[0x90; 4]);
    }
}
