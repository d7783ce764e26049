//! The executable region the opcodes run in.
//!
//! Layout is three anonymous pages: an inaccessible guard page, the code
//! page holding the trampoline, and a second guard page. Runaway control
//! flow that walks off either end of the code page faults immediately
//! instead of executing whatever happens to be adjacent.
//!
//! The code page is kept `R+X` between attempts; [`InsnPage::begin_write`]
//! raises it to `RWX` just long enough to patch the slot and the returned
//! guard drops it back on scope exit.

use crate::sandbox::trampoline::{self, Trampoline, INSN_SLOT_LEN};
use nix::sys::mman::{mmap, mprotect, munmap, MapFlags, ProtFlags};
use std::ptr;
use thiserror::Error;

lazy_static! {
    pub static ref PAGE_SIZE: usize = page_size();
}

fn page_size() -> usize {
    use nix::unistd::{sysconf, SysconfVar};
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(sz)) if sz > 0 => sz as usize,
        _ => 4096,
    }
}

#[derive(Debug, Error)]
pub enum RegionError {
    #[error("failed to map sandbox region: {0}")]
    Map(nix::Error),
    #[error("failed to change code page protection: {0}")]
    Protect(nix::Error),
    #[error("trampoline does not fit in one page ({len} > {page})")]
    TrampolineTooLarge { len: usize, page: usize },
}

pub struct InsnPage {
    base: *mut u8,
    code: *mut u8,
    slot_offset: usize,
}

// The raw pointers refer to a private anonymous mapping owned by this value.
unsafe impl Send for InsnPage {}

impl InsnPage {
    /// Map the guarded region and install the trampoline on the code page.
    pub fn init() -> Result<Self, RegionError> {
        let page = *PAGE_SIZE;
        let Trampoline { code, slot_offset } = trampoline::native();
        if code.len() > page {
            return Err(RegionError::TrampolineTooLarge { len: code.len(), page });
        }
        let base = unsafe {
            mmap(
                ptr::null_mut(),
                3 * page,
                ProtFlags::PROT_NONE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
                -1,
                0,
            )
            .map_err(RegionError::Map)?
        } as *mut u8;
        let code_page = unsafe { base.add(page) };
        let this = InsnPage {
            base,
            code: code_page,
            slot_offset,
        };
        unsafe {
            mprotect(
                code_page as *mut _,
                page,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC,
            )
            .map_err(RegionError::Protect)?;
            ptr::copy_nonoverlapping(code.as_ptr(), code_page, code.len());
            trampoline::flush_icache(code_page, code.len());
            this.protect_exec()?;
        }
        Ok(this)
    }

    /// Trampoline entry point.
    pub fn entry(&self) -> *const u8 {
        self.code
    }

    /// Open the code page for writing. The guard restores `R+X` when
    /// dropped, whether or not the attempt it enabled ran to completion.
    pub fn begin_write(&mut self) -> Result<SlotGuard<'_>, RegionError> {
        unsafe {
            mprotect(
                self.code as *mut _,
                *PAGE_SIZE,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC,
            )
            .map_err(RegionError::Protect)?;
        }
        Ok(SlotGuard { page: self })
    }

    fn protect_exec(&self) -> Result<(), RegionError> {
        unsafe {
            mprotect(
                self.code as *mut _,
                *PAGE_SIZE,
                ProtFlags::PROT_READ | ProtFlags::PROT_EXEC,
            )
            .map_err(RegionError::Protect)
        }
    }
}

impl Drop for InsnPage {
    fn drop(&mut self) {
        if let Err(e) = unsafe { munmap(self.base as *mut _, 3 * *PAGE_SIZE) } {
            log::error!("failed to unmap sandbox region: {}", e);
        }
    }
}

/// Write access to the instruction slot, bounded by the guard's lifetime.
pub struct SlotGuard<'a> {
    page: &'a mut InsnPage,
}

impl SlotGuard<'_> {
    /// Patch the slot with `insn` and synchronize the instruction cache.
    ///
    /// The flush window starts one word before the slot: some cores
    /// prefetch across the preceding instruction boundary.
    pub fn install(&mut self, insn: [u8; INSN_SLOT_LEN]) {
        unsafe {
            let slot = self.page.code.add(self.page.slot_offset);
            ptr::copy_nonoverlapping(insn.as_ptr(), slot, INSN_SLOT_LEN);
            trampoline::flush_icache(slot.sub(INSN_SLOT_LEN), 3 * INSN_SLOT_LEN);
        }
    }

    pub fn entry(&self) -> *const u8 {
        self.page.entry()
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.page.protect_exec() {
            log::error!("failed to restore R+X on code page: {}", e);
        }
    }
}
