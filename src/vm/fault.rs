//! # Page fault handling
//!
//! Most page faults on user addresses are not errors: the page is listed in
//! the supplemental page table but has not been loaded yet, or it was
//! evicted. [`MmStruct::handle_fault`] resolves such a fault by claiming the
//! page, after which the faulting instruction can be restarted.
//!
//! A not-present fault on an address without a page may still be a valid
//! *stack access*. The user stack grows on demand: an access exactly one
//! word below the stack pointer (what `push` and `call` produce) or anywhere
//! between the stack pointer and [`USER_STACK_TOP`] gets a fresh zeroed page,
//! as long as the stack stays within its maximum size.
//!
//! For faults raised by user code the stack pointer is the one the CPU saved
//! on trap entry. For faults raised by the kernel while it touches user
//! memory inside a system call, that value is the kernel's own; the handler
//! uses the user stack pointer recorded at system-call entry instead.
//!
//! Everything else is fatal to the process:
//! - any access to a kernel address,
//! - a write to a present read-only page (copy-on-write is not supported),
//! - a not-present access that is neither a registered page nor a stack
//!   access, or that would grow the stack past its limit.

use super::{VmType, anon::AnonOrigin};
use crate::{
    KernelError,
    addressing::{USER_STACK_TOP, Va},
    mm_struct::MmStruct,
};
use bitflags::bitflags;
use log::{debug, warn};

bitflags! {
    /// Error code pushed by the CPU on a page fault.
    pub struct PFErrorCode: usize {
        /// The fault was a protection violation on a present page.
        const PRESENT = 1 << 0;
        /// The access was a write.
        const WRITE_ACCESS = 1 << 1;
        /// The access came from user mode.
        const USER = 1 << 2;
    }
}

/// Represents the reason for a page fault in a virtual memory system.
#[derive(Debug, Clone, Copy)]
pub struct PageFaultReason {
    /// The address that caused the page fault.
    pub fault_addr: Va,

    /// Indicates whether the fault was due to a write access.
    pub is_write_access: bool,

    /// Indicates whether the page that caused the fault is present in memory.
    ///
    /// `true` means the fault is a protection violation.
    pub is_present: bool,

    /// Indicates whether the fault was raised by user-mode code.
    pub is_user: bool,
}

impl PageFaultReason {
    /// Probe the cause of page fault into a [`PageFaultReason`].
    pub fn new(ec: PFErrorCode, cr2: Va) -> Self {
        PageFaultReason {
            fault_addr: cr2,
            is_write_access: ec.contains(PFErrorCode::WRITE_ACCESS),
            is_present: ec.contains(PFErrorCode::PRESENT),
            is_user: ec.contains(PFErrorCode::USER),
        }
    }

    /// Returns `true` if the fault is due to **demand paging**.
    #[inline]
    pub fn is_demand_paging_fault(&self) -> bool {
        !self.is_present
    }

    /// Returns `true` if the fault is a write to a present, read-only page.
    #[inline]
    pub fn is_write_protect_fault(&self) -> bool {
        self.is_present && self.is_write_access
    }
}

/// Whether an access at `addr` with stack pointer `rsp` is a stack access.
#[inline]
pub fn is_stack_access(addr: Va, rsp: Va) -> bool {
    let (addr, rsp) = (addr.into_usize(), rsp.into_usize());
    rsp.checked_sub(8) == Some(addr) || (addr > rsp && addr < USER_STACK_TOP)
}

impl MmStruct {
    /// Resolves a page fault.
    ///
    /// # Parameters
    /// - `reason`: the decoded fault.
    /// - `rsp`: the user stack pointer at the time of the fault (the trapped
    ///   one for user faults, [`MmStruct::recorded_stack_pointer`] for kernel
    ///   faults).
    ///
    /// # Returns
    /// - `Ok(())` if the faulting access can be retried.
    /// - `Err(KernelError)` if the access is invalid or the page could not be
    ///   made resident. The caller terminates the process.
    pub fn handle_fault(&mut self, reason: &PageFaultReason, rsp: Va) -> Result<(), KernelError> {
        let addr = reason.fault_addr;
        if !addr.is_user() {
            warn!("fault: kernel address {:?}", addr);
            return Err(KernelError::BadAddress);
        }
        if !reason.is_demand_paging_fault() {
            warn!("fault: protection violation at {:?}", addr);
            return Err(KernelError::InvalidAccess);
        }
        if let Some(page) = self.spt().find(addr).cloned() {
            if reason.is_write_access && !page.writable() {
                return Err(KernelError::InvalidAccess);
            }
            return page.claim(self.page_table(), self.frames());
        }
        if is_stack_access(addr, rsp) {
            return self.grow_stack(addr);
        }
        debug!("fault: no page for {:?} (rsp {:?})", addr, rsp);
        Err(KernelError::InvalidAccess)
    }

    /// Adds a zeroed stack page that contains `addr`.
    fn grow_stack(&mut self, addr: Va) -> Result<(), KernelError> {
        let page = addr.page_down();
        if page.into_usize() >= USER_STACK_TOP
            || page.into_usize() < USER_STACK_TOP.saturating_sub(self.max_stack_size())
        {
            warn!("fault: stack limit exceeded at {:?}", addr);
            return Err(KernelError::InvalidAccess);
        }
        let page = self.register(VmType::Anon(AnonOrigin::Stack), page, true, None, None)?;
        if let Err(e) = page.claim(self.page_table(), self.frames()) {
            self.unregister(page.va());
            return Err(e);
        }
        debug!("fault: stack grown to {:?}", page.va());
        Ok(())
    }
}
