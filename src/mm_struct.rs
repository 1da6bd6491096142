//! # Memory State of a process
//!
//! The state of a process's memory is represented by the [`MmStruct`]
//! structure, similiar to the Linux kernel's `struct mm_struct`. It owns:
//! - the process's hardware **page table**,
//! - the **supplemental page table** describing every page the process may
//!   touch,
//! - a handle on the system-wide **frame table** its pages draw frames from,
//! - the user stack pointer recorded at the latest system-call entry.
//!
//! Memory-mapping ([`MmStruct::mmap`], [`MmStruct::munmap`]) lives in
//! [`vm::file`]; fault handling ([`MmStruct::handle_fault`]) lives in
//! [`vm::fault`].
//!
//! ### Accessing user memory from the kernel
//!
//! System calls read and write user buffers through
//! [`MmStruct::read_user`] and [`MmStruct::write_user`]. They behave like a
//! real kernel-mode access would: a page that is not resident is brought in
//! through the fault handler (which may grow the stack using the recorded
//! stack pointer), and an access that the fault handler rejects fails with
//! the handler's error. The kernel never crashes due to user input.
//!
//! ### Teardown
//!
//! Dropping an [`MmStruct`] destroys every page exactly once (writing back
//! modified file-backed pages and releasing frames and swap slots) and only
//! then destroys the hardware page table.
//!
//! [`vm::file`]: crate::vm::file
//! [`vm::fault`]: crate::vm::fault

use crate::{
    KernelError,
    addressing::{PAGE_SIZE, USER_STACK, Va},
    mm::{frame::FrameTable, page_table::PageTable},
    vm::{
        Initializer, Page, Segment, VmType,
        fault::PageFaultReason,
        spt::SupplementalPageTable,
    },
};
use alloc::{string::String, sync::Arc, vec::Vec};

/// The memory state of a process.
pub struct MmStruct {
    page_table: Arc<dyn PageTable>,
    spt: SupplementalPageTable,
    frames: Arc<FrameTable>,
    max_stack_size: usize,
    recorded_rsp: Va,
    dead: bool,
}

impl MmStruct {
    /// Creates an empty address space on top of `page_table`.
    pub fn new(page_table: Arc<dyn PageTable>, frames: Arc<FrameTable>, max_stack_size: usize) -> Self {
        Self {
            page_table,
            spt: SupplementalPageTable::new(),
            frames,
            max_stack_size,
            recorded_rsp: USER_STACK,
            dead: false,
        }
    }

    /// The hardware page table.
    pub fn page_table(&self) -> &Arc<dyn PageTable> {
        &self.page_table
    }

    /// The supplemental page table.
    pub fn spt(&self) -> &SupplementalPageTable {
        &self.spt
    }

    /// The frame table pages draw their frames from.
    pub fn frames(&self) -> &Arc<FrameTable> {
        &self.frames
    }

    /// How far the stack may grow below [`USER_STACK`].
    pub fn max_stack_size(&self) -> usize {
        self.max_stack_size
    }

    /// Records the user stack pointer at system-call entry.
    pub fn record_stack_pointer(&mut self, rsp: Va) {
        self.recorded_rsp = rsp;
    }

    /// The user stack pointer recorded at the latest system-call entry.
    pub fn recorded_stack_pointer(&self) -> Va {
        self.recorded_rsp
    }

    /// Registers an uninitialized page at `va`.
    ///
    /// # Returns
    /// - `Err(KernelError::FileExist)` if a page is already registered there.
    /// - `Err(KernelError::BadAddress)` if `va` is not a user address.
    pub fn register(
        &mut self,
        target: VmType,
        va: Va,
        writable: bool,
        init: Option<Initializer>,
        aux: Option<Segment>,
    ) -> Result<Arc<Page>, KernelError> {
        if !va.is_user() {
            return Err(KernelError::BadAddress);
        }
        self.spt.insert(Page::new(va, writable, target, init, aux))
    }

    /// Removes the page at `va` from the address space and destroys it.
    pub fn unregister(&mut self, va: Va) {
        if let Some(page) = self.spt.remove(va) {
            page.destroy(self.page_table.as_ref(), self.frames.swap());
        }
    }

    /// Makes the registered page at `va` resident.
    ///
    /// # Returns
    /// - `Err(KernelError::BadAddress)` if no page is registered at `va`.
    pub fn claim(&mut self, va: Va) -> Result<(), KernelError> {
        let page = self.spt.find(va).cloned().ok_or(KernelError::BadAddress)?;
        page.claim(&self.page_table, &self.frames)
    }

    /// Runs `f` on the frame of the user page containing `addr`.
    ///
    /// Non-resident pages are faulted in as a kernel-mode access would.
    /// The page's accessed bit (and dirty bit, for writes) is set.
    pub fn get_user_page_and<R>(
        &mut self,
        addr: Va,
        is_write: bool,
        f: impl FnOnce(&mut [u8; PAGE_SIZE]) -> R,
    ) -> Result<R, KernelError> {
        if !addr.is_user() {
            return Err(KernelError::BadAddress);
        }
        let mut f = Some(f);
        loop {
            if let Some(page) = self.spt.find(addr).cloned() {
                if is_write && !page.writable() {
                    return Err(KernelError::InvalidAccess);
                }
                let mut state = page.state();
                if let Some(frame) = state.frame_mut() {
                    let va = page.va();
                    self.page_table.set_accessed(va, true);
                    if is_write {
                        self.page_table.set_dirty(va, true);
                    }
                    return f
                        .take()
                        .map(|f| f(frame.inner_mut()))
                        .ok_or(KernelError::BadAddress);
                }
            }
            let reason = PageFaultReason {
                fault_addr: addr,
                is_write_access: is_write,
                is_present: false,
                is_user: false,
            };
            self.handle_fault(&reason, self.recorded_rsp)?;
        }
    }

    /// Copies user memory at `addr` into `buf`.
    pub fn read_user(&mut self, addr: Va, buf: &mut [u8]) -> Result<(), KernelError> {
        let mut done = 0;
        while done < buf.len() {
            let va = addr.checked_add(done).ok_or(KernelError::BadAddress)?;
            let len = (PAGE_SIZE - va.offset()).min(buf.len() - done);
            let chunk = &mut buf[done..done + len];
            self.get_user_page_and(va, false, |page| {
                chunk.copy_from_slice(&page[va.offset()..va.offset() + len])
            })?;
            done += len;
        }
        Ok(())
    }

    /// Copies `buf` into user memory at `addr`.
    pub fn write_user(&mut self, addr: Va, buf: &[u8]) -> Result<(), KernelError> {
        let mut done = 0;
        while done < buf.len() {
            let va = addr.checked_add(done).ok_or(KernelError::BadAddress)?;
            let len = (PAGE_SIZE - va.offset()).min(buf.len() - done);
            let chunk = &buf[done..done + len];
            self.get_user_page_and(va, true, |page| {
                page[va.offset()..va.offset() + len].copy_from_slice(chunk)
            })?;
            done += len;
        }
        Ok(())
    }

    /// Reads a NUL-terminated string of at most `max` bytes from user
    /// memory.
    pub fn read_user_str(&mut self, addr: Va, max: usize) -> Result<String, KernelError> {
        let mut bytes = Vec::new();
        let mut va = addr;
        loop {
            let offset = va.offset();
            let (chunk, terminated) = self.get_user_page_and(va, false, |page| {
                let tail = &page[offset..];
                match tail.iter().position(|b| *b == 0) {
                    Some(nul) => (tail[..nul].to_vec(), true),
                    None => (tail.to_vec(), false),
                }
            })?;
            bytes.extend_from_slice(&chunk);
            if bytes.len() > max {
                return Err(KernelError::InvalidArgument);
            }
            if terminated {
                return String::from_utf8(bytes).map_err(|_| KernelError::InvalidArgument);
            }
            va = va.checked_add(PAGE_SIZE - offset).ok_or(KernelError::BadAddress)?;
        }
    }

    /// Destroys every page, then the hardware page table.
    ///
    /// Called automatically on drop; later calls do nothing.
    pub fn kill(&mut self) {
        if self.dead {
            return;
        }
        self.dead = true;
        for page in self.spt.drain() {
            page.destroy(self.page_table.as_ref(), self.frames.swap());
        }
        self.page_table.destroy();
    }
}

impl Drop for MmStruct {
    fn drop(&mut self) {
        self.kill()
    }
}
