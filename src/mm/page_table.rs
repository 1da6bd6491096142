//! The hardware page table, as seen by the virtual-memory layer.
//!
//! The layer never walks page-table levels itself. It talks to a per-process
//! [`PageTable`] through a handful of operations: install or remove a
//! single 4 KiB mapping, query it, and read or reset the accessed and dirty
//! bits the MMU maintains. New page tables come from the [`Mmu`].
//!
//! Page tables are shared as `Arc<dyn PageTable>`: the owning address space
//! holds a strong reference, while the frame table keeps a weak one for each
//! resident frame so that eviction can unmap a victim in another process.

use crate::{
    KernelError,
    addressing::{Pa, Va},
};
use alloc::sync::Arc;
use bitflags::bitflags;

bitflags! {
    /// Flags for a user page mapping.
    ///
    /// The [`Permission`] allows you to specify memory access permissions such as:
    /// - Whether a page is readable.
    /// - Whether a page is writable.
    /// - Whether a page is executable.
    /// - Whether a page can be accessed by user applications.
    pub struct Permission: usize {
        /// Page is readable.
        const READ = 1 << 0;
        /// Page is writable.
        const WRITE = 1 << 1;
        /// Page is executable.
        const EXECUTABLE = 1 << 2;
        /// Page can be referred by user application.
        const USER = 1 << 3;
    }
}

impl Permission {
    /// Permission of a user page, optionally writable.
    pub fn user(writable: bool) -> Self {
        if writable {
            Permission::READ | Permission::WRITE | Permission::USER
        } else {
            Permission::READ | Permission::USER
        }
    }
}

/// Errors raised by page-table manipulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageTableMappingError {
    /// Unaligned address.
    Unaligned,
    /// The requested entry does not exist.
    NotExist,
    /// An entry already exists for the address.
    Duplicated,
    /// The permission cannot be expressed for this address.
    InvalidPermission,
    /// Allocation of an intermediate table failed.
    OutOfMemory,
}

impl From<PageTableMappingError> for KernelError {
    fn from(e: PageTableMappingError) -> Self {
        match e {
            PageTableMappingError::OutOfMemory => KernelError::NoMemory,
            PageTableMappingError::Duplicated => KernelError::FileExist,
            PageTableMappingError::Unaligned | PageTableMappingError::InvalidPermission => {
                KernelError::InvalidArgument
            }
            PageTableMappingError::NotExist => KernelError::BadAddress,
        }
    }
}

/// A leaf entry of the page table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pte {
    /// Physical address of the mapped frame.
    pub pa: Pa,
    /// Permission of the mapping.
    pub perm: Permission,
}

/// A per-process hardware page table.
///
/// All methods take `&self`: implementations synchronize internally, because
/// the frame table may clear a mapping from another thread while evicting.
pub trait PageTable
where
    Self: Send + Sync,
{
    /// Loads this page table into the MMU.
    fn activate(&self);

    /// Returns the mapping of the page containing `va`, if any.
    fn get_mapping(&self, va: Va) -> Option<Pte>;

    /// Maps the page at `va` to the frame at `pa` with `perm`.
    ///
    /// # Returns
    /// - `Err(PageTableMappingError::Duplicated)` if `va` is already mapped.
    fn set_mapping(&self, va: Va, pa: Pa, perm: Permission) -> Result<(), PageTableMappingError>;

    /// Removes the mapping of `va` and returns the physical address it
    /// pointed to. Flushes the TLB entry.
    fn clear_mapping(&self, va: Va) -> Result<Pa, PageTableMappingError>;

    /// Whether the page at `va` was written since it was mapped or since the
    /// bit was last reset.
    fn is_dirty(&self, va: Va) -> bool;

    /// Sets or resets the dirty bit of `va`.
    fn set_dirty(&self, va: Va, dirty: bool);

    /// Whether the page at `va` was accessed since the bit was last reset.
    fn is_accessed(&self, va: Va) -> bool;

    /// Sets or resets the accessed bit of `va`.
    fn set_accessed(&self, va: Va, accessed: bool);

    /// Tears the page table down. No other method is called afterwards.
    fn destroy(&self);
}

/// Creates page tables.
pub trait Mmu
where
    Self: Send + Sync,
{
    /// Creates an empty user page table that shares the kernel mappings.
    fn create_page_table(&self) -> Result<Arc<dyn PageTable>, KernelError>;
}
