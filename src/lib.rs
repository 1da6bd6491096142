//! # keos-vm: Demand-Paged Virtual Memory for KeOS
//!
//! This crate implements the virtual-memory layer and the address-space
//! lifecycle of a user process: the **supplemental page table** that records
//! what each user page should contain, the **frame table** that hands out
//! physical frames and evicts them when memory runs out, the **page-fault
//! handler** that brings pages in on demand (and grows the user stack), the
//! **lazy loader** for executable segments and memory-mapped files, and the
//! process operations that create, duplicate and destroy address spaces
//! (`exec`, `fork`, `wait` and `exit`).
//!
//! ## Pages, frames and the supplemental page table
//!
//! The hardware page table only knows about pages that are currently
//! resident. Everything else a process is *allowed* to touch lives in its
//! [`SupplementalPageTable`]: a map from a page-aligned virtual address to a
//! [`Page`] describing how to produce that page's contents.
//!
//! Every page starts as [`PageKind::Uninit`]. The first time the page is
//! *claimed*, a [`Frame`] is allocated from the [`FrameTable`], filled, and
//! mapped; at that moment the page turns into an anonymous page
//! ([`PageKind::Anon`]) or a file-backed page ([`PageKind::File`]), and it
//! never goes back. When the frame table runs dry it selects a victim with a
//! clock (second-chance) sweep, writes the victim's contents to swap or to
//! its file, and reuses the frame.
//!
//! ## Collaborators
//!
//! The crate does not talk to hardware or to a concrete file system. The
//! embedding kernel supplies them through traits:
//! - [`PageTable`] and [`Mmu`]: the hardware page table.
//! - [`RegularFile`] and [`FileSystem`]: the file layer.
//! - [`SwapDevice`]: the swap partition.
//! - [`Scheduler`]: thread creation and the jump into user mode.
//!
//! All of them are bundled in a [`Kernel`], built with [`KernelBuilder`].
//!
//! ## Error handling
//!
//! Fallible operations return [`KernelError`]. A failed page fault is fatal
//! to the faulting process, which exits with status `-1`.
//!
//! [`SupplementalPageTable`]: vm::spt::SupplementalPageTable
//! [`Page`]: vm::Page
//! [`PageKind::Uninit`]: vm::PageKind::Uninit
//! [`PageKind::Anon`]: vm::PageKind::Anon
//! [`PageKind::File`]: vm::PageKind::File
//! [`Frame`]: mm::frame::Frame
//! [`FrameTable`]: mm::frame::FrameTable
//! [`PageTable`]: mm::page_table::PageTable
//! [`Mmu`]: mm::page_table::Mmu
//! [`RegularFile`]: fs::RegularFile
//! [`FileSystem`]: fs::traits::FileSystem
//! [`SwapDevice`]: mm::swap::SwapDevice
//! [`Scheduler`]: kernel::Scheduler
//! [`Kernel`]: kernel::Kernel
//! [`KernelBuilder`]: kernel::KernelBuilder

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod addressing;
pub mod file_struct;
pub mod fork;
pub mod fs;
pub mod kernel;
pub mod loader;
pub mod mm;
pub mod mm_struct;
pub mod process;
pub mod sync;
pub mod syscall;
pub mod task;
pub mod vm;

/// Represents errors that can occur in the virtual-memory layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Operation is not permitted. (EPERM)
    OperationNotPermitted,
    /// No such file or directory. (ENOENT)
    NoSuchEntry,
    /// IO Error. (EIO)
    IOError,
    /// Argument list too long. (E2BIG)
    ArgumentListTooLong,
    /// Exec format error. (ENOEXEC)
    NoExec,
    /// BAD file descriptor. (EBADF)
    BadFileDescriptor,
    /// No child processes. (ECHILD)
    NoChild,
    /// Out of memory. (ENOMEM)
    NoMemory,
    /// Permission denied. (EACCES)
    InvalidAccess,
    /// Bad address. (EFAULT)
    BadAddress,
    /// File exists. (EEXIST)
    FileExist,
    /// Invalid arguement. (EINVAL)
    InvalidArgument,
    /// Too many open files. (EMFILE)
    TooManyOpenFile,
    /// No space left on device. (ENOSPC)
    NoSpace,
    /// Invalid system call number. (ENOSYS)
    NoSuchSyscall,
    /// Operation is not supported. (ENOTSUPP)
    NotSupportedOperation,
}

impl KernelError {
    /// Converts the [`KernelError`] enum into a corresponding `usize` error
    /// code. The result is cast to `usize` for use as a return value in
    /// system calls.
    pub fn into_usize(self) -> usize {
        (match self {
            KernelError::OperationNotPermitted => -1isize,
            KernelError::NoSuchEntry => -2,
            KernelError::IOError => -5,
            KernelError::ArgumentListTooLong => -7,
            KernelError::NoExec => -8,
            KernelError::BadFileDescriptor => -9,
            KernelError::NoChild => -10,
            KernelError::NoMemory => -12,
            KernelError::InvalidAccess => -13,
            KernelError::BadAddress => -14,
            KernelError::FileExist => -17,
            KernelError::InvalidArgument => -22,
            KernelError::TooManyOpenFile => -24,
            KernelError::NoSpace => -28,
            KernelError::NoSuchSyscall => -38,
            KernelError::NotSupportedOperation => -524,
        }) as usize
    }
}

/// The given `isize` does not indicate an [`KernelError`].
#[derive(Debug, Eq, PartialEq)]
pub struct TryFromError {
    e: isize,
}

impl TryFrom<isize> for KernelError {
    type Error = TryFromError;

    fn try_from(value: isize) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(Self::OperationNotPermitted),
            -2 => Ok(Self::NoSuchEntry),
            -5 => Ok(Self::IOError),
            -7 => Ok(Self::ArgumentListTooLong),
            -8 => Ok(Self::NoExec),
            -9 => Ok(Self::BadFileDescriptor),
            -10 => Ok(Self::NoChild),
            -12 => Ok(Self::NoMemory),
            -13 => Ok(Self::InvalidAccess),
            -14 => Ok(Self::BadAddress),
            -17 => Ok(Self::FileExist),
            -22 => Ok(Self::InvalidArgument),
            -24 => Ok(Self::TooManyOpenFile),
            -28 => Ok(Self::NoSpace),
            -38 => Ok(Self::NoSuchSyscall),
            -524 => Ok(Self::NotSupportedOperation),
            e => Err(TryFromError { e }),
        }
    }
}
