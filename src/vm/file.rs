//! # Memory-mapped files
//!
//! `mmap` makes a file's contents addressable. The kernel reopens the file so
//! that the mapping survives the caller closing its descriptor, and registers
//! one lazily loaded page per page of the mapped range. All pages of a
//! mapping share one [`Mapping`], which owns the reopened handle; the handle
//! is closed when the last page of the mapping goes away.
//!
//! Pages are loaded on their first access, exactly like executable segments.
//! When a modified page leaves memory (eviction, `munmap`, or process exit)
//! its bytes are written back to the file at the offset they came from.
//! Bytes that lie past the end of the file are zero-filled on load and never
//! written back.

use super::{Segment, VmType};
use crate::{
    KernelError,
    addressing::{KERNEL_BASE, PAGE_SIZE, Va},
    fs::RegularFile,
    loader::lazy_fill,
    mm_struct::MmStruct,
};
use alloc::{sync::Arc, vec::Vec};
use log::debug;

/// A memory-mapped range of a file.
pub struct Mapping {
    start: Va,
    page_count: usize,
    file: RegularFile,
}

impl Mapping {
    /// Creates a mapping of `page_count` pages at `start`, backed by `file`.
    pub fn new(start: Va, page_count: usize, file: RegularFile) -> Arc<Self> {
        Arc::new(Self {
            start,
            page_count,
            file,
        })
    }

    /// First address of the mapping.
    pub fn start(&self) -> Va {
        self.start
    }

    /// Number of pages in the mapping.
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// The mapping's private file handle.
    pub fn file(&self) -> &RegularFile {
        &self.file
    }

    /// The same range backed by a freshly reopened handle.
    pub fn reopen(&self) -> Result<Arc<Self>, KernelError> {
        Ok(Self::new(self.start, self.page_count, self.file.reopen()?))
    }
}

/// Payload of a file-backed page.
pub struct FilePage {
    /// The mapping this page belongs to.
    pub mapping: Arc<Mapping>,
    /// The part of the file backing this page.
    pub segment: Segment,
}

impl FilePage {
    /// Reads the page contents from the file.
    pub(crate) fn fill(&self, buf: &mut [u8; PAGE_SIZE]) -> Result<(), KernelError> {
        lazy_fill(&self.segment, buf)
    }

    /// Writes the file-backed part of `buf` to the file.
    pub(crate) fn write_back(&self, buf: &[u8; PAGE_SIZE]) -> Result<(), KernelError> {
        let Segment {
            file,
            offset,
            read_bytes,
            ..
        } = &self.segment;
        if file.write(*offset, &buf[..*read_bytes])? == *read_bytes {
            Ok(())
        } else {
            Err(KernelError::IOError)
        }
    }
}

impl MmStruct {
    /// Maps `length` bytes of `file`, starting at `offset`, at `addr`.
    ///
    /// No page is loaded here; each page is read from the file on its first
    /// access.
    ///
    /// # Returns
    /// - `Ok(addr)` on success.
    /// - `Err(KernelError::BadFileDescriptor)` if `file` is `None`.
    /// - `Err(KernelError::InvalidArgument)` if `addr` is zero or unaligned,
    ///   `length` is zero, `offset` is unaligned or too large, the file is
    ///   empty, the range leaves user space, or any page of the range is
    ///   already in use.
    pub fn mmap(
        &mut self,
        addr: Va,
        length: usize,
        writable: bool,
        file: Option<&RegularFile>,
        offset: usize,
    ) -> Result<Va, KernelError> {
        let file = file.ok_or(KernelError::BadFileDescriptor)?;
        if addr.into_usize() == 0 || addr.offset() != 0 || length == 0 || offset % PAGE_SIZE != 0 {
            return Err(KernelError::InvalidArgument);
        }
        let page_count = length.div_ceil(PAGE_SIZE);
        let end = page_count
            .checked_mul(PAGE_SIZE)
            .and_then(|len| addr.checked_add(len))
            .ok_or(KernelError::InvalidArgument)?;
        if end.into_usize() > KERNEL_BASE {
            return Err(KernelError::InvalidArgument);
        }
        // The file offset of the last page must be representable too.
        page_count
            .checked_mul(PAGE_SIZE)
            .and_then(|len| offset.checked_add(len))
            .ok_or(KernelError::InvalidArgument)?;
        if (0..page_count).any(|i| self.spt().find(addr + i * PAGE_SIZE).is_some()) {
            return Err(KernelError::InvalidArgument);
        }

        let file = file.reopen()?;
        let file_length = file.size();
        if file_length == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let mut remaining = file_length.saturating_sub(offset).min(length);
        let mapping = Mapping::new(addr, page_count, file.clone());

        let mut registered = Vec::with_capacity(page_count);
        for i in 0..page_count {
            let read_bytes = remaining.min(PAGE_SIZE);
            remaining -= read_bytes;
            let segment = Segment {
                file: file.clone(),
                offset: offset + i * PAGE_SIZE,
                read_bytes,
                zero_bytes: PAGE_SIZE - read_bytes,
            };
            let va = addr + i * PAGE_SIZE;
            match self.register(
                VmType::File(mapping.clone()),
                va,
                writable,
                Some(lazy_fill),
                Some(segment),
            ) {
                Ok(_) => registered.push(va),
                Err(e) => {
                    for va in registered {
                        self.unregister(va);
                    }
                    return Err(e);
                }
            }
        }
        debug!("mmap: {:?}..{:?} ({} pages)", addr, end, page_count);
        Ok(addr)
    }

    /// Unmaps the mapping that starts at `addr`.
    ///
    /// Dirty resident pages are written back to the file. The mapping's file
    /// handle is closed once its last page is gone.
    ///
    /// # Returns
    /// - `Err(KernelError::InvalidArgument)` if no mapping starts at `addr`.
    pub fn munmap(&mut self, addr: Va) -> Result<(), KernelError> {
        let mapping = self
            .spt()
            .find(addr)
            .and_then(|page| page.mapping())
            .filter(|mapping| mapping.start() == addr)
            .ok_or(KernelError::InvalidArgument)?;
        for i in 0..mapping.page_count() {
            let va = mapping.start() + i * PAGE_SIZE;
            let owned = self
                .spt()
                .find(va)
                .and_then(|page| page.mapping())
                .is_some_and(|m| Arc::ptr_eq(&m, &mapping));
            if owned {
                self.unregister(va);
            }
        }
        debug!("munmap: {:?} ({} pages)", addr, mapping.page_count());
        Ok(())
    }
}
