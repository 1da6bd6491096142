//! Filesystem abstraction.
//!
//! The virtual-memory layer does not implement a file system; it consumes one
//! through the traits in [`traits`]. A file system hands out
//! [`RegularFile`] handles, which expose byte-addressed positional I/O on top
//! of the block interface the file system implements.
//!
//! Every byte-level read or write through a [`RegularFile`] handle is
//! serialized by a single file-system lock, so lazy loading, mmap writeback
//! and system calls never interleave their block I/O.

use crate::{
    KernelError,
    addressing::{PAGE_MASK, PAGE_SIZE},
    sync::SpinLock,
};
use alloc::{boxed::Box, sync::Arc};

/// Defines traits for file system operations.
pub mod traits {
    use super::{FileBlockNumber, InodeNumber};
    use crate::{KernelError, addressing::PAGE_SIZE};

    /// Trait representing a filesystem.
    pub trait FileSystem
    where
        Self: Sync + Send,
    {
        /// Opens the regular file at `path`.
        ///
        /// # Returns
        /// - `Ok(RegularFile)`: A fresh handle to the file.
        /// - `Err(KernelError::NoSuchEntry)`: If no such file exists.
        fn open(&self, path: &str) -> Result<super::RegularFile, KernelError>;

        /// Creates a regular file at `path` holding `size` zero bytes.
        ///
        /// # Returns
        /// - `Err(KernelError::FileExist)`: If `path` already exists.
        fn create(&self, path: &str, size: usize) -> Result<(), KernelError>;

        /// Removes the file at `path`.
        ///
        /// Handles that are already open keep working until they are
        /// dropped.
        ///
        /// # Returns
        /// - `Err(KernelError::NoSuchEntry)`: If no such file exists.
        fn remove(&self, path: &str) -> Result<(), KernelError>;
    }

    /// Trait representing a regular file in the filesystem.
    ///
    /// A regular file contains user data and supports block-granular reads
    /// and writes. Each implementor instance is one *open* file: dropping the
    /// last handle closes it.
    pub trait RegularFile
    where
        Self: Send + Sync,
    {
        /// Returns the inode number of the file.
        fn ino(&self) -> InodeNumber;

        /// Returns the size of the file in bytes.
        fn size(&self) -> usize;

        /// Reads the block `fba` into `buf`.
        ///
        /// Bytes past the end of the file read as zero.
        ///
        /// # Returns
        /// - `Ok(true)`: If the block lies (at least partially) inside the
        ///   file.
        /// - `Ok(false)`: If the block lies past the end of the file.
        /// - `Err(KernelError)`: An error occured while the read operation.
        fn read(&self, fba: FileBlockNumber, buf: &mut [u8; PAGE_SIZE]) -> Result<bool, KernelError>;

        /// Writes a page-sized block into the file block `fba`.
        ///
        /// The file grows to at least `min_size` bytes if it is shorter.
        fn write(
            &self,
            fba: FileBlockNumber,
            buf: &[u8; PAGE_SIZE],
            min_size: usize,
        ) -> Result<(), KernelError>;

        /// Opens the same inode again, producing an independent handle with
        /// its own write-denial state.
        fn reopen(&self) -> Result<super::RegularFile, KernelError>;

        /// Duplicates this open file, producing an independent handle that
        /// inherits the write-denial state.
        fn duplicate(&self) -> Result<super::RegularFile, KernelError>;

        /// Prevents writes to the underlying inode until
        /// [`RegularFile::allow_write`] is called on this handle.
        fn deny_write(&self);

        /// Re-allows writes previously denied through this handle.
        fn allow_write(&self);
    }

    /// Trait representing the console behind the two reserved descriptors.
    pub trait Console
    where
        Self: Send + Sync,
    {
        /// Writes `buf` to the console.
        fn write(&self, buf: &[u8]);

        /// Reads up to `buf.len()` bytes from the console, returning the
        /// number of bytes read.
        fn read(&self, buf: &mut [u8]) -> usize;
    }
}

static FILESYS_LOCK: SpinLock<()> = SpinLock::new(());

/// A handle to an open regular file.
///
/// This struct provides a reference-counted handle to a file that supports
/// byte-addressed reading and writing. Cloning the handle shares the same
/// open file; use [`RegularFile::reopen`] or [`RegularFile::duplicate`] for
/// an independent one.
#[derive(Clone)]
pub struct RegularFile(pub Arc<dyn traits::RegularFile>);

impl RegularFile {
    /// Creates a new [`RegularFile`] handle from a given implementation of
    /// [`traits::RegularFile`].
    pub fn new(r: impl traits::RegularFile + 'static) -> Self {
        Self(Arc::new(r))
    }

    /// Inode number of the file.
    pub fn ino(&self) -> InodeNumber {
        self.0.ino()
    }

    /// Returns the size of the file in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        let _guard = FILESYS_LOCK.lock();
        self.0.size()
    }

    /// Reads data at byte offset `position` into `buf`.
    ///
    /// # Returns
    /// - `Ok(usize)`: The number of bytes read; short only at end of file.
    /// - `Err(KernelError)`: An error if the read operation fails.
    pub fn read(&self, position: usize, buf: &mut [u8]) -> Result<usize, KernelError> {
        let _guard = FILESYS_LOCK.lock();
        let end = self.0.size().min(position.saturating_add(buf.len()));
        if end <= position {
            return Ok(0);
        }
        let mut block = Box::new([0u8; PAGE_SIZE]);
        let mut cursor = position;
        while cursor < end {
            let in_block = cursor & PAGE_MASK;
            let len = (PAGE_SIZE - in_block).min(end - cursor);
            self.0
                .read(FileBlockNumber::from_offset(cursor), &mut block)?;
            let done = cursor - position;
            buf[done..done + len].copy_from_slice(&block[in_block..in_block + len]);
            cursor += len;
        }
        Ok(end - position)
    }

    /// Reads exactly `buf.len()` bytes at byte offset `position`.
    ///
    /// A short read (the file ends early) is reported as
    /// [`KernelError::IOError`].
    pub fn read_exact(&self, position: usize, buf: &mut [u8]) -> Result<(), KernelError> {
        if self.read(position, buf)? == buf.len() {
            Ok(())
        } else {
            Err(KernelError::IOError)
        }
    }

    /// Writes `buf` at byte offset `position`.
    ///
    /// If the write position is beyond the current file size, file will be
    /// extended to minimum size required to reflect the update.
    ///
    /// # Returns
    /// - `Ok(usize)`: The number of bytes written.
    /// - `Err(Error)`: An error if the write operation fails.
    pub fn write(&self, position: usize, buf: &[u8]) -> Result<usize, KernelError> {
        let _guard = FILESYS_LOCK.lock();
        let mut block = Box::new([0u8; PAGE_SIZE]);
        let mut done = 0;
        while done < buf.len() {
            let cursor = position + done;
            let fba = FileBlockNumber::from_offset(cursor);
            let in_block = cursor & PAGE_MASK;
            let len = (PAGE_SIZE - in_block).min(buf.len() - done);
            if len != PAGE_SIZE {
                // Partial block: preserve the bytes around the update.
                self.0.read(fba, &mut block)?;
            }
            block[in_block..in_block + len].copy_from_slice(&buf[done..done + len]);
            self.0.write(fba, &block, cursor + len)?;
            done += len;
        }
        Ok(done)
    }

    /// Opens an independent handle on the same inode.
    pub fn reopen(&self) -> Result<RegularFile, KernelError> {
        self.0.reopen()
    }

    /// Duplicates the open file.
    pub fn duplicate(&self) -> Result<RegularFile, KernelError> {
        self.0.duplicate()
    }

    /// Denies writes to the inode through any handle.
    pub fn deny_write(&self) {
        self.0.deny_write()
    }

    /// Re-allows writes denied through this handle.
    pub fn allow_write(&self) {
        self.0.allow_write()
    }
}

/// Represents a unique identifier for an inode in the filesystem.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub struct InodeNumber(pub u32);

/// Represents a file block number within a file.
///
/// Each block contains [`PAGE_SIZE`] bytes of contents.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub struct FileBlockNumber(pub usize);

impl FileBlockNumber {
    /// Returns the block that contains byte offset `offset`.
    pub const fn from_offset(offset: usize) -> Self {
        Self(offset / PAGE_SIZE)
    }

    /// Returns the byte offset of the first byte in this block.
    pub const fn into_offset(self) -> usize {
        self.0 * PAGE_SIZE
    }
}
