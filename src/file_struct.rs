//! # File state of a process.
//!
//! Processes interact with files through **file descriptors**: small
//! integers that index the process's descriptor table. The table maps each
//! descriptor to one of:
//! - the console input ([`FileKind::Stdin`]) or output ([`FileKind::Stdout`]),
//!   installed at descriptors 0 and 1 when the table is created;
//! - an [`OpenFile`]: a regular file together with its current position.
//!
//! `dup2` makes two descriptors refer to the same [`OpenFile`], so they share
//! the position. The open file is closed once the last descriptor that refers
//! to it is closed.
//!
//! On `fork` the table is duplicated: the console descriptors are shared,
//! and every distinct [`OpenFile`] is duplicated exactly once, so descriptors
//! that shared a position in the parent still share one in the child, but
//! not with the parent.

use crate::{KernelError, fs::RegularFile, sync::SpinLock};
use alloc::{collections::BTreeMap, sync::Arc};

/// A regular file opened by a process, with its position.
pub struct OpenFile {
    file: RegularFile,
    position: SpinLock<usize>,
}

impl OpenFile {
    /// Wraps `file`, positioned at its beginning.
    pub fn new(file: RegularFile) -> Self {
        Self::at(file, 0)
    }

    fn at(file: RegularFile, position: usize) -> Self {
        Self {
            file,
            position: SpinLock::new(position),
        }
    }

    /// The underlying file.
    pub fn file(&self) -> &RegularFile {
        &self.file
    }

    /// Size of the file in bytes.
    pub fn size(&self) -> usize {
        self.file.size()
    }

    /// Reads from the current position and advances it.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, KernelError> {
        let mut position = self.position.lock();
        let read = self.file.read(*position, buf)?;
        *position += read;
        Ok(read)
    }

    /// Writes at the current position and advances it.
    ///
    /// Writing to a file whose writes are denied writes nothing.
    pub fn write(&self, buf: &[u8]) -> Result<usize, KernelError> {
        let mut position = self.position.lock();
        let written = match self.file.write(*position, buf) {
            Err(KernelError::OperationNotPermitted) => 0,
            result => result?,
        };
        *position += written;
        Ok(written)
    }

    /// Moves the position to `position`. Positions past the end are allowed.
    pub fn seek(&self, position: usize) {
        *self.position.lock() = position;
    }

    /// The current position.
    pub fn tell(&self) -> usize {
        *self.position.lock()
    }

    fn duplicate(&self) -> Result<Self, KernelError> {
        Ok(Self::at(self.file.duplicate()?, self.tell()))
    }
}

/// What a descriptor refers to.
#[derive(Clone)]
pub enum FileKind {
    /// Console input.
    Stdin,
    /// Console output.
    Stdout,
    /// A regular file.
    Regular(Arc<OpenFile>),
}

/// Represents an index into a process’s file descriptor table.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub struct FileDescriptor(pub i32);

/// The descriptor table of a process, which corresponds to the Linux
/// kernel's `struct files_struct`.
#[derive(Clone)]
pub struct FileStruct {
    files: BTreeMap<FileDescriptor, FileKind>,
    limit: usize,
}

impl FileStruct {
    /// Creates a table of `limit` slots with the console at descriptors 0
    /// and 1.
    pub fn new(limit: usize) -> Self {
        let mut files = BTreeMap::new();
        files.insert(FileDescriptor(0), FileKind::Stdin);
        files.insert(FileDescriptor(1), FileKind::Stdout);
        Self { files, limit }
    }

    /// Number of open descriptors.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether every descriptor is closed.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn in_range(&self, fd: FileDescriptor) -> bool {
        fd.0 >= 0 && (fd.0 as usize) < self.limit
    }

    /// Installs `file` at the lowest free descriptor.
    ///
    /// # Returns
    /// - `Err(KernelError::TooManyOpenFile)` if every slot is taken.
    pub fn install(&mut self, file: FileKind) -> Result<FileDescriptor, KernelError> {
        let fd = (0..self.limit as i32)
            .map(FileDescriptor)
            .find(|fd| !self.files.contains_key(fd))
            .ok_or(KernelError::TooManyOpenFile)?;
        self.files.insert(fd, file);
        Ok(fd)
    }

    /// Looks `fd` up.
    ///
    /// # Returns
    /// - `Err(KernelError::BadFileDescriptor)` if `fd` is not open.
    pub fn get(&self, fd: FileDescriptor) -> Result<&FileKind, KernelError> {
        self.files.get(&fd).ok_or(KernelError::BadFileDescriptor)
    }

    /// Looks up `fd`, which must refer to a regular file.
    pub fn regular(&self, fd: FileDescriptor) -> Result<&Arc<OpenFile>, KernelError> {
        match self.get(fd)? {
            FileKind::Regular(file) => Ok(file),
            _ => Err(KernelError::BadFileDescriptor),
        }
    }

    /// Closes `fd`.
    pub fn close(&mut self, fd: FileDescriptor) -> Result<(), KernelError> {
        self.files
            .remove(&fd)
            .map(|_| ())
            .ok_or(KernelError::BadFileDescriptor)
    }

    /// Makes `new` refer to what `old` refers to, closing `new` first if it
    /// is open.
    ///
    /// # Returns
    /// - `Ok(new)`, also when `old == new`.
    /// - `Err(KernelError::BadFileDescriptor)` if `old` is not open or `new`
    ///   is out of range.
    pub fn dup2(
        &mut self,
        old: FileDescriptor,
        new: FileDescriptor,
    ) -> Result<FileDescriptor, KernelError> {
        let file = self.get(old)?.clone();
        if !self.in_range(new) {
            return Err(KernelError::BadFileDescriptor);
        }
        if old != new {
            self.files.insert(new, file);
        }
        Ok(new)
    }

    /// Duplicates the table for a forked child.
    pub fn duplicate(&self) -> Result<Self, KernelError> {
        let mut duplicated: BTreeMap<usize, Arc<OpenFile>> = BTreeMap::new();
        let mut files = BTreeMap::new();
        for (fd, kind) in self.files.iter() {
            let kind = match kind {
                FileKind::Regular(open) => {
                    let key = Arc::as_ptr(open) as usize;
                    let copy = match duplicated.get(&key) {
                        Some(copy) => copy.clone(),
                        None => {
                            let copy = Arc::new(open.duplicate()?);
                            duplicated.insert(key, copy.clone());
                            copy
                        }
                    };
                    FileKind::Regular(copy)
                }
                console => console.clone(),
            };
            files.insert(*fd, kind);
        }
        Ok(Self {
            files,
            limit: self.limit,
        })
    }

    /// Closes every descriptor.
    pub fn clear(&mut self) {
        self.files.clear();
    }
}
