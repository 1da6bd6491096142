//! Utility to parsing ELF file.
//!
//! The Executable and Linkable Format (ELF) is the file format of user
//! programs. The loader only looks at the ELF header and the program headers:
//! the program headers list the segments that make up the memory image of
//! the program at run time.
//!
//! Raw headers are read from the file and viewed through the `object`
//! crate's plain-old-data ELF types, so no `unsafe` reinterpretation is
//! needed here.

use crate::{KernelError, fs::RegularFile, mm::page_table::Permission};
use alloc::vec::Vec;
use core::mem::size_of;
use num_enum::TryFromPrimitive;
use object::{
    LittleEndian,
    elf::{
        EM_X86_64, ELFCLASS64, ELFDATA2LSB, ELFMAG, ET_EXEC, EV_CURRENT, FileHeader64,
        ProgramHeader64,
    },
    pod,
};

/// The largest number of program headers accepted.
pub const MAX_PHNUM: usize = 1024;

/// Represents an ELF file in memory.
///
/// This struct provides access to ELF metadata and program headers.
pub struct Elf<'a> {
    /// A parsed ELF header
    pub header: FileHeader64<LittleEndian>,
    /// Reference to the backing file containing ELF data.
    pub file: &'a RegularFile,
}

impl<'a> Elf<'a> {
    /// Attempts to create an [`Elf`] object from a [`RegularFile`].
    ///
    /// # Validity Checks
    /// - Must have the correct ELF magic bytes (`0x7F ELF`).
    /// - Must be 64-bit and little-endian, of the current ELF version.
    /// - Must be an executable for the x86-64 architecture.
    /// - Program header entries must have the 64-bit size, and there may be
    ///   at most [`MAX_PHNUM`] of them.
    ///
    /// # Returns
    /// - `Err(KernelError::NoExec)` if any check fails.
    pub fn from_file(file: &'a RegularFile) -> Result<Self, KernelError> {
        let mut raw = [0u8; size_of::<FileHeader64<LittleEndian>>()];
        if file.read(0, &mut raw)? != raw.len() {
            return Err(KernelError::NoExec);
        }
        let (header, _) =
            pod::from_bytes::<FileHeader64<LittleEndian>>(&raw).map_err(|_| KernelError::NoExec)?;
        let header = *header;
        let e = LittleEndian;
        let ident = &header.e_ident;
        if ident.magic == ELFMAG
            && ident.class == ELFCLASS64
            && ident.data == ELFDATA2LSB
            && ident.version == EV_CURRENT
            && header.e_type.get(e) == ET_EXEC
            && header.e_machine.get(e) == EM_X86_64
            && header.e_version.get(e) == EV_CURRENT as u32
            && header.e_phentsize.get(e) as usize == size_of::<ProgramHeader64<LittleEndian>>()
            && header.e_phnum.get(e) as usize <= MAX_PHNUM
        {
            Ok(Self { header, file })
        } else {
            Err(KernelError::NoExec)
        }
    }

    /// Virtual address of the entry point.
    pub fn entry(&self) -> usize {
        self.header.e_entry.get(LittleEndian) as usize
    }

    /// Reads every program header.
    ///
    /// # Returns
    /// - `Err(KernelError::NoExec)` if the table lies past the end of the
    ///   file.
    pub fn phdrs(&self) -> Result<Vec<Phdr>, KernelError> {
        let e = LittleEndian;
        let count = self.header.e_phnum.get(e) as usize;
        let base = usize::try_from(self.header.e_phoff.get(e)).map_err(|_| KernelError::NoExec)?;
        let mut buffer = alloc::vec![0; count * size_of::<ProgramHeader64<LittleEndian>>()];
        if self.file.read(base, &mut buffer)? != buffer.len() {
            return Err(KernelError::NoExec);
        }
        let (raw, _) = pod::slice_from_bytes::<ProgramHeader64<LittleEndian>>(&buffer, count)
            .map_err(|_| KernelError::NoExec)?;
        Ok(raw
            .iter()
            .map(|ph| Phdr {
                p_type: ph.p_type.get(e),
                p_flags: PFlags::from_bits_truncate(ph.p_flags.get(e)),
                p_offset: ph.p_offset.get(e),
                p_vaddr: ph.p_vaddr.get(e),
                p_filesz: ph.p_filesz.get(e),
                p_memsz: ph.p_memsz.get(e),
            })
            .collect())
    }
}

/// ELF program header type.
///
/// Types the loader does not know are ignored, so this enum only lists the
/// standard ones.
#[repr(u32)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, TryFromPrimitive)]
pub enum PType {
    /// Unused segment.
    Null = 0x0,
    /// Loadable segment.
    Load = 0x1,
    /// Dynamic linking information.
    Dynamic = 0x2,
    /// Interpreter path (for dynamically linked executables).
    Interp = 0x3,
    /// Auxiliary information.
    Note = 0x4,
    /// Reserved.
    Shlib = 0x5,
    /// Program header table itself.
    Phdr = 0x6,
    /// Thread-Local Storage (TLS) template.
    Tls = 0x7,
    /// GNU-specific: Exception handling information.
    GnuEhFrame = 0x6474e550,
    /// GNU-specific: Stack segment flags.
    GnuStack = 0x6474e551,
    /// GNU-specific: Read-only after relocation.
    GnuRelro = 0x6474e552,
    /// GNU-specific.
    GnuProperty = 0x6474e553,
}

bitflags::bitflags! {
    /// Segment permission flags for ELF program headers.
    pub struct PFlags: u32 {
        /// Segment is readable.
        const READ = 1 << 2;
        /// Segment is writable.
        const WRITE = 1 << 1;
        /// Segment is executable.
        const EXECUTABLE = 1 << 0;
    }
}

/// ELF program header for 64-bit binaries, in native byte order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Phdr {
    /// Raw segment type. See [`Phdr::ptype`].
    pub p_type: u32,
    /// Segment permissions.
    pub p_flags: PFlags,
    /// Offset in the file where the segment starts.
    pub p_offset: u64,
    /// Virtual address where the segment should be mapped in memory.
    pub p_vaddr: u64,
    /// Size of the segment in the file.
    pub p_filesz: u64,
    /// Size of the segment in memory.
    pub p_memsz: u64,
}

impl Phdr {
    /// The segment type, if it is a known one.
    pub fn ptype(&self) -> Option<PType> {
        PType::try_from(self.p_type).ok()
    }

    /// Whether the segment must be mapped writable.
    pub fn writable(&self) -> bool {
        self.p_flags.contains(PFlags::WRITE)
    }

    /// Translates the segment flags into memory permissions.
    pub fn permission(&self) -> Permission {
        let mut permission = Permission::USER;
        if self.p_flags.contains(PFlags::READ) {
            permission |= Permission::READ;
        }
        if self.p_flags.contains(PFlags::WRITE) {
            permission |= Permission::WRITE;
        }
        if self.p_flags.contains(PFlags::EXECUTABLE) {
            permission |= Permission::EXECUTABLE;
        }
        permission
    }
}
