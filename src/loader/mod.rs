//! ## ELF Loading.
//!
//! A user program is stored as an ELF executable. Its **program headers**
//! describe the segments that make up the memory image: where each goes in
//! memory ([`Phdr::p_vaddr`]), how large it is there ([`Phdr::p_memsz`]),
//! how many bytes come from the file ([`Phdr::p_filesz`]) and from which
//! file offset ([`Phdr::p_offset`]), and its permissions
//! ([`Phdr::p_flags`]).
//!
//! Loading does not read any segment data. For every page a [`PType::Load`]
//! segment covers, [`plan_segment`] registers an uninitialized page that
//! carries [`lazy_fill`] and the [`Segment`] describing which file bytes land
//! in that page. The first access faults the page in. Bytes past `p_filesz`
//! (the `.bss`) are zero-filled.
//!
//! Segments are validated before anything is registered: see
//! [`validate_segment`]. Executables that need a dynamic linker
//! ([`PType::Dynamic`], [`PType::Interp`], [`PType::Shlib`]) are rejected.
//!
//! ## State on Program Startup
//!
//! After the segments, the loader installs one stack page right below
//! [`USER_STACK_TOP`] and copies the arguments onto it.
//!
//! **Example command:** `/bin/ls -l foo bar`
//!
//! | Address    | Name             | Data        | Type          |
//! | ---------- | ---------------- | ----------- | ------------- |
//! | 0x4747fffc | argv\[3\]\[...\] | 'bar\0'     | char\[4\]     |
//! | 0x4747fff8 | argv\[2\]\[...\] | 'foo\0'     | char\[4\]     |
//! | 0x4747fff5 | argv\[1\]\[...\] | '-l\0'      | char\[3\]     |
//! | 0x4747ffed | argv\[0\]\[...\] | '/bin/ls\0' | char\[8\]     |
//! | 0x4747ffe8 | word-align       | 0           | uint8_t\[\]   |
//! | 0x4747ffe0 | argv\[4\]        | 0           | char *        |
//! | 0x4747ffd8 | argv\[3\]        | 0x4747fffc  | char *        |
//! | 0x4747ffd0 | argv\[2\]        | 0x4747fff8  | char *        |
//! | 0x4747ffc8 | argv\[1\]        | 0x4747fff5  | char *        |
//! | 0x4747ffc0 | argv\[0\]        | 0x4747ffed  | char *        |
//! | 0x4747ffb8 | return address   | 0           | void (*) ()   |
//!
//! The stack pointer starts at `0x4747ffb8`; `%rdi` holds `argc` (4) and
//! `%rsi` holds `argv` (`0x4747ffc0`).
//!
//! [`Phdr::p_vaddr`]: elf::Phdr::p_vaddr
//! [`Phdr::p_memsz`]: elf::Phdr::p_memsz
//! [`Phdr::p_filesz`]: elf::Phdr::p_filesz
//! [`Phdr::p_offset`]: elf::Phdr::p_offset
//! [`Phdr::p_flags`]: elf::Phdr::p_flags

pub mod elf;
pub mod stack_builder;

use crate::{
    KernelError,
    addressing::{PAGE_MASK, PAGE_SIZE, USER_STACK_TOP, Va},
    fs::RegularFile,
    mm_struct::MmStruct,
    task::Registers,
    vm::{Segment, VmType, anon::AnonOrigin},
};
use alloc::vec::Vec;
use elf::{Elf, PType, Phdr};
use log::debug;
use stack_builder::StackBuilder;

/// Fills a page from its segment: `read_bytes` bytes from the file at
/// `offset`, then zeros.
///
/// # Returns
/// - `Err(KernelError::IOError)` if the file ends before `read_bytes` bytes
///   were read.
pub fn lazy_fill(segment: &Segment, buf: &mut [u8; PAGE_SIZE]) -> Result<(), KernelError> {
    if segment.read_bytes > PAGE_SIZE {
        return Err(KernelError::InvalidArgument);
    }
    let (data, zero) = buf.split_at_mut(segment.read_bytes);
    segment.file.read_exact(segment.offset, data)?;
    zero.fill(0);
    Ok(())
}

/// Checks that `phdr` describes a loadable segment of a file of
/// `file_length` bytes.
///
/// A valid segment:
/// - has the same offset within a page in the file and in memory,
/// - starts inside the file,
/// - is at least as large in memory as in the file, and not empty,
/// - lies entirely in user space without wrapping around,
/// - does not touch page zero.
pub fn validate_segment(phdr: &Phdr, file_length: usize) -> bool {
    let (offset, vaddr) = (phdr.p_offset as usize, phdr.p_vaddr as usize);
    let (filesz, memsz) = (phdr.p_filesz as usize, phdr.p_memsz as usize);
    if offset & PAGE_MASK != vaddr & PAGE_MASK {
        return false;
    }
    if offset > file_length || memsz < filesz || memsz == 0 {
        return false;
    }
    let Some(end) = vaddr.checked_add(memsz) else {
        return false;
    };
    let user = |addr| Va::new(addr).is_some_and(Va::is_user);
    user(vaddr) && user(end) && vaddr >= PAGE_SIZE
}

/// Registers the pages of one segment.
///
/// `read_bytes` bytes starting at file offset `ofs` are mapped from `upage`
/// on, followed by `zero_bytes` zeros. Each page is an uninitialized
/// anonymous page filled by [`lazy_fill`] on its first access.
///
/// # Returns
/// - `Err(KernelError::InvalidArgument)` if `upage` or `ofs` is not
///   page-aligned, or `read_bytes + zero_bytes` is not a multiple of
///   [`PAGE_SIZE`].
/// - `Err(KernelError::FileExist)` if a page is already registered.
pub fn plan_segment(
    mm_struct: &mut MmStruct,
    file: &RegularFile,
    mut ofs: usize,
    mut upage: Va,
    mut read_bytes: usize,
    mut zero_bytes: usize,
    writable: bool,
) -> Result<(), KernelError> {
    if (read_bytes + zero_bytes) % PAGE_SIZE != 0 || upage.offset() != 0 || ofs % PAGE_SIZE != 0 {
        return Err(KernelError::InvalidArgument);
    }
    while read_bytes > 0 || zero_bytes > 0 {
        let page_read_bytes = read_bytes.min(PAGE_SIZE);
        let page_zero_bytes = PAGE_SIZE - page_read_bytes;
        let segment = Segment {
            file: file.clone(),
            offset: ofs,
            read_bytes: page_read_bytes,
            zero_bytes: page_zero_bytes,
        };
        mm_struct.register(
            VmType::Anon(AnonOrigin::Plain),
            upage,
            writable,
            Some(lazy_fill),
            Some(segment),
        )?;
        read_bytes -= page_read_bytes;
        zero_bytes -= page_zero_bytes;
        ofs += page_read_bytes;
        upage += PAGE_SIZE;
    }
    Ok(())
}

/// A context that holds the necessary state for loading and initializing a user
/// program.
pub struct LoadContext {
    /// Virtual memory layout for the new user program.
    pub mm_struct: MmStruct,
    /// Initial CPU register values for the user process, including the
    /// instruction pointer.
    pub regs: Registers,
}

impl LoadContext {
    /// Creates a context that loads into `mm_struct`.
    pub fn new(mm_struct: MmStruct) -> Self {
        Self {
            mm_struct,
            regs: Registers::new(),
        }
    }

    /// Registers the pages of every loadable segment of `elf`.
    ///
    /// # Returns
    /// - `Err(KernelError::NoExec)` if a segment is invalid or the program
    ///   needs dynamic linking.
    pub fn load_phdr(&mut self, elf: &Elf) -> Result<(), KernelError> {
        let file_length = elf.file.size();
        let phdrs: Vec<Phdr> = elf.phdrs()?;
        for phdr in phdrs.iter() {
            match phdr.ptype() {
                Some(PType::Load) => {
                    if !validate_segment(phdr, file_length) {
                        return Err(KernelError::NoExec);
                    }
                    let file_page = phdr.p_offset as usize & !PAGE_MASK;
                    let vaddr = Va::new(phdr.p_vaddr as usize).ok_or(KernelError::NoExec)?;
                    let page_offset = vaddr.offset();
                    let (filesz, memsz) = (phdr.p_filesz as usize, phdr.p_memsz as usize);
                    let total = (page_offset + memsz).div_ceil(PAGE_SIZE) * PAGE_SIZE;
                    let read_bytes = if filesz > 0 { page_offset + filesz } else { 0 };
                    debug!(
                        "loader: segment {:?} read {:#x} zero {:#x} ({:?})",
                        vaddr.page_down(),
                        read_bytes,
                        total - read_bytes,
                        phdr.permission()
                    );
                    plan_segment(
                        &mut self.mm_struct,
                        elf.file,
                        file_page,
                        vaddr.page_down(),
                        read_bytes,
                        total - read_bytes,
                        phdr.writable(),
                    )?;
                }
                Some(PType::Dynamic | PType::Interp | PType::Shlib) => {
                    return Err(KernelError::NoExec);
                }
                _ => (),
            }
        }
        Ok(())
    }

    /// Builds the initial user stack holding `arguments`.
    ///
    /// Sets `rsp` to the fake return address, `rdi` to `argc` and `rsi` to
    /// `argv`.
    ///
    /// # Returns
    /// - `Err(KernelError::ArgumentListTooLong)` if the arguments do not fit
    ///   into the first stack page.
    pub fn build_stack(&mut self, arguments: &[&str]) -> Result<(), KernelError> {
        let Self {
            mm_struct: mm_state,
            regs,
        } = self;
        let mut builder = StackBuilder::new(mm_state)?;
        let mut argv = Vec::with_capacity(arguments.len());
        for arg in arguments.iter().rev() {
            argv.push(builder.push_str(arg)?);
        }
        builder.align(8)?;
        builder.push_usize(0)?;
        for addr in argv.iter() {
            builder.push_usize(addr.into_usize())?;
        }
        let argv = builder.sp();
        builder.push_usize(0)?;

        regs.rsp = builder.finish().into_usize();
        regs.rdi = arguments.len();
        regs.rsi = argv.into_usize();
        Ok(())
    }

    /// Loads `file` into the address space and prepares the registers to
    /// start it with `args`.
    ///
    /// # Returns
    /// - `Err(KernelError::NoExec)` if `file` is not a valid executable.
    /// - Any error of [`LoadContext::load_phdr`] or
    ///   [`LoadContext::build_stack`].
    pub fn load(mut self, file: &RegularFile, args: &[&str]) -> Result<Self, KernelError> {
        let elf = Elf::from_file(file)?;
        self.regs.rip = elf.entry();
        self.load_phdr(&elf)?;
        self.build_stack(args)?;
        debug!(
            "loader: entry {:#x}, rsp {:#x}, stack top {:#x}",
            self.regs.rip, self.regs.rsp, USER_STACK_TOP
        );
        Ok(self)
    }
}
