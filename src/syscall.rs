//! # System call dispatch
//!
//! User programs request kernel services with the `syscall` instruction. The
//! system-call number is passed in `%rax` and up to six arguments in `%rdi`,
//! `%rsi`, `%rdx`, `%r10`, `%r8` and `%r9`. The result goes back in `%rax`;
//! failures are reported as a negative errno ([`KernelError::into_usize`]).
//!
//! The user stack pointer is recorded on entry, so that the kernel's own
//! accesses to user buffers can grow the stack like user code would.
//!
//! User pointers are never trusted. Every access goes through
//! [`MmStruct::read_user`] and friends, and an access the fault handler
//! rejects terminates the process with exit status `-1`.
//!
//! | Number | Call       | Arguments                               | Returns            |
//! | ------ | ---------- | --------------------------------------- | ------------------ |
//! | 0      | `halt`     | -                                       | -                  |
//! | 1      | `exit`     | status                                  | -                  |
//! | 2      | `fork`     | name (may be null)                      | child pid / 0      |
//! | 3      | `exec`     | command line                            | - (exit -1 on err) |
//! | 4      | `wait`     | pid                                     | exit status        |
//! | 5      | `create`   | path, initial size                      | 1 / 0              |
//! | 6      | `remove`   | path                                    | 1 / 0              |
//! | 7      | `open`     | path                                    | fd                 |
//! | 8      | `filesize` | fd                                      | size               |
//! | 9      | `read`     | fd, buffer, size                        | bytes read         |
//! | 10     | `write`    | fd, buffer, size                        | bytes written      |
//! | 11     | `seek`     | fd, position                            | 0                  |
//! | 12     | `tell`     | fd                                      | position           |
//! | 13     | `close`    | fd                                      | 0                  |
//! | 14     | `mmap`     | addr, length, writable, fd, offset      | addr, or 0 on err  |
//! | 15     | `munmap`   | addr                                    | 0                  |
//! | 22     | `dup2`     | old fd, new fd                          | new fd             |

use crate::{
    KernelError,
    addressing::{PAGE_SIZE, Va},
    file_struct::{FileDescriptor, FileKind, OpenFile},
    kernel::Pid,
    mm_struct::MmStruct,
    process::{KILLED, Process},
    task::Registers,
};
use alloc::{string::String, sync::Arc, vec};
use core::ops::ControlFlow;
use log::debug;
use num_enum::TryFromPrimitive;

/// Longest path or command line accepted from user memory.
pub const MAX_USER_STRING: usize = PAGE_SIZE;

/// System call numbers.
#[repr(usize)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
pub enum SyscallNumber {
    /// Halt the operating system.
    Halt = 0,
    /// Terminate this process.
    Exit = 1,
    /// Clone current process.
    Fork = 2,
    /// Switch current process.
    Exec = 3,
    /// Wait for a child process to die.
    Wait = 4,
    /// Create a file.
    Create = 5,
    /// Delete a file.
    Remove = 6,
    /// Open a file.
    Open = 7,
    /// Obtain a file's size.
    FileSize = 8,
    /// Read from a file.
    Read = 9,
    /// Write to a file.
    Write = 10,
    /// Change position in a file.
    Seek = 11,
    /// Report current position in a file.
    Tell = 12,
    /// Close a file.
    Close = 13,
    /// Map a file into memory.
    Mmap = 14,
    /// Remove a memory mapping.
    Munmap = 15,
    /// Duplicate a file descriptor.
    Dup2 = 22,
}

/// A struct representing the system call ABI (Application Binary Interface).
///
/// It holds the system call number and the six arguments, and a mutable
/// reference to the [`Registers`] the result is written back to.
pub struct SyscallAbi<'a> {
    /// The system call number that identifies the requested system service.
    pub sysno: usize,
    /// First argument for the system call.
    pub arg1: usize,
    /// Second argument for the system call.
    pub arg2: usize,
    /// Third argument for the system call.
    pub arg3: usize,
    /// Fourth argument for the system call.
    pub arg4: usize,
    /// Fifth argument for the system call.
    pub arg5: usize,
    /// Sixth argument for the system call.
    pub arg6: usize,
    /// The user context of the system call.
    pub regs: &'a mut Registers,
}

impl<'a> SyscallAbi<'a> {
    /// Constructs a [`SyscallAbi`] instance from the provided registers.
    pub fn from_registers(regs: &'a mut Registers) -> Self {
        Self {
            sysno: regs.rax,
            arg1: regs.rdi,
            arg2: regs.rsi,
            arg3: regs.rdx,
            arg4: regs.r10,
            arg5: regs.r8,
            arg6: regs.r9,
            regs,
        }
    }

    /// Sets the return value for the system call.
    ///
    /// `%rax` receives the value on success and the negative errno on
    /// failure.
    pub fn set_return_value(self, return_val: Result<usize, KernelError>) {
        self.regs.rax = match return_val {
            Ok(v) => v,
            Err(e) => e.into_usize(),
        };
    }

    /// Turns an argument into a descriptor.
    ///
    /// Values that do not fit a descriptor never name an open file.
    fn fd(arg: usize) -> Result<FileDescriptor, KernelError> {
        i32::try_from(arg)
            .map(FileDescriptor)
            .map_err(|_| KernelError::BadFileDescriptor)
    }
}

/// Turns an argument into a user address.
fn user_va(addr: usize) -> Result<Va, KernelError> {
    Va::new(addr).ok_or(KernelError::BadAddress)
}

/// Any failure to touch user memory is a bad address.
fn fault(_: KernelError) -> KernelError {
    KernelError::BadAddress
}

/// `create` and `remove` answer with a boolean; only bad pointers are errors.
fn truth(result: Result<(), KernelError>) -> Result<usize, KernelError> {
    match result {
        Ok(()) => Ok(1),
        Err(KernelError::BadAddress) => Err(KernelError::BadAddress),
        Err(_) => Ok(0),
    }
}

fn read_user_string(mm: &mut MmStruct, addr: usize) -> Result<String, KernelError> {
    mm.read_user_str(user_va(addr)?, MAX_USER_STRING)
        .map_err(|e| match e {
            KernelError::InvalidArgument => KernelError::InvalidArgument,
            e => fault(e),
        })
}

impl Process {
    /// Dispatches the system call in `regs`.
    ///
    /// # Returns
    /// - [`ControlFlow::Break`] with the exit status if the process must
    ///   terminate: on `exit`, on a failed `exec`, and on any invalid user
    ///   memory access.
    pub fn dispatch(&mut self, regs: &mut Registers) -> ControlFlow<i32> {
        let Ok(rsp) = user_va(regs.rsp) else {
            return ControlFlow::Break(KILLED);
        };
        self.mm_struct.record_stack_pointer(rsp);
        let abi = SyscallAbi::from_registers(regs);
        let result = match SyscallNumber::try_from(abi.sysno) {
            Ok(SyscallNumber::Halt) => {
                debug!("{}: halt", self.name());
                self.kernel().scheduler().shutdown();
                return ControlFlow::Break(0);
            }
            Ok(SyscallNumber::Exit) => return ControlFlow::Break(abi.arg1 as i32),
            Ok(SyscallNumber::Exec) => {
                return match self.sys_exec(&abi) {
                    Ok(new_regs) => {
                        *abi.regs = new_regs;
                        ControlFlow::Continue(())
                    }
                    Err(e) => {
                        debug!("{}: exec failed: {:?}", self.name(), e);
                        ControlFlow::Break(KILLED)
                    }
                };
            }
            Ok(SyscallNumber::Fork) => self.sys_fork(&abi),
            Ok(SyscallNumber::Wait) => self
                .wait(Pid(abi.arg1))
                .map(|status| status as isize as usize),
            Ok(SyscallNumber::Create) => self.sys_create(&abi),
            Ok(SyscallNumber::Remove) => self.sys_remove(&abi),
            Ok(SyscallNumber::Open) => self.sys_open(&abi),
            Ok(SyscallNumber::FileSize) => self.sys_filesize(&abi),
            Ok(SyscallNumber::Read) => self.sys_read(&abi),
            Ok(SyscallNumber::Write) => self.sys_write(&abi),
            Ok(SyscallNumber::Seek) => self.sys_seek(&abi),
            Ok(SyscallNumber::Tell) => self.sys_tell(&abi),
            Ok(SyscallNumber::Close) => self.sys_close(&abi),
            Ok(SyscallNumber::Mmap) => Ok(self.sys_mmap(&abi)),
            Ok(SyscallNumber::Munmap) => user_va(abi.arg1)
                .and_then(|addr| self.munmap(addr))
                .map(|_| 0),
            Ok(SyscallNumber::Dup2) => self.sys_dup2(&abi),
            Err(_) => Err(KernelError::NoSuchSyscall),
        };
        if result == Err(KernelError::BadAddress) {
            debug!("{}: bad user pointer in {:#x}", self.name(), abi.sysno);
            return ControlFlow::Break(KILLED);
        }
        abi.set_return_value(result);
        ControlFlow::Continue(())
    }

    fn sys_exec(&mut self, abi: &SyscallAbi) -> Result<Registers, KernelError> {
        let command_line = read_user_string(&mut self.mm_struct, abi.arg1)?;
        self.exec(&command_line)
    }

    fn sys_fork(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let name = match abi.arg1 {
            0 => String::from(self.name()),
            addr => read_user_string(&mut self.mm_struct, addr)?,
        };
        self.fork(&name, &*abi.regs).map(Pid::into_usize)
    }

    fn sys_create(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let result = read_user_string(&mut self.mm_struct, abi.arg1)
            .and_then(|path| self.kernel().fs().create(&path, abi.arg2));
        truth(result)
    }

    fn sys_remove(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let result = read_user_string(&mut self.mm_struct, abi.arg1)
            .and_then(|path| self.kernel().fs().remove(&path));
        truth(result)
    }

    fn sys_open(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let path = read_user_string(&mut self.mm_struct, abi.arg1)?;
        let file = self.kernel().fs().open(&path)?;
        let fd = self
            .file_struct
            .install(FileKind::Regular(Arc::new(OpenFile::new(file))))?;
        Ok(fd.0 as usize)
    }

    fn sys_close(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        self.file_struct.close(SyscallAbi::fd(abi.arg1)?)?;
        Ok(0)
    }

    fn sys_dup2(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let (old, new) = (SyscallAbi::fd(abi.arg1)?, SyscallAbi::fd(abi.arg2)?);
        Ok(self.file_struct.dup2(old, new)?.0 as usize)
    }

    fn sys_filesize(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        Ok(self.file_struct.regular(SyscallAbi::fd(abi.arg1)?)?.size())
    }

    fn sys_read(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let (addr, size) = (user_va(abi.arg2)?, abi.arg3);
        let kind = self.file_struct.get(SyscallAbi::fd(abi.arg1)?)?.clone();
        let mut buf = vec![0; size.min(PAGE_SIZE)];
        let mut done = 0;
        while done < size {
            let len = (size - done).min(buf.len());
            let read = match &kind {
                FileKind::Stdin => self
                    .kernel()
                    .console()
                    .map_or(0, |console| console.read(&mut buf[..len])),
                FileKind::Stdout => return Err(KernelError::BadFileDescriptor),
                FileKind::Regular(file) => file.read(&mut buf[..len])?,
            };
            let dst = addr.checked_add(done).ok_or(KernelError::BadAddress)?;
            self.mm_struct.write_user(dst, &buf[..read]).map_err(fault)?;
            done += read;
            if read < len {
                break;
            }
        }
        Ok(done)
    }

    fn sys_write(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let (addr, size) = (user_va(abi.arg2)?, abi.arg3);
        let kind = self.file_struct.get(SyscallAbi::fd(abi.arg1)?)?.clone();
        let mut buf = vec![0; size.min(PAGE_SIZE)];
        let mut done = 0;
        while done < size {
            let len = (size - done).min(buf.len());
            let src = addr.checked_add(done).ok_or(KernelError::BadAddress)?;
            self.mm_struct.read_user(src, &mut buf[..len]).map_err(fault)?;
            let written = match &kind {
                FileKind::Stdin => return Err(KernelError::BadFileDescriptor),
                FileKind::Stdout => {
                    if let Some(console) = self.kernel().console() {
                        console.write(&buf[..len]);
                    }
                    len
                }
                FileKind::Regular(file) => file.write(&buf[..len])?,
            };
            done += written;
            if written < len {
                break;
            }
        }
        Ok(done)
    }

    fn sys_seek(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        self.file_struct
            .regular(SyscallAbi::fd(abi.arg1)?)?
            .seek(abi.arg2);
        Ok(0)
    }

    fn sys_tell(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        Ok(self.file_struct.regular(SyscallAbi::fd(abi.arg1)?)?.tell())
    }

    /// `mmap` reports every failure as a null address.
    fn sys_mmap(&mut self, abi: &SyscallAbi) -> usize {
        let result = user_va(abi.arg1).and_then(|addr| {
            let fd = SyscallAbi::fd(abi.arg4)?;
            self.mmap(addr, abi.arg2, abi.arg3 != 0, fd, abi.arg5)
        });
        match result {
            Ok(addr) => addr.into_usize(),
            Err(e) => {
                debug!("{}: mmap failed: {:?}", self.name(), e);
                0
            }
        }
    }
}
