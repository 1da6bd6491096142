//! # Processes
//!
//! A [`Process`] bundles everything a user program owns: its address space
//! ([`MmStruct`]), its descriptor table ([`FileStruct`]), the executable it
//! runs (write-denied while it runs) and its un-waited children.
//!
//! ## Exit and wait
//!
//! Parent and child share an [`ExitRecord`]. The parent holds it through a
//! [`Child`] handle. On exit a process releases its resources, records its
//! status and signals `exited`; it then blocks on `reaped` until the parent
//! has collected the status with [`Process::wait`] or dropped the handle
//! (including by exiting itself). [`Process::wait`] returns the status of a
//! given child exactly once.

use crate::{
    KernelError,
    addressing::Va,
    file_struct::{FileDescriptor, FileStruct},
    fs::RegularFile,
    kernel::{Kernel, Pid},
    loader::LoadContext,
    mm_struct::MmStruct,
    sync::{Semaphore, SpinLock},
    task::{PFErrorCode, Registers, Task},
    vm::fault::PageFaultReason,
};
use alloc::{boxed::Box, collections::BTreeMap, format, string::String, sync::Arc, vec::Vec};
use core::ops::ControlFlow;
use log::{info, warn};

/// Exit status of a process killed by the kernel.
pub const KILLED: i32 = -1;

/// The exit handshake between a process and its parent.
pub struct ExitRecord {
    pid: Pid,
    status: SpinLock<Option<i32>>,
    exited: Semaphore<()>,
    reaped: Semaphore<()>,
}

impl ExitRecord {
    pub(crate) fn new(pid: Pid) -> Arc<Self> {
        Arc::new(Self {
            pid,
            status: SpinLock::new(None),
            exited: Semaphore::new(0, ()),
            reaped: Semaphore::new(0, ()),
        })
    }

    /// The process this record belongs to.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// The exit status, once the process has exited.
    pub fn status(&self) -> Option<i32> {
        *self.status.lock()
    }

    fn report(&self, status: i32) {
        *self.status.lock() = Some(status);
        self.exited.signal();
    }
}

/// The parent's handle on a child process.
///
/// Dropping the handle releases the child without reading its status.
pub struct Child {
    record: Arc<ExitRecord>,
}

impl Child {
    pub(crate) fn new(record: Arc<ExitRecord>) -> Self {
        Self { record }
    }

    /// The child's process id.
    pub fn pid(&self) -> Pid {
        self.record.pid
    }

    /// Whether the child has exited.
    pub fn has_exited(&self) -> bool {
        self.record.status().is_some()
    }

    /// Blocks until the child exits and returns its status.
    pub fn join(self) -> i32 {
        self.record.exited.take();
        self.record.status().unwrap_or(KILLED)
    }
}

impl Drop for Child {
    fn drop(&mut self) {
        self.record.reaped.signal();
    }
}

/// Splits a command line into its arguments.
///
/// # Returns
/// - `Err(KernelError::InvalidArgument)` if the command line is empty.
/// - `Err(KernelError::ArgumentListTooLong)` if it has more than `max_args`
///   arguments.
pub fn parse_command_line(command_line: &str, max_args: usize) -> Result<Vec<&str>, KernelError> {
    let args: Vec<&str> = command_line.split_whitespace().collect();
    if args.is_empty() {
        Err(KernelError::InvalidArgument)
    } else if args.len() > max_args {
        Err(KernelError::ArgumentListTooLong)
    } else {
        Ok(args)
    }
}

/// Reports the exit of `name` on the log and the console.
fn announce_exit(kernel: &Kernel, name: &str, status: i32) {
    let line = format!("{}: exit({})\n", name, status);
    info!("{}", line.trim_end());
    if let Some(console) = kernel.console() {
        console.write(line.as_bytes());
    }
}

/// A loaded program: address space, executable and initial registers.
struct Image {
    mm_struct: MmStruct,
    exec_file: RegularFile,
    regs: Registers,
}

impl Image {
    fn load(kernel: &Kernel, args: &[&str]) -> Result<Self, KernelError> {
        let exec_file = kernel.fs().open(args[0])?;
        exec_file.deny_write();
        let loaded = kernel.mmu().create_page_table().and_then(|page_table| {
            let mm_struct =
                MmStruct::new(page_table, kernel.frames().clone(), kernel.max_stack_size());
            LoadContext::new(mm_struct).load(&exec_file, args)
        });
        match loaded {
            Ok(LoadContext { mm_struct, regs }) => Ok(Self {
                mm_struct,
                exec_file,
                regs,
            }),
            Err(e) => {
                exec_file.allow_write();
                Err(e)
            }
        }
    }
}

/// A user process.
pub struct Process {
    kernel: Arc<Kernel>,
    name: String,
    pub(crate) mm_struct: MmStruct,
    pub(crate) file_struct: FileStruct,
    exec_file: Option<RegularFile>,
    pub(crate) children: BTreeMap<Pid, Child>,
    record: Arc<ExitRecord>,
    exited: bool,
}

impl Process {
    pub(crate) fn from_parts(
        kernel: Arc<Kernel>,
        name: String,
        mm_struct: MmStruct,
        file_struct: FileStruct,
        exec_file: Option<RegularFile>,
        record: Arc<ExitRecord>,
    ) -> Self {
        Self {
            kernel,
            name,
            mm_struct,
            file_struct,
            exec_file,
            children: BTreeMap::new(),
            record,
            exited: false,
        }
    }

    /// Creates a process running `command_line`.
    fn load(
        kernel: Arc<Kernel>,
        record: Arc<ExitRecord>,
        command_line: &str,
    ) -> Result<(Self, Registers), KernelError> {
        let args = parse_command_line(command_line, kernel.max_args())?;
        let Image {
            mm_struct,
            exec_file,
            regs,
        } = Image::load(&kernel, &args)?;
        let file_struct = FileStruct::new(kernel.max_open_files());
        let name = String::from(args[0]);
        Ok((
            Self::from_parts(kernel, name, mm_struct, file_struct, Some(exec_file), record),
            regs,
        ))
    }

    /// The process id.
    pub fn pid(&self) -> Pid {
        self.record.pid
    }

    /// The process name: `argv[0]` of the running program.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The kernel this process runs on.
    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    /// The address space.
    pub fn mm_struct(&self) -> &MmStruct {
        &self.mm_struct
    }

    /// The address space.
    pub fn mm_struct_mut(&mut self) -> &mut MmStruct {
        &mut self.mm_struct
    }

    /// The descriptor table.
    pub fn file_struct(&self) -> &FileStruct {
        &self.file_struct
    }

    /// The descriptor table.
    pub fn file_struct_mut(&mut self) -> &mut FileStruct {
        &mut self.file_struct
    }

    /// The executable this process runs.
    pub fn exec_file(&self) -> Option<&RegularFile> {
        self.exec_file.as_ref()
    }

    /// Replaces the running program with `command_line`.
    ///
    /// The new program is loaded into a fresh address space. Only when the
    /// load succeeds are the old address space and executable released; on
    /// failure the process is unchanged.
    ///
    /// # Returns
    /// - The registers to start the new program with.
    pub fn exec(&mut self, command_line: &str) -> Result<Registers, KernelError> {
        let args = parse_command_line(command_line, self.kernel.max_args())?;
        let Image {
            mm_struct,
            exec_file,
            regs,
        } = Image::load(&self.kernel, &args)?;
        mm_struct.page_table().activate();
        drop(core::mem::replace(&mut self.mm_struct, mm_struct));
        if let Some(old) = self.exec_file.replace(exec_file) {
            old.allow_write();
        }
        self.name = String::from(args[0]);
        Ok(regs)
    }

    /// Maps `length` bytes of the file open at `fd` at `addr`.
    ///
    /// # Returns
    /// - `Err(KernelError::BadFileDescriptor)` if `fd` is not a regular file.
    /// - Any error of [`MmStruct::mmap`].
    pub fn mmap(
        &mut self,
        addr: Va,
        length: usize,
        writable: bool,
        fd: FileDescriptor,
        offset: usize,
    ) -> Result<Va, KernelError> {
        let file = self
            .file_struct
            .regular(fd)
            .ok()
            .map(|open| open.file().clone());
        self.mm_struct
            .mmap(addr, length, writable, file.as_ref(), offset)
    }

    /// Unmaps the mapping that starts at `addr`.
    pub fn munmap(&mut self, addr: Va) -> Result<(), KernelError> {
        self.mm_struct.munmap(addr)
    }

    /// Resolves a page fault raised by user code.
    pub fn page_fault(&mut self, ec: PFErrorCode, cr2: Va, rsp: Va) -> Result<(), KernelError> {
        self.mm_struct
            .handle_fault(&PageFaultReason::new(ec, cr2), rsp)
    }

    /// Waits for the child `pid` to exit and returns its status.
    ///
    /// # Returns
    /// - `Err(KernelError::NoChild)` if `pid` is not an un-waited child.
    pub fn wait(&mut self, pid: Pid) -> Result<i32, KernelError> {
        self.children
            .remove(&pid)
            .map(Child::join)
            .ok_or(KernelError::NoChild)
    }

    /// Releases every resource and publishes `status`.
    fn terminate(&mut self, status: i32) {
        if self.exited {
            return;
        }
        self.exited = true;
        announce_exit(&self.kernel, &self.name, status);
        self.file_struct.clear();
        self.mm_struct.kill();
        if let Some(exec_file) = self.exec_file.take() {
            exec_file.allow_write();
        }
        self.record.report(status);
        self.children.clear();
    }

    /// Terminates the process with `status`.
    ///
    /// Returns once the parent has collected the status or released its
    /// handle.
    pub fn exit(mut self, status: i32) {
        self.terminate(status);
        self.record.reaped.take();
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        self.terminate(KILLED);
    }
}

impl Task for Process {
    fn syscall(&mut self, registers: &mut Registers) -> ControlFlow<i32> {
        self.dispatch(registers)
    }

    fn page_fault(&mut self, ec: PFErrorCode, cr2: Va, rsp: Va) -> ControlFlow<i32> {
        match Process::page_fault(self, ec, cr2, rsp) {
            Ok(()) => ControlFlow::Continue(()),
            Err(e) => {
                warn!("{}: page fault at {:?} ({:?}): {:?}", self.name, cr2, ec, e);
                ControlFlow::Break(KILLED)
            }
        }
    }
}

/// Spawns the first user process, running `command_line`.
///
/// A process that fails to load exits with status `-1`.
pub fn create_initial_process(kernel: &Arc<Kernel>, command_line: &str) -> Child {
    let record = ExitRecord::new(kernel.allocate_pid());
    let child = Child::new(record.clone());
    let name = command_line
        .split_whitespace()
        .next()
        .unwrap_or_default();
    let body = {
        let kernel = kernel.clone();
        let command_line = String::from(command_line);
        move || {
            let scheduler = kernel.scheduler().clone();
            match Process::load(kernel.clone(), record.clone(), &command_line) {
                Ok((process, regs)) => scheduler.launch(process, regs),
                Err(e) => {
                    warn!("{}: load failed: {:?}", command_line, e);
                    let name = command_line.split_whitespace().next().unwrap_or_default();
                    announce_exit(&kernel, name, KILLED);
                    record.report(KILLED);
                    record.reaped.take();
                }
            }
        }
    };
    kernel.scheduler().spawn(name, Box::new(body));
    child
}
