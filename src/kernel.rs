//! The kernel context.
//!
//! Every process operation runs against an explicit [`Kernel`]: the frame
//! table all address spaces draw from, the file system executables and
//! mapped files come from, the MMU that creates page tables, the scheduler
//! that runs processes, and the configured limits. A [`Kernel`] is built
//! once with [`KernelBuilder`] and shared behind an [`Arc`].

use crate::{
    KernelError,
    addressing::DEFAULT_MAX_STACK_SIZE,
    fs::traits::{Console, FileSystem},
    mm::{frame::FrameTable, page_table::Mmu, swap::SwapDevice, swap::SwapTable},
    process::Process,
    task::Registers,
};
use alloc::{boxed::Box, sync::Arc};
use core::sync::atomic::{AtomicUsize, Ordering};

/// Default number of user frames.
pub const DEFAULT_FRAME_COUNT: usize = 1024;
/// Default bound on the number of command-line arguments.
pub const DEFAULT_MAX_ARGS: usize = 64;
/// Default size of a descriptor table.
pub const DEFAULT_MAX_OPEN_FILES: usize = 128;

/// Creates threads and enters user mode.
pub trait Scheduler
where
    Self: Send + Sync,
{
    /// Runs `body` on a new kernel thread named `name`.
    fn spawn(&self, name: &str, body: Box<dyn FnOnce() + Send>);

    /// Runs `process` in user mode from `regs` on the calling thread.
    ///
    /// The process's [`Task`] handlers are driven from here until one of
    /// them breaks with an exit status, upon which the scheduler calls
    /// [`Process::exit`].
    ///
    /// [`Task`]: crate::task::Task
    fn launch(&self, process: Process, regs: Registers);

    /// Powers the machine off.
    ///
    /// On a machine this does not return. A hosted scheduler may return,
    /// in which case the calling process is terminated.
    fn shutdown(&self);
}

/// Process identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub usize);

impl Pid {
    /// Returns the raw identifier.
    pub fn into_usize(self) -> usize {
        self.0
    }
}

/// The explicit context shared by every process.
pub struct Kernel {
    frames: Arc<FrameTable>,
    fs: Arc<dyn FileSystem>,
    mmu: Arc<dyn Mmu>,
    scheduler: Arc<dyn Scheduler>,
    console: Option<Arc<dyn Console>>,
    max_stack_size: usize,
    max_args: usize,
    max_open_files: usize,
    next_pid: AtomicUsize,
}

impl Kernel {
    /// The frame table shared by every address space.
    pub fn frames(&self) -> &Arc<FrameTable> {
        &self.frames
    }

    /// The file system.
    pub fn fs(&self) -> &dyn FileSystem {
        self.fs.as_ref()
    }

    /// The MMU.
    pub fn mmu(&self) -> &dyn Mmu {
        self.mmu.as_ref()
    }

    /// The scheduler.
    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    /// The console, if one is attached.
    pub fn console(&self) -> Option<&Arc<dyn Console>> {
        self.console.as_ref()
    }

    /// Maximum size of a user stack.
    pub fn max_stack_size(&self) -> usize {
        self.max_stack_size
    }

    /// Maximum number of command-line arguments.
    pub fn max_args(&self) -> usize {
        self.max_args
    }

    /// Number of slots in a descriptor table.
    pub fn max_open_files(&self) -> usize {
        self.max_open_files
    }

    /// Hands out a fresh process identifier.
    pub fn allocate_pid(&self) -> Pid {
        Pid(self.next_pid.fetch_add(1, Ordering::Relaxed))
    }
}

/// The [`KernelBuilder`] struct provides an interface for configuring the
/// kernel context before any process runs.
///
/// The file system, the MMU and the scheduler are mandatory; everything else
/// has a default.
pub struct KernelBuilder {
    frame_count: usize,
    swap: Option<Arc<dyn SwapDevice>>,
    fs: Option<Arc<dyn FileSystem>>,
    mmu: Option<Arc<dyn Mmu>>,
    scheduler: Option<Arc<dyn Scheduler>>,
    console: Option<Arc<dyn Console>>,
    max_stack_size: usize,
    max_args: usize,
    max_open_files: usize,
}

impl Default for KernelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelBuilder {
    /// Starts a configuration with default limits.
    pub fn new() -> Self {
        Self {
            frame_count: DEFAULT_FRAME_COUNT,
            swap: None,
            fs: None,
            mmu: None,
            scheduler: None,
            console: None,
            max_stack_size: DEFAULT_MAX_STACK_SIZE,
            max_args: DEFAULT_MAX_ARGS,
            max_open_files: DEFAULT_MAX_OPEN_FILES,
        }
    }

    /// Sets the number of user frames.
    pub fn frames(mut self, count: usize) -> Self {
        self.frame_count = count;
        self
    }

    /// Attaches a swap device.
    pub fn swap(mut self, device: Arc<dyn SwapDevice>) -> Self {
        self.swap = Some(device);
        self
    }

    /// Sets the file system.
    pub fn file_system(mut self, fs: Arc<dyn FileSystem>) -> Self {
        self.fs = Some(fs);
        self
    }

    /// Sets the MMU.
    pub fn mmu(mut self, mmu: Arc<dyn Mmu>) -> Self {
        self.mmu = Some(mmu);
        self
    }

    /// Sets the scheduler.
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Attaches the console behind descriptors 0 and 1.
    pub fn console(mut self, console: Arc<dyn Console>) -> Self {
        self.console = Some(console);
        self
    }

    /// Sets the maximum size of a user stack.
    pub fn max_stack_size(mut self, size: usize) -> Self {
        self.max_stack_size = size;
        self
    }

    /// Sets the maximum number of command-line arguments.
    pub fn max_args(mut self, count: usize) -> Self {
        self.max_args = count;
        self
    }

    /// Sets the number of slots in a descriptor table.
    pub fn max_open_files(mut self, count: usize) -> Self {
        self.max_open_files = count;
        self
    }

    /// Finishes the configuration.
    ///
    /// # Returns
    /// - `Err(KernelError::InvalidArgument)` if the file system, the MMU or
    ///   the scheduler is missing, or the descriptor table cannot hold the
    ///   two console descriptors.
    pub fn build(self) -> Result<Arc<Kernel>, KernelError> {
        let (Some(fs), Some(mmu), Some(scheduler)) = (self.fs, self.mmu, self.scheduler) else {
            return Err(KernelError::InvalidArgument);
        };
        if self.max_open_files < 2 {
            return Err(KernelError::InvalidArgument);
        }
        Ok(Arc::new(Kernel {
            frames: FrameTable::new(self.frame_count, SwapTable::new(self.swap)),
            fs,
            mmu,
            scheduler,
            console: self.console,
            max_stack_size: self.max_stack_size,
            max_args: self.max_args,
            max_open_files: self.max_open_files,
            next_pid: AtomicUsize::new(1),
        }))
    }
}
