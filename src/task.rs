//! Task trait for interact with user process.

use crate::addressing::Va;
use core::ops::ControlFlow;

pub use crate::vm::fault::PFErrorCode;

/// User-mode register state at a trap boundary.
///
/// Only the registers that the system-call ABI and program startup touch are
/// kept: the instruction and stack pointers, the return register and the six
/// argument registers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Registers {
    /// Instruction pointer.
    pub rip: usize,
    /// Stack pointer.
    pub rsp: usize,
    /// Return value, and the system-call number on entry.
    pub rax: usize,
    /// First argument.
    pub rdi: usize,
    /// Second argument.
    pub rsi: usize,
    /// Third argument.
    pub rdx: usize,
    /// Fourth argument.
    pub r10: usize,
    /// Fifth argument.
    pub r8: usize,
    /// Sixth argument.
    pub r9: usize,
}

impl Registers {
    /// A zeroed register set.
    pub const fn new() -> Self {
        Self {
            rip: 0,
            rsp: 0,
            rax: 0,
            rdi: 0,
            rsi: 0,
            rdx: 0,
            r10: 0,
            r8: 0,
            r9: 0,
        }
    }
}

/// Represents a **task** executed by a thread.
///
/// The embedding kernel forwards the events of a user process here. Both
/// handlers return [`ControlFlow::Break`] with an exit status when the
/// process must terminate; the kernel then calls the process's `exit`.
pub trait Task {
    /// Handles a **system call** triggered by the user program.
    ///
    /// `registers` holds the user context at the `syscall` instruction; the
    /// result is stored back in its `rax`.
    fn syscall(&mut self, registers: &mut Registers) -> ControlFlow<i32>;

    /// Handles a **page fault** raised by the user program at `cr2`, with
    /// user stack pointer `rsp`.
    fn page_fault(&mut self, ec: PFErrorCode, cr2: Va, rsp: Va) -> ControlFlow<i32>;
}
