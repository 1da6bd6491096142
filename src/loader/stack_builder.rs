//! [`StackBuilder`], a utility for constructing a user-space stack layout.
use crate::{
    KernelError,
    addressing::{PAGE_SIZE, USER_STACK, Va},
    mm_struct::MmStruct,
    vm::{VmType, anon::AnonOrigin},
};

/// A utility for constructing a user-space stack layout.
///
/// [`StackBuilder`] installs the first stack page right below
/// [`USER_STACK`] and pushes data onto it. Everything pushed must fit into
/// that single page; the stack grows further on demand only after the
/// program starts.
///
/// # Usage
/// 1. **Create a new stack** using [`StackBuilder::new`].
/// 2. **Push data** (argument strings, the `argv` array) onto the stack.
/// 3. **Align the stack** for proper memory layout.
/// 4. **Finalize the stack** using [`StackBuilder::finish`].
pub struct StackBuilder<'a> {
    sp: Va,
    limit: Va,
    mm_state: &'a mut MmStruct,
}

impl<'a> StackBuilder<'a> {
    /// Registers and claims the first stack page of `mm_state`.
    ///
    /// # Returns
    /// - `Err(KernelError::NoMemory)` if no frame is available.
    pub fn new(mm_state: &'a mut MmStruct) -> Result<Self, KernelError> {
        let limit = USER_STACK - PAGE_SIZE;
        let page = mm_state.register(VmType::Anon(AnonOrigin::Stack), limit, true, None, None)?;
        if let Err(e) = page.claim(mm_state.page_table(), mm_state.frames()) {
            mm_state.unregister(limit);
            return Err(e);
        }
        Ok(Self {
            sp: USER_STACK,
            limit,
            mm_state,
        })
    }

    /// Consume the [`StackBuilder`] and return the stack pointer.
    pub fn finish(self) -> Va {
        self.sp
    }

    /// Returns the current stack pointer.
    #[inline]
    pub fn sp(&self) -> Va {
        self.sp
    }

    /// Moves the stack pointer down to a multiple of `align`, filling the gap
    /// with zeros.
    ///
    /// # Returns
    /// - `Err(KernelError::ArgumentListTooLong)` if the stack page overflows.
    pub fn align(&mut self, align: usize) -> Result<Va, KernelError> {
        let pad = self.sp.into_usize() % align;
        self.push_bytes(&alloc::vec![0; pad])
    }

    /// Pushes a byte array onto the stack.
    ///
    /// # Returns
    /// - The updated stack pointer after pushing the value.
    /// - `Err(KernelError::ArgumentListTooLong)` if the stack page overflows.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Result<Va, KernelError> {
        if self.sp - self.limit < bytes.len() {
            return Err(KernelError::ArgumentListTooLong);
        }
        let sp = self.sp - bytes.len();
        self.mm_state.write_user(sp, bytes)?;
        self.sp = sp;
        Ok(sp)
    }

    /// Pushes a `usize` value onto the stack.
    pub fn push_usize(&mut self, v: usize) -> Result<Va, KernelError> {
        self.push_bytes(&v.to_ne_bytes())
    }

    /// Pushes a string onto the stack as a C-style string (null-terminated)
    /// and returns its address.
    pub fn push_str(&mut self, s: &str) -> Result<Va, KernelError> {
        self.push_bytes(&[0])?;
        self.push_bytes(s.as_bytes())
    }
}
