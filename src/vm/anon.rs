//! Anonymous pages.
//!
//! Anonymous pages have no backing file. They come into existence
//! zero-filled (or filled from an executable segment by their initializer)
//! and live in a swap slot while evicted.

use crate::{
    KernelError,
    addressing::PAGE_SIZE,
    mm::swap::{SwapSlot, SwapTable},
};

/// Why an anonymous page exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnonOrigin {
    /// Executable segment or plain anonymous memory.
    Plain,
    /// User stack.
    Stack,
}

/// Payload of an anonymous page.
#[derive(Debug)]
pub struct AnonPage {
    /// The swap slot holding the contents while the page is evicted.
    pub slot: Option<SwapSlot>,
    /// Why the page exists.
    pub origin: AnonOrigin,
}

impl AnonPage {
    /// A fresh anonymous page that was never evicted.
    pub fn new(origin: AnonOrigin) -> Self {
        Self { slot: None, origin }
    }

    /// Restores the contents into a zeroed frame.
    pub(crate) fn fill(&self, buf: &mut [u8; PAGE_SIZE], swap: &SwapTable) -> Result<(), KernelError> {
        match self.slot {
            Some(slot) => swap.read(slot, buf),
            None => Ok(()),
        }
    }

    /// Releases the swap slot after the contents were restored.
    pub(crate) fn swapped_in(&mut self, swap: &SwapTable) {
        if let Some(slot) = self.slot.take() {
            swap.free(slot);
        }
    }

    pub(crate) fn swap_out(&mut self, buf: &[u8; PAGE_SIZE], swap: &SwapTable) -> Result<(), KernelError> {
        self.slot = Some(swap.swap_out(buf)?);
        Ok(())
    }

    pub(crate) fn destroy(&mut self, swap: &SwapTable) {
        self.swapped_in(swap)
    }
}
