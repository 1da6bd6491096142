//! Swap space for evicted anonymous pages.
//!
//! The swap partition is a [`SwapDevice`]: an array of page-sized slots. The
//! [`SwapTable`] hands out free slots from a lock-free queue, so a slot is
//! owned by exactly one anonymous page between [`SwapTable::swap_out`] and
//! [`SwapTable::free`].

use crate::{KernelError, addressing::PAGE_SIZE};
use alloc::sync::Arc;
use crossbeam_queue::ArrayQueue;

/// A block device that stores whole pages.
pub trait SwapDevice
where
    Self: Send + Sync,
{
    /// Number of page-sized slots on the device.
    fn slot_count(&self) -> usize;

    /// Reads the slot into `buf`.
    fn read_slot(&self, slot: usize, buf: &mut [u8; PAGE_SIZE]) -> Result<(), KernelError>;

    /// Overwrites the slot with `buf`.
    fn write_slot(&self, slot: usize, buf: &[u8; PAGE_SIZE]) -> Result<(), KernelError>;
}

/// Index of a slot on the swap device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SwapSlot(usize);

impl SwapSlot {
    /// The raw slot index.
    pub fn into_usize(self) -> usize {
        self.0
    }
}

/// Slot allocator over an optional swap device.
pub struct SwapTable {
    device: Option<(Arc<dyn SwapDevice>, ArrayQueue<usize>)>,
}

impl SwapTable {
    /// Creates a swap table. Without a device, anonymous pages cannot be
    /// evicted.
    pub fn new(device: Option<Arc<dyn SwapDevice>>) -> Self {
        let device = device.and_then(|device| {
            let slots = device.slot_count();
            if slots == 0 {
                return None;
            }
            let free = ArrayQueue::new(slots);
            for slot in 0..slots {
                let _ = free.push(slot);
            }
            Some((device, free))
        });
        Self { device }
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.device.as_ref().map_or(0, |(_, free)| free.capacity())
    }

    /// Number of slots currently holding a page.
    pub fn in_use(&self) -> usize {
        self.device
            .as_ref()
            .map_or(0, |(_, free)| free.capacity() - free.len())
    }

    /// Writes `page` into a free slot and returns the slot.
    ///
    /// # Returns
    /// - `Err(KernelError::NoSpace)` if there is no device or every slot is
    ///   taken.
    pub fn swap_out(&self, page: &[u8; PAGE_SIZE]) -> Result<SwapSlot, KernelError> {
        let (device, free) = self.device.as_ref().ok_or(KernelError::NoSpace)?;
        let slot = free.pop().ok_or(KernelError::NoSpace)?;
        match device.write_slot(slot, page) {
            Ok(()) => Ok(SwapSlot(slot)),
            Err(e) => {
                let _ = free.push(slot);
                Err(e)
            }
        }
    }

    /// Reads the contents of `slot` without releasing it.
    pub fn read(&self, slot: SwapSlot, buf: &mut [u8; PAGE_SIZE]) -> Result<(), KernelError> {
        let (device, _) = self.device.as_ref().ok_or(KernelError::IOError)?;
        device.read_slot(slot.0, buf)
    }

    /// Releases `slot`.
    pub fn free(&self, slot: SwapSlot) {
        if let Some((_, free)) = self.device.as_ref() {
            let _ = free.push(slot.0);
        }
    }
}
