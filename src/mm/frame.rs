//! Physical frames of the user pool and the frame table.
//!
//! Every resident user page owns exactly one [`Frame`]. Frames come from the
//! [`FrameTable`], which hands out frames of the user pool until the pool is
//! exhausted and then reclaims one from a resident page.
//!
//! ## Eviction
//!
//! The frame table keeps every resident frame in a circular list, together
//! with weak references to the page that owns it and the page table that maps
//! it. When the pool is empty, [`FrameTable::allocate`] sweeps this list with
//! a clock hand:
//!
//! - A frame whose page was accessed since the last sweep gets a second
//!   chance: its accessed bit is cleared and the hand moves on.
//! - A frame whose page is locked by another thread is skipped.
//! - Otherwise the page is swapped out (see [`Page::swap_out`]) and its frame
//!   is zeroed and handed to the caller.
//!
//! After two full sweeps without a victim, allocation fails with
//! [`KernelError::NoMemory`].
//!
//! A frame returns to the pool when it is dropped, which happens when its
//! page is destroyed.

use super::{page_table::PageTable, swap::SwapTable};
use crate::{
    KernelError,
    addressing::{PAGE_SIZE, Pa, Va},
    sync::SpinLock,
    vm::Page,
};
use alloc::{
    boxed::Box,
    sync::{Arc, Weak},
    vec::Vec,
};
use log::{debug, warn};

/// First physical address of the user pool.
const USER_POOL_BASE: usize = 0x20_0000;

/// A physical page loaned to one virtual page.
///
/// Dropping a [`Frame`] returns it to the frame table.
pub struct Frame {
    pa: Pa,
    inner: Box<[u8; PAGE_SIZE]>,
    table: Arc<FrameTable>,
}

impl Frame {
    /// Physical address of the frame.
    #[inline]
    pub fn pa(&self) -> Pa {
        self.pa
    }

    /// Contents of the frame.
    #[inline]
    pub fn inner(&self) -> &[u8; PAGE_SIZE] {
        &self.inner
    }

    /// Mutable contents of the frame.
    #[inline]
    pub fn inner_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        &mut self.inner
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        self.table.release(self.pa);
    }
}

impl core::fmt::Debug for Frame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Frame").field("pa", &self.pa).finish()
    }
}

struct Resident {
    pa: Pa,
    va: Va,
    page: Weak<Page>,
    page_table: Weak<dyn PageTable>,
}

struct FrameTableInner {
    free: Vec<Pa>,
    resident: Vec<Resident>,
    hand: usize,
}

/// The system-wide table of user frames.
pub struct FrameTable {
    capacity: usize,
    inner: SpinLock<FrameTableInner>,
    swap: SwapTable,
}

impl FrameTable {
    /// Creates a user pool of `capacity` frames backed by `swap`.
    pub fn new(capacity: usize, swap: SwapTable) -> Arc<Self> {
        let free = (0..capacity)
            .rev()
            .filter_map(|i| Pa::new(USER_POOL_BASE + i * PAGE_SIZE))
            .collect();
        Arc::new(Self {
            capacity,
            inner: SpinLock::new(FrameTableInner {
                free,
                resident: Vec::new(),
                hand: 0,
            }),
            swap,
        })
    }

    /// Number of frames in the pool.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of frames currently loaned out.
    pub fn used(&self) -> usize {
        self.capacity - self.inner.lock().free.len()
    }

    /// Number of frames registered as eviction candidates.
    pub fn resident(&self) -> usize {
        self.inner.lock().resident.len()
    }

    /// The swap table used for evicted anonymous pages.
    pub fn swap(&self) -> &SwapTable {
        &self.swap
    }

    /// Allocates a zero-filled frame, evicting a resident page if the pool
    /// is exhausted.
    ///
    /// The returned frame is not linked to any page.
    pub fn allocate(self: &Arc<Self>) -> Result<Frame, KernelError> {
        let mut inner = self.inner.lock();
        if let Some(pa) = inner.free.pop() {
            return Ok(Frame {
                pa,
                inner: Box::new([0; PAGE_SIZE]),
                table: self.clone(),
            });
        }
        // Pages pinned during the sweep are released only after the table
        // lock is dropped: the last reference may own a frame.
        let mut pinned = Vec::new();
        let victim = self.evict(&mut inner, &mut pinned);
        drop(inner);
        drop(pinned);
        let mut frame = victim?;
        frame.inner_mut().fill(0);
        Ok(frame)
    }

    /// Registers `frame` as the resident frame of `page`, mapped in
    /// `page_table`.
    pub(crate) fn track(&self, frame: &Frame, page: &Arc<Page>, page_table: &Arc<dyn PageTable>) {
        self.inner.lock().resident.push(Resident {
            pa: frame.pa,
            va: page.va(),
            page: Arc::downgrade(page),
            page_table: Arc::downgrade(page_table),
        });
    }

    fn release(&self, pa: Pa) {
        let mut inner = self.inner.lock();
        if let Some(idx) = inner.resident.iter().position(|r| r.pa == pa) {
            inner.resident.remove(idx);
            if idx < inner.hand {
                inner.hand -= 1;
            }
        }
        inner.free.push(pa);
    }

    fn evict(
        &self,
        inner: &mut FrameTableInner,
        pinned: &mut Vec<Arc<Page>>,
    ) -> Result<Frame, KernelError> {
        let mut budget = 2 * inner.resident.len();
        while budget > 0 && !inner.resident.is_empty() {
            budget -= 1;
            if inner.hand >= inner.resident.len() {
                inner.hand = 0;
            }
            let idx = inner.hand;
            let candidate = &inner.resident[idx];
            let va = candidate.va;
            let page_table = candidate.page_table.upgrade();
            let Some(page) = candidate.page.upgrade() else {
                // The owner is going away; its frame is about to come back.
                inner.hand += 1;
                continue;
            };
            pinned.push(page.clone());
            let Some(page_table) = page_table else {
                inner.hand += 1;
                continue;
            };
            if page_table.is_accessed(va) {
                page_table.set_accessed(va, false);
                inner.hand += 1;
                continue;
            }
            let outcome = match page.try_state() {
                Some(mut state) => Some(page.swap_out(&mut state, page_table.as_ref(), &self.swap)),
                None => None,
            };
            match outcome {
                Some(Ok(frame)) => {
                    debug!("frame: evicted {:?} from {:?}", va, frame.pa);
                    inner.resident.remove(idx);
                    return Ok(frame);
                }
                Some(Err(e)) => {
                    warn!("frame: failed to evict {:?}: {:?}", va, e);
                    inner.hand += 1;
                }
                None => inner.hand += 1,
            }
        }
        Err(KernelError::NoMemory)
    }
}
