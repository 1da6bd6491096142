//! # Pages and their life cycle
//!
//! A [`Page`] describes one page-aligned user virtual address of one address
//! space: whether it is writable, how its contents are produced, and, while
//! it is resident, the [`Frame`] that holds them.
//!
//! ## Page kinds
//!
//! ```text
//!                claim                 evict / claim
//!   Uninit ───────────────▶ Anon  ◀───────────────────▶ (swap slot)
//!      │
//!      └──────────────────▶ File  ◀───────────────────▶ (backing file)
//!                claim                 evict / claim
//! ```
//!
//! Every page is registered as [`PageKind::Uninit`], carrying the kind it
//! will become ([`VmType`]), an optional [`Initializer`] and the auxiliary
//! [`Segment`] the initializer reads from. Nothing is allocated at this
//! point.
//!
//! The first [`Page::claim`] allocates a frame, fills it, installs the
//! hardware mapping, and turns the page into [`PageKind::Anon`] or
//! [`PageKind::File`]. The transition is one-way. Later claims of a page
//! that was evicted in between bring the contents back from the page's swap
//! slot or from its file.
//!
//! A claim either succeeds completely or changes nothing: the page keeps its
//! kind, no frame stays allocated and no hardware mapping is left behind.
//!
//! [`Page::destroy`] runs the type-specific cleanup: anonymous pages release
//! their swap slot, file-backed pages write modified contents back to their
//! file. Then the mapping is removed and the frame returns to the pool.
//!
//! ## Locking
//!
//! Each page has its own spin lock. A thread that holds a page lock may
//! allocate frames; the frame table only ever *tries* to lock a page it
//! wants to evict, so the two never wait on each other.

pub mod anon;
pub mod fault;
pub mod file;
pub mod spt;

use crate::{
    KernelError,
    addressing::{PAGE_SIZE, Va},
    fs::RegularFile,
    mm::{
        frame::{Frame, FrameTable},
        page_table::{PageTable, Permission},
        swap::SwapTable,
    },
    sync::{SpinLock, SpinLockGuard},
};
use alloc::sync::Arc;
use anon::{AnonOrigin, AnonPage};
use file::{FilePage, Mapping};
use log::{debug, warn};

/// Fills a freshly allocated frame from an auxiliary [`Segment`].
///
/// Invoked exactly once, when an [`PageKind::Uninit`] page is claimed.
pub type Initializer = fn(&Segment, &mut [u8; PAGE_SIZE]) -> Result<(), KernelError>;

/// The part of a file that backs one page.
///
/// The first `read_bytes` bytes of the page come from `file` at `offset`;
/// the remaining `zero_bytes` bytes are zero.
#[derive(Clone)]
pub struct Segment {
    /// The file to read from.
    pub file: RegularFile,
    /// Byte offset in `file`.
    pub offset: usize,
    /// Number of bytes read from the file.
    pub read_bytes: usize,
    /// Number of zero bytes that follow.
    pub zero_bytes: usize,
}

/// The kind an [`PageKind::Uninit`] page turns into.
#[derive(Clone)]
pub enum VmType {
    /// An anonymous page.
    Anon(AnonOrigin),
    /// A page of the given memory-mapped file.
    File(Arc<Mapping>),
}

/// Payload of a page that has never been claimed.
#[derive(Clone)]
pub struct UninitPage {
    /// The kind the page becomes on its first claim.
    pub target: VmType,
    /// Fills the frame on the first claim. `None` means zero-filled.
    pub init: Option<Initializer>,
    /// The argument of `init`.
    pub aux: Option<Segment>,
}

impl UninitPage {
    /// Builds the payload the page specializes into.
    fn specialize(&self) -> Result<PageKind, KernelError> {
        Ok(match &self.target {
            VmType::Anon(origin) => PageKind::Anon(AnonPage::new(*origin)),
            VmType::File(mapping) => PageKind::File(FilePage {
                mapping: mapping.clone(),
                segment: self.aux.clone().ok_or(KernelError::InvalidArgument)?,
            }),
        })
    }
}

/// Type-specific state of a page.
pub enum PageKind {
    /// Registered but never claimed.
    Uninit(UninitPage),
    /// Anonymous memory, backed by swap while evicted.
    Anon(AnonPage),
    /// Memory-mapped file contents, backed by the file while evicted.
    File(FilePage),
}

/// Discriminant of [`PageKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    /// See [`PageKind::Uninit`].
    Uninit,
    /// See [`PageKind::Anon`].
    Anon,
    /// See [`PageKind::File`].
    File,
}

/// The mutable part of a [`Page`].
pub struct PageState {
    kind: PageKind,
    frame: Option<Frame>,
}

impl PageState {
    /// The type-specific payload.
    pub fn kind(&self) -> &PageKind {
        &self.kind
    }

    /// The resident frame, if any.
    pub fn frame(&self) -> Option<&Frame> {
        self.frame.as_ref()
    }

    /// The resident frame, if any.
    pub fn frame_mut(&mut self) -> Option<&mut Frame> {
        self.frame.as_mut()
    }
}

/// One page of a user address space.
pub struct Page {
    va: Va,
    writable: bool,
    state: SpinLock<PageState>,
}

impl Page {
    /// Creates an uninitialized page at `va` (rounded down).
    pub fn new(
        va: Va,
        writable: bool,
        target: VmType,
        init: Option<Initializer>,
        aux: Option<Segment>,
    ) -> Self {
        Self {
            va: va.page_down(),
            writable,
            state: SpinLock::new(PageState {
                kind: PageKind::Uninit(UninitPage { target, init, aux }),
                frame: None,
            }),
        }
    }

    /// Virtual address of the page.
    #[inline]
    pub fn va(&self) -> Va {
        self.va
    }

    /// Whether user code may write to the page.
    #[inline]
    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Permission of the hardware mapping.
    #[inline]
    pub fn permission(&self) -> Permission {
        Permission::user(self.writable)
    }

    /// Locks the page state.
    pub fn state(&self) -> SpinLockGuard<'_, PageState> {
        self.state.lock()
    }

    pub(crate) fn try_state(&self) -> Option<SpinLockGuard<'_, PageState>> {
        self.state.try_lock()
    }

    /// The current kind of the page.
    pub fn page_type(&self) -> PageType {
        match self.state.lock().kind {
            PageKind::Uninit(_) => PageType::Uninit,
            PageKind::Anon(_) => PageType::Anon,
            PageKind::File(_) => PageType::File,
        }
    }

    /// Whether the page currently owns a frame.
    pub fn is_resident(&self) -> bool {
        self.state.lock().frame.is_some()
    }

    /// The memory-mapped file this page belongs to, if any.
    pub fn mapping(&self) -> Option<Arc<Mapping>> {
        match &self.state.lock().kind {
            PageKind::Uninit(UninitPage {
                target: VmType::File(mapping),
                ..
            }) => Some(mapping.clone()),
            PageKind::File(file) => Some(file.mapping.clone()),
            _ => None,
        }
    }

    /// Makes the page resident.
    ///
    /// Claiming a resident page succeeds without doing anything. Otherwise a
    /// frame is allocated (possibly evicting another page) and filled:
    /// - [`PageKind::Uninit`]: by the page's initializer, then the page
    ///   specializes into its target kind;
    /// - [`PageKind::Anon`]: from its swap slot, which is then released;
    /// - [`PageKind::File`]: from its file.
    ///
    /// The frame is mapped at the page's address in `page_table`.
    ///
    /// # Returns
    /// - `Err(KernelError)` if allocation, population or mapping fails. The
    ///   page is left untouched in that case.
    pub fn claim(
        self: &Arc<Self>,
        page_table: &Arc<dyn PageTable>,
        frames: &Arc<FrameTable>,
    ) -> Result<(), KernelError> {
        let mut state = self.state.lock();
        if state.frame.is_some() {
            return Ok(());
        }
        let specialized = match &state.kind {
            PageKind::Uninit(uninit) => Some(uninit.specialize()?),
            _ => None,
        };

        let mut frame = frames.allocate()?;
        match &state.kind {
            PageKind::Uninit(UninitPage {
                init: Some(init),
                aux,
                ..
            }) => init(
                aux.as_ref().ok_or(KernelError::InvalidArgument)?,
                frame.inner_mut(),
            )?,
            PageKind::Uninit(_) => (),
            PageKind::Anon(anon) => anon.fill(frame.inner_mut(), frames.swap())?,
            PageKind::File(file) => file.fill(frame.inner_mut())?,
        }
        page_table.set_mapping(self.va, frame.pa(), self.permission())?;

        if let Some(kind) = specialized {
            state.kind = kind;
        }
        if let PageKind::Anon(anon) = &mut state.kind {
            anon.swapped_in(frames.swap());
        }
        frames.track(&frame, self, page_table);
        debug!("vm: claimed {:?} at {:?}", self.va, frame.pa());
        state.frame = Some(frame);
        Ok(())
    }

    /// Claims the page and runs `f` on its frame while the page is locked.
    ///
    /// The frame may be evicted between the claim and the lock; the page is
    /// then claimed again.
    pub(crate) fn claim_and<R>(
        self: &Arc<Self>,
        page_table: &Arc<dyn PageTable>,
        frames: &Arc<FrameTable>,
        f: impl FnOnce(&mut [u8; PAGE_SIZE]) -> R,
    ) -> Result<R, KernelError> {
        let mut f = Some(f);
        loop {
            self.claim(page_table, frames)?;
            let mut state = self.state.lock();
            if let Some(frame) = state.frame.as_mut() {
                return f
                    .take()
                    .map(|f| f(frame.inner_mut()))
                    .ok_or(KernelError::BadAddress);
            }
        }
    }

    /// Evicts the page, handing its frame back to the caller.
    ///
    /// Anonymous contents go to a swap slot; file-backed contents are
    /// written back if the page is dirty. The hardware mapping is removed.
    /// On failure the page stays resident and mapped.
    pub(crate) fn swap_out(
        &self,
        state: &mut PageState,
        page_table: &dyn PageTable,
        swap: &SwapTable,
    ) -> Result<Frame, KernelError> {
        let frame = state.frame.take().ok_or(KernelError::BadAddress)?;
        let dirty = page_table.is_dirty(self.va);
        if let Err(e) = page_table.clear_mapping(self.va) {
            state.frame = Some(frame);
            return Err(e.into());
        }
        let result = match &mut state.kind {
            PageKind::Anon(anon) => anon.swap_out(frame.inner(), swap),
            PageKind::File(file) if dirty => file.write_back(frame.inner()),
            PageKind::File(_) => Ok(()),
            PageKind::Uninit(_) => Err(KernelError::InvalidArgument),
        };
        match result {
            Ok(()) => Ok(frame),
            Err(e) => {
                if page_table
                    .set_mapping(self.va, frame.pa(), self.permission())
                    .is_ok()
                {
                    page_table.set_dirty(self.va, dirty);
                }
                state.frame = Some(frame);
                Err(e)
            }
        }
    }

    /// Destroys the page.
    ///
    /// Modified file-backed contents are written back, the swap slot of an
    /// anonymous page is released, and a resident frame is unmapped and
    /// returned to the pool.
    pub fn destroy(&self, page_table: &dyn PageTable, swap: &SwapTable) {
        let mut state = self.state.lock();
        let frame = state.frame.take();
        match &mut state.kind {
            PageKind::Uninit(_) => (),
            PageKind::Anon(anon) => anon.destroy(swap),
            PageKind::File(file) => {
                if let Some(frame) = frame.as_ref() {
                    if page_table.is_dirty(self.va) {
                        if let Err(e) = file.write_back(frame.inner()) {
                            warn!("vm: writeback of {:?} failed: {:?}", self.va, e);
                        }
                    }
                }
            }
        }
        if frame.is_some() {
            let _ = page_table.clear_mapping(self.va);
        }
    }
}
