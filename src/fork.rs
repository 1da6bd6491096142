//! # Fork
//!
//! `fork` creates a child process whose address space and descriptor table
//! are copies of the parent's. The child is built on its own thread while the
//! parent blocks on a [`ForkHandshake`]; the child reports whether it could
//! be built and, on success, starts running at the parent's user context
//! with `rax = 0`.
//!
//! Every page of the parent is duplicated into the child's supplemental page
//! table:
//! - an uninitialized page is registered again with the same initializer;
//! - an anonymous page is claimed in the child and filled with the parent's
//!   bytes, read from the parent's frame or, if the parent page is swapped
//!   out, from its swap slot;
//! - a file-backed page is rebound to a child mapping that owns a reopened
//!   handle (one per parent mapping). A resident parent page is copied
//!   together with its dirty bit, so that unwritten changes reach the file
//!   from the child as well; other pages are loaded lazily from the file.
//!
//! Pages are never shared between parent and child. If anything fails, the
//! half-built child address space is torn down and the parent gets the
//! error.

use crate::{
    KernelError,
    addressing::{PAGE_SIZE, Va},
    file_struct::FileStruct,
    fs::RegularFile,
    kernel::{Kernel, Pid},
    loader::lazy_fill,
    mm::{page_table::PageTable, swap::SwapTable},
    mm_struct::MmStruct,
    process::{Child, ExitRecord, Process},
    sync::{Semaphore, SpinLock},
    task::Registers,
    vm::{
        Page, PageKind, Segment, UninitPage, VmType,
        anon::AnonOrigin,
        file::Mapping,
    },
};
use alloc::{boxed::Box, collections::BTreeMap, string::String, sync::Arc, vec::Vec};
use log::debug;

/// The parent's side of a fork: blocks until the child reports.
pub struct ForkHandshake {
    ready: Semaphore<()>,
    result: SpinLock<Option<Result<(), KernelError>>>,
}

impl Default for ForkHandshake {
    fn default() -> Self {
        Self::new()
    }
}

impl ForkHandshake {
    /// Creates a handshake nobody has reported on yet.
    pub fn new() -> Self {
        Self {
            ready: Semaphore::new(0, ()),
            result: SpinLock::new(None),
        }
    }

    /// Publishes the outcome of building the child.
    pub fn report(&self, result: Result<(), KernelError>) {
        *self.result.lock() = Some(result);
        self.ready.signal();
    }

    /// Blocks until the outcome is published and returns it.
    pub fn wait(&self) -> Result<(), KernelError> {
        self.ready.take();
        self.result.lock().take().unwrap_or(Err(KernelError::NoMemory))
    }
}

/// Contents of a parent page, captured under the page's lock.
enum Contents {
    Uninit(UninitPage),
    Anon(AnonOrigin, Box<[u8; PAGE_SIZE]>),
    File {
        mapping: Arc<Mapping>,
        segment: Segment,
        resident: Option<(Box<[u8; PAGE_SIZE]>, bool)>,
    },
}

impl Contents {
    fn capture(
        page: &Page,
        page_table: &dyn PageTable,
        swap: &SwapTable,
    ) -> Result<Self, KernelError> {
        let state = page.state();
        Ok(match state.kind() {
            PageKind::Uninit(uninit) => Contents::Uninit(uninit.clone()),
            PageKind::Anon(anon) => {
                let mut bytes = Box::new([0; PAGE_SIZE]);
                match (state.frame(), anon.slot) {
                    (Some(frame), _) => bytes.copy_from_slice(frame.inner()),
                    (None, Some(slot)) => swap.read(slot, &mut bytes)?,
                    (None, None) => (),
                }
                Contents::Anon(anon.origin, bytes)
            }
            PageKind::File(file) => Contents::File {
                mapping: file.mapping.clone(),
                segment: file.segment.clone(),
                resident: state
                    .frame()
                    .map(|frame| (Box::new(*frame.inner()), page_table.is_dirty(page.va()))),
            },
        })
    }
}

/// Child mappings, keyed by the parent mapping they replace.
#[derive(Default)]
struct Mappings(BTreeMap<usize, Arc<Mapping>>);

impl Mappings {
    fn rebind(&mut self, mapping: &Arc<Mapping>) -> Result<Arc<Mapping>, KernelError> {
        let key = Arc::as_ptr(mapping) as usize;
        if let Some(child) = self.0.get(&key) {
            return Ok(child.clone());
        }
        let child = mapping.reopen()?;
        self.0.insert(key, child.clone());
        Ok(child)
    }

    fn rebind_segment(mapping: &Arc<Mapping>, segment: Segment) -> Segment {
        Segment {
            file: mapping.file().clone(),
            ..segment
        }
    }
}

/// Registers a copy of the parent page `parent` in `mm_struct`.
fn duplicate_page(
    mm_struct: &mut MmStruct,
    parent: &Page,
    parent_page_table: &dyn PageTable,
    mappings: &mut Mappings,
) -> Result<(), KernelError> {
    let (va, writable) = (parent.va(), parent.writable());
    match Contents::capture(parent, parent_page_table, mm_struct.frames().swap())? {
        Contents::Uninit(UninitPage { target, init, aux }) => {
            let (target, aux) = match target {
                VmType::File(mapping) => {
                    let mapping = mappings.rebind(&mapping)?;
                    let aux = aux.map(|segment| Mappings::rebind_segment(&mapping, segment));
                    (VmType::File(mapping), aux)
                }
                anon => (anon, aux),
            };
            mm_struct.register(target, va, writable, init, aux)?;
        }
        Contents::Anon(origin, bytes) => {
            let page = mm_struct.register(VmType::Anon(origin), va, writable, None, None)?;
            page.claim_and(mm_struct.page_table(), mm_struct.frames(), |frame| {
                frame.copy_from_slice(&bytes[..])
            })?;
        }
        Contents::File {
            mapping,
            segment,
            resident,
        } => {
            let mapping = mappings.rebind(&mapping)?;
            let segment = Mappings::rebind_segment(&mapping, segment);
            let page = mm_struct.register(
                VmType::File(mapping),
                va,
                writable,
                Some(lazy_fill),
                Some(segment),
            )?;
            if let Some((bytes, dirty)) = resident {
                let page_table = mm_struct.page_table().clone();
                page.claim_and(&page_table, mm_struct.frames(), |frame| {
                    frame.copy_from_slice(&bytes[..]);
                    page_table.set_dirty(va, dirty);
                })?;
            }
        }
    }
    Ok(())
}

/// Everything the child needs from the parent.
struct ForkSnapshot {
    name: String,
    pages: Vec<Arc<Page>>,
    page_table: Arc<dyn PageTable>,
    recorded_rsp: Va,
    file_struct: FileStruct,
    exec_file: Option<RegularFile>,
}

impl ForkSnapshot {
    fn build(self, kernel: Arc<Kernel>, record: Arc<ExitRecord>) -> Result<Process, KernelError> {
        let mut mm_struct = MmStruct::new(
            kernel.mmu().create_page_table()?,
            kernel.frames().clone(),
            kernel.max_stack_size(),
        );
        mm_struct.record_stack_pointer(self.recorded_rsp);
        let mut mappings = Mappings::default();
        for page in self.pages.iter() {
            duplicate_page(&mut mm_struct, page, self.page_table.as_ref(), &mut mappings)?;
        }
        let file_struct = self.file_struct.duplicate()?;
        let exec_file = match self.exec_file.as_ref() {
            Some(file) => {
                let file = file.reopen()?;
                file.deny_write();
                Some(file)
            }
            None => None,
        };
        debug!(
            "fork: {} built with {} pages",
            self.name,
            mm_struct.spt().len()
        );
        Ok(Process::from_parts(
            kernel,
            self.name,
            mm_struct,
            file_struct,
            exec_file,
            record,
        ))
    }
}

impl Process {
    /// Duplicates this process.
    ///
    /// The child is named `name` and resumes at `regs` with `rax = 0`. This
    /// call returns once the child is fully built.
    ///
    /// # Returns
    /// - `Ok(pid)` of the child.
    /// - `Err(KernelError)` if the child could not be built; no child
    ///   exists in that case.
    pub fn fork(&mut self, name: &str, regs: &Registers) -> Result<Pid, KernelError> {
        let kernel = self.kernel().clone();
        let record = ExitRecord::new(kernel.allocate_pid());
        let pid = record.pid();
        let handshake = Arc::new(ForkHandshake::new());
        let snapshot = ForkSnapshot {
            name: String::from(name),
            pages: self.mm_struct.spt().iter().cloned().collect(),
            page_table: self.mm_struct.page_table().clone(),
            recorded_rsp: self.mm_struct.recorded_stack_pointer(),
            file_struct: self.file_struct.clone(),
            exec_file: self.exec_file().cloned(),
        };
        let mut regs = *regs;
        regs.rax = 0;

        let body = {
            let kernel = kernel.clone();
            let record = record.clone();
            let handshake = handshake.clone();
            move || match snapshot.build(kernel.clone(), record) {
                Ok(child) => {
                    handshake.report(Ok(()));
                    kernel.scheduler().launch(child, regs);
                }
                Err(e) => handshake.report(Err(e)),
            }
        };
        kernel.scheduler().spawn(name, Box::new(body));
        handshake.wait()?;
        self.children.insert(pid, Child::new(record));
        debug!("fork: {} -> {:?}", self.name(), pid);
        Ok(pid)
    }
}
