//! In-memory doubles of the kernel collaborators.
#![allow(dead_code)]

use keos_vm::{
    KernelError,
    addressing::{PAGE_SIZE, Pa, Va},
    fs::{FileBlockNumber, InodeNumber, RegularFile, traits},
    kernel::{Kernel, KernelBuilder, Scheduler},
    mm::{
        frame::FrameTable,
        page_table::{Mmu, PageTable, PageTableMappingError, Permission, Pte},
        swap::{SwapDevice, SwapTable},
    },
    mm_struct::MmStruct,
    process::Process,
    syscall::SyscallNumber,
    task::{Registers, Task},
};
use std::{
    collections::{HashMap, VecDeque},
    ops::ControlFlow,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

pub fn va(addr: usize) -> Va {
    Va::new(addr).unwrap()
}

// ---------------------------------------------------------------------------
// File system
// ---------------------------------------------------------------------------

pub struct MemInode {
    ino: u32,
    data: Mutex<Vec<u8>>,
    denials: AtomicUsize,
}

impl MemInode {
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }

    pub fn is_write_denied(&self) -> bool {
        self.denials.load(Ordering::SeqCst) > 0
    }
}

pub struct MemFile {
    inode: Arc<MemInode>,
    denied: AtomicBool,
}

impl MemFile {
    fn open(inode: Arc<MemInode>, denied: bool) -> RegularFile {
        if denied {
            inode.denials.fetch_add(1, Ordering::SeqCst);
        }
        RegularFile::new(MemFile {
            inode,
            denied: AtomicBool::new(denied),
        })
    }
}

impl traits::RegularFile for MemFile {
    fn ino(&self) -> InodeNumber {
        InodeNumber(self.inode.ino)
    }

    fn size(&self) -> usize {
        self.inode.data.lock().unwrap().len()
    }

    fn read(&self, fba: FileBlockNumber, buf: &mut [u8; PAGE_SIZE]) -> Result<bool, KernelError> {
        let data = self.inode.data.lock().unwrap();
        let start = fba.into_offset();
        buf.fill(0);
        if start >= data.len() {
            return Ok(false);
        }
        let end = data.len().min(start + PAGE_SIZE);
        buf[..end - start].copy_from_slice(&data[start..end]);
        Ok(true)
    }

    fn write(
        &self,
        fba: FileBlockNumber,
        buf: &[u8; PAGE_SIZE],
        min_size: usize,
    ) -> Result<(), KernelError> {
        if self.inode.is_write_denied() {
            return Err(KernelError::OperationNotPermitted);
        }
        let mut data = self.inode.data.lock().unwrap();
        if data.len() < min_size {
            data.resize(min_size, 0);
        }
        let start = fba.into_offset();
        let end = data.len().min(start + PAGE_SIZE);
        if start < end {
            data[start..end].copy_from_slice(&buf[..end - start]);
        }
        Ok(())
    }

    fn reopen(&self) -> Result<RegularFile, KernelError> {
        Ok(MemFile::open(self.inode.clone(), false))
    }

    fn duplicate(&self) -> Result<RegularFile, KernelError> {
        Ok(MemFile::open(
            self.inode.clone(),
            self.denied.load(Ordering::SeqCst),
        ))
    }

    fn deny_write(&self) {
        if !self.denied.swap(true, Ordering::SeqCst) {
            self.inode.denials.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn allow_write(&self) {
        if self.denied.swap(false, Ordering::SeqCst) {
            self.inode.denials.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for MemFile {
    fn drop(&mut self) {
        traits::RegularFile::allow_write(self);
    }
}

#[derive(Default)]
pub struct MemFs {
    files: Mutex<HashMap<String, Arc<MemInode>>>,
    next_ino: AtomicUsize,
}

impl MemFs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, path: &str, data: &[u8]) -> Arc<MemInode> {
        let inode = Arc::new(MemInode {
            ino: self.next_ino.fetch_add(1, Ordering::SeqCst) as u32 + 1,
            data: Mutex::new(data.to_vec()),
            denials: AtomicUsize::new(0),
        });
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), inode.clone());
        inode
    }

    pub fn inode(&self, path: &str) -> Arc<MemInode> {
        self.files.lock().unwrap()[path].clone()
    }
}

impl traits::FileSystem for MemFs {
    fn open(&self, path: &str) -> Result<RegularFile, KernelError> {
        let inode = self
            .files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or(KernelError::NoSuchEntry)?;
        Ok(MemFile::open(inode, false))
    }

    fn create(&self, path: &str, size: usize) -> Result<(), KernelError> {
        if path.is_empty() {
            return Err(KernelError::InvalidArgument);
        }
        if self.files.lock().unwrap().contains_key(path) {
            return Err(KernelError::FileExist);
        }
        self.add(path, &vec![0; size]);
        Ok(())
    }

    fn remove(&self, path: &str) -> Result<(), KernelError> {
        self.files
            .lock()
            .unwrap()
            .remove(path)
            .map(|_| ())
            .ok_or(KernelError::NoSuchEntry)
    }
}

// ---------------------------------------------------------------------------
// Page tables
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
struct SoftPte {
    pte: Pte,
    dirty: bool,
    accessed: bool,
}

/// A page table that keeps its entries in a map.
#[derive(Default)]
pub struct SoftPageTable {
    entries: Mutex<HashMap<usize, SoftPte>>,
    destroyed: AtomicBool,
    activations: AtomicUsize,
}

impl SoftPageTable {
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn activations(&self) -> usize {
        self.activations.load(Ordering::SeqCst)
    }

    pub fn mapped(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    fn key(va: Va) -> usize {
        va.page_down().into_usize()
    }
}

impl PageTable for SoftPageTable {
    fn activate(&self) {
        self.activations.fetch_add(1, Ordering::SeqCst);
    }

    fn get_mapping(&self, va: Va) -> Option<Pte> {
        self.entries
            .lock()
            .unwrap()
            .get(&Self::key(va))
            .map(|e| e.pte)
    }

    fn set_mapping(&self, va: Va, pa: Pa, perm: Permission) -> Result<(), PageTableMappingError> {
        assert!(!self.is_destroyed(), "set_mapping() on a destroyed page table");
        if va.offset() != 0 {
            return Err(PageTableMappingError::Unaligned);
        }
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(&Self::key(va)) {
            return Err(PageTableMappingError::Duplicated);
        }
        entries.insert(
            Self::key(va),
            SoftPte {
                pte: Pte { pa, perm },
                dirty: false,
                accessed: false,
            },
        );
        Ok(())
    }

    fn clear_mapping(&self, va: Va) -> Result<Pa, PageTableMappingError> {
        self.entries
            .lock()
            .unwrap()
            .remove(&Self::key(va))
            .map(|e| e.pte.pa)
            .ok_or(PageTableMappingError::NotExist)
    }

    fn is_dirty(&self, va: Va) -> bool {
        self.entries
            .lock()
            .unwrap()
            .get(&Self::key(va))
            .is_some_and(|e| e.dirty)
    }

    fn set_dirty(&self, va: Va, dirty: bool) {
        if let Some(e) = self.entries.lock().unwrap().get_mut(&Self::key(va)) {
            e.dirty = dirty;
        }
    }

    fn is_accessed(&self, va: Va) -> bool {
        self.entries
            .lock()
            .unwrap()
            .get(&Self::key(va))
            .is_some_and(|e| e.accessed)
    }

    fn set_accessed(&self, va: Va, accessed: bool) {
        if let Some(e) = self.entries.lock().unwrap().get_mut(&Self::key(va)) {
            e.accessed = accessed;
        }
    }

    fn destroy(&self) {
        assert!(
            !self.destroyed.swap(true, Ordering::SeqCst),
            "page table destroyed twice"
        );
        self.entries.lock().unwrap().clear();
    }
}

/// Hands out [`SoftPageTable`]s and remembers them.
#[derive(Default)]
pub struct SoftMmu {
    created: Mutex<Vec<Arc<SoftPageTable>>>,
}

impl SoftMmu {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn created(&self) -> Vec<Arc<SoftPageTable>> {
        self.created.lock().unwrap().clone()
    }
}

impl Mmu for SoftMmu {
    fn create_page_table(&self) -> Result<Arc<dyn PageTable>, KernelError> {
        let page_table = Arc::new(SoftPageTable::default());
        self.created.lock().unwrap().push(page_table.clone());
        Ok(page_table)
    }
}

// ---------------------------------------------------------------------------
// Swap and console
// ---------------------------------------------------------------------------

pub struct MemSwap {
    slots: Mutex<Vec<[u8; PAGE_SIZE]>>,
}

impl MemSwap {
    pub fn new(slots: usize) -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(vec![[0; PAGE_SIZE]; slots]),
        })
    }
}

impl SwapDevice for MemSwap {
    fn slot_count(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    fn read_slot(&self, slot: usize, buf: &mut [u8; PAGE_SIZE]) -> Result<(), KernelError> {
        let slots = self.slots.lock().unwrap();
        buf.copy_from_slice(slots.get(slot).ok_or(KernelError::IOError)?);
        Ok(())
    }

    fn write_slot(&self, slot: usize, buf: &[u8; PAGE_SIZE]) -> Result<(), KernelError> {
        let mut slots = self.slots.lock().unwrap();
        slots
            .get_mut(slot)
            .ok_or(KernelError::IOError)?
            .copy_from_slice(buf);
        Ok(())
    }
}

#[derive(Default)]
pub struct CapturedConsole {
    output: Mutex<Vec<u8>>,
    input: Mutex<VecDeque<u8>>,
}

impl CapturedConsole {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn output(&self) -> String {
        String::from_utf8_lossy(&self.output.lock().unwrap()).into_owned()
    }

    pub fn feed(&self, bytes: &[u8]) {
        self.input.lock().unwrap().extend(bytes.iter().copied());
    }
}

impl traits::Console for CapturedConsole {
    fn write(&self, buf: &[u8]) {
        self.output.lock().unwrap().extend_from_slice(buf);
    }

    fn read(&self, buf: &mut [u8]) -> usize {
        let mut input = self.input.lock().unwrap();
        let mut read = 0;
        while read < buf.len() {
            match input.pop_front() {
                Some(b) => buf[read] = b,
                None => break,
            }
            read += 1;
        }
        read
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// The user-mode part of a test program: it runs on the process's thread
/// and returns the exit status.
pub type Program = Arc<dyn Fn(&mut Process, &mut Registers) -> i32 + Send + Sync>;

/// Runs every kernel thread on a std thread and every process with the
/// [`Program`] registered under its name.
#[derive(Default)]
pub struct ThreadScheduler {
    programs: Mutex<HashMap<String, Program>>,
    halted: AtomicBool,
}

impl ThreadScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn install(
        &self,
        name: &str,
        program: impl Fn(&mut Process, &mut Registers) -> i32 + Send + Sync + 'static,
    ) {
        self.programs
            .lock()
            .unwrap()
            .insert(name.to_string(), Arc::new(program));
    }

    pub fn halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }
}

impl Scheduler for ThreadScheduler {
    fn spawn(&self, name: &str, body: Box<dyn FnOnce() + Send>) {
        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(body)
            .unwrap();
    }

    fn launch(&self, mut process: Process, mut regs: Registers) {
        let program = self.programs.lock().unwrap().get(process.name()).cloned();
        let status = match program {
            Some(program) => program(&mut process, &mut regs),
            None => 0,
        };
        process.exit(status);
    }

    fn shutdown(&self) {
        self.halted.store(true, Ordering::SeqCst);
    }
}

/// Issues system call `sysno` from `regs`.
///
/// Returns the value left in `rax`, or the exit status if the process was
/// terminated.
pub fn syscall(
    process: &mut Process,
    regs: &mut Registers,
    sysno: SyscallNumber,
    args: &[usize],
) -> ControlFlow<i32, usize> {
    let mut argv = [0usize; 6];
    argv[..args.len()].copy_from_slice(args);
    regs.rax = sysno as usize;
    regs.rdi = argv[0];
    regs.rsi = argv[1];
    regs.rdx = argv[2];
    regs.r10 = argv[3];
    regs.r8 = argv[4];
    regs.r9 = argv[5];
    match Task::syscall(process, regs) {
        ControlFlow::Continue(()) => ControlFlow::Continue(regs.rax),
        ControlFlow::Break(status) => ControlFlow::Break(status),
    }
}

/// Writes `s` as a C string just below the stack pointer and returns its
/// address.
pub fn push_user_str(process: &mut Process, regs: &Registers, s: &str) -> usize {
    let mut bytes = s.as_bytes().to_vec();
    bytes.push(0);
    let addr = regs.rsp - 0x100 - bytes.len();
    process
        .mm_struct_mut()
        .write_user(va(addr), &bytes)
        .unwrap();
    addr
}

// ---------------------------------------------------------------------------
// Kernel
// ---------------------------------------------------------------------------

pub struct TestKernel {
    pub kernel: Arc<Kernel>,
    pub fs: Arc<MemFs>,
    pub mmu: Arc<SoftMmu>,
    pub scheduler: Arc<ThreadScheduler>,
    pub console: Arc<CapturedConsole>,
}

impl TestKernel {
    pub fn new(frames: usize, swap_slots: usize) -> Self {
        Self::with(frames, swap_slots, |builder| builder)
    }

    pub fn with(
        frames: usize,
        swap_slots: usize,
        configure: impl FnOnce(KernelBuilder) -> KernelBuilder,
    ) -> Self {
        let fs = MemFs::new();
        let mmu = SoftMmu::new();
        let scheduler = ThreadScheduler::new();
        let console = CapturedConsole::new();
        let builder = KernelBuilder::new()
            .frames(frames)
            .swap(MemSwap::new(swap_slots))
            .file_system(fs.clone())
            .mmu(mmu.clone())
            .scheduler(scheduler.clone())
            .console(console.clone());
        let kernel = configure(builder).build().unwrap();
        Self {
            kernel,
            fs,
            mmu,
            scheduler,
            console,
        }
    }
}

/// An address space on a private frame pool, outside of any process.
pub struct TestMm {
    pub mm: MmStruct,
    pub page_table: Arc<SoftPageTable>,
    pub frames: Arc<FrameTable>,
}

impl TestMm {
    pub fn new(frames: usize, swap_slots: usize) -> Self {
        let page_table = Arc::new(SoftPageTable::default());
        let swap = SwapTable::new(Some(MemSwap::new(swap_slots) as Arc<dyn SwapDevice>));
        let frames = FrameTable::new(frames, swap);
        let mm = MmStruct::new(
            page_table.clone(),
            frames.clone(),
            keos_vm::addressing::DEFAULT_MAX_STACK_SIZE,
        );
        Self {
            mm,
            page_table,
            frames,
        }
    }
}

// ---------------------------------------------------------------------------
// ELF images
// ---------------------------------------------------------------------------

pub const PF_X: u32 = 1;
pub const PF_W: u32 = 2;
pub const PF_R: u32 = 4;

pub const PT_LOAD: u32 = 1;
pub const PT_DYNAMIC: u32 = 2;
pub const PT_INTERP: u32 = 3;

struct ElfSegment {
    p_type: u32,
    flags: u32,
    vaddr: u64,
    data: Vec<u8>,
    memsz: u64,
}

/// Assembles a minimal ELF64 executable for x86-64.
pub struct ElfBuilder {
    entry: u64,
    segments: Vec<ElfSegment>,
}

impl ElfBuilder {
    pub fn new(entry: u64) -> Self {
        Self {
            entry,
            segments: Vec::new(),
        }
    }

    pub fn segment(mut self, vaddr: u64, data: &[u8], memsz: u64, flags: u32) -> Self {
        self.segments.push(ElfSegment {
            p_type: PT_LOAD,
            flags,
            vaddr,
            data: data.to_vec(),
            memsz,
        });
        self
    }

    pub fn header(mut self, p_type: u32) -> Self {
        self.segments.push(ElfSegment {
            p_type,
            flags: PF_R,
            vaddr: 0,
            data: Vec::new(),
            memsz: 0,
        });
        self
    }

    pub fn build(self) -> Vec<u8> {
        const EHSIZE: usize = 64;
        const PHENTSIZE: usize = 56;
        let phnum = self.segments.len();
        let mut out = vec![0u8; EHSIZE + PHENTSIZE * phnum];

        out[0..4].copy_from_slice(b"\x7fELF");
        out[4] = 2; // ELFCLASS64
        out[5] = 1; // ELFDATA2LSB
        out[6] = 1; // EV_CURRENT
        out[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        out[18..20].copy_from_slice(&0x3eu16.to_le_bytes()); // EM_X86_64
        out[20..24].copy_from_slice(&1u32.to_le_bytes());
        out[24..32].copy_from_slice(&self.entry.to_le_bytes());
        out[32..40].copy_from_slice(&(EHSIZE as u64).to_le_bytes());
        out[52..54].copy_from_slice(&(EHSIZE as u16).to_le_bytes());
        out[54..56].copy_from_slice(&(PHENTSIZE as u16).to_le_bytes());
        out[56..58].copy_from_slice(&(phnum as u16).to_le_bytes());
        out[58..60].copy_from_slice(&64u16.to_le_bytes());

        for (i, segment) in self.segments.iter().enumerate() {
            let offset = if segment.p_type == PT_LOAD {
                let in_page = segment.vaddr as usize % PAGE_SIZE;
                let offset = out.len().div_ceil(PAGE_SIZE) * PAGE_SIZE + in_page;
                out.resize(offset, 0);
                out.extend_from_slice(&segment.data);
                offset
            } else {
                0
            };
            let ph = EHSIZE + i * PHENTSIZE;
            out[ph..ph + 4].copy_from_slice(&segment.p_type.to_le_bytes());
            out[ph + 4..ph + 8].copy_from_slice(&segment.flags.to_le_bytes());
            out[ph + 8..ph + 16].copy_from_slice(&(offset as u64).to_le_bytes());
            out[ph + 16..ph + 24].copy_from_slice(&segment.vaddr.to_le_bytes());
            out[ph + 24..ph + 32].copy_from_slice(&segment.vaddr.to_le_bytes());
            out[ph + 32..ph + 40].copy_from_slice(&(segment.data.len() as u64).to_le_bytes());
            out[ph + 40..ph + 48].copy_from_slice(&segment.memsz.to_le_bytes());
            out[ph + 48..ph + 56].copy_from_slice(&(PAGE_SIZE as u64).to_le_bytes());
        }
        out
    }
}

pub const CODE_BASE: u64 = 0x40_0000;
pub const DATA_BASE: u64 = 0x60_0000;

/// A program with a read-only text segment and a writable data segment
/// followed by two pages of bss.
pub fn sample_program() -> Vec<u8> {
    let text: Vec<u8> = (0..0x1800).map(|i| (i % 251) as u8).collect();
    ElfBuilder::new(CODE_BASE)
        .segment(CODE_BASE, &text, text.len() as u64, PF_R | PF_X)
        .segment(DATA_BASE, b"initialized data", 0x3000, PF_R | PF_W)
        .build()
}
