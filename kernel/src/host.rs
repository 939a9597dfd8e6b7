//! In-memory collaborators
//!
//! Hosted stand-ins for the memory allocator, the file layer and the
//! interrupt controller. Each keeps a ledger of live objects so callers can
//! check that everything handed out comes back exactly once.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::{HashMap, HashSet};
use smp_api::{
    AddressSpace, CpuId, DirRef, Error, FileRef, InterruptController, Irq, KernelStack,
    MemoryManager, ResourceManager, Result,
};
use spin::Mutex;

use crate::kernel::Platform;

impl Platform {
    /// Fresh in-memory collaborators.
    pub fn host() -> Self {
        Self::new(
            Arc::new(HostMemory::new()),
            Arc::new(HostResources::new()),
            Arc::new(HostInterrupts::new()),
        )
    }
}

/// Kernel stacks and address spaces as numbered entries
#[derive(Debug, Default)]
pub struct HostMemory {
    next_id: AtomicU64,
    stacks: Mutex<HashSet<u64>>,
    /// Space id to size in bytes
    spaces: Mutex<HashMap<u64, usize>>,
    fail_kstack: AtomicBool,
    fail_duplicate: AtomicBool,
    /// Upper bound for `grow`, if any
    limit: Mutex<Option<usize>>,
}

impl HostMemory {
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Make every later stack allocation fail (or succeed again).
    pub fn fail_kstack(&self, fail: bool) {
        self.fail_kstack.store(fail, Ordering::Release);
    }

    pub fn fail_duplicate(&self, fail: bool) {
        self.fail_duplicate.store(fail, Ordering::Release);
    }

    pub fn set_limit(&self, limit: Option<usize>) {
        *self.limit.lock() = limit;
    }

    pub fn live_stacks(&self) -> usize {
        self.stacks.lock().len()
    }

    pub fn live_spaces(&self) -> usize {
        self.spaces.lock().len()
    }

    pub fn space_size(&self, space: &AddressSpace) -> Option<usize> {
        self.spaces.lock().get(&space.id()).copied()
    }
}

impl MemoryManager for HostMemory {
    fn alloc_kstack(&self) -> Result<KernelStack> {
        if self.fail_kstack.load(Ordering::Acquire) {
            return Err(Error::OutOfMemory);
        }
        let id = self.fresh_id();
        self.stacks.lock().insert(id);
        Ok(KernelStack::new(id))
    }

    fn free_kstack(&self, stack: KernelStack) {
        if !self.stacks.lock().remove(&stack.id()) {
            log::warn!("host: kernel stack {} freed twice", stack.id());
        }
    }

    fn setup_space(&self, size: usize) -> Result<AddressSpace> {
        let id = self.fresh_id();
        self.spaces.lock().insert(id, size);
        Ok(AddressSpace::new(id))
    }

    fn duplicate_space(&self, space: &AddressSpace, size: usize) -> Result<AddressSpace> {
        if self.fail_duplicate.load(Ordering::Acquire) {
            return Err(Error::SpaceDuplication);
        }
        let mut spaces = self.spaces.lock();
        if !spaces.contains_key(&space.id()) {
            return Err(Error::SpaceDuplication);
        }
        let id = self.fresh_id();
        spaces.insert(id, size);
        Ok(AddressSpace::new(id))
    }

    fn grow(&self, space: &mut AddressSpace, _old_size: usize, new_size: usize) -> Result<usize> {
        if self.limit.lock().is_some_and(|limit| new_size > limit) {
            return Err(Error::OutOfMemory);
        }
        match self.spaces.lock().get_mut(&space.id()) {
            Some(size) => {
                *size = new_size;
                Ok(new_size)
            }
            None => Err(Error::OutOfMemory),
        }
    }

    fn free_space(&self, space: AddressSpace) {
        if self.spaces.lock().remove(&space.id()).is_none() {
            log::warn!("host: address space {} freed twice", space.id());
        }
    }
}

/// Reference-counted files and directories
pub struct HostResources {
    next_id: AtomicU64,
    /// Object id to outstanding references
    files: Mutex<HashMap<u64, usize>>,
    dirs: Mutex<HashMap<u64, usize>>,
    root: spin::Once<u64>,
}

impl HostResources {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            files: Mutex::new(HashMap::new()),
            dirs: Mutex::new(HashMap::new()),
            root: spin::Once::new(),
        }
    }

    /// A newly opened file with one reference.
    pub fn open(&self) -> FileRef {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.files.lock().insert(id, 1);
        FileRef::new(id)
    }

    pub fn file_refs(&self, id: u64) -> usize {
        self.files.lock().get(&id).copied().unwrap_or(0)
    }

    /// Outstanding references across all files
    pub fn open_file_refs(&self) -> usize {
        self.files.lock().values().sum()
    }

    pub fn dir_refs(&self) -> usize {
        self.dirs.lock().values().sum()
    }
}

impl Default for HostResources {
    fn default() -> Self {
        Self::new()
    }
}

fn take_ref(table: &Mutex<HashMap<u64, usize>>, id: u64) {
    *table.lock().entry(id).or_insert(0) += 1;
}

fn drop_ref(table: &Mutex<HashMap<u64, usize>>, id: u64, what: &str) {
    let mut table = table.lock();
    match table.get_mut(&id) {
        Some(refs) if *refs > 1 => *refs -= 1,
        Some(_) => {
            table.remove(&id);
        }
        None => log::warn!("host: {} {} released with no references", what, id),
    }
}

impl ResourceManager for HostResources {
    fn dup_file(&self, file: &FileRef) -> FileRef {
        take_ref(&self.files, file.id());
        FileRef::new(file.id())
    }

    fn close_file(&self, file: FileRef) {
        drop_ref(&self.files, file.id(), "file");
    }

    fn root_dir(&self) -> Result<DirRef> {
        let id = *self
            .root
            .call_once(|| self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        take_ref(&self.dirs, id);
        Ok(DirRef::new(id))
    }

    fn dup_dir(&self, dir: &DirRef) -> DirRef {
        take_ref(&self.dirs, dir.id());
        DirRef::new(dir.id())
    }

    fn release_dir(&self, dir: DirRef) {
        drop_ref(&self.dirs, dir.id(), "directory");
    }
}

/// Records which lines are routed to which cores
#[derive(Debug, Default)]
pub struct HostInterrupts {
    enabled: Mutex<HashSet<(Irq, CpuId)>>,
}

impl HostInterrupts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self, irq: Irq, cpu: CpuId) -> bool {
        self.enabled.lock().contains(&(irq, cpu))
    }
}

impl InterruptController for HostInterrupts {
    fn enable(&self, irq: Irq, cpu: CpuId) -> Result<()> {
        self.enabled.lock().insert((irq, cpu));
        log::trace!("host: irq {} enabled on cpu {}", irq, cpu);
        Ok(())
    }
}
