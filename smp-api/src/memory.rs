//! Memory collaborator contract
//!
//! The process core never looks inside a kernel stack or an address space.
//! It only owns the handles and hands them back to the allocator exactly once.

use crate::error::Result;

/// Kernel stack of one process. Not `Clone`: freeing consumes the handle.
#[derive(Debug, PartialEq, Eq)]
pub struct KernelStack {
    id: u64,
}

impl KernelStack {
    pub const fn new(id: u64) -> Self {
        Self { id }
    }

    pub const fn id(&self) -> u64 {
        self.id
    }
}

/// User address space of one process. Not `Clone`: a copy is made only
/// through [`MemoryManager::duplicate_space`].
#[derive(Debug, PartialEq, Eq)]
pub struct AddressSpace {
    id: u64,
}

impl AddressSpace {
    pub const fn new(id: u64) -> Self {
        Self { id }
    }

    pub const fn id(&self) -> u64 {
        self.id
    }
}

/// Trait for the virtual-memory subsystem
pub trait MemoryManager: Send + Sync {
    /// Allocates a kernel stack for a new process
    fn alloc_kstack(&self) -> Result<KernelStack>;

    /// Returns a kernel stack to the allocator
    fn free_kstack(&self, stack: KernelStack);

    /// Creates a fresh address space holding `size` bytes of user memory
    fn setup_space(&self, size: usize) -> Result<AddressSpace>;

    /// Copies the first `size` bytes of `space` into a new address space
    fn duplicate_space(&self, space: &AddressSpace, size: usize) -> Result<AddressSpace>;

    /// Grows or shrinks `space` from `old_size` to `new_size`, returning the new size
    fn grow(&self, space: &mut AddressSpace, old_size: usize, new_size: usize) -> Result<usize>;

    /// Tears down an address space
    fn free_space(&self, space: AddressSpace);
}
