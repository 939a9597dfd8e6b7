//! File-system collaborator contract

use crate::error::Result;

/// Reference to an open file. Each handle is one reference count.
#[derive(Debug, PartialEq, Eq)]
pub struct FileRef {
    id: u64,
}

impl FileRef {
    pub const fn new(id: u64) -> Self {
        Self { id }
    }

    pub const fn id(&self) -> u64 {
        self.id
    }
}

/// Reference to a directory inode, used as a working directory.
#[derive(Debug, PartialEq, Eq)]
pub struct DirRef {
    id: u64,
}

impl DirRef {
    pub const fn new(id: u64) -> Self {
        Self { id }
    }

    pub const fn id(&self) -> u64 {
        self.id
    }
}

/// Trait for the open-file and directory layer
pub trait ResourceManager: Send + Sync {
    /// Takes another reference to an open file
    fn dup_file(&self, file: &FileRef) -> FileRef;

    /// Drops one reference to an open file
    fn close_file(&self, file: FileRef);

    /// Looks up the root directory
    fn root_dir(&self) -> Result<DirRef>;

    /// Takes another reference to a directory
    fn dup_dir(&self, dir: &DirRef) -> DirRef;

    /// Drops one reference to a directory
    fn release_dir(&self, dir: DirRef);
}
