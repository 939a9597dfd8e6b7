//! Error handling for the SMP process core

use alloc::string::String;
use core::fmt;

use crate::types::Pid;

/// Recoverable failures reported to the caller of a kernel operation.
///
/// Broken invariants are never reported through this type; they halt the
/// kernel instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Every process slot is in use
    NoFreeProc,
    /// A kernel stack or address-space page could not be allocated
    OutOfMemory,
    /// The parent's address space could not be copied
    SpaceDuplication,
    /// `wait` was called by a process with no children
    NoChildren,
    /// A blocking call was cut short because the caller was killed
    Interrupted,
    /// The caller was killed and must unwind to exit
    Killed,
    /// No live process carries this id
    NoSuchProcess(Pid),
    /// The open-file table of the caller is full
    NoFreeFd,
    /// Throughput measurement stopped without having been started
    ThroughputNotStarted,
    /// Throughput measurement stopped in the same tick it started
    ZeroElapsed,
    /// The host refused to start a core or process thread
    ThreadSpawn,
    /// Invalid kernel configuration
    Config(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NoFreeProc => write!(f, "no process available"),
            Error::OutOfMemory => write!(f, "out of memory"),
            Error::SpaceDuplication => write!(f, "address space duplication failed"),
            Error::NoChildren => write!(f, "no children"),
            Error::Interrupted => write!(f, "interrupted"),
            Error::Killed => write!(f, "killed"),
            Error::NoSuchProcess(pid) => write!(f, "no such process: {}", pid),
            Error::NoFreeFd => write!(f, "no free file descriptor"),
            Error::ThroughputNotStarted => write!(f, "throughput measurement not started"),
            Error::ZeroElapsed => write!(f, "elapsed time is zero or negative"),
            Error::ThreadSpawn => write!(f, "host thread spawn failed"),
            Error::Config(msg) => write!(f, "configuration error: {}", msg),
        }
    }
}

/// Result type for kernel operations
pub type Result<T> = core::result::Result<T, Error>;
