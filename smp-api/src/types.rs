//! Identifiers and small value types shared across the process core

use core::fmt;

/// Process identifier. Assigned monotonically, never reused while the kernel runs.
pub type Pid = u32;

/// Core index, `0..ncpu`.
pub type CpuId = usize;

/// One period of the kernel timer.
pub type Tick = u64;

/// Lifecycle state of a process slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProcState {
    /// Free slot
    #[default]
    Unused,
    /// Claimed by `allocate`, setup in progress
    Embryo,
    /// Blocked on a channel
    Sleeping,
    /// Queued on exactly one run queue
    Runnable,
    /// Executing on a core
    Running,
    /// Exited, waiting to be reaped by its parent
    Zombie,
}

impl ProcState {
    /// Fixed-width label used by process listings.
    pub const fn label(self) -> &'static str {
        match self {
            ProcState::Unused => "unused",
            ProcState::Embryo => "embryo",
            ProcState::Sleeping => "sleep ",
            ProcState::Runnable => "runble",
            ProcState::Running => "run   ",
            ProcState::Zombie => "zombie",
        }
    }
}

impl fmt::Display for ProcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Dispatch discipline of a core, fixed by the parity of its index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedClass {
    /// Even cores: FIFO queue, quantum preemption
    RoundRobin,
    /// Odd cores: earliest creation tick first
    Fcfs,
}

impl SchedClass {
    pub const fn of(cpu: CpuId) -> Self {
        if cpu % 2 == 0 {
            SchedClass::RoundRobin
        } else {
            SchedClass::Fcfs
        }
    }
}

impl fmt::Display for SchedClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedClass::RoundRobin => f.write_str("RR"),
            SchedClass::Fcfs => f.write_str("FCFS"),
        }
    }
}

/// Opaque token a sleeping process waits on.
///
/// A channel is an address plus a key. Two waiters block on the same condition
/// exactly when both parts match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Channel {
    addr: usize,
    key: u64,
}

impl Channel {
    pub const fn raw(addr: usize, key: u64) -> Self {
        Self { addr, key }
    }

    /// Channel named by the address of `obj`.
    pub fn from_ref<T: ?Sized>(obj: &T) -> Self {
        Self::keyed(obj, 0)
    }

    /// Channel named by the address of `obj` and a discriminating key,
    /// for objects that host several independent conditions.
    pub fn keyed<T: ?Sized>(obj: &T, key: u64) -> Self {
        Self {
            addr: obj as *const T as *const () as usize,
            key,
        }
    }

    /// The channel a parent sleeps on while waiting for its children.
    pub const fn process(pid: Pid) -> Self {
        Self {
            addr: 0,
            key: pid as u64,
        }
    }
}

/// Saved user register state of a process.
///
/// Only the fields the process core touches are modelled: the syscall
/// return register, which fork zeroes in the child, and the resume point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrapFrame {
    pub ret: isize,
    pub pc: usize,
    pub sp: usize,
}
