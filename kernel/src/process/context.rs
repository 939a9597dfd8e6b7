// Saved execution context of a process
//
// A process is a host thread that runs only while it holds its core's baton.
// `Baton` carries control from one thread to another; `ProcData` is the state
// that belongs to the process itself rather than to the table.

use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

use smp_api::{AddressSpace, CpuId, DirRef, FileRef, KernelStack, TrapFrame};

use crate::config::NOFILE;

// How often a waiter re-checks its abandon flag
const POLL: Duration = Duration::from_millis(20);

/// One-shot handoff of control between two host threads.
pub(crate) struct Baton<T> {
    slot: Mutex<Option<T>>,
    ready: Condvar,
}

impl<T> Baton<T> {
    pub(crate) const fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    /// Hand control to the thread waiting in [`Baton::take`].
    pub(crate) fn pass(&self, value: T) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(value);
        self.ready.notify_one();
    }

    /// Wait for control. Returns `None` once `abandon` is set and nothing was passed.
    pub(crate) fn take(&self, abandon: &AtomicBool) -> Option<T> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(value) = slot.take() {
                return Some(value);
            }
            if abandon.load(Ordering::Acquire) {
                return None;
            }
            slot = self
                .ready
                .wait_timeout(slot, POLL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

/// Per-process state owned by the process, not by the table.
///
/// Only the process itself touches it while alive; its creator fills it in
/// while the slot is EMBRYO and its reaper empties it once the slot is ZOMBIE.
#[derive(Debug, Default)]
pub(crate) struct ProcData {
    pub(crate) kstack: Option<KernelStack>,
    pub(crate) space: Option<AddressSpace>,
    /// Size of process memory in bytes
    pub(crate) sz: usize,
    pub(crate) tf: TrapFrame,
    pub(crate) files: [Option<FileRef>; NOFILE],
    pub(crate) cwd: Option<DirRef>,
}

/// Per-slot context: the resume baton and the process-owned data.
pub(crate) struct Slot {
    /// Carries the id of the core the process is switched onto
    pub(crate) baton: Baton<CpuId>,
    pub(crate) data: spin::Mutex<ProcData>,
}

impl Slot {
    pub(crate) fn new() -> Self {
        Self {
            baton: Baton::new(),
            data: spin::Mutex::new(ProcData::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn baton_carries_value_across_threads() {
        let baton = Arc::new(Baton::new());
        let flag = Arc::new(AtomicBool::new(false));
        let remote = baton.clone();
        let remote_flag = flag.clone();
        let waiter = std::thread::spawn(move || remote.take(&remote_flag));
        baton.pass(3usize);
        assert_eq!(waiter.join().unwrap(), Some(3));
    }

    #[test]
    fn abandoned_baton_returns_none() {
        let baton: Baton<()> = Baton::new();
        let flag = AtomicBool::new(true);
        assert_eq!(baton.take(&flag), None);
    }

    #[test]
    fn passed_value_wins_over_abandon() {
        let baton = Baton::new();
        baton.pass(7u8);
        assert_eq!(baton.take(&AtomicBool::new(true)), Some(7));
    }
}
