// Per-CPU state
// Interrupt nesting, the running process and the wake-from-idle latch

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

use smp_api::{CpuId, SchedClass};

use crate::fatal::kernel_panic;
use crate::process::context::Baton;

const NO_PROC: usize = usize::MAX;

/// One core of the machine.
///
/// Exactly one host thread executes on behalf of a core at any instant: its
/// scheduler loop or the process that loop switched into. The fields are
/// atomics so the baton handoff between those threads publishes them.
pub struct Cpu {
    id: CpuId,
    /// Depth of push_off nesting
    noff: AtomicU32,
    /// Were interrupts enabled before the outermost push_off?
    intena: AtomicBool,
    /// Interrupt-enable flag of the core
    intr: AtomicBool,
    /// Table slot of the running process
    current: AtomicUsize,
    /// Quantum expired; the running process should yield at its next trap return
    need_resched: AtomicBool,
    /// Control returning from a process to this core's scheduler
    pub(crate) scheduler: Baton<()>,
    pending: Mutex<bool>,
    wfi: Condvar,
}

impl Cpu {
    pub fn new(id: CpuId) -> Self {
        Self {
            id,
            noff: AtomicU32::new(0),
            intena: AtomicBool::new(false),
            intr: AtomicBool::new(false),
            current: AtomicUsize::new(NO_PROC),
            need_resched: AtomicBool::new(false),
            scheduler: Baton::new(),
            pending: Mutex::new(false),
            wfi: Condvar::new(),
        }
    }

    pub fn id(&self) -> CpuId {
        self.id
    }

    pub fn class(&self) -> SchedClass {
        SchedClass::of(self.id)
    }

    pub fn intr_get(&self) -> bool {
        self.intr.load(Ordering::Relaxed)
    }

    pub fn intr_on(&self) {
        self.intr.store(true, Ordering::Relaxed);
    }

    pub fn intr_off(&self) {
        self.intr.store(false, Ordering::Relaxed);
    }

    pub fn noff(&self) -> u32 {
        self.noff.load(Ordering::Relaxed)
    }

    pub fn intena(&self) -> bool {
        self.intena.load(Ordering::Relaxed)
    }

    pub(crate) fn set_intena(&self, intena: bool) {
        self.intena.store(intena, Ordering::Relaxed);
    }

    /// Disable interrupts, remembering whether they were on at the outermost level.
    pub fn push_off(&self) {
        let old = self.intr_get();
        self.intr_off();
        if self.noff() == 0 {
            self.set_intena(old);
        }
        self.noff.fetch_add(1, Ordering::Relaxed);
    }

    /// Undo one push_off; re-enable interrupts once the outermost level is popped.
    pub fn pop_off(&self) {
        if self.intr_get() {
            kernel_panic!("pop_off: cpu {} interruptible", self.id);
        }
        let noff = self.noff();
        if noff < 1 {
            kernel_panic!("pop_off: cpu {} not pushed", self.id);
        }
        self.noff.store(noff - 1, Ordering::Relaxed);
        if noff == 1 && self.intena() {
            self.intr_on();
        }
    }

    /// Slot of the running process, if any.
    pub fn current_slot(&self) -> Option<usize> {
        match self.current.load(Ordering::Acquire) {
            NO_PROC => None,
            slot => Some(slot),
        }
    }

    pub(crate) fn set_current(&self, slot: Option<usize>) {
        self.current.store(slot.unwrap_or(NO_PROC), Ordering::Release);
    }

    pub(crate) fn request_resched(&self) {
        self.need_resched.store(true, Ordering::Release);
    }

    pub(crate) fn clear_resched(&self) {
        self.need_resched.store(false, Ordering::Release);
    }

    pub(crate) fn take_resched(&self) -> bool {
        self.need_resched.swap(false, Ordering::AcqRel)
    }

    /// Raise an interrupt on this core, waking it if it is idle.
    pub fn interrupt(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        *pending = true;
        self.wfi.notify_one();
    }

    /// Halt until an interrupt arrives or `timeout` passes.
    pub(crate) fn wait_for_interrupt(&self, timeout: Duration) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if !*pending {
            pending = self
                .wfi
                .wait_timeout(pending, timeout)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *pending = false;
    }
}
