// Instrumented spin lock
//
// Per-core acquisition and spin counters feed the lock contention report.
// Holding a spin lock keeps interrupts off on the holding core.

use core::cell::UnsafeCell;
use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use smp_api::CpuId;

use crate::config::MAX_CPUS;
use crate::cpu::Cpu;
use crate::fatal::kernel_panic;

const NO_OWNER: usize = usize::MAX;

/// Counter slots: one per core plus the interrupt context.
const COUNTER_SLOTS: usize = MAX_CPUS + 1;

// Host threads share physical cores; give the holder a chance to run.
const SPINS_BEFORE_YIELD: u64 = 128;

/// Counters of one core against one lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockStats {
    pub acquisitions: u64,
    pub spins: u64,
}

impl LockStats {
    /// Average spin iterations per acquisition, 0 when never acquired.
    pub fn score(&self) -> u64 {
        if self.acquisitions == 0 {
            0
        } else {
            self.spins / self.acquisitions
        }
    }
}

/// Raw spinlock for short critical sections
pub struct SpinLock {
    name: &'static str,
    locked: AtomicBool,
    // Holding core, for re-entrancy and ownership checks
    owner: AtomicUsize,
    acq_count: [AtomicU64; COUNTER_SLOTS],
    total_spins: [AtomicU64; COUNTER_SLOTS],
}

impl SpinLock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            locked: AtomicBool::new(false),
            owner: AtomicUsize::new(NO_OWNER),
            acq_count: [const { AtomicU64::new(0) }; COUNTER_SLOTS],
            total_spins: [const { AtomicU64::new(0) }; COUNTER_SLOTS],
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn acquire(&self, cpu: &Cpu) {
        // Disable interrupts to prevent deadlock with the timer path
        cpu.push_off();
        if self.holding(cpu) {
            kernel_panic!("acquire {}: cpu {} already holds it", self.name, cpu.id());
        }

        let mut spins = 0u64;
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spins += 1;
            if spins % SPINS_BEFORE_YIELD == 0 {
                std::thread::yield_now();
            } else {
                core::hint::spin_loop();
            }
        }

        let slot = cpu.id();
        self.total_spins[slot].fetch_add(spins, Ordering::Relaxed);
        self.acq_count[slot].fetch_add(1, Ordering::Relaxed);
        self.owner.store(slot, Ordering::Relaxed);
    }

    pub fn release(&self, cpu: &Cpu) {
        if !self.holding(cpu) {
            kernel_panic!(
                "release {}: cpu {} is not the owner (owner {:?})",
                self.name,
                cpu.id(),
                self.owner()
            );
        }
        self.owner.store(NO_OWNER, Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
        cpu.pop_off();
    }

    /// Check if `cpu` is holding the lock
    pub fn holding(&self, cpu: &Cpu) -> bool {
        self.locked.load(Ordering::Relaxed) && self.owner.load(Ordering::Relaxed) == cpu.id()
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    pub fn owner(&self) -> Option<CpuId> {
        match self.owner.load(Ordering::Relaxed) {
            NO_OWNER => None,
            id => Some(id),
        }
    }

    pub fn stats(&self, cpu: CpuId) -> LockStats {
        if cpu >= COUNTER_SLOTS {
            return LockStats::default();
        }
        LockStats {
            acquisitions: self.acq_count[cpu].load(Ordering::Relaxed),
            spins: self.total_spins[cpu].load(Ordering::Relaxed),
        }
    }

    /// Contention score of each of the first `ncpu` cores
    pub fn contention_scores(&self, ncpu: usize) -> Vec<u64> {
        (0..ncpu).map(|cpu| self.stats(cpu).score()).collect()
    }
}

/// Data protected by a [`SpinLock`].
///
/// Locking names the core that will hold the lock; the guard remembers it so
/// release happens on the same core.
pub struct SpinMutex<T: ?Sized> {
    lock: SpinLock,
    data: UnsafeCell<T>,
}

// Safety: the lock serializes every access to `data`
unsafe impl<T: ?Sized + Send> Sync for SpinMutex<T> {}
unsafe impl<T: ?Sized + Send> Send for SpinMutex<T> {}

impl<T> SpinMutex<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            lock: SpinLock::new(name),
            data: UnsafeCell::new(data),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> SpinMutex<T> {
    pub fn lock<'a>(&'a self, cpu: &'a Cpu) -> SpinGuard<'a, T> {
        self.lock.acquire(cpu);
        SpinGuard { mutex: self, cpu }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub fn holding(&self, cpu: &Cpu) -> bool {
        self.lock.holding(cpu)
    }

    pub fn raw(&self) -> &SpinLock {
        &self.lock
    }

    /// Rebuild the guard of a lock that `cpu` holds but whose guard was
    /// given up with [`SpinGuard::leak`] before a context switch.
    ///
    /// # Safety
    /// No other guard for this lock may be alive.
    pub(crate) unsafe fn resume<'a>(&'a self, cpu: &'a Cpu) -> SpinGuard<'a, T> {
        if !self.lock.holding(cpu) {
            kernel_panic!("resume {}: cpu {} does not hold it", self.lock.name, cpu.id());
        }
        SpinGuard { mutex: self, cpu }
    }
}

/// RAII guard for SpinMutex
pub struct SpinGuard<'a, T: ?Sized> {
    mutex: &'a SpinMutex<T>,
    cpu: &'a Cpu,
}

impl<'a, T: ?Sized> SpinGuard<'a, T> {
    pub fn mutex(&self) -> &'a SpinMutex<T> {
        self.mutex
    }

    /// Core that owns the lock
    pub fn cpu(&self) -> &'a Cpu {
        self.cpu
    }

    /// Give up the guard without releasing the lock. The lock stays owned by
    /// the same core; [`SpinMutex::resume`] hands it to the next thread that
    /// runs there.
    pub(crate) fn leak(self) {
        let _ = ManuallyDrop::new(self);
    }
}

impl<T: ?Sized> Deref for SpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        // Unwinding from a kernel panic must not panic twice.
        if std::thread::panicking() && !self.mutex.lock.holding(self.cpu) {
            return;
        }
        self.mutex.lock.release(self.cpu);
    }
}
