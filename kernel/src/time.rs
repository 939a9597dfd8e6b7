// Kernel clock
// The tick counter, its lock, and the timer interrupt

use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use smp_api::{Channel, ProcState, SchedClass, Tick};

use crate::cpu::Cpu;
use crate::kernel::Kernel;
use crate::sync::spinlock::{SpinGuard, SpinMutex};

/// Tick counter protected by `tickslock`.
///
/// Writers hold the lock; the mirror lets the scheduler read the current tick
/// without taking it, as creation-time stamps do.
pub struct Clock {
    ticks: SpinMutex<Tick>,
    mirror: AtomicU64,
}

impl Clock {
    pub const fn new() -> Self {
        Self {
            ticks: SpinMutex::new("tickslock", 0),
            mirror: AtomicU64::new(0),
        }
    }

    pub fn now(&self) -> Tick {
        self.mirror.load(Ordering::Acquire)
    }

    pub fn lock<'a>(&'a self, cpu: &'a Cpu) -> SpinGuard<'a, Tick> {
        self.ticks.lock(cpu)
    }

    /// Channel that sleepers in `sleep_ticks` wait on
    pub fn channel(&self) -> Channel {
        Channel::from_ref(&self.ticks)
    }

    pub fn lock_stats(&self) -> &crate::sync::spinlock::SpinLock {
        self.ticks.raw()
    }

    fn advance(&self, ticks: &mut SpinGuard<'_, Tick>) -> Tick {
        **ticks += 1;
        self.mirror.store(**ticks, Ordering::Release);
        **ticks
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel {
    /// Deliver one timer interrupt.
    ///
    /// Advances the clock and wakes tick sleepers under `tickslock`, then
    /// charges a tick to every running process and asks round-robin cores
    /// whose process used up its quantum to reschedule. Idle cores are woken
    /// so they re-scan their queues.
    pub fn tick(&self) -> Tick {
        self.with_irq(|irq| {
            let mut ticks = self.clock.lock(irq);
            let now = self.clock.advance(&mut ticks);
            self.wakeup_on(irq, self.clock.channel());
            drop(ticks);

            let quantum = self.config.quantum_ticks;
            let mut table = self.ptable.lock(irq);
            for cpu in &self.cpus[..self.config.ncpu] {
                let Some(slot) = cpu.current_slot() else {
                    continue;
                };
                let entry = table.entry_mut(slot);
                if entry.state != ProcState::Running {
                    continue;
                }
                entry.ticks_consumed += 1;
                // FCFS cores run a process until it blocks or yields.
                if cpu.class() == SchedClass::RoundRobin && entry.ticks_consumed >= quantum {
                    cpu.request_resched();
                }
            }
            drop(table);

            for cpu in &self.cpus[..self.config.ncpu] {
                cpu.interrupt();
            }
            now
        })
    }
}

/// Timer thread: one tick per `interval` until the kernel stops.
pub(crate) fn run_timer(kernel: Arc<Kernel>, interval: Duration) {
    let _sentinel = kernel.sentinel();
    while kernel.is_running() {
        std::thread::sleep(interval);
        kernel.tick();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_updates_mirror() {
        let clock = Clock::new();
        let cpu = Cpu::new(0);
        {
            let mut ticks = clock.lock(&cpu);
            clock.advance(&mut ticks);
            clock.advance(&mut ticks);
        }
        assert_eq!(clock.now(), 2);
        assert_eq!(clock.lock_stats().stats(0).acquisitions, 1);
    }
}
