//! Per-CPU scheduler
//!
//! Every core runs `run_cpu` on its own host thread. Even cores pop the head
//! of their queue; odd cores take the earliest-created entry. Even cores also
//! run one load-balancing pass per iteration.

pub mod balance;
pub mod placement;

use std::sync::Arc;
use std::time::Duration;

use smp_api::{ProcState, SchedClass};

use crate::cpu::Cpu;
use crate::fatal::kernel_panic;
use crate::kernel::Kernel;
use crate::process::table::ProcTable;
use crate::sync::spinlock::SpinGuard;

pub use balance::{balance_load, Migration};
pub use placement::least_loaded_even;

// An idle core also wakes on its own after this long
const IDLE_TIMEOUT: Duration = Duration::from_millis(5);

pub(crate) fn run_cpu(kernel: Arc<Kernel>, id: usize) {
    let _sentinel = kernel.sentinel();
    let cpu = kernel.cpu(id);
    cpu.set_current(None);
    log::debug!("cpu {}: scheduler started ({})", id, cpu.class());

    while kernel.is_running() {
        cpu.intr_on();

        let mut table = kernel.ptable.lock(cpu);
        if cpu.class() == SchedClass::RoundRobin {
            balance_load(&mut table, id, kernel.config.balance_threshold);
            let kicked = table.take_kicked();
            kernel.kick(kicked & !(1 << id));
        }

        let picked = match cpu.class() {
            SchedClass::RoundRobin => table.pop_front(id),
            SchedClass::Fcfs => table.take_earliest(id),
        };

        let table = match picked {
            Some(slot) => match switch_to(&kernel, cpu, table, slot) {
                Some(table) => table,
                None => return,
            },
            None => table,
        };
        drop(table);

        if picked.is_none() {
            cpu.wait_for_interrupt(IDLE_TIMEOUT);
        }
    }
    log::debug!("cpu {}: scheduler stopped", id);
}

/// Switch into `slot` and come back once it gives the core up.
///
/// The table lock travels with control: the process releases it after it
/// resumes and holds it again when it switches back. Returns `None` if the
/// kernel panicked while the process was running.
fn switch_to<'a>(
    kernel: &'a Kernel,
    cpu: &'a Cpu,
    mut table: SpinGuard<'a, ProcTable>,
    slot: usize,
) -> Option<SpinGuard<'a, ProcTable>> {
    let entry = table.entry_mut(slot);
    if entry.state != ProcState::Runnable {
        kernel_panic!(
            "scheduler: cpu {} picked pid {} in state {:?}",
            cpu.id(),
            entry.pid(),
            entry.state
        );
    }
    entry.state = ProcState::Running;
    entry.ticks_consumed = 0;
    entry.cpu_id = cpu.id();
    let pid = entry.pid();
    log::trace!("cpu {}: run pid {}", cpu.id(), pid);

    cpu.set_current(Some(slot));
    cpu.clear_resched();
    table.leak();
    kernel.slots[slot].baton.pass(cpu.id());
    cpu.scheduler.take(kernel.stop.panicked_flag())?;

    // Safety: the process switched back holding the table lock on this core
    // and gave up its guard.
    let table = unsafe { kernel.ptable.resume(cpu) };
    let entry = table.entry(slot);
    match entry.state() {
        ProcState::Running => {
            kernel_panic!("scheduler: pid {} still running after switch", pid)
        }
        ProcState::Runnable if entry.queued_on().is_none() => {
            kernel_panic!("scheduler: pid {} runnable but on no queue", pid)
        }
        _ => {}
    }
    cpu.set_current(None);
    Some(table)
}
