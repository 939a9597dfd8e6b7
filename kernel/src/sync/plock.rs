// Priority lock
//
// A blocking mutex whose release hands ownership straight to the waiter with
// the highest priority. Waiters live in a fixed pool for exactly the duration
// of their blocking call.

use smp_api::{Channel, Error, Pid, Result};

use crate::config::NPROC;
use crate::fatal::kernel_panic;
use crate::process::Proc;
use crate::sync::spinlock::SpinMutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Waiter {
    pid: Pid,
    priority: i32,
}

struct PlockState {
    locked: bool,
    holder: Option<Pid>,
    /// Oldest first. Scans run newest first.
    waiters: heapless::Vec<Waiter, NPROC>,
}

pub struct PriorityLock {
    name: &'static str,
    inner: SpinMutex<PlockState>,
}

impl PriorityLock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: SpinMutex::new(
                "plock_internal",
                PlockState {
                    locked: false,
                    holder: None,
                    waiters: heapless::Vec::new(),
                },
            ),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Channel a waiter sleeps on: one per (lock, waiter) pair.
    fn waiter_channel(&self, pid: Pid) -> Channel {
        Channel::keyed(self, pid as u64)
    }

    /// Take the lock, blocking behind higher-priority waiters.
    ///
    /// Returns `Interrupted` if the caller is killed before ownership is
    /// handed to it.
    pub fn acquire(&self, proc: &Proc, priority: i32) -> Result<()> {
        let pid = proc.pid();
        let mut state = self.inner.lock(proc.cpu());
        if !state.locked {
            state.locked = true;
            state.holder = Some(pid);
            return Ok(());
        }

        if state.waiters.push(Waiter { pid, priority }).is_err() {
            kernel_panic!("plock {}: waiter pool exhausted", self.name);
        }
        log::trace!("plock {}: pid {} waits at priority {}", self.name, pid, priority);
        let chan = self.waiter_channel(pid);
        loop {
            state = proc.sleep(chan, state);
            let queued = state.waiters.iter().position(|waiter| waiter.pid == pid);
            match queued {
                None if state.holder == Some(pid) => return Ok(()),
                Some(index) if proc.killed() => {
                    state.waiters.remove(index);
                    return Err(Error::Interrupted);
                }
                _ => {}
            }
        }
    }

    /// Hand the lock to the highest-priority waiter, or free it.
    ///
    /// Only the holder may release; anyone else is a fatal protocol violation.
    pub fn release(&self, proc: &Proc) {
        let pid = proc.pid();
        let mut state = self.inner.lock(proc.cpu());
        if state.holder != Some(pid) {
            let holder = state.holder;
            drop(state);
            kernel_panic!(
                "plock {}: release by pid {}, held by {:?}",
                self.name,
                pid,
                holder
            );
        }

        // First maximum found scanning newest first
        let mut best: Option<(usize, i32)> = None;
        for (index, waiter) in state.waiters.iter().enumerate().rev() {
            if best.is_none_or(|(_, priority)| waiter.priority > priority) {
                best = Some((index, waiter.priority));
            }
        }

        match best {
            Some((index, _)) => {
                let winner = state.waiters.remove(index);
                state.holder = Some(winner.pid);
                log::trace!(
                    "plock {}: pid {} hands off to pid {} (priority {})",
                    self.name,
                    pid,
                    winner.pid,
                    winner.priority
                );
                proc.wakeup(self.waiter_channel(winner.pid));
            }
            None => {
                state.locked = false;
                state.holder = None;
            }
        }
    }

    pub fn holder(&self, proc: &Proc) -> Option<Pid> {
        self.inner.lock(proc.cpu()).holder
    }

    pub fn waiting(&self, proc: &Proc) -> usize {
        self.inner.lock(proc.cpu()).waiters.len()
    }
}
