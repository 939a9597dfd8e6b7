// Reader-writer lock
//
// Many readers or one writer. A writer waits for active readers to drain;
// readers wait only while a writer holds the lock. Every release that can
// unblock someone wakes all waiters, who re-check and may sleep again.

use smp_api::Channel;

use crate::fatal::kernel_panic;
use crate::process::Proc;
use crate::sync::spinlock::SpinMutex;

#[derive(Debug, Default)]
struct RwState {
    readers: usize,
    writer: bool,
}

pub struct RwLock {
    name: &'static str,
    inner: SpinMutex<RwState>,
}

impl RwLock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: SpinMutex::new(
                "rwlock",
                RwState {
                    readers: 0,
                    writer: false,
                },
            ),
        }
    }

    fn channel(&self) -> Channel {
        Channel::from_ref(self)
    }

    pub fn acquire_read(&self, proc: &Proc) {
        let mut state = self.inner.lock(proc.cpu());
        while state.writer {
            state = proc.sleep(self.channel(), state);
        }
        state.readers += 1;
    }

    pub fn release_read(&self, proc: &Proc) {
        let mut state = self.inner.lock(proc.cpu());
        if state.readers == 0 {
            drop(state);
            kernel_panic!("rwlock {}: release_read with no readers", self.name);
        }
        state.readers -= 1;
        if state.readers == 0 {
            proc.wakeup(self.channel());
        }
    }

    pub fn acquire_write(&self, proc: &Proc) {
        let mut state = self.inner.lock(proc.cpu());
        while state.writer || state.readers > 0 {
            state = proc.sleep(self.channel(), state);
        }
        state.writer = true;
    }

    pub fn release_write(&self, proc: &Proc) {
        let mut state = self.inner.lock(proc.cpu());
        if !state.writer {
            drop(state);
            kernel_panic!("rwlock {}: release_write without a writer", self.name);
        }
        state.writer = false;
        proc.wakeup(self.channel());
    }

    /// Active readers and whether a writer holds the lock
    pub fn snapshot(&self, proc: &Proc) -> (usize, bool) {
        let state = self.inner.lock(proc.cpu());
        (state.readers, state.writer)
    }
}
