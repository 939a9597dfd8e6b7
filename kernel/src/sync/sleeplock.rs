// Sleep lock
// A long-term lock: contenders sleep instead of spinning.

use smp_api::{Channel, Pid};

use crate::fatal::kernel_panic;
use crate::process::Proc;
use crate::sync::spinlock::SpinMutex;

struct SleepState {
    locked: bool,
    holder: Option<Pid>,
}

pub struct Sleeplock {
    name: &'static str,
    inner: SpinMutex<SleepState>,
}

impl Sleeplock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: SpinMutex::new(
                "sleep lock",
                SleepState {
                    locked: false,
                    holder: None,
                },
            ),
        }
    }

    pub fn acquire_sleep(&self, proc: &Proc) {
        let mut state = self.inner.lock(proc.cpu());
        while state.locked {
            state = proc.sleep(Channel::from_ref(self), state);
        }
        state.locked = true;
        state.holder = Some(proc.pid());
    }

    pub fn release_sleep(&self, proc: &Proc) {
        let mut state = self.inner.lock(proc.cpu());
        if state.holder != Some(proc.pid()) {
            drop(state);
            kernel_panic!("releasesleep {}: pid {} is not the holder", self.name, proc.pid());
        }
        state.locked = false;
        state.holder = None;
        proc.wakeup(Channel::from_ref(self));
    }

    pub fn holding(&self, proc: &Proc) -> bool {
        let state = self.inner.lock(proc.cpu());
        state.locked && state.holder == Some(proc.pid())
    }
}
