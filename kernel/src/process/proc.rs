//! Per-process context handle
//!
//! A `Proc` is handed to a process body and names the calling process
//! explicitly: every system call goes through it. It also tracks the core the
//! process is on, which changes each time it is switched in.

use core::cell::Cell;
use std::sync::Arc;

use smp_api::{Channel, CpuId, Error, FileRef, Pid, ProcState, Result, Tick, TrapFrame};

use crate::cpu::Cpu;
use crate::fatal::{kernel_panic, park_forever};
use crate::kernel::Kernel;
use crate::process::lifecycle::Origin;
use crate::process::table::{ProcFlags, ProcTable};
use crate::sync::spinlock::SpinGuard;

pub struct Proc {
    kernel: Arc<Kernel>,
    slot: usize,
    pid: Pid,
    cpu: Cell<CpuId>,
}

impl Proc {
    pub(crate) fn new(kernel: Arc<Kernel>, slot: usize, pid: Pid, cpu: CpuId) -> Self {
        Self {
            kernel,
            slot,
            pid,
            cpu: Cell::new(cpu),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    pub(crate) fn slot(&self) -> usize {
        self.slot
    }

    /// Core the process is running on
    pub fn cpu(&self) -> &Cpu {
        self.kernel.cpu(self.cpu.get())
    }

    pub fn cpu_id(&self) -> CpuId {
        self.cpu.get()
    }

    pub fn killed(&self) -> bool {
        let table = self.kernel.ptable.lock(self.cpu());
        table.entry(self.slot).flags().contains(ProcFlags::KILLED)
    }

    pub fn name(&self) -> String {
        let table = self.kernel.ptable.lock(self.cpu());
        table.entry(self.slot).name().to_string()
    }

    /// Saved user registers
    pub fn trapframe(&self) -> TrapFrame {
        self.kernel.slots[self.slot].data.lock().tf
    }

    /// Size of the process's memory in bytes
    pub fn size(&self) -> usize {
        self.kernel.slots[self.slot].data.lock().sz
    }

    /// Return-to-user check run at the end of every system call.
    ///
    /// A killed process gets `Err(Killed)` in place of a successful result so
    /// its body unwinds and exits. A process whose quantum expired yields, and
    /// so does every process once the kernel is halting.
    pub fn trap_return<T>(&self, result: Result<T>) -> Result<T> {
        if self.killed() {
            return result.and(Err(Error::Killed));
        }
        if self.cpu().take_resched() || !self.kernel.is_running() {
            self.yield_now();
            if self.killed() {
                return result.and(Err(Error::Killed));
            }
        }
        result
    }

    /// Timer-interrupt return point for bodies that compute without system calls.
    pub fn preempt_point(&self) -> Result<()> {
        self.trap_return(Ok(()))
    }

    /// Give up the core for one scheduling round.
    pub fn yield_now(&self) {
        let mut table = self.kernel.ptable.lock(self.cpu());
        table.entry_mut(self.slot).state = ProcState::Runnable;
        let me = self.cpu_id();
        table.push_back(me, self.slot);
        let table = self.sched(table);
        drop(table);
    }

    /// Switch to this core's scheduler. The caller holds only the table lock
    /// and has already moved the process out of RUNNING. Returns with the
    /// table lock held on whichever core resumes the process.
    pub(crate) fn sched<'a>(&'a self, table: SpinGuard<'a, ProcTable>) -> SpinGuard<'a, ProcTable> {
        let cpu = self.check_sched(&table);
        let intena = cpu.intena();
        table.leak();
        cpu.scheduler.pass(());

        let next = match self.kernel.slots[self.slot].baton.take(self.kernel.stop.halted_flag()) {
            Some(next) => next,
            None => park_forever(),
        };
        self.cpu.set(next);
        let cpu = self.cpu();
        cpu.set_intena(intena);
        // Safety: the scheduler of `cpu` locked the table and gave up its guard.
        unsafe { self.kernel.ptable.resume(cpu) }
    }

    /// Last switch of an exiting process; nothing resumes it.
    pub(crate) fn sched_final(&self, table: SpinGuard<'_, ProcTable>) {
        let cpu = self.check_sched(&table);
        table.leak();
        cpu.scheduler.pass(());
    }

    fn check_sched<'a>(&'a self, table: &SpinGuard<'a, ProcTable>) -> &'a Cpu {
        let cpu = table.cpu();
        if cpu.id() != self.cpu_id() || !self.kernel.ptable.holding(cpu) {
            kernel_panic!("sched: pid {} does not hold ptable.lock", self.pid);
        }
        if cpu.noff() != 1 {
            kernel_panic!("sched: pid {} holds {} locks", self.pid, cpu.noff());
        }
        if table.entry(self.slot).state() == ProcState::Running {
            kernel_panic!("sched: pid {} running", self.pid);
        }
        if cpu.intr_get() {
            kernel_panic!("sched: cpu {} interruptible", cpu.id());
        }
        cpu
    }

    /// Atomically release `guard`, sleep on `chan`, and reacquire the lock
    /// once woken. The table lock is taken before `guard` is released so a
    /// wakeup cannot slip in between.
    pub fn sleep<'a, T: ?Sized>(&'a self, chan: Channel, guard: SpinGuard<'a, T>) -> SpinGuard<'a, T> {
        let lock = guard.mutex();
        if core::ptr::eq(lock.raw(), self.kernel.ptable.raw()) {
            kernel_panic!("sleep: pid {} passed the table lock", self.pid);
        }
        let table = self.kernel.ptable.lock(self.cpu());
        drop(guard);

        let table = self.sleep_table(chan, table);
        drop(table);
        lock.lock(self.cpu())
    }

    /// `sleep` for callers that already hold the table lock.
    pub(crate) fn sleep_table<'a>(
        &'a self,
        chan: Channel,
        mut table: SpinGuard<'a, ProcTable>,
    ) -> SpinGuard<'a, ProcTable> {
        let entry = table.entry_mut(self.slot);
        entry.chan = Some(chan);
        entry.state = ProcState::Sleeping;
        log::trace!("pid {}: sleep on {:?}", self.pid, chan);

        let mut table = self.sched(table);
        table.entry_mut(self.slot).chan = None;
        table
    }

    /// Wake every process sleeping on `chan`.
    pub fn wakeup(&self, chan: Channel) {
        self.kernel.wakeup_on(self.cpu(), chan);
    }

    pub fn kill(&self, pid: Pid) -> Result<()> {
        let result = {
            let mut table = self.kernel.ptable.lock(self.cpu());
            let result = table.kill(pid);
            let kicked = table.take_kicked();
            drop(table);
            self.kernel.kick(kicked);
            result
        };
        if result.is_ok() {
            log::debug!("kill: pid {} by pid {}", pid, self.pid);
        }
        self.trap_return(result)
    }

    /// Create a child running `body`; returns the child's pid.
    pub fn fork<F>(&self, body: F) -> Result<Pid>
    where
        F: FnOnce(&Proc) -> Result<()> + Send + 'static,
    {
        let origin = Origin::Fork {
            slot: self.slot,
            pid: self.pid,
        };
        let result = self
            .kernel
            .create_process(self.cpu(), origin, "", Box::new(body));
        self.trap_return(result)
    }

    /// Block for `n` ticks. Returns `Interrupted` if killed meanwhile.
    pub fn sleep_ticks(&self, n: Tick) -> Result<()> {
        let clock = &self.kernel.clock;
        let mut ticks = clock.lock(self.cpu());
        let start = *ticks;
        while *ticks - start < n {
            if self.killed() {
                return Err(Error::Interrupted);
            }
            ticks = self.sleep(clock.channel(), ticks);
        }
        drop(ticks);
        self.trap_return(Ok(()))
    }

    /// Ticks since boot, read under `tickslock`.
    pub fn uptime(&self) -> Result<Tick> {
        let now = *self.kernel.clock.lock(self.cpu());
        self.trap_return(Ok(now))
    }

    /// Grow or shrink user memory by `delta` bytes; returns the old size.
    pub fn grow(&self, delta: isize) -> Result<usize> {
        let result = {
            let mut guard = self.kernel.slots[self.slot].data.lock();
            let data = &mut *guard;
            let old = data.sz;
            match (old.checked_add_signed(delta), data.space.as_mut()) {
                (Some(new), Some(space)) => self
                    .kernel
                    .platform
                    .memory
                    .grow(space, old, new)
                    .map(|size| {
                        data.sz = size;
                        old
                    }),
                _ => Err(Error::OutOfMemory),
            }
        };
        self.trap_return(result)
    }

    pub fn set_priority(&self, pid: Pid, priority: i32) -> Result<()> {
        let result = {
            let mut table = self.kernel.ptable.lock(self.cpu());
            match table.find(pid) {
                Some(slot) => {
                    table.entry_mut(slot).priority = priority;
                    Ok(())
                }
                None => Err(Error::NoSuchProcess(pid)),
            }
        };
        if result.is_err() {
            log::warn!("set_priority: pid {} not found", pid);
        }
        self.trap_return(result)
    }

    /// Rename the process. A pinned name keeps it off the load balancer.
    pub fn rename(&self, name: &str) -> Result<()> {
        {
            let mut table = self.kernel.ptable.lock(self.cpu());
            let pinned =
                self.pid == self.kernel.root_pid() || self.kernel.config.is_pinned_name(name);
            let entry = table.entry_mut(self.slot);
            entry.set_name(name);
            entry.flags.set(ProcFlags::PINNED, pinned);
        }
        self.trap_return(Ok(()))
    }

    /// Place `file` in the lowest free descriptor slot.
    pub fn install_file(&self, file: FileRef) -> Result<usize> {
        let result = {
            let mut data = self.kernel.slots[self.slot].data.lock();
            let free = data.files.iter().position(Option::is_none);
            match free {
                Some(fd) => {
                    data.files[fd] = Some(file);
                    Ok(fd)
                }
                None => {
                    drop(data);
                    self.kernel.platform.resources.close_file(file);
                    Err(Error::NoFreeFd)
                }
            }
        };
        self.trap_return(result)
    }

    /// Close descriptor `fd`.
    pub fn close_file(&self, fd: usize) -> Result<()> {
        let file = self.kernel.slots[self.slot]
            .data
            .lock()
            .files
            .get_mut(fd)
            .and_then(Option::take);
        let result = match file {
            Some(file) => {
                self.kernel.platform.resources.close_file(file);
                Ok(())
            }
            None => Err(Error::NoFreeFd),
        };
        self.trap_return(result)
    }

    /// Number of open descriptors
    pub fn open_files(&self) -> usize {
        self.kernel.slots[self.slot]
            .data
            .lock()
            .files
            .iter()
            .filter(|file| file.is_some())
            .count()
    }
}
