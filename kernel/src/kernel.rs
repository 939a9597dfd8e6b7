//! The kernel instance
//!
//! One `Kernel` owns the process table, the per-core records, the clock and
//! the collaborators. Core loops, the timer and every process thread hold an
//! `Arc` to it; nothing is reached through ambient globals.

use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use smp_api::{
    Channel, CpuId, Error, InterruptController, MemoryManager, Pid, ProcState, ResourceManager,
    Result, Tick, IRQ_TIMER,
};
use static_assertions::assert_impl_all;

use crate::config::KernelConfig;
use crate::cpu::Cpu;
use crate::fatal::{PanicSentinel, StopFlags};
use crate::process::context::Slot;
use crate::process::lifecycle::{Body, Origin};
use crate::process::table::ProcTable;
use crate::sched;
use crate::sync::spinlock::SpinMutex;
use crate::time::Clock;

/// External collaborators the kernel is booted with.
#[derive(Clone)]
pub struct Platform {
    pub memory: Arc<dyn MemoryManager>,
    pub resources: Arc<dyn ResourceManager>,
    pub interrupts: Arc<dyn InterruptController>,
}

impl Platform {
    pub fn new(
        memory: Arc<dyn MemoryManager>,
        resources: Arc<dyn ResourceManager>,
        interrupts: Arc<dyn InterruptController>,
    ) -> Self {
        Self {
            memory,
            resources,
            interrupts,
        }
    }
}

pub struct Kernel {
    pub(crate) config: KernelConfig,
    pub(crate) platform: Platform,
    /// Cores `0..ncpu`, then the interrupt context at index `ncpu`
    pub(crate) cpus: Box<[Cpu]>,
    pub(crate) ptable: SpinMutex<ProcTable>,
    pub(crate) slots: Box<[Slot]>,
    pub(crate) clock: Clock,
    pub(crate) stop: StopFlags,
    running: AtomicBool,
    /// Serializes host-side entry points that borrow the interrupt context
    irq_gate: spin::Mutex<()>,
    threads: spin::Mutex<Vec<JoinHandle<()>>>,
    root_pid: spin::Once<Pid>,
}

assert_impl_all!(Kernel: Send, Sync);

impl Kernel {
    /// Bring up a kernel: validate the configuration, enable the timer on every
    /// core, create the root process, then start the core loops and the timer.
    pub fn boot(config: KernelConfig, platform: Platform) -> Result<Arc<Kernel>> {
        config.validate()?;
        let ncpu = config.ncpu;
        let kernel = Arc::new(Kernel {
            cpus: (0..=ncpu).map(Cpu::new).collect(),
            ptable: SpinMutex::new("ptable", ProcTable::new(config.nproc, ncpu)),
            slots: (0..config.nproc).map(|_| Slot::new()).collect(),
            clock: Clock::new(),
            stop: StopFlags::new(),
            running: AtomicBool::new(true),
            irq_gate: spin::Mutex::new(()),
            threads: spin::Mutex::new(Vec::new()),
            root_pid: spin::Once::new(),
            config,
            platform,
        });

        for cpu in 0..ncpu {
            kernel.platform.interrupts.enable(IRQ_TIMER, cpu)?;
        }

        let root_name = kernel.config.root_name.clone();
        let root = kernel.with_irq(|irq| {
            kernel.create_process(irq, Origin::Init, &root_name, Box::new(crate::process::init_main))
        })?;
        kernel.root_pid.call_once(|| root);

        if let Err(err) = kernel.start_threads() {
            kernel.halt();
            return Err(err);
        }

        log::info!(
            "kernel booted: {} cpus, {} slots, root pid {}",
            ncpu,
            kernel.config.nproc,
            root
        );
        Ok(kernel)
    }

    fn start_threads(self: &Arc<Self>) -> Result<()> {
        for id in 0..self.config.ncpu {
            let core = self.clone();
            self.start_thread(format!("cpu{}", id), move || sched::run_cpu(core, id))?;
        }
        if let Some(interval) = self.config.tick_interval {
            let timer = self.clone();
            self.start_thread("timer".to_string(), move || {
                crate::time::run_timer(timer, interval)
            })?;
        }
        Ok(())
    }

    fn start_thread<F>(&self, name: String, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = std::thread::Builder::new()
            .name(name)
            .spawn(f)
            .map_err(|err| {
                log::warn!("thread spawn failed: {}", err);
                Error::ThreadSpawn
            })?;
        self.threads.lock().push(handle);
        Ok(())
    }

    /// Stop every core loop and the timer, and wait for them to finish.
    ///
    /// A core finishes once its running process switches back to it.
    /// Processes still blocked after that are abandoned where they stand.
    /// Must be called from outside the kernel's own threads.
    pub fn halt(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        for cpu in self.cpus.iter() {
            cpu.interrupt();
        }
        let threads = core::mem::take(&mut *self.threads.lock());
        for handle in threads {
            let _ = handle.join();
        }
        self.stop.mark_halted();
        log::info!("kernel halted at tick {}", self.clock.now());
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire) && !self.stop.panicked()
    }

    /// Has a fatal kernel error happened on any thread?
    pub fn has_panicked(&self) -> bool {
        self.stop.panicked()
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn ncpu(&self) -> usize {
        self.config.ncpu
    }

    pub fn cpu(&self, id: CpuId) -> &Cpu {
        &self.cpus[id]
    }

    pub fn root_pid(&self) -> Pid {
        self.root_pid.get().copied().unwrap_or(1)
    }

    pub(crate) fn sentinel(&self) -> PanicSentinel<'_> {
        PanicSentinel::new(&self.stop)
    }

    /// Run `f` on the interrupt context. Used by the timer and by host-side
    /// calls, which execute on no core of their own.
    pub(crate) fn with_irq<R>(&self, f: impl FnOnce(&Cpu) -> R) -> R {
        let _gate = self.irq_gate.lock();
        f(&self.cpus[self.config.ncpu])
    }

    /// Send an interrupt to every core named in `mask`.
    pub(crate) fn kick(&self, mask: u32) {
        for id in 0..self.config.ncpu {
            if mask & (1 << id) != 0 {
                self.cpus[id].interrupt();
            }
        }
    }

    /// Create a child of the root process from outside any process.
    pub fn spawn<F>(self: &Arc<Self>, name: &str, body: F) -> Result<Pid>
    where
        F: FnOnce(&crate::Proc) -> Result<()> + Send + 'static,
    {
        let body: Body = Box::new(body);
        self.with_irq(|irq| self.create_process(irq, Origin::Spawn, name, body))
    }

    pub fn kill(&self, pid: Pid) -> Result<()> {
        self.with_irq(|irq| {
            let mut table = self.ptable.lock(irq);
            table.kill(pid)?;
            let kicked = table.take_kicked();
            drop(table);
            self.kick(kicked);
            log::debug!("kill: pid {}", pid);
            Ok(())
        })
    }

    pub fn wakeup(&self, chan: Channel) {
        self.with_irq(|irq| self.wakeup_on(irq, chan));
    }

    pub(crate) fn wakeup_on(&self, cpu: &Cpu, chan: Channel) {
        let mut table = self.ptable.lock(cpu);
        let woken = table.wakeup(chan);
        let kicked = table.take_kicked();
        drop(table);
        if woken > 0 {
            log::trace!("wakeup {:?}: {} woken", chan, woken);
        }
        self.kick(kicked);
    }

    /// Ticks since boot
    pub fn ticks(&self) -> Tick {
        self.clock.now()
    }

    pub fn state_of(&self, pid: Pid) -> Option<ProcState> {
        self.with_irq(|irq| {
            let table = self.ptable.lock(irq);
            table.find(pid).map(|slot| table.entry(slot).state())
        })
    }

    pub fn priority_of(&self, pid: Pid) -> Option<i32> {
        self.with_irq(|irq| {
            let table = self.ptable.lock(irq);
            table.find(pid).map(|slot| table.entry(slot).priority())
        })
    }

    /// Run-queue contents of every core, as pids in queue order.
    pub fn run_queues(&self) -> Vec<Vec<Pid>> {
        self.with_irq(|irq| {
            let table = self.ptable.lock(irq);
            (0..self.config.ncpu).map(|cpu| table.queue_pids(cpu)).collect()
        })
    }

    /// Verify run-queue membership under the table lock.
    pub fn check_queues(&self) -> core::result::Result<(), String> {
        self.with_irq(|irq| self.ptable.lock(irq).check_queues())
    }

    /// Number of live slots
    pub fn live_processes(&self) -> usize {
        self.with_irq(|irq| {
            let table = self.ptable.lock(irq);
            table.entries().filter(|(_, entry)| entry.is_live()).count()
        })
    }
}
