//! Diagnostics
//!
//! Read-only views over the process table and lock counters: the process
//! listing, family reports, throughput windows and contention scores.

use core::fmt;

use smp_api::{CpuId, Error, Pid, ProcState, Result, SchedClass, Tick};

use crate::kernel::Kernel;
use crate::process::table::{ProcEntry, ProcFlags, ProcTable};
use crate::process::Proc;

pub const INFO_HEADER: &str = "PID \t State \t \t Algo \t Life \t CPU";
pub const INFO_RULE: &str = "----------------------------------------------------";

/// One line of the process listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub name: String,
    pub state: ProcState,
    /// Inferred from the parity of the assigned core
    pub class: SchedClass,
    /// Ticks since creation
    pub lifetime: Tick,
    pub cpu: CpuId,
}

impl ProcessInfo {
    fn from_entry(entry: &ProcEntry, now: Tick) -> Self {
        Self {
            pid: entry.pid(),
            name: entry.name().to_string(),
            state: entry.state(),
            class: SchedClass::of(entry.cpu_id()),
            lifetime: now.saturating_sub(entry.ctime()),
            cpu: entry.cpu_id(),
        }
    }
}

impl fmt::Display for ProcessInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            ProcState::Running => "runing",
            other => other.label(),
        };
        write!(
            f,
            "{} \t {} \t {} \t {} \t {}",
            self.pid, state, self.class, self.lifetime, self.cpu
        )
    }
}

/// Parent, children and siblings of one process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FamilyReport {
    pub pid: Pid,
    pub parent: Option<Pid>,
    pub is_root: bool,
    pub children: Vec<Pid>,
    pub siblings: Vec<Pid>,
}

impl FamilyReport {
    pub(crate) fn build(table: &ProcTable, pid: Pid, root: Pid) -> Result<Self> {
        let slot = table.find(pid).ok_or(Error::NoSuchProcess(pid))?;
        let parent = table.entry(slot).parent();
        let children = table.children_of(pid).map(|(_, entry)| entry.pid()).collect();
        let siblings = match parent {
            Some(parent) => table
                .children_of(parent)
                .map(|(_, entry)| entry.pid())
                .filter(|&sibling| sibling != pid)
                .collect(),
            None => Vec::new(),
        };
        Ok(Self {
            pid,
            parent,
            is_root: pid == root,
            children,
            siblings,
        })
    }
}

impl fmt::Display for FamilyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root {
            writeln!(
                f,
                "My id: {}, My parent id: {} (This is the init process)",
                self.pid, self.pid
            )?;
        } else {
            let parent = self.parent.map_or(-1, i64::from);
            writeln!(f, "My id: {}, My parent id: {}", self.pid, parent)?;
        }

        writeln!(f, "Children of process {}:", self.pid)?;
        if self.children.is_empty() {
            writeln!(f, "(No children found)")?;
        }
        for child in &self.children {
            writeln!(f, "Child pid: {}", child)?;
        }

        writeln!(f, "Siblings of process {}:", self.pid)?;
        if self.siblings.is_empty() {
            writeln!(f, "(No siblings found)")?;
        }
        for sibling in &self.siblings {
            writeln!(f, "Sibling pid: {}", sibling)?;
        }
        Ok(())
    }
}

/// Children reaped per tick over one measurement window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThroughputReport {
    pub completed: u64,
    pub elapsed: Tick,
}

impl ThroughputReport {
    /// Throughput times 1000, truncated
    pub fn scaled(&self) -> u64 {
        self.completed * 1000 / self.elapsed
    }

    pub fn whole(&self) -> u64 {
        self.scaled() / 1000
    }

    /// Thousandths part, `0..1000`
    pub fn millis(&self) -> u64 {
        self.scaled() % 1000
    }
}

impl fmt::Display for ThroughputReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Throughput: {}.{:03} Processes/Tick",
            self.whole(),
            self.millis()
        )
    }
}

impl Kernel {
    /// Every live process, in table order.
    pub fn ps(&self) -> Vec<ProcessInfo> {
        let now = self.clock.now();
        self.with_irq(|irq| {
            let table = self.ptable.lock(irq);
            table
                .entries()
                .filter(|(_, entry)| entry.is_live())
                .map(|(_, entry)| ProcessInfo::from_entry(entry, now))
                .collect()
        })
    }

    /// procdump: one `pid state name` line per live slot.
    pub fn dump(&self) -> Vec<String> {
        self.with_irq(|irq| self.ptable.lock(irq).dump())
    }

    pub fn family(&self, pid: Pid) -> Result<FamilyReport> {
        let root = self.root_pid();
        self.with_irq(|irq| FamilyReport::build(&self.ptable.lock(irq), pid, root))
    }

    /// getlockstat for `tickslock`, one score per core
    pub fn tickslock_contention(&self) -> Vec<u64> {
        self.clock.lock_stats().contention_scores(self.config.ncpu)
    }

    pub fn ptable_contention(&self) -> Vec<u64> {
        self.ptable.raw().contention_scores(self.config.ncpu)
    }
}

impl Proc {
    pub fn process_info(&self) -> Result<ProcessInfo> {
        let now = self.kernel().clock.now();
        let info = {
            let table = self.kernel().ptable.lock(self.cpu());
            ProcessInfo::from_entry(table.entry(self.slot()), now)
        };
        self.trap_return(Ok(info))
    }

    pub fn family(&self, pid: Pid) -> Result<FamilyReport> {
        let root = self.kernel().root_pid();
        let report = FamilyReport::build(&self.kernel().ptable.lock(self.cpu()), pid, root);
        self.trap_return(report)
    }

    /// Open a throughput window; returns its start tick.
    pub fn start_throughput(&self) -> Result<Tick> {
        let now = self.kernel().clock.now();
        {
            let mut table = self.kernel().ptable.lock(self.cpu());
            let entry = table.entry_mut(self.slot());
            entry.start_ticks = now;
            entry.finished_count = 0;
            entry.flags.insert(ProcFlags::MEASURING);
        }
        log::info!("pid {}: throughput measurement started at tick {}", self.pid(), now);
        self.trap_return(Ok(now))
    }

    /// Close the window and report the children reaped during it.
    pub fn end_throughput(&self) -> Result<ThroughputReport> {
        let now = self.kernel().clock.now();
        let report = {
            let mut table = self.kernel().ptable.lock(self.cpu());
            let entry = table.entry_mut(self.slot());
            if !entry.flags.contains(ProcFlags::MEASURING) {
                Err(Error::ThroughputNotStarted)
            } else {
                entry.flags.remove(ProcFlags::MEASURING);
                match now.checked_sub(entry.start_ticks) {
                    Some(elapsed) if elapsed > 0 => Ok(ThroughputReport {
                        completed: entry.finished_count,
                        elapsed,
                    }),
                    _ => Err(Error::ZeroElapsed),
                }
            }
        };
        if let Ok(report) = &report {
            log::info!(
                "pid {}: {} completed in {} ticks, {}",
                self.pid(),
                report.completed,
                report.elapsed,
                report
            );
        }
        self.trap_return(report)
    }

    /// getlockstat: contention score of `tickslock` on each core
    pub fn lock_contention(&self) -> Result<Vec<u64>> {
        let scores = self.kernel().tickslock_contention();
        self.trap_return(Ok(scores))
    }
}
