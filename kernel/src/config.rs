//! Kernel configuration

use core::time::Duration;

use smp_api::{Error, Result};
use static_assertions::const_assert;

/// Maximum number of cores a kernel can be booted with
pub const MAX_CPUS: usize = 8;

/// Process table capacity
pub const NPROC: usize = 64;

/// Open files per process
pub const NOFILE: usize = 16;

/// Bytes in one page of user memory
pub const PGSIZE: usize = 4096;

/// Longest process name kept in the table
pub const MAXNAME: usize = 16;

// Run-queue wake bits are kept in a u32.
const_assert!(MAX_CPUS < 32);
const_assert!(NPROC <= u16::MAX as usize);

/// Boot-time parameters. The core count is fixed for the kernel's lifetime.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Number of cores, `1..=MAX_CPUS`
    pub ncpu: usize,
    /// Usable process slots, `1..=NPROC`
    pub nproc: usize,
    /// Ticks a process may run on a round-robin core before it is asked to yield
    pub quantum_ticks: u64,
    /// Timer period; `None` leaves ticking to `Kernel::tick`
    pub tick_interval: Option<Duration>,
    /// Load difference at which an even core sheds a process to an odd core
    pub balance_threshold: usize,
    /// Name of the first process
    pub root_name: String,
    /// Process names the load balancer never moves
    pub pinned_names: Vec<String>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            ncpu: 4,
            nproc: NPROC,
            quantum_ticks: 1,
            tick_interval: Some(Duration::from_millis(1)),
            balance_threshold: 3,
            root_name: "init".to_string(),
            pinned_names: vec!["sh".to_string()],
        }
    }
}

impl KernelConfig {
    pub fn with_ncpu(mut self, ncpu: usize) -> Self {
        self.ncpu = ncpu;
        self
    }

    pub fn with_nproc(mut self, nproc: usize) -> Self {
        self.nproc = nproc;
        self
    }

    pub fn with_quantum(mut self, ticks: u64) -> Self {
        self.quantum_ticks = ticks;
        self
    }

    pub fn with_tick_interval(mut self, interval: Option<Duration>) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Manual ticking only; tests drive the clock through `Kernel::tick`.
    pub fn manual_clock(self) -> Self {
        self.with_tick_interval(None)
    }

    pub fn with_balance_threshold(mut self, threshold: usize) -> Self {
        self.balance_threshold = threshold;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.ncpu == 0 || self.ncpu > MAX_CPUS {
            return Err(Error::Config(format!(
                "ncpu must be in 1..={}, got {}",
                MAX_CPUS, self.ncpu
            )));
        }
        if self.nproc == 0 || self.nproc > NPROC {
            return Err(Error::Config(format!(
                "nproc must be in 1..={}, got {}",
                NPROC, self.nproc
            )));
        }
        if self.quantum_ticks == 0 {
            return Err(Error::Config("quantum_ticks must be at least 1".to_string()));
        }
        if self.balance_threshold == 0 {
            return Err(Error::Config("balance_threshold must be at least 1".to_string()));
        }
        if let Some(interval) = self.tick_interval {
            if interval.is_zero() {
                return Err(Error::Config("tick_interval must be non-zero".to_string()));
            }
        }
        if self.root_name.is_empty() || self.root_name.len() > MAXNAME {
            return Err(Error::Config(format!(
                "root_name must be 1..={} bytes",
                MAXNAME
            )));
        }
        Ok(())
    }

    pub fn is_pinned_name(&self, name: &str) -> bool {
        self.pinned_names.iter().any(|pinned| pinned == name)
    }
}
