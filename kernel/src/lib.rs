//! SMP Kernel Process Core
//!
//! Process table, per-core schedulers and blocking locks of a small
//! multi-core teaching kernel, hosted on OS threads.
//!
//! # Architecture
//!
//! - **Synchronization** (`sync`): instrumented spin locks, the priority lock,
//!   the reader-writer lock and the sleep lock
//! - **Process Management** (`process`): the process table, fork, exit, wait
//!   and kill
//! - **Scheduling** (`sched`): per-core loops, placement of new and woken
//!   processes, and the load balancer
//! - **Diagnostics** (`diag`): process listings, family reports, throughput
//!   windows and lock contention
//!
//! Each core is a thread running its scheduler loop; each process is a thread
//! that runs only while a core has switched to it. Even cores dispatch round
//! robin, odd cores first-come-first-served by creation tick.
//!
//! # Usage
//!
//! ```no_run
//! use smp_kernel::{Kernel, KernelConfig, Platform};
//!
//! let kernel = Kernel::boot(KernelConfig::default(), Platform::host()).unwrap();
//! let pid = kernel
//!     .spawn("worker", |proc| {
//!         let child = proc.fork(|_| Ok(()))?;
//!         assert_eq!(proc.wait()?, child);
//!         Ok(())
//!     })
//!     .unwrap();
//! # let _ = pid;
//! kernel.halt();
//! ```

pub mod config;
pub mod cpu;
pub mod diag;
mod fatal;
pub mod host;
mod kernel;
pub mod process;
pub mod sched;
pub mod sync;
pub mod time;

pub use crate::config::KernelConfig;
pub use crate::diag::{FamilyReport, ProcessInfo, ThroughputReport};
pub use crate::fatal::StopFlags;
pub use crate::kernel::{Kernel, Platform};
pub use crate::process::Proc;
pub use crate::sync::{PriorityLock, RwLock, Sleeplock};

pub use smp_api::{
    Channel, CpuId, Error, FileRef, Pid, ProcState, Result, SchedClass, Tick, TrapFrame,
};
