//! Common test utilities for kernel integration tests

#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use smp_kernel::host::{HostInterrupts, HostMemory, HostResources};
use smp_kernel::{Kernel, KernelConfig, Platform};

/// Upper bound for any single scenario
pub const TIMEOUT: Duration = Duration::from_secs(10);

struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record<'_>) {
        if self.enabled(record.metadata()) {
            eprintln!("[{:<5}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;
static INIT: Once = Once::new();

/// Install a stderr logger once per test binary. `SMP_LOG=debug` and friends
/// raise the level.
pub fn init_logger() {
    INIT.call_once(|| {
        let level = match std::env::var("SMP_LOG").as_deref() {
            Ok("trace") => log::LevelFilter::Trace,
            Ok("debug") => log::LevelFilter::Debug,
            Ok("info") => log::LevelFilter::Info,
            _ => log::LevelFilter::Warn,
        };
        if log::set_logger(&LOGGER).is_ok() {
            log::set_max_level(level);
        }
    });
}

/// A booted kernel plus handles on its in-memory collaborators
pub struct TestKernel {
    pub kernel: Arc<Kernel>,
    pub memory: Arc<HostMemory>,
    pub resources: Arc<HostResources>,
    pub interrupts: Arc<HostInterrupts>,
}

impl Drop for TestKernel {
    fn drop(&mut self) {
        self.kernel.halt();
    }
}

pub fn boot(config: KernelConfig) -> TestKernel {
    init_logger();
    let memory = Arc::new(HostMemory::new());
    let resources = Arc::new(HostResources::new());
    let interrupts = Arc::new(HostInterrupts::new());
    let platform = Platform::new(memory.clone(), resources.clone(), interrupts.clone());
    let kernel = Kernel::boot(config, platform).expect("Failed to boot kernel");
    TestKernel {
        kernel,
        memory,
        resources,
        interrupts,
    }
}

pub fn boot_cores(ncpu: usize) -> TestKernel {
    boot(KernelConfig::default().with_ncpu(ncpu))
}

/// Poll `cond` until it holds or `TIMEOUT` passes.
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// Only the root process is left.
pub fn settled(kernel: &Kernel) -> bool {
    wait_until(|| kernel.live_processes() == 1)
}
