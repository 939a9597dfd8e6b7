//! Fatal kernel errors
//!
//! A broken invariant stops the whole kernel. `kernel_panic!` logs the
//! message and panics; the workspace builds with `panic = "abort"`, so outside
//! of test builds that is the end of the host process. Every kernel-owned
//! thread carries a [`PanicSentinel`]; if a panic unwinds through one, every
//! core and process thread stops at its next scheduling point.

use core::sync::atomic::{AtomicBool, Ordering};

macro_rules! kernel_panic {
    ($($arg:tt)*) => {{
        log::error!("kernel panic: {}", format_args!($($arg)*));
        panic!($($arg)*)
    }};
}

pub(crate) use kernel_panic;

/// Stop flags shared by every thread of one kernel instance.
#[derive(Debug, Default)]
pub struct StopFlags {
    panicked: AtomicBool,
    halted: AtomicBool,
}

impl StopFlags {
    pub const fn new() -> Self {
        Self {
            panicked: AtomicBool::new(false),
            halted: AtomicBool::new(false),
        }
    }

    pub fn panicked(&self) -> bool {
        self.panicked.load(Ordering::Acquire)
    }

    /// Set once no thread may be dispatched again, by a panic or a finished halt.
    pub fn halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    pub(crate) fn panicked_flag(&self) -> &AtomicBool {
        &self.panicked
    }

    pub(crate) fn halted_flag(&self) -> &AtomicBool {
        &self.halted
    }

    pub(crate) fn mark_halted(&self) {
        self.halted.store(true, Ordering::Release);
    }

    fn mark_panicked(&self) {
        self.panicked.store(true, Ordering::Release);
        self.halted.store(true, Ordering::Release);
    }
}

/// Marks the kernel panicked if the owning thread unwinds.
pub(crate) struct PanicSentinel<'a> {
    flags: &'a StopFlags,
}

impl<'a> PanicSentinel<'a> {
    pub(crate) fn new(flags: &'a StopFlags) -> Self {
        Self { flags }
    }
}

impl Drop for PanicSentinel<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.flags.mark_panicked();
        }
    }
}

/// Parks the calling thread for good. Used by threads whose kernel has stopped
/// while they were suspended, and by processes after their final switch.
pub(crate) fn park_forever() -> ! {
    loop {
        std::thread::park();
    }
}
