//! Process management
//!
//! The table of process entries, the lifecycle operations built on it, and
//! the handle a running process uses to make system calls.

pub(crate) mod context;
pub mod lifecycle;
pub mod proc;
pub mod table;

pub use lifecycle::Body;
pub(crate) use lifecycle::init_main;
pub use proc::Proc;
pub use table::{ProcEntry, ProcFlags, ProcName, ProcTable};
