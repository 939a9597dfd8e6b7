//! Shared vocabulary of the SMP process core.
//!
//! This crate holds the types that cross the boundary between the process
//! core and the subsystems it leans on but does not implement: identifiers,
//! process states, wait channels, the error type, and the narrow contracts
//! for memory, open resources and device interrupts.
//!
//! # Modules
//!
//! - **types**: identifiers, process states, scheduling classes, channels
//! - **error**: the recoverable error type shared by every operation
//! - **memory**: kernel stacks and address spaces
//! - **resources**: open files and working directories
//! - **interrupt**: device interrupt enablement

#![no_std]

extern crate alloc;

pub mod error;
pub mod interrupt;
pub mod memory;
pub mod resources;
pub mod types;

pub use crate::error::{Error, Result};
pub use crate::interrupt::{InterruptController, Irq, IRQ_TIMER};
pub use crate::memory::{AddressSpace, KernelStack, MemoryManager};
pub use crate::resources::{DirRef, FileRef, ResourceManager};
pub use crate::types::*;
