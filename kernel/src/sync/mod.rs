//! Synchronization primitives
//!
//! The instrumented spin lock guards short critical sections. The blocking
//! locks are built from a spin lock plus the process sleep/wakeup channel.

pub mod plock;
pub mod rwlock;
pub mod sleeplock;
pub mod spinlock;

pub use plock::PriorityLock;
pub use rwlock::RwLock;
pub use sleeplock::Sleeplock;
pub use spinlock::{LockStats, SpinGuard, SpinLock, SpinMutex};
