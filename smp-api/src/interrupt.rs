//! Device interrupt contract

use crate::error::Result;
use crate::types::CpuId;

/// Device interrupt line
pub type Irq = u32;

/// The timer line that drives ticks and quantum preemption
pub const IRQ_TIMER: Irq = 0;

/// Trait for the interrupt controller
pub trait InterruptController: Send + Sync {
    /// Routes `irq` to `cpu` and unmasks it
    fn enable(&self, irq: Irq, cpu: CpuId) -> Result<()>;
}
