//! Placement of newly created processes

use smp_api::CpuId;

use crate::process::table::ProcTable;

/// Even core with the shortest run queue; the lowest index wins ties.
pub fn least_loaded_even(table: &ProcTable) -> CpuId {
    let mut best = 0;
    let mut best_load = usize::MAX;
    for cpu in (0..table.ncpu()).step_by(2) {
        let load = table.load(cpu);
        if load < best_load {
            best = cpu;
            best_load = load;
        }
    }
    best
}
