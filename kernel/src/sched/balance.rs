//! Load balancer
//!
//! Run by even cores once per pass of their dispatch loop. A core whose queue
//! is at least `threshold` longer than the shortest odd queue moves its first
//! migratable process there. One victim per pass.

use smp_api::{CpuId, Pid};

use crate::process::table::ProcTable;

/// A single move made by the balancer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Migration {
    pub pid: Pid,
    pub from: CpuId,
    pub to: CpuId,
}

/// Odd core with the shortest queue; the lowest index wins ties.
pub fn least_loaded_odd(table: &ProcTable) -> Option<(CpuId, usize)> {
    let mut best: Option<(CpuId, usize)> = None;
    for cpu in (1..table.ncpu()).step_by(2) {
        let load = table.load(cpu);
        if best.is_none_or(|(_, min)| load < min) {
            best = Some((cpu, load));
        }
    }
    best
}

pub fn balance_load(table: &mut ProcTable, me: CpuId, threshold: usize) -> Option<Migration> {
    if me % 2 != 0 {
        return None;
    }
    let my_load = table.load(me);
    let (target, min_load) = least_loaded_odd(table)?;
    if my_load < min_load + threshold {
        return None;
    }
    let slot = table.take_migratable(me)?;
    table.push_back(target, slot);
    let migration = Migration {
        pid: table.entry(slot).pid(),
        from: me,
        to: target,
    };
    log::debug!(
        "balance: pid {} cpu {} -> cpu {} (load {} vs {})",
        migration.pid,
        me,
        target,
        my_load,
        min_load
    );
    Some(migration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::table::ProcFlags;
    use proptest::prelude::*;
    use smp_api::ProcState;

    fn fill(table: &mut ProcTable, cpu: CpuId, n: usize) -> Vec<usize> {
        (0..n)
            .map(|_| {
                let (slot, _) = table.allocate(0).unwrap();
                table.entry_mut(slot).state = ProcState::Runnable;
                table.push_back(cpu, slot);
                slot
            })
            .collect()
    }

    #[test]
    fn moves_one_victim_at_threshold() {
        let mut table = ProcTable::new(16, 4);
        let slots = fill(&mut table, 0, 3);
        let migration = balance_load(&mut table, 0, 3).unwrap();
        assert_eq!(migration.from, 0);
        assert_eq!(migration.to, 1);
        assert_eq!(migration.pid, table.entry(slots[0]).pid());
        assert_eq!(table.entry(slots[0]).cpu_id(), 1);
        assert_eq!(table.load(0), 2);
        assert_eq!(table.load(1), 1);
    }

    #[test]
    fn stays_put_below_threshold() {
        let mut table = ProcTable::new(16, 4);
        fill(&mut table, 0, 3);
        fill(&mut table, 1, 1);
        fill(&mut table, 3, 1);
        assert_eq!(balance_load(&mut table, 0, 3), None);
    }

    #[test]
    fn odd_cores_never_balance() {
        let mut table = ProcTable::new(16, 4);
        fill(&mut table, 1, 6);
        assert_eq!(balance_load(&mut table, 1, 3), None);
    }

    #[test]
    fn no_odd_core_no_move() {
        let mut table = ProcTable::new(16, 1);
        fill(&mut table, 0, 6);
        assert_eq!(balance_load(&mut table, 0, 3), None);
    }

    #[test]
    fn pinned_processes_stay() {
        let mut table = ProcTable::new(16, 2);
        let slots = fill(&mut table, 0, 4);
        table.entry_mut(slots[0]).flags.insert(ProcFlags::PINNED);
        table.entry_mut(slots[1]).flags.insert(ProcFlags::PINNED);
        let migration = balance_load(&mut table, 0, 3).unwrap();
        assert_eq!(migration.pid, table.entry(slots[2]).pid());

        let mut all_pinned = ProcTable::new(16, 2);
        for slot in fill(&mut all_pinned, 0, 4) {
            all_pinned.entry_mut(slot).flags.insert(ProcFlags::PINNED);
        }
        assert_eq!(balance_load(&mut all_pinned, 0, 3), None);
    }

    #[test]
    fn picks_lowest_odd_core_on_tie() {
        let mut table = ProcTable::new(16, 6);
        fill(&mut table, 1, 1);
        assert_eq!(least_loaded_odd(&table), Some((3, 0)));
    }

    proptest! {
        /// Repeated passes bring every even core within the threshold of the
        /// least loaded odd core.
        #[test]
        fn repeated_passes_converge(
            ncpu in 2usize..=8,
            loads in proptest::collection::vec(0usize..8, 8),
        ) {
            let mut table = ProcTable::new(64, ncpu);
            for cpu in (0..ncpu).step_by(2) {
                fill(&mut table, cpu, loads[cpu]);
            }
            for _ in 0..64 {
                for cpu in (0..ncpu).step_by(2) {
                    balance_load(&mut table, cpu, 3);
                }
            }
            let (_, min_odd) = least_loaded_odd(&table).unwrap();
            for cpu in (0..ncpu).step_by(2) {
                prop_assert!(table.load(cpu) < min_odd + 3);
            }
            prop_assert!(table.check_queues().is_ok());
        }
    }
}
