//! Process table
//!
//! A fixed arena of process entries indexed by slot. Each core's run queue is
//! a singly linked list threaded through the entries by slot index, so a
//! process is on at most one queue by construction of its single `next` link.
//! Everything here is protected by the table lock.

use core::fmt::Write as _;

use bitflags::bitflags;
use smp_api::{Channel, CpuId, Error, Pid, ProcState, Result, Tick};

use crate::config::{MAXNAME, MAX_CPUS};
use crate::fatal::kernel_panic;

/// Fixed-capacity process name
pub type ProcName = heapless::String<MAXNAME>;

bitflags! {
    /// Process flags kept in the table
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ProcFlags: u8 {
        /// Must exit at its next return to user mode
        const KILLED = 1 << 0;
        /// Never chosen as a load-balancing victim
        const PINNED = 1 << 1;
        /// A throughput window is open
        const MEASURING = 1 << 2;
    }
}

/// `name` cut to the longest prefix that fits
pub fn proc_name(name: &str) -> ProcName {
    let mut out = ProcName::new();
    for ch in name.chars() {
        if out.push(ch).is_err() {
            break;
        }
    }
    out
}

/// Table entry for one process slot
#[derive(Debug, Clone, Default)]
pub struct ProcEntry {
    pub(crate) pid: Pid,
    pub(crate) state: ProcState,
    pub(crate) parent: Option<Pid>,
    pub(crate) name: ProcName,
    pub(crate) priority: i32,
    /// Tick at which the slot was allocated
    pub(crate) ctime: Tick,
    /// Ticks consumed since last dispatch
    pub(crate) ticks_consumed: u64,
    /// Valid only while SLEEPING
    pub(crate) chan: Option<Channel>,
    /// Core the process last ran on or was last queued for
    pub(crate) cpu_id: CpuId,
    pub(crate) flags: ProcFlags,
    /// Run-queue link
    pub(crate) next: Option<usize>,
    pub(crate) queued_on: Option<CpuId>,
    /// Children reaped while measuring throughput
    pub(crate) finished_count: u64,
    pub(crate) start_ticks: Tick,
}

impl ProcEntry {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn state(&self) -> ProcState {
        self.state
    }

    pub fn parent(&self) -> Option<Pid> {
        self.parent
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn ctime(&self) -> Tick {
        self.ctime
    }

    pub fn cpu_id(&self) -> CpuId {
        self.cpu_id
    }

    pub fn flags(&self) -> ProcFlags {
        self.flags
    }

    pub fn queued_on(&self) -> Option<CpuId> {
        self.queued_on
    }

    pub fn is_live(&self) -> bool {
        self.state != ProcState::Unused
    }

    /// Raw state change. Queue membership is the caller's to keep consistent.
    pub fn set_state(&mut self, state: ProcState) {
        self.state = state;
    }

    pub(crate) fn set_name(&mut self, name: &str) {
        self.name = proc_name(name);
    }
}

/// Head, tail and length of one core's run queue
#[derive(Debug, Clone, Copy, Default)]
struct RunQueue {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

pub struct ProcTable {
    procs: Vec<ProcEntry>,
    queues: heapless::Vec<RunQueue, MAX_CPUS>,
    next_pid: Pid,
    /// Cores that gained work since the last `take_kicked`
    kicked: u32,
}

impl ProcTable {
    pub fn new(nproc: usize, ncpu: usize) -> Self {
        let mut queues = heapless::Vec::new();
        for _ in 0..ncpu.min(MAX_CPUS) {
            let _ = queues.push(RunQueue::default());
        }
        Self {
            procs: vec![ProcEntry::default(); nproc],
            queues,
            next_pid: 1,
            kicked: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.procs.len()
    }

    pub fn ncpu(&self) -> usize {
        self.queues.len()
    }

    /// Claim an UNUSED slot: fresh pid, reset counters, EMBRYO.
    pub fn allocate(&mut self, now: Tick) -> Result<(usize, Pid)> {
        let slot = self
            .procs
            .iter()
            .position(|entry| entry.state == ProcState::Unused)
            .ok_or(Error::NoFreeProc)?;
        let pid = self.next_pid;
        self.next_pid += 1;
        self.procs[slot] = ProcEntry {
            pid,
            state: ProcState::Embryo,
            priority: 1,
            ctime: now,
            ..ProcEntry::default()
        };
        Ok((slot, pid))
    }

    /// Return a slot to UNUSED, clearing its identity.
    pub fn free(&mut self, slot: usize) {
        if self.procs[slot].queued_on.is_some() {
            kernel_panic!("free: pid {} still queued", self.procs[slot].pid);
        }
        self.procs[slot] = ProcEntry::default();
    }

    pub fn entry(&self, slot: usize) -> &ProcEntry {
        &self.procs[slot]
    }

    pub fn entry_mut(&mut self, slot: usize) -> &mut ProcEntry {
        &mut self.procs[slot]
    }

    pub fn find(&self, pid: Pid) -> Option<usize> {
        self.procs
            .iter()
            .position(|entry| entry.pid == pid && entry.is_live())
    }

    pub fn entries(&self) -> impl Iterator<Item = (usize, &ProcEntry)> {
        self.procs.iter().enumerate()
    }

    /// Live direct children of `pid`, in table order.
    pub fn children_of(&self, pid: Pid) -> impl Iterator<Item = (usize, &ProcEntry)> {
        self.entries()
            .filter(move |(_, entry)| entry.is_live() && entry.parent == Some(pid))
    }

    pub fn load(&self, cpu: CpuId) -> usize {
        self.queues[cpu].len
    }

    /// Append a RUNNABLE process to the tail of `cpu`'s queue and make that its core.
    pub fn push_back(&mut self, cpu: CpuId, slot: usize) {
        let entry = &mut self.procs[slot];
        if entry.state != ProcState::Runnable {
            kernel_panic!("push_back: pid {} not runnable ({:?})", entry.pid, entry.state);
        }
        if let Some(other) = entry.queued_on {
            kernel_panic!("push_back: pid {} already queued on cpu {}", entry.pid, other);
        }
        entry.next = None;
        entry.queued_on = Some(cpu);
        entry.cpu_id = cpu;

        let queue = &mut self.queues[cpu];
        match queue.tail {
            Some(tail) => self.procs[tail].next = Some(slot),
            None => queue.head = Some(slot),
        }
        queue.tail = Some(slot);
        queue.len += 1;
        self.kicked |= 1 << cpu;
    }

    /// Remove the head of `cpu`'s queue.
    pub fn pop_front(&mut self, cpu: CpuId) -> Option<usize> {
        let head = self.queues[cpu].head?;
        self.unlink(cpu, head, None);
        Some(head)
    }

    /// Remove the entry with the smallest creation tick; ties go to the earlier
    /// queue position.
    pub fn take_earliest(&mut self, cpu: CpuId) -> Option<usize> {
        let mut best: Option<(usize, Option<usize>)> = None;
        let mut prev = None;
        let mut cursor = self.queues[cpu].head;
        while let Some(slot) = cursor {
            let better = match best {
                None => true,
                Some((min, _)) => self.procs[slot].ctime < self.procs[min].ctime,
            };
            if better {
                best = Some((slot, prev));
            }
            prev = Some(slot);
            cursor = self.procs[slot].next;
        }
        let (slot, prev) = best?;
        self.unlink(cpu, slot, prev);
        Some(slot)
    }

    /// Remove the first entry the load balancer may move.
    pub fn take_migratable(&mut self, cpu: CpuId) -> Option<usize> {
        let mut prev = None;
        let mut cursor = self.queues[cpu].head;
        while let Some(slot) = cursor {
            if !self.procs[slot].flags.contains(ProcFlags::PINNED) {
                self.unlink(cpu, slot, prev);
                return Some(slot);
            }
            prev = Some(slot);
            cursor = self.procs[slot].next;
        }
        None
    }

    fn unlink(&mut self, cpu: CpuId, slot: usize, prev: Option<usize>) {
        let next = self.procs[slot].next.take();
        let queue = &mut self.queues[cpu];
        match prev {
            Some(prev) => self.procs[prev].next = next,
            None => queue.head = next,
        }
        if queue.tail == Some(slot) {
            queue.tail = prev;
        }
        queue.len -= 1;
        self.procs[slot].queued_on = None;
    }

    /// Queue order of `cpu`, as slots.
    pub fn queue_slots(&self, cpu: CpuId) -> Vec<usize> {
        let mut slots = Vec::with_capacity(self.queues[cpu].len);
        let mut cursor = self.queues[cpu].head;
        while let Some(slot) = cursor {
            slots.push(slot);
            cursor = self.procs[slot].next;
        }
        slots
    }

    pub fn queue_pids(&self, cpu: CpuId) -> Vec<Pid> {
        self.queue_slots(cpu)
            .into_iter()
            .map(|slot| self.procs[slot].pid)
            .collect()
    }

    /// Wake every process sleeping on `chan`. A woken process is queued on the
    /// core `pid % ncpu`.
    pub fn wakeup(&mut self, chan: Channel) -> usize {
        let ncpu = self.ncpu();
        let mut woken = 0;
        for slot in 0..self.procs.len() {
            let entry = &mut self.procs[slot];
            if entry.state == ProcState::Sleeping && entry.chan == Some(chan) {
                entry.state = ProcState::Runnable;
                let target = entry.pid as usize % ncpu;
                self.push_back(target, slot);
                woken += 1;
            }
        }
        woken
    }

    /// Mark `pid` killed; a sleeping target is made runnable on `pid % ncpu`.
    pub fn kill(&mut self, pid: Pid) -> Result<()> {
        let slot = self.find(pid).ok_or(Error::NoSuchProcess(pid))?;
        let ncpu = self.ncpu();
        let entry = &mut self.procs[slot];
        entry.flags.insert(ProcFlags::KILLED);
        if entry.state == ProcState::Sleeping {
            entry.state = ProcState::Runnable;
            self.push_back(pid as usize % ncpu, slot);
        }
        Ok(())
    }

    pub(crate) fn take_kicked(&mut self) -> u32 {
        core::mem::take(&mut self.kicked)
    }

    /// Verify run-queue membership: every queued entry is RUNNABLE, appears
    /// exactly once, and agrees with its `queued_on` field; every RUNNABLE
    /// entry is queued somewhere.
    pub fn check_queues(&self) -> core::result::Result<(), String> {
        let mut seen = vec![0usize; self.procs.len()];
        for cpu in 0..self.ncpu() {
            let slots = self.queue_slots(cpu);
            if slots.len() != self.queues[cpu].len {
                return Err(format!(
                    "cpu {}: length {} but {} linked",
                    cpu,
                    self.queues[cpu].len,
                    slots.len()
                ));
            }
            for slot in slots {
                let entry = &self.procs[slot];
                seen[slot] += 1;
                if seen[slot] > 1 {
                    return Err(format!("pid {} queued twice", entry.pid));
                }
                if entry.state != ProcState::Runnable {
                    return Err(format!("pid {} queued while {:?}", entry.pid, entry.state));
                }
                if entry.queued_on != Some(cpu) {
                    return Err(format!(
                        "pid {} on cpu {} but tagged {:?}",
                        entry.pid, cpu, entry.queued_on
                    ));
                }
            }
        }
        for (slot, entry) in self.entries() {
            if entry.state == ProcState::Runnable && seen[slot] == 0 {
                return Err(format!("pid {} runnable but not queued", entry.pid));
            }
        }
        Ok(())
    }

    /// One `pid state name` line per live slot.
    pub fn dump(&self) -> Vec<String> {
        self.entries()
            .filter(|(_, entry)| entry.is_live())
            .map(|(_, entry)| {
                let mut line = String::new();
                let _ = write!(line, "{} {} {}", entry.pid, entry.state, entry.name);
                line
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn runnable(table: &mut ProcTable, now: Tick) -> usize {
        let (slot, _) = table.allocate(now).unwrap();
        table.entry_mut(slot).state = ProcState::Runnable;
        slot
    }

    #[test]
    fn allocate_assigns_monotonic_pids() {
        let mut table = ProcTable::new(4, 2);
        let (a, pid_a) = table.allocate(0).unwrap();
        let (_, pid_b) = table.allocate(0).unwrap();
        assert_eq!((pid_a, pid_b), (1, 2));
        assert_eq!(table.entry(a).state(), ProcState::Embryo);
        assert_eq!(table.entry(a).priority(), 1);
        table.free(a);
        let (reused, pid_c) = table.allocate(5).unwrap();
        assert_eq!(reused, a);
        assert_eq!(pid_c, 3);
        assert_eq!(table.entry(reused).ctime(), 5);
    }

    #[test]
    fn allocate_fails_when_full() {
        let mut table = ProcTable::new(2, 1);
        table.allocate(0).unwrap();
        table.allocate(0).unwrap();
        assert_eq!(table.allocate(0), Err(Error::NoFreeProc));
    }

    #[test]
    fn fifo_order_on_round_robin_queue() {
        let mut table = ProcTable::new(8, 2);
        let slots: Vec<_> = (0..3).map(|t| runnable(&mut table, t)).collect();
        for &slot in &slots {
            table.push_back(0, slot);
        }
        assert_eq!(table.load(0), 3);
        assert_eq!(table.pop_front(0), Some(slots[0]));
        assert_eq!(table.pop_front(0), Some(slots[1]));
        assert_eq!(table.pop_front(0), Some(slots[2]));
        assert_eq!(table.pop_front(0), None);
    }

    #[test]
    fn earliest_ctime_leaves_from_the_middle() {
        let mut table = ProcTable::new(8, 2);
        let late = runnable(&mut table, 9);
        let early = runnable(&mut table, 2);
        let tie = runnable(&mut table, 2);
        for slot in [late, early, tie] {
            table.push_back(1, slot);
        }
        assert_eq!(table.take_earliest(1), Some(early));
        assert_eq!(table.take_earliest(1), Some(tie));
        assert_eq!(table.queue_slots(1), vec![late]);
        assert!(table.check_queues().is_err());
    }

    #[test]
    fn migratable_skips_pinned() {
        let mut table = ProcTable::new(8, 2);
        let pinned = runnable(&mut table, 0);
        table.entry_mut(pinned).flags.insert(ProcFlags::PINNED);
        let free = runnable(&mut table, 0);
        table.push_back(0, pinned);
        table.push_back(0, free);
        assert_eq!(table.take_migratable(0), Some(free));
        assert_eq!(table.take_migratable(0), None);
        assert_eq!(table.queue_slots(0), vec![pinned]);
        assert!(table.check_queues().is_ok());
    }

    #[test]
    fn wakeup_targets_pid_modulo_ncpu() {
        let mut table = ProcTable::new(8, 4);
        let chan = Channel::raw(0x40, 0);
        let mut slots = Vec::new();
        for _ in 0..3 {
            let (slot, _) = table.allocate(0).unwrap();
            let entry = table.entry_mut(slot);
            entry.state = ProcState::Sleeping;
            entry.chan = Some(chan);
            slots.push(slot);
        }
        table.entry_mut(slots[2]).chan = Some(Channel::raw(0x80, 0));
        assert_eq!(table.wakeup(chan), 2);
        assert_eq!(table.queue_pids(1), vec![1]);
        assert_eq!(table.queue_pids(2), vec![2]);
        assert_eq!(table.entry(slots[0]).cpu_id(), 1);
        assert_eq!(table.entry(slots[2]).state(), ProcState::Sleeping);
        assert_eq!(table.take_kicked(), 0b110);
        assert!(table.check_queues().is_ok());
    }

    #[test]
    fn kill_wakes_sleeper_and_flags_runner() {
        let mut table = ProcTable::new(8, 2);
        let (sleeper, pid) = table.allocate(0).unwrap();
        table.entry_mut(sleeper).state = ProcState::Sleeping;
        let (runner, runner_pid) = table.allocate(0).unwrap();
        table.entry_mut(runner).state = ProcState::Running;
        table.kill(pid).unwrap();
        table.kill(runner_pid).unwrap();
        assert_eq!(table.entry(sleeper).state(), ProcState::Runnable);
        assert_eq!(table.entry(sleeper).queued_on(), Some(pid as usize % 2));
        assert_eq!(table.entry(runner).state(), ProcState::Running);
        assert!(table.entry(runner).flags().contains(ProcFlags::KILLED));
        assert_eq!(table.kill(42), Err(Error::NoSuchProcess(42)));
    }

    #[test]
    fn names_are_truncated() {
        let mut entry = ProcEntry::default();
        entry.set_name("a-very-long-process-name");
        assert_eq!(entry.name().len(), MAXNAME);
    }

    #[test]
    #[should_panic(expected = "not runnable")]
    fn queueing_a_sleeper_is_fatal() {
        let mut table = ProcTable::new(2, 1);
        let (slot, _) = table.allocate(0).unwrap();
        table.entry_mut(slot).state = ProcState::Sleeping;
        table.push_back(0, slot);
    }

    #[test]
    #[should_panic(expected = "already queued")]
    fn double_queueing_is_fatal() {
        let mut table = ProcTable::new(2, 2);
        let slot = runnable(&mut table, 0);
        table.push_back(0, slot);
        table.push_back(1, slot);
    }

    #[derive(Debug, Clone)]
    enum Step {
        Alloc(u8),
        Enqueue(usize, usize),
        Pop(usize),
        Earliest(usize),
        Migrate(usize, usize),
        Sleep(usize),
        Wake(u8),
        Free(usize),
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            any::<u8>().prop_map(Step::Alloc),
            (0..16usize, 0..4usize).prop_map(|(s, c)| Step::Enqueue(s, c)),
            (0..4usize).prop_map(Step::Pop),
            (0..4usize).prop_map(Step::Earliest),
            (0..4usize, 0..4usize).prop_map(|(a, b)| Step::Migrate(a, b)),
            (0..16usize).prop_map(Step::Sleep),
            (0..3u8).prop_map(Step::Wake),
            (0..16usize).prop_map(Step::Free),
        ]
    }

    proptest! {
        /// Random transitions never put a process on two queues or queue a
        /// non-runnable one.
        #[test]
        fn queue_membership_holds(steps in proptest::collection::vec(step(), 1..200)) {
            let mut table = ProcTable::new(16, 4);
            for step in steps {
                match step {
                    Step::Alloc(t) => {
                        if let Ok((slot, _)) = table.allocate(t as Tick) {
                            table.entry_mut(slot).state = ProcState::Runnable;
                            table.push_back(0, slot);
                        }
                    }
                    Step::Enqueue(slot, cpu) => {
                        let entry = table.entry(slot);
                        if entry.state == ProcState::Runnable && entry.queued_on.is_none() {
                            table.push_back(cpu, slot);
                        }
                    }
                    Step::Pop(cpu) => {
                        if let Some(slot) = table.pop_front(cpu) {
                            table.entry_mut(slot).state = ProcState::Running;
                        }
                    }
                    Step::Earliest(cpu) => {
                        if let Some(slot) = table.take_earliest(cpu) {
                            table.entry_mut(slot).state = ProcState::Running;
                        }
                    }
                    Step::Migrate(from, to) => {
                        if let Some(slot) = table.take_migratable(from) {
                            table.push_back(to, slot);
                        }
                    }
                    Step::Sleep(slot) => {
                        let entry = table.entry_mut(slot);
                        if entry.state == ProcState::Running {
                            entry.state = ProcState::Sleeping;
                            entry.chan = Some(Channel::raw(slot % 3, 0));
                        }
                    }
                    Step::Wake(chan) => {
                        table.wakeup(Channel::raw(chan as usize, 0));
                    }
                    Step::Free(slot) => {
                        if table.entry(slot).state == ProcState::Running {
                            table.free(slot);
                        }
                    }
                }
                prop_assert!(table.check_queues().is_ok(), "{:?}", table.check_queues());
            }
        }

        /// An FCFS queue hands out entries in creation-tick order.
        #[test]
        fn earliest_drains_in_ctime_order(ticks in proptest::collection::vec(0u64..50, 1..16)) {
            let mut table = ProcTable::new(16, 2);
            for &t in &ticks {
                let slot = runnable(&mut table, t);
                table.push_back(1, slot);
            }
            let mut drained = Vec::new();
            while let Some(slot) = table.take_earliest(1) {
                drained.push(table.entry(slot).ctime());
            }
            let mut sorted = ticks.clone();
            sorted.sort();
            prop_assert_eq!(drained, sorted);
        }

        /// Requeueing at the tail gives each of N spinners one dispatch in
        /// every window of N.
        #[test]
        fn round_robin_serves_every_spinner(n in 1usize..16, rounds in 1usize..8) {
            let mut table = ProcTable::new(16, 2);
            for t in 0..n {
                let slot = runnable(&mut table, t as Tick);
                table.push_back(0, slot);
            }
            let mut order = Vec::new();
            for _ in 0..n * rounds {
                let slot = table.pop_front(0).unwrap();
                order.push(slot);
                table.push_back(0, slot);
            }
            for window in order.windows(n) {
                let mut seen = window.to_vec();
                seen.sort();
                seen.dedup();
                prop_assert_eq!(seen.len(), n);
            }
        }
    }
}
