//! Process creation, exit and reaping

use std::sync::Arc;

use smp_api::{Channel, Error, Pid, ProcState, Result, TrapFrame};

use crate::config::PGSIZE;
use crate::cpu::Cpu;
use crate::fatal::{kernel_panic, park_forever};
use crate::kernel::Kernel;
use crate::process::context::ProcData;
use crate::process::proc::Proc;
use crate::process::table::{proc_name, ProcFlags, ProcTable};
use crate::sched::placement::least_loaded_even;
use crate::sync::spinlock::SpinGuard;

/// Code a process runs. Returning ends the process.
pub type Body = Box<dyn FnOnce(&Proc) -> Result<()> + Send + 'static>;

/// Where a new process comes from
#[derive(Debug, Clone, Copy)]
pub(crate) enum Origin {
    /// The first process
    Init,
    /// Created from outside any process, as a child of the root
    Spawn,
    /// Copy of a running process
    Fork { slot: usize, pid: Pid },
}

impl Kernel {
    /// Allocate, set up and enqueue a new process.
    ///
    /// Nothing becomes visible to a scheduler until the last step; a failure
    /// before it undoes every allocation and frees the slot.
    pub(crate) fn create_process(
        self: &Arc<Self>,
        cpu: &Cpu,
        origin: Origin,
        name: &str,
        body: Body,
    ) -> Result<Pid> {
        let (slot, pid) = {
            let mut table = self.ptable.lock(cpu);
            match table.allocate(self.clock.now()) {
                Ok(claimed) => claimed,
                Err(err) => {
                    drop(table);
                    log::warn!("create {}: no free process slot", name);
                    return Err(err);
                }
            }
        };

        let data = match self.build_data(origin) {
            Ok(data) => data,
            Err(err) => {
                log::warn!("create {}: setup failed: {}", name, err);
                self.ptable.lock(cpu).free(slot);
                return Err(err);
            }
        };
        *self.slots[slot].data.lock() = data;

        let kernel = self.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("pid{}", pid))
            .spawn(move || process_main(kernel, slot, pid, body));
        if let Err(err) = spawned {
            log::warn!("create {}: thread spawn failed: {}", name, err);
            let data = core::mem::take(&mut *self.slots[slot].data.lock());
            self.release_data(data);
            self.ptable.lock(cpu).free(slot);
            return Err(Error::ThreadSpawn);
        }

        let root = self.root_pid();
        let mut table = self.ptable.lock(cpu);
        let parent = match origin {
            Origin::Init => None,
            Origin::Spawn => Some(root),
            Origin::Fork { pid: parent_pid, .. } => Some(parent_pid),
        };
        // fork copies the parent's name
        let proc_name = match origin {
            Origin::Fork { slot: parent_slot, .. } => table.entry(parent_slot).name.clone(),
            Origin::Init | Origin::Spawn => proc_name(name),
        };
        let entry = table.entry_mut(slot);
        entry.parent = parent;
        entry.name = proc_name;
        let pinned = matches!(origin, Origin::Init) || self.config.is_pinned_name(entry.name());
        entry.flags.set(ProcFlags::PINNED, pinned);
        entry.state = ProcState::Runnable;
        let target = least_loaded_even(&table);
        table.push_back(target, slot);
        let kicked = table.take_kicked();
        drop(table);
        self.kick(kicked);

        log::debug!("create: pid {} parent {:?} on cpu {}", pid, parent, target);
        Ok(pid)
    }

    /// Kernel stack, address space, open files and working directory of a new
    /// process. The caller's own data is read, never moved.
    fn build_data(&self, origin: Origin) -> Result<ProcData> {
        let memory = &self.platform.memory;
        let resources = &self.platform.resources;

        let kstack = memory.alloc_kstack()?;
        let mut data = ProcData {
            kstack: Some(kstack),
            ..ProcData::default()
        };

        let copied = match origin {
            Origin::Fork { slot, .. } => {
                let parent = self.slots[slot].data.lock();
                let space = parent
                    .space
                    .as_ref()
                    .ok_or(Error::SpaceDuplication)
                    .and_then(|space| memory.duplicate_space(space, parent.sz));
                space.map(|space| {
                    data.space = Some(space);
                    data.sz = parent.sz;
                    // The child returns zero from fork.
                    data.tf = TrapFrame { ret: 0, ..parent.tf };
                    for (fd, file) in parent.files.iter().enumerate() {
                        data.files[fd] = file.as_ref().map(|file| resources.dup_file(file));
                    }
                    data.cwd = parent.cwd.as_ref().map(|dir| resources.dup_dir(dir));
                })
            }
            Origin::Init | Origin::Spawn => memory.setup_space(PGSIZE).and_then(|space| {
                data.space = Some(space);
                data.sz = PGSIZE;
                resources.root_dir().map(|dir| data.cwd = Some(dir))
            }),
        };

        match copied {
            Ok(()) => Ok(data),
            Err(err) => {
                self.release_data(data);
                Err(err)
            }
        }
    }

    /// Hand everything in `data` back to its collaborator.
    pub(crate) fn release_data(&self, mut data: ProcData) {
        for file in data.files.iter_mut() {
            if let Some(file) = file.take() {
                self.platform.resources.close_file(file);
            }
        }
        if let Some(dir) = data.cwd.take() {
            self.platform.resources.release_dir(dir);
        }
        if let Some(space) = data.space.take() {
            self.platform.memory.free_space(space);
        }
        if let Some(stack) = data.kstack.take() {
            self.platform.memory.free_kstack(stack);
        }
    }
}

/// Top of every process thread.
fn process_main(kernel: Arc<Kernel>, slot: usize, pid: Pid, body: Body) {
    let _sentinel = kernel.sentinel();
    let Some(cpu) = kernel.slots[slot].baton.take(kernel.stop.halted_flag()) else {
        return;
    };
    let proc = Proc::new(kernel.clone(), slot, pid, cpu);
    proc.forkret();

    match body(&proc) {
        Ok(()) => log::debug!("pid {}: finished", pid),
        Err(err) => log::debug!("pid {}: finished with {}", pid, err),
    }
    proc.exit_to_zombie();
}

/// Body of the root process: reap orphans forever.
pub(crate) fn init_main(proc: &Proc) -> Result<()> {
    loop {
        match proc.wait() {
            Ok(pid) => log::trace!("init: reaped pid {}", pid),
            Err(Error::NoChildren) => proc.await_children(),
            Err(err) => return Err(err),
        }
    }
}

impl Proc {
    /// First return after the scheduler switched in: drop the table lock the
    /// scheduler took.
    pub(crate) fn forkret(&self) {
        let cpu = self.cpu();
        // Safety: the scheduler of `cpu` locked the table and gave up its guard.
        let table = unsafe { self.kernel().ptable.resume(cpu) };
        drop(table);
    }

    /// Terminate the calling process. Never returns.
    pub fn exit(&self) -> ! {
        self.exit_to_zombie();
        park_forever()
    }

    /// Release resources, wake the parent, hand children to the root, become
    /// ZOMBIE and give up the core for the last time.
    pub(crate) fn exit_to_zombie(&self) {
        let kernel = self.kernel();
        let root = kernel.root_pid();
        if self.pid() == root {
            kernel_panic!("init exiting");
        }

        {
            let mut data = kernel.slots[self.slot()].data.lock();
            for file in data.files.iter_mut() {
                if let Some(file) = file.take() {
                    kernel.platform.resources.close_file(file);
                }
            }
            if let Some(dir) = data.cwd.take() {
                kernel.platform.resources.release_dir(dir);
            }
        }

        let mut table = kernel.ptable.lock(self.cpu());
        // Parent might be sleeping in wait().
        if let Some(parent) = table.entry(self.slot()).parent() {
            table.wakeup(Channel::process(parent));
        }
        let orphans = reparent_children(&mut table, self.pid(), root);
        if orphans.zombies > 0 {
            table.wakeup(Channel::process(root));
        }
        table.entry_mut(self.slot()).state = ProcState::Zombie;
        let kicked = table.take_kicked();
        kernel.kick(kicked);
        log::debug!(
            "exit: pid {} ({} children to root)",
            self.pid(),
            orphans.moved
        );
        self.sched_final(table);
    }

    /// Reap one zombie child, sleeping until there is one.
    pub fn wait(&self) -> Result<Pid> {
        let kernel = self.kernel();
        let mut table = kernel.ptable.lock(self.cpu());
        loop {
            let mut have_kids = false;
            let mut zombie = None;
            for (slot, entry) in table.children_of(self.pid()) {
                have_kids = true;
                if entry.state() == ProcState::Zombie {
                    zombie = Some(slot);
                    break;
                }
            }

            if let Some(slot) = zombie {
                let pid = self.reap(&mut table, slot);
                drop(table);
                return self.trap_return(Ok(pid));
            }
            if !have_kids {
                return Err(Error::NoChildren);
            }
            if table.entry(self.slot()).flags().contains(ProcFlags::KILLED) {
                return Err(Error::Interrupted);
            }
            table = self.sleep_table(Channel::process(self.pid()), table);
        }
    }

    fn reap(&self, table: &mut SpinGuard<'_, ProcTable>, slot: usize) -> Pid {
        let kernel = self.kernel();
        let pid = table.entry(slot).pid();
        let data = core::mem::take(&mut *kernel.slots[slot].data.lock());
        if let Some(stack) = data.kstack {
            kernel.platform.memory.free_kstack(stack);
        }
        if let Some(space) = data.space {
            kernel.platform.memory.free_space(space);
        }
        table.free(slot);

        let me = table.entry_mut(self.slot());
        if me.flags.contains(ProcFlags::MEASURING) {
            me.finished_count += 1;
        }
        log::debug!("wait: pid {} reaped pid {}", self.pid(), pid);
        pid
    }

    /// Root only: sleep until a child might exist.
    pub(crate) fn await_children(&self) {
        let table = self.kernel().ptable.lock(self.cpu());
        if table.children_of(self.pid()).next().is_none() {
            let table = self.sleep_table(Channel::process(self.pid()), table);
            drop(table);
        }
    }
}

pub(crate) struct Reparented {
    pub(crate) moved: usize,
    pub(crate) zombies: usize,
}

/// Give every child of `pid` to `root`.
pub(crate) fn reparent_children(table: &mut ProcTable, pid: Pid, root: Pid) -> Reparented {
    let mut orphans = Reparented {
        moved: 0,
        zombies: 0,
    };
    for slot in 0..table.capacity() {
        let entry = table.entry_mut(slot);
        if entry.is_live() && entry.parent == Some(pid) {
            entry.parent = Some(root);
            orphans.moved += 1;
            if entry.state == ProcState::Zombie {
                orphans.zombies += 1;
            }
        }
    }
    orphans
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reparent_counts_zombies() {
        let mut table = ProcTable::new(8, 2);
        let (parent, parent_pid) = table.allocate(0).unwrap();
        table.entry_mut(parent).state = ProcState::Running;
        for state in [ProcState::Sleeping, ProcState::Zombie] {
            let (slot, _) = table.allocate(0).unwrap();
            let entry = table.entry_mut(slot);
            entry.state = state;
            entry.parent = Some(parent_pid);
        }
        let orphans = reparent_children(&mut table, parent_pid, 99);
        assert_eq!(orphans.moved, 2);
        assert_eq!(orphans.zombies, 1);
        assert_eq!(table.children_of(parent_pid).count(), 0);
        assert_eq!(table.children_of(99).count(), 2);
    }
}
