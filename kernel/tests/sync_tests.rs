//! Blocking lock tests
//! Priority lock handoff, reader-writer exclusion and sleep locks

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};

use smp_kernel::{Error, KernelConfig, PriorityLock, RwLock, Sleeplock};

use common::{boot, boot_cores, settled, wait_until, TIMEOUT};

mod plock_tests {
    use super::*;

    /// Waiters queued at 10, 30, 20 get the lock at 30, 20, 10.
    #[test]
    fn test_release_hands_off_by_priority() {
        let t = boot(KernelConfig::default().with_ncpu(2).manual_clock());
        let lock = Arc::new(PriorityLock::new("test"));
        let order = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::channel();

        let plock = lock.clone();
        let log = order.clone();
        t.kernel
            .spawn("holder", move |proc| {
                plock.acquire(proc, 0)?;
                for priority in [10, 30, 20] {
                    let child_lock = plock.clone();
                    let log = log.clone();
                    let queued = plock.waiting(proc);
                    proc.fork(move |child| {
                        child_lock.acquire(child, priority)?;
                        log.lock().unwrap().push(priority);
                        child_lock.release(child);
                        Ok(())
                    })?;
                    // Let the child block before queueing the next one.
                    while plock.waiting(proc) == queued {
                        proc.yield_now();
                    }
                }
                plock.release(proc);
                for _ in 0..3 {
                    proc.wait()?;
                }
                let _ = tx.send(plock.holder(proc));
                Ok(())
            })
            .expect("Failed to spawn");

        assert_eq!(rx.recv_timeout(TIMEOUT).expect("holder did not finish"), None);
        assert_eq!(*order.lock().unwrap(), vec![30, 20, 10]);
        assert!(settled(&t.kernel));
    }

    /// Equal priorities: the most recently queued waiter wins.
    #[test]
    fn test_ties_go_to_newest_waiter() {
        let t = boot(KernelConfig::default().with_ncpu(1).manual_clock());
        let lock = Arc::new(PriorityLock::new("ties"));
        let order = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::channel();

        let plock = lock.clone();
        let log = order.clone();
        t.kernel
            .spawn("holder", move |proc| {
                plock.acquire(proc, 0)?;
                let mut pids = Vec::new();
                for _ in 0..2 {
                    let child_lock = plock.clone();
                    let log = log.clone();
                    let queued = plock.waiting(proc);
                    pids.push(proc.fork(move |child| {
                        child_lock.acquire(child, 5)?;
                        log.lock().unwrap().push(child.pid());
                        child_lock.release(child);
                        Ok(())
                    })?);
                    while plock.waiting(proc) == queued {
                        proc.yield_now();
                    }
                }
                plock.release(proc);
                proc.wait()?;
                proc.wait()?;
                let _ = tx.send(pids);
                Ok(())
            })
            .expect("Failed to spawn");

        let pids = rx.recv_timeout(TIMEOUT).expect("holder did not finish");
        assert_eq!(*order.lock().unwrap(), vec![pids[1], pids[0]]);
    }

    #[test]
    fn test_killed_waiter_is_interrupted() {
        let t = boot(KernelConfig::default().with_ncpu(2).manual_clock());
        let lock = Arc::new(PriorityLock::new("kill"));
        let (tx, rx) = mpsc::channel();

        let plock = lock.clone();
        t.kernel
            .spawn("holder", move |proc| {
                plock.acquire(proc, 0)?;
                let waiter_lock = plock.clone();
                let waiter_tx = tx.clone();
                let waiter = proc.fork(move |child| {
                    let result = waiter_lock.acquire(child, 50);
                    let _ = waiter_tx.send(("waiter", result.is_err(), 0));
                    result
                })?;
                while plock.waiting(proc) == 0 {
                    proc.yield_now();
                }
                proc.kill(waiter)?;
                proc.wait()?;
                let left = plock.waiting(proc);
                let held = plock.holder(proc) == Some(proc.pid());
                plock.release(proc);
                let _ = tx.send(("holder", held, left));
                Ok(())
            })
            .expect("Failed to spawn");

        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), ("waiter", true, 0));
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), ("holder", true, 0));
        assert!(settled(&t.kernel));
    }

    /// Releasing a priority lock one does not hold stops the kernel.
    #[test]
    fn test_release_by_non_holder_is_fatal() {
        let t = boot_cores(2);
        let lock = Arc::new(PriorityLock::new("fatal"));
        let plock = lock.clone();
        t.kernel
            .spawn("intruder", move |proc| {
                plock.release(proc);
                Ok(())
            })
            .expect("Failed to spawn");
        assert!(wait_until(|| t.kernel.has_panicked()));
        assert!(!t.kernel.is_running());
    }
}

mod rwlock_tests {
    use super::*;

    /// Readers overlap with each other, never with a writer.
    #[test]
    fn test_writers_exclude_everyone() {
        let t = boot_cores(4);
        let lock = Arc::new(RwLock::new("rw"));
        let readers = Arc::new(AtomicUsize::new(0));
        let writing = Arc::new(AtomicBool::new(false));
        let violated = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();

        let shared = (lock.clone(), readers.clone(), writing.clone(), violated.clone());
        t.kernel
            .spawn("rw", move |proc| {
                for i in 0..6 {
                    let (lock, readers, writing, violated) = shared.clone();
                    let writer = i % 3 == 0;
                    proc.fork(move |child| {
                        for _ in 0..3 {
                            if writer {
                                lock.acquire_write(child);
                                if writing.swap(true, Ordering::AcqRel)
                                    || readers.load(Ordering::Acquire) > 0
                                {
                                    violated.store(true, Ordering::Release);
                                }
                                child.sleep_ticks(1)?;
                                writing.store(false, Ordering::Release);
                                lock.release_write(child);
                            } else {
                                lock.acquire_read(child);
                                readers.fetch_add(1, Ordering::AcqRel);
                                if writing.load(Ordering::Acquire) {
                                    violated.store(true, Ordering::Release);
                                }
                                child.sleep_ticks(1)?;
                                readers.fetch_sub(1, Ordering::AcqRel);
                                lock.release_read(child);
                            }
                        }
                        Ok(())
                    })?;
                }
                while proc.wait().is_ok() {}
                let (lock, ..) = shared;
                let _ = tx.send(lock.snapshot(proc));
                Ok(())
            })
            .expect("Failed to spawn");

        assert_eq!(rx.recv_timeout(TIMEOUT).expect("did not finish"), (0, false));
        assert!(!violated.load(Ordering::Acquire));
        assert!(settled(&t.kernel));
    }

    #[test]
    fn test_release_read_without_readers_is_fatal() {
        let t = boot_cores(2);
        let lock = Arc::new(RwLock::new("empty"));
        let rw = lock.clone();
        t.kernel
            .spawn("bad", move |proc| {
                rw.release_read(proc);
                Ok(())
            })
            .expect("Failed to spawn");
        assert!(wait_until(|| t.kernel.has_panicked()));
    }
}

mod sleeplock_tests {
    use super::*;

    #[test]
    fn test_sleeplock_is_exclusive() {
        let t = boot_cores(4);
        let lock = Arc::new(Sleeplock::new("sleep"));
        let inside = Arc::new(AtomicUsize::new(0));
        let violated = Arc::new(AtomicBool::new(false));

        for _ in 0..4 {
            let lock = lock.clone();
            let inside = inside.clone();
            let violated = violated.clone();
            t.kernel
                .spawn("contender", move |proc| {
                    for _ in 0..3 {
                        lock.acquire_sleep(proc);
                        if inside.fetch_add(1, Ordering::AcqRel) > 0 || !lock.holding(proc) {
                            violated.store(true, Ordering::Release);
                        }
                        proc.sleep_ticks(1)?;
                        inside.fetch_sub(1, Ordering::AcqRel);
                        lock.release_sleep(proc);
                        if lock.holding(proc) {
                            violated.store(true, Ordering::Release);
                        }
                    }
                    Ok(())
                })
                .expect("Failed to spawn");
        }

        assert!(settled(&t.kernel));
        assert!(!violated.load(Ordering::Acquire));
    }

    #[test]
    fn test_sleep_ticks_interrupted_by_kill() {
        let t = boot_cores(2);
        let (tx, rx) = mpsc::channel();
        let pid = t
            .kernel
            .spawn("napper", move |proc| {
                let _ = tx.send(proc.sleep_ticks(1_000_000));
                Ok(())
            })
            .expect("Failed to spawn");
        assert!(wait_until(|| t.kernel.state_of(pid).is_some()));
        std::thread::sleep(std::time::Duration::from_millis(10));
        t.kernel.kill(pid).expect("kill failed");
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Err(Error::Interrupted));
    }
}
