// Scheduler.
//
// Per-priority ready queues, selected highest-priority-first with
// round-robin within a level. One coarse lock serialises the ready queues,
// the global syscall FIFO linkage and the per-CPU dispatched pointers;
// holders run with IRQs disabled. The lock is reentrant for its owning CPU
// (the one documented exception to the no-reentrancy rule).

use crate::config::{PRIORITY_LEVELS, TIMESLICE_BASE};
use crate::error::KernelError;
use crate::platform::{self, context};
use crate::task::{self, table, ThreadState, Tid};
use alloc::collections::VecDeque;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

pub struct SchedState {
    ready: [VecDeque<Tid>; PRIORITY_LEVELS],
    /// Global syscall FIFO, linked through each thread's embedded request.
    pub queue_head: Option<Tid>,
    pub queue_tail: Option<Tid>,
    scheduling: bool,
    tick: u64,
}

impl SchedState {
    const fn new() -> Self {
        Self {
            ready: [const { VecDeque::new() }; PRIORITY_LEVELS],
            queue_head: None,
            queue_tail: None,
            scheduling: false,
            tick: 0,
        }
    }
}

/// Coarse scheduler spinlock, reentrant per CPU.
pub struct SchedLock {
    owner: AtomicUsize,
    depth: AtomicUsize,
    state: UnsafeCell<SchedState>,
}

unsafe impl Sync for SchedLock {}

pub struct SchedGuard {
    irq: bool,
    nested: bool,
}

static SCHED: SchedLock = SchedLock {
    owner: AtomicUsize::new(0),
    depth: AtomicUsize::new(0),
    state: UnsafeCell::new(SchedState::new()),
};

/// Acquire the scheduler lock with IRQs disabled (sched_lock).
pub fn lock() -> SchedGuard {
    let irq = platform::irq_save();
    let me = platform::current_cpu_id() + 1;
    if SCHED.owner.load(Ordering::Acquire) == me {
        SCHED.depth.fetch_add(1, Ordering::Relaxed);
        return SchedGuard { irq, nested: true };
    }
    while SCHED
        .owner
        .compare_exchange_weak(0, me, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
    {
        core::hint::spin_loop();
    }
    SchedGuard { irq, nested: false }
}

impl SchedGuard {
    pub fn state(&mut self) -> &mut SchedState {
        // The owner check in `lock` guarantees exclusive access.
        unsafe { &mut *SCHED.state.get() }
    }
}

impl Drop for SchedGuard {
    /// sched_release: every exit path, early returns included, goes
    /// through here.
    fn drop(&mut self) {
        if self.nested {
            SCHED.depth.fetch_sub(1, Ordering::Relaxed);
        } else {
            SCHED.owner.store(0, Ordering::Release);
        }
        platform::irq_restore(self.irq);
    }
}

/// Gate preemption on the current CPU.
pub fn set_local_sched(enabled: bool) {
    if enabled {
        platform::irq_enable();
    } else {
        platform::irq_disable();
    }
}

/// Gate scheduling globally.
pub fn set_scheduling(enabled: bool) {
    lock().state().scheduling = enabled;
}

pub fn scheduling_enabled() -> bool {
    lock().state().scheduling
}

/// Timeslice by priority, monotonically non-increasing.
pub fn sched_timeslice(priority: u8) -> u32 {
    (TIMESLICE_BASE >> priority.min(PRIORITY_LEVELS as u8 - 1)).max(1)
}

/// Put a thread on its ready queue with a fresh timeslice.
pub fn enqueue_thread(tid: Tid) {
    let mut guard = lock();
    let prio = match table::with_thread(tid, |t| {
        if t.state == ThreadState::Queued || t.state == ThreadState::Zombie {
            return None;
        }
        t.state = ThreadState::Queued;
        t.timeslice = sched_timeslice(t.priority);
        Some(t.priority)
    }) {
        Some(Some(p)) => p,
        _ => return,
    };
    guard.state().ready[(prio as usize).min(PRIORITY_LEVELS - 1)].push_back(tid);
}

/// A blocked thread becomes runnable again (syscall completed, signal
/// redirect, child exit).
pub fn make_runnable(tid: Tid) {
    enqueue_thread(tid);
}

/// Pick the next runnable thread for this CPU. Stale entries (threads no
/// longer QUEUED) are dropped; affinity mismatches go back to their queue.
fn pick_next(guard: &mut SchedGuard) -> Option<Tid> {
    let cpu = platform::current_cpu_id();
    for prio in 0..PRIORITY_LEVELS {
        let mut skipped: VecDeque<Tid> = VecDeque::new();
        let picked = loop {
            let Some(tid) = guard.state().ready[prio].pop_front() else {
                break None;
            };
            let verdict = table::with_thread(tid, |t| {
                if t.state != ThreadState::Queued {
                    None
                } else {
                    Some(t.cpu_affinity.map(|a| a == cpu).unwrap_or(true))
                }
            });
            match verdict {
                Some(Some(true)) => break Some(tid),
                Some(Some(false)) => skipped.push_back(tid),
                // Stale or vanished: drop the entry.
                _ => {}
            }
        };
        let state = guard.state();
        while let Some(tid) = skipped.pop_front() {
            state.ready[prio].push_back(tid);
        }
        if picked.is_some() {
            return picked;
        }
    }
    None
}

/// Select and install the next thread on this CPU. Returns the chosen tid;
/// the trap exit performs the actual `load_context`.
///
/// A still-running predecessor is demoted to QUEUED first and competes with
/// everything else, so a high-priority thread keeps its CPU until it blocks.
pub fn schedule() -> Option<Tid> {
    let mut guard = lock();
    if !guard.state().scheduling {
        return None;
    }

    let cpu = crate::cpu::current();
    let prev = cpu.current_tid();
    let prev_custom = prev
        .and_then(|tid| table::with_thread(tid, |t| t.ctx.iopb.is_custom()))
        .unwrap_or(false);

    if let Some(prev_tid) = prev {
        let demoted = table::with_thread(prev_tid, |t| {
            if t.state == ThreadState::Running {
                t.state = ThreadState::Queued;
                Some(t.priority)
            } else {
                None
            }
        });
        if let Some(Some(prio)) = demoted {
            guard.state().ready[(prio as usize).min(PRIORITY_LEVELS - 1)].push_back(prev_tid);
        }
    }

    let Some(next) = pick_next(&mut guard) else {
        cpu.clear_current();
        return None;
    };

    if Some(next) == prev {
        table::with_thread(next, |t| {
            t.state = ThreadState::Running;
            t.timeslice = sched_timeslice(t.priority);
        });
        return Some(next);
    }

    table::with_thread(next, |t| {
        t.state = ThreadState::Running;
        t.timeslice = sched_timeslice(t.priority);
        if prev_custom || t.ctx.iopb.is_custom() {
            crate::cpu::current().load_io_bitmap(&t.ctx.iopb);
        }
        context::use_context(&t.ctx);
        cpu.set_current(t.tid, t.pid);
    });
    Some(next)
}

/// Timer IRQ body: run down the current timeslice, wake sleepers.
pub fn timer_tick() {
    let now = {
        let mut guard = lock();
        let state = guard.state();
        state.tick += 1;
        state.tick
    };

    // Wake expired sleepers.
    let mut expired: alloc::vec::Vec<Tid> = alloc::vec::Vec::new();
    {
        let mut guard = table::threads();
        if let Some(table) = guard.as_mut() {
            for t in table.iter_mut() {
                if t.state == ThreadState::Sleeping && t.wake_at <= now {
                    expired.push(t.tid);
                }
            }
        }
    }
    for tid in expired {
        table::with_thread(tid, |t| t.state = ThreadState::Blocked);
        enqueue_thread(tid);
    }

    let cpu = crate::cpu::current();
    if let Some(tid) = cpu.current_tid() {
        let slice_done = table::with_thread(tid, |t| {
            if t.timeslice > 0 {
                t.timeslice -= 1;
            }
            t.timeslice == 0
        })
        .unwrap_or(false);
        if slice_done {
            cpu.set_need_resched(true);
        }
    }
}

pub fn current_tick() -> u64 {
    lock().state().tick
}

/// Suspend a thread until `wake_at` ticks.
pub fn sleep_thread(tid: Tid, wake_at: u64) {
    let _guard = lock();
    table::with_thread(tid, |t| {
        t.state = ThreadState::Sleeping;
        t.wake_at = wake_at;
    });
}

/// Spawn a kernel thread: kernel-level context, highest priority, QUEUED.
pub fn kthread_create(entry: fn(u64) -> !, arg: u64) -> Result<Tid, KernelError> {
    if task::kernel_pid() == 0 {
        let pid = table::create_process(0)?;
        task::set_kernel_pid(pid);
    }
    let ctx = context::create_context(
        context::PrivilegeLevel::Kernel,
        entry as usize as u64,
        arg,
    )?;
    let tid = table::alloc_tid()?;
    table::insert_thread(crate::task::Thread::new(tid, task::kernel_pid(), ctx, 0))?;
    enqueue_thread(tid);
    Ok(tid)
}

/// Tear a thread down: ZOMBIE state, user pages freed immediately, the
/// Thread object left for the parent to reap. A request still linked on the
/// syscall FIFO is abandoned there; the worker drops it on dequeue.
pub fn terminate_thread(tid: Tid, status: i32, reparent: bool) {
    let pid = {
        let mut guard = lock();
        for queue in guard.state().ready.iter_mut() {
            queue.retain(|&t| t != tid);
        }

        let pid = table::with_thread(tid, |t| {
            if t.state == ThreadState::Zombie {
                return None;
            }
            t.state = ThreadState::Zombie;
            t.exit_status = status;
            t.request.unblock = false;
            t.request.retry = false;
            context::clean_thread(&mut t.ctx);
            Some(t.pid)
        });

        for cpu_id in 0..crate::config::MAX_CPUS {
            let cpu = crate::cpu::get(cpu_id);
            if cpu.current_tid() == Some(tid) {
                cpu.clear_current();
            }
        }
        match pid {
            Some(Some(pid)) => pid,
            _ => return,
        }
    };

    crate::debug!("thread {} exited with status {}", tid, status);

    if reparent {
        let lumen = task::lumen_pid();
        let mut guard = table::processes();
        if let Some(procs) = guard.as_mut() {
            for p in procs.iter_mut() {
                if p.ppid == pid && p.pid != pid {
                    p.ppid = lumen;
                }
            }
        }
    }

    // Nudge the parent: SIGCHLD plus a retry of any waitpid parked on us.
    let ppid = table::with_process(pid, |p| p.ppid).unwrap_or(0);
    if ppid != 0 {
        let _ = task::signal::kill_process(ppid, task::Signal::SIGCHLD);
        let waiters: alloc::vec::Vec<Tid> =
            table::with_process(ppid, |p| p.threads.clone()).unwrap_or_default();
        for wtid in waiters {
            let parked = table::with_thread(wtid, |t| {
                t.state == ThreadState::Blocked
                    && t.request.number == crate::syscall::numbers::SYS_WAITPID
                    && !t.request.queued
                    && !t.request.busy
            })
            .unwrap_or(false);
            if parked {
                crate::syscall::queue::enqueue_request(wtid);
            }
        }
    }
}

/// Remove a fully-zombie process and its threads from the tables.
/// Returns the exit status recorded by its last exited thread.
pub fn reap_process(pid: crate::task::Pid) -> Option<i32> {
    let tids = table::with_process(pid, |p| p.threads.clone())?;
    let all_zombie = tids
        .iter()
        .all(|&tid| table::with_thread(tid, |t| t.is_zombie()).unwrap_or(true));
    if !all_zombie {
        return None;
    }

    let mut status = 0;
    {
        let mut guard = table::threads();
        if let Some(table) = guard.as_mut() {
            for &tid in &tids {
                if let Some(t) = table.remove(tid) {
                    status = t.exit_status;
                }
            }
        }
    }
    table::processes().as_mut()?.remove(pid);
    Some(status)
}
