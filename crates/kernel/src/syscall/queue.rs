// Syscall queue and dispatch engine.
//
// Trap side: `syscall_handle` materialises the request from the saved
// context, runs IPC/read-write/lseek inline and queues everything else.
// Worker side: `syscall_process` drains the global FIFO, delivers signals,
// enters the requester's address space and invokes the handler.
//
// The FIFO is a singly-linked list threaded through each thread's embedded
// request; head and tail live under the scheduler lock.

use crate::platform::context::{
    create_syscall_context, load_context, save_context, set_context_return, use_context, TrapFrame,
};
use crate::sched;
use crate::syscall::dispatch;
use crate::syscall::numbers::{is_fast_path, MAX_SYSCALL};
use crate::task::signal::{signal_handle, SignalDisposition};
use crate::task::{table, SyscallRequest, ThreadState, Tid};

/// How the trap side left the requesting thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Fast path finished inline; the thread stays RUNNING with this value
    /// already in its return register.
    Inline(i64),
    /// The thread is BLOCKED: its request is queued, or a fast-path handler
    /// deferred and arranged its own wake-up.
    Blocked,
}

/// Append a thread's request to the global FIFO. A request already queued
/// is left alone; one currently owned by a worker gets its retry flag set
/// so the worker re-enqueues it when it lets go (no lost wake-ups).
pub fn enqueue_request(tid: Tid) {
    let mut guard = sched::lock();
    let ok = table::with_thread(tid, |t| {
        if t.request.queued {
            return false;
        }
        if t.request.busy {
            t.request.retry = true;
            return false;
        }
        t.request.queued = true;
        t.request.next = None;
        true
    });
    if ok != Some(true) {
        return;
    }

    let state = guard.state();
    match state.queue_tail {
        Some(tail) => {
            table::with_thread(tail, |t| t.request.next = Some(tid));
        }
        None => state.queue_head = Some(tid),
    }
    state.queue_tail = Some(tid);
}

/// Pop the FIFO head; the returned request is marked busy.
fn dequeue_request() -> Option<Tid> {
    let mut guard = sched::lock();
    let state = guard.state();
    let head = state.queue_head?;
    let next = table::with_thread(head, |t| {
        let next = t.request.next;
        t.request.queued = false;
        t.request.busy = true;
        t.request.next = None;
        next
    })
    .flatten();

    let state = guard.state();
    state.queue_head = next;
    if next.is_none() {
        state.queue_tail = None;
    }
    Some(head)
}

#[cfg(test)]
pub fn queue_depth() -> usize {
    let mut guard = sched::lock();
    let mut depth = 0;
    let mut cursor = guard.state().queue_head;
    while let Some(tid) = cursor {
        depth += 1;
        cursor = table::with_thread(tid, |t| t.request.next).flatten();
    }
    depth
}

/// Run one handler over a copy of the request so it can take any locks it
/// needs, then merge the result back into the thread's slot. The server
/// gateway may complete the slot concurrently from another CPU; a
/// completion that lands first wins and the handler's scratch result is
/// discarded.
fn invoke_handler(tid: Tid, handler: dispatch::Handler) -> Option<SyscallRequest> {
    let mut req = table::with_thread(tid, |t| t.request)?;
    req.unblock = false;
    handler(&mut req);
    table::with_thread(tid, |t| {
        if !t.request.unblock {
            t.request.ret = req.ret;
            t.request.unblock = req.unblock;
        }
        t.request.retry |= req.retry;
        t.request
    })
}

/// What to do with a request once its handler (or a concurrent completion)
/// is done with it.
enum PostAction {
    Complete,
    Retry,
    Park,
}

/// Release worker ownership and decide atomically against late wake-ups.
fn release_request(tid: Tid) -> PostAction {
    table::with_thread(tid, |t| {
        t.request.busy = false;
        if t.request.unblock {
            PostAction::Complete
        } else if t.request.retry {
            t.request.retry = false;
            PostAction::Retry
        } else {
            PostAction::Park
        }
    })
    .unwrap_or(PostAction::Park)
}

/// Trap-side classification and execution. The caller has already saved the
/// context and disabled local preemption.
pub fn syscall_enter(tid: Tid) -> Disposition {
    let nr = match table::with_thread(tid, |t| {
        create_syscall_context(t);
        t.request.number
    }) {
        Some(nr) => nr,
        None => return Disposition::Blocked,
    };

    // The thread counts as suspended from here; an inline completion flips
    // it straight back to RUNNING.
    table::with_thread(tid, |t| t.state = ThreadState::Blocked);

    if is_fast_path(nr) {
        if let Some(handler) = dispatch::lookup(nr) {
            if let Some(req) = invoke_handler(tid, handler) {
                if req.unblock {
                    table::with_thread(tid, |t| {
                        set_context_return(&mut t.ctx, req.ret);
                        t.state = ThreadState::Running;
                        t.request.unblock = false;
                    });
                    return Disposition::Inline(req.ret);
                }
                if req.retry {
                    // A wake-up beat the handler's own deferral: retry
                    // through the queue instead of losing it.
                    table::with_thread(tid, |t| t.request.retry = false);
                    enqueue_request(tid);
                }
            }
            // Deferred; the wake-up path re-enqueues the request.
            return Disposition::Blocked;
        }
    }

    enqueue_request(tid);
    Disposition::Blocked
}

/// Full trap entry: never returns to the caller.
pub fn syscall_handle(frame: &TrapFrame) -> ! {
    sched::set_local_sched(false);
    let Some(tid) = crate::cpu::current().current_tid() else {
        dispatch_loop();
    };
    table::with_thread(tid, |t| save_context(&mut t.ctx, frame));

    match syscall_enter(tid) {
        Disposition::Inline(_) => {
            // SAFETY: the thread is RUNNING on this CPU; nothing frees a
            // running thread's context.
            let ctx = table::with_thread(tid, |t| &t.ctx as *const crate::platform::Context)
                .expect("running thread vanished");
            load_context(unsafe { &*ctx })
        }
        Disposition::Blocked => dispatch_loop(),
    }
}

/// Loop scheduling until something is runnable, then resume it.
pub fn dispatch_loop() -> ! {
    loop {
        if let Some(tid) = sched::schedule() {
            let ctx = table::with_thread(tid, |t| &t.ctx as *const crate::platform::Context);
            if let Some(ctx) = ctx {
                // SAFETY: `schedule` just installed this thread as RUNNING
                // on this CPU.
                load_context(unsafe { &*ctx })
            }
        }
        crate::platform::platform_idle();
    }
}

/// Finish a request whose result is already in `ret`: write the return
/// register and hand the thread back to the scheduler.
fn complete_request(tid: Tid) {
    table::with_thread(tid, |t| {
        set_context_return(&mut t.ctx, t.request.ret);
        t.request.busy = false;
        t.request.unblock = false;
        t.state = ThreadState::Blocked;
    });
    sched::make_runnable(tid);
}

/// Worker-side drain: service one queued request.
/// Returns 0 when the queue was empty, letting the caller idle.
pub fn syscall_process() -> i32 {
    let Some(tid) = dequeue_request() else {
        return 0;
    };

    // A thread that died while its request sat in the queue is abandoned.
    let state = table::with_thread(tid, |t| t.state);
    if state != Some(ThreadState::Blocked) {
        table::with_thread(tid, |t| t.request.busy = false);
        return 1;
    }

    // Completed by the server gateway while queued: just wake the thread.
    let ready = table::with_thread(tid, |t| t.request.unblock).unwrap_or(false);
    if ready {
        complete_request(tid);
        return 1;
    }

    let nr = table::with_thread(tid, |t| t.request.number).unwrap_or(usize::MAX);
    let handler = if nr <= MAX_SYSCALL {
        dispatch::lookup(nr)
    } else {
        None
    };
    let Some(handler) = handler else {
        crate::warn!("thread {}: invalid syscall {}, terminating", tid, nr);
        table::with_thread(tid, |t| t.request.busy = false);
        sched::terminate_thread(tid, -1, true);
        return 1;
    };

    match signal_handle(tid) {
        SignalDisposition::Terminated => {
            // Thread is gone (or was already a zombie); nothing to service.
            table::with_thread(tid, |t| t.request.busy = false);
            return 1;
        }
        SignalDisposition::Redirected => {
            // The thread runs its signal handler now; the request retries
            // after sigreturn.
            table::with_thread(tid, |t| t.request.busy = false);
            return 1;
        }
        SignalDisposition::None => {}
    }

    // Enter the requester's address space for user-memory access.
    table::with_thread(tid, |t| use_context(&t.ctx));

    if invoke_handler(tid, handler).is_some() {
        match release_request(tid) {
            PostAction::Complete => complete_request(tid),
            // Either a restored syscall (sigreturn) or a wake-up that
            // arrived while the worker still owned the slot.
            PostAction::Retry => enqueue_request(tid),
            // Deferred: the wake-up path re-enqueues when I/O lands.
            PostAction::Park => {}
        }
    }
    1
}
