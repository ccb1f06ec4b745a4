// Thread structure and the embedded syscall request slot.

use crate::platform::context::Context;
use crate::task::{Pid, Tid};

/// Thread states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Currently dispatched on some CPU.
    Running,
    /// Runnable, waiting for a CPU.
    Queued,
    /// Suspended awaiting syscall completion or an IPC reply.
    Blocked,
    /// Suspended until a deadline.
    Sleeping,
    /// Exited; awaiting reap.
    Zombie,
}

/// Per-thread syscall slot. Exactly one exists per thread, embedded here;
/// it is either linked on the global queue (`queued`), owned by a worker
/// (`busy`), or idle. Never both flags at once.
#[derive(Debug, Clone, Copy)]
pub struct SyscallRequest {
    pub owner: Tid,
    pub number: usize,
    pub params: [u64; 4],
    pub ret: i64,
    pub queued: bool,
    pub busy: bool,
    /// Set by the handler when the result is ready and the thread may run.
    pub unblock: bool,
    /// Set when the request must be re-enqueued after a signal handler runs.
    pub retry: bool,
    /// Link for the global syscall FIFO.
    pub next: Option<Tid>,
}

impl SyscallRequest {
    pub fn idle(owner: Tid) -> Self {
        Self {
            owner,
            number: 0,
            params: [0; 4],
            ret: 0,
            queued: false,
            busy: false,
            unblock: false,
            retry: false,
            next: None,
        }
    }
}

/// State a redirected thread needs to resume its interrupted syscall after
/// the signal handler returns.
#[derive(Debug, Clone, Copy)]
pub struct SignalFrame {
    pub rip: u64,
    pub rsp: u64,
    pub rax: u64,
    pub number: usize,
    pub params: [u64; 4],
    pub retry: bool,
}

pub struct Thread {
    pub tid: Tid,
    pub pid: Pid,
    pub state: ThreadState,
    pub timeslice: u32,
    pub priority: u8,
    pub cpu_affinity: Option<usize>,
    pub ctx: Context,
    /// Highest mapped user address; `sbrk` grows from here.
    pub highest: u64,
    pub request: SyscallRequest,
    pub sigpending: u64,
    pub sigmask: u64,
    pub signal_frame: Option<SignalFrame>,
    pub exit_status: i32,
    /// Wake deadline in ticks while `Sleeping`.
    pub wake_at: u64,
}

impl Thread {
    pub fn new(tid: Tid, pid: Pid, ctx: Context, priority: u8) -> Self {
        Self {
            tid,
            pid,
            state: ThreadState::Blocked,
            timeslice: 0,
            priority,
            cpu_affinity: None,
            ctx,
            highest: 0,
            request: SyscallRequest::idle(tid),
            sigpending: 0,
            sigmask: 0,
            signal_frame: None,
            exit_status: 0,
            wake_at: 0,
        }
    }

    pub fn is_zombie(&self) -> bool {
        self.state == ThreadState::Zombie
    }

    #[cfg(test)]
    pub fn for_tests(ctx: Context) -> Self {
        Self::new(0, 0, ctx, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_starts_idle() {
        let req = SyscallRequest::idle(9);
        assert_eq!(req.owner, 9);
        assert!(!req.queued);
        assert!(!req.busy);
        assert!(!req.unblock);
        assert!(req.next.is_none());
    }
}
