// Signal delivery.
//
// Signals are delivered only at syscall boundaries: the worker calls
// `signal_handle` before dispatching a request. A caught signal reroutes the
// thread into its handler and marks the interrupted syscall for retry; the
// request is re-enqueued when the handler returns through sigreturn.

use crate::error::Errno;
use crate::task::thread::SignalFrame;
use crate::task::{table, Pid, ThreadState, Tid};

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    SIGHUP = 1,
    SIGINT = 2,
    SIGQUIT = 3,
    SIGILL = 4,
    SIGABRT = 6,
    SIGKILL = 9,
    SIGUSR1 = 10,
    SIGSEGV = 11,
    SIGUSR2 = 12,
    SIGPIPE = 13,
    SIGALRM = 14,
    SIGTERM = 15,
    SIGCHLD = 17,
}

impl Signal {
    pub fn from_u32(signo: u32) -> Option<Self> {
        match signo {
            1 => Some(Signal::SIGHUP),
            2 => Some(Signal::SIGINT),
            3 => Some(Signal::SIGQUIT),
            4 => Some(Signal::SIGILL),
            6 => Some(Signal::SIGABRT),
            9 => Some(Signal::SIGKILL),
            10 => Some(Signal::SIGUSR1),
            11 => Some(Signal::SIGSEGV),
            12 => Some(Signal::SIGUSR2),
            13 => Some(Signal::SIGPIPE),
            14 => Some(Signal::SIGALRM),
            15 => Some(Signal::SIGTERM),
            17 => Some(Signal::SIGCHLD),
            _ => None,
        }
    }

    pub fn to_u32(self) -> u32 {
        self as u32
    }

    /// SIGKILL cannot be caught, blocked or ignored.
    pub fn is_catchable(self) -> bool {
        self != Signal::SIGKILL
    }

    pub fn default_terminates(self) -> bool {
        !matches!(self, Signal::SIGCHLD)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    Default,
    Ignore,
    Handler(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalDisposition {
    /// Nothing deliverable; proceed with the syscall.
    None,
    /// Thread is gone; abandon its request.
    Terminated,
    /// Thread was rerouted into its handler and re-queued; the request
    /// retries after sigreturn.
    Redirected,
}

fn sig_bit(sig: Signal) -> u64 {
    1u64 << (sig.to_u32() - 1)
}

/// Mark `sig` pending on the thread. A thread blocked with an idle request
/// gets its request pushed back on the queue so a worker delivers promptly.
pub fn post_signal(tid: Tid, sig: Signal) -> Result<(), Errno> {
    let needs_kick = table::with_thread(tid, |t| {
        t.sigpending |= sig_bit(sig);
        t.state == ThreadState::Blocked && !t.request.queued && !t.request.busy
    })
    .ok_or(Errno::ESRCH)?;

    if needs_kick {
        crate::syscall::queue::enqueue_request(tid);
    }
    Ok(())
}

/// Deliver a signal to a process: its lowest-tid thread takes it.
pub fn kill_process(pid: Pid, sig: Signal) -> Result<(), Errno> {
    let tid = table::with_process(pid, |p| p.threads.iter().min().copied())
        .ok_or(Errno::ESRCH)?
        .ok_or(Errno::ESRCH)?;
    post_signal(tid, sig)
}

/// Deliver the next pending, unmasked signal for `tid`, if any.
pub fn signal_handle(tid: Tid) -> SignalDisposition {
    loop {
        let Some(pick) = table::with_thread(tid, |t| {
            let deliverable = t.sigpending & !t.sigmask;
            if deliverable == 0 {
                return None;
            }
            let signo = deliverable.trailing_zeros() + 1;
            t.sigpending &= !(1u64 << (signo - 1));
            Some(signo)
        }) else {
            return SignalDisposition::Terminated;
        };
        let sig = match pick {
            None => return SignalDisposition::None,
            // Unknown numbers are consumed and skipped.
            Some(signo) => match Signal::from_u32(signo) {
                Some(sig) => sig,
                None => continue,
            },
        };

        let pid = match table::with_thread(tid, |t| t.pid) {
            Some(pid) => pid,
            None => return SignalDisposition::Terminated,
        };
        let action = table::with_process(pid, |p| p.sigactions[(sig.to_u32() - 1) as usize])
            .unwrap_or(SignalAction::Default);
        let action = if sig.is_catchable() {
            action
        } else {
            SignalAction::Default
        };

        match action {
            SignalAction::Ignore => continue,
            SignalAction::Default if !sig.default_terminates() => continue,
            SignalAction::Default => {
                crate::sched::terminate_thread(tid, 128 + sig.to_u32() as i32, true);
                return SignalDisposition::Terminated;
            }
            SignalAction::Handler(addr) => {
                if redirect_to_handler(tid, sig, addr) {
                    crate::sched::make_runnable(tid);
                    return SignalDisposition::Redirected;
                }
                // No trampoline installed; fall back to the default action.
                crate::sched::terminate_thread(tid, 128 + sig.to_u32() as i32, true);
                return SignalDisposition::Terminated;
            }
        }
    }
}

/// Point the thread at its handler: stash the interrupted state, build the
/// handler frame on the user stack with the trampoline as return address.
fn redirect_to_handler(tid: Tid, sig: Signal, handler: u64) -> bool {
    table::with_thread(tid, |t| {
        let trampoline = t.ctx.signal_trampoline;
        if trampoline == 0 {
            return false;
        }

        t.signal_frame = Some(SignalFrame {
            rip: t.ctx.regs.rip,
            rsp: t.ctx.regs.rsp,
            rax: t.ctx.regs.rax,
            number: t.request.number,
            params: t.request.params,
            retry: true,
        });

        // Skip the red zone, align, leave the return slot.
        let aligned = (t.ctx.regs.rsp - 128) & !0xF;
        let new_rsp = aligned - 8;
        let Some(ptr) = crate::mem::paging::translate_byte(t.ctx.root, new_rsp) else {
            t.signal_frame = None;
            return false;
        };
        unsafe {
            core::ptr::copy_nonoverlapping(trampoline.to_le_bytes().as_ptr(), ptr, 8);
        }

        t.ctx.regs.rip = handler;
        t.ctx.regs.rsp = new_rsp;
        t.ctx.regs.rdi = sig.to_u32() as u64;
        t.request.retry = true;
        true
    })
    .unwrap_or(false)
}

/// Undo a redirect: restore the interrupted register state and the original
/// request contents. Returns whether the restored syscall wants a retry;
/// the worker re-enqueues it once the sigreturn request is off its hands.
pub fn sigreturn_restore(tid: Tid) -> Result<bool, Errno> {
    table::with_thread(tid, |t| {
        let frame = t.signal_frame.take()?;
        t.ctx.regs.rip = frame.rip;
        t.ctx.regs.rsp = frame.rsp;
        t.ctx.regs.rax = frame.rax;
        t.request.number = frame.number;
        t.request.params = frame.params;
        Some(frame.retry)
    })
    .ok_or(Errno::ESRCH)?
    .ok_or(Errno::EINVAL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_numbers_round_trip() {
        for signo in [1u32, 2, 9, 11, 15, 17] {
            let sig = Signal::from_u32(signo).unwrap();
            assert_eq!(sig.to_u32(), signo);
        }
        assert!(Signal::from_u32(0).is_none());
        assert!(Signal::from_u32(64).is_none());
    }

    #[test]
    fn sigkill_is_not_catchable() {
        assert!(!Signal::SIGKILL.is_catchable());
        assert!(Signal::SIGTERM.is_catchable());
    }

    #[test]
    fn sigchld_defaults_to_ignore() {
        assert!(!Signal::SIGCHLD.default_terminates());
        assert!(Signal::SIGTERM.default_terminates());
    }
}
