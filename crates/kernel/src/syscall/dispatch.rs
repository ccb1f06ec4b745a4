// Syscall handlers and the dispatch table.
//
// A handler receives the thread's SyscallRequest (as a scratch copy), may
// read and write the requester's memory through its page-table root, may
// relay work to a user-space server, and reports through `ret`/`unblock`.
// Leaving `unblock` clear parks the thread; whoever finishes the work
// re-enqueues the request.

use crate::error::{Errno, Result};
use crate::mem::paging::{vmm_allocate, VmmFlags};
use crate::mem::{page_align_up, PhysAddr};
use crate::config::PAGE_SIZE;
use crate::server::{self, PendingKind};
use crate::socket::{self, OpOutcome, RecvOutcome, SocketAddress};
use crate::syscall::numbers::*;
use crate::syscall::uaccess::{copy_from_user, copy_to_user, read_user_str};
use crate::task::signal::{kill_process, sigreturn_restore, Signal, SignalAction};
use crate::task::{table, exec, IoKind, Pid, SyscallRequest, Tid};

pub type Handler = fn(&mut SyscallRequest);

/// Dispatch slot for a function number; `None` is an empty slot and the
/// worker terminates the offending thread.
pub fn lookup(nr: usize) -> Option<Handler> {
    match nr {
        SYS_EXIT => Some(sys_exit),
        SYS_FORK => Some(sys_fork),
        SYS_EXECVE => Some(sys_execve),
        SYS_WAITPID => Some(sys_waitpid),
        SYS_GETPID => Some(sys_getpid),
        SYS_OPEN => Some(sys_open),
        SYS_CLOSE => Some(sys_close),
        SYS_STAT => Some(sys_stat),
        SYS_MOUNT => Some(sys_mount),
        SYS_CHOWN => Some(sys_chown),
        SYS_CHMOD => Some(sys_chmod),
        SYS_SBRK => Some(sys_sbrk),
        SYS_YIELD => Some(sys_yield),
        SYS_KILL => Some(sys_kill),
        SYS_SIGACTION => Some(sys_sigaction),
        SYS_SIGRETURN => Some(sys_sigreturn),
        SYS_SOCKET => Some(sys_socket),
        SYS_BIND => Some(sys_bind),
        SYS_LISTEN => Some(sys_listen),
        SYS_CONNECT => Some(sys_connect),
        SYS_ACCEPT => Some(sys_accept),
        SYS_SEND => Some(sys_send),
        SYS_RECV => Some(sys_recv),
        SYS_READ => Some(sys_read),
        SYS_WRITE => Some(sys_write),
        SYS_LSEEK => Some(sys_lseek),
        _ => None,
    }
}

fn caller(req: &SyscallRequest) -> Option<(Tid, Pid, PhysAddr)> {
    let tid = req.owner;
    table::with_thread(tid, |t| (tid, t.pid, t.ctx.root))
}

fn finish(req: &mut SyscallRequest, result: Result<i64>) {
    match result {
        Ok(v) => req.ret = v,
        Err(e) => req.ret = e.as_ret(),
    }
    req.unblock = true;
}

/// Map a socket-style outcome: Done completes, Block parks the thread.
fn finish_op(req: &mut SyscallRequest, result: core::result::Result<OpOutcome, Errno>) {
    match result {
        Ok(OpOutcome::Done(v)) => {
            req.ret = v;
            req.unblock = true;
        }
        Ok(OpOutcome::Block) => req.unblock = false,
        Err(e) => {
            req.ret = e.as_ret();
            req.unblock = true;
        }
    }
}

// ---- process family ----

fn sys_exit(req: &mut SyscallRequest) {
    crate::sched::terminate_thread(req.owner, req.params[0] as i32, true);
    req.unblock = false;
}

fn sys_getpid(req: &mut SyscallRequest) {
    let Some((_, pid, _)) = caller(req) else {
        return finish(req, Err(Errno::ESRCH));
    };
    finish(req, Ok(pid as i64));
}

fn sys_yield(req: &mut SyscallRequest) {
    finish(req, Ok(0));
}

fn sys_fork(req: &mut SyscallRequest) {
    finish(req, exec::fork(req.owner).map(|pid| pid as i64));
}

fn sys_execve(req: &mut SyscallRequest) {
    let Some((tid, _, root)) = caller(req) else {
        return finish(req, Err(Errno::ESRCH));
    };
    let result = (|| {
        let path = read_user_str(root, req.params[0], 4096)?;
        let argv = read_user_ptr_array(root, req.params[1])?;
        let envp = read_user_ptr_array(root, req.params[2])?;
        exec::execve_ramdisk(tid, &path, &argv, &envp)?;
        Ok(0)
    })();
    finish(req, result);
}

/// Read a null-terminated array of string pointers from user space.
fn read_user_ptr_array(root: PhysAddr, va: u64) -> Result<alloc::vec::Vec<alloc::string::String>> {
    let mut out = alloc::vec::Vec::new();
    if va == 0 {
        return Ok(out);
    }
    for i in 0..64 {
        let slot = copy_from_user(root, va + i * 8, 8)?;
        let ptr = u64::from_le_bytes(slot.try_into().map_err(|_| Errno::EFAULT)?);
        if ptr == 0 {
            return Ok(out);
        }
        out.push(read_user_str(root, ptr, 4096)?);
    }
    Err(Errno::EINVAL)
}

fn sys_waitpid(req: &mut SyscallRequest) {
    let Some((_, pid, root)) = caller(req) else {
        return finish(req, Err(Errno::ESRCH));
    };
    let want = req.params[0] as i64;
    let status_ptr = req.params[1];

    let children: alloc::vec::Vec<Pid> = {
        let mut guard = table::processes();
        match guard.as_mut() {
            Some(procs) => procs
                .iter()
                .filter(|p| p.ppid == pid)
                .map(|p| p.pid)
                .collect(),
            None => return finish(req, Err(Errno::ESRCH)),
        }
    };
    if children.is_empty() {
        return finish(req, Err(Errno::ECHILD));
    }

    for child in children {
        if want > 0 && child != want as Pid {
            continue;
        }
        if let Some(status) = crate::sched::reap_process(child) {
            if status_ptr != 0 {
                let _ = copy_to_user(root, status_ptr, &status.to_le_bytes());
            }
            return finish(req, Ok(child as i64));
        }
    }
    // Children exist but none are reapable yet; a child's exit re-enqueues
    // this request.
    req.unblock = false;
}

fn sys_sbrk(req: &mut SyscallRequest) {
    let Some((tid, _, root)) = caller(req) else {
        return finish(req, Err(Errno::ESRCH));
    };
    let increment = req.params[0] as i64;
    let result = (|| {
        let old = table::with_thread(tid, |t| t.highest).ok_or(Errno::ESRCH)?;
        if increment < 0 {
            return Err(Errno::EINVAL);
        }
        if increment == 0 {
            return Ok(old as i64);
        }
        let pages = (increment as usize).div_ceil(PAGE_SIZE);
        let base = page_align_up(old);
        let got = vmm_allocate(
            root,
            base,
            base + (pages * PAGE_SIZE) as u64,
            pages,
            VmmFlags::USER | VmmFlags::WRITE,
        );
        if got == 0 {
            return Err(Errno::ENOMEM);
        }
        table::with_thread(tid, |t| t.highest = got + (pages * PAGE_SIZE) as u64);
        Ok(old as i64)
    })();
    finish(req, result);
}

fn sys_kill(req: &mut SyscallRequest) {
    let result = (|| {
        let sig = Signal::from_u32(req.params[1] as u32).ok_or(Errno::EINVAL)?;
        kill_process(req.params[0] as Pid, sig)?;
        Ok(0)
    })();
    finish(req, result);
}

fn sys_sigaction(req: &mut SyscallRequest) {
    let Some((_, pid, _)) = caller(req) else {
        return finish(req, Err(Errno::ESRCH));
    };
    let result = (|| {
        let sig = Signal::from_u32(req.params[0] as u32).ok_or(Errno::EINVAL)?;
        if !sig.is_catchable() {
            return Err(Errno::EINVAL);
        }
        let action = match req.params[1] {
            0 => SignalAction::Default,
            1 => SignalAction::Ignore,
            addr => SignalAction::Handler(addr),
        };
        table::with_process(pid, |p| p.sigactions[(sig.to_u32() - 1) as usize] = action)
            .ok_or(Errno::ESRCH)?;
        Ok(0)
    })();
    finish(req, result);
}

fn sys_sigreturn(req: &mut SyscallRequest) {
    match sigreturn_restore(req.owner) {
        // The interrupted syscall goes back on the queue; stay blocked
        // until it completes for real.
        Ok(retry) => {
            req.unblock = false;
            req.retry = retry;
        }
        Err(e) => finish(req, Err(e)),
    }
}

// ---- server-relayed file family ----

fn relay_path_call(
    req: &mut SyscallRequest,
    build: impl FnOnce(u64, Pid, &str) -> alloc::vec::Vec<u8>,
    kind: PendingKind,
) {
    let Some((tid, pid, root)) = caller(req) else {
        return finish(req, Err(Errno::ESRCH));
    };
    let result = (|| {
        let path = read_user_str(root, req.params[0], 4096)?;
        let id = server::alloc_request_id();
        let msg = build(id, pid, &path);
        server::request_server(tid, pid, 0, id, kind, &msg)
    })();
    match result {
        Ok(()) => req.unblock = false,
        Err(e) => finish(req, Err(e)),
    }
}

fn sys_open(req: &mut SyscallRequest) {
    let flags = req.params[1] as u32;
    let mode = req.params[2] as u32;
    relay_path_call(
        req,
        |id, pid, path| server::build_open(id, pid, flags, mode, path),
        PendingKind::Open { flags },
    );
}

fn sys_stat(req: &mut SyscallRequest) {
    relay_path_call(req, server::build_stat, PendingKind::Plain);
}

fn sys_mount(req: &mut SyscallRequest) {
    let Some((tid, pid, root)) = caller(req) else {
        return finish(req, Err(Errno::ESRCH));
    };
    let flags = req.params[2] as u32;
    let result = (|| {
        let source = read_user_str(root, req.params[0], 4096)?;
        let target = read_user_str(root, req.params[1], 4096)?;
        let id = server::alloc_request_id();
        let msg = server::build_mount(id, pid, flags, &source, &target);
        server::request_server(tid, pid, 0, id, PendingKind::Plain, &msg)
    })();
    match result {
        Ok(()) => req.unblock = false,
        Err(e) => finish(req, Err(e)),
    }
}

fn sys_chown(req: &mut SyscallRequest) {
    let uid = req.params[1] as u32;
    let gid = req.params[2] as u32;
    relay_path_call(
        req,
        move |id, pid, path| server::build_chown(id, pid, uid, gid, path),
        PendingKind::Plain,
    );
}

fn sys_chmod(req: &mut SyscallRequest) {
    let mode = req.params[1] as u32;
    relay_path_call(
        req,
        move |id, pid, path| server::build_chmod(id, pid, mode, path),
        PendingKind::Plain,
    );
}

fn sys_close(req: &mut SyscallRequest) {
    let Some((_, pid, _)) = caller(req) else {
        return finish(req, Err(Errno::ESRCH));
    };
    let fd = req.params[0] as i32;
    let result = (|| {
        let kind = table::with_process(pid, |p| p.io.get(fd).map(|s| s.kind))
            .ok_or(Errno::ESRCH)??;
        match kind {
            IoKind::Socket => socket::close(pid, fd),
            IoKind::ServerFile => {
                table::with_process(pid, |p| p.io.close(fd)).ok_or(Errno::ESRCH)??;
                Ok(0)
            }
        }
    })();
    finish(req, result);
}

// ---- read/write/lseek fast-path family ----

fn sys_read(req: &mut SyscallRequest) {
    let Some((tid, pid, root)) = caller(req) else {
        return finish(req, Err(Errno::ESRCH));
    };
    let fd = req.params[0] as i32;
    let buf = req.params[1];
    let len = req.params[2] as usize;

    let slot = match table::with_process(pid, |p| p.io.get(fd).copied()) {
        Some(Ok(slot)) => slot,
        Some(Err(e)) => return finish(req, Err(e)),
        None => return finish(req, Err(Errno::ESRCH)),
    };
    match slot.kind {
        IoKind::Socket => match socket::recv_msg(tid, pid, fd, len, 0) {
            Ok(RecvOutcome::Data(data)) => {
                let result = copy_to_user(root, buf, &data).map(|_| data.len() as i64);
                finish(req, result);
            }
            Ok(RecvOutcome::Block) => req.unblock = false,
            Err(e) => finish(req, Err(e)),
        },
        IoKind::ServerFile => {
            let id = server::alloc_request_id();
            let msg = server::build_read(id, pid, slot.payload, slot.offset, len as u64);
            match server::request_server(tid, pid, 0, id, PendingKind::Read { buf, fd }, &msg) {
                Ok(()) => req.unblock = false,
                Err(e) => finish(req, Err(e)),
            }
        }
    }
}

fn sys_write(req: &mut SyscallRequest) {
    let Some((tid, pid, root)) = caller(req) else {
        return finish(req, Err(Errno::ESRCH));
    };
    let fd = req.params[0] as i32;
    let buf = req.params[1];
    let len = req.params[2] as usize;

    let slot = match table::with_process(pid, |p| p.io.get(fd).copied()) {
        Some(Ok(slot)) => slot,
        Some(Err(e)) => return finish(req, Err(e)),
        None => return finish(req, Err(Errno::ESRCH)),
    };
    let data = match copy_from_user(root, buf, len) {
        Ok(d) => d,
        Err(e) => return finish(req, Err(e)),
    };
    match slot.kind {
        IoKind::Socket => finish_op(req, socket::send_msg(tid, pid, fd, &data, 0)),
        IoKind::ServerFile => {
            let id = server::alloc_request_id();
            let msg = server::build_write(id, pid, slot.payload, slot.offset, &data);
            match server::request_server(tid, pid, 0, id, PendingKind::Write { fd }, &msg) {
                Ok(()) => req.unblock = false,
                Err(e) => finish(req, Err(e)),
            }
        }
    }
}

fn sys_lseek(req: &mut SyscallRequest) {
    let Some((_, pid, _)) = caller(req) else {
        return finish(req, Err(Errno::ESRCH));
    };
    let fd = req.params[0] as i32;
    let offset = req.params[1] as i64;
    let whence = req.params[2] as u32;

    let result = table::with_process(pid, |p| -> Result<i64> {
        let slot = p.io.get_mut(fd)?;
        if slot.kind == IoKind::Socket {
            return Err(Errno::ESPIPE);
        }
        let new = match whence {
            // SEEK_SET
            0 => offset,
            // SEEK_CUR
            1 => slot.offset as i64 + offset,
            // SEEK_END needs the size, which lives with the server.
            _ => return Err(Errno::EINVAL),
        };
        if new < 0 {
            return Err(Errno::EINVAL);
        }
        slot.offset = new as u64;
        Ok(new)
    })
    .unwrap_or(Err(Errno::ESRCH));
    finish(req, result);
}

// ---- socket fast-path family ----

fn sys_socket(req: &mut SyscallRequest) {
    let Some((_, pid, _)) = caller(req) else {
        return finish(req, Err(Errno::ESRCH));
    };
    finish(
        req,
        socket::socket(
            pid,
            req.params[0] as u32,
            req.params[1] as u32,
            req.params[2] as u32,
        ),
    );
}

/// Read a `sockaddr_un`-shaped address (family u16 + path) from user space.
fn read_user_addr(root: PhysAddr, va: u64, len: usize) -> Result<SocketAddress> {
    if len < 2 || len > 2 + crate::config::SOCK_PATH_MAX {
        return Err(Errno::EINVAL);
    }
    let raw = copy_from_user(root, va, len)?;
    let family = u16::from_le_bytes([raw[0], raw[1]]);
    if family != socket::AF_UNIX {
        return Err(Errno::EAFNOSUPPORT);
    }
    let path = &raw[2..];
    let path = match path.iter().position(|&b| b == 0) {
        Some(nul) => &path[..nul],
        None => path,
    };
    SocketAddress::local(path)
}

fn sys_bind(req: &mut SyscallRequest) {
    let Some((_, pid, root)) = caller(req) else {
        return finish(req, Err(Errno::ESRCH));
    };
    let result = read_user_addr(root, req.params[1], req.params[2] as usize)
        .and_then(|addr| socket::bind(pid, req.params[0] as i32, addr));
    finish(req, result);
}

fn sys_listen(req: &mut SyscallRequest) {
    let Some((_, pid, _)) = caller(req) else {
        return finish(req, Err(Errno::ESRCH));
    };
    finish(
        req,
        socket::listen(pid, req.params[0] as i32, req.params[1] as usize),
    );
}

fn sys_connect(req: &mut SyscallRequest) {
    let Some((tid, pid, root)) = caller(req) else {
        return finish(req, Err(Errno::ESRCH));
    };
    match read_user_addr(root, req.params[1], req.params[2] as usize) {
        Ok(addr) => finish_op(req, socket::connect(tid, pid, req.params[0] as i32, &addr)),
        Err(e) => finish(req, Err(e)),
    }
}

fn sys_accept(req: &mut SyscallRequest) {
    let Some((tid, pid, _)) = caller(req) else {
        return finish(req, Err(Errno::ESRCH));
    };
    finish_op(req, socket::accept(tid, pid, req.params[0] as i32));
}

fn sys_send(req: &mut SyscallRequest) {
    let Some((tid, pid, root)) = caller(req) else {
        return finish(req, Err(Errno::ESRCH));
    };
    let len = req.params[2] as usize;
    let flags = req.params[3] as u32;
    match copy_from_user(root, req.params[1], len) {
        Ok(data) => finish_op(
            req,
            socket::send_msg(tid, pid, req.params[0] as i32, &data, flags),
        ),
        Err(e) => finish(req, Err(e)),
    }
}

fn sys_recv(req: &mut SyscallRequest) {
    let Some((tid, pid, root)) = caller(req) else {
        return finish(req, Err(Errno::ESRCH));
    };
    let buf = req.params[1];
    let len = req.params[2] as usize;
    let flags = req.params[3] as u32;
    match socket::recv_msg(tid, pid, req.params[0] as i32, len, flags) {
        Ok(RecvOutcome::Data(data)) => {
            let result = copy_to_user(root, buf, &data).map(|_| data.len() as i64);
            finish(req, result);
        }
        Ok(RecvOutcome::Block) => req.unblock = false,
        Err(e) => finish(req, Err(e)),
    }
}
