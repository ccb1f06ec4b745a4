// Local (AF_UNIX) socket layer.
//
// In-memory message passing between processes on this machine, used both by
// user programs and by the kernel itself to reach its user-space servers.
// Descriptors live in a global table keyed by index; processes refer to them
// through I/O slots. Blocking is cooperative: an operation that cannot make
// progress records the caller's tid on the descriptor and the thread's
// syscall retries when the state changes. Wake-ups are issued only after
// every socket lock is dropped.

use crate::config::{SOCKET_MAX, SOCK_BACKLOG_DEFAULT, SOCK_IO_MAX, SOCK_PATH_MAX};
use crate::error::Errno;
use crate::mem::heap::{kfree, kmalloc};
use crate::task::{table as task_table, IoKind, Pid, Tid};
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

pub const AF_UNIX: u16 = 1;
pub const AF_LOCAL: u16 = AF_UNIX;

pub const SOCK_STREAM: u32 = 1;
pub const SOCK_DGRAM: u32 = 2;
pub const SOCK_SEQPACKET: u32 = 3;

pub const SOCK_NONBLOCK: u32 = 0x100;
pub const SOCK_CLOEXEC: u32 = 0x200;

pub const MSG_PEEK: u32 = 0x01;
pub const MSG_OOB: u32 = 0x02;
pub const MSG_WAITALL: u32 = 0x04;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketAddress {
    pub family: u16,
    pub path: heapless::Vec<u8, SOCK_PATH_MAX>,
}

impl SocketAddress {
    pub fn local(path: &[u8]) -> Result<Self, Errno> {
        let mut buf = heapless::Vec::new();
        buf.extend_from_slice(path).map_err(|_| Errno::EINVAL)?;
        Ok(Self {
            family: AF_UNIX,
            path: buf,
        })
    }
}

/// One queued datagram/segment: a kmalloc-backed payload plus its length.
/// `offset` tracks partially consumed stream data.
#[derive(Debug)]
pub struct Message {
    data: *mut u8,
    len: usize,
    offset: usize,
}

// SAFETY: the payload is exclusively owned by the ring holding the message,
// which is always accessed under its descriptor lock.
unsafe impl Send for Message {}

impl Message {
    fn new(bytes: &[u8]) -> Option<Self> {
        if bytes.is_empty() {
            return Some(Self {
                data: core::ptr::null_mut(),
                len: 0,
                offset: 0,
            });
        }
        let data = kmalloc(bytes.len());
        if data.is_null() {
            return None;
        }
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), data, bytes.len());
        }
        Some(Self {
            data,
            len: bytes.len(),
            offset: 0,
        })
    }

    fn remaining(&self) -> usize {
        self.len - self.offset
    }

    fn bytes(&self) -> &[u8] {
        if self.data.is_null() {
            &[]
        } else {
            unsafe { core::slice::from_raw_parts(self.data.add(self.offset), self.remaining()) }
        }
    }

    fn consume(&mut self, n: usize) {
        self.offset = (self.offset + n).min(self.len);
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        if !self.data.is_null() {
            kfree(self.data);
        }
    }
}

#[derive(Debug)]
pub struct SocketDescriptor {
    pub owner: Pid,
    pub global_index: u32,
    pub stype: u32,
    pub protocol: u32,
    pub flags: u32,
    pub address: Option<SocketAddress>,
    pub listener: bool,
    /// Pending connections: (connector index, connector tid).
    backlog: VecDeque<(u32, Tid)>,
    pub backlog_max: usize,
    inbound: VecDeque<Message>,
    pub inbound_max: usize,
    pub outbound_max: usize,
    pub peer: Option<u32>,
    pub refcount: u32,
    waiting_recv: Vec<Tid>,
    waiting_send: Vec<Tid>,
    waiting_accept: Vec<Tid>,
    waiting_connect: Vec<Tid>,
}

impl SocketDescriptor {
    fn new(owner: Pid, index: u32, stype: u32, protocol: u32, flags: u32) -> Self {
        Self {
            owner,
            global_index: index,
            stype,
            protocol,
            flags,
            address: None,
            listener: false,
            backlog: VecDeque::new(),
            backlog_max: 0,
            inbound: VecDeque::new(),
            inbound_max: SOCK_IO_MAX,
            outbound_max: SOCK_IO_MAX,
            peer: None,
            refcount: 1,
            waiting_recv: Vec::new(),
            waiting_send: Vec::new(),
            waiting_accept: Vec::new(),
            waiting_connect: Vec::new(),
        }
    }

    pub fn inbound_count(&self) -> usize {
        self.inbound.len()
    }

    fn inbound_bytes(&self) -> usize {
        self.inbound.iter().map(|m| m.remaining()).sum()
    }

    fn nonblocking(&self, msg_flags: u32) -> bool {
        self.flags & SOCK_NONBLOCK != 0 || msg_flags & SOCK_NONBLOCK != 0
    }
}

type SocketRef = Arc<Mutex<SocketDescriptor>>;

pub struct SocketTable {
    slots: Vec<Option<SocketRef>>,
    capacity: usize,
}

impl SocketTable {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            capacity,
        }
    }

    /// Register a new descriptor, reusing the lowest free slot.
    pub fn register(
        &mut self,
        owner: Pid,
        stype: u32,
        protocol: u32,
        flags: u32,
    ) -> Result<(u32, SocketRef), Errno> {
        let idx = match self.slots.iter().position(|s| s.is_none()) {
            Some(idx) => idx,
            None if self.slots.len() < self.capacity => {
                self.slots.push(None);
                self.slots.len() - 1
            }
            None => return Err(Errno::ENFILE),
        };
        let sock = Arc::new(Mutex::new(SocketDescriptor::new(
            owner, idx as u32, stype, protocol, flags,
        )));
        self.slots[idx] = Some(sock.clone());
        Ok((idx as u32, sock))
    }

    pub fn get(&self, index: u32) -> Option<SocketRef> {
        self.slots.get(index as usize)?.clone()
    }

    pub fn unregister(&mut self, index: u32) {
        if let Some(slot) = self.slots.get_mut(index as usize) {
            *slot = None;
        }
    }

    pub fn count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Find the descriptor bound to `addr`.
    pub fn find_bound(&self, addr: &SocketAddress) -> Option<u32> {
        for slot in self.slots.iter().flatten() {
            let desc = slot.lock();
            if desc.address.as_ref() == Some(addr) {
                return Some(desc.global_index);
            }
        }
        None
    }
}

static SOCKETS: Mutex<Option<SocketTable>> = Mutex::new(None);

pub fn init_sockets() {
    *SOCKETS.lock() = Some(SocketTable::with_capacity(SOCKET_MAX));
    crate::info!("socket: table ready (max {})", SOCKET_MAX);
}

fn with_table<R>(f: impl FnOnce(&mut SocketTable) -> Result<R, Errno>) -> Result<R, Errno> {
    let mut guard = SOCKETS.lock();
    let table = guard.as_mut().ok_or(Errno::EINVAL)?;
    f(table)
}

fn lookup(index: u32) -> Result<SocketRef, Errno> {
    with_table(|t| t.get(index).ok_or(Errno::EBADF))
}

/// Resolve a process descriptor to its socket.
fn resolve(pid: Pid, fd: i32) -> Result<u32, Errno> {
    let slot = task_table::with_process(pid, |p| p.io.get(fd).copied())
        .ok_or(Errno::ESRCH)??;
    if slot.kind != IoKind::Socket {
        return Err(Errno::ENOTSOCK);
    }
    Ok(slot.payload as u32)
}

/// Resolve a process descriptor to its global socket index.
pub fn resolve_fd(pid: Pid, fd: i32) -> Result<u32, Errno> {
    resolve(pid, fd)
}

/// Outcome of an operation that may have to wait for the peer.
#[derive(Debug, PartialEq, Eq)]
pub enum OpOutcome {
    Done(i64),
    /// Caller must stay blocked; a waiter entry has been recorded and the
    /// thread's syscall will be retried on the next state change.
    Block,
}

/// Outcome of `recv_msg`.
#[derive(Debug, PartialEq, Eq)]
pub enum RecvOutcome {
    Data(Vec<u8>),
    Block,
}

fn wake_all(tids: &mut Vec<Tid>, wakes: &mut Vec<Tid>) {
    wakes.append(tids);
}

fn issue_wakes(wakes: Vec<Tid>) {
    for tid in wakes {
        crate::syscall::queue::enqueue_request(tid);
    }
}

/// Create a socket and install it in the owner's first free I/O slot.
pub fn socket(pid: Pid, domain: u32, stype: u32, protocol: u32) -> Result<i64, Errno> {
    if domain != AF_UNIX as u32 {
        return Err(Errno::EAFNOSUPPORT);
    }
    let flags = stype & (SOCK_NONBLOCK | SOCK_CLOEXEC);
    let base_type = stype & 0xFF;
    if !(SOCK_STREAM..=SOCK_SEQPACKET).contains(&base_type) {
        return Err(Errno::EINVAL);
    }

    let (index, _) = with_table(|t| t.register(pid, base_type, protocol, flags))?;
    let fd = task_table::with_process(pid, |p| p.io.alloc(IoKind::Socket, flags, index as u64))
        .ok_or(Errno::ESRCH)?;
    match fd {
        Ok(fd) => Ok(fd as i64),
        Err(e) => {
            with_table(|t| {
                t.unregister(index);
                Ok(())
            })?;
            Err(e)
        }
    }
}

/// Bind a local address; duplicates are rejected.
pub fn bind(pid: Pid, fd: i32, addr: SocketAddress) -> Result<i64, Errno> {
    if addr.family != AF_UNIX {
        return Err(Errno::EAFNOSUPPORT);
    }
    let index = resolve(pid, fd)?;
    with_table(|t| {
        if t.find_bound(&addr).is_some() {
            return Err(Errno::EADDRINUSE);
        }
        let sock = t.get(index).ok_or(Errno::EBADF)?;
        sock.lock().address = Some(addr);
        Ok(0)
    })
}

/// Mark a bound socket as a listener with the given backlog capacity.
pub fn listen(pid: Pid, fd: i32, backlog: usize) -> Result<i64, Errno> {
    let index = resolve(pid, fd)?;
    let sock = lookup(index)?;
    let mut desc = sock.lock();
    if desc.address.is_none() {
        return Err(Errno::EINVAL);
    }
    desc.backlog_max = backlog.clamp(1, SOCK_BACKLOG_DEFAULT);
    desc.listener = true;
    Ok(0)
}

/// Connect to a bound address. Stream and seqpacket sockets enter the
/// listener's backlog and wait to be accepted; datagram sockets just record
/// the peer.
pub fn connect(tid: Tid, pid: Pid, fd: i32, addr: &SocketAddress) -> Result<OpOutcome, Errno> {
    let index = resolve(pid, fd)?;
    let mut wakes = Vec::new();

    let outcome = (|| {
        let sock = lookup(index)?;
        // One descriptor lock at a time; self state is snapshotted first.
        let (stype, nonblock, already_paired) = {
            let desc = sock.lock();
            (
                desc.stype,
                desc.nonblocking(0),
                desc.peer.is_some() && desc.stype != SOCK_DGRAM,
            )
        };
        // Retry path: acceptance already paired us.
        if already_paired {
            return Ok(OpOutcome::Done(0));
        }

        let peer_index = with_table(|t| t.find_bound(addr).ok_or(Errno::ECONNREFUSED))?;
        if peer_index == index {
            return Err(Errno::EINVAL);
        }
        let peer = lookup(peer_index)?;

        {
            let mut peer_desc = peer.lock();
            if !peer_desc.listener {
                // Bound but not listening: connection refused.
                return Err(Errno::ECONNREFUSED);
            }

            if stype != SOCK_DGRAM {
                if peer_desc.backlog.len() >= peer_desc.backlog_max {
                    if nonblock {
                        return Err(Errno::EAGAIN);
                    }
                    // Backlog full: wait for accept to drain it, then retry.
                    peer_desc.waiting_connect.push(tid);
                    return Ok(OpOutcome::Block);
                }
                peer_desc.backlog.push_back((index, tid));
                wake_all(&mut peer_desc.waiting_accept, &mut wakes);
            }
        }

        if stype == SOCK_DGRAM {
            sock.lock().peer = Some(peer_index);
            return Ok(OpOutcome::Done(0));
        }
        // Wait until the listener accepts us.
        Ok(OpOutcome::Block)
    })();

    issue_wakes(wakes);
    outcome
}

/// Accept one pending connection: pair it with a fresh descriptor in this
/// process and return the new fd.
pub fn accept(tid: Tid, pid: Pid, fd: i32) -> Result<OpOutcome, Errno> {
    let index = resolve(pid, fd)?;
    let mut wakes = Vec::new();

    let outcome = (|| {
        let sock = lookup(index)?;
        let (connector_index, connector_tid, stype, protocol) = {
            let mut desc = sock.lock();
            if !desc.listener {
                return Err(Errno::EINVAL);
            }
            match desc.backlog.pop_front() {
                Some((ci, ct)) => {
                    // Backlog has room again: let blocked connectors retry.
                    wake_all(&mut desc.waiting_connect, &mut wakes);
                    (ci, ct, desc.stype, desc.protocol)
                }
                None => {
                    if desc.nonblocking(0) {
                        return Err(Errno::EAGAIN);
                    }
                    desc.waiting_accept.push(tid);
                    return Ok(OpOutcome::Block);
                }
            }
        };

        let (new_index, new_sock) =
            with_table(|t| t.register(pid, stype, protocol, 0))?;
        let new_fd = task_table::with_process(pid, |p| {
            p.io.alloc(IoKind::Socket, 0, new_index as u64)
        })
        .ok_or(Errno::ESRCH)??;

        new_sock.lock().peer = Some(connector_index);
        if let Ok(connector) = lookup(connector_index) {
            connector.lock().peer = Some(new_index);
        }
        wakes.push(connector_tid);
        Ok(OpOutcome::Done(new_fd as i64))
    })();

    issue_wakes(wakes);
    outcome
}

/// Queue `buf` on the connected peer's inbound ring.
pub fn send_msg(
    tid: Tid,
    pid: Pid,
    fd: i32,
    buf: &[u8],
    msg_flags: u32,
) -> Result<OpOutcome, Errno> {
    let index = resolve(pid, fd)?;
    let mut wakes = Vec::new();

    let outcome = (|| {
        let sock = lookup(index)?;
        let (peer_index, nonblock) = {
            let desc = sock.lock();
            (desc.peer.ok_or(Errno::ENOTCONN)?, desc.nonblocking(msg_flags))
        };
        let peer = lookup(peer_index).map_err(|_| Errno::ENOTCONN)?;
        let mut peer_desc = peer.lock();

        if peer_desc.inbound.len() >= peer_desc.inbound_max {
            if nonblock {
                return Err(Errno::EAGAIN);
            }
            peer_desc.waiting_send.push(tid);
            return Ok(OpOutcome::Block);
        }

        let msg = Message::new(buf).ok_or(Errno::ENOMEM)?;
        peer_desc.inbound.push_back(msg);
        wake_all(&mut peer_desc.waiting_recv, &mut wakes);
        Ok(OpOutcome::Done(buf.len() as i64))
    })();

    issue_wakes(wakes);
    outcome
}

/// Dequeue up to `len` bytes. Stream sockets coalesce across messages;
/// datagram and seqpacket take one message and drop any excess.
pub fn recv_msg(
    tid: Tid,
    pid: Pid,
    fd: i32,
    len: usize,
    msg_flags: u32,
) -> Result<RecvOutcome, Errno> {
    let index = resolve(pid, fd)?;
    let mut wakes = Vec::new();

    let outcome = (|| {
        let sock = lookup(index)?;
        // Probe the peer before taking the descriptor lock; the table lock
        // is never nested inside a descriptor lock.
        let peer_open = match sock.lock().peer {
            Some(p) => lookup(p).is_ok(),
            None => false,
        };
        let mut desc = sock.lock();

        if desc.inbound.is_empty() {
            if !peer_open {
                // Peer closed: end of stream.
                return Ok(RecvOutcome::Data(Vec::new()));
            }
            if desc.nonblocking(msg_flags) {
                return Err(Errno::EAGAIN);
            }
            desc.waiting_recv.push(tid);
            return Ok(RecvOutcome::Block);
        }

        if msg_flags & MSG_PEEK != 0 {
            let head = desc.inbound.front().expect("ring checked non-empty");
            let take = head.remaining().min(len);
            return Ok(RecvOutcome::Data(head.bytes()[..take].to_vec()));
        }

        if msg_flags & MSG_WAITALL != 0 && desc.inbound_bytes() < len && peer_open {
            desc.waiting_recv.push(tid);
            return Ok(RecvOutcome::Block);
        }

        let mut out = Vec::with_capacity(len.min(desc.inbound_bytes()));
        if desc.stype == SOCK_STREAM {
            while out.len() < len {
                let Some(head) = desc.inbound.front_mut() else {
                    break;
                };
                let take = head.remaining().min(len - out.len());
                out.extend_from_slice(&head.bytes()[..take]);
                head.consume(take);
                if head.remaining() == 0 {
                    desc.inbound.pop_front();
                }
            }
        } else {
            let head = desc.inbound.pop_front().expect("ring checked non-empty");
            let take = head.remaining().min(len);
            out.extend_from_slice(&head.bytes()[..take]);
        }

        wake_all(&mut desc.waiting_send, &mut wakes);
        Ok(RecvOutcome::Data(out))
    })();

    issue_wakes(wakes);
    outcome
}

/// Drop one reference; the last reference frees the buffers, unregisters
/// the descriptor and wakes anything parked on it.
pub fn close(pid: Pid, fd: i32) -> Result<i64, Errno> {
    let index = resolve(pid, fd)?;
    task_table::with_process(pid, |p| p.io.close(fd)).ok_or(Errno::ESRCH)??;
    close_index(index);
    Ok(0)
}

fn close_index(index: u32) {
    let mut wakes = Vec::new();
    let mut peer_to_clear = None;

    let last = {
        let Ok(sock) = lookup(index) else { return };
        let mut desc = sock.lock();
        desc.refcount = desc.refcount.saturating_sub(1);
        if desc.refcount > 0 {
            false
        } else {
            desc.inbound.clear();
            peer_to_clear = desc.peer.take();
            wake_all(&mut desc.waiting_recv, &mut wakes);
            wake_all(&mut desc.waiting_send, &mut wakes);
            wake_all(&mut desc.waiting_accept, &mut wakes);
            wake_all(&mut desc.waiting_connect, &mut wakes);
            for (_, tid) in desc.backlog.drain(..) {
                wakes.push(tid);
            }
            true
        }
    };

    if last {
        let _ = with_table(|t| {
            t.unregister(index);
            Ok(())
        });
        if let Some(peer_index) = peer_to_clear {
            if let Ok(peer) = lookup(peer_index) {
                let mut desc = peer.lock();
                desc.peer = None;
                wake_all(&mut desc.waiting_recv, &mut wakes);
                wake_all(&mut desc.waiting_send, &mut wakes);
            }
        }
    }
    issue_wakes(wakes);
}

/// Extra reference for fork and descriptor duplication.
pub fn incref(index: u32) {
    if let Ok(sock) = lookup(index) {
        sock.lock().refcount += 1;
    }
}

pub fn socket_count() -> usize {
    SOCKETS.lock().as_ref().map(|t| t.count()).unwrap_or(0)
}

// ---- kernel-side access (server gateway; no fd, no blocking) ----

/// Create an unattached descriptor owned by `owner`.
pub fn kernel_socket(owner: Pid, stype: u32) -> Result<u32, Errno> {
    with_table(|t| t.register(owner, stype, 0, 0)).map(|(idx, _)| idx)
}

pub fn kernel_bind(index: u32, addr: SocketAddress) -> Result<(), Errno> {
    with_table(|t| {
        if t.find_bound(&addr).is_some() {
            return Err(Errno::EADDRINUSE);
        }
        let sock = t.get(index).ok_or(Errno::EBADF)?;
        sock.lock().address = Some(addr);
        Ok(())
    })
}

pub fn kernel_listen(index: u32, backlog: usize) -> Result<(), Errno> {
    let sock = lookup(index)?;
    let mut desc = sock.lock();
    desc.backlog_max = backlog.clamp(1, SOCK_BACKLOG_DEFAULT);
    desc.listener = true;
    Ok(())
}

/// Accept a pending connection on a kernel listener; the paired descriptor
/// stays kernel-owned and is referenced by index only.
pub fn kernel_accept(index: u32) -> Option<u32> {
    let mut wakes = Vec::new();
    let result = (|| {
        let sock = lookup(index).ok()?;
        let (connector_index, connector_tid, stype) = {
            let mut desc = sock.lock();
            let (ci, ct) = desc.backlog.pop_front()?;
            wake_all(&mut desc.waiting_connect, &mut wakes);
            (ci, ct, desc.stype)
        };
        let owner = sock.lock().owner;
        let (new_index, new_sock) = with_table(|t| t.register(owner, stype, 0, 0)).ok()?;
        new_sock.lock().peer = Some(connector_index);
        if let Ok(connector) = lookup(connector_index) {
            connector.lock().peer = Some(new_index);
        }
        wakes.push(connector_tid);
        Some(new_index)
    })();
    issue_wakes(wakes);
    result
}

/// Non-blocking kernel send on a connected descriptor.
pub fn kernel_send(index: u32, buf: &[u8]) -> Result<usize, Errno> {
    let mut wakes = Vec::new();
    let outcome = (|| {
        let sock = lookup(index)?;
        let peer_index = sock.lock().peer.ok_or(Errno::ENOTCONN)?;
        let peer = lookup(peer_index).map_err(|_| Errno::ENOTCONN)?;
        let mut peer_desc = peer.lock();
        if peer_desc.inbound.len() >= peer_desc.inbound_max {
            return Err(Errno::EAGAIN);
        }
        let msg = Message::new(buf).ok_or(Errno::ENOMEM)?;
        peer_desc.inbound.push_back(msg);
        wake_all(&mut peer_desc.waiting_recv, &mut wakes);
        Ok(buf.len())
    })();
    issue_wakes(wakes);
    outcome
}

/// Non-blocking kernel receive: one whole message, if any.
pub fn kernel_recv(index: u32) -> Option<Vec<u8>> {
    let mut wakes = Vec::new();
    let result = {
        let sock = lookup(index).ok()?;
        let mut desc = sock.lock();
        let msg = desc.inbound.pop_front()?;
        wake_all(&mut desc.waiting_send, &mut wakes);
        Some(msg.bytes().to_vec())
    };
    issue_wakes(wakes);
    result
}

#[cfg(test)]
pub fn ensure_test_sockets() {
    let mut guard = SOCKETS.lock();
    if guard.is_none() {
        *guard = Some(SocketTable::with_capacity(SOCKET_MAX));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::table;

    fn setup() -> Pid {
        crate::mem::ensure_test_init();
        table::ensure_test_tables();
        ensure_test_sockets();
        table::create_process(1).unwrap()
    }

    fn mk_socket(pid: Pid, stype: u32) -> i32 {
        socket(pid, AF_UNIX as u32, stype, 0).unwrap() as i32
    }

    fn connected_pair(tag: &[u8]) -> (Pid, i32, Pid, i32) {
        let server_pid = setup();
        let client_pid = table::create_process(1).unwrap();
        let listener = mk_socket(server_pid, SOCK_STREAM);
        let addr = SocketAddress::local(tag).unwrap();
        bind(server_pid, listener, addr.clone()).unwrap();
        listen(server_pid, listener, 8).unwrap();

        let client = mk_socket(client_pid, SOCK_STREAM);
        assert_eq!(
            connect(100, client_pid, client, &addr).unwrap(),
            OpOutcome::Block
        );
        let accepted = match accept(101, server_pid, listener).unwrap() {
            OpOutcome::Done(fd) => fd as i32,
            OpOutcome::Block => panic!("pending connection expected"),
        };
        // Connector retry now completes.
        assert_eq!(
            connect(100, client_pid, client, &addr).unwrap(),
            OpOutcome::Done(0)
        );
        (server_pid, accepted, client_pid, client)
    }

    #[test]
    fn socket_requires_af_unix() {
        let pid = setup();
        assert_eq!(socket(pid, 2, SOCK_STREAM, 0).unwrap_err(), Errno::EAFNOSUPPORT);
        assert_eq!(
            socket(pid, AF_UNIX as u32, 9, 0).unwrap_err(),
            Errno::EINVAL
        );
    }

    #[test]
    fn duplicate_bind_is_rejected() {
        let pid = setup();
        let a = mk_socket(pid, SOCK_STREAM);
        let b = mk_socket(pid, SOCK_STREAM);
        let addr = SocketAddress::local(b"/run/dup.sock").unwrap();
        bind(pid, a, addr.clone()).unwrap();
        assert_eq!(bind(pid, b, addr).unwrap_err(), Errno::EADDRINUSE);
    }

    #[test]
    fn connect_to_unbound_address_is_refused() {
        let pid = setup();
        let s = mk_socket(pid, SOCK_STREAM);
        let addr = SocketAddress::local(b"/run/nobody.sock").unwrap();
        assert_eq!(connect(1, pid, s, &addr).unwrap_err(), Errno::ECONNREFUSED);
    }

    #[test]
    fn connect_to_non_listener_is_refused() {
        let pid = setup();
        let bound = mk_socket(pid, SOCK_STREAM);
        let addr = SocketAddress::local(b"/run/nolisten.sock").unwrap();
        bind(pid, bound, addr.clone()).unwrap();

        let s = mk_socket(pid, SOCK_STREAM);
        assert_eq!(connect(1, pid, s, &addr).unwrap_err(), Errno::ECONNREFUSED);
    }

    #[test]
    fn accept_pairs_symmetric_peers() {
        let (server_pid, accepted, client_pid, client) = connected_pair(b"/run/pair.sock");
        let server_idx = resolve(server_pid, accepted).unwrap();
        let client_idx = resolve(client_pid, client).unwrap();

        let server_peer = lookup(server_idx).unwrap().lock().peer;
        let client_peer = lookup(client_idx).unwrap().lock().peer;
        assert_eq!(server_peer, Some(client_idx));
        assert_eq!(client_peer, Some(server_idx));
    }

    #[test]
    fn send_recv_round_trip_preserves_bytes_and_order() {
        let (server_pid, accepted, client_pid, client) = connected_pair(b"/run/rt.sock");

        send_msg(1, client_pid, client, b"first", 0).unwrap();
        send_msg(1, client_pid, client, b"second", 0).unwrap();

        match recv_msg(2, server_pid, accepted, 5, 0).unwrap() {
            RecvOutcome::Data(d) => assert_eq!(d, b"first"),
            RecvOutcome::Block => panic!("data was queued"),
        }
        match recv_msg(2, server_pid, accepted, 64, 0).unwrap() {
            RecvOutcome::Data(d) => assert_eq!(d, b"second"),
            RecvOutcome::Block => panic!("data was queued"),
        }
    }

    #[test]
    fn recv_peek_does_not_consume() {
        let (server_pid, accepted, client_pid, client) = connected_pair(b"/run/peek.sock");
        send_msg(1, client_pid, client, b"payload", 0).unwrap();

        match recv_msg(2, server_pid, accepted, 64, MSG_PEEK).unwrap() {
            RecvOutcome::Data(d) => assert_eq!(d, b"payload"),
            RecvOutcome::Block => panic!(),
        }
        match recv_msg(2, server_pid, accepted, 64, 0).unwrap() {
            RecvOutcome::Data(d) => assert_eq!(d, b"payload"),
            RecvOutcome::Block => panic!("peek must not dequeue"),
        }
    }

    #[test]
    fn recv_waitall_blocks_until_enough_bytes() {
        let (server_pid, accepted, client_pid, client) = connected_pair(b"/run/waitall.sock");
        send_msg(1, client_pid, client, b"abc", 0).unwrap();

        assert_eq!(
            recv_msg(2, server_pid, accepted, 6, MSG_WAITALL).unwrap(),
            RecvOutcome::Block
        );
        send_msg(1, client_pid, client, b"def", 0).unwrap();
        match recv_msg(2, server_pid, accepted, 6, MSG_WAITALL).unwrap() {
            RecvOutcome::Data(d) => assert_eq!(d, b"abcdef"),
            RecvOutcome::Block => panic!("six bytes are available"),
        }
    }

    #[test]
    fn full_ring_blocks_or_fails_nonblocking() {
        let (server_pid, accepted, client_pid, client) = connected_pair(b"/run/full.sock");
        for i in 0..SOCK_IO_MAX {
            assert_eq!(
                send_msg(1, client_pid, client, &[i as u8], 0).unwrap(),
                OpOutcome::Done(1)
            );
        }

        // Non-blocking: would-block, occupancy unchanged.
        assert_eq!(
            send_msg(1, client_pid, client, b"x", SOCK_NONBLOCK).unwrap_err(),
            Errno::EAGAIN
        );
        let idx = resolve(server_pid, accepted).unwrap();
        assert_eq!(lookup(idx).unwrap().lock().inbound_count(), SOCK_IO_MAX);

        // Blocking: waiter recorded.
        assert_eq!(
            send_msg(7, client_pid, client, b"x", 0).unwrap(),
            OpOutcome::Block
        );

        // Draining one message makes room again.
        recv_msg(2, server_pid, accepted, 1, 0).unwrap();
        assert_eq!(
            send_msg(1, client_pid, client, b"y", 0).unwrap(),
            OpOutcome::Done(1)
        );
    }

    #[test]
    fn empty_ring_blocks_or_fails_nonblocking() {
        let (server_pid, accepted, _client_pid, _client) = connected_pair(b"/run/empty.sock");
        assert_eq!(
            recv_msg(2, server_pid, accepted, 8, SOCK_NONBLOCK).unwrap_err(),
            Errno::EAGAIN
        );
        assert_eq!(
            recv_msg(2, server_pid, accepted, 8, 0).unwrap(),
            RecvOutcome::Block
        );
    }

    #[test]
    fn backlog_overflow_blocks_second_connector() {
        let server_pid = setup();
        let listener = mk_socket(server_pid, SOCK_STREAM);
        let addr = SocketAddress::local(b"/run/backlog1.sock").unwrap();
        bind(server_pid, listener, addr.clone()).unwrap();
        listen(server_pid, listener, 1).unwrap();

        let c1 = mk_socket(server_pid, SOCK_STREAM);
        let c2 = mk_socket(server_pid, SOCK_STREAM);
        assert_eq!(connect(11, server_pid, c1, &addr).unwrap(), OpOutcome::Block);
        // Backlog (capacity 1) is full: the second connector parks, it is
        // not rejected.
        assert_eq!(connect(12, server_pid, c2, &addr).unwrap(), OpOutcome::Block);
        let idx = resolve(server_pid, listener).unwrap();
        assert_eq!(lookup(idx).unwrap().lock().backlog.len(), 1);

        // Accepting the first frees the backlog for the second's retry.
        match accept(13, server_pid, listener).unwrap() {
            OpOutcome::Done(_) => {}
            OpOutcome::Block => panic!("one connection is pending"),
        }
        assert_eq!(connect(12, server_pid, c2, &addr).unwrap(), OpOutcome::Block);
        assert_eq!(lookup(idx).unwrap().lock().backlog.len(), 1);
    }

    #[test]
    fn close_releases_slot_and_signals_peer() {
        let (server_pid, accepted, client_pid, client) = connected_pair(b"/run/close.sock");
        close(client_pid, client).unwrap();

        // The descriptor number is gone from the process.
        assert_eq!(resolve(client_pid, client).unwrap_err(), Errno::EBADF);
        // The surviving side lost its peer and reads end-of-stream.
        let idx = resolve(server_pid, accepted).unwrap();
        assert_eq!(lookup(idx).unwrap().lock().peer, None);
        match recv_msg(2, server_pid, accepted, 8, 0).unwrap() {
            RecvOutcome::Data(d) => assert!(d.is_empty()),
            RecvOutcome::Block => panic!("closed peer means EOF"),
        }
    }

    #[test]
    fn table_capacity_is_enforced_without_corruption() {
        let mut t = SocketTable::with_capacity(2);
        let (a, _) = t.register(1, SOCK_STREAM, 0, 0).unwrap();
        let (b, _) = t.register(1, SOCK_STREAM, 0, 0).unwrap();
        assert_eq!(t.register(1, SOCK_STREAM, 0, 0).unwrap_err(), Errno::ENFILE);
        assert_eq!(t.count(), 2);

        t.unregister(a);
        let (c, _) = t.register(1, SOCK_STREAM, 0, 0).unwrap();
        assert_eq!(c, a, "freed slot is reused");
        assert_ne!(b, c);
    }

    #[test]
    fn dgram_connect_records_peer_without_backlog() {
        let pid = setup();
        let server = mk_socket(pid, SOCK_DGRAM);
        let addr = SocketAddress::local(b"/run/dgram.sock").unwrap();
        bind(pid, server, addr.clone()).unwrap();
        listen(pid, server, 4).unwrap();

        let client = mk_socket(pid, SOCK_DGRAM);
        assert_eq!(connect(1, pid, client, &addr).unwrap(), OpOutcome::Done(0));

        send_msg(1, pid, client, b"dg", 0).unwrap();
        let sidx = resolve(pid, server).unwrap();
        assert_eq!(lookup(sidx).unwrap().lock().inbound_count(), 1);
    }
}
