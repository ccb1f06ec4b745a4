// Server gateway: kernel <-> user-space server messaging.
//
// File and network syscalls are marshalled into framed messages and relayed
// over the kernel's well-known socket to the lumen router (or, for sd > 0,
// over a connection the process established itself). The caller blocks; the
// reply is matched by id and completes the original request through the
// syscall queue.

use crate::config::SOCK_BACKLOG_DEFAULT;
use crate::error::Errno;
use crate::socket::{self, SocketAddress, SOCK_SEQPACKET};
use crate::syscall::uaccess;
use crate::task::{table, Pid, ThreadState, Tid};
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

/// Address of the kernel's listening socket; lumen connects here at boot.
pub const KERNEL_SOCKET_PATH: &[u8] = b"/kernel";

/// Fixed little-endian wire header; `length` is the total message size
/// including this header. `id` is echoed by the server, `response` set to 1
/// on replies, `requester` carries the requesting PID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub command: u16,
    pub length: u16,
    pub id: u64,
    pub response: u8,
    pub requester: u64,
}

impl MessageHeader {
    pub const LEN: usize = 21;

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[0..2].copy_from_slice(&self.command.to_le_bytes());
        out[2..4].copy_from_slice(&self.length.to_le_bytes());
        out[4..12].copy_from_slice(&self.id.to_le_bytes());
        out[12] = self.response;
        out[13..21].copy_from_slice(&self.requester.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::LEN {
            return None;
        }
        Some(Self {
            command: u16::from_le_bytes([bytes[0], bytes[1]]),
            length: u16::from_le_bytes([bytes[2], bytes[3]]),
            id: u64::from_le_bytes(bytes[4..12].try_into().ok()?),
            response: bytes[12],
            requester: u64::from_le_bytes(bytes[13..21].try_into().ok()?),
        })
    }
}

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Mount = 1,
    Stat = 2,
    Open = 3,
    Read = 4,
    Write = 5,
    Chown = 6,
    Chmod = 7,
}

impl Command {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            1 => Some(Command::Mount),
            2 => Some(Command::Stat),
            3 => Some(Command::Open),
            4 => Some(Command::Read),
            5 => Some(Command::Write),
            6 => Some(Command::Chown),
            7 => Some(Command::Chmod),
            _ => None,
        }
    }
}

fn frame(command: Command, id: u64, requester: Pid, payload: &[u8]) -> Vec<u8> {
    let total = MessageHeader::LEN + payload.len();
    let header = MessageHeader {
        command: command as u16,
        length: total as u16,
        id,
        response: 0,
        requester: requester as u64,
    };
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(payload);
    out
}

pub fn build_open(id: u64, requester: Pid, flags: u32, mode: u32, path: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(8 + path.len() + 1);
    payload.extend_from_slice(&flags.to_le_bytes());
    payload.extend_from_slice(&mode.to_le_bytes());
    payload.extend_from_slice(path.as_bytes());
    payload.push(0);
    frame(Command::Open, id, requester, &payload)
}

pub fn build_stat(id: u64, requester: Pid, path: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(path.len() + 1);
    payload.extend_from_slice(path.as_bytes());
    payload.push(0);
    frame(Command::Stat, id, requester, &payload)
}

pub fn build_mount(id: u64, requester: Pid, flags: u32, source: &str, target: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&flags.to_le_bytes());
    payload.extend_from_slice(source.as_bytes());
    payload.push(0);
    payload.extend_from_slice(target.as_bytes());
    payload.push(0);
    frame(Command::Mount, id, requester, &payload)
}

pub fn build_read(id: u64, requester: Pid, handle: u64, offset: u64, len: u64) -> Vec<u8> {
    let mut payload = Vec::with_capacity(24);
    payload.extend_from_slice(&handle.to_le_bytes());
    payload.extend_from_slice(&offset.to_le_bytes());
    payload.extend_from_slice(&len.to_le_bytes());
    frame(Command::Read, id, requester, &payload)
}

pub fn build_write(id: u64, requester: Pid, handle: u64, offset: u64, data: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(16 + data.len());
    payload.extend_from_slice(&handle.to_le_bytes());
    payload.extend_from_slice(&offset.to_le_bytes());
    payload.extend_from_slice(data);
    frame(Command::Write, id, requester, &payload)
}

pub fn build_chown(id: u64, requester: Pid, uid: u32, gid: u32, path: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&uid.to_le_bytes());
    payload.extend_from_slice(&gid.to_le_bytes());
    payload.extend_from_slice(path.as_bytes());
    payload.push(0);
    frame(Command::Chown, id, requester, &payload)
}

pub fn build_chmod(id: u64, requester: Pid, mode: u32, path: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&mode.to_le_bytes());
    payload.extend_from_slice(path.as_bytes());
    payload.push(0);
    frame(Command::Chmod, id, requester, &payload)
}

/// Build a reply frame echoing `id`, carrying `status` after the header.
pub fn build_reply(command: u16, id: u64, status: i64, data: &[u8]) -> Vec<u8> {
    let total = MessageHeader::LEN + 8 + data.len();
    let header = MessageHeader {
        command,
        length: total as u16,
        id,
        response: 1,
        requester: 0,
    };
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(&status.to_le_bytes());
    out.extend_from_slice(data);
    out
}

/// Split a reply into (header, status, data).
pub fn decode_reply(bytes: &[u8]) -> Option<(MessageHeader, i64, &[u8])> {
    let header = MessageHeader::decode(bytes)?;
    if header.response != 1 || bytes.len() < MessageHeader::LEN + 8 {
        return None;
    }
    let status = i64::from_le_bytes(bytes[MessageHeader::LEN..MessageHeader::LEN + 8].try_into().ok()?);
    Some((header, status, &bytes[MessageHeader::LEN + 8..]))
}

/// What to do with the reply besides writing `ret`.
#[derive(Debug, Clone, Copy)]
pub enum PendingKind {
    /// The status is the whole answer.
    Plain,
    /// Open: install a server-file descriptor holding the returned handle.
    Open { flags: u32 },
    /// Read: copy the reply data to the user buffer, advance the offset.
    Read { buf: u64, fd: i32 },
    /// Write: advance the offset.
    Write { fd: i32 },
}

struct Pending {
    tid: Tid,
    kind: PendingKind,
}

struct GatewayState {
    /// Kernel's listening socket index.
    kernel_sock: Option<u32>,
    /// Accepted connection to the lumen router.
    lumen_conn: Option<u32>,
}

static GATEWAY: Mutex<GatewayState> = Mutex::new(GatewayState {
    kernel_sock: None,
    lumen_conn: None,
});

static PENDING: Mutex<BTreeMap<u64, Pending>> = Mutex::new(BTreeMap::new());
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub fn alloc_request_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Create and bind the kernel's well-known listening socket.
pub fn server_init() -> Result<(), Errno> {
    let index = socket::kernel_socket(table::kernel_pid(), SOCK_SEQPACKET)?;
    socket::kernel_bind(index, SocketAddress::local(KERNEL_SOCKET_PATH)?)?;
    socket::kernel_listen(index, SOCK_BACKLOG_DEFAULT)?;
    GATEWAY.lock().kernel_sock = Some(index);
    crate::info!("server: kernel socket listening");
    Ok(())
}

/// Send a marshalled request towards a server and park the calling thread.
/// `sd` = 0 routes to lumen; a positive `sd` is the caller's own connection
/// to a specific server.
pub fn request_server(
    tid: Tid,
    pid: Pid,
    sd: i32,
    id: u64,
    kind: PendingKind,
    bytes: &[u8],
) -> Result<(), Errno> {
    let dest = if sd == 0 {
        GATEWAY.lock().lumen_conn.ok_or(Errno::ENOTCONN)?
    } else {
        socket::resolve_fd(pid, sd)?
    };

    PENDING.lock().insert(id, Pending { tid, kind });
    table::with_thread(tid, |t| t.state = ThreadState::Blocked);

    if let Err(e) = socket::kernel_send(dest, bytes) {
        PENDING.lock().remove(&id);
        return Err(e);
    }
    Ok(())
}

/// Only lumen and its immediate children may direct general requests at the
/// kernel.
fn general_request_allowed(pid: Pid) -> bool {
    let lumen = table::lumen_pid();
    if lumen == 0 {
        return false;
    }
    if pid == lumen {
        return true;
    }
    table::with_process(pid, |p| p.ppid == lumen).unwrap_or(false)
}

/// Complete one matched reply: write the status into the requester's slot
/// and push the request back through the queue so the dispatcher wakes it.
fn complete_reply(header: &MessageHeader, status: i64, data: &[u8]) {
    let Some(pending) = PENDING.lock().remove(&header.id) else {
        crate::warn!("server: reply for unknown id {}", header.id);
        return;
    };
    let tid = pending.tid;

    let mut ret = status;
    match pending.kind {
        PendingKind::Plain => {}
        PendingKind::Open { flags } => {
            if status >= 0 {
                let pid = table::with_thread(tid, |t| t.pid).unwrap_or(0);
                let fd = table::with_process(pid, |p| {
                    p.io
                        .alloc(crate::task::IoKind::ServerFile, flags, status as u64)
                });
                ret = match fd {
                    Some(Ok(fd)) => fd as i64,
                    Some(Err(e)) => e.as_ret(),
                    None => Errno::ESRCH.as_ret(),
                };
            }
        }
        PendingKind::Read { buf, fd } => {
            if status > 0 {
                let take = (status as usize).min(data.len());
                let copied = table::with_thread(tid, |t| {
                    uaccess::copy_to_user(t.ctx.root, buf, &data[..take])
                });
                match copied {
                    Some(Ok(())) => {
                        let pid = table::with_thread(tid, |t| t.pid).unwrap_or(0);
                        table::with_process(pid, |p| {
                            if let Ok(slot) = p.io.get_mut(fd) {
                                slot.offset += take as u64;
                            }
                        });
                        ret = take as i64;
                    }
                    _ => ret = Errno::EFAULT.as_ret(),
                }
            }
        }
        PendingKind::Write { fd } => {
            if status > 0 {
                let pid = table::with_thread(tid, |t| t.pid).unwrap_or(0);
                table::with_process(pid, |p| {
                    if let Ok(slot) = p.io.get_mut(fd) {
                        slot.offset += status as u64;
                    }
                });
            }
        }
    }

    table::with_thread(tid, |t| {
        t.request.ret = ret;
        t.request.unblock = true;
    });
    crate::syscall::queue::enqueue_request(tid);
}

/// Poll the reply socket: accept lumen's connection if it is pending, match
/// completed replies to their requests, answer or drop inbound requests.
/// Returns the number of messages handled.
pub fn server_idle() -> usize {
    let kernel_sock = {
        let state = GATEWAY.lock();
        match state.kernel_sock {
            Some(s) => s,
            None => return 0,
        }
    };

    if GATEWAY.lock().lumen_conn.is_none() {
        if let Some(conn) = socket::kernel_accept(kernel_sock) {
            GATEWAY.lock().lumen_conn = Some(conn);
            crate::info!("server: lumen router connected");
        }
    }

    let conn = match GATEWAY.lock().lumen_conn {
        Some(c) => c,
        None => return 0,
    };

    let mut handled = 0;
    while let Some(bytes) = socket::kernel_recv(conn) {
        handled += 1;
        let Some(header) = MessageHeader::decode(&bytes) else {
            crate::warn!("server: runt message ({} bytes) dropped", bytes.len());
            continue;
        };

        if header.response == 1 {
            if let Some((header, status, data)) = decode_reply(&bytes) {
                complete_reply(&header, status, data);
            }
            continue;
        }

        // Inbound general request: enforce the lumen-lineage boundary.
        if !general_request_allowed(header.requester as Pid) {
            crate::debug!(
                "server: dropping general request from pid {}",
                header.requester
            );
            continue;
        }
        // No kernel-intrinsic commands are served over this socket yet.
        let _ = socket::kernel_send(
            conn,
            &build_reply(header.command, header.id, Errno::ENOSYS.as_ret(), &[]),
        );
    }
    handled
}

#[cfg(test)]
pub fn reset_for_tests() {
    let mut state = GATEWAY.lock();
    state.kernel_sock = None;
    state.lumen_conn = None;
    PENDING.lock().clear();
}

#[cfg(test)]
pub fn pending_count() -> usize {
    PENDING.lock().len()
}
