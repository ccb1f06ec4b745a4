// Process structure and the per-process I/O descriptor table.

use crate::config::IO_MAX;
use crate::error::Errno;
use crate::task::signal::SignalAction;
use crate::task::{Pid, Tid};
use alloc::string::String;
use alloc::vec::Vec;

/// What an I/O slot's payload refers to. Payloads are table keys, never
/// pointers: sockets carry their global index, server files the handle the
/// server returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    Socket,
    ServerFile,
}

#[derive(Debug, Clone, Copy)]
pub struct IoSlot {
    pub valid: bool,
    pub kind: IoKind,
    pub flags: u32,
    pub payload: u64,
    /// Local file offset for server files; lseek adjusts it inline.
    pub offset: u64,
}

pub struct IoTable {
    slots: Vec<Option<IoSlot>>,
}

impl IoTable {
    pub fn new() -> Self {
        Self {
            slots: alloc::vec![None; IO_MAX],
        }
    }

    /// Install into the first free slot and return its descriptor number.
    pub fn alloc(&mut self, kind: IoKind, flags: u32, payload: u64) -> Result<i32, Errno> {
        for (fd, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(IoSlot {
                    valid: true,
                    kind,
                    flags,
                    payload,
                    offset: 0,
                });
                return Ok(fd as i32);
            }
        }
        Err(Errno::EMFILE)
    }

    pub fn get(&self, fd: i32) -> Result<&IoSlot, Errno> {
        if fd < 0 || fd as usize >= self.slots.len() {
            return Err(Errno::EBADF);
        }
        self.slots[fd as usize].as_ref().ok_or(Errno::EBADF)
    }

    pub fn get_mut(&mut self, fd: i32) -> Result<&mut IoSlot, Errno> {
        if fd < 0 || fd as usize >= self.slots.len() {
            return Err(Errno::EBADF);
        }
        self.slots[fd as usize].as_mut().ok_or(Errno::EBADF)
    }

    pub fn close(&mut self, fd: i32) -> Result<IoSlot, Errno> {
        if fd < 0 || fd as usize >= self.slots.len() {
            return Err(Errno::EBADF);
        }
        self.slots[fd as usize].take().ok_or(Errno::EBADF)
    }

    pub fn iter(&self) -> impl Iterator<Item = (i32, &IoSlot)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(fd, s)| s.as_ref().map(|slot| (fd as i32, slot)))
    }
}

impl Clone for IoTable {
    fn clone(&self) -> Self {
        Self {
            slots: self.slots.clone(),
        }
    }
}

pub struct Process {
    pub pid: Pid,
    pub ppid: Pid,
    pub uid: u32,
    pub gid: u32,
    pub euid: u32,
    pub egid: u32,
    pub umask: u32,
    pub cwd: String,
    pub io: IoTable,
    pub threads: Vec<Tid>,
    pub sigactions: [SignalAction; 32],
}

impl Process {
    pub fn new(pid: Pid, ppid: Pid) -> Self {
        Self {
            pid,
            ppid,
            uid: 0,
            gid: 0,
            euid: 0,
            egid: 0,
            umask: 0o022,
            cwd: String::from("/"),
            io: IoTable::new(),
            threads: Vec::new(),
            sigactions: [SignalAction::Default; 32],
        }
    }

    /// Child copy for fork: credentials, cwd, umask, descriptor table and
    /// signal dispositions carry over; the thread set starts empty.
    pub fn fork_from(&self, child_pid: Pid) -> Self {
        Self {
            pid: child_pid,
            ppid: self.pid,
            uid: self.uid,
            gid: self.gid,
            euid: self.euid,
            egid: self.egid,
            umask: self.umask,
            cwd: self.cwd.clone(),
            io: self.io.clone(),
            threads: Vec::new(),
            sigactions: self.sigactions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_table_allocates_first_free_slot() {
        let mut io = IoTable::new();
        let a = io.alloc(IoKind::Socket, 0, 10).unwrap();
        let b = io.alloc(IoKind::Socket, 0, 11).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 1);

        io.close(a).unwrap();
        let c = io.alloc(IoKind::ServerFile, 0, 12).unwrap();
        assert_eq!(c, 0, "freed slot is reused first");
        assert_eq!(io.get(c).unwrap().kind, IoKind::ServerFile);
    }

    #[test]
    fn bad_descriptors_are_rejected() {
        let mut io = IoTable::new();
        assert_eq!(io.get(-1).unwrap_err(), Errno::EBADF);
        assert_eq!(io.get(0).unwrap_err(), Errno::EBADF);
        assert_eq!(io.close(7).unwrap_err(), Errno::EBADF);
        assert_eq!(io.get(IO_MAX as i32).unwrap_err(), Errno::EBADF);
    }

    #[test]
    fn table_fills_up_at_io_max() {
        let mut io = IoTable::new();
        for _ in 0..IO_MAX {
            io.alloc(IoKind::Socket, 0, 0).unwrap();
        }
        assert_eq!(io.alloc(IoKind::Socket, 0, 0).unwrap_err(), Errno::EMFILE);
    }

    #[test]
    fn fork_copies_io_table() {
        let mut parent = Process::new(2, 1);
        parent.io.alloc(IoKind::Socket, 0, 33).unwrap();
        let child = parent.fork_from(5);
        assert_eq!(child.ppid, 2);
        assert_eq!(child.io.get(0).unwrap().payload, 33);
        assert!(child.threads.is_empty());
    }
}
