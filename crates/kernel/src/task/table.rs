// Global thread and process tables.
//
// Stable integer-keyed slabs own every Thread and Process; all cross
// references elsewhere are Tids and Pids looked up here.

use crate::config::{MAX_PROCESSES, MAX_THREADS};
use crate::error::KernelError;
use crate::task::{Pid, Process, Thread, Tid};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::{Mutex, MutexGuard};

pub struct Slab<T> {
    entries: Vec<Option<Box<T>>>,
}

impl<T> Slab<T> {
    fn new(capacity: usize) -> Self {
        let mut entries = Vec::with_capacity(capacity);
        entries.resize_with(capacity, || None);
        Self { entries }
    }

    pub fn insert(&mut self, id: u32, value: T) -> Result<(), KernelError> {
        let idx = id as usize;
        if idx == 0 || idx >= self.entries.len() {
            return Err(KernelError::InvalidArgument);
        }
        if self.entries[idx].is_some() {
            return Err(KernelError::AlreadyExists);
        }
        self.entries[idx] = Some(Box::new(value));
        Ok(())
    }

    pub fn get(&self, id: u32) -> Option<&T> {
        self.entries.get(id as usize)?.as_deref()
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        self.entries.get_mut(id as usize)?.as_deref_mut()
    }

    pub fn remove(&mut self, id: u32) -> Option<T> {
        self.entries.get_mut(id as usize)?.take().map(|b| *b)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().filter_map(|e| e.as_deref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.entries.iter_mut().filter_map(|e| e.as_deref_mut())
    }

    pub fn count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }
}

pub type ThreadTable = Slab<Thread>;
pub type ProcessTable = Slab<Process>;

static THREADS: Mutex<Option<ThreadTable>> = Mutex::new(None);
static PROCESSES: Mutex<Option<ProcessTable>> = Mutex::new(None);

static NEXT_TID: AtomicU32 = AtomicU32::new(1);
static NEXT_PID: AtomicU32 = AtomicU32::new(1);

/// PID of the process owning all kernel threads, recorded by the worker.
static KERNEL_PID: AtomicU32 = AtomicU32::new(0);
/// PID of the user-space router, recorded once it is launched.
static LUMEN_PID: AtomicU32 = AtomicU32::new(0);

pub fn init_tables() {
    *THREADS.lock() = Some(Slab::new(MAX_THREADS));
    *PROCESSES.lock() = Some(Slab::new(MAX_PROCESSES));
    crate::info!(
        "task: tables ready ({} threads, {} processes)",
        MAX_THREADS,
        MAX_PROCESSES
    );
}

pub fn threads() -> MutexGuard<'static, Option<ThreadTable>> {
    THREADS.lock()
}

pub fn processes() -> MutexGuard<'static, Option<ProcessTable>> {
    PROCESSES.lock()
}

pub fn alloc_tid() -> Result<Tid, KernelError> {
    let tid = NEXT_TID.fetch_add(1, Ordering::SeqCst);
    if tid as usize >= MAX_THREADS {
        return Err(KernelError::OutOfMemory);
    }
    Ok(tid)
}

pub fn alloc_pid() -> Result<Pid, KernelError> {
    let pid = NEXT_PID.fetch_add(1, Ordering::SeqCst);
    if pid as usize >= MAX_PROCESSES {
        return Err(KernelError::OutOfMemory);
    }
    Ok(pid)
}

pub fn with_thread<R>(tid: Tid, f: impl FnOnce(&mut Thread) -> R) -> Option<R> {
    let mut guard = threads();
    let table = guard.as_mut()?;
    table.get_mut(tid).map(f)
}

pub fn with_process<R>(pid: Pid, f: impl FnOnce(&mut Process) -> R) -> Option<R> {
    let mut guard = processes();
    let table = guard.as_mut()?;
    table.get_mut(pid).map(f)
}

pub fn set_kernel_pid(pid: Pid) {
    KERNEL_PID.store(pid, Ordering::Release);
}

pub fn kernel_pid() -> Pid {
    KERNEL_PID.load(Ordering::Acquire)
}

pub fn set_lumen_pid(pid: Pid) {
    LUMEN_PID.store(pid, Ordering::Release);
}

pub fn lumen_pid() -> Pid {
    LUMEN_PID.load(Ordering::Acquire)
}

/// Allocate a process under `ppid` and insert it.
pub fn create_process(ppid: Pid) -> Result<Pid, KernelError> {
    let pid = alloc_pid()?;
    let process = Process::new(pid, ppid);
    let mut guard = processes();
    let table = guard.as_mut().ok_or(KernelError::NotInitialized)?;
    table.insert(pid, process)?;
    Ok(pid)
}

/// Insert a fully built thread and link it to its process.
pub fn insert_thread(thread: Thread) -> Result<Tid, KernelError> {
    let tid = thread.tid;
    let pid = thread.pid;
    {
        let mut guard = threads();
        let table = guard.as_mut().ok_or(KernelError::NotInitialized)?;
        table.insert(tid, thread)?;
    }
    with_process(pid, |p| p.threads.push(tid));
    Ok(tid)
}

#[cfg(test)]
pub fn ensure_test_tables() {
    use spin::Once;
    static INIT: Once<()> = Once::new();
    INIT.call_once(init_tables);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::context::{create_context, PrivilegeLevel};

    fn setup() {
        crate::mem::ensure_test_init();
        ensure_test_tables();
    }

    #[test]
    fn process_lifecycle() {
        setup();
        let pid = create_process(1).unwrap();
        assert!(with_process(pid, |p| p.ppid).is_some());
        let removed = processes().as_mut().unwrap().remove(pid);
        assert!(removed.is_some());
        assert!(with_process(pid, |_| ()).is_none());
    }

    #[test]
    fn thread_insert_links_to_process() {
        setup();
        let pid = create_process(1).unwrap();
        let ctx = create_context(PrivilegeLevel::User, 0, 0).unwrap();
        let tid = alloc_tid().unwrap();
        insert_thread(Thread::new(tid, pid, ctx, 1)).unwrap();

        assert_eq!(with_thread(tid, |t| t.pid), Some(pid));
        assert!(with_process(pid, |p| p.threads.contains(&tid)).unwrap());
    }

    #[test]
    fn ids_are_unique_and_positive() {
        setup();
        let a = alloc_tid().unwrap();
        let b = alloc_tid().unwrap();
        assert!(a > 0 && b > a);
    }
}
