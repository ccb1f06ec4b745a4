// Per-CPU kernel state.
//
// One cell per CPU: the currently dispatched thread and process, the active
// address-space root, and the task state holding the effective I/O-port
// bitmap. Cells are only written by their owning CPU or under the scheduler
// lock.

use crate::config::MAX_CPUS;
use crate::platform::ioport::IoPortBitmap;
use crate::task::{Pid, Tid};
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use spin::Mutex;

/// Per-CPU task state: the I/O-port permissions the hardware consults.
pub struct TaskState {
    pub iopb: IoPortBitmap,
}

pub struct KernelCpuInfo {
    current_tid: AtomicU32,
    current_pid: AtomicU32,
    active_root: AtomicU64,
    need_resched: AtomicBool,
    /// IRQ-enabled mirror for builds without a real IRQ gate.
    irq_enabled: AtomicBool,
    task_state: Mutex<TaskState>,
}

impl KernelCpuInfo {
    const fn new() -> Self {
        Self {
            current_tid: AtomicU32::new(0),
            current_pid: AtomicU32::new(0),
            active_root: AtomicU64::new(0),
            need_resched: AtomicBool::new(false),
            irq_enabled: AtomicBool::new(true),
            task_state: Mutex::new(TaskState {
                iopb: IoPortBitmap::deny_all(),
            }),
        }
    }

    pub fn current_tid(&self) -> Option<Tid> {
        match self.current_tid.load(Ordering::Acquire) {
            0 => None,
            tid => Some(tid),
        }
    }

    pub fn set_current(&self, tid: Tid, pid: Pid) {
        self.current_tid.store(tid, Ordering::Release);
        self.current_pid.store(pid, Ordering::Release);
    }

    pub fn clear_current(&self) {
        self.current_tid.store(0, Ordering::Release);
        self.current_pid.store(0, Ordering::Release);
    }

    pub fn current_pid(&self) -> Option<Pid> {
        match self.current_pid.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }

    pub fn active_root(&self) -> u64 {
        self.active_root.load(Ordering::Acquire)
    }

    pub fn set_active_root(&self, root: u64) {
        self.active_root.store(root, Ordering::Release);
    }

    pub fn set_need_resched(&self, v: bool) {
        self.need_resched.store(v, Ordering::Release);
    }

    pub fn take_need_resched(&self) -> bool {
        self.need_resched.swap(false, Ordering::AcqRel)
    }

    /// Copy a thread's bitmap into the task state. Called on context switch
    /// when either the outgoing or incoming thread had custom permissions.
    pub fn load_io_bitmap(&self, iopb: &IoPortBitmap) {
        self.task_state.lock().iopb.copy_from(iopb);
    }

    pub fn io_port_allowed(&self, port: u16) -> bool {
        self.task_state.lock().iopb.is_allowed(port)
    }

    pub fn irq_mirror_save(&self) -> bool {
        self.irq_enabled.swap(false, Ordering::AcqRel)
    }

    pub fn irq_mirror_restore(&self, enabled: bool) {
        self.irq_enabled.store(enabled, Ordering::Release);
    }

    pub fn irqs_enabled(&self) -> bool {
        self.irq_enabled.load(Ordering::Acquire)
    }
}

static CPUS: [KernelCpuInfo; MAX_CPUS] = [const { KernelCpuInfo::new() }; MAX_CPUS];

pub fn get(cpu_id: usize) -> &'static KernelCpuInfo {
    &CPUS[cpu_id % MAX_CPUS]
}

pub fn current() -> &'static KernelCpuInfo {
    get(crate::platform::current_cpu_id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_thread_bookkeeping() {
        let _g = crate::tests_lock();
        let cpu = get(MAX_CPUS - 1);
        cpu.clear_current();
        assert_eq!(cpu.current_tid(), None);
        cpu.set_current(5, 3);
        assert_eq!(cpu.current_tid(), Some(5));
        assert_eq!(cpu.current_pid(), Some(3));
        cpu.clear_current();
        assert_eq!(cpu.current_tid(), None);
    }

    #[test]
    fn io_bitmap_copy_on_switch() {
        let _g = crate::tests_lock();
        let cpu = get(MAX_CPUS - 2);
        cpu.load_io_bitmap(&IoPortBitmap::deny_all());
        assert!(!cpu.io_port_allowed(0x60));

        let mut iopb = IoPortBitmap::deny_all();
        iopb.allow(0x60);
        cpu.load_io_bitmap(&iopb);
        assert!(cpu.io_port_allowed(0x60));

        cpu.load_io_bitmap(&IoPortBitmap::deny_all());
        assert!(!cpu.io_port_allowed(0x60));
    }
}
