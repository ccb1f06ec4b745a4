// Thread and process management.

pub mod exec;
pub mod process;
pub mod signal;
pub mod table;
pub mod thread;

pub use process::{IoKind, IoSlot, IoTable, Process};
pub use signal::{Signal, SignalAction};
pub use table::{
    alloc_pid, alloc_tid, kernel_pid, lumen_pid, processes, set_kernel_pid, set_lumen_pid,
    threads, with_process, with_thread,
};
pub use thread::{SyscallRequest, Thread, ThreadState};

pub type Tid = u32;
pub type Pid = u32;
