// System-call handling: ABI numbers, the global queue, the dispatch table
// and user-memory access.

pub mod dispatch;
pub mod numbers;
pub mod queue;
pub mod uaccess;

pub use queue::{syscall_handle, syscall_process, Disposition};
