// Kernel error handling and errno definitions.

/// Internal kernel error conditions, mapped onto errnos at the syscall edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    OutOfMemory,
    InvalidArgument,
    PermissionDenied,
    NotFound,
    AlreadyExists,
    IoError,
    Interrupted,
    WouldBlock,
    NotSupported,
    BadFileDescriptor,
    BadAddress,
    NotInitialized,
}

#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    EPERM = 1,       // Operation not permitted
    ENOENT = 2,      // No such file or directory
    ESRCH = 3,       // No such process
    EINTR = 4,       // Interrupted system call
    EIO = 5,         // I/O error
    ENOEXEC = 8,     // Exec format error
    EBADF = 9,       // Bad file descriptor
    ECHILD = 10,     // No child processes
    EAGAIN = 11,     // Try again / would block
    ENOMEM = 12,     // Out of memory
    EACCES = 13,     // Permission denied
    EFAULT = 14,     // Bad address
    EBUSY = 16,      // Device or resource busy
    EEXIST = 17,     // File exists
    EINVAL = 22,     // Invalid argument
    ENFILE = 23,     // Too many open files in system
    EMFILE = 24,     // Too many open files
    ESPIPE = 29,     // Illegal seek
    ENOSYS = 38,     // Function not implemented
    ENOTCONN = 107,  // Socket not connected
    EMSGSIZE = 90,   // Message too long
    ENOTSOCK = 88,   // Socket operation on non-socket
    EAFNOSUPPORT = 97, // Address family not supported
    EADDRINUSE = 98, // Address already in use
    EADDRNOTAVAIL = 99, // Cannot assign requested address
    ECONNREFUSED = 111, // Connection refused
}

impl From<KernelError> for Errno {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::OutOfMemory => Errno::ENOMEM,
            KernelError::InvalidArgument => Errno::EINVAL,
            KernelError::PermissionDenied => Errno::EACCES,
            KernelError::NotFound => Errno::ENOENT,
            KernelError::AlreadyExists => Errno::EEXIST,
            KernelError::IoError => Errno::EIO,
            KernelError::Interrupted => Errno::EINTR,
            KernelError::WouldBlock => Errno::EAGAIN,
            KernelError::NotSupported => Errno::ENOSYS,
            KernelError::BadFileDescriptor => Errno::EBADF,
            KernelError::BadAddress => Errno::EFAULT,
            KernelError::NotInitialized => Errno::EINVAL,
        }
    }
}

impl Errno {
    /// Negated value, the form syscall handlers hand back to user space.
    pub fn as_ret(self) -> i64 {
        -(self as i32 as i64)
    }

    pub fn description(self) -> &'static str {
        match self {
            Errno::EPERM => "Operation not permitted",
            Errno::ENOENT => "No such file or directory",
            Errno::ESRCH => "No such process",
            Errno::EINTR => "Interrupted system call",
            Errno::EIO => "I/O error",
            Errno::ENOEXEC => "Exec format error",
            Errno::EBADF => "Bad file descriptor",
            Errno::ECHILD => "No child processes",
            Errno::EAGAIN => "Try again",
            Errno::ENOMEM => "Out of memory",
            Errno::EACCES => "Permission denied",
            Errno::EFAULT => "Bad address",
            Errno::EBUSY => "Device or resource busy",
            Errno::EEXIST => "File exists",
            Errno::EINVAL => "Invalid argument",
            Errno::ENFILE => "Too many open files in system",
            Errno::EMFILE => "Too many open files",
            Errno::ESPIPE => "Illegal seek",
            Errno::ENOSYS => "Function not implemented",
            Errno::ENOTCONN => "Socket not connected",
            Errno::EMSGSIZE => "Message too long",
            Errno::ENOTSOCK => "Socket operation on non-socket",
            Errno::EAFNOSUPPORT => "Address family not supported",
            Errno::EADDRINUSE => "Address already in use",
            Errno::EADDRNOTAVAIL => "Cannot assign requested address",
            Errno::ECONNREFUSED => "Connection refused",
        }
    }
}

pub type Result<T> = core::result::Result<T, Errno>;
