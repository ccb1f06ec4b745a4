// Kernel logging (printk) with ring buffer.
//
// Every record lands in an in-memory ring; ERROR and WARN are additionally
// pushed to the console sink right away so boot failures are visible even if
// the ring is never drained.

use crate::ringbuf::RingBuffer;
use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};
use spin::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

/// Global log level; records above this level are dropped at the macro edge.
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

pub fn set_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn get_level() -> LogLevel {
    match LOG_LEVEL.load(Ordering::Relaxed) {
        0 => LogLevel::Error,
        1 => LogLevel::Warn,
        2 => LogLevel::Info,
        _ => LogLevel::Debug,
    }
}

#[inline]
pub fn is_enabled(level: LogLevel) -> bool {
    level <= get_level()
}

pub const LOG_MSG_MAX: usize = 192;

#[derive(Clone, Copy)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: [u8; LOG_MSG_MAX],
    pub len: usize,
}

impl LogEntry {
    pub fn text(&self) -> &str {
        core::str::from_utf8(&self.message[..self.len]).unwrap_or("<bad utf8>")
    }
}

static KERNEL_LOG: Mutex<RingBuffer<LogEntry, 1024>> = Mutex::new(RingBuffer::new());

/// Console sink installed by the platform (serial on bare metal).
static CONSOLE: Mutex<Option<fn(&str)>> = Mutex::new(None);

pub fn set_console(sink: fn(&str)) {
    *CONSOLE.lock() = Some(sink);
}

struct FixedWriter {
    buf: [u8; LOG_MSG_MAX],
    len: usize,
}

impl fmt::Write for FixedWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = LOG_MSG_MAX - self.len;
        let take = s.len().min(room);
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

pub fn log(level: LogLevel, args: fmt::Arguments) {
    if !is_enabled(level) {
        return;
    }

    let mut writer = FixedWriter {
        buf: [0u8; LOG_MSG_MAX],
        len: 0,
    };
    let _ = fmt::Write::write_fmt(&mut writer, args);

    let entry = LogEntry {
        level,
        message: writer.buf,
        len: writer.len,
    };
    KERNEL_LOG.lock().push(entry);

    if level <= LogLevel::Warn {
        if let Some(sink) = *CONSOLE.lock() {
            sink(level.as_str());
            sink(": ");
            sink(entry.text());
            sink("\n");
        }
    }
}

/// Drain the ring; used by dmesg-style consumers and by tests.
pub fn drain() -> alloc::vec::Vec<LogEntry> {
    KERNEL_LOG.lock().drain_all()
}

#[macro_export]
macro_rules! printk {
    ($level:expr, $($arg:tt)*) => {
        $crate::log::log($level, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::printk!($crate::log::LogLevel::Error, $($arg)*)
    };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::printk!($crate::log::LogLevel::Warn, $($arg)*)
    };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::printk!($crate::log::LogLevel::Info, $($arg)*)
    };
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::printk!($crate::log::LogLevel::Debug, $($arg)*)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_keeps_formatted_records() {
        drain();
        crate::info!("thread {} ready", 7);
        crate::error!("lumen not present");
        let entries = drain();
        assert!(entries.iter().any(|e| e.text() == "thread 7 ready"));
        assert!(entries
            .iter()
            .any(|e| e.level == LogLevel::Error && e.text() == "lumen not present"));
    }

    #[test]
    fn level_gate_drops_debug_by_default() {
        set_level(LogLevel::Info);
        drain();
        crate::debug!("invisible");
        assert!(drain().iter().all(|e| e.text() != "invisible"));
    }
}
