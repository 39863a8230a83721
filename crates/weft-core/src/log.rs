//! Leveled stderr logging
//!
//! Small hand-rolled logger: one locked write per line, level filtered by the
//! `WEFT_LOG` environment variable (off, error, warn, info, debug, trace).
//! Log output is diagnostic only and not part of any stable contract.

use std::io::Write;
use std::sync::OnceLock;

/// Log levels, lowest to highest verbosity
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl Level {
    fn tag(self) -> &'static str {
        match self {
            Level::Off => "",
            Level::Error => "ERROR",
            Level::Warn => "WARN ",
            Level::Info => "INFO ",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }

    fn parse(s: &str) -> Level {
        match s.to_lowercase().as_str() {
            "off" | "0" => Level::Off,
            "error" | "1" => Level::Error,
            "warn" | "2" => Level::Warn,
            "info" | "3" => Level::Info,
            "debug" | "4" => Level::Debug,
            "trace" | "5" => Level::Trace,
            _ => Level::Info,
        }
    }
}

static MAX_LEVEL: OnceLock<Level> = OnceLock::new();

/// The configured maximum level, read from `WEFT_LOG` on first use
#[inline]
pub fn max_level() -> Level {
    *MAX_LEVEL.get_or_init(|| {
        std::env::var("WEFT_LOG")
            .map(|v| Level::parse(&v))
            .unwrap_or(Level::Info)
    })
}

/// Check if a level is enabled
#[inline]
pub fn enabled(level: Level) -> bool {
    level <= max_level()
}

/// Internal: format and write one log line under the stderr lock
#[doc(hidden)]
pub fn _emit(level: Level, args: core::fmt::Arguments<'_>) {
    if !enabled(level) {
        return;
    }
    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    let _ = writeln!(handle, "[weft][{}] {}", level.tag(), args);
}

/// Error level log
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::log::_emit($crate::log::Level::Error, format_args!($($arg)*))
    };
}

/// Warning level log
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::log::_emit($crate::log::Level::Warn, format_args!($($arg)*))
    };
}

/// Info level log
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::log::_emit($crate::log::Level::Info, format_args!($($arg)*))
    };
}

/// Debug level log
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::log::_emit($crate::log::Level::Debug, format_args!($($arg)*))
    };
}

/// Trace level log (most verbose)
#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => {
        $crate::log::_emit($crate::log::Level::Trace, format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(Level::Error < Level::Warn);
        assert!(Level::Warn < Level::Info);
        assert!(Level::Info < Level::Debug);
        assert!(Level::Debug < Level::Trace);
    }

    #[test]
    fn test_level_parse() {
        assert_eq!(Level::parse("off"), Level::Off);
        assert_eq!(Level::parse("ERROR"), Level::Error);
        assert_eq!(Level::parse("4"), Level::Debug);
        assert_eq!(Level::parse("garbage"), Level::Info);
    }

    #[test]
    fn test_macros_compile() {
        log_error!("error {}", "msg");
        log_warn!("warn");
        log_info!("info {}", 42);
        log_debug!("debug");
        log_trace!("trace");
    }
}
