//! Error types for the weft scheduler

use core::fmt;

/// Result type for scheduler operations
pub type SchedResult<T> = Result<T, SchedError>;

/// Errors that can occur in scheduler and reactor operations.
///
/// Precondition violations (resuming a non-ready fiber, double-registering an
/// event, stopping from the wrong thread) are programmer errors and panic
/// instead of surfacing here. This enum covers the recoverable failures:
/// platform calls that legitimately fail at runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedError {
    /// A readiness registration syscall failed
    EpollCtl {
        /// The epoll_ctl operation name (ADD, MOD, DEL)
        op: &'static str,
        /// The file descriptor being registered
        fd: i32,
        /// The raw OS errno
        errno: i32,
    },

    /// Platform-specific error from some other call
    Platform {
        /// The failed call
        call: &'static str,
        /// The raw OS errno
        errno: i32,
    },
}

impl SchedError {
    /// Capture the current errno for a failed platform call
    pub fn last_os(call: &'static str) -> Self {
        SchedError::Platform {
            call,
            errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
        }
    }
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::EpollCtl { op, fd, errno } => write!(
                f,
                "epoll_ctl {} fd={} failed: {}",
                op,
                fd,
                std::io::Error::from_raw_os_error(*errno)
            ),
            SchedError::Platform { call, errno } => write!(
                f,
                "{} failed: {}",
                call,
                std::io::Error::from_raw_os_error(*errno)
            ),
        }
    }
}

impl std::error::Error for SchedError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = SchedError::EpollCtl {
            op: "ADD",
            fd: 7,
            errno: 2,
        };
        let msg = format!("{}", e);
        assert!(msg.contains("ADD"));
        assert!(msg.contains("fd=7"));
    }
}
