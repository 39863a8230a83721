//! # weft-runtime
//!
//! Platform-specific runtime for the weft fiber scheduler.
//!
//! This crate provides:
//! - Stack allocation for fibers (process heap)
//! - Context switching (architecture-specific assembly)
//! - Thread-local anchors (current fiber, thread-main fiber, scheduler)
//! - The N:M cooperative scheduler with a shared FIFO task queue
//! - The epoll readiness reactor that parks fibers on fd events

pub mod arch;
pub mod config;
pub mod fiber;
pub mod io;
pub mod scheduler;
pub mod stack;
pub mod thread;
pub mod tls;

// Re-exports
pub use fiber::Fiber;
pub use io::{IoEvent, IoManager};
pub use scheduler::{Dispatch, Scheduler, Task};

// Architecture detection
cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub use arch::x86_64 as current_arch;
    } else if #[cfg(target_arch = "aarch64")] {
        pub use arch::aarch64 as current_arch;
    } else {
        compile_error!("Unsupported architecture");
    }
}

#[cfg(not(target_os = "linux"))]
compile_error!("the readiness reactor requires Linux (epoll)");
