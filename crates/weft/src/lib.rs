//! # weft - fibers woven onto threads
//!
//! An N:M user-space task scheduler: stackful fibers multiplexed onto a
//! small pool of OS worker threads, with an integrated epoll readiness
//! reactor that parks fibers on file-descriptor events.
//!
//! ## Quick start
//!
//! ```no_run
//! use weft::{IoEvent, IoManager};
//!
//! let iom = IoManager::new(2, false, "app");
//!
//! iom.spawn(|| {
//!     println!("hello from fiber {}", weft::current_fiber_id());
//!     weft::yield_now();
//!     println!("back again");
//! });
//!
//! // Park a callback on fd readiness (one-shot, edge-triggered):
//! // iom.add_event_with(fd, IoEvent::Read, || { /* fd became readable */ });
//!
//! iom.stop();
//! ```
//!
//! ## Architecture
//!
//! ```text
//!  spawn()/schedule()          add_event()
//!        │                         │
//!        ▼                         ▼
//!  ┌───────────────┐      ┌─────────────────┐
//!  │  FIFO queue    │      │  fd-context     │
//!  │  (one, shared) │      │  table (epoll)  │
//!  └──────┬────────┘      └──────┬──────────┘
//!         │  dequeue + resume      │  readiness → re-schedule
//!    ┌────┴────┐  ┌─────────┐  ┌──┴──────┐
//!    │ worker  │  │ worker  │  │ idle     │
//!    │ thread  │  │ thread  │  │ fibers   │──── self-pipe tickle
//!    └─────────┘  └─────────┘  └─────────┘
//! ```
//!
//! Fibers are cooperative: a fiber runs until it yields or returns. Yield
//! always switches back to the worker's dispatch fiber, never to an
//! arbitrary peer.

// Re-export core types
pub use weft_core::{FiberId, FiberState, SchedError, SchedResult};

// Re-export logging macros and env helpers
pub use weft_core::env::{env_get, env_get_bool};
pub use weft_core::{log_debug, log_error, log_info, log_trace, log_warn};

// Re-export runtime types
pub use weft_runtime::fiber::Fiber;
pub use weft_runtime::io::{IoEvent, IoManager};
pub use weft_runtime::scheduler::{Dispatch, Scheduler, Task};
pub use weft_runtime::config;

/// Yield the current fiber back to its dispatch anchor.
///
/// Outside any fiber this degrades to an OS thread yield.
#[inline]
pub fn yield_now() {
    weft_runtime::fiber::yield_now();
}

/// Id of the fiber running on this thread, or 0 when none exists yet
#[inline]
pub fn current_fiber_id() -> u64 {
    weft_runtime::fiber::current_id()
}

/// Number of live fibers across the process
#[inline]
pub fn fiber_count() -> u64 {
    Fiber::total_count()
}
