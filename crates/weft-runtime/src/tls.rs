//! Thread-local anchors for fiber switching
//!
//! Three anchors per thread pivot every context switch:
//! - the fiber currently executing here (raw pointer; the strong handle is
//!   held by the frame that resumed it)
//! - the thread's main fiber (strong handle, lives as long as the thread)
//! - the dispatch fiber of this thread's scheduler loop (raw pointer; the
//!   strong handle is held by the loop itself)
//!
//! A fourth slot records which scheduler this thread works for.

use std::cell::{Cell, RefCell};
use std::ptr;
use std::sync::{Arc, Weak};

use crate::fiber::Fiber;
use crate::scheduler::{Dispatch, Scheduler};

thread_local! {
    static CURRENT_FIBER: Cell<*const Fiber> = const { Cell::new(ptr::null()) };

    static THREAD_MAIN: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    static DISPATCH_FIBER: Cell<*const Fiber> = const { Cell::new(ptr::null()) };

    static SCHEDULER: RefCell<Option<(Weak<dyn Dispatch>, *const Scheduler)>> =
        const { RefCell::new(None) };
}

/// Fiber currently executing on this thread, or null
#[inline]
pub fn current_fiber() -> *const Fiber {
    CURRENT_FIBER.with(|cell| cell.get())
}

/// Install the currently executing fiber
#[inline]
pub fn set_current_fiber(fiber: *const Fiber) {
    CURRENT_FIBER.with(|cell| cell.set(fiber));
}

/// Clear the current-fiber anchor if it still points at `fiber`.
///
/// Tolerates thread teardown, where the slot may already be gone.
pub fn clear_current_if(fiber: *const Fiber) {
    let _ = CURRENT_FIBER.try_with(|cell| {
        if ptr::eq(cell.get(), fiber) {
            cell.set(ptr::null());
        }
    });
}

/// The thread's main fiber, or null if `Fiber::current` was never called here
#[inline]
pub fn thread_main() -> *const Fiber {
    THREAD_MAIN.with(|slot| {
        slot.borrow()
            .as_ref()
            .map_or(ptr::null(), |f| Arc::as_ptr(f))
    })
}

/// Install the thread's main fiber; keeps it alive for the thread's lifetime
pub fn set_thread_main(fiber: Arc<Fiber>) {
    THREAD_MAIN.with(|slot| {
        *slot.borrow_mut() = Some(fiber);
    });
}

/// Dispatch fiber of this thread's scheduler loop, or null
#[inline]
pub fn dispatch_fiber() -> *const Fiber {
    DISPATCH_FIBER.with(|cell| cell.get())
}

/// Install the dispatch fiber anchor for the lifetime of a dispatch loop
#[inline]
pub fn set_dispatch_fiber(fiber: *const Fiber) {
    DISPATCH_FIBER.with(|cell| cell.set(fiber));
}

/// Clear the dispatch fiber anchor when a dispatch loop exits
#[inline]
pub fn clear_dispatch_fiber() {
    DISPATCH_FIBER.with(|cell| cell.set(ptr::null()));
}

/// The scheduler this thread works for, if any
pub fn current_scheduler() -> Option<Weak<dyn Dispatch>> {
    SCHEDULER.with(|slot| slot.borrow().as_ref().map(|(w, _)| w.clone()))
}

/// Identity of this thread's scheduler (base address), or null
pub fn scheduler_identity() -> *const Scheduler {
    SCHEDULER.with(|slot| {
        slot.borrow()
            .as_ref()
            .map_or(ptr::null(), |(_, identity)| *identity)
    })
}

/// Register this thread as a worker of the given scheduler
pub fn set_scheduler(hooks: Weak<dyn Dispatch>, identity: *const Scheduler) {
    SCHEDULER.with(|slot| {
        *slot.borrow_mut() = Some((hooks, identity));
    });
}

/// Forget the scheduler association if it still names `identity`
pub fn clear_scheduler_if(identity: *const Scheduler) {
    let _ = SCHEDULER.try_with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.as_ref().is_some_and(|(_, id)| ptr::eq(*id, identity)) {
            *slot = None;
        }
    });
}
