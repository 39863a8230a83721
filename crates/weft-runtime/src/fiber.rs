//! Fiber: a suspendable unit of execution with its own stack
//!
//! A fiber is a stackful coroutine switched cooperatively: it runs until it
//! yields or its entry function returns. Switching is asymmetric: a fiber
//! always swaps with its thread's dispatch/main anchor, never with an
//! arbitrary peer, which keeps the switch topology a star.
//!
//! Lifecycle: READY on creation, RUNNING while resumed, READY again after a
//! yield, TERM once the entry returns. A TERM fiber's stack can be reused
//! through [`Fiber::reset`].

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use weft_core::context::SavedRegs;
use weft_core::id::FiberId;
use weft_core::state::FiberState;
use weft_core::{log_debug, log_trace};

use crate::config;
use crate::current_arch;
use crate::stack::Stack;
use crate::tls;

/// Boxed entry function of a fiber
pub type Entry = Box<dyn FnOnce() + Send + 'static>;

/// Process-global id counter; 0 is reserved for "no fiber"
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Live fibers across the process, main fibers included
static LIVE_COUNT: AtomicU64 = AtomicU64::new(0);

/// A stackful cooperative fiber.
///
/// Handles are shared (`Arc`): the scheduler queue, the resuming worker's
/// stack frame, and event slots in the reactor may all reference the same
/// fiber. Execution stays exclusive regardless: between READY and TERM a
/// fiber is only ever entered by the one worker that dequeued it.
pub struct Fiber {
    /// Unique id; survives `reset`, never recycled
    id: FiberId,

    /// Owned stack buffer; the thread's main fiber has none
    stack: Option<Stack>,

    /// Anchor selection: scheduled fibers swap with the dispatch fiber of
    /// the running worker, everything else (the caller's dispatch fiber,
    /// fibers on plain threads) swaps with the thread-main fiber
    scheduled: bool,

    /// Lifecycle state byte
    state: AtomicU8,

    /// Saved machine context
    regs: UnsafeCell<SavedRegs>,

    /// Entry function; consumed by the trampoline, replaced by `reset`
    entry: UnsafeCell<Option<Entry>>,
}

// Safety: `regs` and `entry` are only touched by the thread currently
// executing or resuming the fiber, and ownership of execution moves between
// threads only through the scheduler queue's mutex.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// The fiber currently executing on this thread.
    ///
    /// The first call on a thread creates its **main fiber**: no stack, no
    /// entry, born RUNNING, installed as both the current and thread-main
    /// anchor. Call this once before any other fiber API on a thread.
    pub fn current() -> Arc<Fiber> {
        let cur = tls::current_fiber();
        if !cur.is_null() {
            // Safety: the anchor is installed from a live Arc whose strong
            // handle outlives the fiber's time as "current".
            unsafe {
                Arc::increment_strong_count(cur);
                return Arc::from_raw(cur);
            }
        }

        let main = Arc::new(Fiber {
            id: FiberId::new(NEXT_ID.fetch_add(1, Ordering::Relaxed)),
            stack: None,
            scheduled: false,
            state: AtomicU8::new(FiberState::Running as u8),
            regs: UnsafeCell::new(SavedRegs::zeroed()),
            entry: UnsafeCell::new(None),
        });
        LIVE_COUNT.fetch_add(1, Ordering::Relaxed);
        log_debug!("fiber {} created (thread main)", main.id);

        tls::set_current_fiber(Arc::as_ptr(&main));
        tls::set_thread_main(main.clone());
        main
    }

    /// Create a fiber with its own stack, READY to be resumed.
    ///
    /// `stacksize == 0` uses the configured default.
    pub fn new<F>(f: F, stacksize: usize) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        Fiber::from_entry(Box::new(f), stacksize, true)
    }

    /// Like [`Fiber::new`] with an already-boxed entry
    pub(crate) fn from_boxed(entry: Entry, stacksize: usize) -> Arc<Fiber> {
        Fiber::from_entry(entry, stacksize, true)
    }

    /// The caller thread's dispatch fiber: swaps with the thread-main fiber
    /// instead of the dispatch anchor (it *is* the dispatch anchor)
    pub(crate) fn new_dispatch(entry: Entry) -> Arc<Fiber> {
        Fiber::from_entry(entry, 0, false)
    }

    fn from_entry(entry: Entry, stacksize: usize, scheduled: bool) -> Arc<Fiber> {
        let size = if stacksize != 0 {
            stacksize
        } else {
            config::stack_size()
        };
        let stack = Stack::alloc(size);
        let stack_top = stack.top();

        let fiber = Arc::new(Fiber {
            id: FiberId::new(NEXT_ID.fetch_add(1, Ordering::Relaxed)),
            stack: Some(stack),
            scheduled,
            state: AtomicU8::new(FiberState::Ready as u8),
            regs: UnsafeCell::new(SavedRegs::zeroed()),
            entry: UnsafeCell::new(Some(entry)),
        });
        LIVE_COUNT.fetch_add(1, Ordering::Relaxed);

        // Safety: regs and stack belong to the fiber we just built; nothing
        // else can observe them yet.
        unsafe {
            current_arch::init_context(fiber.regs.get(), stack_top, fiber_main as usize, 0);
        }
        log_debug!("fiber {} created (stack {} bytes)", fiber.id, size);
        fiber
    }

    /// Switch execution from this thread's anchor into the fiber.
    ///
    /// Returns when the fiber next yields or terminates. The fiber must be
    /// READY.
    pub fn resume(self: &Arc<Self>) {
        assert_eq!(
            self.state(),
            FiberState::Ready,
            "resume: fiber {} is {}",
            self.id,
            self.state()
        );
        let anchor = self.swap_anchor();
        assert!(
            !anchor.is_null(),
            "resume: Fiber::current() was never called on this thread"
        );
        assert!(
            !std::ptr::eq(anchor, Arc::as_ptr(self)),
            "resume: fiber {} cannot resume itself",
            self.id
        );

        tls::set_current_fiber(Arc::as_ptr(self));
        // RUNNING is published before the swap completes; only the owning
        // worker resumes a fiber, so the early store is unobservable.
        self.set_state(FiberState::Running);

        // Safety: the anchor fiber is alive (its handle is held by this
        // thread's TLS or dispatch loop) and suspended in this very call
        // chain, so its register block is ours to save into.
        unsafe {
            current_arch::switch_context((*anchor).regs.get(), self.regs.get());
        }
    }

    /// Give up execution and switch back to this thread's anchor.
    ///
    /// A RUNNING fiber is demoted to READY; the trampoline's terminal yield
    /// arrives here in TERM and stays TERM.
    pub fn yield_now(&self) {
        let st = self.state();
        assert!(
            st == FiberState::Running || st == FiberState::Term,
            "yield: fiber {} is {}",
            self.id,
            st
        );
        let anchor = self.swap_anchor();
        assert!(
            !anchor.is_null(),
            "yield: Fiber::current() was never called on this thread"
        );
        if std::ptr::eq(anchor, self as *const Fiber) {
            // A main fiber with nothing beneath it; yield the OS thread.
            std::thread::yield_now();
            return;
        }

        tls::set_current_fiber(anchor);
        if st != FiberState::Term {
            self.set_state(FiberState::Ready);
        }

        // Safety: as in resume, with the roles reversed.
        unsafe {
            current_arch::switch_context(self.regs.get(), (*anchor).regs.get());
        }
    }

    /// Rebuild a TERM fiber around a new entry, reusing its stack
    pub fn reset<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.reset_boxed(Box::new(f));
    }

    pub(crate) fn reset_boxed(&self, entry: Entry) {
        let stack = self
            .stack
            .as_ref()
            .expect("reset: fiber has no stack");
        assert_eq!(
            self.state(),
            FiberState::Term,
            "reset: fiber {} is {}",
            self.id,
            self.state()
        );
        // Safety: the fiber is TERM, so no thread is executing on its stack
        // and its context block is quiescent.
        unsafe {
            *self.entry.get() = Some(entry);
            current_arch::init_context(self.regs.get(), stack.top(), fiber_main as usize, 0);
        }
        self.set_state(FiberState::Ready);
    }

    /// The fiber's unique id
    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    /// Current lifecycle state
    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Number of live fibers across the process, main fibers included
    pub fn total_count() -> u64 {
        LIVE_COUNT.load(Ordering::Relaxed)
    }

    /// The fiber this one swaps with: the dispatch anchor for scheduled
    /// fibers (falling back to the thread-main fiber on threads without a
    /// dispatch loop), the thread-main fiber otherwise.
    fn swap_anchor(&self) -> *const Fiber {
        if self.scheduled {
            let dispatch = tls::dispatch_fiber();
            if !dispatch.is_null() {
                return dispatch;
            }
        }
        tls::thread_main()
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        LIVE_COUNT.fetch_sub(1, Ordering::Relaxed);
        if self.stack.is_some() {
            assert_eq!(
                self.state(),
                FiberState::Term,
                "fiber {} dropped in state {}",
                self.id,
                self.state()
            );
            log_trace!("fiber {} destroyed", self.id);
        } else {
            // Thread-main fiber, torn down with its thread.
            debug_assert!(unsafe { (*self.entry.get()).is_none() });
            tls::clear_current_if(self as *const Fiber);
        }
    }
}

/// Id of the fiber running on this thread, or 0 when none exists yet
pub fn current_id() -> u64 {
    let cur = tls::current_fiber();
    if cur.is_null() {
        0
    } else {
        // Safety: see Fiber::current.
        unsafe { (*cur).id().as_u64() }
    }
}

/// Yield the current fiber back to its anchor.
///
/// On a thread with no fibers beneath the main one this degrades to an OS
/// thread yield.
pub fn yield_now() {
    let cur = Fiber::current();
    cur.yield_now();
}

/// Entry point reached on a fiber's first resume and after each reset.
///
/// Obtains the shared handle through the current-fiber anchor, runs the
/// entry, clears it, marks TERM, drops the local handle (remaining ownership
/// lies with the resuming worker's frame) and performs the terminal yield.
extern "C" fn fiber_main(_arg: usize) -> ! {
    let cur = Fiber::current();
    // Safety: only the running fiber touches its own entry slot.
    let entry = unsafe { (*cur.entry.get()).take() };
    if let Some(f) = entry {
        f();
    }
    cur.set_state(FiberState::Term);

    let raw = Arc::as_ptr(&cur);
    drop(cur);
    // Safety: the worker frame that resumed us still holds a strong handle
    // until its resume() call returns, which is exactly where this yield
    // lands.
    unsafe { (*raw).yield_now() };
    unreachable!("fiber resumed past its terminal yield");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[test]
    fn test_main_fiber_lazy_init() {
        let main = Fiber::current();
        assert_eq!(main.state(), FiberState::Running);
        let again = Fiber::current();
        assert_eq!(main.id(), again.id());
        assert_eq!(current_id(), main.id().as_u64());
    }

    #[test]
    fn test_resume_yield_round_trip() {
        Fiber::current();
        let trace = Arc::new(Mutex::new(Vec::new()));

        let t = trace.clone();
        let fiber = Fiber::new(
            move || {
                t.lock().unwrap().push("enter");
                yield_now();
                t.lock().unwrap().push("back");
            },
            0,
        );
        assert_eq!(fiber.state(), FiberState::Ready);

        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Ready);
        assert_eq!(*trace.lock().unwrap(), vec!["enter"]);

        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
        assert_eq!(*trace.lock().unwrap(), vec!["enter", "back"]);
    }

    #[test]
    fn test_interleaving_with_main() {
        Fiber::current();
        let trace = Arc::new(Mutex::new(Vec::new()));

        let t = trace.clone();
        let fiber = Fiber::new(
            move || {
                t.lock().unwrap().push(1);
                yield_now();
                t.lock().unwrap().push(3);
            },
            0,
        );

        fiber.resume();
        trace.lock().unwrap().push(2);
        fiber.resume();
        trace.lock().unwrap().push(4);

        assert_eq!(*trace.lock().unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_reset_reuses_stack_and_id() {
        Fiber::current();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        let fiber = Fiber::new(move || { h.fetch_add(1, Ordering::SeqCst); }, 0);
        let id = fiber.id();

        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        for _ in 0..3 {
            let h = hits.clone();
            fiber.reset(move || { h.fetch_add(1, Ordering::SeqCst); });
            assert_eq!(fiber.state(), FiberState::Ready);
            fiber.resume();
            assert_eq!(fiber.state(), FiberState::Term);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 4);
        assert_eq!(fiber.id(), id);
    }

    #[test]
    fn test_custom_stack_size() {
        Fiber::current();
        let fiber = Fiber::new(|| {}, 64 * 1024);
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn test_total_count_tracks_lifetime() {
        Fiber::current();
        let fiber = Fiber::new(|| {}, 0);
        // This thread's main fiber and the new one are both live; tests in
        // other threads can only add to the count.
        assert!(Fiber::total_count() >= 2);
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    #[should_panic(expected = "resume")]
    fn test_resume_term_fiber_panics() {
        Fiber::current();
        let fiber = Fiber::new(|| {}, 0);
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
        fiber.resume();
    }

    #[test]
    fn test_entry_cleared_after_term() {
        Fiber::current();
        let payload = Arc::new(());
        let p = payload.clone();
        let fiber = Fiber::new(move || { let _keep = &p; }, 0);
        assert_eq!(Arc::strong_count(&payload), 2);
        fiber.resume();
        // Entry consumed and dropped with its captures.
        assert_eq!(Arc::strong_count(&payload), 1);
    }
}
