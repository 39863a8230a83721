//! Readiness reactor: the epoll-backed scheduler variant
//!
//! Extends the scheduler with a dense table of per-fd event registrations.
//! Interests are edge-triggered and one-shot: a readiness trigger clears the
//! registration and schedules the parked fiber or callback; observing the fd
//! again requires a new `add_event`. Idle workers block in `epoll_wait` and
//! are woken either by fd readiness or by a byte written to the reactor's
//! self-pipe (`tickle`).

use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use weft_core::error::{SchedError, SchedResult};
use weft_core::state::FiberState;
use weft_core::{log_debug, log_error};

use crate::fiber::{self, Entry, Fiber};
use crate::scheduler::{Dispatch, Job, Scheduler, Task};

/// Readiness interest for one fd; the values are the epoll bits
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoEvent {
    /// Readable (EPOLLIN)
    Read = 0x001,
    /// Writable (EPOLLOUT)
    Write = 0x004,
}

const EV_READ: u32 = IoEvent::Read as u32;
const EV_WRITE: u32 = IoEvent::Write as u32;

/// Readiness events drained per wake
const MAX_EVENTS: usize = 256;

/// Sanity bound on one blocking readiness wait, in milliseconds
const WAIT_TIMEOUT_MS: libc::c_int = 3000;

const EPOLLET: u32 = libc::EPOLLET as u32;

/// One registered interest: where to schedule, and what to run when it fires.
/// An inactive slot has both fields empty.
#[derive(Default)]
struct EventSlot {
    scheduler: Option<Weak<dyn Dispatch>>,
    job: Option<Job>,
}

impl EventSlot {
    fn is_empty(&self) -> bool {
        self.scheduler.is_none() && self.job.is_none()
    }
}

/// Registration state for a single fd; slot index in the table equals the fd
struct FdContext {
    fd: libc::c_int,
    slots: Mutex<FdSlots>,
}

#[derive(Default)]
struct FdSlots {
    /// Bitmask of registered interests; a bit is set iff its slot is
    /// populated
    events: u32,
    read: EventSlot,
    write: EventSlot,
}

impl FdSlots {
    fn slot_mut(&mut self, event: IoEvent) -> &mut EventSlot {
        match event {
            IoEvent::Read => &mut self.read,
            IoEvent::Write => &mut self.write,
        }
    }
}

impl FdContext {
    fn new(fd: libc::c_int) -> FdContext {
        FdContext {
            fd,
            slots: Mutex::new(FdSlots::default()),
        }
    }
}

/// Scheduler variant whose idle workers block on fd readiness
pub struct IoManager {
    sched: Scheduler,

    /// The epoll instance backing the readiness wait
    epfd: libc::c_int,

    /// Self-pipe `[read end, write end]`, both non-blocking. The read end is
    /// registered edge-triggered with a null data pointer, which is how the
    /// idle loop tells tickle wakeups from fd contexts.
    tickle_fds: [libc::c_int; 2],

    /// Dense fd table, index == fd. The boxes are never dropped while the
    /// reactor is alive, so epoll registrations carry raw pointers to them.
    fd_contexts: RwLock<Vec<Box<FdContext>>>,

    /// Populated event slots across all fds
    pending: AtomicUsize,
}

impl IoManager {
    /// Create a reactor and start its workers.
    ///
    /// epoll or pipe setup failure aborts; there is no reactor without a
    /// readiness handle.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<IoManager> {
        let this = Arc::<IoManager>::new_cyclic(|weak| {
            let hooks: Weak<dyn Dispatch> = weak.clone();
            let sched = Scheduler::build(threads, use_caller, name, hooks);

            let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
            assert!(
                epfd >= 0,
                "epoll_create1 failed: {}",
                std::io::Error::last_os_error()
            );

            let mut fds = [0 as libc::c_int; 2];
            let rt = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
            assert_eq!(rt, 0, "pipe2 failed: {}", std::io::Error::last_os_error());

            let mut ev = libc::epoll_event {
                events: libc::EPOLLIN as u32 | EPOLLET,
                u64: 0,
            };
            let rt = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, fds[0], &mut ev) };
            assert_eq!(
                rt,
                0,
                "epoll_ctl(tickle pipe) failed: {}",
                std::io::Error::last_os_error()
            );

            IoManager {
                sched,
                epfd,
                tickle_fds: fds,
                fd_contexts: RwLock::new(Vec::new()),
                pending: AtomicUsize::new(0),
            }
        });

        if use_caller {
            this.sched.adopt_caller_thread();
        }
        this.resize_contexts(32);
        this.start();
        this
    }

    /// Register a one-shot edge-triggered interest that parks the current
    /// fiber until the event fires (or is cancelled).
    ///
    /// The caller is expected to yield after registering; the trigger
    /// re-schedules the fiber.
    pub fn add_event(&self, fd: libc::c_int, event: IoEvent) -> SchedResult<()> {
        self.add_event_inner(fd, event, None)
    }

    /// Register a one-shot edge-triggered interest with a callback to
    /// schedule when the event fires
    pub fn add_event_with<F>(&self, fd: libc::c_int, event: IoEvent, cb: F) -> SchedResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.add_event_inner(fd, event, Some(Box::new(cb)))
    }

    fn add_event_inner(
        &self,
        fd: libc::c_int,
        event: IoEvent,
        cb: Option<Entry>,
    ) -> SchedResult<()> {
        assert!(fd >= 0, "add_event: negative fd");
        let ctx = self.context(fd);
        let mut slots = ctx.slots.lock();

        // One-shot semantics make double registration a caller bug.
        assert_eq!(
            slots.events & event as u32,
            0,
            "add_event: fd {} already registered for {:?} (events={:#x})",
            fd,
            event,
            slots.events
        );

        let (op, op_name) = if slots.events != 0 {
            (libc::EPOLL_CTL_MOD, "MOD")
        } else {
            (libc::EPOLL_CTL_ADD, "ADD")
        };
        let mut ev = libc::epoll_event {
            events: EPOLLET | slots.events | event as u32,
            u64: ctx as *const FdContext as u64,
        };
        let rt = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rt != 0 {
            let err = std::io::Error::last_os_error();
            let ev_events = ev.events;
            log_error!(
                "epoll_ctl {} fd={} events={:#x} failed: {}",
                op_name,
                fd,
                ev_events,
                err
            );
            return Err(SchedError::EpollCtl {
                op: op_name,
                fd,
                errno: err.raw_os_error().unwrap_or(0),
            });
        }

        self.pending.fetch_add(1, Ordering::Relaxed);
        slots.events |= event as u32;

        let slot = slots.slot_mut(event);
        debug_assert!(slot.is_empty());
        slot.scheduler = Some(self.sched.hooks_weak());
        slot.job = Some(match cb {
            Some(f) => Job::Call(f),
            None => {
                let cur = Fiber::current();
                assert_eq!(
                    cur.state(),
                    FiberState::Running,
                    "add_event: current fiber {} is {}",
                    cur.id(),
                    cur.state()
                );
                Job::Fiber(cur)
            }
        });
        Ok(())
    }

    /// Remove a registered interest without waking its waiter.
    ///
    /// Returns whether the interest was registered.
    pub fn del_event(&self, fd: libc::c_int, event: IoEvent) -> bool {
        let Some(ctx) = self.context_if_present(fd) else {
            return false;
        };
        let mut slots = ctx.slots.lock();
        if slots.events & event as u32 == 0 {
            return false;
        }

        let left = slots.events & !(event as u32);
        if !self.update_registration(ctx, left) {
            return false;
        }

        self.pending.fetch_sub(1, Ordering::Relaxed);
        slots.events = left;
        *slots.slot_mut(event) = EventSlot::default();
        true
    }

    /// Remove a registered interest and schedule its occupant, so the
    /// waiter observes a wake-up rather than silent loss.
    ///
    /// Returns whether the interest was registered.
    pub fn cancel_event(&self, fd: libc::c_int, event: IoEvent) -> bool {
        let Some(ctx) = self.context_if_present(fd) else {
            return false;
        };
        let mut slots = ctx.slots.lock();
        if slots.events & event as u32 == 0 {
            return false;
        }

        let left = slots.events & !(event as u32);
        if !self.update_registration(ctx, left) {
            return false;
        }
        self.trigger(&mut slots, event);
        true
    }

    /// Wake and deregister both interests of an fd.
    ///
    /// Returns whether anything was registered.
    pub fn cancel_all(&self, fd: libc::c_int) -> bool {
        let Some(ctx) = self.context_if_present(fd) else {
            return false;
        };
        let mut slots = ctx.slots.lock();
        if slots.events == 0 {
            return false;
        }

        if !self.update_registration(ctx, 0) {
            return false;
        }
        if slots.events & EV_READ != 0 {
            self.trigger(&mut slots, IoEvent::Read);
        }
        if slots.events & EV_WRITE != 0 {
            self.trigger(&mut slots, IoEvent::Write);
        }
        debug_assert_eq!(slots.events, 0);
        true
    }

    /// Number of registered, not-yet-triggered event slots
    pub fn pending_events(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    /// One-shot fire for a registered event: clear the bit, empty the slot,
    /// schedule the occupant onto the owning scheduler.
    ///
    /// Caller holds the fd-context mutex.
    fn trigger(&self, slots: &mut FdSlots, event: IoEvent) {
        assert!(
            slots.events & event as u32 != 0,
            "trigger: event {:?} not registered",
            event
        );
        slots.events &= !(event as u32);

        let slot = slots.slot_mut(event);
        let scheduler = slot.scheduler.take();
        if let Some(job) = slot.job.take() {
            if let Some(owner) = scheduler.and_then(|w| w.upgrade()) {
                owner.scheduler().schedule(Task::from_job(job));
            }
        }
        self.pending.fetch_sub(1, Ordering::Relaxed);
    }

    /// Re-register what is left of an fd's interests (MOD), or drop the fd
    /// from epoll entirely (DEL). Logs and reports failure.
    fn update_registration(&self, ctx: &FdContext, left: u32) -> bool {
        let (op, op_name) = if left != 0 {
            (libc::EPOLL_CTL_MOD, "MOD")
        } else {
            (libc::EPOLL_CTL_DEL, "DEL")
        };
        let mut ev = libc::epoll_event {
            events: EPOLLET | left,
            u64: ctx as *const FdContext as u64,
        };
        let rt = unsafe { libc::epoll_ctl(self.epfd, op, ctx.fd, &mut ev) };
        if rt != 0 {
            log_error!(
                "epoll_ctl {} fd={} failed: {}",
                op_name,
                ctx.fd,
                std::io::Error::last_os_error()
            );
            return false;
        }
        true
    }

    /// Grow the fd table to hold at least `size` slots
    fn resize_contexts(&self, size: usize) {
        let mut table = self.fd_contexts.write();
        Self::grow(&mut table, size);
    }

    fn grow(table: &mut Vec<Box<FdContext>>, size: usize) {
        // Fresh contexts start with empty slots; growth never touches
        // existing entries.
        let mut fd = table.len();
        while fd < size {
            table.push(Box::new(FdContext::new(fd as libc::c_int)));
            fd += 1;
        }
    }

    /// The context for `fd`, growing the table by 1.5x when it is too small.
    ///
    /// The returned reference stays valid for the reactor's lifetime: boxes
    /// are never dropped while `self` lives.
    fn context(&self, fd: libc::c_int) -> &FdContext {
        let idx = fd as usize;
        {
            let table = self.fd_contexts.read();
            if idx < table.len() {
                return unsafe { &*(table[idx].as_ref() as *const FdContext) };
            }
        }
        let mut table = self.fd_contexts.write();
        Self::grow(&mut table, idx * 3 / 2 + 1);
        unsafe { &*(table[idx].as_ref() as *const FdContext) }
    }

    /// The context for `fd` if one was ever created
    fn context_if_present(&self, fd: libc::c_int) -> Option<&FdContext> {
        if fd < 0 {
            return None;
        }
        let table = self.fd_contexts.read();
        let idx = fd as usize;
        if idx < table.len() {
            Some(unsafe { &*(table[idx].as_ref() as *const FdContext) })
        } else {
            None
        }
    }
}

impl Deref for IoManager {
    type Target = Scheduler;

    fn deref(&self) -> &Scheduler {
        &self.sched
    }
}

impl Dispatch for IoManager {
    fn scheduler(&self) -> &Scheduler {
        &self.sched
    }

    /// Wake one idle worker out of `epoll_wait` through the self-pipe
    fn tickle(&self) {
        if self.sched.idle_workers() == 0 {
            return;
        }
        // Best-effort: a full pipe already holds a pending wakeup.
        let byte = b'T';
        let _ = unsafe {
            libc::write(
                self.tickle_fds[1],
                &byte as *const u8 as *const libc::c_void,
                1,
            )
        };
    }

    /// Block in the readiness wait; on wake, drain the self-pipe, fold
    /// error/hangup into registered interests, trigger what fired, and yield
    /// so the dispatch loop picks up the scheduled work
    fn idle(&self) {
        log_debug!("reactor {} idle", self.sched.name());
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        loop {
            if self.stopping() {
                log_debug!("reactor {} idle exit", self.sched.name());
                break;
            }

            let n = unsafe {
                libc::epoll_wait(
                    self.epfd,
                    events.as_mut_ptr(),
                    MAX_EVENTS as libc::c_int,
                    WAIT_TIMEOUT_MS,
                )
            };
            if n < 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::EINTR) {
                    log_error!("epoll_wait failed: {}", err);
                }
                continue;
            }

            for ev in &events[..n as usize] {
                let data = ev.u64;
                if data == 0 {
                    // Tickle pipe; drain until empty (edge-triggered).
                    let mut buf = [0u8; 64];
                    while unsafe {
                        libc::read(
                            self.tickle_fds[0],
                            buf.as_mut_ptr() as *mut libc::c_void,
                            buf.len(),
                        )
                    } > 0
                    {}
                    continue;
                }

                // Safety: non-null data pointers come from add_event and the
                // boxes outlive the reactor's workers.
                let ctx = unsafe { &*(data as usize as *const FdContext) };
                let mut slots = ctx.slots.lock();

                // Error/hangup wakes whatever is registered on either side.
                let mut revents = ev.events;
                if revents & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0 {
                    revents |= (EV_READ | EV_WRITE) & slots.events;
                }

                let ready = revents & (EV_READ | EV_WRITE) & slots.events;
                if ready == 0 {
                    continue;
                }

                // Drop the fired bits from the kernel registration before
                // scheduling, so a woken fiber re-arming the fd starts from
                // a consistent state.
                let left = slots.events & !ready;
                if !self.update_registration(ctx, left) {
                    continue;
                }

                if ready & EV_READ != 0 {
                    self.trigger(&mut slots, IoEvent::Read);
                }
                if ready & EV_WRITE != 0 {
                    self.trigger(&mut slots, IoEvent::Write);
                }
            }

            fiber::yield_now();
        }
    }

    /// The reactor may stop only after every registered event was triggered
    /// or cancelled
    fn stopping(&self) -> bool {
        self.pending.load(Ordering::Relaxed) == 0 && self.sched.stopping()
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        self.stop();
        unsafe {
            libc::close(self.epfd);
            libc::close(self.tickle_fds[0]);
            libc::close(self.tickle_fds[1]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    fn pipe() -> (libc::c_int, libc::c_int) {
        let mut fds = [0 as libc::c_int; 2];
        let rt = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(rt, 0);
        (fds[0], fds[1])
    }

    fn close(fd: libc::c_int) {
        unsafe { libc::close(fd) };
    }

    fn write_byte(fd: libc::c_int) {
        let byte = 1u8;
        let rt = unsafe { libc::write(fd, &byte as *const u8 as *const libc::c_void, 1) };
        assert_eq!(rt, 1);
    }

    fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_readiness_triggers_callback_once() {
        let iom = IoManager::new(1, false, "et-once");
        let (rd, wr) = pipe();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        iom.add_event_with(rd, IoEvent::Read, move || {
            h.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert_eq!(iom.pending_events(), 1);

        write_byte(wr);
        assert!(wait_until(Duration::from_secs(5), || {
            hits.load(Ordering::SeqCst) == 1
        }));
        assert_eq!(iom.pending_events(), 0);

        // One-shot: further readiness without a new add_event schedules
        // nothing.
        write_byte(wr);
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        iom.stop();
        close(rd);
        close(wr);
    }

    #[test]
    fn test_rearm_after_trigger() {
        let iom = IoManager::new(1, false, "rearm");
        let (rd, wr) = pipe();

        let hits = Arc::new(AtomicUsize::new(0));
        for round in 1..=3 {
            let h = hits.clone();
            iom.add_event_with(rd, IoEvent::Read, move || {
                h.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
            // Drain the pipe so the edge is fresh, then write.
            let mut buf = [0u8; 8];
            while unsafe {
                libc::read(rd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            } > 0
            {}
            write_byte(wr);
            assert!(wait_until(Duration::from_secs(5), || {
                hits.load(Ordering::SeqCst) == round
            }));
        }

        iom.stop();
        close(rd);
        close(wr);
    }

    #[test]
    fn test_cancel_event_wakes_waiter() {
        let iom = IoManager::new(2, false, "cancel");
        let (rd, wr) = pipe();

        let resumed = Arc::new(AtomicUsize::new(0));
        let parked = Arc::new(AtomicUsize::new(0));

        let iom2 = iom.clone();
        let resumed2 = resumed.clone();
        let parked2 = parked.clone();
        iom.spawn(move || {
            iom2.add_event(rd, IoEvent::Read).unwrap();
            parked2.fetch_add(1, Ordering::SeqCst);
            fiber::yield_now();
            // Woken by cancel_event, not by data.
            resumed2.fetch_add(1, Ordering::SeqCst);
        });

        assert!(wait_until(Duration::from_secs(5), || {
            parked.load(Ordering::SeqCst) == 1 && iom.pending_events() == 1
        }));
        // Give the fiber time to reach its yield.
        std::thread::sleep(Duration::from_millis(50));

        assert!(iom.cancel_event(rd, IoEvent::Read));
        assert!(wait_until(Duration::from_secs(5), || {
            resumed.load(Ordering::SeqCst) == 1
        }));
        assert_eq!(iom.pending_events(), 0);

        // The registration is gone.
        assert!(!iom.del_event(rd, IoEvent::Read));

        iom.stop();
        close(rd);
        close(wr);
    }

    #[test]
    fn test_del_event_is_silent() {
        let iom = IoManager::new(1, false, "del");
        let (rd, wr) = pipe();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        iom.add_event_with(rd, IoEvent::Read, move || {
            h.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert_eq!(iom.pending_events(), 1);

        assert!(iom.del_event(rd, IoEvent::Read));
        assert_eq!(iom.pending_events(), 0);
        assert!(!iom.del_event(rd, IoEvent::Read));

        // Readiness after deletion schedules nothing.
        write_byte(wr);
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        iom.stop();
        close(rd);
        close(wr);
    }

    #[test]
    fn test_cancel_all_wakes_both_sides() {
        let iom = IoManager::new(1, false, "cancel-all");
        let (rd, _wr) = pipe();
        // A fresh pipe's write end is immediately writable, so park both
        // interests on the read end, which is neither readable nor hung up.
        let hits = Arc::new(AtomicUsize::new(0));
        let h1 = hits.clone();
        let h2 = hits.clone();
        iom.add_event_with(rd, IoEvent::Read, move || {
            h1.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        iom.add_event_with(rd, IoEvent::Write, move || {
            h2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert_eq!(iom.pending_events(), 2);

        assert!(iom.cancel_all(rd));
        assert!(wait_until(Duration::from_secs(5), || {
            hits.load(Ordering::SeqCst) == 2
        }));
        assert_eq!(iom.pending_events(), 0);

        iom.stop();
        close(rd);
        close(_wr);
    }

    #[test]
    fn test_stop_with_queued_work() {
        let iom = IoManager::new(2, false, "drain");
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = counter.clone();
            iom.spawn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        iom.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
        assert!(Dispatch::stopping(&*iom));
    }
}
