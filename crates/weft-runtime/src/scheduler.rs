//! N:M cooperative fiber scheduler
//!
//! A pool of worker threads shares a single FIFO task queue. Each worker runs
//! a dispatch loop that pulls the first eligible task (respecting pinned
//! thread ids) and resumes its fiber, falling back to a per-worker idle fiber
//! when the queue is empty. With `use_caller` the constructing thread
//! contributes itself as a worker: its dispatch loop runs on a dedicated
//! fiber, resumed inline by `stop` to drain the queue.
//!
//! The `tickle`/`idle`/`stopping` hooks are supplied by the concrete
//! scheduler variant through the [`Dispatch`] trait; the base defaults
//! busy-idle and never signal, the reactor in [`crate::io`] overrides all
//! three.

use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use weft_core::state::FiberState;
use weft_core::{log_debug, log_trace};

use crate::fiber::{self, Entry, Fiber};
use crate::thread::{self, Thread};
use crate::tls;

/// A unit of scheduled work: a fiber to resume or a callback to wrap
pub enum Job {
    /// Resume this fiber; it must be READY when dequeued
    Fiber(Arc<Fiber>),
    /// Run this callback inside the worker's reusable wrapper fiber
    Call(Entry),
}

/// A queued task: a job plus an optional pinned worker thread id
pub struct Task {
    job: Job,
    pin: Option<u64>,
}

impl Task {
    /// A callback task runnable on any worker
    pub fn call<F>(f: F) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        Task {
            job: Job::Call(Box::new(f)),
            pin: None,
        }
    }

    /// A fiber task runnable on any worker
    pub fn fiber(fiber: Arc<Fiber>) -> Task {
        Task {
            job: Job::Fiber(fiber),
            pin: None,
        }
    }

    /// Restrict the task to the worker with the given thread id
    pub fn pinned(mut self, thread_id: u64) -> Task {
        self.pin = Some(thread_id);
        self
    }

    pub(crate) fn from_job(job: Job) -> Task {
        Task { job, pin: None }
    }
}

impl From<Arc<Fiber>> for Task {
    fn from(fiber: Arc<Fiber>) -> Task {
        Task::fiber(fiber)
    }
}

/// Hooks supplied by the concrete scheduler variant.
///
/// The dispatch loop and `schedule`/`stop` call these dynamically, so a
/// variant can change how idle workers wait and how they are woken.
pub trait Dispatch: Send + Sync + 'static {
    /// The shared scheduler state
    fn scheduler(&self) -> &Scheduler;

    /// Wake an idle worker after new work arrived; the base has no way to
    /// wake anyone and relies on workers re-scanning the queue
    fn tickle(&self) {
        log_trace!("tickle");
    }

    /// Body of the per-worker idle fiber, resumed whenever the queue has
    /// nothing eligible; returning terminates the worker
    fn idle(&self) {
        log_debug!("idle");
        while !self.stopping() {
            fiber::yield_now();
        }
    }

    /// Whether dispatch loops may exit
    fn stopping(&self) -> bool {
        self.scheduler().stopping()
    }
}

/// State guarded by the scheduler mutex
struct SchedState {
    tasks: VecDeque<Task>,
    threads: Vec<Thread>,
    thread_ids: Vec<u64>,
    stopping: bool,
    started: bool,
}

/// The N:M scheduler: worker pool plus shared FIFO task queue
pub struct Scheduler {
    name: String,
    state: Mutex<SchedState>,
    /// Worker threads to spawn, excluding a contributing caller
    worker_count: usize,
    /// Workers currently executing a task
    active: AtomicUsize,
    /// Workers currently parked in their idle fiber
    idle: AtomicUsize,
    use_caller: bool,
    /// The caller's dispatch fiber, when `use_caller`
    root_fiber: Option<Arc<Fiber>>,
    /// The caller's thread id, when `use_caller`
    root_thread: Option<u64>,
    /// Virtual hooks of the concrete variant (self, for a base scheduler)
    hooks: OnceLock<Weak<dyn Dispatch>>,
}

impl Scheduler {
    /// Create a base scheduler with `threads` workers.
    ///
    /// With `use_caller` one worker slot is taken by the calling thread:
    /// its main fiber is initialized here and `stop` later drains the queue
    /// on a dedicated dispatch fiber.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<Scheduler> {
        let this = Arc::<Scheduler>::new_cyclic(|weak| {
            let hooks: Weak<dyn Dispatch> = weak.clone();
            Scheduler::build(threads, use_caller, name, hooks)
        });
        if use_caller {
            this.adopt_caller_thread();
        }
        this
    }

    /// Shared constructor for scheduler variants. The variant passes its own
    /// weak handle as the hook set; with `use_caller` it must also call
    /// [`Scheduler::adopt_caller_thread`] once its allocation is in place.
    pub(crate) fn build(
        threads: usize,
        use_caller: bool,
        name: &str,
        hooks: Weak<dyn Dispatch>,
    ) -> Scheduler {
        assert!(threads >= 1, "scheduler needs at least one worker");

        let mut worker_count = threads;
        let mut root_fiber = None;
        let mut root_thread = None;
        let mut thread_ids = Vec::new();

        if use_caller {
            worker_count -= 1;

            // The caller contributes itself: initialize its main fiber and
            // build the dispatch fiber that stop() will resume inline.
            Fiber::current();
            let entry_hooks = hooks.clone();
            root_fiber = Some(Fiber::new_dispatch(Box::new(move || {
                if let Some(this) = entry_hooks.upgrade() {
                    run(this);
                }
            })));

            let tid = thread::current_thread_id();
            root_thread = Some(tid);
            thread_ids.push(tid);
        }

        let sched = Scheduler {
            name: name.to_string(),
            state: Mutex::new(SchedState {
                tasks: VecDeque::new(),
                threads: Vec::new(),
                thread_ids,
                stopping: false,
                started: false,
            }),
            worker_count,
            active: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            use_caller,
            root_fiber,
            root_thread,
            hooks: OnceLock::new(),
        };
        let _ = sched.hooks.set(hooks);
        sched
    }

    /// Register the constructing thread as this scheduler's caller thread
    pub(crate) fn adopt_caller_thread(&self) {
        assert!(
            tls::scheduler_identity().is_null(),
            "thread already belongs to a scheduler"
        );
        tls::set_scheduler(self.hooks_weak(), self as *const Scheduler);
    }

    /// The scheduler's name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The scheduler the current thread works for, if it is a worker
    pub fn current() -> Option<Arc<dyn Dispatch>> {
        tls::current_scheduler().and_then(|w| w.upgrade())
    }

    /// Dispatch fiber of the current worker thread, if a dispatch loop runs
    /// here
    pub fn dispatch_fiber() -> Option<Arc<Fiber>> {
        let ptr = tls::dispatch_fiber();
        if ptr.is_null() {
            return None;
        }
        // Safety: the dispatch loop holds a strong handle for as long as the
        // anchor is installed.
        unsafe {
            Arc::increment_strong_count(ptr);
            Some(Arc::from_raw(ptr))
        }
    }

    /// Append a task to the queue. If the queue was empty, an idle worker is
    /// tickled awake.
    pub fn schedule(&self, task: Task) {
        let need_tickle = {
            let mut st = self.state.lock();
            let was_empty = st.tasks.is_empty();
            st.tasks.push_back(task);
            was_empty
        };
        if need_tickle {
            if let Some(hooks) = self.hooks() {
                hooks.tickle();
            }
        }
    }

    /// Convenience: schedule a callback on any worker
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(Task::call(f));
    }

    /// Spawn the worker threads, named `"<name>_<index>"`
    pub fn start(&self) {
        log_debug!("scheduler {} start", self.name);
        let mut st = self.state.lock();
        assert!(!st.stopping, "start: scheduler {} is stopping", self.name);
        assert!(!st.started, "start: scheduler {} already started", self.name);
        st.started = true;

        for i in 0..self.worker_count {
            let hooks = self.hooks_weak();
            let t = Thread::spawn(format!("{}_{}", self.name, i), move || {
                if let Some(this) = hooks.upgrade() {
                    run(this);
                }
            });
            st.thread_ids.push(t.id());
            st.threads.push(t);
        }
    }

    /// Signal stop, drain the queue, and join the workers.
    ///
    /// With a contributing caller this must run on the caller thread and
    /// drains remaining tasks inline on the caller's dispatch fiber;
    /// otherwise it must run outside the worker pool.
    pub fn stop(&self) {
        let fully_stopped = match self.hooks() {
            Some(hooks) => hooks.stopping(),
            None => self.stopping(),
        };
        if fully_stopped {
            return;
        }
        log_debug!("scheduler {} stop", self.name);

        {
            let mut st = self.state.lock();
            st.stopping = true;
        }

        if self.use_caller {
            assert_eq!(
                Some(thread::current_thread_id()),
                self.root_thread,
                "stop: a use_caller scheduler must be stopped from its caller thread"
            );
        } else {
            assert!(
                !std::ptr::eq(tls::scheduler_identity(), self as *const Scheduler),
                "stop: must not be called from a worker thread"
            );
        }

        for _ in 0..self.worker_count {
            if let Some(hooks) = self.hooks() {
                hooks.tickle();
            }
        }
        if self.root_fiber.is_some() {
            if let Some(hooks) = self.hooks() {
                hooks.tickle();
            }
        }

        if let Some(root) = &self.root_fiber {
            root.resume();
            log_debug!("scheduler {} caller dispatch fiber finished", self.name);
        }

        let threads = {
            let mut st = self.state.lock();
            mem::take(&mut st.threads)
        };
        for t in threads {
            t.join();
        }
    }

    /// True once stop was requested, the queue is drained, and no worker is
    /// mid-task
    pub fn stopping(&self) -> bool {
        let st = self.state.lock();
        st.stopping && st.tasks.is_empty() && self.active.load(Ordering::Relaxed) == 0
    }

    /// Thread ids of all workers, the contributing caller included
    pub fn worker_ids(&self) -> Vec<u64> {
        self.state.lock().thread_ids.clone()
    }

    pub(crate) fn idle_workers(&self) -> usize {
        self.idle.load(Ordering::Relaxed)
    }

    pub(crate) fn hooks_weak(&self) -> Weak<dyn Dispatch> {
        self.hooks
            .get()
            .expect("hooks installed at construction")
            .clone()
    }

    fn hooks(&self) -> Option<Arc<dyn Dispatch>> {
        self.hooks.get().and_then(|w| w.upgrade())
    }
}

impl Dispatch for Scheduler {
    fn scheduler(&self) -> &Scheduler {
        self
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        tls::clear_scheduler_if(self as *const Scheduler);
    }
}

/// Per-worker dispatch loop.
///
/// Runs on the thread's main fiber for pool workers and on the dedicated
/// dispatch fiber for a contributing caller.
fn run(this: Arc<dyn Dispatch>) {
    let sched = this.scheduler();
    let my_tid = thread::current_thread_id();
    log_debug!("scheduler {} run (thread {})", sched.name, my_tid);

    tls::set_scheduler(sched.hooks_weak(), sched as *const Scheduler);

    // Whatever fiber executes this loop is the thread's dispatch anchor.
    let dispatch = Fiber::current();
    tls::set_dispatch_fiber(Arc::as_ptr(&dispatch));

    let idle_hooks = this.clone();
    let idle_fiber = Fiber::new(move || idle_hooks.idle(), 0);
    let mut cb_fiber: Option<Arc<Fiber>> = None;

    loop {
        let mut tickle_me = false;
        let mut job: Option<Job> = None;
        {
            let mut st = sched.state.lock();
            let mut i = 0;
            while i < st.tasks.len() {
                if let Some(pin) = st.tasks[i].pin {
                    if pin != my_tid {
                        // Pinned elsewhere; some other worker must be woken
                        // for it.
                        tickle_me = true;
                        i += 1;
                        continue;
                    }
                }

                if let Job::Fiber(f) = &st.tasks[i].job {
                    assert_eq!(
                        f.state(),
                        FiberState::Ready,
                        "dequeued fiber {} is {}",
                        f.id(),
                        f.state()
                    );
                }
                let task = st.tasks.remove(i).expect("scan index in bounds");
                sched.active.fetch_add(1, Ordering::Relaxed);
                job = Some(task.job);
                break;
            }
            if job.is_some() {
                tickle_me |= i < st.tasks.len();
            }
        }

        if tickle_me {
            this.tickle();
        }

        match job {
            Some(Job::Fiber(f)) => {
                // Whether the fiber finished or yielded is its own business;
                // yielded fibers are re-scheduled by whoever parked them.
                f.resume();
                sched.active.fetch_sub(1, Ordering::Relaxed);
            }
            Some(Job::Call(cb)) => {
                match &cb_fiber {
                    Some(f) if f.state() == FiberState::Term => f.reset_boxed(cb),
                    _ => cb_fiber = Some(Fiber::from_boxed(cb, 0)),
                }
                let f = cb_fiber.clone().expect("wrapper fiber just installed");
                f.resume();
                sched.active.fetch_sub(1, Ordering::Relaxed);
                if f.state() != FiberState::Term {
                    // The callback yielded mid-flight and now belongs to
                    // whoever re-schedules it; use a fresh wrapper next time.
                    cb_fiber = None;
                }
            }
            None => {
                if idle_fiber.state() == FiberState::Term {
                    log_debug!("scheduler {} idle fiber terminated, worker exits", sched.name);
                    break;
                }
                sched.idle.fetch_add(1, Ordering::Relaxed);
                idle_fiber.resume();
                sched.idle.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }

    tls::clear_dispatch_fiber();
    log_debug!("scheduler {} run exit (thread {})", sched.name, my_tid);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;
    use std::time::{Duration, Instant};

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
    fn test_ten_tasks_single_worker_fifo() {
        let sched = Scheduler::new(1, false, "fifo");
        let order = Arc::new(StdMutex::new(Vec::new()));

        sched.start();
        for i in 0..10 {
            let order = order.clone();
            sched.spawn(move || {
                order.lock().unwrap().push(i);
            });
        }
        sched.stop();

        assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
        assert!(sched.stopping());
    }

    #[test]
    fn test_use_caller_inline_drain() {
        let sched = Scheduler::new(1, true, "caller");
        let order = Arc::new(StdMutex::new(Vec::new()));

        sched.start();
        for i in 0..10 {
            let order = order.clone();
            sched.spawn(move || {
                order.lock().unwrap().push(i);
            });
        }
        // With a single contributing caller nothing ran yet; stop drains the
        // queue inline on the caller's dispatch fiber.
        assert!(order.lock().unwrap().is_empty());
        sched.stop();

        assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_pinned_tasks_run_on_their_worker() {
        let sched = Scheduler::new(2, false, "pinned");
        sched.start();

        let workers = sched.worker_ids();
        assert_eq!(workers.len(), 2);

        let records = Arc::new(StdMutex::new(Vec::new()));
        for task in 0..6 {
            let target = workers[task % 2];
            let records = records.clone();
            sched.schedule(
                Task::call(move || {
                    records
                        .lock()
                        .unwrap()
                        .push((task, thread::current_thread_id()));
                })
                .pinned(target),
            );
        }
        sched.stop();

        let records = records.lock().unwrap();
        assert_eq!(records.len(), 6);
        for &(task, tid) in records.iter() {
            assert_eq!(tid, workers[task % 2], "task {} ran on the wrong worker", task);
        }
        // Submission order preserved within each pinned group.
        for target in &workers {
            let group: Vec<_> = records
                .iter()
                .filter(|(_, tid)| tid == target)
                .map(|(task, _)| *task)
                .collect();
            let mut sorted = group.clone();
            sorted.sort_unstable();
            assert_eq!(group, sorted);
        }
    }

    #[test]
    fn test_callback_wrapper_fiber_reused() {
        let sched = Scheduler::new(1, false, "reuse");
        sched.start();

        let ids = Arc::new(StdMutex::new(Vec::new()));
        for _ in 0..20 {
            let ids = ids.clone();
            sched.spawn(move || {
                ids.lock().unwrap().push(fiber::current_id());
            });
        }
        sched.stop();

        let ids = ids.lock().unwrap();
        assert_eq!(ids.len(), 20);
        // One worker, no yields: every callback runs in the same wrapper
        // fiber, reset between runs.
        assert!(ids.iter().all(|&id| id == ids[0]));
    }

    #[test]
    fn test_stop_drains_hundred_tasks() {
        let sched = Scheduler::new(3, false, "drain");
        let counter = Arc::new(AtomicUsize::new(0));

        sched.start();
        for _ in 0..100 {
            let counter = counter.clone();
            sched.spawn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        sched.stop();

        assert_eq!(counter.load(Ordering::SeqCst), 100);
        assert!(sched.stopping());
    }

    #[test]
    fn test_fiber_task_runs_to_term() {
        let sched = Scheduler::new(1, false, "fiber-task");
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        let fiber = Fiber::new(move || { h.fetch_add(1, Ordering::SeqCst); }, 0);
        let observed = fiber.clone();

        sched.start();
        sched.schedule(Task::fiber(fiber));

        assert!(wait_until(Duration::from_secs(5), || {
            observed.state() == FiberState::Term
        }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        sched.stop();
    }

    #[test]
    fn test_scheduler_current_on_non_worker() {
        assert!(Scheduler::current().is_none());
    }

    #[test]
    fn test_worker_observes_scheduler_and_dispatch_fiber() {
        let sched = Scheduler::new(1, false, "observe");
        sched.start();

        let seen = Arc::new(StdMutex::new((false, false)));
        let seen2 = seen.clone();
        sched.spawn(move || {
            let mut s = seen2.lock().unwrap();
            s.0 = Scheduler::current().is_some();
            s.1 = Scheduler::dispatch_fiber().is_some();
        });
        sched.stop();

        let s = seen.lock().unwrap();
        assert!(s.0, "worker thread should see its scheduler");
        assert!(s.1, "worker thread should see its dispatch fiber");
    }
}
