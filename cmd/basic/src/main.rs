//! Basic weft example
//!
//! Part one drives a single fiber by hand: resume, yield, resume. Part two
//! pushes a batch of callbacks through a scheduler and lets stop() drain
//! them in FIFO order.
//!
//! # Environment Variables
//!
//! - `WEFT_WORKERS=<n>` - Number of worker threads (default: 2)
//! - `WEFT_TASKS=<n>` - Number of tasks to spawn (default: 10)
//! - `WEFT_LOG=<level>` - Log level: off, error, warn, info, debug, trace

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use weft::{env_get, Fiber, Scheduler};

fn main() {
    let workers: usize = env_get("WEFT_WORKERS", 2);
    let tasks: usize = env_get("WEFT_TASKS", 10);

    println!("=== weft basic example ===");

    // Initialize this thread's main fiber, then drive a child fiber by hand.
    Fiber::current();
    let fiber = Fiber::new(
        || {
            println!("[fiber {}] first half", weft::current_fiber_id());
            weft::yield_now();
            println!("[fiber {}] second half", weft::current_fiber_id());
        },
        0,
    );
    println!("[main] resuming fiber {}", fiber.id());
    fiber.resume();
    println!("[main] fiber yielded, resuming again");
    fiber.resume();
    println!("[main] fiber finished in state {}", fiber.state());
    drop(fiber);

    // Now the scheduler: a batch of callbacks over a worker pool.
    println!("[main] scheduling {} tasks on {} workers", tasks, workers);
    let sched = Scheduler::new(workers, false, "basic");
    sched.start();

    let completed = Arc::new(AtomicUsize::new(0));
    for i in 0..tasks {
        let completed = completed.clone();
        sched.spawn(move || {
            println!("task {} on fiber {}", i, weft::current_fiber_id());
            completed.fetch_add(1, Ordering::SeqCst);
        });
    }

    sched.stop();
    println!("completed {}/{} tasks", completed.load(Ordering::SeqCst), tasks);

    // Workers are joined and their fibers reclaimed; only this thread's main
    // fiber should remain.
    println!("live fibers at exit: {}", weft::fiber_count());
}
