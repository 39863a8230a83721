//! Reactor example: fibers parked on pipe readiness
//!
//! A producer thread writes lines into a pipe; a fiber re-arms a one-shot
//! READ interest around each read and drains what arrived. Demonstrates
//! add_event, edge-triggered wakeups, and cancel_event.
//!
//! # Environment Variables
//!
//! - `WEFT_WORKERS=<n>` - Number of worker threads (default: 2)
//! - `WEFT_MESSAGES=<n>` - Messages to push through the pipe (default: 5)
//! - `WEFT_LOG=<level>` - Log level: off, error, warn, info, debug, trace

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use weft::{env_get, IoEvent, IoManager};

fn pipe() -> Result<(libc::c_int, libc::c_int)> {
    let mut fds = [0 as libc::c_int; 2];
    let rt = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    if rt != 0 {
        bail!("pipe2 failed: {}", std::io::Error::last_os_error());
    }
    Ok((fds[0], fds[1]))
}

fn main() -> Result<()> {
    let workers: usize = env_get("WEFT_WORKERS", 2);
    let messages: usize = env_get("WEFT_MESSAGES", 5);

    println!("=== weft echo example ===");
    let (rd, wr) = pipe().context("creating message pipe")?;

    let iom = IoManager::new(workers, false, "echo");
    let received = Arc::new(AtomicUsize::new(0));

    // The consumer: parks itself on READ readiness, drains the pipe, and
    // re-arms until it has seen every message (one-shot events require a
    // fresh add_event per wakeup).
    let consumer_iom = iom.clone();
    let consumer_seen = received.clone();
    iom.spawn(move || {
        let mut buf = [0u8; 256];
        while consumer_seen.load(Ordering::SeqCst) < messages {
            consumer_iom
                .add_event(rd, IoEvent::Read)
                .expect("register read interest");
            weft::yield_now();

            // Edge-triggered: consume until the pipe would block.
            loop {
                let n = unsafe {
                    libc::read(rd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
                };
                if n <= 0 {
                    break;
                }
                let chunk = String::from_utf8_lossy(&buf[..n as usize]);
                for line in chunk.split_terminator('\n') {
                    println!("[consumer] got {:?} on fiber {}", line, weft::current_fiber_id());
                    consumer_seen.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
        println!("[consumer] done");
    });

    // The producer: an ordinary OS thread poking bytes into the pipe.
    let producer = std::thread::spawn(move || {
        for i in 0..messages {
            let line = format!("message-{}\n", i);
            let rt = unsafe {
                libc::write(wr, line.as_ptr() as *const libc::c_void, line.len())
            };
            assert_eq!(rt, line.len() as isize);
            std::thread::sleep(Duration::from_millis(50));
        }
    });
    producer.join().expect("producer thread");

    // Wait for the consumer to observe everything, then shut down.
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while received.load(Ordering::SeqCst) < messages {
        if std::time::Instant::now() > deadline {
            // Wake the consumer so stop() is not held up by its parked event.
            iom.cancel_event(rd, IoEvent::Read);
            bail!("timed out after {} messages", received.load(Ordering::SeqCst));
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    iom.stop();
    unsafe {
        libc::close(rd);
        libc::close(wr);
    }
    println!("echoed {} messages", received.load(Ordering::SeqCst));
    Ok(())
}
