//! Worker thread management
//!
//! A thin wrapper over `std::thread` that gives each worker a name and a
//! stable integer id (the kernel tid on Linux), known to the spawner before
//! `spawn` returns. Task pinning addresses workers by this id.

use std::cell::Cell;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

/// A named, joinable worker thread with a stable integer id
pub struct Thread {
    handle: JoinHandle<()>,
    id: u64,
    name: String,
}

impl Thread {
    /// Spawn a named thread and block until its id is known.
    ///
    /// The handshake happens before `f` runs, so `f` may block on locks the
    /// spawner holds without deadlocking the handshake.
    pub fn spawn<F>(name: String, f: F) -> Thread
    where
        F: FnOnce() + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let _ = tx.send(current_thread_id());
                f();
            })
            .expect("failed to spawn worker thread");
        let id = rx.recv().expect("worker thread died before reporting id");
        Thread { handle, id, name }
    }

    /// The thread's stable integer id
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The thread's name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the thread to finish
    pub fn join(self) {
        let _ = self.handle.join();
    }
}

thread_local! {
    static THREAD_ID: Cell<u64> = const { Cell::new(0) };
}

/// Stable integer id of the calling thread.
///
/// Cached per thread after the first lookup.
#[inline]
pub fn current_thread_id() -> u64 {
    THREAD_ID.with(|cell| {
        let cached = cell.get();
        if cached != 0 {
            return cached;
        }
        let id = os_thread_id();
        cell.set(id);
        id
    })
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        fn os_thread_id() -> u64 {
            unsafe { libc::syscall(libc::SYS_gettid) as u64 }
        }
    } else {
        fn os_thread_id() -> u64 {
            unsafe { libc::pthread_self() as u64 }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_thread_id_stable() {
        let a = current_thread_id();
        let b = current_thread_id();
        assert_ne!(a, 0);
        assert_eq!(a, b);
    }

    #[test]
    fn test_spawn_reports_id() {
        let t = Thread::spawn("weft-test".into(), || {});
        let id = t.id();
        assert_ne!(id, 0);
        assert_ne!(id, current_thread_id());
        assert_eq!(t.name(), "weft-test");
        t.join();
    }

    #[test]
    fn test_spawned_thread_sees_own_id() {
        let (tx, rx) = mpsc::channel();
        let t = Thread::spawn("weft-test-id".into(), move || {
            let _ = tx.send(current_thread_id());
        });
        let seen = rx.recv().unwrap();
        assert_eq!(seen, t.id());
        t.join();
    }
}
