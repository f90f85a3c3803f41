//! Thread-local registry assigning small per-thread IDs.
//!
//! Endpoint threads and background workers self-register on first touch
//! and keep their ID for the life of the thread.

use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

thread_local! {
    static ETID: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Hands out endpoint-thread IDs. Handles are cheap clones sharing one
/// counter; the Nexus owns the canonical handle.
#[derive(Clone)]
pub struct TlsRegistry {
    cur_etid: Arc<AtomicUsize>,
}

impl TlsRegistry {
    pub fn new() -> Self {
        Self {
            cur_etid: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Assign the calling thread an ID if it does not have one yet.
    /// Returns the thread's ID.
    pub fn init_tls(&self) -> usize {
        ETID.with(|etid| match etid.get() {
            Some(id) => id,
            None => {
                let id = self.cur_etid.fetch_add(1, Ordering::Relaxed);
                etid.set(Some(id));
                id
            }
        })
    }

    /// The calling thread's ID, if it has registered.
    pub fn etid() -> Option<usize> {
        ETID.with(|etid| etid.get())
    }

    /// Number of threads that have registered so far.
    pub fn thread_count(&self) -> usize {
        self.cur_etid.load(Ordering::Relaxed)
    }

    /// Restart ID assignment from zero. Threads that already registered
    /// keep their old IDs; only call this once they have exited.
    pub fn reset(&self) {
        self.cur_etid.store(0, Ordering::Relaxed);
    }
}

impl Default for TlsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_init_idempotent() {
        let reg = TlsRegistry::new();
        let a = reg.init_tls();
        let b = reg.init_tls();
        assert_eq!(a, b);
        assert_eq!(TlsRegistry::etid(), Some(a));
        assert_eq!(reg.thread_count(), 1);
    }

    #[test]
    fn test_distinct_ids_per_thread() {
        let reg = TlsRegistry::new();
        let reg2 = reg.clone();

        let id0 = thread::spawn(move || reg2.init_tls()).join().unwrap();
        let reg3 = reg.clone();
        let id1 = thread::spawn(move || reg3.init_tls()).join().unwrap();

        assert_ne!(id0, id1);
        assert_eq!(reg.thread_count(), 2);
    }
}
