//! FIFO multi-producer work lists shared across threads.
//!
//! `MtList` is the mailbox currency of the crate: endpoint threads push
//! session-management work onto the Nexus's TX list, the SM thread pushes
//! received packets into per-endpoint RX lists, and endpoints feed
//! background workers through per-worker request lists. Handles are cheap
//! clones of the same underlying list.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

struct Shared<T> {
    items: Mutex<VecDeque<T>>,
    avail: Condvar,
}

/// A FIFO list shared between producer threads and one consumer.
pub struct MtList<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for MtList<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> MtList<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                items: Mutex::new(VecDeque::new()),
                avail: Condvar::new(),
            }),
        }
    }

    /// Append an item and wake one waiting consumer.
    pub fn push(&self, item: T) {
        let mut items = self.shared.items.lock().unwrap();
        items.push_back(item);
        self.shared.avail.notify_one();
    }

    /// Pop the oldest item without blocking.
    pub fn try_pop(&self) -> Option<T> {
        self.shared.items.lock().unwrap().pop_front()
    }

    /// Pop the oldest item, blocking up to `timeout` for one to arrive.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let items = self.shared.items.lock().unwrap();
        let (mut items, _result) = self
            .shared
            .avail
            .wait_timeout_while(items, timeout, |items| items.is_empty())
            .unwrap();
        items.pop_front()
    }

    /// Take every queued item at once, preserving FIFO order.
    pub fn drain(&self) -> Vec<T> {
        let mut items = self.shared.items.lock().unwrap();
        items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.shared.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.items.lock().unwrap().is_empty()
    }
}

impl<T> Default for MtList<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_fifo_order() {
        let list = MtList::new();
        list.push(1);
        list.push(2);
        list.push(3);

        assert_eq!(list.try_pop(), Some(1));
        assert_eq!(list.try_pop(), Some(2));
        assert_eq!(list.try_pop(), Some(3));
        assert_eq!(list.try_pop(), None);
    }

    #[test]
    fn test_drain() {
        let list = MtList::new();
        for i in 0..5 {
            list.push(i);
        }
        assert_eq!(list.drain(), vec![0, 1, 2, 3, 4]);
        assert!(list.is_empty());
    }

    #[test]
    fn test_pop_timeout_empty() {
        let list: MtList<u32> = MtList::new();
        let start = Instant::now();
        assert_eq!(list.pop_timeout(Duration::from_millis(20)), None);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_pop_timeout_wakes_on_push() {
        let list = MtList::new();
        let producer = list.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            producer.push(7u32);
        });

        assert_eq!(list.pop_timeout(Duration::from_secs(2)), Some(7));
        handle.join().unwrap();
    }

    #[test]
    fn test_multi_producer() {
        let list = MtList::new();
        let num_producers = 4;
        let per_producer = 1000;

        let handles: Vec<_> = (0..num_producers)
            .map(|i| {
                let list = list.clone();
                thread::spawn(move || {
                    for j in 0..per_producer {
                        list.push(i * per_producer + j);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        let mut received = list.drain();
        assert_eq!(received.len(), num_producers * per_producer);
        received.sort();
        received.dedup();
        assert_eq!(received.len(), num_producers * per_producer);
    }
}
