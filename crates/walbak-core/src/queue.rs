//! Fixed-capacity FIFO connecting pipeline stages.
//!
//! The queue is the only synchronization between stages. `sync()` marks the
//! end of input; consumers drain whatever is queued and then observe
//! end-of-stream. `fail()` drops pending items and wakes every waiter with an
//! error, which is how a dying stage unblocks both its neighbours.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use walbak_types::error::{Result, WalbakError};

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
    failed: bool,
}

pub struct BoundedQueue<T> {
    capacity: usize,
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

/// Default stage depth. Tuned per pipeline where it matters.
pub const DEFAULT_QUEUE_DEPTH: usize = 16;

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must not be zero");
        BoundedQueue {
            capacity,
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                closed: false,
                failed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Block while full. Fails once the queue is closed or errored.
    pub fn push(&self, item: T) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.failed {
                return Err(WalbakError::QueueFailed);
            }
            if inner.closed {
                return Err(WalbakError::QueueClosed);
            }
            if inner.items.len() < self.capacity {
                break;
            }
            inner = self.not_full.wait(inner).unwrap();
        }
        inner.items.push_back(item);
        drop(inner);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Block while empty. `None` means closed and drained.
    pub fn pop(&self) -> Result<Option<T>> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.failed {
                return Err(WalbakError::QueueFailed);
            }
            if let Some(item) = inner.items.pop_front() {
                drop(inner);
                self.not_full.notify_one();
                return Ok(Some(item));
            }
            if inner.closed {
                return Ok(None);
            }
            inner = self.not_empty.wait(inner).unwrap();
        }
    }

    /// No more pushes. Consumers drain then see end-of-stream.
    pub fn sync(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        drop(inner);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Drop pending items and wake all parties with an error.
    pub fn fail(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.failed = true;
        inner.closed = true;
        inner.items.clear();
        drop(inner);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_order_preserved() {
        let q = BoundedQueue::new(4);
        for i in 0..4 {
            q.push(i).unwrap();
        }
        q.sync();
        let mut got = Vec::new();
        while let Some(v) = q.pop().unwrap() {
            got.push(v);
        }
        assert_eq!(got, vec![0, 1, 2, 3]);
    }

    #[test]
    fn sync_drains_then_ends() {
        let q = BoundedQueue::new(8);
        q.push("a").unwrap();
        q.push("b").unwrap();
        q.sync();
        assert_eq!(q.pop().unwrap(), Some("a"));
        assert_eq!(q.pop().unwrap(), Some("b"));
        assert_eq!(q.pop().unwrap(), None);
        assert!(matches!(q.push("c"), Err(WalbakError::QueueClosed)));
    }

    #[test]
    fn fail_wakes_everyone() {
        let q = Arc::new(BoundedQueue::<u32>::new(1));
        let q2 = Arc::clone(&q);
        let popper = thread::spawn(move || q2.pop());
        // Give the popper a chance to block.
        thread::sleep(std::time::Duration::from_millis(20));
        q.fail();
        assert!(matches!(popper.join().unwrap(), Err(WalbakError::QueueFailed)));
        assert!(matches!(q.push(1), Err(WalbakError::QueueFailed)));
        assert!(matches!(q.pop(), Err(WalbakError::QueueFailed)));
    }

    #[test]
    fn capacity_bounds_producer() {
        let q = Arc::new(BoundedQueue::new(2));
        q.push(1u32).unwrap();
        q.push(2).unwrap();

        let q2 = Arc::clone(&q);
        let producer = thread::spawn(move || {
            q2.push(3).unwrap();
            q2.sync();
        });

        // The producer must be blocked; the queue never exceeds capacity.
        thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(q.len(), 2);

        assert_eq!(q.pop().unwrap(), Some(1));
        producer.join().unwrap();
        assert_eq!(q.pop().unwrap(), Some(2));
        assert_eq!(q.pop().unwrap(), Some(3));
        assert_eq!(q.pop().unwrap(), None);
    }

    #[test]
    fn producer_consumer_many_items() {
        let q = Arc::new(BoundedQueue::new(4));
        let q2 = Arc::clone(&q);
        let producer = thread::spawn(move || {
            for i in 0..1000u32 {
                q2.push(i).unwrap();
            }
            q2.sync();
        });
        let mut expected = 0;
        while let Some(v) = q.pop().unwrap() {
            assert_eq!(v, expected);
            expected += 1;
        }
        assert_eq!(expected, 1000);
        producer.join().unwrap();
    }
}
