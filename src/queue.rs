//! Thread-safe frame queue with explicit close semantics.
//!
//! Consumers that prefer pulling frames over handling them inside the
//! capture callback can push into a [`FrameQueue`] from the callback and pop
//! on their own thread. The engine itself never retains frames past the
//! callback invocation, so use of the queue is entirely optional.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Unbounded multi-producer multi-consumer FIFO.
///
/// Contracts:
/// - FIFO order is preserved across all producers and consumers, and no
///   element is ever observed twice.
/// - `push` after [`FrameQueue::close`] is silently discarded.
/// - `pop` blocks until a value arrives or the queue closes; once closed and
///   drained it returns the default-constructed sentinel.
/// - `close` wakes every blocked waiter in bounded time.
pub struct FrameQueue<T> {
    inner: Mutex<Inner<T>>,
    available: Condvar,
}

impl<T: Default> FrameQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Enqueues a value at the tail. Discarded if the queue is closed.
    pub fn push(&self, value: T) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.items.push_back(value);
        self.available.notify_one();
    }

    /// Blocks until a value is available or the queue is closed; returns the
    /// head value, or the sentinel once closed and empty.
    pub fn pop(&self) -> T {
        let mut inner = self.inner.lock();
        loop {
            if let Some(value) = inner.items.pop_front() {
                return value;
            }
            if inner.closed {
                return T::default();
            }
            self.available.wait(&mut inner);
        }
    }

    /// As [`FrameQueue::pop`], but gives up after `timeout` with `None`.
    /// Also returns `None` once the queue is closed and drained.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(value) = inner.items.pop_front() {
                return Some(value);
            }
            if inner.closed {
                return None;
            }
            if self.available.wait_for(&mut inner, timeout).timed_out() {
                return inner.items.pop_front();
            }
        }
    }

    /// Non-blocking pop; `None` when empty.
    pub fn try_pop(&self) -> Option<T> {
        self.inner.lock().items.pop_front()
    }

    /// Switches to closed and wakes all waiters. Remaining elements stay
    /// poppable; further pushes are no-ops.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }
}

impl<T: Default> Default for FrameQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn fifo_order_single_producer() {
        let q = FrameQueue::new();
        for i in 0..10 {
            q.push(i);
        }
        for i in 0..10 {
            assert_eq!(q.pop(), i);
        }
    }

    #[test]
    fn try_pop_on_empty_is_none() {
        let q: FrameQueue<u32> = FrameQueue::new();
        assert_eq!(q.try_pop(), None);
        assert!(q.is_empty());
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn pop_timeout_expires_on_empty_queue() {
        let q: FrameQueue<u32> = FrameQueue::new();
        let start = std::time::Instant::now();
        assert_eq!(q.pop_timeout(Duration::from_millis(20)), None);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn close_drains_then_yields_sentinel() {
        let q = FrameQueue::new();
        q.push(1);
        q.push(2);
        q.close();
        q.push(3); // discarded
        assert_eq!(q.pop(), 1);
        assert_eq!(q.pop(), 2);
        assert_eq!(q.pop(), 0); // sentinel
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn close_unblocks_waiting_consumer() {
        let q: Arc<FrameQueue<u32>> = Arc::new(FrameQueue::new());
        let q2 = Arc::clone(&q);

        let consumer = std::thread::spawn(move || q2.pop());
        std::thread::sleep(Duration::from_millis(20));

        let start = std::time::Instant::now();
        q.close();
        let value = consumer.join().unwrap();
        assert!(start.elapsed() < Duration::from_millis(100));
        assert_eq!(value, 0);
    }

    #[test]
    fn multi_producer_values_observed_exactly_once() {
        let q: Arc<FrameQueue<u32>> = Arc::new(FrameQueue::new());

        let producers: Vec<_> = (0..4)
            .map(|p| {
                let q = Arc::clone(&q);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        q.push(p * 100 + i);
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }
        q.close();

        let mut seen = std::collections::BTreeSet::new();
        let mut per_producer_last = [None::<u32>; 4];
        loop {
            let Some(v) = q.try_pop() else { break };
            assert!(seen.insert(v), "value {v} observed twice");
            // Order within one producer's sequence is preserved.
            let p = (v / 100) as usize;
            if let Some(prev) = per_producer_last[p] {
                assert!(v > prev);
            }
            per_producer_last[p] = Some(v);
        }
        assert_eq!(seen.len(), 400);
    }
}
