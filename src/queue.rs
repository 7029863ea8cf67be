//! Consumer-facing bounded queues
//!
//! The overflow bridge never owns the queue its consumers read from; it is
//! handed one that implements [`TargetQueue`]. [`BoundedQueue`] is the
//! implementation used by the message publishers and the tests.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// A bounded, thread-safe queue the bridge delivers into
pub trait TargetQueue<T>: Send + Sync {
    /// Insert without blocking, handing the item back if there is no room
    fn offer(&self, item: T) -> Result<(), T>;

    /// Insert, waiting up to `timeout` for room
    fn offer_timeout(&self, item: T, timeout: Duration) -> Result<(), T>;

    /// Remove the head, waiting up to `timeout` for one to arrive
    fn poll_timeout(&self, timeout: Duration) -> Option<T>;

    /// Remove the head, waiting as long as it takes
    fn take(&self) -> T;

    /// Remove the head if there is one
    fn try_poll(&self) -> Option<T> {
        self.poll_timeout(Duration::ZERO)
    }

    /// Free slots
    fn remaining_capacity(&self) -> usize;

    /// Items currently queued
    fn len(&self) -> usize;

    /// Whether no items are queued
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fixed-capacity FIFO guarded by a mutex and two condition variables
pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Maximum number of items
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Remove and return everything queued
    pub fn drain(&self) -> Vec<T> {
        let mut items = self.items.lock();
        let drained: Vec<T> = items.drain(..).collect();
        drop(items);

        self.not_full.notify_all();
        drained
    }
}

impl<T: Send> TargetQueue<T> for BoundedQueue<T> {
    fn offer(&self, item: T) -> Result<(), T> {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            return Err(item);
        }

        items.push_back(item);
        drop(items);

        self.not_empty.notify_one();
        Ok(())
    }

    fn offer_timeout(&self, item: T, timeout: Duration) -> Result<(), T> {
        let deadline = Instant::now() + timeout;
        let mut items = self.items.lock();

        while items.len() >= self.capacity {
            if self.not_full.wait_until(&mut items, deadline).timed_out()
                && items.len() >= self.capacity
            {
                return Err(item);
            }
        }

        items.push_back(item);
        drop(items);

        self.not_empty.notify_one();
        Ok(())
    }

    fn poll_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut items = self.items.lock();

        loop {
            if let Some(item) = items.pop_front() {
                drop(items);
                self.not_full.notify_one();
                return Some(item);
            }

            if self.not_empty.wait_until(&mut items, deadline).timed_out() {
                let item = items.pop_front();
                drop(items);
                if item.is_some() {
                    self.not_full.notify_one();
                }
                return item;
            }
        }
    }

    fn take(&self) -> T {
        let mut items = self.items.lock();

        loop {
            if let Some(item) = items.pop_front() {
                drop(items);
                self.not_full.notify_one();
                return item;
            }

            self.not_empty.wait(&mut items);
        }
    }

    fn remaining_capacity(&self) -> usize {
        self.capacity.saturating_sub(self.items.lock().len())
    }

    fn len(&self) -> usize {
        self.items.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_offer_respects_capacity() {
        let queue = BoundedQueue::new(2);
        assert!(queue.offer(1).is_ok());
        assert!(queue.offer(2).is_ok());
        assert_eq!(queue.offer(3), Err(3));
        assert_eq!(queue.remaining_capacity(), 0);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_fifo_order() {
        let queue = BoundedQueue::new(8);
        for i in 0..5 {
            queue.offer(i).unwrap();
        }
        let out: Vec<i32> = std::iter::from_fn(|| queue.try_poll()).collect();
        assert_eq!(out, vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_poll_timeout_expires() {
        let queue: BoundedQueue<u8> = BoundedQueue::new(1);
        let start = Instant::now();
        assert_eq!(queue.poll_timeout(Duration::from_millis(20)), None);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_take_wakes_on_offer() {
        let queue = Arc::new(BoundedQueue::new(1));
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.take())
        };

        thread::sleep(Duration::from_millis(10));
        queue.offer(99u32).unwrap();
        assert_eq!(consumer.join().unwrap(), 99);
    }

    #[test]
    fn test_offer_timeout_waits_for_room() {
        let queue = Arc::new(BoundedQueue::new(1));
        queue.offer(1u32).unwrap();

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                queue.try_poll()
            })
        };

        assert!(queue.offer_timeout(2, Duration::from_secs(5)).is_ok());
        assert_eq!(consumer.join().unwrap(), Some(1));
        assert_eq!(queue.try_poll(), Some(2));
    }

    #[test]
    fn test_offer_timeout_gives_item_back() {
        let queue = BoundedQueue::new(1);
        queue.offer("a").unwrap();
        assert_eq!(queue.offer_timeout("b", Duration::from_millis(5)), Err("b"));
    }

    #[test]
    fn test_drain() {
        let queue = BoundedQueue::new(3);
        queue.offer(1).unwrap();
        queue.offer(2).unwrap();
        assert_eq!(queue.drain(), vec![1, 2]);
        assert_eq!(queue.remaining_capacity(), 3);
    }
}
