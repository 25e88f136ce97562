//! Bounded queue that drops the oldest entry instead of blocking the producer.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Multi-producer, multi-consumer FIFO with a fixed capacity.
///
/// `push` never blocks: when full, the oldest entry is evicted. Consumers
/// either wait with a timeout (`pop_timeout`) or take what is there now
/// (`drain_latest`). A poisoned lock is recovered, since entries are plain
/// values and stay consistent.
pub struct DropOldestQueue<T> {
    inner: Mutex<VecDeque<T>>,
    available: Condvar,
    capacity: usize,
}

impl<T> DropOldestQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            available: Condvar::new(),
            capacity,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<T>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue `item`. Returns how many old entries were evicted to make room.
    pub fn push(&self, item: T) -> usize {
        let mut queue = self.lock();
        let mut dropped = 0;
        while queue.len() >= self.capacity {
            queue.pop_front();
            dropped += 1;
        }
        queue.push_back(item);
        drop(queue);
        self.available.notify_one();
        dropped
    }

    /// Oldest entry, waiting up to `timeout` for one to arrive.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let queue = self.lock();
        let (mut queue, _) = self
            .available
            .wait_timeout_while(queue, timeout, |q| q.is_empty())
            .unwrap_or_else(|e| e.into_inner());
        queue.pop_front()
    }

    /// Non-blocking: newest entry, discarding everything older.
    /// Returns the entry and how many were discarded.
    pub fn drain_latest(&self) -> Option<(T, usize)> {
        let mut queue = self.lock();
        let latest = queue.pop_back()?;
        let discarded = queue.len();
        queue.clear();
        Some((latest, discarded))
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Wake every waiting consumer, e.g. on shutdown.
    pub fn notify_all(&self) {
        self.available.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn push_evicts_oldest_when_full() {
        let q = DropOldestQueue::new(2);
        assert_eq!(q.push(1), 0);
        assert_eq!(q.push(2), 0);
        assert_eq!(q.push(3), 1);
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop_timeout(Duration::ZERO), Some(2));
        assert_eq!(q.pop_timeout(Duration::ZERO), Some(3));
        assert_eq!(q.pop_timeout(Duration::ZERO), None);
    }

    #[test]
    fn drain_latest_keeps_only_newest() {
        let q = DropOldestQueue::new(4);
        assert!(q.drain_latest().is_none());
        for i in 0..4 {
            q.push(i);
        }
        assert_eq!(q.drain_latest(), Some((3, 3)));
        assert!(q.is_empty());
    }

    #[test]
    fn pop_timeout_returns_after_deadline() {
        let q: DropOldestQueue<u32> = DropOldestQueue::new(1);
        let start = Instant::now();
        assert_eq!(q.pop_timeout(Duration::from_millis(30)), None);
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn pop_timeout_wakes_on_push() {
        let q = Arc::new(DropOldestQueue::new(2));
        let producer = {
            let q = q.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                q.push(7u32);
            })
        };
        assert_eq!(q.pop_timeout(Duration::from_secs(5)), Some(7));
        producer.join().expect("producer");
    }
}
