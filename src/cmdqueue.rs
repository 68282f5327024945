//! Bounded command queue with explicit drop-oldest backpressure.
//!
//! A plain channel can only refuse a push when full; this queue needs the
//! *oldest* queued frame to be discarded so the newest one always gets in,
//! falling back to dropping the newest only if the queue still can't make
//! room (zero capacity). `crossbeam-channel` has no producer-side "evict
//! front" operation, so this is a small mutex + condvar ring buffer instead,
//! generalized from the "bounded queue with `put_nowait` + drop logic"
//! re-architecture instead.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Enqueued,
    DroppedOldest,
    DroppedNewest,
}

pub struct CmdQueue<T> {
    cap: usize,
    inner: Mutex<VecDeque<T>>,
    cv: Condvar,
}

impl<T> CmdQueue<T> {
    pub fn new(cap: usize) -> Self {
        CmdQueue { cap: cap.max(1), inner: Mutex::new(VecDeque::new()), cv: Condvar::new() }
    }

    /// Enqueues `item`. If the queue is full, drops the oldest entry first
    /// so the newest always has room; only a zero-capacity queue falls back
    /// to dropping the newest.
    pub fn push(&self, item: T) -> PushOutcome {
        let mut q = self.inner.lock().unwrap();
        let outcome = if q.len() >= self.cap {
            q.pop_front();
            PushOutcome::DroppedOldest
        } else {
            PushOutcome::Enqueued
        };
        if q.len() >= self.cap {
            return PushOutcome::DroppedNewest;
        }
        q.push_back(item);
        self.cv.notify_one();
        outcome
    }

    /// Blocks up to `timeout` for the next item.
    pub fn take(&self, timeout: Duration) -> Option<T> {
        let mut q = self.inner.lock().unwrap();
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(item) = q.pop_front() {
                return Some(item);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, res) = self.cv.wait_timeout(q, deadline - now).unwrap();
            q = guard;
            if res.timed_out() && q.is_empty() {
                return None;
            }
        }
    }

    /// Drains up to `max_n` additional items without blocking.
    pub fn drain_up_to(&self, max_n: usize) -> Vec<T> {
        let mut q = self.inner.lock().unwrap();
        let n = max_n.min(q.len());
        q.drain(..n).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn newest_wins_under_sustained_overload() {
        let q: CmdQueue<u32> = CmdQueue::new(4);
        for i in 0..20u32 {
            q.push(i);
        }
        assert_eq!(q.len(), 4);
        let drained: Vec<u32> = std::iter::from_fn(|| q.take(Duration::from_millis(1))).collect();
        // the last 4 pushed (16..20) must be exactly what's left, in order
        assert_eq!(drained, vec![16, 17, 18, 19]);
    }

    #[test]
    fn push_reports_drop_oldest_once_full() {
        let q: CmdQueue<u32> = CmdQueue::new(2);
        assert_eq!(q.push(1), PushOutcome::Enqueued);
        assert_eq!(q.push(2), PushOutcome::Enqueued);
        assert_eq!(q.push(3), PushOutcome::DroppedOldest);
        assert_eq!(q.take(Duration::from_millis(1)), Some(2));
        assert_eq!(q.take(Duration::from_millis(1)), Some(3));
    }

    #[test]
    fn take_blocks_until_push_or_timeout() {
        let q: Arc<CmdQueue<u32>> = Arc::new(CmdQueue::new(4));
        let q2 = q.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            q2.push(42);
        });
        let got = q.take(Duration::from_millis(500));
        assert_eq!(got, Some(42));
        handle.join().unwrap();

        assert_eq!(q.take(Duration::from_millis(20)), None);
    }
}
