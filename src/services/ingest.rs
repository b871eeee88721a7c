//! Bounded per-venue sample queue
//!
//! Ingestion must never block a source, and on overflow the *oldest* samples
//! are discarded: a newer sample for the same track supersedes an older one,
//! so the head of the queue is the cheapest thing to lose. A plain bounded
//! channel drops the newest instead, hence the explicit deque.

use crate::domain::types::TrackSample;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

struct QueueInner {
    deque: Mutex<VecDeque<TrackSample>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
    closed: AtomicBool,
}

/// Multi-producer single-consumer sample queue with drop-oldest overflow
#[derive(Clone)]
pub struct SampleQueue {
    inner: Arc<QueueInner>,
}

impl SampleQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                deque: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
                notify: Notify::new(),
                capacity: capacity.max(1),
                dropped: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Enqueue a sample. Returns `true` if an older sample was evicted to
    /// make room.
    pub fn push(&self, sample: TrackSample) -> bool {
        if self.inner.closed.load(Ordering::Acquire) {
            return false;
        }
        let evicted = {
            let mut deque = self.inner.deque.lock();
            let evicted = if deque.len() >= self.inner.capacity {
                deque.pop_front();
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                true
            } else {
                false
            };
            deque.push_back(sample);
            evicted
        };
        self.inner.notify.notify_one();
        evicted
    }

    /// Pop up to `max` samples into `out`, waiting while the queue is empty.
    /// Returns `false` once the queue is closed and fully drained.
    pub async fn pop_many(&self, out: &mut Vec<TrackSample>, max: usize) -> bool {
        loop {
            {
                let mut deque = self.inner.deque.lock();
                if !deque.is_empty() {
                    let take = deque.len().min(max);
                    out.extend(deque.drain(..take));
                    return true;
                }
            }
            if self.inner.closed.load(Ordering::Acquire) {
                return false;
            }
            self.inner.notify.notified().await;
        }
    }

    /// Drain whatever is queued without waiting (shutdown path)
    pub fn drain(&self, out: &mut Vec<TrackSample>) {
        let mut deque = self.inner.deque.lock();
        out.extend(deque.drain(..));
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
        self.inner.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.inner.deque.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{ObjectType, VenueId};

    fn sample(id: i64, ts: u64) -> TrackSample {
        TrackSample {
            venue_id: VenueId(1),
            source_id: "mock".to_string(),
            source_track_id: id,
            ts,
            x: 0.0,
            z: 0.0,
            vx: None,
            vz: None,
            object_type: ObjectType::Person,
        }
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let queue = SampleQueue::new(2);
        assert!(!queue.push(sample(1, 100)));
        assert!(!queue.push(sample(2, 200)));
        assert!(queue.push(sample(3, 300)));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 1);

        let mut out = Vec::new();
        queue.drain(&mut out);
        // The t=100 sample was the one evicted
        assert_eq!(out.iter().map(|s| s.ts).collect::<Vec<_>>(), vec![200, 300]);
    }

    #[tokio::test]
    async fn test_pop_many_batches_and_closes() {
        let queue = SampleQueue::new(16);
        queue.push(sample(1, 1));
        queue.push(sample(1, 2));
        queue.push(sample(1, 3));

        let mut out = Vec::new();
        assert!(queue.pop_many(&mut out, 2).await);
        assert_eq!(out.len(), 2);

        out.clear();
        assert!(queue.pop_many(&mut out, 10).await);
        assert_eq!(out.len(), 1);

        queue.close();
        out.clear();
        assert!(!queue.pop_many(&mut out, 10).await);
        assert!(!queue.push(sample(1, 4)));
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let queue = SampleQueue::new(16);
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let mut out = Vec::new();
                queue.pop_many(&mut out, 10).await;
                out.len()
            })
        };
        tokio::task::yield_now().await;
        queue.push(sample(1, 1));
        assert_eq!(consumer.await.unwrap(), 1);
    }
}
