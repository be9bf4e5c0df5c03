//! Bounded, drop-oldest frame buffer between the transport and the segmenter.
//!
//! The producer (network receive) never waits on the consumer: when the queue is full
//! the oldest frame is evicted. The consumer suspends in `pop` until a frame arrives
//! or the queue is closed.

use crate::audio::AudioFrame;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;
use tracing::trace;

/// Result of a `push`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queue was full; the oldest frame was dropped to make room.
    Evicted,
    /// Queue is closed; the frame was discarded.
    Closed,
}

struct Inner {
    frames: VecDeque<AudioFrame>,
    closed: bool,
}

pub struct FrameQueue {
    capacity: usize,
    inner: Mutex<Inner>,
    available: Notify,
    dropped: AtomicU64,
}

impl FrameQueue {
    /// Create a queue holding at most `capacity` frames (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(Inner {
                frames: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            available: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, frame: AudioFrame) -> PushOutcome {
        let outcome = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return PushOutcome::Closed;
            }
            let outcome = if inner.frames.len() >= self.capacity {
                inner.frames.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                PushOutcome::Evicted
            } else {
                PushOutcome::Queued
            };
            inner.frames.push_back(frame);
            outcome
        };
        if outcome == PushOutcome::Evicted {
            trace!("frame queue full, dropped oldest frame");
        }
        self.available.notify_one();
        outcome
    }

    /// Next frame in arrival order, or `None` once the queue is closed.
    pub async fn pop(&self) -> Option<AudioFrame> {
        loop {
            // Register interest before checking so a concurrent push/close is not missed.
            let notified = self.available.notified();
            {
                let mut inner = self.inner.lock();
                if inner.closed {
                    return None;
                }
                if let Some(frame) = inner.frames.pop_front() {
                    return Some(frame);
                }
            }
            notified.await;
        }
    }

    /// Close the queue. Idempotent; pending and future pops return `None`.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.frames.clear();
        }
        self.available.notify_waiters();
        // A pop that registered with notify_one semantics still needs a permit.
        self.available.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames evicted because the consumer fell behind.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn frame(tag: i16) -> AudioFrame {
        AudioFrame::new(vec![tag; 4])
    }

    #[test]
    fn test_length_is_min_of_pushes_and_capacity() {
        for capacity in [1usize, 3, 8] {
            for pushes in 0..20usize {
                let queue = FrameQueue::new(capacity);
                for i in 0..pushes {
                    queue.push(frame(i as i16));
                }
                assert_eq!(queue.len(), pushes.min(capacity));
                assert_eq!(queue.dropped() as usize, pushes.saturating_sub(capacity));
            }
        }
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        let queue = FrameQueue::new(3);
        for i in 0..5 {
            queue.push(frame(i));
        }
        let drained: Vec<i16> = tokio_test::block_on(async {
            let mut out = Vec::new();
            while !queue.is_empty() {
                out.push(queue.pop().await.unwrap().samples()[0]);
            }
            out
        });
        assert_eq!(drained, vec![2, 3, 4]);
    }

    #[test]
    fn test_push_after_close_is_discarded() {
        let queue = FrameQueue::new(2);
        queue.close();
        queue.close();
        assert_eq!(queue.push(frame(1)), PushOutcome::Closed);
        assert!(queue.is_empty());
        assert!(tokio_test::block_on(queue.pop()).is_none());
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = Arc::new(FrameQueue::new(4));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(frame(7));
        let got = consumer.await.unwrap().unwrap();
        assert_eq!(got.samples()[0], 7);
    }

    #[tokio::test]
    async fn test_close_unblocks_all_pending_pops() {
        let queue = Arc::new(FrameQueue::new(4));
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let queue = Arc::clone(&queue);
                tokio::spawn(async move { queue.pop().await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();
        for waiter in waiters {
            let result = tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .expect("pop did not unblock")
                .unwrap();
            assert!(result.is_none());
        }
    }
}
