//! Bounded frame queue between a capture context and its source
//!
//! One producer appends, one consumer drains. When the queue is full the
//! oldest buffer is dropped so the consumer always sees the freshest data.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

use super::frame::CapturedBuffer;

pub struct FrameQueue {
    inner: Mutex<VecDeque<CapturedBuffer>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a buffer, evicting the oldest one if the queue is full
    pub fn push(&self, buffer: CapturedBuffer) {
        {
            let mut queue = self.inner.lock();
            while queue.len() >= self.capacity {
                queue.pop_front();
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                trace!("Queue full, dropped frame (total {})", dropped);
            }
            queue.push_back(buffer);
        }
        self.notify.notify_one();
    }

    /// Take the oldest buffer without waiting
    pub fn try_pop(&self) -> Option<CapturedBuffer> {
        self.inner.lock().pop_front()
    }

    /// Wait for the next buffer. Returns `None` once the queue is closed
    /// and drained.
    pub async fn pop(&self) -> Option<CapturedBuffer> {
        loop {
            if let Some(buffer) = self.try_pop() {
                return Some(buffer);
            }
            if self.is_closed() {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// Mark the producer as gone and wake the consumer
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Buffers evicted because the consumer fell behind
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
