//! Bounded, blocking handoff between the modulator and transmit threads.
//!
//! The queue is deliberately shallow: eight frames tolerate short scheduling
//! jitter without accumulating latency, which matters when every frame has
//! an absolute emission deadline. A full queue blocks the producer, pushing
//! backpressure towards the modulator; an empty (or underfilled) queue
//! blocks the consumer until a prebuffer target is reached, giving the
//! transmitter a runway after cold start or an underrun.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Condvar, Mutex};

use crate::types::FrameEnvelope;

/// Maximum number of frames waiting between modulator and transmitter.
pub const MAX_DEPTH: usize = 8;

/// Error returned when the queue has been closed for shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueClosed;

impl fmt::Display for QueueClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame queue closed")
    }
}

impl std::error::Error for QueueClosed {}

#[derive(Debug)]
struct Inner {
    frames: VecDeque<FrameEnvelope>,
    closed: bool,
}

/// FIFO of frame envelopes with blocking push and prebuffered pop.
#[derive(Debug)]
pub struct FrameQueue {
    inner: Mutex<Inner>,
    not_full: Condvar,
    available: Condvar,
    capacity: usize,
}

impl FrameQueue {
    pub fn new() -> Self {
        Self::with_capacity(MAX_DEPTH)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                frames: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_full: Condvar::new(),
            available: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// Push one frame, blocking while the queue is at capacity.
    ///
    /// Returns the queue length after the push, or `QueueClosed` once
    /// [`close`](Self::close) has been called.
    pub fn push_wait_if_full(&self, frame: FrameEnvelope) -> Result<usize, QueueClosed> {
        let mut guard = self.inner.lock().unwrap();
        while guard.frames.len() >= self.capacity && !guard.closed {
            guard = self.not_full.wait(guard).unwrap();
        }
        if guard.closed {
            return Err(QueueClosed);
        }
        guard.frames.push_back(frame);
        let len = guard.frames.len();
        self.available.notify_all();
        Ok(len)
    }

    /// Pop one frame, blocking until at least `prebuffer` frames are queued.
    ///
    /// `prebuffer` is clamped to `[1, capacity]`. Returns `None` once the
    /// queue has been closed.
    pub fn wait_and_pop(&self, prebuffer: usize) -> Option<FrameEnvelope> {
        let want = prebuffer.clamp(1, self.capacity);
        let mut guard = self.inner.lock().unwrap();
        while guard.frames.len() < want && !guard.closed {
            guard = self.available.wait(guard).unwrap();
        }
        if guard.closed {
            return None;
        }
        let frame = guard.frames.pop_front();
        self.not_full.notify_all();
        frame
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close the queue and wake every blocked producer and consumer.
    pub fn close(&self) {
        let mut guard = self.inner.lock().unwrap();
        guard.closed = true;
        guard.frames.clear();
        self.not_full.notify_all();
        self.available.notify_all();
    }
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timestamp::FrameTimestamp;
    use crate::types::IQSample;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn frame(tag: f32) -> FrameEnvelope {
        FrameEnvelope::new(vec![IQSample::new(tag, 0.0); 4], FrameTimestamp::new(0, 0))
    }

    #[test]
    fn test_fifo_order() {
        let queue = FrameQueue::new();
        for i in 0..5 {
            queue.push_wait_if_full(frame(i as f32)).unwrap();
        }
        for i in 0..5 {
            let f = queue.wait_and_pop(1).unwrap();
            assert_eq!(f.samples[0].re, i as f32);
        }
    }

    #[test]
    fn test_backpressure_blocks_producer() {
        let queue = Arc::new(FrameQueue::new());
        let producer_queue = Arc::clone(&queue);
        let producer = thread::spawn(move || {
            for i in 0..(MAX_DEPTH + 2) {
                producer_queue.push_wait_if_full(frame(i as f32)).unwrap();
            }
        });

        // Give the producer time to fill the queue and block.
        thread::sleep(Duration::from_millis(100));
        assert_eq!(queue.len(), MAX_DEPTH);
        assert!(!producer.is_finished());

        // Draining unblocks it; no frame is lost and order is kept.
        for i in 0..(MAX_DEPTH + 2) {
            let f = queue.wait_and_pop(1).unwrap();
            assert_eq!(f.samples[0].re, i as f32);
        }
        producer.join().unwrap();
    }

    #[test]
    fn test_pop_waits_for_prebuffer() {
        let queue = Arc::new(FrameQueue::new());
        let consumer_queue = Arc::clone(&queue);
        let consumer = thread::spawn(move || consumer_queue.wait_and_pop(3));

        queue.push_wait_if_full(frame(0.0)).unwrap();
        queue.push_wait_if_full(frame(1.0)).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(!consumer.is_finished());

        queue.push_wait_if_full(frame(2.0)).unwrap();
        let popped = consumer.join().unwrap().unwrap();
        assert_eq!(popped.samples[0].re, 0.0);
    }

    #[test]
    fn test_close_wakes_consumer() {
        let queue = Arc::new(FrameQueue::new());
        let consumer_queue = Arc::clone(&queue);
        let consumer = thread::spawn(move || consumer_queue.wait_and_pop(1));
        thread::sleep(Duration::from_millis(50));
        queue.close();
        assert!(consumer.join().unwrap().is_none());
        assert_eq!(queue.push_wait_if_full(frame(0.0)), Err(QueueClosed));
    }
}
