// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use crate::{
    frame::Frame,
    protocol::{DataError, VIRTUAL_CHANNEL_UNDEFINED},
};
use log::debug;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Condvar, Mutex, MutexGuard,
    },
    time::{Duration, Instant},
};

/// FIFO between the data receiver and the consumer.
///
/// The queue holds at most `max_count` frames.  An enqueue beyond that
/// discards the oldest frames and puts one `FrameQueueTrimmed` error frame
/// at the head.  While stopped the queue refuses frames, they are released
/// right away.
#[derive(Debug, Default)]
pub struct FrameQueue {
    frames: Mutex<VecDeque<Frame>>,
    available: Condvar,
    accepting: AtomicBool,
    max_count: AtomicUsize,
}

impl FrameQueue {
    /// Creates a stopped queue, `max_count` 0 means unlimited.
    pub fn new(max_count: usize) -> FrameQueue {
        FrameQueue {
            max_count: AtomicUsize::new(max_count),
            ..Default::default()
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Frame>> {
        self.frames
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Trims the queue down to `max` frames including the trim marker.
    /// Returns the discarded frames so they are released outside the lock.
    fn trim(frames: &mut VecDeque<Frame>, max: usize) -> Vec<Frame> {
        if max == 0 || frames.len() <= max {
            return Vec::new();
        }
        let excess = frames.len() - max + 1;
        let trimmed = frames.drain(..excess).collect();
        frames.push_front(Frame::error(
            DataError::FrameQueueTrimmed,
            VIRTUAL_CHANNEL_UNDEFINED,
        ));
        trimmed
    }

    pub fn enqueue(&self, frame: Frame) {
        if !self.accepting.load(Ordering::Acquire) {
            return;
        }

        let trimmed = {
            let mut frames = self.lock();
            frames.push_back(frame);
            Self::trim(&mut frames, self.max_count.load(Ordering::Relaxed))
        };
        self.available.notify_one();

        if !trimmed.is_empty() {
            debug!("frame queue full, discarded {} frames", trimmed.len());
        }
    }

    /// Waits for a frame.  Returns `None` on timeout or when the queue is
    /// stopped.  A zero timeout waits until a frame arrives or `stop`.
    pub fn blocking_dequeue(&self, timeout: Duration) -> Option<Frame> {
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        let mut frames = self.lock();

        loop {
            if let Some(frame) = frames.pop_front() {
                return Some(frame);
            }
            if !self.accepting.load(Ordering::Acquire) {
                return None;
            }

            frames = match deadline {
                None => self
                    .available
                    .wait(frames)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    self.available
                        .wait_timeout(frames, deadline - now)
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .0
                }
            };
        }
    }

    /// Releases every queued frame.
    pub fn clear(&self) {
        let frames = std::mem::take(&mut *self.lock());
        drop(frames);
    }

    /// Accepts frames again and wakes threads waiting for that.
    pub fn start(&self) {
        self.accepting.store(true, Ordering::Release);
        self.wake();
    }

    /// Blocks while the queue is stopped, for at most `timeout`.  Any wakeup
    /// ends the wait early.  Returns whether the queue accepts frames.
    pub fn wait_accepting(&self, timeout: Duration) -> bool {
        let frames = self.lock();
        if self.accepting.load(Ordering::Acquire) {
            return true;
        }
        drop(
            self.available
                .wait_timeout(frames, timeout)
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        self.accepting.load(Ordering::Acquire)
    }

    /// Stops accepting frames and wakes every waiter.  Returns whether the
    /// queue had been accepting.
    pub fn stop(&self) -> bool {
        let was_accepting = self.accepting.swap(false, Ordering::AcqRel);
        self.wake();
        was_accepting
    }

    /// Wakes every waiter without changing state.
    pub fn wake(&self) {
        // taking the lock orders the wakeup after any waiter's check
        drop(self.lock());
        self.available.notify_all();
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Changes the cap, trimming queued frames if needed.
    pub fn set_max_count(&self, max_count: usize) {
        self.max_count.store(max_count, Ordering::Relaxed);
        let trimmed = Self::trim(&mut self.lock(), max_count);
        drop(trimmed);
    }

    pub fn max_count(&self) -> usize {
        self.max_count.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::FramePool;
    use std::{sync::Arc, thread};

    fn data_frame(pool: &FramePool, channel: u8) -> Frame {
        let mut buffer = pool.dequeue_frame().unwrap();
        buffer.set_virtual_channel(channel);
        Frame::from(buffer)
    }

    #[test]
    fn test_trim() {
        let pool = FramePool::new();
        pool.set_frame_buffer_size(8).unwrap();
        pool.set_frame_count(5).unwrap();

        let queue = FrameQueue::new(3);
        queue.start();
        for channel in 0..5 {
            queue.enqueue(data_frame(&pool, channel));
        }

        assert_eq!(queue.len(), 3);
        let head = queue.blocking_dequeue(Duration::from_millis(10)).unwrap();
        assert_eq!(head.data_error(), Some(DataError::FrameQueueTrimmed));
        assert_eq!(head.virtual_channel(), VIRTUAL_CHANNEL_UNDEFINED);

        // oldest frames were released back to the pool
        assert_eq!(pool.free_count(), 3);
        let next = queue.blocking_dequeue(Duration::from_millis(10)).unwrap();
        assert_eq!(next.virtual_channel(), 3);
        let last = queue.blocking_dequeue(Duration::from_millis(10)).unwrap();
        assert_eq!(last.virtual_channel(), 4);
    }

    #[test]
    fn test_cap_holds() {
        let queue = FrameQueue::new(2);
        queue.start();
        for code in 0..20 {
            queue.enqueue(Frame::error_code(code, 0, 0));
            assert!(queue.len() <= 2);
        }
        queue.set_max_count(1);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_stopped_releases() {
        let pool = FramePool::new();
        pool.set_frame_buffer_size(8).unwrap();
        pool.set_frame_count(1).unwrap();

        let queue = FrameQueue::new(0);
        queue.enqueue(data_frame(&pool, 0));
        assert!(queue.is_empty());
        assert_eq!(pool.free_count(), 1);
        assert!(queue.blocking_dequeue(Duration::ZERO).is_none());
    }

    #[test]
    fn test_timeout() {
        let queue = FrameQueue::new(0);
        queue.start();
        let start = Instant::now();
        assert!(queue.blocking_dequeue(Duration::from_millis(30)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_stop_wakes_waiter() {
        let queue = Arc::new(FrameQueue::new(0));
        queue.start();

        let waiter = {
            let queue = queue.clone();
            thread::spawn(move || queue.blocking_dequeue(Duration::ZERO))
        };
        thread::sleep(Duration::from_millis(20));
        assert!(queue.stop());
        assert!(!queue.stop());
        assert!(waiter.join().unwrap().is_none());
    }

    #[test]
    fn test_wait_accepting() {
        let queue = Arc::new(FrameQueue::new(0));

        let start = Instant::now();
        assert!(!queue.wait_accepting(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));

        let waiter = {
            let queue = queue.clone();
            thread::spawn(move || queue.wait_accepting(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        let start = Instant::now();
        queue.start();
        assert!(waiter.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(queue.wait_accepting(Duration::ZERO));
    }

    #[test]
    fn test_clear() {
        let pool = FramePool::new();
        pool.set_frame_buffer_size(8).unwrap();
        pool.set_frame_count(2).unwrap();

        let queue = FrameQueue::new(0);
        queue.start();
        queue.enqueue(data_frame(&pool, 0));
        queue.enqueue(data_frame(&pool, 1));
        assert_eq!(pool.free_count(), 0);
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(pool.free_count(), 2);
    }
}
