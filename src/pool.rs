// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use crate::{error::Error, frame::FrameBuffer};
use log::{debug, error};
use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard},
};

/// One raw frame buffer owned by a pool.
pub(crate) struct Buffer {
    pub(crate) id: u64,
    pub(crate) data: Box<[u8]>,
}

#[derive(Default)]
struct PoolState {
    size: usize,
    count: usize,
    free: Vec<Buffer>,
    outstanding: HashSet<u64>,
    next_id: u64,
    closed: bool,
}

impl PoolState {
    fn allocate(&mut self) -> Buffer {
        let id = self.next_id;
        self.next_id += 1;
        Buffer {
            id,
            data: vec![0; self.size].into_boxed_slice(),
        }
    }

    fn total(&self) -> usize {
        self.free.len() + self.outstanding.len()
    }

    /// Allocates buffers until the configured count is met.  Nothing is
    /// allocated until the buffer size is known.
    fn fill(&mut self) {
        if self.size == 0 {
            return;
        }
        while self.total() < self.count {
            let buffer = self.allocate();
            self.free.push(buffer);
        }
    }
}

pub(crate) struct PoolInner {
    state: Mutex<PoolState>,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // the state stays consistent across every critical section
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns a buffer that was checked out of this pool.
    pub(crate) fn give_back(&self, mut buffer: Buffer) -> Result<(), Error> {
        let mut state = self.lock();
        if !state.outstanding.remove(&buffer.id) {
            return Err(Error::DoubleQueue);
        }

        if state.closed {
            debug!("frame buffer returned after its pool was destroyed, freeing");
            return Ok(());
        }
        if state.total() >= state.count {
            // pool shrank while this buffer was out
            return Ok(());
        }
        if buffer.data.len() != state.size {
            buffer.data = vec![0; state.size].into_boxed_slice();
        }
        state.free.push(buffer);
        Ok(())
    }

    fn dequeue(self: &Arc<Self>) -> Option<FrameBuffer> {
        let mut state = self.lock();
        let buffer = state.free.pop()?;
        state.outstanding.insert(buffer.id);
        Some(FrameBuffer::new(self.clone(), buffer))
    }
}

/// Fixed set of equally sized frame buffers.
///
/// Buffer size and count are configured separately and in either order,
/// the pool is usable once both are set.  Every buffer is either free or
/// checked out as a [`FrameBuffer`] which returns itself on drop.
pub struct FramePool {
    inner: Arc<PoolInner>,
}

/// Dequeue access to a pool for the data receivers.
#[derive(Clone)]
pub struct PoolHandle {
    inner: Arc<PoolInner>,
}

impl PoolHandle {
    /// Takes a free buffer, `None` if the pool is depleted.
    pub fn dequeue_frame(&self) -> Option<FrameBuffer> {
        self.inner.dequeue()
    }
}

impl Default for FramePool {
    fn default() -> Self {
        FramePool::new()
    }
}

impl FramePool {
    pub fn new() -> FramePool {
        FramePool {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    pub fn handle(&self) -> PoolHandle {
        PoolHandle {
            inner: self.inner.clone(),
        }
    }

    /// Sets the capacity of every buffer.  Free buffers are reallocated
    /// now, checked out ones when they come back.
    pub fn set_frame_buffer_size(&self, size: usize) -> Result<(), Error> {
        if size == 0 {
            return Err(Error::Argument("frame buffer size must not be 0".to_string()));
        }

        let mut state = self.inner.lock();
        if state.size != size {
            state.size = size;
            for buffer in state.free.iter_mut() {
                buffer.data = vec![0; size].into_boxed_slice();
            }
        }
        state.fill();
        Ok(())
    }

    /// Sets the number of buffers.  Shrinking can only release free
    /// buffers, the pool stays larger if too many are checked out.
    pub fn set_frame_count(&self, count: usize) -> Result<(), Error> {
        if count == 0 {
            return Err(Error::Argument("frame count must not be 0".to_string()));
        }

        let mut state = self.inner.lock();
        state.count = count;
        if state.total() < count {
            state.fill();
            return Ok(());
        }

        while state.total() > count && state.free.pop().is_some() {}
        if state.total() > count {
            error!(
                "frame pool shrink to {} incomplete, {} buffers still in use",
                count,
                state.outstanding.len()
            );
            return Err(Error::BridgeData(format!(
                "cannot shrink frame pool to {}, {} buffers still in use",
                count,
                state.outstanding.len()
            )));
        }
        Ok(())
    }

    /// Takes a free buffer, `None` if the pool is depleted.
    pub fn dequeue_frame(&self) -> Option<FrameBuffer> {
        self.inner.dequeue()
    }

    /// Returns a buffer explicitly.  Dropping the buffer does the same.
    pub fn queue_frame(&self, frame: FrameBuffer) -> Result<(), Error> {
        if !Arc::ptr_eq(frame.pool(), &self.inner) {
            error!("frame buffer queued to a pool it does not belong to");
            // dropping it sends it home
            return Err(Error::AlienFrame);
        }
        match frame.take_buffer() {
            Some(buffer) => self.inner.give_back(buffer).map_err(|err| {
                error!("frame buffer queue failed: {}", err);
                err
            }),
            None => Err(Error::DoubleQueue),
        }
    }

    /// True once both buffer size and count are configured.
    pub fn initialized(&self) -> bool {
        let state = self.inner.lock();
        state.size > 0 && state.count > 0
    }

    pub fn frame_buffer_size(&self) -> usize {
        self.inner.lock().size
    }

    pub fn frame_count(&self) -> usize {
        self.inner.lock().count
    }

    pub fn free_count(&self) -> usize {
        self.inner.lock().free.len()
    }

    /// Number of buffers currently checked out.
    pub fn outstanding_count(&self) -> usize {
        self.inner.lock().outstanding.len()
    }
}

impl Drop for FramePool {
    fn drop(&mut self) {
        let mut state = self.inner.lock();
        if !state.outstanding.is_empty() {
            error!(
                "frame pool destroyed with {} buffers still in use",
                state.outstanding.len()
            );
        }
        state.closed = true;
        state.free.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configure_either_order() {
        let pool = FramePool::new();
        assert!(!pool.initialized());
        assert!(pool.dequeue_frame().is_none());

        pool.set_frame_count(3).unwrap();
        assert!(!pool.initialized());
        assert_eq!(pool.free_count(), 0);

        pool.set_frame_buffer_size(64).unwrap();
        assert!(pool.initialized());
        assert_eq!(pool.free_count(), 3);
        assert_eq!(pool.dequeue_frame().unwrap().capacity(), 64);

        let pool = FramePool::new();
        pool.set_frame_buffer_size(32).unwrap();
        pool.set_frame_count(2).unwrap();
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn test_invalid_arguments() {
        let pool = FramePool::new();
        assert!(matches!(pool.set_frame_buffer_size(0), Err(Error::Argument(_))));
        assert!(matches!(pool.set_frame_count(0), Err(Error::Argument(_))));
        assert!(!pool.initialized());
    }

    #[test]
    fn test_conservation() {
        let pool = FramePool::new();
        pool.set_frame_buffer_size(16).unwrap();
        pool.set_frame_count(4).unwrap();

        let a = pool.dequeue_frame().unwrap();
        let b = pool.dequeue_frame().unwrap();
        assert_eq!(pool.free_count() + pool.outstanding_count(), 4);

        pool.queue_frame(a).unwrap();
        drop(b);
        assert_eq!(pool.free_count(), 4);
        assert_eq!(pool.outstanding_count(), 0);
    }

    #[test]
    fn test_alien_frame() {
        let pool = FramePool::new();
        pool.set_frame_buffer_size(16).unwrap();
        pool.set_frame_count(1).unwrap();
        let other = FramePool::new();
        other.set_frame_buffer_size(16).unwrap();
        other.set_frame_count(1).unwrap();

        let frame = other.dequeue_frame().unwrap();
        assert!(matches!(pool.queue_frame(frame), Err(Error::AlienFrame)));
        // the alien buffer went back to where it came from
        assert_eq!(other.free_count(), 1);
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn test_resize_outstanding() {
        let pool = FramePool::new();
        pool.set_frame_buffer_size(16).unwrap();
        pool.set_frame_count(2).unwrap();

        let frame = pool.dequeue_frame().unwrap();
        pool.set_frame_buffer_size(128).unwrap();
        drop(frame);

        let a = pool.dequeue_frame().unwrap();
        let b = pool.dequeue_frame().unwrap();
        assert_eq!(a.capacity(), 128);
        assert_eq!(b.capacity(), 128);
    }

    #[test]
    fn test_shrink_in_use() {
        let pool = FramePool::new();
        pool.set_frame_buffer_size(16).unwrap();
        pool.set_frame_count(3).unwrap();

        let a = pool.dequeue_frame().unwrap();
        let b = pool.dequeue_frame().unwrap();
        assert!(matches!(pool.set_frame_count(1), Err(Error::BridgeData(_))));
        assert_eq!(pool.free_count(), 0);

        // returned buffers beyond the new count are released
        drop(a);
        drop(b);
        assert_eq!(pool.free_count(), 1);

        pool.set_frame_count(5).unwrap();
        assert_eq!(pool.free_count(), 5);
    }

    #[test]
    fn test_late_return() {
        let pool = FramePool::new();
        pool.set_frame_buffer_size(16).unwrap();
        pool.set_frame_count(1).unwrap();
        let handle = pool.handle();

        let frame = handle.dequeue_frame().unwrap();
        drop(pool);
        drop(frame);
        assert!(handle.dequeue_frame().is_none());
    }
}
