// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Frames delivered to the application.
//!
//! A data frame wraps a pool buffer.  Cloning a [`Frame`] holds it, dropping
//! the last clone releases it and the buffer goes back to its pool.  Error
//! frames carry only a status code and are never pool backed.

use crate::{
    error::Error,
    pool::{Buffer, PoolInner},
    protocol::{DataError, VIRTUAL_CHANNEL_UNDEFINED},
};
use log::error;
use std::{fmt, sync::Arc};

/// A pool buffer checked out for exclusive use, typically by a data
/// receiver reassembling packets into it.  Dropping it returns the buffer
/// to the pool it came from.
pub struct FrameBuffer {
    pool: Arc<PoolInner>,
    buffer: Option<Buffer>,
    offset: usize,
    size: usize,
    channel: u8,
    timestamp: u64,
}

impl FrameBuffer {
    pub(crate) fn new(pool: Arc<PoolInner>, buffer: Buffer) -> FrameBuffer {
        FrameBuffer {
            pool,
            buffer: Some(buffer),
            offset: 0,
            size: 0,
            channel: VIRTUAL_CHANNEL_UNDEFINED,
            timestamp: 0,
        }
    }

    pub(crate) fn pool(&self) -> &Arc<PoolInner> {
        &self.pool
    }

    /// Detaches the raw buffer, the caller becomes responsible for handing
    /// it back to the pool.
    pub(crate) fn take_buffer(mut self) -> Option<Buffer> {
        self.buffer.take()
    }

    /// Fixed capacity of the underlying buffer.
    pub fn capacity(&self) -> usize {
        self.buffer.as_ref().map(|b| b.data.len()).unwrap_or(0)
    }

    /// The whole buffer, regardless of the data window.
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        match self.buffer.as_mut() {
            Some(buffer) => &mut buffer.data,
            None => &mut [],
        }
    }

    pub fn buffer(&self) -> &[u8] {
        match self.buffer.as_ref() {
            Some(buffer) => &buffer.data,
            None => &[],
        }
    }

    /// Sets the window of valid data inside the buffer.
    pub fn set_data_window(&mut self, offset: usize, size: usize) -> Result<(), Error> {
        if offset + size > self.capacity() {
            return Err(Error::Argument(format!(
                "data window {}+{} exceeds frame capacity {}",
                offset,
                size,
                self.capacity()
            )));
        }
        self.offset = offset;
        self.size = size;
        Ok(())
    }

    pub fn data(&self) -> &[u8] {
        &self.buffer()[self.offset..self.offset + self.size]
    }

    pub fn virtual_channel(&self) -> u8 {
        self.channel
    }

    pub fn set_virtual_channel(&mut self, channel: u8) {
        self.channel = channel;
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn set_timestamp(&mut self, timestamp: u64) {
        self.timestamp = timestamp;
    }
}

impl Drop for FrameBuffer {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            if let Err(err) = self.pool.give_back(buffer) {
                error!("frame buffer release failed: {}", err);
            }
        }
    }
}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("capacity", &self.capacity())
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("channel", &self.channel)
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

/// A frame that carries a status code instead of data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorFrame {
    pub code: u32,
    pub channel: u8,
    pub timestamp: u64,
}

/// A received frame or an error report from the data channel.
#[derive(Debug, Clone)]
pub enum Frame {
    Data(Arc<FrameBuffer>),
    Error(ErrorFrame),
}

impl Frame {
    pub fn error(error: DataError, channel: u8) -> Frame {
        Frame::error_code(error.code(), channel, 0)
    }

    pub fn error_code(code: u32, channel: u8, timestamp: u64) -> Frame {
        Frame::Error(ErrorFrame {
            code,
            channel,
            timestamp,
        })
    }

    /// Takes another reference on the frame.
    pub fn hold(&self) -> Frame {
        self.clone()
    }

    /// Number of live references to a data frame, 1 for error frames.
    pub fn ref_count(&self) -> usize {
        match self {
            Frame::Data(buffer) => Arc::strong_count(buffer),
            Frame::Error(_) => 1,
        }
    }

    /// Frame payload, empty for error frames.
    pub fn data(&self) -> &[u8] {
        match self {
            Frame::Data(buffer) => buffer.data(),
            Frame::Error(_) => &[],
        }
    }

    /// 0 for data frames.
    pub fn status_code(&self) -> u32 {
        match self {
            Frame::Data(_) => 0,
            Frame::Error(error) => error.code,
        }
    }

    /// The data channel error this frame reports, if it is a known one.
    pub fn data_error(&self) -> Option<DataError> {
        match self {
            Frame::Data(_) => None,
            Frame::Error(error) => DataError::try_from(error.code).ok(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Frame::Error(_))
    }

    pub fn virtual_channel(&self) -> u8 {
        match self {
            Frame::Data(buffer) => buffer.virtual_channel(),
            Frame::Error(error) => error.channel,
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            Frame::Data(buffer) => buffer.timestamp(),
            Frame::Error(error) => error.timestamp,
        }
    }

    /// Recovers exclusive access to the buffer of the last reference to a
    /// data frame.  Returns the frame unchanged otherwise.
    pub fn into_buffer(self) -> Result<FrameBuffer, Frame> {
        match self {
            Frame::Data(buffer) => Arc::try_unwrap(buffer).map_err(Frame::Data),
            frame => Err(frame),
        }
    }
}

impl From<FrameBuffer> for Frame {
    fn from(buffer: FrameBuffer) -> Frame {
        Frame::Data(Arc::new(buffer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::FramePool;

    #[test]
    fn test_error_frame() {
        let frame = Frame::error(DataError::FrameDropped, 3);
        assert!(frame.is_error());
        assert_eq!(frame.status_code(), 0x4000_0002);
        assert_eq!(frame.data_error(), Some(DataError::FrameDropped));
        assert_eq!(frame.virtual_channel(), 3);
        assert!(frame.data().is_empty());
        assert_eq!(frame.ref_count(), 1);

        let unknown = Frame::error_code(0x1234, 0, 42);
        assert_eq!(unknown.data_error(), None);
        assert_eq!(unknown.timestamp(), 42);
    }

    #[test]
    fn test_hold_release() {
        let pool = FramePool::new();
        pool.set_frame_buffer_size(16).unwrap();
        pool.set_frame_count(1).unwrap();

        let mut buffer = pool.dequeue_frame().unwrap();
        buffer.buffer_mut()[..4].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        buffer.set_data_window(0, 4).unwrap();
        buffer.set_virtual_channel(1);
        assert!(buffer.set_data_window(10, 10).is_err());

        let frame = Frame::from(buffer);
        let held = frame.hold();
        assert_eq!(frame.ref_count(), 2);
        assert_eq!(held.data(), &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(held.status_code(), 0);
        assert_eq!(pool.free_count(), 0);

        drop(frame);
        assert_eq!(held.ref_count(), 1);
        assert_eq!(pool.free_count(), 0);

        // last release hands the buffer back
        drop(held);
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn test_into_buffer() {
        let pool = FramePool::new();
        pool.set_frame_buffer_size(8).unwrap();
        pool.set_frame_count(1).unwrap();

        let frame = Frame::from(pool.dequeue_frame().unwrap());
        let held = frame.hold();
        let frame = frame.into_buffer().unwrap_err();
        drop(held);
        let buffer = frame.into_buffer().unwrap();
        assert_eq!(buffer.capacity(), 8);
        pool.queue_frame(buffer).unwrap();
        assert_eq!(pool.free_count(), 1);
    }
}
