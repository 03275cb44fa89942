// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! The bridge to one connected board: a control channel for vendor
//! commands and a data channel streaming frames.

use crate::{
    control::VendorCommands,
    data::ReceiverContext,
    error::Error,
    forwarder::{FrameForwarder, FrameListener},
    frame::Frame,
    link::Link,
    pool::FramePool,
    protocol::TIMESTAMP_SIZE,
    queue::FrameQueue,
};
use log::debug;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

/// Streaming settings shared by every bridge type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataConfig {
    /// Stamp frames with the host clock when their first packet arrives
    /// instead of using the timestamp sent by the board.
    pub local_timestamp: bool,
    /// Timeout of [`BridgeData::get_frame`] when none is given.
    pub frame_timeout: Duration,
    /// Operating system input buffer of the data link.
    pub input_buffer_size: usize,
    /// How long stale packets are drained before streaming starts.
    pub cleanup_timeout: Duration,
    /// Run the receiver thread with real-time priority.
    pub realtime: bool,
}

impl Default for DataConfig {
    fn default() -> Self {
        DataConfig {
            local_timestamp: false,
            frame_timeout: Duration::from_millis(5000),
            input_buffer_size: 4 * 1024 * 1024,
            cleanup_timeout: Duration::from_millis(10),
            realtime: false,
        }
    }
}

/// A connection to one board.
pub trait Bridge: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Opens the links again after [`Bridge::close_connection`].
    fn open_connection(&self) -> Result<(), Error>;

    /// Stops streaming and closes the links.
    fn close_connection(&self);

    /// Vendor command access to the board.
    fn control(&self) -> &dyn VendorCommands;

    /// Frame buffers, queue and listener of the data channel.
    fn data(&self) -> &BridgeData;

    /// Starts the data receiver.  Requires an open connection and a frame
    /// pool with both buffer size and count configured.  Starting a bridge
    /// that is already streaming does nothing.
    fn start_streaming(&self) -> Result<(), Error>;

    /// Stops the data receiver and releases every queued frame.
    fn stop_streaming(&self);

    /// Largest payload of a single vendor request.
    fn max_transfer(&self) -> usize {
        self.control().max_transfer()
    }
}

/// Data channel state common to all bridges.
///
/// The pool always holds one buffer more than the queue cap so the
/// receiver owns a buffer while the queue is full.
pub struct BridgeData {
    pool: FramePool,
    queue: Arc<FrameQueue>,
    forwarder: FrameForwarder,
    started: Arc<AtomicBool>,
    config: DataConfig,
}

impl BridgeData {
    pub fn new(config: DataConfig) -> BridgeData {
        let queue = Arc::new(FrameQueue::new(0));
        BridgeData {
            pool: FramePool::new(),
            forwarder: FrameForwarder::new(queue.clone()),
            queue,
            started: Arc::new(AtomicBool::new(false)),
            config,
        }
    }

    pub fn config(&self) -> &DataConfig {
        &self.config
    }

    pub fn pool(&self) -> &FramePool {
        &self.pool
    }

    /// Registers a listener that receives every frame on the forwarder
    /// thread, or detaches the current one with `None`.
    pub fn register_listener(
        &self,
        listener: Option<Box<dyn FrameListener>>,
    ) -> Result<(), Error> {
        self.forwarder.register_listener(listener)
    }

    pub fn has_listener(&self) -> bool {
        self.forwarder.has_listener()
    }

    /// Sets the largest frame payload, room for the optional device
    /// timestamp is added.
    pub fn set_frame_buffer_size(&self, size: usize) -> Result<(), Error> {
        if size == 0 {
            return Err(Error::Argument("frame buffer size 0 is not allowed".to_string()));
        }
        self.pool.set_frame_buffer_size(size + TIMESTAMP_SIZE)
    }

    /// Caps the frame queue at `count` and sizes the pool to `count + 1`.
    pub fn set_frame_queue_size(&self, count: usize) -> Result<(), Error> {
        if count == 0 {
            return Err(Error::Argument("frame queue size 0 is not allowed".to_string()));
        }
        self.queue.set_max_count(count);
        self.pool.set_frame_count(count + 1)
    }

    /// Releases every queued frame.
    pub fn clear_frame_queue(&self) {
        self.queue.clear();
    }

    /// Waits for the next frame.  `None` uses the configured timeout and a
    /// zero timeout waits until a frame arrives or streaming stops.
    ///
    /// Always returns `None` while not streaming or while a listener is
    /// registered.
    pub fn get_frame(&self, timeout: Option<Duration>) -> Option<Frame> {
        if !self.is_started() || self.has_listener() {
            return None;
        }
        self.queue
            .blocking_dequeue(timeout.unwrap_or(self.config.frame_timeout))
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Number of frames waiting in the queue.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn receiver_context(&self) -> ReceiverContext {
        ReceiverContext {
            pool: self.pool.handle(),
            queue: self.queue.clone(),
            started: self.started.clone(),
            local_timestamp: self.config.local_timestamp,
        }
    }

    pub(crate) fn started_flag(&self) -> Arc<AtomicBool> {
        self.started.clone()
    }

    /// Checks the preconditions of starting a receiver.
    pub(crate) fn check_startable(&self, connected: bool) -> Result<(), Error> {
        if !connected {
            return Err(Error::BridgeData(
                "start streaming without being connected".to_string(),
            ));
        }
        if !self.pool.initialized() {
            return Err(Error::BridgeData(
                "start streaming without the frame pool being initialized".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn start(&self) -> Result<(), Error> {
        self.queue.start();
        self.forwarder.start()?;
        self.started.store(true, Ordering::Release);
        Ok(())
    }

    pub(crate) fn stop(&self) {
        self.started.store(false, Ordering::Release);
        self.queue.stop();
        self.forwarder.stop();
        self.queue.clear();
    }
}

impl Drop for BridgeData {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Discards packets left over from a previous session, one at a time,
/// for at most `timeout`.
pub(crate) fn cleanup_link(link: &mut dyn Link, timeout: Duration) {
    let expiry = Instant::now() + timeout;
    loop {
        match link.dump_packet() {
            Ok(true) if Instant::now() > expiry => {
                debug!("stream cleanup timed out");
                break;
            }
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => {
                debug!("stream cleanup: {}", err);
                break;
            }
        }
    }
}
