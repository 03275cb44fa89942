// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Data channel receivers.
//!
//! A receiver thread reads data packets from a link, reassembles them into
//! pool buffers and pushes complete frames into the frame queue.  Problems
//! on the wire never leave the thread, they turn into error frames.

use crate::{
    common::{epoch_micros, set_process_priority},
    error::Error,
    frame::{Frame, FrameBuffer},
    link::{Link, LinkMode},
    pool::PoolHandle,
    protocol::{DataError, DataHeader, TIMESTAMP_SIZE, VIRTUAL_CHANNEL_UNDEFINED},
    queue::FrameQueue,
};
use log::{debug, error, info};
use std::{
    io::IoSliceMut,
    num::Wrapping,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::instrument;

/// How long a receiver without a free buffer waits for input before it
/// checks the pool again.
const POOL_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Everything a receiver shares with the bridge that owns it.
#[derive(Clone)]
pub(crate) struct ReceiverContext {
    pub pool: PoolHandle,
    pub queue: Arc<FrameQueue>,
    pub started: Arc<AtomicBool>,
    /// Stamp frames with the host clock on their first packet instead of
    /// using the device timestamp.
    pub local_timestamp: bool,
}

impl ReceiverContext {
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn emit_error(&self, error: DataError, channel: u8) {
        self.queue.enqueue(Frame::error(error, channel));
    }
}

/// Tracks the 16 bit packet counter of the data stream.
#[derive(Debug, Default)]
pub(crate) struct PacketCounter {
    expected: Wrapping<u16>,
    synced: bool,
}

impl PacketCounter {
    /// Returns false when `counter` reveals lost packets.  The first packet
    /// after start only synchronizes.
    pub fn check(&mut self, counter: u16) -> bool {
        let ok = !self.synced || counter == self.expected.0;
        if !ok {
            info!("data packet loss");
            debug!(
                "counter mismatch: received = {:#06x}, expected = {:#06x}",
                counter, self.expected.0
            );
        } else if !self.synced && counter != self.expected.0 {
            debug!("packet counter synchronized to {:#06x}", counter);
        }
        self.synced = true;
        self.expected = Wrapping(counter) + Wrapping(1);
        ok
    }

    /// Accounts for a packet that was discarded unread.
    pub fn skip(&mut self) {
        if self.synced {
            self.expected += 1;
        }
    }
}

/// A frame under construction.
#[derive(Default)]
pub(crate) struct Assembly {
    frame: Option<FrameBuffer>,
    size: usize,
    channel: u8,
    timestamp: u64,
    in_progress: bool,
}

impl Assembly {
    /// Makes sure a buffer is held.  Returns false if the pool is depleted.
    pub fn prepare(&mut self, ctx: &ReceiverContext) -> bool {
        if self.frame.is_none() {
            self.frame = ctx.pool.dequeue_frame();
        }
        self.frame.is_some()
    }

    /// Free space behind the data assembled so far.
    pub fn window(&mut self) -> &mut [u8] {
        let size = self.size;
        match self.frame.as_mut() {
            Some(frame) => &mut frame.buffer_mut()[size..],
            None => &mut [],
        }
    }

    pub fn capacity(&self) -> usize {
        self.frame.as_ref().map(|f| f.capacity()).unwrap_or(0)
    }

    /// Forgets the frame in progress but keeps its buffer.
    pub fn reset(&mut self) {
        self.size = 0;
        self.in_progress = false;
    }

    /// Forgets the frame in progress and hands its buffer back to the pool.
    pub fn release(&mut self) {
        self.reset();
        self.frame = None;
    }

    pub fn in_progress(&self) -> bool {
        self.in_progress
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Accepts `length` bytes that were written into the window.
    pub fn advance(&mut self, length: usize) {
        self.size += length;
    }

    /// Starts a new frame on `channel`, dropping any partial one.
    pub fn begin(&mut self, ctx: &ReceiverContext, channel: u8) {
        self.size = 0;
        self.channel = channel;
        self.timestamp = if ctx.local_timestamp {
            epoch_micros()
        } else {
            0
        };
        self.in_progress = true;
    }

    /// Finishes the frame after the payload of its last packet, `length`
    /// bytes, was appended.  Emits either the data frame or an error frame
    /// and leaves the assembly ready for the next frame.
    pub fn complete(&mut self, ctx: &ReceiverContext, header: &DataHeader, length: usize) {
        let packet_start = self.size - length;
        let mut end = self.size;
        let buffer = match self.frame.as_ref() {
            Some(frame) => frame.buffer(),
            None => {
                self.reset();
                return;
            }
        };

        if header.has_timestamp() {
            if end < TIMESTAMP_SIZE {
                debug!("frame too short for its timestamp: {} bytes", end);
                self.reset();
                return;
            }
            end -= TIMESTAMP_SIZE;
            if !ctx.local_timestamp {
                let mut raw = [0u8; TIMESTAMP_SIZE];
                raw.copy_from_slice(&buffer[end..end + TIMESTAMP_SIZE]);
                self.timestamp = u64::from_le_bytes(raw);
            }
        } else if !ctx.local_timestamp {
            self.timestamp = 0;
        }

        if header.is_error() {
            if length == header.error_code_length() {
                let code = u32::from_le_bytes([
                    buffer[end - 4],
                    buffer[end - 3],
                    buffer[end - 2],
                    buffer[end - 1],
                ]);
                ctx.queue
                    .enqueue(Frame::error_code(code, header.channel, self.timestamp));
            } else {
                let text = &buffer[packet_start..end.max(packet_start)];
                info!(
                    "device debug [{}]: {}",
                    self.timestamp,
                    String::from_utf8_lossy(text).trim_end_matches('\0')
                );
            }
            self.reset();
            return;
        }

        if let Some(mut frame) = self.frame.take() {
            match frame.set_data_window(0, end) {
                Ok(()) => {
                    frame.set_virtual_channel(self.channel);
                    frame.set_timestamp(self.timestamp);
                    ctx.queue.enqueue(Frame::from(frame));
                }
                Err(err) => error!("discarding frame: {}", err),
            }
        }
        self.reset();
    }

    /// Takes a packet whose `received` payload bytes were placed into
    /// [`Assembly::window`].  Packet boundaries must be preserved by the
    /// caller, as on a datagram link.
    pub fn accept(
        &mut self,
        ctx: &ReceiverContext,
        counter: &mut PacketCounter,
        header: DataHeader,
        received: usize,
        window: usize,
    ) {
        let length = header.length as usize;
        if received != length {
            if window < length {
                ctx.emit_error(DataError::FrameSizeExceeded, header.channel);
                debug!(
                    "frame buffer insufficient, {} bytes discarded",
                    length - window
                );
            } else {
                debug!(
                    "packet length wrong: received {}, expected {}",
                    received, length
                );
            }
            return;
        }

        if !counter.check(header.counter) {
            ctx.emit_error(DataError::FrameDropped, header.channel);
            if !header.is_first() {
                debug!("discarding current frame");
                self.reset();
                return;
            }
        }

        if header.is_first() {
            if self.in_progress {
                debug!(
                    "previous frame incomplete at counter {:#06x}",
                    header.counter
                );
                let size = self.size;
                if let Some(frame) = self.frame.as_mut() {
                    frame.buffer_mut().copy_within(size..size + length, 0);
                }
            }
            self.begin(ctx, header.channel);
        } else {
            if !self.in_progress {
                debug!("discarding unexpected follow-up packet");
                return;
            }
            if self.channel != header.channel {
                debug!(
                    "channel mismatch: received {:#04x}, expected {:#04x}",
                    header.channel, self.channel
                );
                return;
            }
        }

        self.size += length;
        if header.is_last() {
            self.complete(ctx, &header, length);
        }
    }
}

/// Reassembles frames from a link that preserves packet boundaries.
pub(crate) struct DatagramReceiver {
    ctx: ReceiverContext,
    counter: PacketCounter,
    assembly: Assembly,
}

impl DatagramReceiver {
    pub fn new(ctx: ReceiverContext) -> DatagramReceiver {
        DatagramReceiver {
            ctx,
            counter: PacketCounter::default(),
            assembly: Assembly::default(),
        }
    }

    /// Receives and processes at most one packet.  The header lands in a
    /// scratch buffer and the payload directly behind the frame assembled
    /// so far.
    #[instrument(skip_all, level = "trace")]
    pub fn poll(&mut self, link: &mut dyn Link) -> Result<(), Error> {
        if !self.assembly.prepare(&self.ctx) {
            if link.dump_packet()? {
                debug!("frame pool depleted, dumped packet");
                self.counter.skip();
                self.ctx
                    .emit_error(DataError::FramePoolDepleted, VIRTUAL_CHANNEL_UNDEFINED);
            } else {
                link.wait_input(POOL_RETRY_INTERVAL)?;
            }
            return Ok(());
        }

        let max_payload = link.max_payload().saturating_sub(DataHeader::LEN);
        let mut raw = [0u8; DataHeader::LEN];
        let window = self.assembly.window();
        let window_len = window.len().min(max_payload);
        let received = link.receive_vectored(&mut [
            IoSliceMut::new(&mut raw),
            IoSliceMut::new(&mut window[..window_len]),
        ])?;

        if received == 0 {
            return Ok(());
        }
        if received < DataHeader::LEN {
            debug!("packet header incomplete: {} bytes", received);
            return Ok(());
        }
        let header = DataHeader::from(&raw);
        if !header.is_data() {
            debug!("packet type error: {:#04x}", header.packet_type);
            return Ok(());
        }

        self.assembly.accept(
            &self.ctx,
            &mut self.counter,
            header,
            received - DataHeader::LEN,
            window_len,
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WaitForFrameStart,
    WaitForMiddleOrEnd,
    DropFrame,
}

/// Reads exactly `buf.len()` bytes unless streaming stops first.
fn receive_all(started: &AtomicBool, link: &mut dyn Link, buf: &mut [u8]) -> Result<bool, Error> {
    let mut received = 0;
    while received < buf.len() && started.load(Ordering::Acquire) {
        received += link.receive(&mut buf[received..])?;
    }
    Ok(received == buf.len())
}

/// Reassembles frames from a byte stream.
pub(crate) struct StreamReceiver {
    ctx: ReceiverContext,
    counter: PacketCounter,
    assembly: Assembly,
    state: State,
}

impl StreamReceiver {
    pub fn new(ctx: ReceiverContext) -> StreamReceiver {
        StreamReceiver {
            ctx,
            counter: PacketCounter::default(),
            assembly: Assembly::default(),
            state: State::WaitForFrameStart,
        }
    }

    /// Reads and handles one packet.  A packet that is not a data packet
    /// means the stream lost its framing, which is unrecoverable.
    #[instrument(skip_all, level = "trace")]
    pub fn step(&mut self, link: &mut dyn Link) -> Result<(), Error> {
        let mut raw = [0u8; DataHeader::LEN];
        if !receive_all(&self.ctx.started, link, &mut raw)? {
            return Ok(());
        }
        let header = DataHeader::from(&raw);
        if !header.is_data() {
            return Err(Error::Protocol(format!(
                "unknown packet type {:#04x} on data stream",
                header.packet_type
            )));
        }

        let counter_ok = self.counter.check(header.counter);
        if !counter_ok {
            self.ctx.emit_error(DataError::FrameDropped, header.channel);
        }

        let state = self.state;
        self.state = match state {
            _ if header.is_first() => self.first_packet(link, &header)?,
            State::WaitForMiddleOrEnd if counter_ok && self.assembly.channel == header.channel => {
                self.receive_payload(link, &header)?
            }
            State::WaitForMiddleOrEnd => {
                debug!("discarding current frame");
                self.assembly.release();
                self.drop_payload(link, header.length as usize)?;
                State::DropFrame
            }
            state => {
                self.drop_payload(link, header.length as usize)?;
                state
            }
        };
        Ok(())
    }

    fn first_packet(&mut self, link: &mut dyn Link, header: &DataHeader) -> Result<State, Error> {
        if !self.assembly.prepare(&self.ctx) {
            debug!("frame pool depleted, dropping frame");
            self.ctx
                .emit_error(DataError::FramePoolDepleted, header.channel);
            self.drop_payload(link, header.length as usize)?;
            return Ok(State::DropFrame);
        }
        self.assembly.begin(&self.ctx, header.channel);
        self.receive_payload(link, header)
    }

    fn receive_payload(&mut self, link: &mut dyn Link, header: &DataHeader) -> Result<State, Error> {
        let length = header.length as usize;
        if self.assembly.size + length > self.assembly.capacity() {
            debug!(
                "frame exceeds buffer capacity {}",
                self.assembly.capacity()
            );
            self.ctx
                .emit_error(DataError::FrameSizeExceeded, header.channel);
            self.assembly.release();
            self.drop_payload(link, length)?;
            return Ok(State::DropFrame);
        }

        let window = &mut self.assembly.window()[..length];
        if !receive_all(&self.ctx.started, link, window)? {
            return Ok(State::WaitForFrameStart);
        }
        self.assembly.size += length;

        if header.is_last() {
            self.assembly.complete(&self.ctx, header, length);
            Ok(State::WaitForFrameStart)
        } else {
            Ok(State::WaitForMiddleOrEnd)
        }
    }

    fn drop_payload(&mut self, link: &mut dyn Link, mut length: usize) -> Result<(), Error> {
        let mut scratch = [0u8; 512];
        while length > 0 && self.ctx.is_started() {
            let chunk = length.min(scratch.len());
            length -= link.receive(&mut scratch[..chunk])?;
        }
        Ok(())
    }
}

fn run(mut link: Box<dyn Link>, ctx: ReceiverContext, realtime: bool) -> Box<dyn Link> {
    if realtime {
        set_process_priority();
    }

    match link.mode() {
        LinkMode::Datagram => {
            let mut receiver = DatagramReceiver::new(ctx.clone());
            while ctx.is_started() {
                if let Err(err) = receiver.poll(link.as_mut()) {
                    ctx.emit_error(DataError::LowLevelError, VIRTUAL_CHANNEL_UNDEFINED);
                    if err.is_fatal() {
                        error!("data receiver stopped: {}", err);
                        break;
                    }
                    debug!("data receiver: {}", err);
                }
            }
        }
        LinkMode::Stream => {
            let mut receiver = StreamReceiver::new(ctx.clone());
            while ctx.is_started() {
                if let Err(err) = receiver.step(link.as_mut()) {
                    ctx.emit_error(DataError::LowLevelError, VIRTUAL_CHANNEL_UNDEFINED);
                    error!("data stream receiver stopped, maybe lost connection: {}", err);
                    break;
                }
            }
        }
    }

    debug!("data receiver thread exit");
    link
}

/// Spawns the receiver thread matching the link mode.  The thread runs
/// until `ctx.started` is cleared or the link fails, then hands the link
/// back through its join handle.
pub(crate) fn spawn_receiver(
    link: Box<dyn Link>,
    ctx: ReceiverContext,
    realtime: bool,
) -> Result<JoinHandle<Box<dyn Link>>, Error> {
    let handle = thread::Builder::new()
        .name("data-receiver".to_string())
        .spawn(move || run(link, ctx, realtime))?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        link::mock::MockLink,
        pool::FramePool,
        protocol::{
            DATA_FRAME_FIRST_PACKET, DATA_FRAME_FLAG_ERROR, DATA_FRAME_FLAG_TIMESTAMP,
            DATA_FRAME_LAST_PACKET, DATA_FRAME_MIDDLE_PACKET, DATA_FRAME_SINGLE_PACKET,
        },
    };
    use std::time::Duration;

    fn packet(packet_type: u8, channel: u8, counter: u16, payload: &[u8]) -> Vec<u8> {
        let header = DataHeader {
            packet_type,
            channel,
            counter,
            length: payload.len() as u16,
        };
        let mut packet = <[u8; 6]>::from(&header).to_vec();
        packet.extend_from_slice(payload);
        packet
    }

    fn setup(count: usize, local_timestamp: bool) -> (FramePool, ReceiverContext) {
        let pool = FramePool::new();
        pool.set_frame_buffer_size(64 + TIMESTAMP_SIZE).unwrap();
        pool.set_frame_count(count).unwrap();
        let queue = Arc::new(FrameQueue::new(0));
        queue.start();
        let ctx = ReceiverContext {
            pool: pool.handle(),
            queue,
            started: Arc::new(AtomicBool::new(true)),
            local_timestamp,
        };
        (pool, ctx)
    }

    fn next(ctx: &ReceiverContext) -> Option<Frame> {
        ctx.queue.blocking_dequeue(Duration::from_millis(10))
    }

    fn poll_all(receiver: &mut DatagramReceiver, link: &mut MockLink) {
        while link.handle().pending() > 0 {
            receiver.poll(link).unwrap();
        }
    }

    #[test]
    fn test_single_packet_frame() {
        for local_timestamp in [false, true] {
            let (_pool, ctx) = setup(2, local_timestamp);
            let mut link = MockLink::datagram();
            link.handle().push_packet(&packet(
                DATA_FRAME_SINGLE_PACKET,
                0,
                0,
                &[0xDE, 0xAD, 0xBE, 0xEF],
            ));

            let mut receiver = DatagramReceiver::new(ctx.clone());
            poll_all(&mut receiver, &mut link);

            let frame = next(&ctx).unwrap();
            assert_eq!(frame.virtual_channel(), 0);
            assert_eq!(frame.data(), &[0xDE, 0xAD, 0xBE, 0xEF]);
            assert_eq!(frame.timestamp() != 0, local_timestamp);
            assert!(next(&ctx).is_none());
        }
    }

    #[test]
    fn test_two_packet_frame() {
        let (_pool, ctx) = setup(2, false);
        let mut link = MockLink::datagram();
        link.handle()
            .push_packet(&packet(DATA_FRAME_FIRST_PACKET, 1, 0, &[0x11, 0x22]));
        link.handle()
            .push_packet(&packet(DATA_FRAME_LAST_PACKET, 1, 1, &[0x33, 0x44]));

        let mut receiver = DatagramReceiver::new(ctx.clone());
        poll_all(&mut receiver, &mut link);

        let frame = next(&ctx).unwrap();
        assert_eq!(frame.virtual_channel(), 1);
        assert_eq!(frame.data(), &[0x11, 0x22, 0x33, 0x44]);
        assert!(next(&ctx).is_none());
    }

    #[test]
    fn test_dropped_middle_packet() {
        let (_pool, ctx) = setup(2, false);
        let mut link = MockLink::datagram();
        link.handle()
            .push_packet(&packet(DATA_FRAME_FIRST_PACKET, 0, 0, &[1, 2]));
        link.handle()
            .push_packet(&packet(DATA_FRAME_MIDDLE_PACKET, 0, 2, &[3, 4]));
        link.handle()
            .push_packet(&packet(DATA_FRAME_LAST_PACKET, 0, 3, &[5, 6]));

        let mut receiver = DatagramReceiver::new(ctx.clone());
        poll_all(&mut receiver, &mut link);

        let frame = next(&ctx).unwrap();
        assert_eq!(frame.data_error(), Some(DataError::FrameDropped));
        // the tail of the broken frame is not delivered
        assert!(next(&ctx).is_none());

        // the next frame goes through
        link.handle()
            .push_packet(&packet(DATA_FRAME_SINGLE_PACKET, 0, 4, &[7]));
        poll_all(&mut receiver, &mut link);
        assert_eq!(next(&ctx).unwrap().data(), &[7]);
    }

    #[test]
    fn test_counter_wraps() {
        let (_pool, ctx) = setup(2, false);
        let mut link = MockLink::datagram();
        link.handle()
            .push_packet(&packet(DATA_FRAME_SINGLE_PACKET, 0, 0xFFFF, &[1]));
        link.handle()
            .push_packet(&packet(DATA_FRAME_SINGLE_PACKET, 0, 0, &[2]));

        let mut receiver = DatagramReceiver::new(ctx.clone());
        poll_all(&mut receiver, &mut link);
        assert_eq!(next(&ctx).unwrap().data(), &[1]);
        assert_eq!(next(&ctx).unwrap().data(), &[2]);
        assert!(next(&ctx).is_none());
    }

    #[test]
    fn test_first_after_gap_restarts() {
        let (_pool, ctx) = setup(2, false);
        let mut link = MockLink::datagram();
        link.handle()
            .push_packet(&packet(DATA_FRAME_FIRST_PACKET, 0, 0, &[1, 2]));
        link.handle()
            .push_packet(&packet(DATA_FRAME_FIRST_PACKET, 2, 5, &[3, 4]));
        link.handle()
            .push_packet(&packet(DATA_FRAME_LAST_PACKET, 2, 6, &[5]));

        let mut receiver = DatagramReceiver::new(ctx.clone());
        poll_all(&mut receiver, &mut link);
        assert_eq!(
            next(&ctx).unwrap().data_error(),
            Some(DataError::FrameDropped)
        );
        let frame = next(&ctx).unwrap();
        assert_eq!(frame.virtual_channel(), 2);
        assert_eq!(frame.data(), &[3, 4, 5]);
    }

    #[test]
    fn test_pool_exhaustion() {
        let (pool, ctx) = setup(1, false);
        let held = pool.dequeue_frame().unwrap();

        let mut link = MockLink::datagram();
        link.handle()
            .push_packet(&packet(DATA_FRAME_SINGLE_PACKET, 0, 0, &[1]));
        let mut receiver = DatagramReceiver::new(ctx.clone());
        poll_all(&mut receiver, &mut link);

        let frame = next(&ctx).unwrap();
        assert_eq!(frame.data_error(), Some(DataError::FramePoolDepleted));
        assert!(next(&ctx).is_none());

        // the receiver continues once a buffer comes back
        drop(held);
        link.handle()
            .push_packet(&packet(DATA_FRAME_SINGLE_PACKET, 0, 1, &[2]));
        poll_all(&mut receiver, &mut link);
        assert_eq!(next(&ctx).unwrap().data(), &[2]);
    }

    #[test]
    fn test_pool_exhaustion_blocks() {
        let (pool, ctx) = setup(1, false);
        let held = pool.dequeue_frame().unwrap();

        // without input and without a buffer every poll waits on the link
        let mut link = MockLink::datagram();
        let mut receiver = DatagramReceiver::new(ctx.clone());
        let start = std::time::Instant::now();
        for _ in 0..3 {
            receiver.poll(&mut link).unwrap();
        }
        assert!(start.elapsed() >= POOL_RETRY_INTERVAL * 3);
        assert_eq!(link.handle().receives(), 0);
        assert!(next(&ctx).is_none());

        drop(held);
        link.handle()
            .push_packet(&packet(DATA_FRAME_SINGLE_PACKET, 0, 0, &[5]));
        poll_all(&mut receiver, &mut link);
        assert_eq!(next(&ctx).unwrap().data(), &[5]);
    }

    #[test]
    fn test_size_exceeded() {
        let (_pool, ctx) = setup(1, false);
        let mut link = MockLink::datagram();
        link.handle()
            .push_packet(&packet(DATA_FRAME_SINGLE_PACKET, 3, 0, &[0; 100]));

        let mut receiver = DatagramReceiver::new(ctx.clone());
        poll_all(&mut receiver, &mut link);
        let frame = next(&ctx).unwrap();
        assert_eq!(frame.data_error(), Some(DataError::FrameSizeExceeded));
        assert_eq!(frame.virtual_channel(), 3);
    }

    #[test]
    fn test_device_timestamp() {
        let (_pool, ctx) = setup(1, false);
        let mut payload = vec![9, 8, 7];
        payload.extend_from_slice(&1_700_000_000_000_000u64.to_le_bytes());

        let mut link = MockLink::datagram();
        link.handle().push_packet(&packet(
            DATA_FRAME_SINGLE_PACKET | DATA_FRAME_FLAG_TIMESTAMP,
            0,
            0,
            &payload,
        ));
        let mut receiver = DatagramReceiver::new(ctx.clone());
        poll_all(&mut receiver, &mut link);

        let frame = next(&ctx).unwrap();
        assert_eq!(frame.data(), &[9, 8, 7]);
        assert_eq!(frame.timestamp(), 1_700_000_000_000_000);
    }

    #[test]
    fn test_error_packets() {
        let (pool, ctx) = setup(1, false);
        let mut link = MockLink::datagram();
        link.handle().push_packet(&packet(
            DATA_FRAME_SINGLE_PACKET | DATA_FRAME_FLAG_ERROR,
            4,
            0,
            &0x1234u32.to_le_bytes(),
        ));
        // debug text is logged, not queued
        link.handle().push_packet(&packet(
            DATA_FRAME_SINGLE_PACKET | DATA_FRAME_FLAG_ERROR,
            4,
            1,
            b"hello from the board",
        ));
        let mut receiver = DatagramReceiver::new(ctx.clone());
        poll_all(&mut receiver, &mut link);

        let frame = next(&ctx).unwrap();
        assert_eq!(frame.status_code(), 0x1234);
        assert_eq!(frame.virtual_channel(), 4);
        assert!(next(&ctx).is_none());
        drop(receiver);
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn test_stray_packets_tolerated() {
        let (_pool, ctx) = setup(1, false);
        let mut link = MockLink::datagram();
        link.handle().push_packet(&[0x40, 0x00, 0x00]);
        link.handle()
            .push_packet(&[0xC0, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
        link.handle()
            .push_packet(&packet(DATA_FRAME_SINGLE_PACKET, 0, 0, &[1]));

        let mut receiver = DatagramReceiver::new(ctx.clone());
        poll_all(&mut receiver, &mut link);
        assert_eq!(next(&ctx).unwrap().data(), &[1]);
    }

    fn step_until_eof(receiver: &mut StreamReceiver, link: &mut MockLink) {
        link.handle().set_eof();
        loop {
            match receiver.step(link) {
                Ok(()) => {}
                Err(Error::Connection(_)) => break,
                Err(err) => panic!("unexpected error {}", err),
            }
        }
    }

    #[test]
    fn test_stream_reassembly() {
        let (_pool, ctx) = setup(2, false);
        let mut link = MockLink::stream();
        link.handle().set_chunk(3);
        link.handle()
            .push_packet(&packet(DATA_FRAME_FIRST_PACKET, 1, 0, &[0x11, 0x22]));
        link.handle()
            .push_packet(&packet(DATA_FRAME_LAST_PACKET, 1, 1, &[0x33, 0x44]));
        link.handle()
            .push_packet(&packet(DATA_FRAME_SINGLE_PACKET, 0, 2, &[0xDE, 0xAD]));

        let mut receiver = StreamReceiver::new(ctx.clone());
        step_until_eof(&mut receiver, &mut link);

        let frame = next(&ctx).unwrap();
        assert_eq!(frame.virtual_channel(), 1);
        assert_eq!(frame.data(), &[0x11, 0x22, 0x33, 0x44]);
        assert_eq!(next(&ctx).unwrap().data(), &[0xDE, 0xAD]);
    }

    #[test]
    fn test_stream_dropped_middle() {
        let (pool, ctx) = setup(2, false);
        let mut link = MockLink::stream();
        link.handle()
            .push_packet(&packet(DATA_FRAME_FIRST_PACKET, 0, 0, &[1, 2]));
        link.handle()
            .push_packet(&packet(DATA_FRAME_MIDDLE_PACKET, 0, 2, &[3, 4]));
        link.handle()
            .push_packet(&packet(DATA_FRAME_LAST_PACKET, 0, 3, &[5, 6]));

        let mut receiver = StreamReceiver::new(ctx.clone());
        step_until_eof(&mut receiver, &mut link);

        assert_eq!(
            next(&ctx).unwrap().data_error(),
            Some(DataError::FrameDropped)
        );
        assert!(next(&ctx).is_none());
        assert_eq!(receiver.state, State::DropFrame);
        // the in-progress buffer went back to the pool
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn test_stream_pool_exhaustion() {
        let (pool, ctx) = setup(1, false);
        let held = pool.dequeue_frame().unwrap();
        let mut link = MockLink::stream();
        link.handle()
            .push_packet(&packet(DATA_FRAME_SINGLE_PACKET, 0, 0, &[1, 2, 3]));
        let mut receiver = StreamReceiver::new(ctx.clone());
        receiver.step(&mut link).unwrap();

        assert_eq!(
            next(&ctx).unwrap().data_error(),
            Some(DataError::FramePoolDepleted)
        );
        assert_eq!(link.handle().pending(), 0);

        drop(held);
        link.handle()
            .push_packet(&packet(DATA_FRAME_SINGLE_PACKET, 0, 1, &[4]));
        receiver.step(&mut link).unwrap();
        assert_eq!(next(&ctx).unwrap().data(), &[4]);
    }

    #[test]
    fn test_stream_rejects_non_data() {
        let (_pool, ctx) = setup(1, false);
        let mut link = MockLink::stream();
        link.handle().push_bytes(&[0xC0, 0, 0, 0, 0, 0]);
        let mut receiver = StreamReceiver::new(ctx);
        assert!(matches!(receiver.step(&mut link), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_receiver_thread() {
        let (pool, ctx) = setup(2, false);
        let link = MockLink::datagram();
        let handle = link.handle();
        handle.push_packet(&packet(DATA_FRAME_SINGLE_PACKET, 5, 0, &[1, 2]));

        let thread = spawn_receiver(Box::new(link), ctx.clone(), false).unwrap();
        let frame = ctx.queue.blocking_dequeue(Duration::from_secs(1)).unwrap();
        assert_eq!(frame.virtual_channel(), 5);
        drop(frame);

        ctx.started.store(false, Ordering::Release);
        let link = thread.join().unwrap();
        assert!(link.is_open());
        // the buffer held by the receiver is returned on exit
        assert_eq!(pool.free_count(), 2);
    }
}
