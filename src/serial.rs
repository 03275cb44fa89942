// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Bridge to a board on a serial port.
//!
//! Control responses and data packets share one byte stream and every
//! packet carries a trailing CRC-16.  Whoever holds the port reads the
//! first four bytes of the next packet; a start meant for the other party
//! is cached and handed over through a condition variable.

use crate::{
    bridge::{Bridge, BridgeData, DataConfig},
    common::set_process_priority,
    control::{wire_length, VendorCommands},
    data::{Assembly, PacketCounter, ReceiverContext},
    error::Error,
    link::{receive_exact, Link},
    protocol::*,
};
use log::{debug, error, info};
use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, MutexGuard,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tracing::instrument;

/// Read timeout of the serial port itself.
pub const PORT_TIMEOUT: Duration = Duration::from_millis(100);
/// Response timeout while a board is being identified.
pub const ENUMERATE_TIMEOUT: Duration = Duration::from_millis(100);
/// Response timeout once the board is known.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// How long the data thread leaves an idle port to commands before it
/// reads again.
const IDLE_WAIT: Duration = Duration::from_millis(10);

/// Bytes that identify a packet: the response header, or the data header
/// up to its counter.
const PACKET_START_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PacketKind {
    Control,
    Data,
}

fn classify(packet_type: u8) -> Option<PacketKind> {
    if packet_type & 0xF0 == DATA_FRAME_PACKET {
        Some(PacketKind::Data)
    } else if is_request_type(packet_type) {
        Some(PacketKind::Control)
    } else {
        None
    }
}

struct PortState {
    link: Box<dyn Link>,
    cached: Option<(PacketKind, [u8; PACKET_START_SIZE])>,
    /// A request was sent and its response is not consumed yet.
    command_active: bool,
    /// The byte stream lost its framing, the input must be flushed before
    /// the next exchange.
    resynchronize: bool,
}

impl PortState {
    fn reset(&mut self) {
        self.cached = None;
        self.command_active = false;
        self.resynchronize = false;
    }

    fn is_cached(&self, kind: PacketKind) -> bool {
        matches!(self.cached, Some((cached, _)) if cached == kind)
    }

    fn dump(&mut self, length: usize) -> Result<(), Error> {
        let mut scratch = vec![0u8; length];
        receive_exact(self.link.as_mut(), &mut scratch)?;
        Ok(())
    }

    /// Reads the start of the next packet of `kind`, from the cache or the
    /// port.  A start of the other kind is cached, or dropped together with
    /// the rest of its packet if `discard_other` is set.  Returns false if
    /// no packet of `kind` was obtained.
    fn read_packet_start(
        &mut self,
        buf: &mut [u8; PACKET_START_SIZE],
        kind: PacketKind,
        discard_other: bool,
    ) -> Result<bool, Error> {
        match self.cached {
            Some((cached, start)) if cached == kind => {
                *buf = start;
                self.cached = None;
                return Ok(true);
            }
            None => {
                let received = receive_exact(self.link.as_mut(), buf)?;
                if received == 0 {
                    return Ok(false);
                }
                if received < PACKET_START_SIZE {
                    self.resynchronize = true;
                    return Err(Error::Protocol(format!(
                        "packet start incomplete: {} bytes",
                        received
                    )));
                }
                let current = classify(buf[0]).ok_or_else(|| {
                    self.resynchronize = true;
                    Error::Protocol(format!(
                        "unknown packet start {:02x?}, synchronization lost",
                        buf
                    ))
                })?;
                if current == kind {
                    return Ok(true);
                }
                self.cached = Some((current, *buf));
            }
            Some((cached, start)) if discard_other => {
                let length = match cached {
                    PacketKind::Data => {
                        let mut raw = [0u8; 2];
                        receive_exact(self.link.as_mut(), &mut raw)?;
                        u16::from_le_bytes(raw)
                    }
                    PacketKind::Control => u16::from_le_bytes([start[2], start[3]]),
                };
                debug!("discarding cached {:?} packet", cached);
                self.dump(length as usize + CRC_SIZE)?;
                self.cached = None;
            }
            Some(_) => {}
        }
        Ok(false)
    }
}

struct SharedPort {
    state: Mutex<PortState>,
    ready: Condvar,
    started: Arc<AtomicBool>,
}

impl SharedPort {
    fn lock(&self) -> MutexGuard<'_, PortState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn wait<'a>(
        &self,
        guard: MutexGuard<'a, PortState>,
        timeout: Duration,
    ) -> MutexGuard<'a, PortState> {
        match self.ready.wait_timeout(guard, timeout) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }
}

/// Control and data over one serial port.
pub struct SerialBridge {
    path: PathBuf,
    port: Arc<SharedPort>,
    max_payload: usize,
    command_lock: Mutex<()>,
    timeout: Mutex<Duration>,
    data: BridgeData,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SerialBridge {
    /// Opens the serial port at `path` with the default baud rate.  The
    /// response timeout starts short for identification, see
    /// [`SerialBridge::set_default_timeout`].
    #[cfg(unix)]
    pub fn open<P: AsRef<Path>>(path: P, config: DataConfig) -> Result<SerialBridge, Error> {
        use crate::link::serial::{SerialLink, DEFAULT_BAUDRATE};

        let link = SerialLink::open(path.as_ref(), DEFAULT_BAUDRATE, PORT_TIMEOUT)?;
        Ok(SerialBridge::with_link(path, Box::new(link), config))
    }

    /// Builds a bridge over an already open stream link.
    pub fn with_link<P: AsRef<Path>>(
        path: P,
        mut link: Box<dyn Link>,
        config: DataConfig,
    ) -> SerialBridge {
        if let Err(err) = link.clear_input_buffer() {
            debug!("serial input flush: {}", err);
        }
        let data = BridgeData::new(config);
        SerialBridge {
            path: path.as_ref().to_path_buf(),
            max_payload: link.max_payload(),
            port: Arc::new(SharedPort {
                state: Mutex::new(PortState {
                    link,
                    cached: None,
                    command_active: false,
                    resynchronize: false,
                }),
                ready: Condvar::new(),
                started: data.started_flag(),
            }),
            command_lock: Mutex::new(()),
            timeout: Mutex::new(ENUMERATE_TIMEOUT),
            data,
            receiver: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sets how long a vendor command waits for its response.
    pub fn set_timeout(&self, timeout: Duration) {
        *lock(&self.timeout) = timeout;
    }

    pub fn set_default_timeout(&self) {
        self.set_timeout(DEFAULT_TIMEOUT);
    }

    fn send_request(&self, header: &RequestHeader, payload: &[u8]) -> Result<(), Error> {
        match header.req_type {
            VENDOR_REQ_READ => {
                if ResponseHeader::LEN + header.length as usize + CRC_SIZE > self.max_payload {
                    return Err(Error::Protocol(format!(
                        "read request length {} is too long, the maximum is {}",
                        header.length,
                        VendorCommands::max_transfer(self)
                    )));
                }
            }
            _ => {
                if payload.len() > VendorCommands::max_transfer(self) {
                    return Err(Error::Protocol(format!(
                        "request length {} is too long, the maximum is {}",
                        payload.len(),
                        VendorCommands::max_transfer(self)
                    )));
                }
            }
        }

        let mut packet = Vec::with_capacity(RequestHeader::LEN + payload.len() + CRC_SIZE);
        packet.extend_from_slice(&<[u8; RequestHeader::LEN]>::from(header));
        // read requests announce their length but carry no payload
        if header.req_type != VENDOR_REQ_READ {
            packet.extend_from_slice(payload);
        }
        let crc = packet_crc(&[&packet]);
        packet.extend_from_slice(&crc.to_be_bytes());

        let mut state = self.port.lock();
        if state.resynchronize && !self.port.is_started() {
            state.command_active = true;
            state.link.clear_input_buffer()?;
            state.cached = None;
        }
        state.command_active = true;
        if let Err(err) = state.link.send(&packet) {
            state.command_active = false;
            drop(state);
            self.port.ready.notify_all();
            return Err(err);
        }
        Ok(())
    }

    /// Reads the response header, payload and CRC while holding the port.
    fn read_response<'a>(
        &'a self,
        mut state: MutexGuard<'a, PortState>,
        header: &mut [u8; ResponseHeader::LEN],
        recv: &mut [u8],
        crc: &mut [u8; CRC_SIZE],
    ) -> (MutexGuard<'a, PortState>, Result<usize, Error>) {
        // cleared only once the whole response was read
        state.resynchronize = true;
        let deadline = Instant::now() + *lock(&self.timeout);
        let mut received = false;

        loop {
            // while streaming the data thread hands the response over
            while self.port.is_started() && !state.is_cached(PacketKind::Control) {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                state = self.port.wait(state, deadline - now);
            }

            let discard_other = !self.port.is_started();
            match state.read_packet_start(header, PacketKind::Control, discard_other) {
                Ok(true) => {
                    received = true;
                    break;
                }
                Ok(false) => self.port.ready.notify_all(),
                Err(err) => return (state, Err(err)),
            }
            if Instant::now() >= deadline {
                break;
            }
        }

        if !received {
            return (
                state,
                Err(Error::Protocol("response header not received".to_string())),
            );
        }

        let length = u16::from_le_bytes([header[2], header[3]]) as usize;
        if length > recv.len() {
            return (
                state,
                Err(Error::Protocol(format!(
                    "response too long for buffer: {} > {}",
                    length,
                    recv.len()
                ))),
            );
        }
        match receive_exact(state.link.as_mut(), &mut recv[..length]) {
            Ok(n) if n == length => {}
            Ok(_) => {
                return (
                    state,
                    Err(Error::Protocol("response payload not completely received".to_string())),
                )
            }
            Err(err) => return (state, Err(err)),
        }
        match receive_exact(state.link.as_mut(), crc) {
            Ok(CRC_SIZE) => {}
            Ok(_) => {
                return (
                    state,
                    Err(Error::Protocol("response CRC not completely received".to_string())),
                )
            }
            Err(err) => return (state, Err(err)),
        }

        state.resynchronize = false;
        (state, Ok(length))
    }

    #[instrument(skip_all, level = "trace")]
    fn receive_response(&self, req_type: u8, recv: &mut [u8]) -> Result<usize, Error> {
        let mut header = [0u8; ResponseHeader::LEN];
        let mut crc = [0u8; CRC_SIZE];

        let state = self.port.lock();
        let (mut state, result) = self.read_response(state, &mut header, recv, &mut crc);
        state.command_active = false;
        drop(state);
        self.port.ready.notify_all();
        let length = result?;

        if packet_crc(&[&header, &recv[..length], &crc]) != 0 {
            return Err(Error::Protocol(format!(
                "response CRC error for request type {:#04x}",
                req_type
            )));
        }
        let response = ResponseHeader::from(&header);
        if response.res_type != req_type {
            return Err(Error::Protocol(format!(
                "response type {:#04x} does not match request type {:#04x}",
                response.res_type, req_type
            )));
        }
        if response.status != 0 {
            return Err(Error::ProtocolFunction(response.status));
        }
        if req_type == VENDOR_REQ_READ && length != recv.len() {
            return Err(Error::Protocol(format!(
                "read response length {} does not match request length {}",
                length,
                recv.len()
            )));
        }
        Ok(length)
    }

    fn exchange(
        &self,
        header: RequestHeader,
        payload: &[u8],
        recv: &mut [u8],
    ) -> Result<usize, Error> {
        let _command = lock(&self.command_lock);
        self.send_request(&header, payload)?;
        self.receive_response(header.req_type, recv)
    }
}

fn request_header(
    req_type: u8,
    request: u8,
    value: u16,
    index: u16,
    len: usize,
) -> Result<RequestHeader, Error> {
    Ok(RequestHeader {
        req_type,
        request,
        value,
        index,
        length: wire_length(len)?,
    })
}

impl VendorCommands for SerialBridge {
    fn vendor_write(
        &self,
        request: u8,
        value: u16,
        index: u16,
        payload: &[u8],
    ) -> Result<(), Error> {
        let header = request_header(VENDOR_REQ_WRITE, request, value, index, payload.len())?;
        self.exchange(header, payload, &mut []).map(|_| ())
    }

    fn vendor_read(
        &self,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
    ) -> Result<(), Error> {
        let header = request_header(VENDOR_REQ_READ, request, value, index, buf.len())?;
        self.exchange(header, &[], buf).map(|_| ())
    }

    fn vendor_transfer(
        &self,
        request: u8,
        value: u16,
        index: u16,
        send: &[u8],
        recv: &mut [u8],
    ) -> Result<usize, Error> {
        let header = request_header(VENDOR_REQ_TRANSFER, request, value, index, send.len())?;
        self.exchange(header, send, recv)
    }

    fn max_transfer(&self) -> usize {
        self.max_payload - RequestHeader::LEN - CRC_SIZE
    }
}

/// Reassembles data packets from the shared port.
struct SerialReceiver {
    counter: PacketCounter,
    assembly: Assembly,
}

impl SerialReceiver {
    fn drop_packet(&mut self, ctx: &ReceiverContext, channel: u8) {
        self.assembly.reset();
        ctx.emit_error(DataError::FrameDropped, channel);
    }

    #[instrument(skip_all, level = "trace")]
    fn step(&mut self, port: &SharedPort, ctx: &ReceiverContext) -> Result<(), Error> {
        let mut state = port.lock();
        // a pending response belongs to the command in progress
        while state.is_cached(PacketKind::Control) && state.command_active && ctx.is_started() {
            state = port.wait(state, PORT_TIMEOUT);
        }
        if !ctx.is_started() {
            return Ok(());
        }

        let mut raw = [0u8; DataHeader::LEN];
        let mut start = [0u8; PACKET_START_SIZE];
        let discard_other = !state.command_active;
        let found = state.read_packet_start(&mut start, PacketKind::Data, discard_other);
        port.ready.notify_all();
        if !found? {
            drop(port.wait(state, IDLE_WAIT));
            return Ok(());
        }
        raw[..PACKET_START_SIZE].copy_from_slice(&start);
        if receive_exact(state.link.as_mut(), &mut raw[PACKET_START_SIZE..])? < 2 {
            debug!("data packet header incomplete");
            return Ok(());
        }

        let header = DataHeader::from(&raw);
        let length = header.length as usize;
        if !self.counter.check(header.counter) {
            ctx.emit_error(DataError::FrameDropped, header.channel);
            if !header.is_first() {
                debug!("discarding current frame");
                self.assembly.reset();
                return state.dump(length + CRC_SIZE);
            }
        }

        if !self.assembly.prepare(ctx) {
            debug!("frame pool depleted, dumping packet");
            state.dump(length + CRC_SIZE)?;
            ctx.emit_error(DataError::FramePoolDepleted, VIRTUAL_CHANNEL_UNDEFINED);
            return Ok(());
        }
        if header.is_first() {
            self.assembly.begin(ctx, header.channel);
        }
        if length > self.assembly.window().len() {
            debug!("frame size exceeded, dumping packet");
            self.assembly.reset();
            state.dump(length + CRC_SIZE)?;
            ctx.emit_error(DataError::FrameSizeExceeded, header.channel);
            return Ok(());
        }

        let complete = {
            let payload = &mut self.assembly.window()[..length];
            receive_exact(state.link.as_mut(), payload)? == length
        };
        let mut crc = [0u8; CRC_SIZE];
        if !complete || receive_exact(state.link.as_mut(), &mut crc)? != CRC_SIZE {
            debug!("data packet incomplete");
            self.drop_packet(ctx, header.channel);
            return Ok(());
        }
        drop(state);

        let crc = packet_crc(&[&raw, &self.assembly.window()[..length], &crc]);
        if crc != 0 {
            debug!("data packet CRC error: {:#06x}", crc);
            self.drop_packet(ctx, header.channel);
            return Ok(());
        }

        if !header.is_first() {
            if !self.assembly.in_progress() {
                debug!("discarding unexpected follow-up packet");
                return Ok(());
            }
            if self.assembly.channel() != header.channel {
                debug!(
                    "channel mismatch: received {:#04x}, expected {:#04x}",
                    header.channel,
                    self.assembly.channel()
                );
                self.drop_packet(ctx, header.channel);
                return Ok(());
            }
        }

        self.assembly.advance(length);
        if header.is_last() {
            self.assembly.complete(ctx, &header, length);
        }
        Ok(())
    }
}

fn run_receiver(port: Arc<SharedPort>, ctx: ReceiverContext, realtime: bool) {
    if realtime {
        set_process_priority();
    }
    let mut receiver = SerialReceiver {
        counter: PacketCounter::default(),
        assembly: Assembly::default(),
    };
    while ctx.is_started() {
        if let Err(err) = receiver.step(&port, &ctx) {
            ctx.emit_error(DataError::LowLevelError, VIRTUAL_CHANNEL_UNDEFINED);
            if err.is_fatal() {
                error!("serial data receiver stopped: {}", err);
                break;
            }
            debug!("serial data receiver: {}", err);
        }
    }
    debug!("serial data receiver thread exit");
}

impl Bridge for SerialBridge {
    fn is_connected(&self) -> bool {
        self.port.lock().link.is_open()
    }

    #[cfg(unix)]
    fn open_connection(&self) -> Result<(), Error> {
        use crate::link::serial::{SerialLink, DEFAULT_BAUDRATE};

        self.close_connection();
        let link = SerialLink::open(&self.path, DEFAULT_BAUDRATE, PORT_TIMEOUT)?;
        let mut state = self.port.lock();
        state.link = Box::new(link);
        state.reset();
        drop(state);
        self.set_timeout(ENUMERATE_TIMEOUT);
        info!("serial port {} reopened", self.path.display());
        Ok(())
    }

    #[cfg(not(unix))]
    fn open_connection(&self) -> Result<(), Error> {
        Err(Error::NotSupported(
            "serial ports are not supported on this platform".to_string(),
        ))
    }

    fn close_connection(&self) {
        self.stop_streaming();
        self.port.lock().link.close();
    }

    fn control(&self) -> &dyn VendorCommands {
        self
    }

    fn data(&self) -> &BridgeData {
        &self.data
    }

    fn start_streaming(&self) -> Result<(), Error> {
        let mut receiver = lock(&self.receiver);
        if self.data.is_started() {
            return Ok(());
        }
        self.data.check_startable(self.is_connected())?;

        {
            let mut state = self.port.lock();
            if state.resynchronize {
                while state.command_active {
                    state = self.port.wait(state, PORT_TIMEOUT);
                }
                // a command may have resynchronized in the meantime
                if state.resynchronize {
                    state.link.clear_input_buffer()?;
                    state.cached = None;
                    state.resynchronize = false;
                }
            }
        }

        self.data.start()?;
        let port = self.port.clone();
        let ctx = self.data.receiver_context();
        let realtime = self.data.config().realtime;
        let spawned = thread::Builder::new()
            .name("serial-receiver".to_string())
            .spawn(move || run_receiver(port, ctx, realtime));
        match spawned {
            Ok(handle) => {
                *receiver = Some(handle);
                debug!("streaming started on {}", self.path.display());
                Ok(())
            }
            Err(err) => {
                self.data.stop();
                Err(err.into())
            }
        }
    }

    fn stop_streaming(&self) {
        let Some(handle) = lock(&self.receiver).take() else {
            return;
        };
        self.data.stop();
        // wake the receiver if it waits for a command to finish
        drop(self.port.lock());
        self.port.ready.notify_all();
        if handle.join().is_err() {
            error!("serial data receiver thread panicked");
        }
        debug!("streaming stopped on {}", self.path.display());
    }
}

impl Drop for SerialBridge {
    fn drop(&mut self) {
        self.close_connection();
    }
}
