// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use super::{Link, LinkMode, SERIAL_MAX_PACKET_SIZE};
use crate::{common::wait_readable, error::Error};
use kanal::{ReceiveErrorTimeout, Receiver, Sender};
use log::{debug, error};
use std::{
    fs::{File, OpenOptions},
    io::{Read, Write},
    os::{
        fd::{AsRawFd, RawFd},
        unix::fs::OpenOptionsExt,
    },
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

/// Baud rate used by the radar baseboards.
pub const DEFAULT_BAUDRATE: u32 = 921_600;

/// Number of read buffers posted to the reader thread.
const RING_SIZE: usize = 4;
const CHUNK_SIZE: usize = 4096;
/// How often the reader thread checks for shutdown.
const READER_POLL: Duration = Duration::from_millis(50);

/// A chunk of received bytes, `data[start..end]` not yet consumed.
struct Chunk {
    data: Vec<u8>,
    start: usize,
    end: usize,
}

/// Raw 8N1 serial port, typically a USB CDC ACM device.
///
/// A reader thread keeps [`RING_SIZE`] buffers posted against the port and
/// hands filled ones back over a channel, so a receive only copies when
/// data already arrived.  A receive keeps collecting until the requested
/// length arrived or the timeout expired.
pub struct SerialLink {
    path: PathBuf,
    port: Option<Arc<File>>,
    timeout: Duration,
    stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
    free_tx: Option<Sender<Vec<u8>>>,
    filled_rx: Option<Receiver<Chunk>>,
    pending: Option<Chunk>,
}

fn baudrate_flags(baudrate: u32) -> Result<libc::speed_t, Error> {
    let flags = match baudrate {
        9600 => libc::B9600,
        19200 => libc::B19200,
        38400 => libc::B38400,
        57600 => libc::B57600,
        115200 => libc::B115200,
        230400 => libc::B230400,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        460800 => libc::B460800,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        500000 => libc::B500000,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        921600 => libc::B921600,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        1000000 => libc::B1000000,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        1500000 => libc::B1500000,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        2000000 => libc::B2000000,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        3000000 => libc::B3000000,
        #[cfg(any(target_os = "linux", target_os = "android"))]
        4000000 => libc::B4000000,
        _ => {
            return Err(Error::Connection(format!(
                "unsupported baud rate {}",
                baudrate
            )))
        }
    };
    Ok(flags)
}

fn configure(fd: RawFd, baudrate: u32) -> Result<(), Error> {
    let speed = baudrate_flags(baudrate)?;

    let mut tty: libc::termios = unsafe { std::mem::zeroed() };
    if unsafe { libc::tcgetattr(fd, &mut tty) } < 0 {
        return Err(Error::Connection(format!(
            "tcgetattr failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    unsafe {
        libc::cfmakeraw(&mut tty);
        libc::cfsetispeed(&mut tty, speed);
        libc::cfsetospeed(&mut tty, speed);
    }
    tty.c_cflag &= !(libc::PARENB | libc::CSTOPB | libc::CRTSCTS | libc::CSIZE);
    tty.c_cflag |= libc::CREAD | libc::CLOCAL | libc::CS8;
    tty.c_cc[libc::VMIN] = 0;
    tty.c_cc[libc::VTIME] = 1;

    if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &tty) } < 0 {
        return Err(Error::Connection(format!(
            "tcsetattr failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Fills posted buffers until stopped or the port fails.  Dropping the
/// filled sender on exit tells the link the port is gone.
fn reader_thread(
    port: Arc<File>,
    stop: Arc<AtomicBool>,
    free_rx: Receiver<Vec<u8>>,
    filled_tx: Sender<Chunk>,
) {
    let fd = port.as_raw_fd();
    let mut buffer: Option<Vec<u8>> = None;

    while !stop.load(Ordering::Relaxed) {
        let mut data = match buffer.take() {
            Some(data) => data,
            None => match free_rx.recv_timeout(READER_POLL) {
                Ok(data) => data,
                Err(ReceiveErrorTimeout::Timeout) => continue,
                Err(_) => break,
            },
        };

        match wait_readable(fd, READER_POLL) {
            Ok(true) => {}
            Ok(false) => {
                buffer = Some(data);
                continue;
            }
            Err(err) => {
                error!("serial poll failed: {}", err);
                break;
            }
        }

        match (&*port).read(&mut data) {
            // VTIME expired between poll and read
            Ok(0) => buffer = Some(data),
            Ok(n) => {
                let chunk = Chunk {
                    data,
                    start: 0,
                    end: n,
                };
                if filled_tx.send(chunk).is_err() {
                    break;
                }
            }
            Err(err)
                if err.kind() == std::io::ErrorKind::Interrupted
                    || err.kind() == std::io::ErrorKind::WouldBlock =>
            {
                buffer = Some(data)
            }
            Err(err) => {
                error!("serial read failed: {}", err);
                break;
            }
        }
    }

    debug!("serial reader thread exit");
}

impl SerialLink {
    /// Opens `path` at `baudrate` with the given receive timeout and
    /// discards whatever a previous session left in the input queue.
    pub fn open<P: AsRef<Path>>(
        path: P,
        baudrate: u32,
        timeout: Duration,
    ) -> Result<SerialLink, Error> {
        let path = path.as_ref().to_path_buf();
        let port = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY)
            .open(&path)
            .map_err(|err| Error::Connection(format!("open {}: {}", path.display(), err)))?;
        configure(port.as_raw_fd(), baudrate)?;
        if unsafe { libc::tcflush(port.as_raw_fd(), libc::TCIFLUSH) } < 0 {
            return Err(Error::Connection(format!(
                "tcflush failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        let port = Arc::new(port);
        let stop = Arc::new(AtomicBool::new(false));
        let (free_tx, free_rx) = kanal::bounded(RING_SIZE);
        let (filled_tx, filled_rx) = kanal::bounded(RING_SIZE);
        for _ in 0..RING_SIZE {
            free_tx
                .send(vec![0; CHUNK_SIZE])
                .map_err(|err| Error::Connection(format!("serial ring setup: {}", err)))?;
        }

        let reader = {
            let port = port.clone();
            let stop = stop.clone();
            std::thread::Builder::new()
                .name("serial-reader".to_string())
                .spawn(move || reader_thread(port, stop, free_rx, filled_tx))?
        };

        debug!("serial link open on {} at {} baud", path.display(), baudrate);
        Ok(SerialLink {
            path,
            port: Some(port),
            timeout,
            stop,
            reader: Some(reader),
            free_tx: Some(free_tx),
            filled_rx: Some(filled_rx),
            pending: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn port(&self) -> Result<&Arc<File>, Error> {
        self.port
            .as_ref()
            .ok_or_else(|| Error::Connection("serial port not open".to_string()))
    }

    /// Hands a consumed buffer back to the reader thread.
    fn recycle(&self, chunk: Chunk) {
        if let Some(free_tx) = &self.free_tx {
            let _ = free_tx.send(chunk.data);
        }
    }

    /// Waits for the next filled chunk.  `None` on timeout.
    fn next_chunk(&self, deadline: Option<Instant>) -> Result<Option<Chunk>, Error> {
        let filled_rx = self
            .filled_rx
            .as_ref()
            .ok_or_else(|| Error::Connection("serial port not open".to_string()))?;

        let received = match deadline {
            None => filled_rx.recv().map_err(|_| ()),
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Ok(None);
                }
                match filled_rx.recv_timeout(deadline - now) {
                    Ok(chunk) => Ok(chunk),
                    Err(ReceiveErrorTimeout::Timeout) => return Ok(None),
                    Err(_) => Err(()),
                }
            }
        };

        received.map(Some).map_err(|_| {
            Error::Connection(format!(
                "serial port {} reader stopped",
                self.path.display()
            ))
        })
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        self.close();
    }
}

impl Link for SerialLink {
    fn mode(&self) -> LinkMode {
        LinkMode::Stream
    }

    fn max_payload(&self) -> usize {
        SERIAL_MAX_PACKET_SIZE
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn close(&mut self) {
        if self.port.is_none() {
            return;
        }
        self.stop.store(true, Ordering::Relaxed);
        // closing the channels wakes the reader if it waits for a buffer
        self.free_tx = None;
        self.filled_rx = None;
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                error!("serial reader thread panicked");
            }
        }
        self.pending = None;
        self.port = None;
        debug!("serial link {} closed", self.path.display());
    }

    fn send(&mut self, buf: &[u8]) -> Result<(), Error> {
        let port = self.port()?;
        (&**port)
            .write_all(buf)
            .map_err(|err| Error::Connection(format!("serial write failed: {}", err)))
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        self.port()?;
        let deadline = (!self.timeout.is_zero()).then(|| Instant::now() + self.timeout);

        let mut received = 0;
        while received < buf.len() {
            let mut chunk = match self.pending.take() {
                Some(chunk) => chunk,
                None => match self.next_chunk(deadline)? {
                    Some(chunk) => chunk,
                    None => break,
                },
            };

            let len = (chunk.end - chunk.start).min(buf.len() - received);
            buf[received..received + len]
                .copy_from_slice(&chunk.data[chunk.start..chunk.start + len]);
            chunk.start += len;
            received += len;

            if chunk.start < chunk.end {
                self.pending = Some(chunk);
            } else {
                self.recycle(chunk);
            }
        }
        Ok(received)
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        self.timeout = timeout;
        Ok(())
    }

    fn set_input_buffer_size(&mut self, _size: usize) -> Result<(), Error> {
        Ok(())
    }

    fn check_input_buffer(&mut self) -> Result<bool, Error> {
        if self.pending.is_some() {
            return Ok(true);
        }
        if let Some(filled_rx) = &self.filled_rx {
            if !filled_rx.is_empty() {
                return Ok(true);
            }
        }
        let fd = self.port()?.as_raw_fd();
        Ok(crate::common::bytes_available(fd)? > 0)
    }

    /// A chunk that arrives while waiting is kept for the next receive.
    fn wait_input(&mut self, timeout: Duration) -> Result<bool, Error> {
        if self.check_input_buffer()? {
            return Ok(true);
        }
        match self.next_chunk(Some(Instant::now() + timeout))? {
            Some(chunk) => {
                self.pending = Some(chunk);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Discards one chunk that already arrived, never waits for more.
    fn dump_packet(&mut self) -> Result<bool, Error> {
        self.port()?;
        let chunk = match self.pending.take() {
            Some(chunk) => Some(chunk),
            None => match &self.filled_rx {
                Some(filled_rx) => filled_rx.try_recv().ok().flatten(),
                None => None,
            },
        };
        match chunk {
            Some(chunk) => {
                self.recycle(chunk);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn clear_input_buffer(&mut self) -> Result<(), Error> {
        let fd = self.port()?.as_raw_fd();
        if unsafe { libc::tcflush(fd, libc::TCIFLUSH) } < 0 {
            return Err(Error::Connection(format!(
                "tcflush failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        if let Some(chunk) = self.pending.take() {
            self.recycle(chunk);
        }
        let mut stale = Vec::new();
        if let Some(filled_rx) = &self.filled_rx {
            while let Ok(Some(chunk)) = filled_rx.try_recv() {
                stale.push(chunk);
            }
        }
        for chunk in stale {
            self.recycle(chunk);
        }
        Ok(())
    }
}
