// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Byte transports underneath the bridges.
//!
//! A [`Link`] moves bytes to and from one board.  Datagram links preserve
//! packet boundaries, stream links do not.  A receive that times out
//! returns zero bytes; end of stream on a stream link is a connection
//! error.

use crate::error::Error;
use std::{
    io::IoSliceMut,
    net::SocketAddrV4,
    thread,
    time::{Duration, Instant},
};

#[cfg(test)]
pub mod mock;
#[cfg(unix)]
pub mod serial;
pub mod tcp;
pub mod udp;

#[cfg(unix)]
pub use serial::SerialLink;
pub use tcp::TcpLink;
pub use udp::UdpLink;

/// Worst case Ethernet MTU that avoids fragmentation.
pub const ETH_MTU: usize = 1280;
/// IPv4 header size.
pub const ETH_IPV4_HEADER_SIZE: usize = 20;
/// UDP header size.
pub const ETH_UDP_HEADER_SIZE: usize = 8;
/// Largest unfragmented UDP payload.
pub const ETH_UDP_MAX_PAYLOAD: usize = ETH_MTU - ETH_IPV4_HEADER_SIZE - ETH_UDP_HEADER_SIZE;
/// Largest payload written to a TCP link in one request.
pub const ETH_TCP_MAX_PAYLOAD: usize = 60 * 1024;
/// Board control port.
pub const ETHERNET_CONTROL_PORT: u16 = 55055;
/// Board data port.
pub const ETHERNET_DATA_PORT: u16 = 55056;
/// Largest packet on a serial link, header and CRC included.
pub const SERIAL_MAX_PACKET_SIZE: usize = 4095;

/// Recheck interval of links that cannot block on their input.
const INPUT_POLL: Duration = Duration::from_millis(1);

/// How a link delivers data.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LinkMode {
    /// Ordered byte stream, packet boundaries are not preserved
    Stream,
    /// One receive returns exactly one packet
    Datagram,
}

/// A byte transport to one board.
pub trait Link: Send {
    /// Returns whether packet boundaries are preserved.
    fn mode(&self) -> LinkMode;

    /// Maximum payload of one packet on this link.
    fn max_payload(&self) -> usize;

    fn is_open(&self) -> bool;

    /// Closes the link.  Closing a closed link does nothing.
    fn close(&mut self);

    /// Transmits the whole buffer or fails with a connection error.
    fn send(&mut self, buf: &[u8]) -> Result<(), Error>;

    /// Receives up to `buf.len()` bytes, blocking up to the timeout.
    ///
    /// # Returns
    /// 0 on timeout, `buf.len()` if a datagram was larger than the buffer
    /// and got truncated, the number of bytes received otherwise.
    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, Error>;

    /// Receives one packet scattered over several buffers.  Links that
    /// support a native scatter read override this.
    fn receive_vectored(&mut self, bufs: &mut [IoSliceMut<'_>]) -> Result<usize, Error> {
        let total = bufs.iter().map(|b| b.len()).sum();
        let mut scratch = vec![0; total];
        let received = self.receive(&mut scratch)?;

        let mut offset = 0;
        for buf in bufs.iter_mut() {
            if offset >= received {
                break;
            }
            let len = buf.len().min(received - offset);
            buf[..len].copy_from_slice(&scratch[offset..offset + len]);
            offset += len;
        }

        Ok(received)
    }

    /// Sets the receive timeout, zero blocks until data arrives.
    fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error>;

    /// Sets the size of the operating system input buffer.
    fn set_input_buffer_size(&mut self, size: usize) -> Result<(), Error>;

    /// Returns true if received data is waiting to be read.
    fn check_input_buffer(&mut self) -> Result<bool, Error>;

    /// Blocks until received data is waiting or `timeout` passed, without
    /// consuming anything.  Returns whether data is waiting.
    fn wait_input(&mut self, timeout: Duration) -> Result<bool, Error> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.check_input_buffer()? {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            thread::sleep((deadline - now).min(INPUT_POLL));
        }
    }

    /// Reads and discards one pending packet, returns false if none was
    /// waiting.
    fn dump_packet(&mut self) -> Result<bool, Error> {
        if !self.check_input_buffer()? {
            return Ok(false);
        }
        let mut scratch = vec![0; self.max_payload()];
        Ok(self.receive(&mut scratch)? > 0)
    }

    /// Discards everything pending in the input buffer.
    fn clear_input_buffer(&mut self) -> Result<(), Error> {
        while self.dump_packet()? {}
        Ok(())
    }
}

impl<L: Link + ?Sized> Link for Box<L> {
    fn mode(&self) -> LinkMode {
        (**self).mode()
    }

    fn max_payload(&self) -> usize {
        (**self).max_payload()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn send(&mut self, buf: &[u8]) -> Result<(), Error> {
        (**self).send(buf)
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        (**self).receive(buf)
    }

    fn receive_vectored(&mut self, bufs: &mut [IoSliceMut<'_>]) -> Result<usize, Error> {
        (**self).receive_vectored(bufs)
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        (**self).set_timeout(timeout)
    }

    fn set_input_buffer_size(&mut self, size: usize) -> Result<(), Error> {
        (**self).set_input_buffer_size(size)
    }

    fn check_input_buffer(&mut self) -> Result<bool, Error> {
        (**self).check_input_buffer()
    }

    fn dump_packet(&mut self) -> Result<bool, Error> {
        (**self).dump_packet()
    }

    fn clear_input_buffer(&mut self) -> Result<(), Error> {
        (**self).clear_input_buffer()
    }

    fn wait_input(&mut self, timeout: Duration) -> Result<bool, Error> {
        (**self).wait_input(timeout)
    }
}

/// A network link that is opened against a remote port.
pub trait Socket: Link {
    /// Opens the socket on `local_port` (0 for any).  Datagram sockets only
    /// bind, and connect when a remote is given.  Stream sockets bind and
    /// connect, and fail with a connection error without a remote.
    fn open(
        &mut self,
        local_port: u16,
        remote: Option<SocketAddrV4>,
        timeout: Duration,
    ) -> Result<(), Error>;
}

/// Operations only meaningful on unconnected datagram sockets.
pub trait DatagramLink: Socket {
    fn send_to(&mut self, buf: &[u8], remote: SocketAddrV4) -> Result<(), Error>;

    /// Receives one datagram and the address it came from.  Returns zero
    /// bytes and no address on timeout.
    fn receive_from(&mut self, buf: &mut [u8]) -> Result<(usize, Option<SocketAddrV4>), Error>;

    fn set_broadcast(&mut self, enable: bool) -> Result<(), Error>;

    /// Returns the broadcast address of every local interface combined with
    /// `port`.
    fn broadcast_addresses(&self, port: u16) -> Vec<SocketAddrV4>;
}

/// Reads exactly `buf.len()` bytes from a stream link, tolerating short
/// reads.  Returns the number of bytes read, which is smaller than
/// requested only if the link timed out.
pub fn receive_exact(link: &mut dyn Link, buf: &mut [u8]) -> Result<usize, Error> {
    let mut received = 0;
    while received < buf.len() {
        let n = link.receive(&mut buf[received..])?;
        if n == 0 {
            break;
        }
        received += n;
    }
    Ok(received)
}

/// Maps the timeout flavours of the socket API onto a zero length receive.
pub(crate) fn is_timeout(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}
