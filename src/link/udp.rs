// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use super::{is_timeout, DatagramLink, Link, LinkMode, Socket, ETH_UDP_MAX_PAYLOAD};
use crate::{common, error::Error};
use log::debug;
use std::{
    io::IoSliceMut,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket},
    time::Duration,
};

/// UDP socket link.  Connected when opened with a remote, which filters
/// inbound datagrams to that peer.
#[derive(Debug, Default)]
pub struct UdpLink {
    socket: Option<UdpSocket>,
}

impl UdpLink {
    pub fn new() -> UdpLink {
        UdpLink::default()
    }

    fn socket(&self) -> Result<&UdpSocket, Error> {
        self.socket
            .as_ref()
            .ok_or_else(|| Error::Connection("UDP socket not open".to_string()))
    }

    /// Local address the socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.socket()?.local_addr()?)
    }
}

fn map_receive(result: std::io::Result<usize>, len: usize) -> Result<usize, Error> {
    match result {
        Ok(n) => Ok(n.min(len)),
        Err(err) if is_timeout(&err) => Ok(0),
        Err(err) if err.kind() == std::io::ErrorKind::Interrupted => Ok(0),
        Err(err) => Err(Error::Connection(format!("UDP receive failed: {}", err))),
    }
}

impl Socket for UdpLink {
    fn open(
        &mut self,
        local_port: u16,
        remote: Option<SocketAddrV4>,
        timeout: Duration,
    ) -> Result<(), Error> {
        self.close();

        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, local_port))
            .map_err(|err| Error::Connection(format!("UDP bind to port {local_port}: {err}")))?;

        if let Some(remote) = remote {
            socket
                .connect(remote)
                .map_err(|err| Error::Connection(format!("UDP connect to {remote}: {err}")))?;
        }

        self.socket = Some(socket);
        self.set_timeout(timeout)?;
        debug!("UDP link open on port {} remote {:?}", local_port, remote);
        Ok(())
    }
}

impl Link for UdpLink {
    fn mode(&self) -> LinkMode {
        LinkMode::Datagram
    }

    fn max_payload(&self) -> usize {
        ETH_UDP_MAX_PAYLOAD
    }

    fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    fn close(&mut self) {
        self.socket = None;
    }

    fn send(&mut self, buf: &[u8]) -> Result<(), Error> {
        match self.socket()?.send(buf) {
            Ok(n) if n == buf.len() => Ok(()),
            Ok(n) => Err(Error::Connection(format!(
                "UDP send incomplete: {} of {} bytes",
                n,
                buf.len()
            ))),
            Err(err) => Err(Error::Connection(format!("UDP send failed: {}", err))),
        }
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let len = buf.len();
        map_receive(self.socket()?.recv(buf), len)
    }

    #[cfg(unix)]
    fn receive_vectored(&mut self, bufs: &mut [IoSliceMut<'_>]) -> Result<usize, Error> {
        use std::os::fd::AsRawFd;

        let fd = self.socket()?.as_raw_fd();
        let total = bufs.iter().map(|b| b.len()).sum();

        // IoSliceMut is ABI compatible with iovec on unix.
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = bufs.as_mut_ptr() as *mut libc::iovec;
        msg.msg_iovlen = bufs.len() as _;

        let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
        if n < 0 {
            return map_receive(Err(std::io::Error::last_os_error()), total);
        }
        map_receive(Ok(n as usize), total)
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        let timeout = if timeout.is_zero() {
            None
        } else {
            Some(timeout)
        };
        self.socket()?.set_read_timeout(timeout)?;
        Ok(())
    }

    #[cfg(unix)]
    fn set_input_buffer_size(&mut self, size: usize) -> Result<(), Error> {
        use std::os::fd::AsRawFd;
        common::set_socket_bufsize(self.socket()?.as_raw_fd(), size)?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn set_input_buffer_size(&mut self, _size: usize) -> Result<(), Error> {
        Ok(())
    }

    #[cfg(unix)]
    fn check_input_buffer(&mut self) -> Result<bool, Error> {
        self.wait_input(Duration::ZERO)
    }

    #[cfg(unix)]
    fn wait_input(&mut self, timeout: Duration) -> Result<bool, Error> {
        use std::os::fd::AsRawFd;
        Ok(common::wait_readable(self.socket()?.as_raw_fd(), timeout)?)
    }

    /// Receiving into a single byte truncates the datagram, which discards
    /// the rest of it.  Empty datagrams are removed as well.
    #[cfg(unix)]
    fn dump_packet(&mut self) -> Result<bool, Error> {
        if !self.check_input_buffer()? {
            return Ok(false);
        }
        let mut scratch = [0u8; 1];
        map_receive(self.socket()?.recv(&mut scratch), scratch.len())?;
        Ok(true)
    }

    #[cfg(not(unix))]
    fn check_input_buffer(&mut self) -> Result<bool, Error> {
        let socket = self.socket()?;
        socket.set_nonblocking(true)?;
        let mut byte = [0; 1];
        let pending = socket.peek(&mut byte).is_ok();
        socket.set_nonblocking(false)?;
        Ok(pending)
    }
}

impl DatagramLink for UdpLink {
    fn send_to(&mut self, buf: &[u8], remote: SocketAddrV4) -> Result<(), Error> {
        match self.socket()?.send_to(buf, remote) {
            Ok(n) if n == buf.len() => Ok(()),
            Ok(n) => Err(Error::Connection(format!(
                "UDP send to {} incomplete: {} of {} bytes",
                remote,
                n,
                buf.len()
            ))),
            Err(err) => Err(Error::Connection(format!(
                "UDP send to {} failed: {}",
                remote, err
            ))),
        }
    }

    fn receive_from(&mut self, buf: &mut [u8]) -> Result<(usize, Option<SocketAddrV4>), Error> {
        let len = buf.len();
        match self.socket()?.recv_from(buf) {
            Ok((n, SocketAddr::V4(remote))) => Ok((n.min(len), Some(remote))),
            Ok((n, SocketAddr::V6(_))) => Ok((n.min(len), None)),
            Err(err) => map_receive(Err(err), len).map(|n| (n, None)),
        }
    }

    fn set_broadcast(&mut self, enable: bool) -> Result<(), Error> {
        self.socket()?.set_broadcast(enable)?;
        Ok(())
    }

    fn broadcast_addresses(&self, port: u16) -> Vec<SocketAddrV4> {
        common::broadcast_addresses()
            .into_iter()
            .map(|addr| SocketAddrV4::new(addr, port))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_exchange() {
        let mut board = UdpLink::new();
        board
            .open(0, None, Duration::from_millis(200))
            .unwrap();
        let board_port = board.local_addr().unwrap().port();

        let mut host = UdpLink::new();
        host.open(
            0,
            Some(SocketAddrV4::new(Ipv4Addr::LOCALHOST, board_port)),
            Duration::from_millis(200),
        )
        .unwrap();
        host.send(&[0xD3, 0x00, 0x00, 0x00, 0x02, 0x00, 0xAB, 0xCD])
            .unwrap();

        let mut buf = [0; 16];
        let (n, remote) = board.receive_from(&mut buf).unwrap();
        assert_eq!(n, 8);
        let remote = remote.unwrap();
        assert_eq!(remote.port(), host.local_addr().unwrap().port());

        board.send_to(&[1, 2, 3, 4, 5, 6, 7, 8, 9], remote).unwrap();
        let mut header = [0; 6];
        let mut payload = [0; 4];
        let n = host
            .receive_vectored(&mut [IoSliceMut::new(&mut header), IoSliceMut::new(&mut payload)])
            .unwrap();
        assert_eq!(n, 9);
        assert_eq!(header, [1, 2, 3, 4, 5, 6]);
        assert_eq!(&payload[..3], &[7, 8, 9]);

        // nothing pending, the receive times out with zero bytes
        assert!(!host.check_input_buffer().unwrap());
        assert_eq!(host.receive(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_dump_packets() {
        let mut board = UdpLink::new();
        board.open(0, None, Duration::from_millis(200)).unwrap();
        let board_port = board.local_addr().unwrap().port();

        let mut host = UdpLink::new();
        host.open(
            0,
            Some(SocketAddrV4::new(Ipv4Addr::LOCALHOST, board_port)),
            Duration::from_millis(200),
        )
        .unwrap();
        let host_addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, host.local_addr().unwrap().port());

        board.send_to(&[], host_addr).unwrap();
        board.send_to(&[1, 2, 3], host_addr).unwrap();
        assert!(host.wait_input(Duration::from_secs(1)).unwrap());

        // the empty datagram goes first, then the whole second one
        assert!(host.dump_packet().unwrap());
        assert!(host.wait_input(Duration::from_secs(1)).unwrap());
        assert!(host.dump_packet().unwrap());
        assert!(!host.dump_packet().unwrap());

        let start = std::time::Instant::now();
        assert!(!host.wait_input(Duration::from_millis(30)).unwrap());
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn test_closed_link() {
        let mut link = UdpLink::new();
        assert!(!link.is_open());
        assert!(matches!(link.send(&[1]), Err(Error::Connection(_))));
        link.close();
        link.close();
    }
}
