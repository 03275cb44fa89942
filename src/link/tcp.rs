// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use super::{is_timeout, Link, LinkMode, Socket, ETH_TCP_MAX_PAYLOAD};
use crate::error::Error;
use log::debug;
use std::{
    io::{Read, Write},
    net::{SocketAddr, SocketAddrV4, TcpStream},
    time::Duration,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// TCP stream link to a board.
#[derive(Debug, Default)]
pub struct TcpLink {
    stream: Option<TcpStream>,
}

impl TcpLink {
    pub fn new() -> TcpLink {
        TcpLink::default()
    }

    fn stream(&mut self) -> Result<&mut TcpStream, Error> {
        self.stream
            .as_mut()
            .ok_or_else(|| Error::Connection("TCP socket not open".to_string()))
    }
}

/// Binds a socket to `local_port` before connecting, which the standard
/// library connect does not allow.
#[cfg(unix)]
fn connect_from(local_port: u16, remote: SocketAddrV4) -> std::io::Result<TcpStream> {
    use std::os::fd::FromRawFd;

    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: fd is a fresh socket owned by the stream from here on, so it
    // is closed on every error path below.
    let stream = unsafe { TcpStream::from_raw_fd(fd) };

    let mut local: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    local.sin_family = libc::AF_INET as libc::sa_family_t;
    local.sin_port = local_port.to_be();
    local.sin_addr.s_addr = libc::INADDR_ANY;

    let mut peer: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    peer.sin_family = libc::AF_INET as libc::sa_family_t;
    peer.sin_port = remote.port().to_be();
    peer.sin_addr.s_addr = u32::from(*remote.ip()).to_be();

    let len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let err = unsafe {
        libc::bind(
            fd,
            &local as *const libc::sockaddr_in as *const libc::sockaddr,
            len,
        )
    };
    if err != 0 {
        return Err(std::io::Error::last_os_error());
    }

    let err = unsafe {
        libc::connect(
            fd,
            &peer as *const libc::sockaddr_in as *const libc::sockaddr,
            len,
        )
    };
    if err != 0 {
        return Err(std::io::Error::last_os_error());
    }

    Ok(stream)
}

#[cfg(not(unix))]
fn connect_from(_local_port: u16, remote: SocketAddrV4) -> std::io::Result<TcpStream> {
    TcpStream::connect_timeout(&SocketAddr::V4(remote), CONNECT_TIMEOUT)
}

impl Socket for TcpLink {
    fn open(
        &mut self,
        local_port: u16,
        remote: Option<SocketAddrV4>,
        timeout: Duration,
    ) -> Result<(), Error> {
        self.close();

        let remote = remote.ok_or_else(|| {
            Error::Connection("TCP link requires a remote address".to_string())
        })?;

        let stream = match local_port {
            0 => TcpStream::connect_timeout(&SocketAddr::V4(remote), CONNECT_TIMEOUT),
            port => connect_from(port, remote),
        }
        .map_err(|err| Error::Connection(format!("TCP connect to {remote}: {err}")))?;
        stream.set_nodelay(true)?;

        self.stream = Some(stream);
        self.set_timeout(timeout)?;
        debug!("TCP link open to {}", remote);
        Ok(())
    }
}

impl Link for TcpLink {
    fn mode(&self) -> LinkMode {
        LinkMode::Stream
    }

    fn max_payload(&self) -> usize {
        ETH_TCP_MAX_PAYLOAD
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }

    fn send(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.stream()?
            .write_all(buf)
            .map_err(|err| Error::Connection(format!("TCP send failed: {}", err)))
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.stream()?.read(buf) {
            Ok(0) => Err(Error::Connection("TCP connection closed by peer".to_string())),
            Ok(n) => Ok(n),
            Err(err) if is_timeout(&err) => Ok(0),
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => Ok(0),
            Err(err) => Err(Error::Connection(format!("TCP receive failed: {}", err))),
        }
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        let timeout = if timeout.is_zero() {
            None
        } else {
            Some(timeout)
        };
        self.stream()?.set_read_timeout(timeout)?;
        Ok(())
    }

    #[cfg(unix)]
    fn set_input_buffer_size(&mut self, size: usize) -> Result<(), Error> {
        use std::os::fd::AsRawFd;
        crate::common::set_socket_bufsize(self.stream()?.as_raw_fd(), size)?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn set_input_buffer_size(&mut self, _size: usize) -> Result<(), Error> {
        Ok(())
    }

    #[cfg(unix)]
    fn check_input_buffer(&mut self) -> Result<bool, Error> {
        use std::os::fd::AsRawFd;
        Ok(crate::common::bytes_available(self.stream()?.as_raw_fd())? > 0)
    }

    /// Also true once the peer closed the connection, the next receive
    /// reports that.
    #[cfg(unix)]
    fn wait_input(&mut self, timeout: Duration) -> Result<bool, Error> {
        use std::os::fd::AsRawFd;
        Ok(crate::common::wait_readable(self.stream()?.as_raw_fd(), timeout)?)
    }

    #[cfg(not(unix))]
    fn check_input_buffer(&mut self) -> Result<bool, Error> {
        let stream = self.stream()?;
        stream.set_nonblocking(true)?;
        let mut byte = [0; 1];
        let pending = matches!(stream.peek(&mut byte), Ok(n) if n > 0);
        stream.set_nonblocking(false)?;
        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{net::Ipv4Addr, net::TcpListener, thread};

    #[test]
    fn test_requires_remote() {
        let mut link = TcpLink::new();
        let err = link.open(0, None, Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
        assert!(!link.is_open());
    }

    #[test]
    fn test_stream_and_end_of_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let board = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut request = [0; 4];
            conn.read_exact(&mut request).unwrap();
            conn.write_all(&request).unwrap();
        });

        let mut link = TcpLink::new();
        link.open(
            0,
            Some(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)),
            Duration::from_millis(500),
        )
        .unwrap();
        assert_eq!(link.mode(), LinkMode::Stream);

        link.send(&[9, 8, 7, 6]).unwrap();
        let mut buf = [0; 4];
        assert_eq!(super::super::receive_exact(&mut link, &mut buf).unwrap(), 4);
        assert_eq!(buf, [9, 8, 7, 6]);

        board.join().unwrap();
        let err = link.receive(&mut buf).unwrap_err();
        assert!(err.is_fatal());
    }
}
