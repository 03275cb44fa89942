// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use log::{debug, warn};
use std::{
    io,
    net::Ipv4Addr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// Microseconds since the Unix epoch of the host clock, 0 if the clock is
/// set before the epoch.
pub fn epoch_micros() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_micros() as u64,
        Err(_) => 0,
    }
}

/// Moves the calling thread to the real-time FIFO scheduler so the data
/// receiver keeps up with the board under load.
#[cfg(target_os = "linux")]
pub fn set_process_priority() {
    let mut param = libc::sched_param { sched_priority: 10 };
    let pid = unsafe { libc::pthread_self() };
    let err = unsafe {
        libc::pthread_setschedparam(pid, libc::SCHED_FIFO, &mut param as *mut libc::sched_param)
    };
    if err != 0 {
        let err = std::io::Error::last_os_error();
        warn!("unable to set receiver real-time fifo scheduler: {}", err);
    }
}

#[cfg(not(target_os = "linux"))]
pub fn set_process_priority() {}

/// Sets the kernel receive buffer of a socket.
#[cfg(unix)]
pub fn set_socket_bufsize(fd: std::os::fd::RawFd, size: usize) -> io::Result<()> {
    let size = size as libc::c_int;
    let err = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &size as *const _ as *const libc::c_void,
            std::mem::size_of_val(&size) as libc::socklen_t,
        )
    };
    if err != 0 {
        let err = io::Error::last_os_error();
        warn!("setsockopt SO_RCVBUF failed: {}", err);
        return Err(err);
    }
    Ok(())
}

/// Returns the number of bytes waiting in the kernel input queue of a
/// socket or terminal.
#[cfg(unix)]
pub fn bytes_available(fd: std::os::fd::RawFd) -> io::Result<usize> {
    let mut count: libc::c_int = 0;
    let err = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut count as *mut libc::c_int) };
    if err != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(count.max(0) as usize)
}

/// Waits until the descriptor is readable.  Returns false on timeout, a
/// zero timeout only checks.  Unlike [`bytes_available`] this also
/// reports a pending zero length datagram.
#[cfg(unix)]
pub fn wait_readable(fd: std::os::fd::RawFd, timeout: Duration) -> io::Result<bool> {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
    match unsafe { libc::poll(&mut pollfd, 1, timeout) } {
        n if n < 0 => {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            Err(err)
        }
        0 => Ok(false),
        _ => Ok(true),
    }
}

/// Collects the IPv4 broadcast address of every interface that is up and
/// supports broadcast, loopback excluded.
#[cfg(unix)]
pub fn broadcast_addresses() -> Vec<Ipv4Addr> {
    let mut addresses = Vec::new();
    let mut ifaddrs: *mut libc::ifaddrs = std::ptr::null_mut();

    if unsafe { libc::getifaddrs(&mut ifaddrs) } != 0 {
        debug!(
            "getifaddrs failed: {}",
            std::io::Error::last_os_error()
        );
        return addresses;
    }

    let mut it = ifaddrs;
    while !it.is_null() {
        // SAFETY: the list returned by getifaddrs stays valid until freed.
        let ifa = unsafe { &*it };
        it = ifa.ifa_next;

        let flags = ifa.ifa_flags as libc::c_int;
        if flags & libc::IFF_UP == 0
            || flags & libc::IFF_BROADCAST == 0
            || flags & libc::IFF_LOOPBACK != 0
        {
            continue;
        }

        let Some(addr) = sockaddr_ipv4(ifa.ifa_addr) else {
            continue;
        };

        #[cfg(any(target_os = "linux", target_os = "android"))]
        let broadcast = sockaddr_ipv4(ifa.ifa_ifu);
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        let broadcast = sockaddr_ipv4(ifa.ifa_dstaddr);

        let broadcast = match (broadcast, sockaddr_ipv4(ifa.ifa_netmask)) {
            (Some(broadcast), _) => broadcast,
            (None, Some(netmask)) => Ipv4Addr::from(u32::from(addr) | !u32::from(netmask)),
            (None, None) => continue,
        };

        if !addresses.contains(&broadcast) {
            addresses.push(broadcast);
        }
    }

    unsafe { libc::freeifaddrs(ifaddrs) };
    addresses
}

#[cfg(not(unix))]
pub fn broadcast_addresses() -> Vec<Ipv4Addr> {
    Vec::new()
}

#[cfg(unix)]
fn sockaddr_ipv4(addr: *const libc::sockaddr) -> Option<Ipv4Addr> {
    if addr.is_null() {
        return None;
    }
    // SAFETY: checked for null, family is checked before the cast.
    unsafe {
        if (*addr).sa_family as libc::c_int != libc::AF_INET {
            return None;
        }
        let addr = &*(addr as *const libc::sockaddr_in);
        Some(Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_micros() {
        let first = epoch_micros();
        let second = epoch_micros();
        // 2020-01-01 in microseconds
        assert!(first > 1_577_836_800_000_000);
        assert!(second >= first);
    }

    #[test]
    fn test_broadcast_addresses() {
        for addr in broadcast_addresses() {
            assert!(!addr.is_loopback());
            assert!(!addr.is_unspecified());
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_bytes_available() {
        use std::{net::UdpSocket, os::fd::AsRawFd, thread, time::Duration};

        let rx = UdpSocket::bind("127.0.0.1:0").unwrap();
        let tx = UdpSocket::bind("127.0.0.1:0").unwrap();
        assert_eq!(bytes_available(rx.as_raw_fd()).unwrap(), 0);

        tx.send_to(&[1, 2, 3, 4], rx.local_addr().unwrap()).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(bytes_available(rx.as_raw_fd()).unwrap() > 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_wait_readable() {
        use std::{net::UdpSocket, os::fd::AsRawFd, time::Instant};

        let rx = UdpSocket::bind("127.0.0.1:0").unwrap();
        let tx = UdpSocket::bind("127.0.0.1:0").unwrap();
        let start = Instant::now();
        assert!(!wait_readable(rx.as_raw_fd(), Duration::from_millis(30)).unwrap());
        assert!(start.elapsed() >= Duration::from_millis(25));

        // an empty datagram leaves FIONREAD at zero but is readable
        tx.send_to(&[], rx.local_addr().unwrap()).unwrap();
        assert!(wait_readable(rx.as_raw_fd(), Duration::from_secs(1)).unwrap());
        assert_eq!(bytes_available(rx.as_raw_fd()).unwrap(), 0);
    }
}
