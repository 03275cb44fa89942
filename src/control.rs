// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Control channel: vendor requests and their responses.

use crate::{
    error::Error,
    identity::{format_uuid, BoardInfo, VersionInfo},
    link::{receive_exact, Link, LinkMode},
    protocol::*,
};
use log::{debug, trace};
use std::{
    sync::{Mutex, MutexGuard},
    time::Duration,
};
use tracing::instrument;
use uuid::Uuid;

/// Response timeout of a control link.
pub const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_millis(1000);

/// Longest board info or extended version string answer.
const MAX_INFO_LENGTH: usize = 256;

/// Vendor requests understood by every board.
///
/// All three block until the board answered or the link timed out.  A non
/// zero status from the board is returned as [`Error::ProtocolFunction`].
pub trait VendorCommands: Send + Sync {
    /// Sends `payload` to the board, the response carries no data.
    fn vendor_write(&self, request: u8, value: u16, index: u16, payload: &[u8])
        -> Result<(), Error>;

    /// Reads exactly `buf.len()` bytes from the board.
    fn vendor_read(&self, request: u8, value: u16, index: u16, buf: &mut [u8])
        -> Result<(), Error>;

    /// Sends `send` and receives up to `recv.len()` bytes in one exchange.
    /// Returns the number of bytes received.
    fn vendor_transfer(
        &self,
        request: u8,
        value: u16,
        index: u16,
        send: &[u8],
        recv: &mut [u8],
    ) -> Result<usize, Error>;

    /// Largest payload of a single request.
    fn max_transfer(&self) -> usize;
}

pub(crate) fn wire_length(len: usize) -> Result<u16, Error> {
    u16::try_from(len)
        .map_err(|_| Error::Argument(format!("request length {} exceeds 65535", len)))
}

/// Board information requests built on the vendor commands.
pub trait BoardProtocol: VendorCommands {
    fn get_board_info(&self) -> Result<BoardInfo, Error> {
        let mut buf = [0u8; MAX_INFO_LENGTH];
        let n = self.vendor_transfer(
            REQ_BOARD_INFO,
            REQ_BOARD_INFO_BOARD_INFO_WVALUE,
            0,
            &[],
            &mut buf,
        )?;
        BoardInfo::from_bytes(&buf[..n])
    }

    fn get_version_info(&self) -> Result<VersionInfo, Error> {
        let mut buf = [0u8; VersionInfo::LEN];
        self.vendor_read(
            REQ_BOARD_INFO,
            REQ_BOARD_INFO_VERSION_INFO_WVALUE,
            0,
            &mut buf,
        )?;
        Ok(VersionInfo::from_bytes(&buf))
    }

    /// Firmware version as `major.minor.patch.build`.
    fn get_version_string(&self) -> Result<String, Error> {
        Ok(self.get_version_info()?.to_string())
    }

    /// Free form version description, for boards that provide one.
    fn get_extended_version_string(&self) -> Result<String, Error> {
        let mut buf = [0u8; MAX_INFO_LENGTH];
        let n = self.vendor_transfer(
            REQ_BOARD_INFO,
            REQ_BOARD_INFO_EXTENDED_VERSION_WVALUE,
            0,
            &[],
            &mut buf,
        )?;
        let text = &buf[..n];
        let end = text.iter().position(|&c| c == 0).unwrap_or(text.len());
        Ok(String::from_utf8_lossy(&text[..end]).into_owned())
    }

    fn get_uuid(&self) -> Result<Uuid, Error> {
        let mut buf = [0u8; 16];
        self.vendor_read(REQ_BOARD_INFO, REQ_BOARD_INFO_UUID_WVALUE, 0, &mut buf)?;
        Ok(Uuid::from_bytes(buf))
    }

    fn get_uuid_string(&self) -> Result<String, Error> {
        Ok(format_uuid(&self.get_uuid()?))
    }

    /// Last error recorded by the board firmware.
    fn get_last_error(&self) -> Result<u32, Error> {
        let mut buf = [0u8; 4];
        self.vendor_read(
            REQ_BOARD_INFO,
            REQ_BOARD_INFO_ERROR_INFO_WVALUE,
            REQ_BOARD_INFO_ERROR_INFO_LAST_ERROR_WINDEX,
            &mut buf,
        )?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Restarts the board into its bootloader.
    fn activate_bootloader(&self) -> Result<(), Error> {
        self.vendor_write(REQ_BOARD_INFO, REQ_BOARD_INFO_BOOTLOADER_WVALUE, 0, &[])
    }

    /// Reads the version and fails unless the board speaks our protocol
    /// major version.
    fn check_version(&self) -> Result<VersionInfo, Error> {
        let version = self.get_version_info()?;
        debug!(
            "board firmware version {} protocol {}.{}",
            version, version.protocol_major, version.protocol_minor
        );

        if version.protocol_major < PROTOCOL_VERSION_MAJOR {
            return Err(Error::Protocol(format!(
                "incompatible protocol version {}.{}, update the board firmware to protocol {}.{}",
                version.protocol_major,
                version.protocol_minor,
                PROTOCOL_VERSION_MAJOR,
                PROTOCOL_VERSION_MINOR
            )));
        }
        if version.protocol_major > PROTOCOL_VERSION_MAJOR {
            return Err(Error::Protocol(format!(
                "protocol version mismatch, board uses {}.{} and host {}.{}",
                version.protocol_major,
                version.protocol_minor,
                PROTOCOL_VERSION_MAJOR,
                PROTOCOL_VERSION_MINOR
            )));
        }
        Ok(version)
    }
}

impl<T: VendorCommands + ?Sized> BoardProtocol for T {}

struct ControlState {
    link: Box<dyn Link>,
    /// Set when the previous exchange left an unread response behind.
    command_error: bool,
}

/// Vendor commands over a dedicated control link.
///
/// One request and its response form one locked exchange.  After a
/// framing error the next request first drains one stale packet.
pub struct ControlChannel {
    state: Mutex<ControlState>,
    max_payload: usize,
}

impl ControlChannel {
    pub fn new(link: Box<dyn Link>) -> ControlChannel {
        let max_payload = link.max_payload();
        ControlChannel {
            state: Mutex::new(ControlState {
                link,
                command_error: false,
            }),
            max_payload,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ControlState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Swaps in a freshly opened link of the same kind and clears the
    /// error latch.  The previous link is closed.
    pub fn replace_link(&self, link: Box<dyn Link>) {
        let mut state = self.lock();
        state.link.close();
        state.link = link;
        state.command_error = false;
    }

    pub fn is_open(&self) -> bool {
        self.lock().link.is_open()
    }

    pub fn close(&self) {
        self.lock().link.close();
    }

    pub fn set_timeout(&self, timeout: Duration) -> Result<(), Error> {
        self.lock().link.set_timeout(timeout)
    }

    /// Whether the next request will drain a stale response first.
    pub fn command_error(&self) -> bool {
        self.lock().command_error
    }

    /// Runs one request/response exchange under the channel lock.
    #[instrument(skip_all, level = "trace")]
    fn exchange(
        &self,
        header: RequestHeader,
        payload: &[u8],
        recv: &mut [u8],
    ) -> Result<usize, Error> {
        let mut state = self.lock();

        match header.req_type {
            VENDOR_REQ_WRITE | VENDOR_REQ_TRANSFER => {
                if RequestHeader::LEN + payload.len() > self.max_payload {
                    return Err(Error::Protocol(format!(
                        "request length {} too long, the maximum is {}",
                        payload.len(),
                        self.max_transfer()
                    )));
                }
            }
            VENDOR_REQ_READ => {
                if ResponseHeader::LEN + recv.len() > self.max_payload {
                    return Err(Error::Protocol(format!(
                        "read request length {} too long, the maximum is {}",
                        recv.len(),
                        self.max_transfer()
                    )));
                }
            }
            other => {
                return Err(Error::Protocol(format!(
                    "invalid request type 0x{:02X}",
                    other
                )))
            }
        }

        if state.command_error {
            debug!("draining stale control response");
            state.link.dump_packet()?;
            state.command_error = false;
        }

        let mut packet = Vec::with_capacity(RequestHeader::LEN + payload.len());
        packet.extend_from_slice(&<[u8; 8]>::from(&header));
        packet.extend_from_slice(payload);
        state.link.send(&packet)?;

        let result = receive_response(state.link.as_mut(), header.req_type, recv);
        if let Err(Error::Protocol(err)) = &result {
            trace!("control exchange failed: {}", err);
            state.command_error = true;
        }
        result
    }
}

/// Receives the response to a request of `req_type`.  The payload goes to
/// `recv`, whose length is the largest accepted answer.
fn receive_response(link: &mut dyn Link, req_type: u8, recv: &mut [u8]) -> Result<usize, Error> {
    let max_length = recv.len();

    let (header, datagram) = match link.mode() {
        LinkMode::Stream => {
            let mut header = [0u8; ResponseHeader::LEN];
            let n = receive_exact(link, &mut header)?;
            if n < ResponseHeader::LEN {
                return Err(Error::Protocol(format!(
                    "no or incomplete response header, {} bytes",
                    n
                )));
            }
            (ResponseHeader::from(&header), None)
        }
        LinkMode::Datagram => {
            let mut packet = vec![0u8; ResponseHeader::LEN + max_length];
            let n = link.receive(&mut packet)?;
            if n < ResponseHeader::LEN {
                return Err(Error::Protocol(format!(
                    "no or incomplete response header, {} bytes",
                    n
                )));
            }
            let header = ResponseHeader::from(&[packet[0], packet[1], packet[2], packet[3]]);
            packet.truncate(n);
            (header, Some(packet))
        }
    };

    if header.res_type != req_type {
        return Err(Error::Protocol(format!(
            "response type 0x{:02X} does not match request 0x{:02X}",
            header.res_type, req_type
        )));
    }
    if header.status != STATUS_SUCCESS {
        return Err(Error::ProtocolFunction(header.status));
    }

    let length = header.length as usize;
    if req_type == VENDOR_REQ_READ && length != max_length {
        return Err(Error::Protocol(format!(
            "read response length {} does not match request {}",
            length, max_length
        )));
    }
    if length > max_length {
        return Err(Error::Protocol(format!(
            "response length {} too long for buffer of {}",
            length, max_length
        )));
    }

    let received = match datagram {
        None => receive_exact(link, &mut recv[..length])?,
        Some(packet) => {
            let payload = &packet[ResponseHeader::LEN..];
            let n = payload.len().min(length);
            recv[..n].copy_from_slice(&payload[..n]);
            payload.len()
        }
    };
    if received != length {
        return Err(Error::Protocol(format!(
            "incomplete response payload, {} of {} bytes",
            received, length
        )));
    }

    Ok(length)
}

impl VendorCommands for ControlChannel {
    fn vendor_write(
        &self,
        request: u8,
        value: u16,
        index: u16,
        payload: &[u8],
    ) -> Result<(), Error> {
        let header = RequestHeader {
            req_type: VENDOR_REQ_WRITE,
            request,
            value,
            index,
            length: wire_length(payload.len())?,
        };
        self.exchange(header, payload, &mut []).map(|_| ())
    }

    fn vendor_read(
        &self,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
    ) -> Result<(), Error> {
        let header = RequestHeader {
            req_type: VENDOR_REQ_READ,
            request,
            value,
            index,
            length: wire_length(buf.len())?,
        };
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
        let header = RequestHeader {
            req_type: VENDOR_REQ_TRANSFER,
            request,
            value,
            index,
            length: wire_length(send.len())?,
        };
        self.exchange(header, send, recv)
    }

    fn max_transfer(&self) -> usize {
        self.max_payload - RequestHeader::LEN
    }
}
