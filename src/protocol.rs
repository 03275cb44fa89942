// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Wire format of the vendor control protocol and the streaming data
//! protocol.  All multi-byte fields are little-endian on every link, the
//! serial CRC trailer being the only big-endian value.

use crc16::{State, CCITT_FALSE};
use log::trace;
use std::fmt;

/// Protocol major version this host implementation speaks.
pub const PROTOCOL_VERSION_MAJOR: u16 = 4;
/// Protocol minor version this host implementation speaks.
pub const PROTOCOL_VERSION_MINOR: u16 = 0;

/// Host to device request without response payload.
pub const VENDOR_REQ_WRITE: u8 = 0x40;
/// Device to host request with a fixed response length.
pub const VENDOR_REQ_READ: u8 = 0xC0;
/// Request with payload in both directions.
pub const VENDOR_REQ_TRANSFER: u8 = 0x43;

/// Board information request group.
pub const REQ_BOARD_INFO: u8 = 0x80;
/// wValue: vendor id, product id and name of the board.
pub const REQ_BOARD_INFO_BOARD_INFO_WVALUE: u16 = 0x00;
/// wValue: firmware and protocol version.
pub const REQ_BOARD_INFO_VERSION_INFO_WVALUE: u16 = 0x01;
/// wValue: 16 byte board UUID.
pub const REQ_BOARD_INFO_UUID_WVALUE: u16 = 0x02;
/// wValue: free-form extended version string.
pub const REQ_BOARD_INFO_EXTENDED_VERSION_WVALUE: u16 = 0x03;
/// wValue: reboot into the bootloader.
pub const REQ_BOARD_INFO_BOOTLOADER_WVALUE: u16 = 0x04;
/// wValue: error information, selected by wIndex.
pub const REQ_BOARD_INFO_ERROR_INFO_WVALUE: u16 = 0xFF;
/// wIndex for the last error status.
pub const REQ_BOARD_INFO_ERROR_INFO_LAST_ERROR_WINDEX: u16 = 0x01;
/// wIndex for platform specific detailed error information.
pub const REQ_BOARD_INFO_ERROR_INFO_DETAILED_ERROR_WINDEX: u16 = 0x02;

pub const STATUS_SUCCESS: u8 = 0x00;
pub const STATUS_HEADER_INCOMPLETE: u8 = 0x80;
pub const STATUS_PAYLOAD_INCOMPLETE: u8 = 0x81;
pub const STATUS_PAYLOAD_TOO_LONG: u8 = 0x82;
pub const STATUS_PAYLOAD_FRAGMENTED: u8 = 0x83;
pub const STATUS_CRC_ERROR: u8 = 0x84;
pub const STATUS_REQUEST_TYPE_INVALID: u8 = 0x85;
pub const STATUS_REQUEST_INVALID: u8 = 0x86;
pub const STATUS_REQUEST_NOT_IMPLEMENTED: u8 = 0x87;
pub const STATUS_REQUEST_WLENGTH_INVALID: u8 = 0x88;
pub const STATUS_REQUEST_WVALUE_INVALID: u8 = 0x89;
pub const STATUS_REQUEST_WINDEX_INVALID: u8 = 0x8A;
pub const STATUS_REQUEST_PAYLOAD_INVALID: u8 = 0x8B;
pub const STATUS_REQUEST_NOT_AVAILABLE: u8 = 0x8C;
pub const STATUS_COMMAND_ID_INVALID: u8 = 0x8D;
pub const STATUS_COMMAND_TYPE_INVALID: u8 = 0x8E;
pub const STATUS_COMMAND_SUBIF_INVALID: u8 = 0x8F;
pub const STATUS_COMMAND_FUNCTION_INVALID: u8 = 0x90;

/// Returns a readable name for the protocol level status codes.
pub fn status_name(status: u8) -> Option<&'static str> {
    match status {
        STATUS_SUCCESS => Some("success"),
        STATUS_HEADER_INCOMPLETE => Some("header incomplete"),
        STATUS_PAYLOAD_INCOMPLETE => Some("payload incomplete"),
        STATUS_PAYLOAD_TOO_LONG => Some("payload too long"),
        STATUS_PAYLOAD_FRAGMENTED => Some("payload fragmented"),
        STATUS_CRC_ERROR => Some("crc error"),
        STATUS_REQUEST_TYPE_INVALID => Some("request type invalid"),
        STATUS_REQUEST_INVALID => Some("request invalid"),
        STATUS_REQUEST_NOT_IMPLEMENTED => Some("request not implemented"),
        STATUS_REQUEST_WLENGTH_INVALID => Some("wLength invalid"),
        STATUS_REQUEST_WVALUE_INVALID => Some("wValue invalid"),
        STATUS_REQUEST_WINDEX_INVALID => Some("wIndex invalid"),
        STATUS_REQUEST_PAYLOAD_INVALID => Some("payload invalid"),
        STATUS_REQUEST_NOT_AVAILABLE => Some("request not available"),
        STATUS_COMMAND_ID_INVALID => Some("command id invalid"),
        STATUS_COMMAND_TYPE_INVALID => Some("command type invalid"),
        STATUS_COMMAND_SUBIF_INVALID => Some("command sub-interface invalid"),
        STATUS_COMMAND_FUNCTION_INVALID => Some("command function invalid"),
        _ => None,
    }
}

/// Returns true if the byte is one of the request types a control response
/// may echo.
#[inline]
pub fn is_request_type(value: u8) -> bool {
    matches!(value, VENDOR_REQ_WRITE | VENDOR_REQ_READ | VENDOR_REQ_TRANSFER)
}

/// Control request header sent ahead of every vendor command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestHeader {
    pub req_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl RequestHeader {
    /// Length of the request header in bytes/octets.
    pub const LEN: usize = 8;
}

impl From<&RequestHeader> for [u8; 8] {
    fn from(header: &RequestHeader) -> Self {
        let value = header.value.to_le_bytes();
        let index = header.index.to_le_bytes();
        let length = header.length.to_le_bytes();

        let msg = [
            header.req_type,
            header.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ];

        trace!("RequestHeader:  {:02X?}", msg);
        msg
    }
}

/// Control response header received ahead of the response payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResponseHeader {
    pub res_type: u8,
    pub status: u8,
    pub length: u16,
}

impl ResponseHeader {
    /// Length of the response header in bytes/octets.
    pub const LEN: usize = 4;
}

impl From<&[u8; 4]> for ResponseHeader {
    fn from(data: &[u8; 4]) -> Self {
        trace!("ResponseHeader: {:02X?}", data);

        ResponseHeader {
            res_type: data[0],
            status: data[1],
            length: u16::from_le_bytes([data[2], data[3]]),
        }
    }
}

impl From<&ResponseHeader> for [u8; 4] {
    fn from(header: &ResponseHeader) -> Self {
        let length = header.length.to_le_bytes();
        [header.res_type, header.status, length[0], length[1]]
    }
}

/// Packet type nibble of every streaming data packet.
pub const DATA_FRAME_PACKET: u8 = 0xD0;
/// First packet of a frame.
pub const DATA_FRAME_FLAG_FIRST: u8 = 1 << 0;
/// Last packet of a frame.
pub const DATA_FRAME_FLAG_LAST: u8 = 1 << 1;
/// The last 8 payload bytes of the last packet are an epoch timestamp.
pub const DATA_FRAME_FLAG_TIMESTAMP: u8 = 1 << 2;
/// The frame carries an error code or debug text instead of data.
pub const DATA_FRAME_FLAG_ERROR: u8 = 1 << 3;

/// A frame sent in one packet.
pub const DATA_FRAME_SINGLE_PACKET: u8 =
    DATA_FRAME_PACKET | DATA_FRAME_FLAG_FIRST | DATA_FRAME_FLAG_LAST;
/// First packet of a multi-packet frame.
pub const DATA_FRAME_FIRST_PACKET: u8 = DATA_FRAME_PACKET | DATA_FRAME_FLAG_FIRST;
/// Any packet between first and last.
pub const DATA_FRAME_MIDDLE_PACKET: u8 = DATA_FRAME_PACKET;
/// Last packet of a multi-packet frame.
pub const DATA_FRAME_LAST_PACKET: u8 = DATA_FRAME_PACKET | DATA_FRAME_FLAG_LAST;

/// Virtual channel tag of frames not associated with a device stream.
pub const VIRTUAL_CHANNEL_UNDEFINED: u8 = 0xFF;

/// Size of the device timestamp trailing a frame.
pub const TIMESTAMP_SIZE: usize = 8;

/// Header of a streaming data packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataHeader {
    pub packet_type: u8,
    pub channel: u8,
    pub counter: u16,
    pub length: u16,
}

impl DataHeader {
    /// Length of the data packet header in bytes/octets.
    pub const LEN: usize = 6;

    /// Returns true if the type nibble marks a data packet.
    #[inline]
    pub fn is_data(&self) -> bool {
        (self.packet_type & 0xF0) == DATA_FRAME_PACKET
    }

    #[inline]
    pub fn is_first(&self) -> bool {
        self.packet_type & DATA_FRAME_FLAG_FIRST != 0
    }

    #[inline]
    pub fn is_last(&self) -> bool {
        self.packet_type & DATA_FRAME_FLAG_LAST != 0
    }

    #[inline]
    pub fn has_timestamp(&self) -> bool {
        self.packet_type & DATA_FRAME_FLAG_TIMESTAMP != 0
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        self.packet_type & DATA_FRAME_FLAG_ERROR != 0
    }

    /// Payload length of an error packet that carries a status code rather
    /// than debug text.
    #[inline]
    pub fn error_code_length(&self) -> usize {
        4 + if self.has_timestamp() {
            TIMESTAMP_SIZE
        } else {
            0
        }
    }
}

impl From<&[u8; 6]> for DataHeader {
    fn from(data: &[u8; 6]) -> Self {
        DataHeader {
            packet_type: data[0],
            channel: data[1],
            counter: u16::from_le_bytes([data[2], data[3]]),
            length: u16::from_le_bytes([data[4], data[5]]),
        }
    }
}

impl From<&DataHeader> for [u8; 6] {
    fn from(header: &DataHeader) -> Self {
        let counter = header.counter.to_le_bytes();
        let length = header.length.to_le_bytes();
        [
            header.packet_type,
            header.channel,
            counter[0],
            counter[1],
            length[0],
            length[1],
        ]
    }
}

/// Status codes carried by error frames.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DataError {
    /// The link reported an error while receiving
    LowLevelError = 0x4000_0001,
    /// A sequence gap was detected, at least one frame is lost
    FrameDropped = 0x4000_0002,
    /// A packet arrived while no free frame buffer was available
    FramePoolDepleted = 0x4000_0003,
    /// The frame does not fit into the configured buffer size
    FrameSizeExceeded = 0x4000_0004,
    /// The oldest frames were discarded because the queue was full
    FrameQueueTrimmed = 0x4000_0005,
}

impl DataError {
    /// Returns the status code as reported on error frames.
    #[inline]
    pub fn code(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for DataError {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0x4000_0001 => Ok(DataError::LowLevelError),
            0x4000_0002 => Ok(DataError::FrameDropped),
            0x4000_0003 => Ok(DataError::FramePoolDepleted),
            0x4000_0004 => Ok(DataError::FrameSizeExceeded),
            0x4000_0005 => Ok(DataError::FrameQueueTrimmed),
            other => Err(other),
        }
    }
}

impl fmt::Display for DataError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DataError::LowLevelError => write!(f, "low level error"),
            DataError::FrameDropped => write!(f, "frame dropped"),
            DataError::FramePoolDepleted => write!(f, "frame pool depleted"),
            DataError::FrameSizeExceeded => write!(f, "frame size exceeded"),
            DataError::FrameQueueTrimmed => write!(f, "frame queue trimmed"),
        }
    }
}

/// Size of the CRC trailer on serial packets.
pub const CRC_SIZE: usize = 2;

/// Calculates the CRC-16/CCITT-FALSE over a sequence of byte slices.
pub fn packet_crc(parts: &[&[u8]]) -> u16 {
    let mut crc = State::<CCITT_FALSE>::new();
    for part in parts {
        crc.update(part);
    }
    crc.get()
}
