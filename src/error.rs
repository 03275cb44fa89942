// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use crate::protocol::status_name;
use std::{fmt, io};

/// Bridge error types.
///
/// Control channel failures are returned to the caller of the vendor
/// command.  Data channel failures never leave the receiver thread, they are
/// turned into error frames instead.
#[derive(Debug)]
pub enum Error {
    /// I/O error from the underlying socket or serial port
    Io(io::Error),
    /// Invalid configuration or argument, nothing was changed
    Argument(String),
    /// Link cannot be opened, was closed, or is unusable
    Connection(String),
    /// Framing error: header mismatch, length disagreement, stray packet
    Protocol(String),
    /// The board answered a vendor request with a non-zero status
    ProtocolFunction(u8),
    /// Streaming was started or used in an invalid state
    BridgeData(String),
    /// A frame buffer was returned to a pool it does not belong to
    AlienFrame,
    /// A frame buffer was returned to its pool twice
    DoubleQueue,
    /// The requested interface is not available in this build
    NotSupported(String),
}

impl Error {
    /// Returns true for errors after which a link can no longer be used,
    /// which terminates a receiver thread.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Connection(_))
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Io(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Io(err) => write!(f, "io error: {}", err),
            Error::Argument(err) => write!(f, "invalid argument: {}", err),
            Error::Connection(err) => write!(f, "connection error: {}", err),
            Error::Protocol(err) => write!(f, "protocol error: {}", err),
            Error::ProtocolFunction(status) => match status_name(*status) {
                Some(name) => write!(f, "board returned status 0x{:02X} ({})", status, name),
                None => write!(f, "board returned status 0x{:02X}", status),
            },
            Error::BridgeData(err) => write!(f, "bridge data error: {}", err),
            Error::AlienFrame => write!(f, "frame was not allocated by this pool"),
            Error::DoubleQueue => write!(f, "frame is already queued in this pool"),
            Error::NotSupported(err) => write!(f, "not supported: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_status() {
        let err = Error::ProtocolFunction(0x86);
        assert_eq!(
            err.to_string(),
            "board returned status 0x86 (request invalid)"
        );

        let err = Error::ProtocolFunction(0x01);
        assert_eq!(err.to_string(), "board returned status 0x01");
    }

    #[test]
    fn test_fatal() {
        assert!(Error::Connection("closed".to_string()).is_fatal());
        assert!(!Error::Protocol("short".to_string()).is_fatal());
        assert!(!Error::ProtocolFunction(0x80).is_fatal());
    }
}
