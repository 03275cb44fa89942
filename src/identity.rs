// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Board identity records: board info, firmware version and UUID.

use crate::error::Error;
use std::fmt;
use uuid::Uuid;

/// Identification returned by the board info request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardInfo {
    pub vid: u16,
    pub pid: u16,
    pub name: String,
}

impl BoardInfo {
    /// Decodes `[vidLo, vidHi, pidLo, pidHi, name..., 0]`.  The name ends
    /// at the first NUL or the end of the payload.
    pub fn from_bytes(payload: &[u8]) -> Result<BoardInfo, Error> {
        if payload.len() < 4 {
            return Err(Error::Protocol(format!(
                "board info too short: {} bytes",
                payload.len()
            )));
        }
        let name = &payload[4..];
        let end = name.iter().position(|&c| c == 0).unwrap_or(name.len());
        Ok(BoardInfo {
            vid: u16::from_le_bytes([payload[0], payload[1]]),
            pid: u16::from_le_bytes([payload[2], payload[3]]),
            name: String::from_utf8_lossy(&name[..end]).into_owned(),
        })
    }
}

/// Firmware and protocol version of a board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VersionInfo {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
    pub build: u16,
    pub protocol_major: u16,
    pub protocol_minor: u16,
}

impl VersionInfo {
    /// Size of the version info payload, two trailing words are reserved.
    pub const LEN: usize = 16;

    pub fn from_bytes(payload: &[u8; 16]) -> VersionInfo {
        let word = |i: usize| u16::from_le_bytes([payload[2 * i], payload[2 * i + 1]]);
        VersionInfo {
            major: word(0),
            minor: word(1),
            patch: word(2),
            build: word(3),
            protocol_major: word(4),
            protocol_minor: word(5),
        }
    }
}

impl fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.patch, self.build
        )
    }
}

/// Parses a board UUID in simple, hyphenated, braced or URN form.  Case
/// does not matter.
pub fn parse_uuid(text: &str) -> Result<Uuid, Error> {
    Uuid::try_parse(text)
        .map_err(|err| Error::Argument(format!("invalid UUID {:?}: {}", text, err)))
}

/// Canonical lowercase hyphenated form.
pub fn format_uuid(uuid: &Uuid) -> String {
    uuid.hyphenated().to_string()
}
