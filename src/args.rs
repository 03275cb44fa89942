// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use std::{num::ParseIntError, time::Duration};

use clap::{Parser, Subcommand};
use radarbridge::{
    bridge::DataConfig,
    ethernet::{EthernetConfig, Transport},
};
use tracing::level_filters::LevelFilter;

/// Parses decimal or `0x` prefixed hexadecimal numbers.
fn parse_number(text: &str) -> Result<u64, ParseIntError> {
    match text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse(),
    }
}

fn parse_u8(text: &str) -> Result<u8, String> {
    let value = parse_number(text).map_err(|err| err.to_string())?;
    u8::try_from(value).map_err(|_| format!("{} does not fit into a byte", text))
}

fn parse_u16(text: &str) -> Result<u16, String> {
    let value = parse_number(text).map_err(|err| err.to_string())?;
    u16::try_from(value).map_err(|_| format!("{} does not fit into 16 bits", text))
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Enumerate the boards reachable over the configured interfaces.
    List {
        /// Print the boards as JSON.
        #[arg(long)]
        json: bool,

        /// Stop after this many boards, 0 for all.
        #[arg(long, default_value = "0")]
        max: usize,
    },

    /// Print board identity, firmware version and UUID.
    Info {
        /// Print the information as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Send a vendor read request and print the answer.
    Read {
        #[arg(value_parser = parse_u8)]
        request: u8,

        #[arg(value_parser = parse_u16)]
        value: u16,

        #[arg(value_parser = parse_u16)]
        index: u16,

        /// Number of bytes to read.
        length: usize,
    },

    /// Send a vendor write request with the given payload bytes.
    Write {
        #[arg(value_parser = parse_u8)]
        request: u8,

        #[arg(value_parser = parse_u16)]
        value: u16,

        #[arg(value_parser = parse_u16)]
        index: u16,

        #[arg(value_parser = parse_u8)]
        payload: Vec<u8>,
    },

    /// Start streaming and print one line per received frame.
    Stream {
        /// Largest frame payload in bytes.
        #[arg(long, env, default_value = "65536")]
        frame_size: usize,

        /// Number of frames queued before the oldest are dropped.
        #[arg(long, env, default_value = "8")]
        queue_size: usize,

        /// Stop after this many frames, 0 streams until no frame arrives
        /// within the frame timeout.
        #[arg(long, default_value = "0")]
        frames: usize,
    },
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Comma separated interfaces searched for boards: serial, udp, tcp
    #[arg(long, env, default_value = "serial,udp")]
    pub interfaces: String,

    /// Board to open: enumeration index, name, UUID, IPv4 address or
    /// serial port path.  The first free board is used when omitted.
    #[arg(long, env)]
    pub board: Option<String>,

    /// Control response timeout in milliseconds
    #[arg(long, env, default_value = "1000")]
    pub control_timeout: u64,

    /// Board control port
    #[arg(long, env, default_value = "55055")]
    pub control_port: u16,

    /// Board data port
    #[arg(long, env, default_value = "55056")]
    pub data_port: u16,

    /// Data socket input buffer in bytes
    #[arg(long, env, default_value = "4194304")]
    pub input_buffer_size: usize,

    /// Frame timeout in milliseconds
    #[arg(long, env, default_value = "5000")]
    pub frame_timeout: u64,

    /// Stamp frames with the host clock instead of the board timestamp
    #[arg(long, env)]
    pub local_timestamp: bool,

    /// Run the data receiver with real-time priority
    #[arg(long, env)]
    pub realtime: bool,

    /// Application log level
    #[arg(long, env, default_value = "info")]
    pub rust_log: LevelFilter,

    /// Enable Tracy profiler broadcast
    #[arg(long, env)]
    pub tracy: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Args {
    /// TCP is used when it is named in the interface list.
    pub fn transport(&self) -> Transport {
        let tcp = self
            .interfaces
            .split(',')
            .any(|name| name.trim().eq_ignore_ascii_case("tcp"));
        if tcp {
            Transport::Tcp
        } else {
            Transport::Udp
        }
    }
}

impl From<&Args> for DataConfig {
    fn from(args: &Args) -> Self {
        DataConfig {
            local_timestamp: args.local_timestamp,
            frame_timeout: Duration::from_millis(args.frame_timeout),
            input_buffer_size: args.input_buffer_size,
            realtime: args.realtime,
            ..Default::default()
        }
    }
}

impl From<&Args> for EthernetConfig {
    fn from(args: &Args) -> Self {
        EthernetConfig {
            control_port: args.control_port,
            data_port: args.data_port,
            transport: args.transport(),
            control_timeout: Duration::from_millis(args.control_timeout),
            data: DataConfig::from(args),
            ..Default::default()
        }
    }
}
