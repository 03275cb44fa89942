// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Bridge to a board on the network, with separate control and data
//! sockets.

use crate::{
    bridge::{cleanup_link, Bridge, BridgeData, DataConfig},
    control::{ControlChannel, VendorCommands, DEFAULT_CONTROL_TIMEOUT},
    data::spawn_receiver,
    error::Error,
    link::{Link, Socket, TcpLink, UdpLink, ETHERNET_CONTROL_PORT, ETHERNET_DATA_PORT},
};
use log::{debug, error, info};
use std::{
    fmt,
    net::{Ipv4Addr, SocketAddrV4},
    sync::{Mutex, MutexGuard},
    thread::JoinHandle,
    time::Duration,
};

/// Transport protocol used for both channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    #[default]
    Udp,
    Tcp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Transport::Udp => write!(f, "udp"),
            Transport::Tcp => write!(f, "tcp"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthernetConfig {
    pub control_port: u16,
    pub data_port: u16,
    pub transport: Transport,
    pub control_timeout: Duration,
    /// Receive timeout of the data link, bounds how long stopping the
    /// receiver takes.
    pub data_timeout: Duration,
    pub data: DataConfig,
}

impl Default for EthernetConfig {
    fn default() -> Self {
        EthernetConfig {
            control_port: ETHERNET_CONTROL_PORT,
            data_port: ETHERNET_DATA_PORT,
            transport: Transport::Udp,
            control_timeout: DEFAULT_CONTROL_TIMEOUT,
            data_timeout: Duration::from_millis(1000),
            data: DataConfig::default(),
        }
    }
}

enum DataLink {
    Closed,
    Idle(Box<dyn Link>),
    Streaming(JoinHandle<Box<dyn Link>>),
}

pub struct EthernetBridge {
    address: Ipv4Addr,
    config: EthernetConfig,
    control: ControlChannel,
    data: BridgeData,
    link: Mutex<DataLink>,
}

fn open_link(
    address: Ipv4Addr,
    transport: Transport,
    port: u16,
    timeout: Duration,
) -> Result<Box<dyn Link>, Error> {
    let remote = Some(SocketAddrV4::new(address, port));
    match transport {
        Transport::Udp => {
            let mut link = UdpLink::new();
            link.open(0, remote, timeout)?;
            Ok(Box::new(link))
        }
        Transport::Tcp => {
            let mut link = TcpLink::new();
            link.open(0, remote, timeout)?;
            Ok(Box::new(link))
        }
    }
}

impl EthernetBridge {
    /// Opens the control and data links to the board at `address`.
    pub fn connect(address: Ipv4Addr, config: EthernetConfig) -> Result<EthernetBridge, Error> {
        let control = open_link(
            address,
            config.transport,
            config.control_port,
            config.control_timeout,
        )?;
        let bridge = EthernetBridge {
            address,
            control: ControlChannel::new(control),
            data: BridgeData::new(config.data.clone()),
            link: Mutex::new(DataLink::Closed),
            config,
        };
        bridge.open_data_link()?;
        info!(
            "connected to board at {} over {}",
            bridge.address, bridge.config.transport
        );
        Ok(bridge)
    }

    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    pub fn config(&self) -> &EthernetConfig {
        &self.config
    }

    /// Changes the response timeout of the control link.
    pub fn set_control_timeout(&self, timeout: Duration) -> Result<(), Error> {
        self.control.set_timeout(timeout)
    }

    fn lock_link(&self) -> MutexGuard<'_, DataLink> {
        self.link
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn open_data_link(&self) -> Result<(), Error> {
        let mut link = open_link(
            self.address,
            self.config.transport,
            self.config.data_port,
            self.config.data_timeout,
        )?;
        link.set_input_buffer_size(self.config.data.input_buffer_size)?;
        // the board sends data to wherever this empty packet came from
        link.send(&[])?;
        *self.lock_link() = DataLink::Idle(link);
        Ok(())
    }
}

impl Bridge for EthernetBridge {
    fn is_connected(&self) -> bool {
        self.control.is_open() && !matches!(*self.lock_link(), DataLink::Closed)
    }

    fn open_connection(&self) -> Result<(), Error> {
        self.close_connection();
        let control = open_link(
            self.address,
            self.config.transport,
            self.config.control_port,
            self.config.control_timeout,
        )?;
        self.control.replace_link(control);
        self.open_data_link()
    }

    fn close_connection(&self) {
        self.stop_streaming();
        self.control.close();
        let state = std::mem::replace(&mut *self.lock_link(), DataLink::Closed);
        if let DataLink::Idle(mut link) = state {
            link.close();
        }
    }

    fn control(&self) -> &dyn VendorCommands {
        &self.control
    }

    fn data(&self) -> &BridgeData {
        &self.data
    }

    fn start_streaming(&self) -> Result<(), Error> {
        let mut state = self.lock_link();
        if self.data.is_started() {
            return Ok(());
        }

        let mut link = match std::mem::replace(&mut *state, DataLink::Closed) {
            DataLink::Idle(link) if link.is_open() => link,
            other => {
                *state = other;
                return self.data.check_startable(false);
            }
        };
        if let Err(err) = self.data.check_startable(true) {
            *state = DataLink::Idle(link);
            return Err(err);
        }

        cleanup_link(link.as_mut(), self.data.config().cleanup_timeout);
        self.data.start()?;
        let handle = spawn_receiver(
            link,
            self.data.receiver_context(),
            self.data.config().realtime,
        );
        match handle {
            Ok(handle) => {
                *state = DataLink::Streaming(handle);
                debug!("streaming started from {}", self.address);
                Ok(())
            }
            Err(err) => {
                self.data.stop();
                Err(err)
            }
        }
    }

    fn stop_streaming(&self) {
        let mut state = self.lock_link();
        match std::mem::replace(&mut *state, DataLink::Closed) {
            DataLink::Streaming(handle) => {
                self.data.stop();
                match handle.join() {
                    Ok(link) => *state = DataLink::Idle(link),
                    Err(_) => error!("data receiver thread panicked"),
                }
                debug!("streaming stopped from {}", self.address);
            }
            other => *state = other,
        }
    }
}

impl Drop for EthernetBridge {
    fn drop(&mut self) {
        self.close_connection();
    }
}
