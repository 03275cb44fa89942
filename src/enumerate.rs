// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Board discovery, one enumerator per link family.

use crate::{
    board::{BoardDescriptor, Catalog},
    bridge::{Bridge, DataConfig},
    control::BoardProtocol,
    error::Error,
    ethernet::{EthernetBridge, EthernetConfig, Transport},
    identity::BoardInfo,
    link::{DatagramLink, Link, Socket, UdpLink},
    protocol::*,
};
use log::{debug, info};
use std::{
    net::{Ipv4Addr, SocketAddrV4},
    ops::ControlFlow,
    sync::Arc,
    time::{Duration, Instant},
};

/// Receives every descriptor found, [`ControlFlow::Break`] ends the
/// enumeration.
pub type EnumerationListener<'a> = dyn FnMut(BoardDescriptor) -> ControlFlow<()> + 'a;

pub trait Enumerator: Send + Sync {
    /// Interface name as used in the manager's interface list.
    fn name(&self) -> &'static str;

    /// Reports every board accepted by `catalog` to `listener`.  Returns
    /// `Break` if the listener ended the enumeration.
    fn enumerate(
        &self,
        catalog: &Catalog,
        listener: &mut EnumerationListener,
    ) -> Result<ControlFlow<()>, Error>;
}

/// Broadcast targets used when the host reports no broadcast address.
const DEFAULT_BROADCASTS: [Ipv4Addr; 2] = [
    Ipv4Addr::new(169, 254, 255, 255),
    Ipv4Addr::new(169, 254, 1, 255),
];
/// How long replies are collected.
const RESPONSE_WINDOW: Duration = Duration::from_millis(200);
const RECEIVE_TIMEOUT: Duration = Duration::from_millis(100);
/// Longest board info answer accepted.
const MAX_BOARD_INFO_LENGTH: usize = 256;

/// Finds boards on the network by broadcasting a board info request.
pub struct EthernetEnumerator {
    config: EthernetConfig,
    targets: Option<Vec<SocketAddrV4>>,
}

impl EthernetEnumerator {
    /// Bridges created from the descriptors use `config`.
    pub fn new(config: EthernetConfig) -> EthernetEnumerator {
        EthernetEnumerator {
            config,
            targets: None,
        }
    }

    /// Sends the request to `targets` instead of the broadcast addresses.
    pub fn with_targets(config: EthernetConfig, targets: Vec<SocketAddrV4>) -> EthernetEnumerator {
        EthernetEnumerator {
            config,
            targets: Some(targets),
        }
    }

    fn send_requests(&self, link: &mut UdpLink) {
        let request = <[u8; RequestHeader::LEN]>::from(&RequestHeader {
            req_type: VENDOR_REQ_TRANSFER,
            request: REQ_BOARD_INFO,
            value: REQ_BOARD_INFO_BOARD_INFO_WVALUE,
            index: 0,
            length: 0,
        });

        let targets = match &self.targets {
            Some(targets) => targets.clone(),
            None => {
                let targets = link.broadcast_addresses(self.config.control_port);
                if targets.is_empty() {
                    debug!("no broadcast addresses found, using defaults");
                    DEFAULT_BROADCASTS
                        .iter()
                        .map(|addr| SocketAddrV4::new(*addr, self.config.control_port))
                        .collect()
                } else {
                    targets
                }
            }
        };

        for target in targets {
            debug!("looking for boards under {} over UDP", target);
            if let Err(err) = link.send_to(&request, target) {
                debug!("board info broadcast to {}: {}", target, err);
            }
        }
    }
}

/// Checks a board info reply and decodes it.
fn parse_reply(packet: &[u8]) -> Result<BoardInfo, Error> {
    if packet.len() < ResponseHeader::LEN {
        return Err(Error::Protocol(format!(
            "response incomplete: {} bytes",
            packet.len()
        )));
    }
    let header = ResponseHeader::from(&[packet[0], packet[1], packet[2], packet[3]]);
    if header.res_type != VENDOR_REQ_TRANSFER {
        return Err(Error::Protocol(format!(
            "response type {:#04x} is not a transfer",
            header.res_type
        )));
    }
    if header.status != STATUS_SUCCESS {
        return Err(Error::ProtocolFunction(header.status));
    }
    // header plus vid and pid at least
    if packet.len() <= ResponseHeader::LEN + 4 {
        return Err(Error::Protocol(format!(
            "response incomplete: {} bytes",
            packet.len()
        )));
    }
    if header.length as usize > MAX_BOARD_INFO_LENGTH {
        return Err(Error::Protocol(format!(
            "response length {} too long",
            header.length
        )));
    }
    let end = packet.len().min(ResponseHeader::LEN + header.length as usize);
    BoardInfo::from_bytes(&packet[ResponseHeader::LEN..end])
}

impl Enumerator for EthernetEnumerator {
    fn name(&self) -> &'static str {
        match self.config.transport {
            Transport::Udp => "udp",
            Transport::Tcp => "tcp",
        }
    }

    fn enumerate(
        &self,
        catalog: &Catalog,
        listener: &mut EnumerationListener,
    ) -> Result<ControlFlow<()>, Error> {
        let mut link = UdpLink::new();
        link.open(0, None, RECEIVE_TIMEOUT)?;
        link.set_broadcast(true)?;
        self.send_requests(&mut link);

        let mut packet = [0u8; ResponseHeader::LEN + MAX_BOARD_INFO_LENGTH];
        let expiry = Instant::now() + RESPONSE_WINDOW;
        let mut flow = ControlFlow::Continue(());

        while Instant::now() < expiry {
            let (n, remote) = link.receive_from(&mut packet)?;
            let Some(remote) = remote else {
                continue;
            };
            if n == 0 {
                continue;
            }
            let info = match parse_reply(&packet[..n]) {
                Ok(info) => info,
                Err(err) => {
                    debug!("reply from {}: {}", remote, err);
                    continue;
                }
            };
            debug!(
                "found board at {}: vid {:#06x} pid {:#06x} {:?}",
                remote.ip(),
                info.vid,
                info.pid,
                info.name
            );

            let Some(board_type) = catalog.resolve(info.vid, info.pid) else {
                debug!("board at {} not in catalog", remote.ip());
                continue;
            };
            let address = *remote.ip();
            let config = self.config.clone();
            let descriptor = BoardDescriptor::new(
                info,
                board_type,
                format!("{}://{}", config.transport, address),
                move || {
                    let bridge = EthernetBridge::connect(address, config.clone())?;
                    Ok(Arc::new(bridge) as Arc<dyn Bridge>)
                },
            );
            if listener(descriptor).is_break() {
                flow = ControlFlow::Break(());
                break;
            }
        }

        link.close();
        Ok(flow)
    }
}

/// Directory holding one entry per tty device.
pub const SYS_CLASS_TTY: &str = "/sys/class/tty";

/// A candidate serial port with the USB ids of its device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialPortInfo {
    pub name: String,
    pub path: std::path::PathBuf,
    pub vid: u16,
    pub pid: u16,
}

/// Extracts the USB ids from a `PRODUCT=vid/pid/rev` uevent line.
pub fn parse_uevent(text: &str) -> Option<(u16, u16)> {
    text.lines().find_map(|line| {
        let mut ids = line.strip_prefix("PRODUCT=")?.split('/');
        let vid = u16::from_str_radix(ids.next()?, 16).ok()?;
        let pid = u16::from_str_radix(ids.next()?, 16).ok()?;
        Some((vid, pid))
    })
}

/// Lists the `ttyACM*` ports below `sys_dir` whose device node exists in
/// `dev_dir`, sorted by name.
pub fn scan_serial_ports(
    sys_dir: &std::path::Path,
    dev_dir: &std::path::Path,
) -> Vec<SerialPortInfo> {
    let entries = match std::fs::read_dir(sys_dir) {
        Ok(entries) => entries,
        Err(err) => {
            debug!("cannot list {}: {}", sys_dir.display(), err);
            return Vec::new();
        }
    };

    let mut ports: Vec<SerialPortInfo> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with("ttyACM") {
                return None;
            }
            let path = dev_dir.join(&name);
            if !path.exists() {
                return None;
            }
            let uevent = std::fs::read_to_string(entry.path().join("device/uevent")).ok()?;
            let (vid, pid) = parse_uevent(&uevent)?;
            Some(SerialPortInfo {
                name,
                path,
                vid,
                pid,
            })
        })
        .collect();
    ports.sort_by(|a, b| a.name.cmp(&b.name));
    ports
}

/// Finds boards on USB CDC serial ports.
pub struct SerialEnumerator {
    config: DataConfig,
    sys_dir: std::path::PathBuf,
    dev_dir: std::path::PathBuf,
}

impl SerialEnumerator {
    pub fn new(config: DataConfig) -> SerialEnumerator {
        SerialEnumerator {
            config,
            sys_dir: SYS_CLASS_TTY.into(),
            dev_dir: "/dev".into(),
        }
    }
}

impl Enumerator for SerialEnumerator {
    fn name(&self) -> &'static str {
        "serial"
    }

    #[cfg(unix)]
    fn enumerate(
        &self,
        catalog: &Catalog,
        listener: &mut EnumerationListener,
    ) -> Result<ControlFlow<()>, Error> {
        use crate::serial::SerialBridge;

        for port in scan_serial_ports(&self.sys_dir, &self.dev_dir) {
            debug!(
                "probing {} (usb {:04x}:{:04x})",
                port.path.display(),
                port.vid,
                port.pid
            );
            // the bridge starts with the short identification timeout
            let info = match SerialBridge::open(&port.path, self.config.clone())
                .and_then(|bridge| bridge.get_board_info())
            {
                Ok(info) => info,
                Err(err) => {
                    debug!("no board on {}: {}", port.path.display(), err);
                    continue;
                }
            };

            let Some(board_type) = catalog.resolve(info.vid, info.pid) else {
                debug!("board on {} not in catalog", port.path.display());
                continue;
            };
            info!("found {} on {}", info.name, port.path.display());
            let path = port.path.clone();
            let config = self.config.clone();
            let descriptor = BoardDescriptor::new(
                info,
                board_type,
                path.display().to_string(),
                move || {
                    let bridge = SerialBridge::open(&path, config.clone())?;
                    bridge.set_default_timeout();
                    Ok(Arc::new(bridge) as Arc<dyn Bridge>)
                },
            );
            if listener(descriptor).is_break() {
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    #[cfg(not(unix))]
    fn enumerate(
        &self,
        _catalog: &Catalog,
        _listener: &mut EnumerationListener,
    ) -> Result<ControlFlow<()>, Error> {
        Err(Error::NotSupported(
            "serial enumeration is not supported on this platform".to_string(),
        ))
    }
}
