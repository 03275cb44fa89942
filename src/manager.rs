// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Enumerates boards over the configured interfaces and opens them.

use crate::{
    board::{Board, BoardDescriptor, Catalog},
    enumerate::{Enumerator, EthernetEnumerator, SerialEnumerator},
    error::Error,
    ethernet::{EthernetConfig, Transport},
    identity::parse_uuid,
};
use log::{debug, info, warn};
use std::{ops::ControlFlow, path::Path};

/// Decides which enumerated boards are kept.
pub type EnumerationSelector = Box<dyn Fn(&BoardDescriptor) -> bool + Send + Sync>;

/// Owns the enumerators and the list of boards found by the last
/// enumeration.
pub struct BoardManager {
    enumerators: Vec<Box<dyn Enumerator>>,
    selector: Option<EnumerationSelector>,
    descriptors: Vec<BoardDescriptor>,
    config: EthernetConfig,
}

impl Default for BoardManager {
    fn default() -> Self {
        BoardManager::with_enumerators(
            vec![
                Box::new(SerialEnumerator::new(EthernetConfig::default().data)),
                Box::new(EthernetEnumerator::new(EthernetConfig::default())),
            ],
            EthernetConfig::default(),
        )
    }
}

impl BoardManager {
    /// Creates a manager for a comma separated interface list such as
    /// `"serial,udp"`.  Names are case insensitive.
    pub fn new(interfaces: &str) -> Result<BoardManager, Error> {
        BoardManager::with_config(interfaces, EthernetConfig::default())
    }

    /// Like [`BoardManager::new`], with the settings used for every bridge
    /// the manager opens.  The transport of `config` is replaced by the
    /// one named in `interfaces`.
    pub fn with_config(interfaces: &str, config: EthernetConfig) -> Result<BoardManager, Error> {
        let mut enumerators: Vec<Box<dyn Enumerator>> = Vec::new();
        let mut ethernet: Option<Transport> = None;

        for name in interfaces.split(',').map(|name| name.trim().to_lowercase()) {
            match name.as_str() {
                "" => {}
                "serial" => {
                    if !enumerators.iter().any(|e| e.name() == "serial") {
                        enumerators.push(Box::new(SerialEnumerator::new(config.data.clone())));
                    }
                }
                "udp" | "tcp" => {
                    let transport = if name == "udp" {
                        Transport::Udp
                    } else {
                        Transport::Tcp
                    };
                    match ethernet {
                        Some(first) if first != transport => {
                            warn!(
                                "{} and {} are exclusive, ignoring {}",
                                first, transport, transport
                            );
                        }
                        Some(_) => {}
                        None => {
                            ethernet = Some(transport);
                            enumerators.push(Box::new(EthernetEnumerator::new(EthernetConfig {
                                transport,
                                ..config.clone()
                            })));
                        }
                    }
                }
                "uvc" | "libusb" | "wiggler" => {
                    warn!("interface {} is not supported", name);
                }
                other => {
                    return Err(Error::Argument(format!("unknown interface {:?}", other)));
                }
            }
        }

        if enumerators.is_empty() {
            return Err(Error::Argument(format!(
                "no supported interface in {:?}",
                interfaces
            )));
        }
        Ok(BoardManager::with_enumerators(enumerators, config))
    }

    pub fn with_enumerators(
        enumerators: Vec<Box<dyn Enumerator>>,
        config: EthernetConfig,
    ) -> BoardManager {
        BoardManager {
            enumerators,
            selector: None,
            descriptors: Vec::new(),
            config,
        }
    }

    /// Names of the enabled interfaces.
    pub fn interfaces(&self) -> Vec<&'static str> {
        self.enumerators.iter().map(|e| e.name()).collect()
    }

    /// Only boards accepted by `selector` are added to the list, `None`
    /// accepts all.
    pub fn set_enumeration_selector(&mut self, selector: Option<EnumerationSelector>) {
        self.selector = selector;
    }

    /// Replaces the board list with the boards found now.  Stops after
    /// `max_count` boards, 0 means no limit.  Returns the number found.
    pub fn enumerate(&mut self, max_count: usize) -> usize {
        self.enumerate_with(&Catalog::default(), max_count)
    }

    /// Enumerates only the boards `catalog` accepts.
    pub fn enumerate_with(&mut self, catalog: &Catalog, max_count: usize) -> usize {
        self.descriptors.clear();
        let selector = self.selector.as_ref();
        let descriptors = &mut self.descriptors;

        for enumerator in &self.enumerators {
            let mut listener = |descriptor: BoardDescriptor| {
                if selector.is_some_and(|selector| !selector(&descriptor)) {
                    debug!("board at {} deselected", descriptor.location());
                    return ControlFlow::Continue(());
                }
                descriptors.push(descriptor);
                if max_count != 0 && descriptors.len() >= max_count {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            };
            match enumerator.enumerate(catalog, &mut listener) {
                Ok(ControlFlow::Break(())) => break,
                Ok(ControlFlow::Continue(())) => {}
                Err(err) => warn!("{} enumeration failed: {}", enumerator.name(), err),
            }
        }

        info!("{} board(s) enumerated", self.descriptors.len());
        self.descriptors.len()
    }

    pub fn enumerated_list(&self) -> &[BoardDescriptor] {
        &self.descriptors
    }

    /// Opens the first enumerated board accepted by `predicate` that is not
    /// in use yet.
    pub fn create_board_instance_with<P>(&self, mut predicate: P) -> Result<Board, Error>
    where
        P: FnMut(&BoardDescriptor) -> bool,
    {
        if self.descriptors.is_empty() {
            return Err(Error::Connection("No boards enumerated".to_string()));
        }
        let mut matched = false;
        for descriptor in &self.descriptors {
            if !predicate(descriptor) {
                continue;
            }
            matched = true;
            if !descriptor.in_use() {
                return descriptor.create_board();
            }
        }
        if matched {
            Err(Error::Connection("Board already in use".to_string()))
        } else {
            Err(Error::Connection("Board not found".to_string()))
        }
    }

    /// Opens the first board that is not in use.
    pub fn create_board_instance(&self) -> Result<Board, Error> {
        self.create_board_instance_with(|_| true)
    }

    pub fn create_board_instance_at(&self, index: usize) -> Result<Board, Error> {
        if self.descriptors.is_empty() {
            return Err(Error::Connection("No boards enumerated".to_string()));
        }
        self.descriptors
            .get(index)
            .ok_or_else(|| Error::Connection("Board not found".to_string()))?
            .create_board()
    }

    pub fn create_specific_board_instance(&self, vid: u16, pid: u16) -> Result<Board, Error> {
        self.create_board_instance_with(|d| d.vid() == vid && d.pid() == pid)
    }

    pub fn create_board_instance_by_name(&self, name: &str) -> Result<Board, Error> {
        self.create_board_instance_with(|d| d.name() == name)
    }

    /// Opens the board whose UUID matches `uuid`, in any form
    /// [`parse_uuid`] accepts.  Boards that cannot report a UUID are
    /// skipped.
    pub fn create_board_instance_by_uuid(&self, uuid: &str) -> Result<Board, Error> {
        let uuid = parse_uuid(uuid)?;
        self.create_board_instance_with(|d| match d.uuid() {
            Ok(board_uuid) => board_uuid == uuid,
            Err(err) => {
                debug!("no UUID from {}: {}", d.location(), err);
                false
            }
        })
    }

    /// Enumerates until one board with `vid`/`pid` is found and opens it.
    pub fn search_board(&mut self, vid: u16, pid: u16) -> Result<Board, Error> {
        self.enumerate_with(&Catalog::only(vid, pid), 1);
        self.create_board_instance()
    }

    /// Opens a board on the serial port at `path` without enumerating.
    #[cfg(unix)]
    pub fn open_serial_port<P: AsRef<Path>>(&self, path: P) -> Result<Board, Error> {
        use crate::serial::SerialBridge;
        use std::sync::Arc;

        let bridge = SerialBridge::open(path, self.config.data.clone())?;
        bridge.set_default_timeout();
        Board::from_bridge(Arc::new(bridge), &Catalog::default())
    }

    #[cfg(not(unix))]
    pub fn open_serial_port<P: AsRef<Path>>(&self, _path: P) -> Result<Board, Error> {
        Err(Error::NotSupported(
            "serial ports are not supported on this platform".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::{
        tests::descriptor, BoardType, PID_RADAR_BASEBOARD_AURIX, PID_RADAR_BASEBOARD_MCU7,
        VID_INFINEON,
    };
    use crate::enumerate::EnumerationListener;

    struct MockEnumerator {
        name: &'static str,
        boards: Vec<(u16, u16, &'static str)>,
    }

    impl Enumerator for MockEnumerator {
        fn name(&self) -> &'static str {
            self.name
        }

        fn enumerate(
            &self,
            catalog: &Catalog,
            listener: &mut EnumerationListener,
        ) -> Result<ControlFlow<()>, Error> {
            for &(vid, pid, name) in &self.boards {
                if catalog.resolve(vid, pid).is_none() {
                    continue;
                }
                if listener(descriptor(vid, pid, name, 4)).is_break() {
                    return Ok(ControlFlow::Break(()));
                }
            }
            Ok(ControlFlow::Continue(()))
        }
    }

    fn manager() -> BoardManager {
        BoardManager::with_enumerators(
            vec![
                Box::new(MockEnumerator {
                    name: "serial",
                    boards: vec![
                        (VID_INFINEON, PID_RADAR_BASEBOARD_MCU7, "MCU7"),
                        (0x1234, 0x0001, "Custom"),
                    ],
                }),
                Box::new(MockEnumerator {
                    name: "udp",
                    boards: vec![(VID_INFINEON, PID_RADAR_BASEBOARD_AURIX, "Aurix")],
                }),
            ],
            EthernetConfig::default(),
        )
    }

    #[test]
    fn test_interface_list() {
        let manager = BoardManager::new("Serial, UDP").unwrap();
        assert_eq!(manager.interfaces(), ["serial", "udp"]);

        // the second ethernet transport is ignored
        let manager = BoardManager::new("tcp,udp,uvc").unwrap();
        assert_eq!(manager.interfaces(), ["tcp"]);

        assert!(matches!(BoardManager::new("uvc"), Err(Error::Argument(_))));
        assert!(matches!(BoardManager::new("can"), Err(Error::Argument(_))));
        assert_eq!(BoardManager::default().interfaces(), ["serial", "udp"]);
    }

    #[test]
    fn test_enumerate() {
        let mut manager = manager();
        assert!(matches!(
            manager.create_board_instance(),
            Err(Error::Connection(msg)) if msg == "No boards enumerated"
        ));

        assert_eq!(manager.enumerate(0), 3);
        assert_eq!(manager.enumerate(2), 2);
        assert_eq!(manager.enumerated_list()[1].board_type(), BoardType::Remote);

        manager.set_enumeration_selector(Some(Box::new(|d: &BoardDescriptor| {
            d.vid() == VID_INFINEON
        })));
        assert_eq!(manager.enumerate(0), 2);
        assert_eq!(manager.enumerated_list()[1].name(), "Aurix");

        assert_eq!(
            manager.enumerate_with(&Catalog::only(VID_INFINEON, PID_RADAR_BASEBOARD_AURIX), 0),
            1
        );
    }

    #[test]
    fn test_create_instances() {
        let mut manager = manager();
        manager.enumerate(0);

        let first = manager.create_board_instance().unwrap();
        assert_eq!(first.name(), "MCU7");
        let second = manager.create_board_instance().unwrap();
        assert_eq!(second.name(), "Custom");

        assert!(matches!(
            manager.create_board_instance_at(0),
            Err(Error::Connection(msg)) if msg == "Board already in use"
        ));
        assert!(matches!(
            manager.create_board_instance_at(7),
            Err(Error::Connection(msg)) if msg == "Board not found"
        ));
        assert!(matches!(
            manager.create_board_instance_by_name("MCU7"),
            Err(Error::Connection(msg)) if msg == "Board already in use"
        ));
        assert!(matches!(
            manager.create_specific_board_instance(0xFFFF, 1),
            Err(Error::Connection(msg)) if msg == "Board not found"
        ));

        let aurix = manager
            .create_specific_board_instance(VID_INFINEON, PID_RADAR_BASEBOARD_AURIX)
            .unwrap();
        assert_eq!(aurix.board_type(), BoardType::RadarBaseboardAurix);

        drop(first);
        let again = manager.create_board_instance_by_name("MCU7").unwrap();
        assert_eq!(again.vid(), VID_INFINEON);
    }

    #[test]
    fn test_by_uuid() {
        let mut manager = manager();
        manager.enumerate(0);

        // every mock board reports the same UUID, the first free one opens
        let board = manager
            .create_board_instance_by_uuid("0102030405060708090A0B0C0D0E0F10")
            .unwrap();
        assert_eq!(board.name(), "MCU7");
        assert!(matches!(
            manager.create_board_instance_by_uuid("00000000-0000-0000-0000-000000000000"),
            Err(Error::Connection(_))
        ));
        assert!(matches!(
            manager.create_board_instance_by_uuid("not a uuid"),
            Err(Error::Argument(_))
        ));
    }

    #[test]
    fn test_search_board() {
        let mut manager = manager();
        let board = manager
            .search_board(VID_INFINEON, PID_RADAR_BASEBOARD_AURIX)
            .unwrap();
        assert_eq!(board.name(), "Aurix");
        assert_eq!(manager.enumerated_list().len(), 1);

        let remote = manager.search_board(0x1234, 0x0001).unwrap();
        assert_eq!(remote.board_type(), BoardType::Remote);
        assert!(manager.search_board(0x4321, 0x0001).is_err());
    }
}
