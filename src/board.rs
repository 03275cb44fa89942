// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Known boards and the handles used to open them.
//!
//! Enumeration yields a [`BoardDescriptor`] per responding board.  The
//! descriptor only remembers how to reach the board; its bridge is created
//! on first use and shared with every [`Board`] opened from it.

use crate::{
    bridge::{Bridge, BridgeData},
    control::{BoardProtocol, VendorCommands},
    error::Error,
    identity::{format_uuid, BoardInfo, VersionInfo},
};
use log::{debug, info};
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, OnceLock,
    },
};
use uuid::Uuid;

/// Infineon vendor id.
pub const VID_INFINEON: u16 = 0x058B;
pub const PID_RADAR_BASEBOARD_MCU7: u16 = 0x0251;
pub const PID_RADAR_BASEBOARD_AURIX: u16 = 0x0252;
pub const PID_V9: u16 = 0x0253;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BoardType {
    RadarBaseboardMcu7,
    RadarBaseboardAurix,
    V9,
    /// Any board that answers vendor commands but is not in the catalog.
    Remote,
}

impl BoardType {
    /// Catalog boards refuse to open with an incompatible protocol version.
    pub fn checks_version(self) -> bool {
        !matches!(self, BoardType::Remote)
    }
}

impl fmt::Display for BoardType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            BoardType::RadarBaseboardMcu7 => "RadarBaseboardMCU7",
            BoardType::RadarBaseboardAurix => "RadarBaseboardAurix",
            BoardType::V9 => "V9",
            BoardType::Remote => "RemoteBoard",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogEntry {
    pub vid: u16,
    pub pid: u16,
    pub board_type: BoardType,
}

const KNOWN_BOARDS: [CatalogEntry; 3] = [
    CatalogEntry {
        vid: VID_INFINEON,
        pid: PID_RADAR_BASEBOARD_MCU7,
        board_type: BoardType::RadarBaseboardMcu7,
    },
    CatalogEntry {
        vid: VID_INFINEON,
        pid: PID_RADAR_BASEBOARD_AURIX,
        board_type: BoardType::RadarBaseboardAurix,
    },
    CatalogEntry {
        vid: VID_INFINEON,
        pid: PID_V9,
        board_type: BoardType::V9,
    },
];

/// Which boards outside the catalog entries are accepted as
/// [`BoardType::Remote`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemoteBoards {
    Any,
    Only(u16, u16),
    None,
}

/// Maps (vid, pid) to a board type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    entries: Vec<CatalogEntry>,
    remote: RemoteBoards,
}

impl Default for Catalog {
    fn default() -> Self {
        Catalog {
            entries: KNOWN_BOARDS.to_vec(),
            remote: RemoteBoards::Any,
        }
    }
}

impl Catalog {
    /// Restricts the catalog to one board.  Unknown ids are still accepted
    /// as a remote board with exactly these ids.
    pub fn only(vid: u16, pid: u16) -> Catalog {
        let entries: Vec<CatalogEntry> = KNOWN_BOARDS
            .iter()
            .filter(|entry| entry.vid == vid && entry.pid == pid)
            .copied()
            .collect();
        let remote = if entries.is_empty() {
            RemoteBoards::Only(vid, pid)
        } else {
            RemoteBoards::None
        };
        Catalog { entries, remote }
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    /// Returns the board type for `vid`/`pid`, or `None` if this catalog
    /// does not accept the board.
    pub fn resolve(&self, vid: u16, pid: u16) -> Option<BoardType> {
        let known = self
            .entries
            .iter()
            .find(|entry| entry.vid == vid && entry.pid == pid);
        match (known, self.remote) {
            (Some(entry), _) => Some(entry.board_type),
            (None, RemoteBoards::Any) => Some(BoardType::Remote),
            (None, RemoteBoards::Only(v, p)) if (v, p) == (vid, pid) => Some(BoardType::Remote),
            _ => None,
        }
    }
}

type BridgeFactory = Box<dyn Fn() -> Result<Arc<dyn Bridge>, Error> + Send + Sync>;

/// An enumerated board that has not been opened yet.
pub struct BoardDescriptor {
    info: BoardInfo,
    board_type: BoardType,
    location: String,
    factory: BridgeFactory,
    bridge: Mutex<Option<Arc<dyn Bridge>>>,
    uuid: OnceLock<Uuid>,
    in_use: Arc<AtomicBool>,
}

impl fmt::Debug for BoardDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BoardDescriptor")
            .field("info", &self.info)
            .field("board_type", &self.board_type)
            .field("location", &self.location)
            .finish()
    }
}

impl BoardDescriptor {
    /// `factory` opens a bridge to the board.  It is called once, when the
    /// bridge is first needed.  `location` describes where the board was
    /// found.
    pub fn new<F>(info: BoardInfo, board_type: BoardType, location: String, factory: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn Bridge>, Error> + Send + Sync + 'static,
    {
        BoardDescriptor {
            info,
            board_type,
            location,
            factory: Box::new(factory),
            bridge: Mutex::new(None),
            uuid: OnceLock::new(),
            in_use: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn vid(&self) -> u16 {
        self.info.vid
    }

    pub fn pid(&self) -> u16 {
        self.info.pid
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn info(&self) -> &BoardInfo {
        &self.info
    }

    pub fn board_type(&self) -> BoardType {
        self.board_type
    }

    /// Network address or device path of the board.
    pub fn location(&self) -> &str {
        &self.location
    }

    /// Whether a [`Board`] created from this descriptor is still alive.
    pub fn in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    /// The bridge to the board, created on the first call.  A bridge whose
    /// connection was closed is reopened.
    pub fn bridge(&self) -> Result<Arc<dyn Bridge>, Error> {
        let mut bridge = self
            .bridge
            .lock()
            .map_err(|_| Error::Connection("board descriptor poisoned".to_string()))?;
        match bridge.as_ref() {
            Some(bridge) => {
                if !bridge.is_connected() {
                    bridge.open_connection()?;
                }
                Ok(bridge.clone())
            }
            None => {
                let created = (self.factory)()?;
                debug!("created bridge to {}", self.location);
                *bridge = Some(created.clone());
                Ok(created)
            }
        }
    }

    /// Reads the UUID of the board through its bridge.  Later calls use the
    /// cached value.
    pub fn uuid(&self) -> Result<Uuid, Error> {
        if let Some(uuid) = self.uuid.get() {
            return Ok(*uuid);
        }
        let uuid = self.bridge()?.control().get_uuid()?;
        debug!("board {} has UUID {}", self.location, format_uuid(&uuid));
        Ok(*self.uuid.get_or_init(|| uuid))
    }

    /// Opens the board.  Only one board per descriptor can be open at a
    /// time.
    pub fn create_board(&self) -> Result<Board, Error> {
        if self
            .in_use
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::Connection("Board already in use".to_string()));
        }
        let board = self.bridge().and_then(|bridge| {
            Board::new(
                bridge,
                self.board_type,
                self.info.clone(),
                self.in_use.clone(),
                false,
            )
        });
        match board {
            Ok(board) => {
                if let Some(uuid) = board.uuid.get() {
                    let _ = self.uuid.set(*uuid);
                }
                info!(
                    "opened {} ({}) at {}",
                    self.info.name, self.board_type, self.location
                );
                Ok(board)
            }
            Err(err) => {
                self.in_use.store(false, Ordering::Release);
                Err(err)
            }
        }
    }
}

/// An open board: a bridge plus the identity queried through it.
pub struct Board {
    bridge: Arc<dyn Bridge>,
    board_type: BoardType,
    info: BoardInfo,
    version: OnceLock<VersionInfo>,
    uuid: OnceLock<Uuid>,
    in_use: Arc<AtomicBool>,
    /// Close the connection on drop.  Bridges owned by a descriptor stay
    /// open for the next board.
    owns_bridge: bool,
}

impl Board {
    fn new(
        bridge: Arc<dyn Bridge>,
        board_type: BoardType,
        info: BoardInfo,
        in_use: Arc<AtomicBool>,
        owns_bridge: bool,
    ) -> Result<Board, Error> {
        let board = Board {
            bridge,
            board_type,
            info,
            version: OnceLock::new(),
            uuid: OnceLock::new(),
            in_use,
            owns_bridge,
        };
        if board_type.checks_version() {
            let version = board.bridge.control().check_version()?;
            let _ = board.version.set(version);
        }
        Ok(board)
    }

    /// Wraps a bridge that was opened directly, without enumeration.
    pub fn from_bridge(bridge: Arc<dyn Bridge>, catalog: &Catalog) -> Result<Board, Error> {
        let info = bridge.control().get_board_info()?;
        let board_type = catalog
            .resolve(info.vid, info.pid)
            .ok_or_else(|| Error::Connection("Board not found".to_string()))?;
        Board::new(bridge, board_type, info, Arc::new(AtomicBool::new(true)), true)
    }

    pub fn bridge(&self) -> &Arc<dyn Bridge> {
        &self.bridge
    }

    pub fn control(&self) -> &dyn VendorCommands {
        self.bridge.control()
    }

    pub fn data(&self) -> &BridgeData {
        self.bridge.data()
    }

    pub fn board_type(&self) -> BoardType {
        self.board_type
    }

    pub fn info(&self) -> &BoardInfo {
        &self.info
    }

    pub fn vid(&self) -> u16 {
        self.info.vid
    }

    pub fn pid(&self) -> u16 {
        self.info.pid
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn get_version_info(&self) -> Result<VersionInfo, Error> {
        if let Some(version) = self.version.get() {
            return Ok(*version);
        }
        let version = self.control().get_version_info()?;
        Ok(*self.version.get_or_init(|| version))
    }

    pub fn get_version_string(&self) -> Result<String, Error> {
        Ok(self.get_version_info()?.to_string())
    }

    pub fn get_extended_version_string(&self) -> Result<String, Error> {
        self.control().get_extended_version_string()
    }

    pub fn get_uuid(&self) -> Result<Uuid, Error> {
        if let Some(uuid) = self.uuid.get() {
            return Ok(*uuid);
        }
        let uuid = self.control().get_uuid()?;
        Ok(*self.uuid.get_or_init(|| uuid))
    }

    pub fn get_uuid_string(&self) -> Result<String, Error> {
        Ok(format_uuid(&self.get_uuid()?))
    }

    pub fn get_last_error(&self) -> Result<u32, Error> {
        self.control().get_last_error()
    }

    pub fn activate_bootloader(&self) -> Result<(), Error> {
        self.control().activate_bootloader()
    }
}

impl Drop for Board {
    fn drop(&mut self) {
        if self.owns_bridge {
            self.bridge.close_connection();
        } else {
            self.bridge.stop_streaming();
        }
        self.in_use.store(false, Ordering::Release);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        bridge::DataConfig,
        link::{mock::MockLink, LinkMode, SERIAL_MAX_PACKET_SIZE},
        protocol::*,
        serial::SerialBridge,
    };
    use std::sync::atomic::AtomicUsize;

    fn with_crc(mut packet: Vec<u8>) -> Vec<u8> {
        let crc = packet_crc(&[&packet]);
        packet.extend_from_slice(&crc.to_be_bytes());
        packet
    }

    /// A serial board with the given identity that answers the board info
    /// requests.
    pub(crate) fn fake_bridge(
        vid: u16,
        pid: u16,
        name: &str,
        protocol_major: u16,
    ) -> Arc<dyn Bridge> {
        let link = MockLink::new(LinkMode::Stream, SERIAL_MAX_PACKET_SIZE);
        let name = name.to_string();
        link.handle().set_responder(move |request| {
            let req_type = request[0];
            let value = u16::from_le_bytes([request[2], request[3]]);
            let payload = match (request[1], value) {
                (REQ_BOARD_INFO, REQ_BOARD_INFO_BOARD_INFO_WVALUE) => {
                    let mut info = vid.to_le_bytes().to_vec();
                    info.extend_from_slice(&pid.to_le_bytes());
                    info.extend_from_slice(name.as_bytes());
                    info.push(0);
                    info
                }
                (REQ_BOARD_INFO, REQ_BOARD_INFO_VERSION_INFO_WVALUE) => {
                    [1u16, 2, 3, 4, protocol_major, 0, 0, 0]
                        .iter()
                        .flat_map(|word| word.to_le_bytes())
                        .collect()
                }
                (REQ_BOARD_INFO, REQ_BOARD_INFO_UUID_WVALUE) => (1..=16).collect(),
                _ => Vec::new(),
            };
            let mut packet = <[u8; 4]>::from(&ResponseHeader {
                res_type: req_type,
                status: 0,
                length: payload.len() as u16,
            })
            .to_vec();
            packet.extend_from_slice(&payload);
            vec![with_crc(packet)]
        });
        let bridge = SerialBridge::with_link("/dev/ttyACM9", Box::new(link), DataConfig::default());
        bridge.set_default_timeout();
        Arc::new(bridge)
    }

    pub(crate) fn descriptor(
        vid: u16,
        pid: u16,
        name: &str,
        protocol_major: u16,
    ) -> BoardDescriptor {
        let name_owned = name.to_string();
        BoardDescriptor::new(
            BoardInfo {
                vid,
                pid,
                name: name.to_string(),
            },
            Catalog::default().resolve(vid, pid).unwrap_or(BoardType::Remote),
            format!("mock:{}", name),
            move || Ok(fake_bridge(vid, pid, &name_owned, protocol_major)),
        )
    }

    #[test]
    fn test_catalog() {
        let catalog = Catalog::default();
        assert_eq!(
            catalog.resolve(VID_INFINEON, PID_RADAR_BASEBOARD_AURIX),
            Some(BoardType::RadarBaseboardAurix)
        );
        assert_eq!(catalog.resolve(0x1234, 0x0001), Some(BoardType::Remote));

        let only = Catalog::only(VID_INFINEON, PID_V9);
        assert_eq!(only.resolve(VID_INFINEON, PID_V9), Some(BoardType::V9));
        assert_eq!(only.resolve(VID_INFINEON, PID_RADAR_BASEBOARD_MCU7), None);
        assert_eq!(only.resolve(0x1234, 0x0001), None);

        let remote = Catalog::only(0x1234, 0x0001);
        assert!(remote.entries().is_empty());
        assert_eq!(remote.resolve(0x1234, 0x0001), Some(BoardType::Remote));
        assert_eq!(remote.resolve(VID_INFINEON, PID_V9), None);
    }

    #[test]
    fn test_create_board() {
        let descriptor = descriptor(VID_INFINEON, PID_RADAR_BASEBOARD_MCU7, "MCU7", 4);
        let board = descriptor.create_board().unwrap();
        assert!(descriptor.in_use());
        assert!(matches!(
            descriptor.create_board(),
            Err(Error::Connection(_))
        ));

        assert_eq!(board.board_type(), BoardType::RadarBaseboardMcu7);
        assert_eq!(board.get_version_string().unwrap(), "1.2.3.4");
        assert_eq!(
            board.get_uuid_string().unwrap(),
            "01020304-0506-0708-090a-0b0c0d0e0f10"
        );

        drop(board);
        assert!(!descriptor.in_use());
        assert_eq!(descriptor.uuid().unwrap().as_bytes()[15], 16);
    }

    #[test]
    fn test_version_check() {
        // catalog boards refuse other protocol versions, remote boards don't
        let descriptor = descriptor(VID_INFINEON, PID_V9, "V9", 3);
        assert!(matches!(descriptor.create_board(), Err(Error::Protocol(_))));
        assert!(!descriptor.in_use());

        let descriptor = descriptor_remote();
        let board = descriptor.create_board().unwrap();
        assert_eq!(board.board_type(), BoardType::Remote);
    }

    fn descriptor_remote() -> BoardDescriptor {
        descriptor(0x1234, 0x5678, "Custom", 3)
    }

    #[test]
    fn test_descriptor_is_lazy() {
        let opened = Arc::new(AtomicUsize::new(0));
        let count = opened.clone();
        let descriptor = BoardDescriptor::new(
            BoardInfo {
                vid: 0x1234,
                pid: 1,
                name: "Lazy".to_string(),
            },
            BoardType::Remote,
            "mock:lazy".to_string(),
            move || {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(fake_bridge(0x1234, 1, "Lazy", 4))
            },
        );
        assert_eq!(opened.load(Ordering::SeqCst), 0);
        descriptor.uuid().unwrap();
        descriptor.uuid().unwrap();
        assert_eq!(opened.load(Ordering::SeqCst), 1);

        // boards reuse the bridge the UUID query created
        let board = descriptor.create_board().unwrap();
        assert!(Arc::ptr_eq(board.bridge(), &descriptor.bridge().unwrap()));
        assert_eq!(board.get_uuid_string().unwrap(), descriptor.uuid().unwrap().to_string());
        drop(board);
        let board = descriptor.create_board().unwrap();
        assert_eq!(board.get_version_string().unwrap(), "1.2.3.4");
        drop(board);
        assert_eq!(opened.load(Ordering::SeqCst), 1);

        let bridge = fake_bridge(0x1234, 1, "Lazy", 4);
        let board = Board::from_bridge(bridge, &Catalog::default()).unwrap();
        assert_eq!(board.name(), "Lazy");
    }
}
