// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! RadarBridge Library
//!
//! Host side transport bridge for Infineon radar evaluation boards.  A
//! bridge carries vendor control requests to a board and streams radar
//! frames back from it, over Ethernet (UDP or TCP) or a USB serial port.
//!
//! # Features
//!
//! - **Control Channel** - Vendor write, read and transfer requests
//! - **Data Channel** - Packet reassembly into pooled frame buffers
//! - **Frame Delivery** - Bounded frame queue, polled or forwarded to a
//!   listener thread
//! - **Enumeration** - Broadcast and serial port discovery of known boards
//!
//! The `bridgectl` binary wraps the library for the command line.

/// Board catalog, descriptors and open boards
pub mod board;

/// Bridge trait and the data channel state shared by all bridges
pub mod bridge;

/// Platform helpers: socket buffers, broadcast addresses, scheduling
pub mod common;

/// Vendor command interface and the dedicated control channel
pub mod control;

mod data;

/// Board discovery over the network and serial ports
pub mod enumerate;

/// Crate wide error type
pub mod error;

/// Bridge over separate Ethernet control and data links
pub mod ethernet;

/// Listener thread that drains the frame queue
pub mod forwarder;

/// Frame buffers and the frames handed to applications
pub mod frame;

/// Board info, firmware version and UUID records
pub mod identity;

/// Byte transports: UDP, TCP and serial
pub mod link;

/// Interface selection and board opening
pub mod manager;

/// Fixed set of reusable frame buffers
pub mod pool;

/// Wire format of control and data packets
pub mod protocol;

/// Bounded frame queue between receiver and consumer
pub mod queue;

/// Bridge over a single serial port
pub mod serial;
