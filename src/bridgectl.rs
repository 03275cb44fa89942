// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

mod args;

use args::{Args, Command};
use clap::Parser as _;
use log::{debug, info, warn};
use radarbridge::{
    board::{Board, BoardDescriptor, Catalog},
    error::Error,
    ethernet::{EthernetBridge, EthernetConfig},
    identity::{format_uuid, parse_uuid},
    manager::BoardManager,
};
use serde_json::json;
use std::{net::Ipv4Addr, sync::Arc, time::Instant};
use tracing_subscriber::{layer::SubscriberExt as _, Layer as _, Registry};
use tracy_client::frame_mark;

#[cfg(feature = "profiling")]
#[global_allocator]
static GLOBAL: tracy_client::ProfiledAllocator<std::alloc::System> =
    tracy_client::ProfiledAllocator::new(std::alloc::System, 100);

fn describe(index: usize, descriptor: &BoardDescriptor) -> serde_json::Value {
    json!({
        "index": index,
        "name": descriptor.name(),
        "type": descriptor.board_type().to_string(),
        "vid": format!("{:04x}", descriptor.vid()),
        "pid": format!("{:04x}", descriptor.pid()),
        "location": descriptor.location(),
    })
}

/// Opens the board named by `--board`, or the first free one.
fn open_board(args: &Args, manager: &mut BoardManager) -> Result<Board, Error> {
    let Some(board) = args.board.as_deref() else {
        manager.enumerate(1);
        return manager.create_board_instance();
    };

    if let Ok(address) = board.parse::<Ipv4Addr>() {
        debug!("connecting to {} directly", address);
        let bridge = EthernetBridge::connect(address, EthernetConfig::from(args))?;
        return Board::from_bridge(Arc::new(bridge), &Catalog::default());
    }
    if board.starts_with('/') {
        return manager.open_serial_port(board);
    }

    manager.enumerate(0);
    if let Ok(index) = board.parse::<usize>() {
        return manager.create_board_instance_at(index);
    }
    match parse_uuid(board) {
        Ok(_) => manager.create_board_instance_by_uuid(board),
        Err(_) => manager.create_board_instance_by_name(board),
    }
}

fn list(manager: &mut BoardManager, json: bool, max: usize) {
    manager.enumerate(max);
    let boards = manager.enumerated_list();
    if json {
        let boards: Vec<_> = boards
            .iter()
            .enumerate()
            .map(|(index, descriptor)| describe(index, descriptor))
            .collect();
        println!("{}", json!(boards));
        return;
    }
    for (index, descriptor) in boards.iter().enumerate() {
        println!(
            "{}: {} ({}) {:04x}:{:04x} at {}",
            index,
            descriptor.name(),
            descriptor.board_type(),
            descriptor.vid(),
            descriptor.pid(),
            descriptor.location()
        );
    }
}

fn print_info(board: &Board, json: bool) -> Result<(), Error> {
    let version = board.get_version_info()?;
    let uuid = board.get_uuid().map(|uuid| format_uuid(&uuid)).ok();
    let extended = board.get_extended_version_string().ok();

    if json {
        println!(
            "{}",
            json!({
                "name": board.name(),
                "type": board.board_type().to_string(),
                "vid": format!("{:04x}", board.vid()),
                "pid": format!("{:04x}", board.pid()),
                "version": version.to_string(),
                "protocol": format!("{}.{}", version.protocol_major, version.protocol_minor),
                "uuid": uuid,
                "extended_version": extended,
            })
        );
        return Ok(());
    }

    println!("Board: {} ({})", board.name(), board.board_type());
    println!("VID/PID: {:04x}:{:04x}", board.vid(), board.pid());
    println!(
        "Version: {} protocol {}.{}",
        version, version.protocol_major, version.protocol_minor
    );
    if let Some(uuid) = uuid {
        println!("UUID: {}", uuid);
    }
    if let Some(extended) = extended {
        println!("Extended version: {}", extended);
    }
    Ok(())
}

fn stream(
    board: &Board,
    frame_size: usize,
    queue_size: usize,
    frames: usize,
    tracy: bool,
) -> Result<(), Error> {
    let bridge = board.bridge();
    bridge.data().set_frame_buffer_size(frame_size)?;
    bridge.data().set_frame_queue_size(queue_size)?;
    bridge.start_streaming()?;
    info!("streaming from {}", board.name());

    let start = Instant::now();
    let mut received = 0;
    while frames == 0 || received < frames {
        let Some(frame) = bridge.data().get_frame(None) else {
            warn!("no frame received within the frame timeout");
            break;
        };
        received += 1;
        tracy.then(frame_mark);

        match frame.data_error() {
            Some(error) => println!(
                "channel {:3} error {:#010x} {}",
                frame.virtual_channel(),
                error.code(),
                error
            ),
            None if frame.is_error() => println!(
                "channel {:3} board status {:#010x}",
                frame.virtual_channel(),
                frame.status_code()
            ),
            None => println!(
                "channel {:3} size {:6} timestamp {}",
                frame.virtual_channel(),
                frame.data().len(),
                frame.timestamp()
            ),
        }
    }

    bridge.stop_streaming();
    info!(
        "{} frames in {:.1} s",
        received,
        start.elapsed().as_secs_f64()
    );
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    args.tracy.then(tracy_client::Client::start);

    let stdout_log = tracing_subscriber::fmt::layer()
        .pretty()
        .with_filter(args.rust_log);

    let journald = match tracing_journald::layer() {
        Ok(journald) => Some(journald.with_filter(args.rust_log)),
        Err(_) => None,
    };

    let tracy = match args.tracy {
        true => Some(tracing_tracy::TracyLayer::default().with_filter(args.rust_log)),
        false => None,
    };

    let subscriber = Registry::default()
        .with(stdout_log)
        .with(journald)
        .with(tracy);
    tracing::subscriber::set_global_default(subscriber)?;
    tracing_log::LogTracer::init()?;

    let mut manager = BoardManager::with_config(&args.interfaces, EthernetConfig::from(&args))?;

    match &args.command {
        Command::List { json, max } => list(&mut manager, *json, *max),
        Command::Info { json } => {
            let board = open_board(&args, &mut manager)?;
            print_info(&board, *json)?;
        }
        Command::Read {
            request,
            value,
            index,
            length,
        } => {
            let board = open_board(&args, &mut manager)?;
            let mut buf = vec![0u8; *length];
            board.control().vendor_read(*request, *value, *index, &mut buf)?;
            println!("{:02x?}", buf);
        }
        Command::Write {
            request,
            value,
            index,
            payload,
        } => {
            let board = open_board(&args, &mut manager)?;
            board
                .control()
                .vendor_write(*request, *value, *index, payload)?;
            println!("ok");
        }
        Command::Stream {
            frame_size,
            queue_size,
            frames,
        } => {
            let board = open_board(&args, &mut manager)?;
            stream(&board, *frame_size, *queue_size, *frames, args.tracy)?;
        }
    }

    Ok(())
}
