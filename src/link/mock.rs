// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Scripted link used by the unit tests.  Inbound traffic is queued up
//! front or produced by a responder reacting to every send.

use super::{Link, LinkMode};
use crate::error::Error;
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

#[derive(Default)]
struct MockState {
    packets: VecDeque<Vec<u8>>,
    bytes: VecDeque<u8>,
    sent: Vec<Vec<u8>>,
    responder: Option<Responder>,
    chunk: Option<usize>,
    eof: bool,
    receives: usize,
}

/// Shared view on a [`MockLink`] that stays usable after the link moved
/// into a bridge or thread.
#[derive(Clone)]
pub struct MockHandle {
    mode: LinkMode,
    state: Arc<Mutex<MockState>>,
}

impl MockHandle {
    pub fn push_packet(&self, packet: &[u8]) {
        let mut state = self.state.lock().unwrap();
        match self.mode {
            LinkMode::Datagram => state.packets.push_back(packet.to_vec()),
            LinkMode::Stream => state.bytes.extend(packet.iter().copied()),
        }
    }

    pub fn push_bytes(&self, bytes: &[u8]) {
        self.state.lock().unwrap().bytes.extend(bytes.iter().copied());
    }

    /// Limits every stream receive to `chunk` bytes.
    pub fn set_chunk(&self, chunk: usize) {
        self.state.lock().unwrap().chunk = Some(chunk);
    }

    /// Once the inbound data is used up, receives report a closed peer.
    pub fn set_eof(&self) {
        self.state.lock().unwrap().eof = true;
    }

    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
    {
        self.state.lock().unwrap().responder = Some(Box::new(responder));
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn pending(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.packets.len() + state.bytes.len()
    }

    pub fn receives(&self) -> usize {
        self.state.lock().unwrap().receives
    }
}

pub struct MockLink {
    handle: MockHandle,
    max_payload: usize,
    open: bool,
}

impl MockLink {
    pub fn datagram() -> MockLink {
        MockLink::new(LinkMode::Datagram, super::ETH_UDP_MAX_PAYLOAD)
    }

    pub fn stream() -> MockLink {
        MockLink::new(LinkMode::Stream, super::ETH_TCP_MAX_PAYLOAD)
    }

    pub fn new(mode: LinkMode, max_payload: usize) -> MockLink {
        MockLink {
            handle: MockHandle {
                mode,
                state: Arc::new(Mutex::new(MockState::default())),
            },
            max_payload,
            open: true,
        }
    }

    pub fn handle(&self) -> MockHandle {
        self.handle.clone()
    }
}

impl Link for MockLink {
    fn mode(&self) -> LinkMode {
        self.handle.mode
    }

    fn max_payload(&self) -> usize {
        self.max_payload
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn send(&mut self, buf: &[u8]) -> Result<(), Error> {
        if !self.open {
            return Err(Error::Connection("mock link closed".to_string()));
        }
        let mut state = self.handle.state.lock().unwrap();
        state.sent.push(buf.to_vec());
        if let Some(mut responder) = state.responder.take() {
            for reply in responder(buf) {
                match self.handle.mode {
                    LinkMode::Datagram => state.packets.push_back(reply),
                    LinkMode::Stream => state.bytes.extend(reply),
                }
            }
            state.responder = Some(responder);
        }
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let mut state = self.handle.state.lock().unwrap();
        state.receives += 1;
        match self.handle.mode {
            LinkMode::Datagram => match state.packets.pop_front() {
                Some(packet) => {
                    let len = packet.len().min(buf.len());
                    buf[..len].copy_from_slice(&packet[..len]);
                    Ok(len)
                }
                None => Ok(0),
            },
            LinkMode::Stream => {
                if state.bytes.is_empty() && state.eof {
                    return Err(Error::Connection("connection closed by peer".to_string()));
                }
                let limit = state.chunk.unwrap_or(usize::MAX);
                let len = buf.len().min(state.bytes.len()).min(limit);
                for (dst, src) in buf.iter_mut().zip(state.bytes.drain(..len)) {
                    *dst = src;
                }
                Ok(len)
            }
        }
    }

    fn set_timeout(&mut self, _timeout: Duration) -> Result<(), Error> {
        Ok(())
    }

    fn set_input_buffer_size(&mut self, _size: usize) -> Result<(), Error> {
        Ok(())
    }

    fn check_input_buffer(&mut self) -> Result<bool, Error> {
        Ok(self.handle.pending() > 0)
    }
}
