// Copyright (C) 2026, imu-trackers contributors
// This file is part of imu-trackers
// Licensed under the MIT license. See LICENSE file in the project root for details.

//! Simulated tracker bus for tests and demos.
//!
//! [`MockBus`] implements [`Link`] and behaves like the wire with a set of
//! devices hanging off it: host frames are parsed the way device firmware
//! parses them (header scan, unstuffing, fixed payload lengths, the paged
//! programming mode) and the replies a real device would produce are queued
//! for the next read. The cloneable [`BusController`] steers the simulation
//! from the outside while the driver under test owns the bus itself.
//!
//! Firmware upload broadcasts are recorded in the raw write log but not
//! interpreted. Controller setters panic when given an address that was never
//! added, so that a mis-scripted test fails loudly.

use std::{
    collections::{BTreeMap, VecDeque},
    io, mem,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use nalgebra::Quaternion;

use crate::{
    framing::{encode_escaped, PACKET_HEADER},
    link::Link,
    protocol::{q30_decode, Command, FLASH_PAGE_SIZE},
    Result,
};

/// One host command as the devices on the bus parsed it.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCommand {
    /// Destination device address.
    pub address: u8,
    /// Decoded command.
    pub command: Command,
    /// Unescaped payload bytes.
    pub payload: Vec<u8>,
}

/// The [`Link`] end of the simulated bus. Created with [`MockBus::new`] and
/// handed to the driver; the matching [`BusController`] keeps control of the
/// simulated devices.
pub struct MockBus {
    state: Arc<Mutex<BusState>>,
}

/// Remote control for a [`MockBus`]: adds and configures simulated trackers
/// and inspects what the host sent.
#[derive(Clone)]
pub struct BusController {
    state: Arc<Mutex<BusState>>,
}

struct SimTracker {
    rotation: Quaternion<f32>,
    accuracy: Vec<u8>,
    accuracy_index: usize,
    silent: bool,
    fail_ack: bool,
    drop_replies: usize,
    avatar_offset: Option<Quaternion<f32>>,
    flashed_pages: Vec<Vec<u8>>,
}

impl SimTracker {
    fn new() -> Self {
        Self {
            rotation: Quaternion::identity(),
            accuracy: vec![0],
            accuracy_index: 0,
            silent: false,
            fail_ack: false,
            drop_replies: 0,
            avatar_offset: None,
            flashed_pages: Vec::new(),
        }
    }

    fn next_accuracy(&mut self) -> u8 {
        let level = self.accuracy.get(self.accuracy_index).copied().unwrap_or(0);
        if self.accuracy_index + 1 < self.accuracy.len() {
            self.accuracy_index += 1;
        }
        level
    }
}

enum Parser {
    Sync,
    Address,
    Command {
        address: u8,
    },
    Payload {
        address: u8,
        command: Command,
        needed: usize,
        collected: Vec<u8>,
    },
    PageStream {
        address: u8,
        pages_left: usize,
        page: Vec<u8>,
    },
    PageConfirm {
        address: u8,
        pages_left: usize,
        page: Vec<u8>,
    },
}

struct BusState {
    devices: BTreeMap<u8, SimTracker>,
    reply_queue: VecDeque<u8>,
    parser: Parser,
    skip_stuffed: bool,
    written: Vec<u8>,
    commands: Vec<ParsedCommand>,
    read_timeout: Duration,
}

fn lock(state: &Mutex<BusState>) -> MutexGuard<'_, BusState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn request_payload_len(command: Command) -> usize {
    match command {
        Command::SetAvatarOffset => 16,
        Command::SetAxis | Command::SetId | Command::Program => 1,
        _ => 0,
    }
}

fn ack_body(ok: bool) -> Vec<u8> {
    vec![Command::ReplyAck as u8, u8::from(ok)]
}

fn decode_offset(payload: &[u8]) -> Quaternion<f32> {
    let mut parts = [0f32; 4];
    for (part, chunk) in parts.iter_mut().zip(payload.chunks_exact(4)) {
        let raw = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        *part = q30_decode(raw);
    }
    Quaternion::new(parts[0], parts[1], parts[2], parts[3])
}

impl BusState {
    fn new() -> Self {
        Self {
            devices: BTreeMap::new(),
            reply_queue: VecDeque::new(),
            parser: Parser::Sync,
            skip_stuffed: false,
            written: Vec::new(),
            commands: Vec::new(),
            read_timeout: Duration::from_millis(100),
        }
    }

    /// Frames a device reply: header, the zero a device inserts after it, then
    /// the escaped body.
    fn push_reply(&mut self, body: &[u8]) {
        self.reply_queue.push_back(PACKET_HEADER);
        self.reply_queue.push_back(0);
        self.reply_queue.extend(encode_escaped(body));
    }

    /// Runs one raw wire byte through the unstuffing filter every device
    /// applies before its command state machine.
    fn feed(&mut self, raw: u8) {
        if self.skip_stuffed {
            self.skip_stuffed = false;
            if raw == 0 {
                return;
            }
        }
        if raw == PACKET_HEADER {
            self.skip_stuffed = true;
        }
        self.step(raw);
    }

    fn step(&mut self, byte: u8) {
        let parser = mem::replace(&mut self.parser, Parser::Sync);
        self.parser = match parser {
            Parser::Sync => {
                if byte == PACKET_HEADER {
                    Parser::Address
                } else {
                    Parser::Sync
                }
            }
            Parser::Address => {
                if byte == PACKET_HEADER {
                    Parser::Address
                } else {
                    Parser::Command { address: byte }
                }
            }
            Parser::Command { address } => {
                if byte == PACKET_HEADER {
                    Parser::Address
                } else {
                    match Command::from_byte(byte) {
                        Some(command) if request_payload_len(command) > 0 => Parser::Payload {
                            address,
                            command,
                            needed: request_payload_len(command),
                            collected: Vec::new(),
                        },
                        Some(command) => self.dispatch(address, command, &[]),
                        None => Parser::Sync,
                    }
                }
            }
            Parser::Payload {
                address,
                command,
                needed,
                mut collected,
            } => {
                collected.push(byte);
                if collected.len() == needed {
                    self.dispatch(address, command, &collected)
                } else {
                    Parser::Payload {
                        address,
                        command,
                        needed,
                        collected,
                    }
                }
            }
            Parser::PageStream {
                address,
                pages_left,
                mut page,
            } => {
                page.push(byte);
                if page.len() == FLASH_PAGE_SIZE {
                    let echo = encode_escaped(&page);
                    self.reply_queue.extend(echo);
                    Parser::PageConfirm {
                        address,
                        pages_left,
                        page,
                    }
                } else {
                    Parser::PageStream {
                        address,
                        pages_left,
                        page,
                    }
                }
            }
            Parser::PageConfirm {
                address,
                pages_left,
                page,
            } => {
                if byte == 0 {
                    Parser::PageStream {
                        address,
                        pages_left,
                        page: Vec::with_capacity(FLASH_PAGE_SIZE),
                    }
                } else {
                    if let Some(device) = self.devices.get_mut(&address) {
                        device.flashed_pages.push(page);
                    }
                    self.reply_queue.push_back(1);
                    if pages_left <= 1 {
                        // The last page was burned; the device halts until a
                        // power cycle.
                        if let Some(device) = self.devices.get_mut(&address) {
                            device.silent = true;
                        }
                        Parser::Sync
                    } else {
                        Parser::PageStream {
                            address,
                            pages_left: pages_left - 1,
                            page: Vec::with_capacity(FLASH_PAGE_SIZE),
                        }
                    }
                }
            }
        };
    }

    fn dispatch(&mut self, address: u8, command: Command, payload: &[u8]) -> Parser {
        self.commands.push(ParsedCommand {
            address,
            command,
            payload: payload.to_vec(),
        });

        let Some(device) = self.devices.get_mut(&address) else {
            return Parser::Sync;
        };
        if device.silent {
            return Parser::Sync;
        }
        if device.drop_replies > 0 {
            device.drop_replies -= 1;
            return Parser::Sync;
        }

        let mut reply: Option<Vec<u8>> = None;
        let mut raw_reply: Option<u8> = None;
        let mut relocate: Option<u8> = None;
        let mut next = Parser::Sync;
        match command {
            Command::Ping | Command::SetChipOffset | Command::SetAxis => {
                reply = Some(ack_body(!device.fail_ack));
            }
            Command::SetAvatarOffset => {
                if !device.fail_ack {
                    device.avatar_offset = Some(decode_offset(payload));
                }
                reply = Some(ack_body(!device.fail_ack));
            }
            Command::SetId => {
                if !device.fail_ack {
                    relocate = Some(payload[0]);
                }
                reply = Some(ack_body(!device.fail_ack));
            }
            Command::Flash => {
                if !device.fail_ack {
                    // Rebooted into the bootloader, off the bus.
                    device.silent = true;
                }
                reply = Some(ack_body(!device.fail_ack));
            }
            Command::ReadQuaternion => {
                let rotation = device.rotation;
                let mut body = vec![Command::ReplyQuaternion as u8];
                for component in [rotation.w, rotation.i, rotation.j, rotation.k] {
                    body.extend_from_slice(&component.to_le_bytes());
                }
                reply = Some(body);
            }
            Command::ReadCompassAccuracy => {
                let level = device.next_accuracy();
                reply = Some(vec![Command::ReplyCompassAccuracy as u8, level]);
            }
            Command::Program => {
                let pages = payload[0] as usize;
                if pages > 0 {
                    raw_reply = Some(1);
                    next = Parser::PageStream {
                        address,
                        pages_left: pages,
                        page: Vec::with_capacity(FLASH_PAGE_SIZE),
                    };
                }
            }
            Command::ReplyAck | Command::ReplyQuaternion | Command::ReplyCompassAccuracy => {}
        }

        if let Some(body) = reply {
            self.push_reply(&body);
        }
        if let Some(byte) = raw_reply {
            self.reply_queue.push_back(byte);
        }
        if let Some(new_id) = relocate {
            if let Some(device) = self.devices.remove(&address) {
                self.devices.insert(new_id, device);
            }
        }
        next
    }
}

impl MockBus {
    /// Creates a bus with no devices on it.
    pub fn new() -> MockBus {
        MockBus {
            state: Arc::new(Mutex::new(BusState::new())),
        }
    }

    /// Returns the controller steering this bus.
    pub fn controller(&self) -> BusController {
        BusController {
            state: Arc::clone(&self.state),
        }
    }
}

impl Default for MockBus {
    fn default() -> Self {
        Self::new()
    }
}

impl io::Read for MockBus {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = lock(&self.state);
        if state.reply_queue.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "no reply pending on the simulated bus",
            ));
        }
        let mut filled = 0;
        while filled < buf.len() {
            match state.reply_queue.pop_front() {
                Some(byte) => {
                    buf[filled] = byte;
                    filled += 1;
                }
                None => break,
            }
        }
        Ok(filled)
    }
}

impl io::Write for MockBus {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = lock(&self.state);
        for &byte in buf {
            state.written.push(byte);
            state.feed(byte);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Link for MockBus {
    fn set_read_timeout(&mut self, timeout: Duration) -> Result<()> {
        lock(&self.state).read_timeout = timeout;
        Ok(())
    }
}

impl BusController {
    /// Puts a fresh simulated tracker on the bus at `address`.
    pub fn add_tracker(&self, address: u8) {
        lock(&self.state).devices.insert(address, SimTracker::new());
    }

    /// Takes the device at `address` off the bus entirely.
    pub fn remove_tracker(&self, address: u8) {
        lock(&self.state).devices.remove(&address);
    }

    /// Sets the orientation the device reports on rotation reads.
    pub fn set_rotation(&self, address: u8, rotation: Quaternion<f32>) {
        self.with_device(address, |device| device.rotation = rotation);
    }

    /// Scripts the accuracy levels returned by successive compass reads. The
    /// last level repeats forever.
    pub fn set_accuracy_sequence(&self, address: u8, levels: &[u8]) {
        self.with_device(address, |device| {
            device.accuracy = levels.to_vec();
            device.accuracy_index = 0;
        });
    }

    /// Makes the device consume commands without ever replying.
    pub fn set_silent(&self, address: u8, silent: bool) {
        self.with_device(address, |device| device.silent = silent);
    }

    /// Makes the device answer acknowledged commands with a failure ack.
    pub fn fail_acknowledge(&self, address: u8, fail: bool) {
        self.with_device(address, |device| device.fail_ack = fail);
    }

    /// Swallows the replies to the device's next `count` commands.
    pub fn drop_replies(&self, address: u8, count: usize) {
        self.with_device(address, |device| device.drop_replies = count);
    }

    /// The avatar offset most recently stored on the device, if any.
    pub fn avatar_offset(&self, address: u8) -> Option<Quaternion<f32>> {
        lock(&self.state)
            .devices
            .get(&address)
            .and_then(|device| device.avatar_offset)
    }

    /// The 64-byte pages the device has burned, in order.
    pub fn flashed_pages(&self, address: u8) -> Vec<Vec<u8>> {
        lock(&self.state)
            .devices
            .get(&address)
            .map(|device| device.flashed_pages.clone())
            .unwrap_or_default()
    }

    /// Addresses of all devices currently on the bus, in order.
    pub fn addresses(&self) -> Vec<u8> {
        lock(&self.state).devices.keys().copied().collect()
    }

    /// Every command any device parsed, oldest first.
    pub fn commands(&self) -> Vec<ParsedCommand> {
        lock(&self.state).commands.clone()
    }

    /// How many times `command` was addressed to `address`.
    pub fn command_count(&self, address: u8, command: Command) -> usize {
        lock(&self.state)
            .commands
            .iter()
            .filter(|parsed| parsed.address == address && parsed.command == command)
            .count()
    }

    /// The raw bytes the host has written, including upload broadcasts.
    pub fn written(&self) -> Vec<u8> {
        lock(&self.state).written.clone()
    }

    /// The read timeout the driver most recently configured.
    pub fn read_timeout(&self) -> Duration {
        lock(&self.state).read_timeout
    }

    fn with_device(&self, address: u8, configure: impl FnOnce(&mut SimTracker)) {
        let mut state = lock(&self.state);
        match state.devices.get_mut(&address) {
            Some(device) => configure(device),
            None => panic!("no simulated tracker at address {address}"),
        }
    }
}
