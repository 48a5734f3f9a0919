// Copyright (C) 2026, imu-trackers contributors
// This file is part of imu-trackers
// Licensed under the MIT license. See LICENSE file in the project root for details.

//! Per-device command exchanges on the tracker bus. See [`TrackerClient`]
//!
//! Every request is `[header, address, command, payload...]` with everything
//! after the header escaped (see [`crate::framing`]). The bus is half duplex:
//! replies carry the host address and are matched to requests purely by
//! sequencing, so one exchange runs at a time.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, info};
use nalgebra::Quaternion;

use crate::{
    framing::{decode_escaped, encode_escaped, read_byte, synchronize, PACKET_HEADER},
    link::Link,
    Error, Result,
};

/// Reply source address: packets from a device to the host carry address zero.
pub const HOST_ADDRESS: u8 = 0;

/// Highest assignable device address.
pub const MAX_DEVICE_ADDRESS: u8 = 0xFD;

/// All-call address embedded in firmware upload streams. Devices that have not
/// yet received their sensor firmware consume a stream addressed to it in
/// lockstep; it is never assigned to a single device.
pub const UPLOAD_BROADCAST_ADDRESS: u8 = 0xFE;

/// Compass accuracy level at which a tracker counts as calibrated.
pub const ACCURACY_CALIBRATED: u8 = 3;

/// Handshake bytes the power-on bootloader waits for before a bare-line
/// reflash. Only relevant right after [`TrackerClient::flash`] or a power
/// cycle; the in-application path is [`TrackerClient::program_firmware`].
pub const BOOTLOADER_MAGIC: [u8; 2] = [0x46, 0x93];

/// Flash page granularity of the paged programming protocol.
pub const FLASH_PAGE_SIZE: usize = 64;

/// Default bound on rotation read attempts. See
/// [`TrackerClient::rotation_attempts`]
pub const DEFAULT_ROTATION_ATTEMPTS: usize = 5;

const QUATERNION_WIRE_LEN: usize = 16;
const MAX_FLASH_PAGES: usize = 255;
const PAGE_WRITE_ATTEMPTS: usize = 3;

/// Wire command set of the tracker protocol. The discriminants are the raw
/// command bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Presence check, answered with an acknowledge frame.
    Ping = 0,
    /// Device acknowledge; its 1-byte payload is 1 on success.
    ReplyAck = 1,
    /// Request the current orientation quaternion.
    ReadQuaternion = 2,
    /// Orientation reply carrying 16 payload bytes (4 little-endian floats).
    ReplyQuaternion = 3,
    /// Capture the device's own current reading as its chip-frame baseline.
    SetChipOffset = 4,
    /// Store the avatar-frame rest pose, 4 Q30 values as payload.
    SetAvatarOffset = 5,
    /// Store the axis remap byte (see [`AxisMap`]) in retained memory.
    SetAxis = 6,
    /// Permanently reassign the device address.
    SetId = 7,
    /// Reboot into the bootloader for a bare-line reflash.
    Flash = 8,
    /// Start the in-application paged reflash; payload is the page count.
    Program = 9,
    /// Request the compass calibration accuracy level.
    ReadCompassAccuracy = 10,
    /// Accuracy reply carrying the level as its 1-byte payload.
    ReplyCompassAccuracy = 11,
}

impl Command {
    /// Decodes a raw command byte.
    pub fn from_byte(byte: u8) -> Option<Command> {
        Some(match byte {
            0 => Command::Ping,
            1 => Command::ReplyAck,
            2 => Command::ReadQuaternion,
            3 => Command::ReplyQuaternion,
            4 => Command::SetChipOffset,
            5 => Command::SetAvatarOffset,
            6 => Command::SetAxis,
            7 => Command::SetId,
            8 => Command::Flash,
            9 => Command::Program,
            10 => Command::ReadCompassAccuracy,
            11 => Command::ReplyCompassAccuracy,
            _ => return None,
        })
    }
}

/// Encodes a real number as Q30 fixed point, the format of offset payloads.
///
/// Computed in `f64`, so the result is exactly `round(value * 2^30)` for every
/// `f32` input.
pub fn q30_encode(value: f32) -> i32 {
    (f64::from(value) * (1i64 << 30) as f64).round() as i32
}

/// Decodes a Q30 fixed point value back into a real number.
pub fn q30_decode(raw: i32) -> f32 {
    (f64::from(raw) / (1i64 << 30) as f64) as f32
}

/// Axis remap a tracker applies to its raw readings, stored in the device's
/// retained memory by [`TrackerClient::set_axis`].
///
/// Wire layout of the single payload byte: bit 0 negates X, bits 1-2 pick the
/// source axis X reads from, bit 3 negates Y, bits 4-5 pick Y's source, bit 6
/// negates Z. Z's source is implied: the axis left over once X's and Y's are
/// taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisMap {
    x_source: u8,
    y_source: u8,
    negate_x: bool,
    negate_y: bool,
    negate_z: bool,
}

impl AxisMap {
    /// Straight-through mapping: every axis reads itself, nothing negated.
    pub const IDENTITY: AxisMap = AxisMap {
        x_source: 0,
        y_source: 1,
        negate_x: false,
        negate_y: false,
        negate_z: false,
    };

    /// Creates a mapping with X and Y reading from the given source axes
    /// (0 = X, 1 = Y, 2 = Z) and the given negations; Z reads from the
    /// remaining axis. The two sources must be distinct and in range.
    pub fn new(
        x_source: u8,
        negate_x: bool,
        y_source: u8,
        negate_y: bool,
        negate_z: bool,
    ) -> Result<AxisMap> {
        if x_source > 2 || y_source > 2 || x_source == y_source {
            return Err(Error::Other("axis sources must be two distinct axes"));
        }
        Ok(AxisMap {
            x_source,
            y_source,
            negate_x,
            negate_y,
            negate_z,
        })
    }

    /// The implied source axis of Z.
    pub fn z_source(&self) -> u8 {
        3 - self.x_source - self.y_source
    }

    /// Packs the mapping into its wire byte.
    pub fn encode(&self) -> u8 {
        u8::from(self.negate_x)
            | self.x_source << 1
            | u8::from(self.negate_y) << 3
            | self.y_source << 4
            | u8::from(self.negate_z) << 6
    }
}

/// Request/reply client bound to one device address.
///
/// Borrows the link for the duration of its exchanges, which structurally rules
/// out interleaving: whoever holds the client holds the bus. Operations fail
/// with [`Error::LinkTimeout`] when the device stays silent and
/// [`Error::Protocol`] when a reply arrives but violates the contract.
pub struct TrackerClient<'a, L: Link> {
    link: &'a mut L,
    address: u8,
    rotation_attempts: usize,
}

impl<'a, L: Link> TrackerClient<'a, L> {
    /// Creates a client speaking to the device at `address`.
    pub fn new(link: &'a mut L, address: u8) -> Self {
        Self {
            link,
            address,
            rotation_attempts: DEFAULT_ROTATION_ATTEMPTS,
        }
    }

    /// Overrides how many times [`read_quaternion`](Self::read_quaternion)
    /// tries the whole exchange before surfacing a timeout. Clamped to at
    /// least one.
    pub fn rotation_attempts(mut self, attempts: usize) -> Self {
        self.rotation_attempts = attempts.max(1);
        self
    }

    /// The device address this client is bound to.
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Confirms the device is present and answering.
    ///
    /// The acknowledge comes back as one fixed 4-byte frame (header, host
    /// address, [`Command::ReplyAck`], success flag), which is also how a
    /// freshly probed address distinguishes "present" from "silent".
    pub fn ping(&mut self) -> Result<()> {
        self.send_command(Command::Ping, &[])?;
        let mut reply = [0u8; 4];
        self.link.read_exact(&mut reply)?;
        if reply == [PACKET_HEADER, HOST_ADDRESS, Command::ReplyAck as u8, 1] {
            Ok(())
        } else {
            Err(Error::Protocol("malformed ping acknowledge"))
        }
    }

    /// Reads the device's current orientation.
    ///
    /// Timeouts retry the entire exchange from the request, up to the
    /// configured attempt bound; a malformed reply is surfaced immediately.
    pub fn read_quaternion(&mut self) -> Result<Quaternion<f32>> {
        let mut attempts = self.rotation_attempts;
        loop {
            match self.read_quaternion_once() {
                Ok(quaternion) => return Ok(quaternion),
                Err(Error::LinkTimeout) if attempts > 1 => {
                    attempts -= 1;
                    debug!("tracker {}: rotation read timed out, retrying", self.address);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn read_quaternion_once(&mut self) -> Result<Quaternion<f32>> {
        self.send_command(Command::ReadQuaternion, &[])?;
        synchronize(&mut *self.link)?;
        if read_byte(&mut *self.link)? != Command::ReplyQuaternion as u8 {
            return Err(Error::Protocol("unexpected reply to rotation read"));
        }
        let payload = decode_escaped(&mut *self.link, QUATERNION_WIRE_LEN)?;
        let mut reader = Cursor::new(payload);
        let w = reader.read_f32::<LittleEndian>()?;
        let x = reader.read_f32::<LittleEndian>()?;
        let y = reader.read_f32::<LittleEndian>()?;
        let z = reader.read_f32::<LittleEndian>()?;
        Ok(Quaternion::new(w, x, y, z))
    }

    /// Tells the device to capture its own current reading as the chip-frame
    /// baseline. No payload travels; the capture happens device-side.
    pub fn set_chip_offset(&mut self) -> Result<()> {
        self.send_command(Command::SetChipOffset, &[])?;
        self.read_acknowledge()
    }

    /// Stores the bone's avatar-frame rest pose on the device, encoded as four
    /// Q30 values (w, x, y, z).
    pub fn set_avatar_offset(&mut self, offset: &Quaternion<f32>) -> Result<()> {
        let mut payload = Vec::with_capacity(QUATERNION_WIRE_LEN);
        for component in [offset.w, offset.i, offset.j, offset.k] {
            payload.write_i32::<LittleEndian>(q30_encode(component))?;
        }
        self.send_command(Command::SetAvatarOffset, &payload)?;
        self.read_acknowledge()
    }

    /// Stores an axis remap in the device's retained memory.
    pub fn set_axis(&mut self, axis: AxisMap) -> Result<()> {
        self.send_command(Command::SetAxis, &[axis.encode()])?;
        self.read_acknowledge()
    }

    /// Permanently reassigns the device to `new_id`. The reserved addresses
    /// (host, upload broadcast, header) are rejected before touching the wire.
    pub fn change_id(&mut self, new_id: u8) -> Result<()> {
        if new_id == HOST_ADDRESS || new_id > MAX_DEVICE_ADDRESS {
            return Err(Error::Other("reserved tracker address"));
        }
        self.send_command(Command::SetId, &[new_id])?;
        self.read_acknowledge()
    }

    /// Reboots the device into its bootloader.
    ///
    /// After the acknowledge the device drops off the bus and waits a couple
    /// of seconds for [`BOOTLOADER_MAGIC`] plus a page stream on the bare
    /// line, then falls back to the application image.
    pub fn flash(&mut self) -> Result<()> {
        self.send_command(Command::Flash, &[])?;
        self.read_acknowledge()
    }

    /// Reads the compass calibration accuracy level (calibrated at
    /// [`ACCURACY_CALIBRATED`] and above).
    pub fn read_compass_accuracy(&mut self) -> Result<u8> {
        self.send_command(Command::ReadCompassAccuracy, &[])?;
        synchronize(&mut *self.link)?;
        let mut reply = [0u8; 2];
        self.link.read_exact(&mut reply)?;
        if reply[0] != Command::ReplyCompassAccuracy as u8 {
            return Err(Error::Protocol("unexpected reply to accuracy read"));
        }
        Ok(reply[1])
    }

    /// Reflashes the device's application image in place, page by page.
    ///
    /// The device answers the page count with a raw ready byte, then echoes
    /// every 64-byte page for verification before burning it; a corrupted echo
    /// is answered with a resend request. The final page is padded with `0xFF`
    /// (the erased-flash value). After the last page the device halts and must
    /// be power cycled.
    pub fn program_firmware(&mut self, image: &[u8]) -> Result<()> {
        let pages = image.len().div_ceil(FLASH_PAGE_SIZE);
        if pages == 0 {
            return Err(Error::Other("empty firmware image"));
        }
        if pages > MAX_FLASH_PAGES {
            return Err(Error::Other("firmware image exceeds 255 flash pages"));
        }
        self.send_command(Command::Program, &[pages as u8])?;
        if read_byte(&mut *self.link)? != 1 {
            return Err(Error::Protocol("device not ready for programming"));
        }
        let mut page = [0xFFu8; FLASH_PAGE_SIZE];
        for (index, chunk) in image.chunks(FLASH_PAGE_SIZE).enumerate() {
            page.fill(0xFF);
            page[..chunk.len()].copy_from_slice(chunk);
            self.program_page(index, &page)?;
        }
        info!("tracker {}: programmed {pages} flash pages", self.address);
        Ok(())
    }

    fn program_page(&mut self, index: usize, page: &[u8; FLASH_PAGE_SIZE]) -> Result<()> {
        for _ in 0..PAGE_WRITE_ATTEMPTS {
            self.link.write_all(&encode_escaped(page))?;
            let echo = decode_escaped(&mut *self.link, FLASH_PAGE_SIZE)?;
            if echo[..] == page[..] {
                self.link.write_all(&[1])?;
                if read_byte(&mut *self.link)? != 1 {
                    return Err(Error::Protocol("page was not confirmed flashed"));
                }
                return Ok(());
            }
            debug!("tracker {}: page {index} echo mismatch, resending", self.address);
            self.link.write_all(&[0])?;
        }
        Err(Error::Protocol("page verification kept failing"))
    }

    fn send_command(&mut self, command: Command, payload: &[u8]) -> Result<()> {
        let mut packet = Vec::with_capacity(payload.len() + 2);
        packet.push(self.address);
        packet.push(command as u8);
        packet.extend_from_slice(payload);
        let mut frame = vec![PACKET_HEADER];
        frame.extend(encode_escaped(&packet));
        self.link.write_all(&frame)?;
        Ok(())
    }

    fn read_acknowledge(&mut self) -> Result<()> {
        synchronize(&mut *self.link)?;
        let mut reply = [0u8; 2];
        self.link.read_exact(&mut reply)?;
        if reply == [Command::ReplyAck as u8, 1] {
            Ok(())
        } else {
            Err(Error::Protocol("not acknowledged"))
        }
    }
}

/// Streams a raw firmware image to every listening device at once.
///
/// The image is written unescaped: upload streams carry their own embedded
/// framing, addressed to [`UPLOAD_BROADCAST_ADDRESS`], which all powered
/// devices consume in lockstep. There is no reply; devices come up on the bus
/// once the stream ends.
pub fn upload_firmware(link: &mut impl Link, image: &[u8]) -> Result<()> {
    link.write_all(image)?;
    link.flush()?;
    Ok(())
}
