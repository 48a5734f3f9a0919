// Copyright (C) 2026, imu-trackers contributors
// This file is part of imu-trackers
// Licensed under the MIT license. See LICENSE file in the project root for details.

//! The physical transport: one shared half-duplex serial line.

use std::{io, time::Duration};

use serialport::SerialPort;

use crate::Result;

/// Bus baud rate of the tracker hardware.
pub const BAUD_RATE: u32 = 460_800;

/// Read timeout while a session is tracking. Long enough for a device to turn
/// a request around, short enough that a dead device does not stall the sweep.
pub const TRACKING_TIMEOUT: Duration = Duration::from_millis(100);

/// Read timeout while sweeping addresses during provisioning, where silence is
/// the common case and the sweep covers the whole address space.
pub const PROVISIONING_TIMEOUT: Duration = Duration::from_millis(50);

/// Byte transport the driver runs on: blocking reads and writes with an
/// adjustable read timeout. Both real serial ports and [`crate::mock::MockBus`]
/// fit behind it.
pub trait Link: io::Read + io::Write + Send {
    /// Changes how long reads block before giving up with
    /// [`io::ErrorKind::TimedOut`].
    fn set_read_timeout(&mut self, timeout: Duration) -> Result<()>;
}

impl Link for Box<dyn SerialPort> {
    fn set_read_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.set_timeout(timeout)?;
        Ok(())
    }
}

/// Opens the serial port the tracker bus hangs off and drops any stale bytes
/// from its buffers.
pub fn open_link(path: &str, timeout: Duration) -> Result<Box<dyn SerialPort>> {
    let port = serialport::new(path, BAUD_RATE)
        .data_bits(serialport::DataBits::Eight)
        .stop_bits(serialport::StopBits::One)
        .parity(serialport::Parity::None)
        .timeout(timeout)
        .open()?;
    port.clear(serialport::ClearBuffer::All)?;
    Ok(port)
}
