// Copyright (C) 2026, imu-trackers contributors
// This file is part of imu-trackers
// Licensed under the MIT license. See LICENSE file in the project root for details.
#![warn(missing_docs)]
//! Host-side driver for a fleet of IMU motion capture trackers sharing one
//! serial bus. It speaks the trackers' framed command protocol (ping, rotation
//! reads, offset capture, axis and id assignment, firmware upload), coordinates
//! any number of devices behind a single port, and runs the calibration and
//! tracking workflow that turns raw sensor quaternions into avatar-frame bone
//! rotations. It only uses [`serialport`] for communication.
//!
//! Example usage (one tracking session):
//! ```ignore
//! let mut fleet = TrackerFleet::open("/dev/ttyUSB0", FleetConfig::default())?;
//! let neck = SharedRotation::new();
//! fleet.add_tracker(1, Box::new(neck.clone()))?;
//!
//! let mut session = Session::new(fleet);
//! session.launch(&firmware_image)?;
//! while session.phase() == SessionPhase::Calibrating {
//!     session.tick()?; // poll compass calibration
//! }
//! session.trigger_offset()?;
//! // tick once per second for the visible 3-2-1 countdown, then per frame
//! loop {
//!     session.tick()?;
//!     apply_to_bone(neck.get());
//! }
//! ```
//!
//! Trackers with no assigned bus identity are set up with the [`provision`]
//! module; [`mock::MockBus`] stands in for the hardware in tests and demos.

use std::{
    fmt, io,
    sync::{Arc, Mutex},
};

use nalgebra::Quaternion;

pub mod fleet;
pub mod framing;
pub mod link;
pub mod mock;
pub mod offsets;
pub mod poller;
pub mod protocol;
pub mod provision;
pub mod session;
pub mod tracker;

pub use fleet::{FleetConfig, SharedFleet, TrackerFleet, TrackerId};
pub use link::{open_link, Link};
pub use poller::RotationPoller;
pub use session::{Session, SessionPhase};

/// Possible errors resulting from `imu-trackers` API calls
#[derive(Debug)]
pub enum Error {
    /// A read on the shared link expired before the expected reply arrived.
    /// Transient by nature; rotation reads retry it a bounded number of times,
    /// everything else surfaces it to the caller.
    LinkTimeout,
    /// Reply bytes arrived but violated the command/acknowledge contract.
    /// Indicates a firmware/protocol mismatch and is never retried.
    Protocol(&'static str),
    /// No device acknowledged the ping at this address while adding a tracker.
    /// Non-fatal to the fleet; the tracker is simply not added.
    DeviceNotFound(u8),
    /// A session operation was invoked outside the phase that permits it.
    InvalidState {
        /// The operation that was rejected.
        operation: &'static str,
        /// The phase the session was in at the time.
        phase: SessionPhase,
    },
    /// A serial port error happened. See [`serialport::Error`] for specifics
    Serial(serialport::Error),
    /// A non-timeout I/O error happened on the link
    Io(io::Error),
    /// Other fatal error, usually a problem with the library itself, or
    /// a device support issue. File a bug if you encounter this.
    Other(&'static str),
}

/// Alias for results of this crate's fallible operations
pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::LinkTimeout => write!(f, "link read timed out"),
            Error::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Error::DeviceNotFound(address) => {
                write!(f, "no tracker responded at address {address}")
            }
            Error::InvalidState { operation, phase } => {
                write!(f, "{operation} is not valid while the session is {phase}")
            }
            Error::Serial(e) => write!(f, "serial port error: {e}"),
            Error::Io(e) => write!(f, "link i/o error: {e}"),
            Error::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Serial(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::TimedOut {
            Error::LinkTimeout
        } else {
            Error::Io(e)
        }
    }
}

impl From<serialport::Error> for Error {
    fn from(e: serialport::Error) -> Self {
        Error::Serial(e)
    }
}

impl From<&'static str> for Error {
    fn from(e: &'static str) -> Self {
        Error::Other(e)
    }
}

/// Output binding of one tracker: the avatar-side slot its rotation lands in.
///
/// The driver only ever assigns into the sink, with one exception: at
/// avatar-offset capture time it reads the slot's current rotation once, as the
/// bone's rest pose. Implementations must be cheap on [`set_rotation`], since it
/// runs for every tracker on every committed frame.
///
/// [`set_rotation`]: RotationSink::set_rotation
pub trait RotationSink: Send {
    /// Current rotation of the bound slot. Read exactly once per session, by
    /// [`TrackerFleet::set_avatar_offsets`].
    fn rotation(&self) -> Quaternion<f32>;

    /// Assigns a new rotation to the bound slot.
    fn set_rotation(&mut self, rotation: Quaternion<f32>);
}

/// Shared rotation slot, the ready-made [`RotationSink`] for threaded consumers.
///
/// The consumer keeps a clone and reads it every frame with [`SharedRotation::get`];
/// the driver overwrites it on every commit. Starts out as the identity rotation.
#[derive(Clone)]
pub struct SharedRotation(Arc<Mutex<Quaternion<f32>>>);

impl SharedRotation {
    /// Creates a slot holding the identity rotation.
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(Quaternion::identity())))
    }

    /// Returns the most recently committed rotation.
    pub fn get(&self) -> Quaternion<f32> {
        match self.0.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

impl Default for SharedRotation {
    fn default() -> Self {
        Self::new()
    }
}

impl RotationSink for SharedRotation {
    fn rotation(&self) -> Quaternion<f32> {
        self.get()
    }

    fn set_rotation(&mut self, rotation: Quaternion<f32>) {
        match self.0.lock() {
            Ok(mut guard) => *guard = rotation,
            Err(poisoned) => *poisoned.into_inner() = rotation,
        }
    }
}
