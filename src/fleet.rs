// Copyright (C) 2026, imu-trackers contributors
// This file is part of imu-trackers
// Licensed under the MIT license. See LICENSE file in the project root for details.

//! The fleet: every tracker behind one link, and the sweeps that fan commands
//! out across them.
//!
//! All sweeps walk the trackers in the order they were added and stop at the
//! first failure. Offsets in particular must land on every device or none for
//! a session to stay consistent, so there is no partial-completion recovery;
//! the error names the operation that broke and the caller decides whether to
//! retry the whole sweep.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use log::info;
use nalgebra::Quaternion;
use serialport::SerialPort;

use crate::{
    link::{open_link, Link, TRACKING_TIMEOUT},
    protocol::{self, TrackerClient, DEFAULT_ROTATION_ATTEMPTS, MAX_DEVICE_ADDRESS},
    tracker::Tracker,
    Error, Result, RotationSink,
};

/// A fleet behind a mutex, shared between a session and a background poller.
pub type SharedFleet<L> = Arc<Mutex<TrackerFleet<L>>>;

/// Handle to one tracker within its fleet, returned by
/// [`TrackerFleet::add_tracker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerId(usize);

/// Tuning knobs of a fleet. The defaults match the shipping hardware; most
/// callers only ever touch `world_to_avatar`.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    /// Read timeout applied to the link for every exchange.
    pub read_timeout: Duration,
    /// Fixed transform from the sensors' world frame into the avatar's frame,
    /// applied on every commit.
    pub world_to_avatar: Quaternion<f32>,
    /// Attempt bound for rotation reads, which retry on timeout.
    pub rotation_attempts: usize,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            read_timeout: TRACKING_TIMEOUT,
            world_to_avatar: Quaternion::identity(),
            rotation_attempts: DEFAULT_ROTATION_ATTEMPTS,
        }
    }
}

/// The main structure representing every tracker attached to one serial bus.
///
/// The fleet owns the link, so all bus traffic funnels through whoever holds
/// the fleet. Workflow ordering (launch, calibration, offset capture) is the
/// business of [`crate::Session`]; the fleet itself only provides the sweeps.
pub struct TrackerFleet<L: Link> {
    link: L,
    trackers: Vec<Tracker>,
    config: FleetConfig,
}

impl TrackerFleet<Box<dyn SerialPort>> {
    /// Opens the serial port at `path` and wraps it in an empty fleet.
    pub fn open(path: &str, config: FleetConfig) -> Result<Self> {
        let link = open_link(path, config.read_timeout)?;
        Self::with_link(link, config)
    }
}

impl<L: Link> TrackerFleet<L> {
    /// Wraps an already open link in an empty fleet and applies the configured
    /// read timeout to it.
    pub fn with_link(mut link: L, config: FleetConfig) -> Result<TrackerFleet<L>> {
        link.set_read_timeout(config.read_timeout)?;
        Ok(TrackerFleet {
            link,
            trackers: Vec::new(),
            config,
        })
    }

    /// The configuration this fleet was created with.
    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    /// All trackers added so far, in sweep order.
    pub fn trackers(&self) -> &[Tracker] {
        &self.trackers
    }

    /// Looks up a tracker by the id `add_tracker` handed out.
    pub fn tracker(&self, id: TrackerId) -> Option<&Tracker> {
        self.trackers.get(id.0)
    }

    /// Pings the device at `address` and binds it to `sink`.
    ///
    /// Fails with [`Error::DeviceNotFound`] when the address stays silent;
    /// the fleet is unchanged in that case and other devices are unaffected.
    pub fn add_tracker(
        &mut self,
        address: u8,
        sink: Box<dyn RotationSink>,
    ) -> Result<TrackerId> {
        if address == 0 || address > MAX_DEVICE_ADDRESS {
            return Err(Error::Other("reserved tracker address"));
        }
        if self.trackers.iter().any(|t| t.address() == address) {
            return Err(Error::Other("a tracker is already bound to this address"));
        }
        match TrackerClient::new(&mut self.link, address).ping() {
            Ok(()) => {}
            Err(Error::LinkTimeout) => return Err(Error::DeviceNotFound(address)),
            Err(e) => return Err(e),
        }
        info!("tracker {address} joined the fleet");
        self.trackers.push(Tracker::new(address, sink));
        Ok(TrackerId(self.trackers.len() - 1))
    }

    /// Broadcasts a sensor firmware image to every device on the bus at once,
    /// including ones never added to the fleet.
    pub fn upload_firmware(&mut self, image: &[u8]) -> Result<()> {
        protocol::upload_firmware(&mut self.link, image)?;
        info!("broadcast {} bytes of sensor firmware", image.len());
        Ok(())
    }

    /// Tells every tracker to capture its current reading as its chip-frame
    /// baseline, mirroring the captured value host-side from the latest sweep.
    pub fn set_chip_offsets(&mut self) -> Result<()> {
        for tracker in &mut self.trackers {
            TrackerClient::new(&mut self.link, tracker.address()).set_chip_offset()?;
            tracker.store_chip_offset();
        }
        Ok(())
    }

    /// Reads each sink's current rotation once, as the bone's rest pose, and
    /// stores it on the device and host-side.
    pub fn set_avatar_offsets(&mut self) -> Result<()> {
        for tracker in &mut self.trackers {
            let rest_pose = tracker.sink_rotation();
            TrackerClient::new(&mut self.link, tracker.address()).set_avatar_offset(&rest_pose)?;
            tracker.store_avatar_offset(rest_pose);
        }
        Ok(())
    }

    /// Reads every tracker's current orientation into its `latest` slot.
    pub fn prepare_rotations(&mut self) -> Result<()> {
        let attempts = self.config.rotation_attempts;
        for tracker in &mut self.trackers {
            tracker.poll_rotation(&mut self.link, attempts)?;
        }
        Ok(())
    }

    /// Composes every tracker's latest reading with its baselines and assigns
    /// the results into the sinks. Pure host-side work, so it cannot fail.
    pub fn commit_rotations(&mut self) {
        for tracker in &mut self.trackers {
            tracker.commit(&self.config.world_to_avatar);
        }
    }

    /// Polls calibration tracker by tracker, stopping at the first one still
    /// uncalibrated. Once a tracker has reported in, it is never polled again.
    pub fn check_calibrated(&mut self) -> bool {
        for tracker in &mut self.trackers {
            if !tracker.poll_calibration(&mut self.link) {
                return false;
            }
        }
        true
    }

    /// Moves the fleet behind a mutex for sharing with a background poller.
    pub fn into_shared(self) -> SharedFleet<L> {
        Arc::new(Mutex::new(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mock::{BusController, MockBus},
        protocol::Command,
        SharedRotation,
    };

    fn fleet_with_devices(addresses: &[u8]) -> (TrackerFleet<MockBus>, BusController) {
        let bus = MockBus::new();
        let controller = bus.controller();
        for &address in addresses {
            controller.add_tracker(address);
        }
        let fleet = TrackerFleet::with_link(bus, FleetConfig::default()).unwrap();
        (fleet, controller)
    }

    #[test]
    fn add_tracker_pings_the_device() {
        let (mut fleet, controller) = fleet_with_devices(&[1]);
        let id = fleet
            .add_tracker(1, Box::new(SharedRotation::new()))
            .unwrap();

        assert_eq!(controller.command_count(1, Command::Ping), 1);
        assert_eq!(fleet.tracker(id).map(|t| t.address()), Some(1));
    }

    #[test]
    fn add_tracker_reports_silent_addresses() {
        let (mut fleet, _controller) = fleet_with_devices(&[]);
        let result = fleet.add_tracker(7, Box::new(SharedRotation::new()));
        assert!(matches!(result, Err(Error::DeviceNotFound(7))));
        assert!(fleet.trackers().is_empty());
    }

    #[test]
    fn add_tracker_propagates_garbled_acknowledges() {
        let (mut fleet, controller) = fleet_with_devices(&[4]);
        controller.fail_acknowledge(4, true);
        let result = fleet.add_tracker(4, Box::new(SharedRotation::new()));
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[test]
    fn add_tracker_rejects_reserved_and_duplicate_addresses() {
        let (mut fleet, _controller) = fleet_with_devices(&[1]);
        for reserved in [0x00, 0xFE, 0xFF] {
            let result = fleet.add_tracker(reserved, Box::new(SharedRotation::new()));
            assert!(matches!(result, Err(Error::Other(_))));
        }

        fleet.add_tracker(1, Box::new(SharedRotation::new())).unwrap();
        let duplicate = fleet.add_tracker(1, Box::new(SharedRotation::new()));
        assert!(matches!(duplicate, Err(Error::Other(_))));
        assert_eq!(fleet.trackers().len(), 1);
    }

    #[test]
    fn chip_offsets_mirror_the_latest_reading() {
        let (mut fleet, controller) = fleet_with_devices(&[1]);
        let reading = Quaternion::new(0.5, 0.5, -0.5, 0.5);
        controller.set_rotation(1, reading);
        fleet.add_tracker(1, Box::new(SharedRotation::new())).unwrap();

        fleet.prepare_rotations().unwrap();
        fleet.set_chip_offsets().unwrap();

        assert_eq!(controller.command_count(1, Command::SetChipOffset), 1);
        assert_eq!(fleet.trackers()[0].offsets().chip, reading);
    }

    #[test]
    fn chip_offset_sweep_aborts_on_first_failure() {
        let (mut fleet, controller) = fleet_with_devices(&[1, 2]);
        controller.set_rotation(1, Quaternion::new(0.5, 0.5, 0.5, 0.5));
        fleet.add_tracker(1, Box::new(SharedRotation::new())).unwrap();
        fleet.add_tracker(2, Box::new(SharedRotation::new())).unwrap();
        fleet.prepare_rotations().unwrap();
        // Tracker 2 only starts failing once the fleet is assembled.
        controller.fail_acknowledge(2, true);

        let result = fleet.set_chip_offsets();

        assert!(matches!(result, Err(Error::Protocol(_))));
        // The sweep got through the first tracker before aborting.
        assert_eq!(
            fleet.trackers()[0].offsets().chip,
            Quaternion::new(0.5, 0.5, 0.5, 0.5)
        );
        assert_eq!(fleet.trackers()[1].offsets().chip, Quaternion::identity());
    }

    #[test]
    fn avatar_offsets_come_from_the_sinks() {
        let (mut fleet, controller) = fleet_with_devices(&[3]);
        let mut slot = SharedRotation::new();
        let rest_pose = Quaternion::new(0.5, -0.5, 0.5, -0.5);
        slot.set_rotation(rest_pose);
        fleet.add_tracker(3, Box::new(slot)).unwrap();

        fleet.set_avatar_offsets().unwrap();

        assert_eq!(controller.avatar_offset(3), Some(rest_pose));
        assert_eq!(fleet.trackers()[0].offsets().avatar, rest_pose);
    }

    #[test]
    fn prepare_and_commit_deliver_world_frame_rotations() {
        let bus = MockBus::new();
        let controller = bus.controller();
        controller.add_tracker(1);
        let reading = Quaternion::new(0.5, 0.5, 0.5, 0.5);
        controller.set_rotation(1, reading);

        let world = Quaternion::new(
            std::f32::consts::FRAC_1_SQRT_2,
            0.0,
            0.0,
            std::f32::consts::FRAC_1_SQRT_2,
        );
        let config = FleetConfig {
            world_to_avatar: world,
            ..FleetConfig::default()
        };
        let mut fleet = TrackerFleet::with_link(bus, config).unwrap();
        let slot = SharedRotation::new();
        fleet.add_tracker(1, Box::new(slot.clone())).unwrap();

        fleet.prepare_rotations().unwrap();
        fleet.commit_rotations();

        assert_eq!(slot.get(), world * reading);
    }

    #[test]
    fn calibration_checks_short_circuit_and_latch() {
        let (mut fleet, controller) = fleet_with_devices(&[1, 2]);
        controller.set_accuracy_sequence(1, &[0, 3]);
        controller.set_accuracy_sequence(2, &[3]);
        fleet.add_tracker(1, Box::new(SharedRotation::new())).unwrap();
        fleet.add_tracker(2, Box::new(SharedRotation::new())).unwrap();

        assert!(!fleet.check_calibrated());
        // The second tracker was never polled behind the uncalibrated first.
        assert_eq!(controller.command_count(2, Command::ReadCompassAccuracy), 0);

        assert!(fleet.check_calibrated());
        assert!(fleet.check_calibrated());
        // Latched trackers are not polled again.
        assert_eq!(controller.command_count(1, Command::ReadCompassAccuracy), 2);
        assert_eq!(controller.command_count(2, Command::ReadCompassAccuracy), 1);
    }

    #[test]
    fn upload_firmware_broadcasts_raw_bytes() {
        let (mut fleet, controller) = fleet_with_devices(&[]);
        fleet.upload_firmware(&[0x10, 0x20, 0x30]).unwrap();
        assert!(controller.written().ends_with(&[0x10, 0x20, 0x30]));
    }

    #[test]
    fn configured_timeout_lands_on_the_link() {
        let bus = MockBus::new();
        let controller = bus.controller();
        let config = FleetConfig {
            read_timeout: Duration::from_millis(20),
            ..FleetConfig::default()
        };
        TrackerFleet::with_link(bus, config).unwrap();
        assert_eq!(controller.read_timeout(), Duration::from_millis(20));
    }
}
