// Copyright (C) 2026, imu-trackers contributors
// This file is part of imu-trackers
// Licensed under the MIT license. See LICENSE file in the project root for details.

//! Per-tracker session state: the sink binding, captured baselines, the most
//! recent reading and the calibration latch.

use log::{debug, info, warn};
use nalgebra::Quaternion;

use crate::{
    link::Link,
    offsets::{avatar_rotation, FrameOffsets},
    protocol::{TrackerClient, ACCURACY_CALIBRATED},
    Result, RotationSink,
};

/// One attached device: its bus address, the avatar-side sink it feeds, the
/// captured reference-frame baselines and the latest raw reading.
///
/// Trackers are created through [`crate::TrackerFleet::add_tracker`]; the
/// fleet drives all bus traffic and this type only keeps the state that
/// belongs to a single device.
pub struct Tracker {
    address: u8,
    sink: Box<dyn RotationSink>,
    offsets: FrameOffsets,
    latest: Quaternion<f32>,
    calibrated: bool,
}

impl Tracker {
    pub(crate) fn new(address: u8, sink: Box<dyn RotationSink>) -> Tracker {
        Tracker {
            address,
            sink,
            offsets: FrameOffsets::identity(),
            latest: Quaternion::identity(),
            calibrated: false,
        }
    }

    /// The bus address this tracker answers on.
    pub fn address(&self) -> u8 {
        self.address
    }

    /// The raw reading stored by the most recent rotation sweep.
    pub fn latest(&self) -> Quaternion<f32> {
        self.latest
    }

    /// The reference-frame baselines captured so far this session.
    pub fn offsets(&self) -> FrameOffsets {
        self.offsets
    }

    /// Whether the compass has reported itself calibrated this session.
    pub fn is_calibrated(&self) -> bool {
        self.calibrated
    }

    /// Reads the device's current orientation into [`latest`](Self::latest).
    pub(crate) fn poll_rotation<L: Link>(&mut self, link: &mut L, attempts: usize) -> Result<()> {
        self.latest = TrackerClient::new(link, self.address)
            .rotation_attempts(attempts)
            .read_quaternion()?;
        Ok(())
    }

    /// Polls compass accuracy once. The result latches: after the first
    /// calibrated reading this reports `true` forever without touching the
    /// link again. Link and protocol failures are logged and count as "not
    /// yet calibrated" so that a flaky device stalls the workflow instead of
    /// aborting it.
    pub(crate) fn poll_calibration<L: Link>(&mut self, link: &mut L) -> bool {
        if self.calibrated {
            return true;
        }
        match TrackerClient::new(link, self.address).read_compass_accuracy() {
            Ok(level) if level >= ACCURACY_CALIBRATED => {
                info!("tracker {}: compass calibrated", self.address);
                self.calibrated = true;
                true
            }
            Ok(level) => {
                debug!("tracker {}: compass accuracy {level}", self.address);
                false
            }
            Err(e) => {
                warn!("tracker {}: calibration poll failed: {e}", self.address);
                false
            }
        }
    }

    /// Current rotation of the bound sink, read as the bone's rest pose.
    pub(crate) fn sink_rotation(&self) -> Quaternion<f32> {
        self.sink.rotation()
    }

    pub(crate) fn store_avatar_offset(&mut self, rest_pose: Quaternion<f32>) {
        self.offsets.avatar = rest_pose;
    }

    /// Mirrors the baseline the device just captured: the reading from the
    /// most recent rotation sweep.
    pub(crate) fn store_chip_offset(&mut self) {
        self.offsets.chip = self.latest;
    }

    /// Composes the latest reading with the captured baselines and assigns the
    /// result into the sink.
    pub(crate) fn commit(&mut self, world_to_avatar: &Quaternion<f32>) {
        let rotation = avatar_rotation(world_to_avatar, &self.offsets, &self.latest);
        self.sink.set_rotation(rotation);
    }
}
