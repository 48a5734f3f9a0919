// Copyright (C) 2026, imu-trackers contributors
// This file is part of imu-trackers
// Licensed under the MIT license. See LICENSE file in the project root for details.

//! The tracking workflow state machine.
//!
//! A session walks its fleet through the fixed order the hardware expects:
//! launch (rest poses out, sensor firmware broadcast), compass calibration,
//! chip-offset capture behind a short human-visible countdown, then continuous
//! tracking. Offsets may be recaptured any number of times while running. The
//! session is tick-driven: the caller decides the cadence and calls
//! [`Session::tick`], typically once per second while counting down and once
//! per frame while running.

use std::{
    fmt,
    sync::{Arc, MutexGuard},
};

use log::{debug, info};

use crate::{
    fleet::{SharedFleet, TrackerFleet, TrackerId},
    link::Link,
    Error, Result, RotationSink,
};

/// Ticks between an offset trigger and the capture, giving the operator time
/// to strike the rest pose.
const OFFSET_COUNTDOWN_TICKS: u8 = 3;

/// Where a [`Session`] currently is in the tracking workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Trackers may still be added; nothing has touched the devices yet.
    WaitLaunching,
    /// Rest poses and firmware are out; compass calibration is being polled.
    Calibrating,
    /// Calibrated and idle, waiting for the first offset trigger.
    WaitOffsetting,
    /// An offset trigger armed the countdown; capture happens when it ends.
    OffsetCounting,
    /// Tracking: every tick commits fresh rotations into the sinks.
    Running,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionPhase::WaitLaunching => "waiting to launch",
            SessionPhase::Calibrating => "calibrating",
            SessionPhase::WaitOffsetting => "waiting for offset capture",
            SessionPhase::OffsetCounting => "counting down to offset capture",
            SessionPhase::Running => "running",
        };
        f.write_str(name)
    }
}

/// Drives one tracking session over a fleet.
///
/// Operations are only valid in the phase that permits them and fail with
/// [`Error::InvalidState`] anywhere else; nothing about the session is a
/// silent no-op.
pub struct Session<L: Link> {
    fleet: SharedFleet<L>,
    phase: SessionPhase,
    countdown: u8,
}

impl<L: Link> Session<L> {
    /// Wraps a fleet in a fresh session.
    pub fn new(fleet: TrackerFleet<L>) -> Session<L> {
        Self::with_shared(fleet.into_shared())
    }

    /// Builds a session over an already shared fleet, for callers that also
    /// hand the fleet to a [`crate::RotationPoller`].
    pub fn with_shared(fleet: SharedFleet<L>) -> Session<L> {
        Session {
            fleet,
            phase: SessionPhase::WaitLaunching,
            countdown: 0,
        }
    }

    /// Another handle to the fleet this session drives.
    pub fn fleet(&self) -> SharedFleet<L> {
        Arc::clone(&self.fleet)
    }

    /// The current workflow phase.
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Remaining countdown ticks; zero outside [`SessionPhase::OffsetCounting`].
    pub fn countdown(&self) -> u8 {
        self.countdown
    }

    /// Adds a tracker to the fleet. Only valid before launch.
    pub fn add_tracker(&mut self, address: u8, sink: Box<dyn RotationSink>) -> Result<TrackerId> {
        if self.phase != SessionPhase::WaitLaunching {
            return Err(self.invalid("add_tracker"));
        }
        self.fleet_mut()?.add_tracker(address, sink)
    }

    /// Launches the fleet: stores every bone's current rotation as its rest
    /// pose, then broadcasts the sensor firmware image to the whole bus.
    /// Advances to [`SessionPhase::Calibrating`].
    pub fn launch(&mut self, firmware: &[u8]) -> Result<()> {
        if self.phase != SessionPhase::WaitLaunching {
            return Err(self.invalid("launch"));
        }
        let mut fleet = self.fleet_mut()?;
        fleet.set_avatar_offsets()?;
        fleet.upload_firmware(firmware)?;
        drop(fleet);
        self.phase = SessionPhase::Calibrating;
        info!("trackers launched, waiting for compass calibration");
        Ok(())
    }

    /// Arms the offset countdown. Valid while waiting for the first capture
    /// and at any point while running, to re-capture baselines.
    pub fn trigger_offset(&mut self) -> Result<()> {
        match self.phase {
            SessionPhase::WaitOffsetting | SessionPhase::Running => {
                self.phase = SessionPhase::OffsetCounting;
                self.countdown = OFFSET_COUNTDOWN_TICKS;
                info!("offset capture armed, {OFFSET_COUNTDOWN_TICKS} ticks to go");
                Ok(())
            }
            _ => Err(self.invalid("trigger_offset")),
        }
    }

    /// Advances the workflow by one tick.
    ///
    /// While calibrating this polls compass accuracy; while counting down it
    /// burns one tick, capturing chip offsets (from a fresh rotation sweep)
    /// when the last tick elapses; while running it sweeps and commits
    /// rotations. A failed capture leaves the countdown at its last tick so
    /// the next tick retries it.
    pub fn tick(&mut self) -> Result<()> {
        match self.phase {
            SessionPhase::WaitLaunching => Err(self.invalid("tick")),
            SessionPhase::Calibrating => {
                if self.fleet_mut()?.check_calibrated() {
                    self.phase = SessionPhase::WaitOffsetting;
                    info!("all trackers calibrated");
                }
                Ok(())
            }
            SessionPhase::WaitOffsetting => Ok(()),
            SessionPhase::OffsetCounting => {
                if self.countdown > 1 {
                    self.countdown -= 1;
                    debug!("offset capture in {} ticks", self.countdown);
                    Ok(())
                } else {
                    let mut fleet = self.fleet_mut()?;
                    fleet.prepare_rotations()?;
                    fleet.set_chip_offsets()?;
                    drop(fleet);
                    self.countdown = 0;
                    self.phase = SessionPhase::Running;
                    info!("chip offsets captured, session running");
                    Ok(())
                }
            }
            SessionPhase::Running => {
                let mut fleet = self.fleet_mut()?;
                fleet.prepare_rotations()?;
                fleet.commit_rotations();
                Ok(())
            }
        }
    }

    fn invalid(&self, operation: &'static str) -> Error {
        Error::InvalidState {
            operation,
            phase: self.phase,
        }
    }

    fn fleet_mut(&self) -> Result<MutexGuard<'_, TrackerFleet<L>>> {
        self.fleet.lock().map_err(|_| Error::Other("fleet lock poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::Quaternion;

    use super::*;
    use crate::{
        fleet::FleetConfig,
        mock::{BusController, MockBus},
        protocol::Command,
        RotationSink, SharedRotation,
    };

    fn session_with_device(address: u8) -> (Session<MockBus>, BusController) {
        let bus = MockBus::new();
        let controller = bus.controller();
        controller.add_tracker(address);
        let fleet = TrackerFleet::with_link(bus, FleetConfig::default()).unwrap();
        (Session::new(fleet), controller)
    }

    #[test]
    fn walks_the_whole_workflow() {
        let (mut session, controller) = session_with_device(1);
        controller.set_accuracy_sequence(1, &[0, 3]);

        let mut slot = SharedRotation::new();
        let rest_pose = Quaternion::new(0.5, 0.5, -0.5, -0.5);
        slot.set_rotation(rest_pose);
        session.add_tracker(1, Box::new(slot.clone())).unwrap();

        session.launch(&[9, 9, 9]).unwrap();
        assert_eq!(session.phase(), SessionPhase::Calibrating);
        assert_eq!(controller.avatar_offset(1), Some(rest_pose));
        assert!(controller.written().ends_with(&[9, 9, 9]));

        session.tick().unwrap();
        assert_eq!(session.phase(), SessionPhase::Calibrating);
        session.tick().unwrap();
        assert_eq!(session.phase(), SessionPhase::WaitOffsetting);

        let capture_pose = Quaternion::new(0.5, -0.5, 0.5, -0.5);
        controller.set_rotation(1, capture_pose);
        session.trigger_offset().unwrap();
        assert_eq!(session.phase(), SessionPhase::OffsetCounting);
        assert_eq!(session.countdown(), 3);

        session.tick().unwrap();
        session.tick().unwrap();
        assert_eq!(session.countdown(), 1);
        assert_eq!(controller.command_count(1, Command::SetChipOffset), 0);

        session.tick().unwrap();
        assert_eq!(session.phase(), SessionPhase::Running);
        assert_eq!(controller.command_count(1, Command::SetChipOffset), 1);

        let live_pose = Quaternion::new(0.5, 0.5, 0.5, 0.5);
        controller.set_rotation(1, live_pose);
        session.tick().unwrap();
        let expected = capture_pose.conjugate() * live_pose * rest_pose;
        assert_eq!(slot.get(), expected);
    }

    #[test]
    fn rejects_out_of_phase_operations() {
        let (mut session, controller) = session_with_device(1);
        controller.set_accuracy_sequence(1, &[3]);

        let tick = session.tick();
        assert!(matches!(
            tick,
            Err(Error::InvalidState {
                operation: "tick",
                phase: SessionPhase::WaitLaunching,
            })
        ));
        assert!(matches!(
            session.trigger_offset(),
            Err(Error::InvalidState { .. })
        ));

        session.add_tracker(1, Box::new(SharedRotation::new())).unwrap();
        session.launch(&[]).unwrap();

        assert!(matches!(
            session.launch(&[]),
            Err(Error::InvalidState { operation: "launch", .. })
        ));
        assert!(matches!(
            session.add_tracker(2, Box::new(SharedRotation::new())),
            Err(Error::InvalidState { operation: "add_tracker", .. })
        ));
    }

    #[test]
    fn offsets_can_be_recaptured_while_running() {
        let (mut session, controller) = session_with_device(1);
        controller.set_accuracy_sequence(1, &[3]);
        session.add_tracker(1, Box::new(SharedRotation::new())).unwrap();
        session.launch(&[]).unwrap();
        session.tick().unwrap();
        session.trigger_offset().unwrap();
        for _ in 0..3 {
            session.tick().unwrap();
        }
        assert_eq!(session.phase(), SessionPhase::Running);

        session.trigger_offset().unwrap();
        assert_eq!(session.countdown(), 3);
        for _ in 0..3 {
            session.tick().unwrap();
        }
        assert_eq!(session.phase(), SessionPhase::Running);
        assert_eq!(controller.command_count(1, Command::SetChipOffset), 2);
    }

    #[test]
    fn failed_capture_is_retried_on_the_next_tick() {
        let (mut session, controller) = session_with_device(1);
        controller.set_accuracy_sequence(1, &[3]);
        session.add_tracker(1, Box::new(SharedRotation::new())).unwrap();
        session.launch(&[]).unwrap();
        session.tick().unwrap();
        session.trigger_offset().unwrap();
        session.tick().unwrap();
        session.tick().unwrap();

        controller.fail_acknowledge(1, true);
        let failed = session.tick();
        assert!(matches!(failed, Err(Error::Protocol(_))));
        assert_eq!(session.phase(), SessionPhase::OffsetCounting);

        controller.fail_acknowledge(1, false);
        session.tick().unwrap();
        assert_eq!(session.phase(), SessionPhase::Running);
        assert_eq!(controller.command_count(1, Command::SetChipOffset), 2);
    }
}
