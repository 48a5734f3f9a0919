// Copyright (C) 2026, imu-trackers contributors
// This file is part of imu-trackers
// Licensed under the MIT license. See LICENSE file in the project root for details.

use imu_trackers::{
    mock::MockBus,
    protocol::Command,
    Error, FleetConfig, RotationSink, Session, SessionPhase, SharedRotation, TrackerFleet,
};
use nalgebra::Quaternion;

#[test]
fn two_trackers_run_a_full_session() {
    let bus = MockBus::new();
    let controller = bus.controller();
    controller.add_tracker(1);
    controller.add_tracker(2);
    controller.set_accuracy_sequence(1, &[1, 3]);
    controller.set_accuracy_sequence(2, &[2, 3]);

    let fleet = TrackerFleet::with_link(bus, FleetConfig::default()).unwrap();
    let mut session = Session::new(fleet);

    let mut neck = SharedRotation::new();
    let neck_rest = Quaternion::new(0.5, 0.5, -0.5, -0.5);
    neck.set_rotation(neck_rest);
    let mut arm = SharedRotation::new();
    let arm_rest = Quaternion::new(0.5, -0.5, 0.5, 0.5);
    arm.set_rotation(arm_rest);

    session.add_tracker(1, Box::new(neck.clone())).unwrap();
    session.add_tracker(2, Box::new(arm.clone())).unwrap();
    // Nothing is listening at address 3; the rest of the fleet is unaffected.
    let missing = session.add_tracker(3, Box::new(SharedRotation::new()));
    assert!(matches!(missing, Err(Error::DeviceNotFound(3))));

    let firmware = [0x21u8, 0x22, 0x23, 0x24];
    session.launch(&firmware).unwrap();
    assert_eq!(session.phase(), SessionPhase::Calibrating);
    assert_eq!(controller.avatar_offset(1), Some(neck_rest));
    assert_eq!(controller.avatar_offset(2), Some(arm_rest));
    assert!(controller.written().ends_with(&firmware));

    // First calibration pass: tracker 1 reports accuracy 1 and blocks the sweep.
    session.tick().unwrap();
    assert_eq!(session.phase(), SessionPhase::Calibrating);
    assert_eq!(controller.command_count(2, Command::ReadCompassAccuracy), 0);
    // Second pass: tracker 1 latches calibrated, tracker 2 is polled for the
    // first time and is still short.
    session.tick().unwrap();
    assert_eq!(session.phase(), SessionPhase::Calibrating);
    // Third pass: only tracker 2 is polled, and it reports calibrated.
    session.tick().unwrap();
    assert_eq!(session.phase(), SessionPhase::WaitOffsetting);
    assert_eq!(controller.command_count(1, Command::ReadCompassAccuracy), 2);

    let neck_capture = Quaternion::new(0.5, -0.5, -0.5, 0.5);
    let arm_capture = Quaternion::new(0.5, 0.5, 0.5, -0.5);
    controller.set_rotation(1, neck_capture);
    controller.set_rotation(2, arm_capture);

    session.trigger_offset().unwrap();
    for _ in 0..3 {
        session.tick().unwrap();
    }
    assert_eq!(session.phase(), SessionPhase::Running);
    assert_eq!(controller.command_count(1, Command::SetChipOffset), 1);
    assert_eq!(controller.command_count(2, Command::SetChipOffset), 1);

    let neck_live = Quaternion::new(0.5, 0.5, 0.5, 0.5);
    let arm_live = Quaternion::new(0.5, 0.5, -0.5, 0.5);
    controller.set_rotation(1, neck_live);
    controller.set_rotation(2, arm_live);
    session.tick().unwrap();

    assert_eq!(neck.get(), neck_capture.conjugate() * neck_live * neck_rest);
    assert_eq!(arm.get(), arm_capture.conjugate() * arm_live * arm_rest);
}

#[test]
fn transient_timeouts_ride_through_a_running_session() {
    let bus = MockBus::new();
    let controller = bus.controller();
    controller.add_tracker(1);
    controller.set_accuracy_sequence(1, &[3]);

    let fleet = TrackerFleet::with_link(bus, FleetConfig::default()).unwrap();
    let mut session = Session::new(fleet);
    let slot = SharedRotation::new();
    session.add_tracker(1, Box::new(slot.clone())).unwrap();
    session.launch(&[]).unwrap();
    session.tick().unwrap();
    session.trigger_offset().unwrap();
    for _ in 0..3 {
        session.tick().unwrap();
    }
    assert_eq!(session.phase(), SessionPhase::Running);

    // Two rotation replies go missing; the bounded retry absorbs them.
    controller.drop_replies(1, 2);
    let live = Quaternion::new(0.5, 0.5, 0.5, -0.5);
    controller.set_rotation(1, live);
    session.tick().unwrap();

    let chip = session.fleet().lock().unwrap().trackers()[0].offsets().chip;
    assert_eq!(slot.get(), chip.conjugate() * live);
}
