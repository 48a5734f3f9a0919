// Copyright (C) 2026, imu-trackers contributors
// This file is part of imu-trackers
// Licensed under the MIT license. See LICENSE file in the project root for details.

use std::{thread, time::Duration};

use clap::Parser;
use imu_trackers::{
    mock::MockBus, FleetConfig, Link, RotationPoller, Session, SessionPhase, SharedRotation,
    TrackerFleet,
};

/// Runs a full tracking session and prints the committed bone rotations.
#[derive(Parser)]
struct Args {
    /// Serial port the tracker bus is connected to
    #[arg(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Bus addresses of the trackers to bind
    #[arg(long, value_delimiter = ',', default_value = "1")]
    trackers: Vec<u8>,

    /// Sensor firmware image broadcast at launch
    #[arg(long)]
    firmware: Option<std::path::PathBuf>,

    /// Run against a simulated bus instead of hardware
    #[arg(long)]
    mock: bool,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    if args.mock {
        let bus = MockBus::new();
        let controller = bus.controller();
        for &address in &args.trackers {
            controller.add_tracker(address);
            controller.set_accuracy_sequence(address, &[1, 2, 3]);
        }
        let fleet = TrackerFleet::with_link(bus, FleetConfig::default()).unwrap();
        run(fleet, &args);
    } else {
        let fleet = TrackerFleet::open(&args.port, FleetConfig::default()).unwrap();
        run(fleet, &args);
    }
}

fn run<L: Link + 'static>(fleet: TrackerFleet<L>, args: &Args) {
    let firmware = match &args.firmware {
        Some(path) => std::fs::read(path).unwrap(),
        None => Vec::new(),
    };

    let mut session = Session::new(fleet);
    let mut slots = Vec::new();
    for &address in &args.trackers {
        let slot = SharedRotation::new();
        session.add_tracker(address, Box::new(slot.clone())).unwrap();
        slots.push((address, slot));
    }

    session.launch(&firmware).unwrap();
    println!("Launched, waiting for compass calibration (rotate the sensors)");
    while session.phase() == SessionPhase::Calibrating {
        session.tick().unwrap();
        thread::sleep(Duration::from_millis(500));
    }

    println!("Calibrated. Strike the rest pose");
    session.trigger_offset().unwrap();
    while session.phase() == SessionPhase::OffsetCounting {
        println!("{}", session.countdown());
        session.tick().unwrap();
        thread::sleep(Duration::from_secs(1));
    }

    // Keeps readings fresh between the prints below.
    let _poller = RotationPoller::spawn(session.fleet(), Duration::from_millis(10));
    loop {
        session.tick().unwrap();
        for (address, slot) in &slots {
            let q = slot.get();
            println!(
                "tracker {address}: {:9.6} {:9.6} {:9.6} {:9.6}",
                q.w, q.i, q.j, q.k
            );
        }
        thread::sleep(Duration::from_millis(100));
    }
}
