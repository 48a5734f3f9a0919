// Copyright (C) 2026, imu-trackers contributors
// This file is part of imu-trackers
// Licensed under the MIT license. See LICENSE file in the project root for details.

use clap::Parser;
use imu_trackers::{
    link::PROVISIONING_TIMEOUT,
    open_link,
    protocol::TrackerClient,
    provision::{self, AxisMap},
};

/// Finds the single connected tracker and optionally burns its identity.
#[derive(Parser)]
struct Args {
    /// Serial port the tracker bus is connected to
    #[arg(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// New bus address to assign to the discovered tracker
    #[arg(long)]
    assign: Option<u8>,

    /// Source axis X reads from (0 = X, 1 = Y, 2 = Z)
    #[arg(long, default_value_t = 0)]
    x_source: u8,

    /// Source axis Y reads from
    #[arg(long, default_value_t = 1)]
    y_source: u8,

    /// Negate X readings
    #[arg(long)]
    negate_x: bool,

    /// Negate Y readings
    #[arg(long)]
    negate_y: bool,

    /// Negate Z readings
    #[arg(long)]
    negate_z: bool,

    /// Application image to reflash onto the tracker (it halts afterwards and
    /// needs a power cycle)
    #[arg(long)]
    reflash: Option<std::path::PathBuf>,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let mut link = open_link(&args.port, PROVISIONING_TIMEOUT).unwrap();
    let Some(address) = provision::discover(&mut link).unwrap() else {
        println!("No tracker answered; check the wiring and try again");
        return;
    };
    println!("Found a tracker at address {address}");

    let mut address = address;
    if let Some(new_id) = args.assign {
        let axis = AxisMap::new(
            args.x_source,
            args.negate_x,
            args.y_source,
            args.negate_y,
            args.negate_z,
        )
        .unwrap();
        provision::assign_identity(&mut link, address, new_id, axis).unwrap();
        println!(
            "Tracker configured: address {new_id}, axis byte {:#04x}",
            axis.encode()
        );
        address = new_id;
    }

    if let Some(image_path) = &args.reflash {
        let image = std::fs::read(image_path).unwrap();
        println!("Reflashing {} bytes, do not unplug", image.len());
        TrackerClient::new(&mut link, address)
            .program_firmware(&image)
            .unwrap();
        println!("Done; power cycle the tracker");
    }
}
