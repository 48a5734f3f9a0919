// Copyright (C) 2026, imu-trackers contributors
// This file is part of imu-trackers
// Licensed under the MIT license. See LICENSE file in the project root for details.

//! Background rotation sweeps over a shared fleet.
//!
//! The session's tick already sweeps rotations while running, but a tick
//! cadence chosen for rendering can be slower than the bus allows. The poller
//! keeps every tracker's `latest` reading fresh from its own thread; commits
//! stay with the session, so sinks never see readings from before the offset
//! capture.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use log::warn;

use crate::{fleet::SharedFleet, link::Link};

/// Worker thread running [`crate::TrackerFleet::prepare_rotations`] sweeps at
/// a fixed interval until stopped or dropped.
pub struct RotationPoller {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl RotationPoller {
    /// Starts sweeping `fleet` every `interval`. The fleet lock is held for
    /// one sweep at a time and released between sweeps.
    pub fn spawn<L: Link + 'static>(fleet: SharedFleet<L>, interval: Duration) -> RotationPoller {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            while !stop_flag.load(Ordering::Relaxed) {
                match fleet.lock() {
                    Ok(mut fleet) => {
                        if let Err(e) = fleet.prepare_rotations() {
                            warn!("rotation sweep failed: {e}");
                        }
                    }
                    Err(_) => {
                        warn!("fleet lock poisoned, rotation poller exiting");
                        return;
                    }
                }
                thread::sleep(interval);
            }
        });
        RotationPoller {
            stop,
            handle: Some(handle),
        }
    }

    /// Stops the worker and waits for it to finish its current sweep.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RotationPoller {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::Quaternion;

    use super::*;
    use crate::{
        fleet::{FleetConfig, TrackerFleet},
        mock::MockBus,
        protocol::Command,
        SharedRotation,
    };

    #[test]
    fn sweeps_until_stopped() {
        let bus = MockBus::new();
        let controller = bus.controller();
        controller.add_tracker(1);
        let reading = Quaternion::new(0.5, 0.5, 0.5, 0.5);
        controller.set_rotation(1, reading);

        let mut fleet = TrackerFleet::with_link(bus, FleetConfig::default()).unwrap();
        fleet.add_tracker(1, Box::new(SharedRotation::new())).unwrap();
        let shared = fleet.into_shared();

        let poller = RotationPoller::spawn(Arc::clone(&shared), Duration::from_millis(1));
        while controller.command_count(1, Command::ReadQuaternion) < 3 {
            thread::yield_now();
        }
        poller.stop();

        let polled = controller.command_count(1, Command::ReadQuaternion);
        assert!(polled >= 3);
        let fleet = shared.lock().unwrap();
        assert_eq!(fleet.trackers()[0].latest(), reading);
        drop(fleet);

        // No sweeps happen after a stop.
        thread::sleep(Duration::from_millis(10));
        assert_eq!(controller.command_count(1, Command::ReadQuaternion), polled);
    }
}
