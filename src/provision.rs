// Copyright (C) 2026, imu-trackers contributors
// This file is part of imu-trackers
// Licensed under the MIT license. See LICENSE file in the project root for details.

//! Bench setup of factory-fresh trackers: finding the one device on the wire
//! and burning its permanent identity.
//!
//! This runs with a single tracker connected, its address unknown (fresh
//! devices ship with an arbitrary one). Sweeps use the short
//! [`PROVISIONING_TIMEOUT`] since silence is the common case.

use log::info;

use crate::{
    link::{Link, PROVISIONING_TIMEOUT},
    protocol::{TrackerClient, MAX_DEVICE_ADDRESS},
    Error, Result,
};

pub use crate::protocol::AxisMap;

/// Pings every assignable address in order and returns the first one that
/// answers. `Ok(None)` means the whole address space stayed silent. A garbled
/// reply mid-sweep is surfaced, not skipped; it means something on the wire is
/// speaking a different protocol.
///
/// The link is left configured with [`PROVISIONING_TIMEOUT`]; reusing it for a
/// fleet afterwards is fine, since [`crate::TrackerFleet::with_link`] applies
/// its own timeout.
pub fn discover(link: &mut impl Link) -> Result<Option<u8>> {
    link.set_read_timeout(PROVISIONING_TIMEOUT)?;
    for address in 1..=MAX_DEVICE_ADDRESS {
        match TrackerClient::new(link, address).ping() {
            Ok(()) => {
                info!("found a tracker at address {address}");
                return Ok(Some(address));
            }
            Err(Error::LinkTimeout) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(None)
}

/// Gives the tracker at `current` its permanent identity: the bus address it
/// will answer on and the axis remap matching how it is mounted. The address
/// change is acknowledged at the old address, the axis write at the new one.
/// The link is left configured with [`PROVISIONING_TIMEOUT`].
pub fn assign_identity(
    link: &mut impl Link,
    current: u8,
    new_id: u8,
    axis: AxisMap,
) -> Result<()> {
    link.set_read_timeout(PROVISIONING_TIMEOUT)?;
    TrackerClient::new(link, current).change_id(new_id)?;
    TrackerClient::new(link, new_id).set_axis(axis)?;
    info!("tracker {current} now answers at {new_id}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mock::MockBus, protocol::Command};

    #[test]
    fn discover_returns_the_first_responder() {
        let mut bus = MockBus::new();
        let controller = bus.controller();
        controller.add_tracker(7);

        let found = discover(&mut bus).unwrap();

        assert_eq!(found, Some(7));
        // Pinged 1 through 7 and stopped there.
        assert_eq!(controller.commands().len(), 7);
        assert_eq!(controller.read_timeout(), PROVISIONING_TIMEOUT);
    }

    #[test]
    fn discover_sweeps_the_whole_space_when_silent() {
        let mut bus = MockBus::new();
        let controller = bus.controller();

        let found = discover(&mut bus).unwrap();

        assert_eq!(found, None);
        assert_eq!(controller.command_count(0xFD, Command::Ping), 1);
        assert_eq!(controller.commands().len(), 0xFD as usize);
    }

    #[test]
    fn discover_surfaces_garbled_replies() {
        let mut bus = MockBus::new();
        let controller = bus.controller();
        controller.add_tracker(3);
        controller.fail_acknowledge(3, true);

        let result = discover(&mut bus);
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[test]
    fn assign_identity_moves_and_configures_the_device() {
        let mut bus = MockBus::new();
        let controller = bus.controller();
        controller.add_tracker(1);
        let axis = AxisMap::new(1, false, 0, true, false).unwrap();

        assign_identity(&mut bus, 1, 5, axis).unwrap();

        assert_eq!(controller.addresses(), vec![5]);
        let set_axis = controller
            .commands()
            .into_iter()
            .find(|parsed| parsed.command == Command::SetAxis)
            .unwrap();
        assert_eq!(set_axis.address, 5);
        assert_eq!(set_axis.payload, vec![axis.encode()]);
    }
}
