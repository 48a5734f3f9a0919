// Copyright (C) 2026, imu-trackers contributors
// This file is part of imu-trackers
// Licensed under the MIT license. See LICENSE file in the project root for details.

//! Reference-frame composition turning raw readings into bone rotations.

use nalgebra::Quaternion;

/// The two baselines captured for one tracker during a session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameOffsets {
    /// Chip-frame baseline: the device's reading at capture time, cancelling
    /// its arbitrary power-on heading.
    pub chip: Quaternion<f32>,
    /// Avatar-frame rest pose of the bound bone at capture time.
    pub avatar: Quaternion<f32>,
}

impl FrameOffsets {
    /// Identity baselines: raw readings pass through unchanged.
    pub fn identity() -> FrameOffsets {
        FrameOffsets {
            chip: Quaternion::identity(),
            avatar: Quaternion::identity(),
        }
    }
}

impl Default for FrameOffsets {
    fn default() -> Self {
        Self::identity()
    }
}

/// Composes the rotation a commit applies to a bone from one raw reading.
///
/// The chip baseline is cancelled with its conjugate (offsets are unit
/// quaternions by convention, so no renormalization happens here), the result
/// is carried through the fixed world-to-avatar transform, and the bone's rest
/// pose is applied last:
///
/// ```text
/// world_to_avatar * conj(chip) * raw * avatar
/// ```
///
/// With identity baselines this reduces to `world_to_avatar * raw`.
pub fn avatar_rotation(
    world_to_avatar: &Quaternion<f32>,
    offsets: &FrameOffsets,
    raw: &Quaternion<f32>,
) -> Quaternion<f32> {
    world_to_avatar * offsets.chip.conjugate() * raw * offsets.avatar
}

#[cfg(test)]
mod tests {
    use std::f32::consts::FRAC_1_SQRT_2;

    use super::*;

    #[test]
    fn identity_everything_passes_raw_through() {
        let raw = Quaternion::new(0.5, 0.5, 0.5, 0.5);
        let composed = avatar_rotation(&Quaternion::identity(), &FrameOffsets::identity(), &raw);
        assert_eq!(composed, raw);
    }

    #[test]
    fn world_transform_applies_with_identity_baselines() {
        let world = Quaternion::new(FRAC_1_SQRT_2, 0.0, 0.0, FRAC_1_SQRT_2);
        let raw = Quaternion::new(0.5, -0.5, 0.5, -0.5);
        let composed = avatar_rotation(&world, &FrameOffsets::identity(), &raw);
        assert_eq!(composed, world * raw);
    }

    #[test]
    fn chip_baseline_cancels_the_captured_reading() {
        let reading = Quaternion::new(0.5, 0.5, 0.5, 0.5);
        let offsets = FrameOffsets {
            chip: reading,
            avatar: Quaternion::identity(),
        };
        let composed = avatar_rotation(&Quaternion::identity(), &offsets, &reading);
        assert_eq!(composed, Quaternion::identity());
    }

    #[test]
    fn rest_pose_is_applied_on_the_right() {
        let avatar = Quaternion::new(FRAC_1_SQRT_2, 0.0, 0.0, FRAC_1_SQRT_2);
        let raw = Quaternion::new(FRAC_1_SQRT_2, FRAC_1_SQRT_2, 0.0, 0.0);
        let offsets = FrameOffsets {
            chip: Quaternion::identity(),
            avatar,
        };
        let composed = avatar_rotation(&Quaternion::identity(), &offsets, &raw);
        assert_eq!(composed, raw * avatar);
        assert_ne!(composed, avatar * raw);
    }
}
