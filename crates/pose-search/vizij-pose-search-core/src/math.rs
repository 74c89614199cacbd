//! Rigid transform helpers: relative transforms, blending, mirroring and root motion
//! extrapolation. Transforms are `nalgebra::Isometry3<f32>`; `a * b` applies `b` first and
//! then `a`, so a child expressed in its parent's frame composes as `parent * child`.

use std::hash::{Hash, Hasher};

use nalgebra::{Isometry3, Quaternion, Translation3, UnitQuaternion, Vector3, Vector4};
use serde::{Deserialize, Serialize};

use crate::config::ExtrapolationParams;

pub type Transform = Isometry3<f32>;

pub const SMALL_NUMBER: f32 = 1e-8;
pub const KINDA_SMALL_NUMBER: f32 = 1e-4;

#[inline]
pub fn make_transform(translation: Vector3<f32>, rotation: UnitQuaternion<f32>) -> Transform {
    Isometry3::from_parts(Translation3::from(translation), rotation)
}

/// Feeds the exact bits of `transform` into `state`.
pub fn hash_transform<H: Hasher>(transform: &Transform, state: &mut H) {
    for value in transform
        .translation
        .vector
        .iter()
        .chain(transform.rotation.coords.iter())
    {
        value.to_bits().hash(state);
    }
}

/// `child` re-expressed in the frame of `parent`.
#[inline]
pub fn relative_transform(child: &Transform, parent: &Transform) -> Transform {
    parent.inverse() * child
}

#[inline]
pub fn is_nearly_zero(value: f32) -> bool {
    value.abs() <= SMALL_NUMBER
}

/// Normalized lerp along the shortest arc.
pub fn lerp_rotation(
    a: &UnitQuaternion<f32>,
    b: &UnitQuaternion<f32>,
    alpha: f32,
) -> UnitQuaternion<f32> {
    let qa = a.quaternion().coords;
    let qb = b.quaternion().coords;
    let sign = if qa.dot(&qb) < 0.0 { -1.0 } else { 1.0 };
    let coords: Vector4<f32> = qa * (1.0 - alpha) + qb * (alpha * sign);
    UnitQuaternion::new_normalize(Quaternion::from(coords))
}

pub fn blend_transforms(a: &Transform, b: &Transform, alpha: f32) -> Transform {
    let translation = a.translation.vector.lerp(&b.translation.vector, alpha);
    make_transform(translation, lerp_rotation(&a.rotation, &b.rotation, alpha))
}

/// Weighted average of transforms. Rotations are summed in the hemisphere of the first
/// sample and renormalized.
pub fn blend_weighted(samples: &[(Transform, f32)]) -> Transform {
    let Some((first, _)) = samples.first() else {
        return Transform::identity();
    };
    let reference = first.rotation.quaternion().coords;
    let mut translation = Vector3::zeros();
    let mut rotation = Vector4::zeros();
    let mut total = 0.0;
    for (transform, weight) in samples {
        let coords = transform.rotation.quaternion().coords;
        let sign = if coords.dot(&reference) < 0.0 { -1.0 } else { 1.0 };
        translation += transform.translation.vector * *weight;
        rotation += coords * (*weight * sign);
        total += *weight;
    }
    if total <= SMALL_NUMBER || rotation.norm() <= SMALL_NUMBER {
        return *first;
    }
    make_transform(
        translation / total,
        UnitQuaternion::new_normalize(Quaternion::from(rotation)),
    )
}

/// Axis whose component is negated when mirroring.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MirrorAxis {
    #[default]
    X,
    Y,
    Z,
}

pub fn mirror_vector(v: &Vector3<f32>, axis: MirrorAxis) -> Vector3<f32> {
    let mut out = *v;
    match axis {
        MirrorAxis::X => out.x = -out.x,
        MirrorAxis::Y => out.y = -out.y,
        MirrorAxis::Z => out.z = -out.z,
    }
    out
}

/// Reflects a rotation through the plane orthogonal to `axis`.
pub fn mirror_rotation(q: &UnitQuaternion<f32>, axis: MirrorAxis) -> UnitQuaternion<f32> {
    let q = q.quaternion();
    let (w, x, y, z) = (q.w, q.i, q.j, q.k);
    let mirrored = match axis {
        MirrorAxis::X => Quaternion::new(w, x, -y, -z),
        MirrorAxis::Y => Quaternion::new(w, -x, y, -z),
        MirrorAxis::Z => Quaternion::new(w, -x, -y, z),
    };
    UnitQuaternion::new_normalize(mirrored)
}

/// Extends root motion sampled over `[sample_start, sample_end]` by `extrapolation_time`
/// seconds of constant velocity. Negative times run the sampled motion backwards.
pub fn extrapolate_root_motion(
    sample: Transform,
    sample_start: f32,
    sample_end: f32,
    extrapolation_time: f32,
    params: &ExtrapolationParams,
) -> Transform {
    let sample_delta = sample_end - sample_start;
    if is_nearly_zero(sample_delta) || is_nearly_zero(extrapolation_time) {
        return Transform::identity();
    }

    let linear_speed = sample.translation.vector.norm() / sample_delta.abs();
    let angular_speed = sample.rotation.angle().to_degrees() / sample_delta.abs();
    let can_translate = linear_speed >= params.linear_speed_threshold;
    let can_rotate = angular_speed >= params.angular_speed_threshold;
    if !can_translate && !can_rotate {
        return Transform::identity();
    }

    let mut step = sample;
    if !can_translate {
        step.translation = Translation3::identity();
    }
    if !can_rotate {
        step.rotation = UnitQuaternion::identity();
    }
    if extrapolation_time < 0.0 {
        step = step.inverse();
    }

    let ratio = extrapolation_time.abs() / sample_delta.abs();
    let whole = ratio.floor();
    let remainder = ratio - whole;

    let mut accumulated = Transform::identity();
    for _ in 0..whole as usize {
        accumulated *= step;
    }
    accumulated * blend_transforms(&Transform::identity(), &step, remainder)
}

/// Linear remap of `value` from `[in_a, in_b]` to `[out_a, out_b]` without clamping.
#[inline]
pub fn map_range_unclamped(value: f32, in_a: f32, in_b: f32, out_a: f32, out_b: f32) -> f32 {
    let span = in_b - in_a;
    if is_nearly_zero(span) {
        return out_a;
    }
    out_a + (value - in_a) / span * (out_b - out_a)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f32::consts::FRAC_PI_2;

    #[test]
    fn relative_transform_inverts_composition() {
        let parent = make_transform(
            Vector3::new(1.0, 2.0, 0.0),
            UnitQuaternion::from_axis_angle(&Vector3::z_axis(), FRAC_PI_2),
        );
        let child_local = make_transform(Vector3::new(0.5, 0.0, 0.0), UnitQuaternion::identity());
        let child = parent * child_local;
        let back = relative_transform(&child, &parent);
        assert_relative_eq!(back.translation.vector, child_local.translation.vector, epsilon = 1e-5);
    }

    #[test]
    fn mirror_is_an_involution() {
        let q = UnitQuaternion::from_euler_angles(0.3, -0.2, 0.9);
        for axis in [MirrorAxis::X, MirrorAxis::Y, MirrorAxis::Z] {
            let back = mirror_rotation(&mirror_rotation(&q, axis), axis);
            assert!(back.angle_to(&q) < 1e-5);
        }
        let v = mirror_vector(&Vector3::new(1.0, 2.0, 3.0), MirrorAxis::Y);
        assert_eq!(v, Vector3::new(1.0, -2.0, 3.0));
    }

    #[test]
    fn extrapolation_scales_with_time() {
        let params = ExtrapolationParams::default();
        // 0.1 units over 0.05s = 2 units/s
        let sample = make_transform(Vector3::new(0.0, 0.1, 0.0), UnitQuaternion::identity());
        let forward = extrapolate_root_motion(sample, 0.0, 0.05, 0.5, &params);
        assert_relative_eq!(forward.translation.vector.y, 1.0, epsilon = 1e-4);
        let backward = extrapolate_root_motion(sample, 0.0, 0.05, -0.125, &params);
        assert_relative_eq!(backward.translation.vector.y, -0.25, epsilon = 1e-4);
    }

    #[test]
    fn slow_motion_is_not_extrapolated() {
        let params = ExtrapolationParams::default();
        let sample = make_transform(Vector3::new(0.0, 0.01, 0.0), UnitQuaternion::identity());
        let out = extrapolate_root_motion(sample, 0.0, 0.05, 1.0, &params);
        assert_eq!(out, Transform::identity());
    }
}
