//! Typed read/write access to raw pose feature vectors.

use std::sync::Arc;

use nalgebra::{Matrix3, Quaternion, Rotation3, UnitQuaternion, Vector3};

use crate::index::SearchIndex;
use crate::layout::{FeatureDescriptor, FeatureLayout, FeatureType};
use crate::math::{make_transform, Transform};
use crate::schema::Schema;

/// Writes features into a vector laid out by a schema, tracking which features were set.
#[derive(Clone, Debug)]
pub struct FeatureVectorBuilder {
    schema: Arc<Schema>,
    values: Vec<f32>,
    values_normalized: Vec<f32>,
    features_added: Vec<bool>,
    num_features_added: usize,
}

impl FeatureVectorBuilder {
    pub fn new(schema: &Arc<Schema>) -> Self {
        let mut builder = Self {
            schema: schema.clone(),
            values: Vec::new(),
            values_normalized: Vec::new(),
            features_added: Vec::new(),
            num_features_added: 0,
        };
        builder.init(schema);
        builder
    }

    pub fn init(&mut self, schema: &Arc<Schema>) {
        self.schema = schema.clone();
        let num_floats = schema.layout.num_floats;
        self.values.clear();
        self.values.resize(num_floats, 0.0);
        self.values_normalized.clear();
        self.values_normalized.resize(num_floats, 0.0);
        self.reset_features();
    }

    pub fn reset_features(&mut self) {
        self.features_added.clear();
        self.features_added
            .resize(self.schema.layout.num_features(), false);
        self.num_features_added = 0;
    }

    #[inline]
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    #[inline]
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Values in the index's preprocessed space, valid after [`Self::normalize`] or
    /// [`Self::copy_from_search_index`].
    #[inline]
    pub fn normalized_values(&self) -> &[f32] {
        &self.values_normalized
    }

    pub fn is_initialized_for_schema(&self, schema: &Schema) -> bool {
        std::ptr::eq(Arc::as_ptr(&self.schema), schema)
            && self.values.len() == schema.layout.num_floats
    }

    #[inline]
    pub fn num_features_added(&self) -> usize {
        self.num_features_added
    }

    #[inline]
    pub fn is_feature_added(&self, feature_idx: usize) -> bool {
        self.features_added.get(feature_idx).copied().unwrap_or(false)
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.num_features_added == self.schema.layout.num_features()
    }

    pub fn reader(&self) -> FeatureVectorReader<'_> {
        FeatureVectorReader::new(&self.schema.layout, &self.values)
    }

    fn mark_added(&mut self, feature_idx: usize) {
        if !self.features_added[feature_idx] {
            self.features_added[feature_idx] = true;
            self.num_features_added += 1;
        }
    }

    fn write(&mut self, feature: FeatureDescriptor, data: &[f32]) -> bool {
        let Some(feature_idx) = self.schema.layout.find(&feature) else {
            return false;
        };
        let offset = self.schema.layout.features[feature_idx].value_offset;
        self.values[offset..offset + data.len()].copy_from_slice(data);
        self.mark_added(feature_idx);
        true
    }

    /// Writes a 3-float feature of `feature.feature_type`.
    pub fn set_vector(&mut self, feature: FeatureDescriptor, vector: &Vector3<f32>) -> bool {
        debug_assert_eq!(feature.num_floats(), 3);
        self.write(feature, vector.as_slice())
    }

    pub fn set_position(&mut self, feature: FeatureDescriptor, position: &Vector3<f32>) -> bool {
        self.set_vector(feature.with_type(FeatureType::Position), position)
    }

    /// Writes the Rotation feature (X and Y axes) and the ForwardVector feature (Y axis),
    /// whichever the layout declares.
    pub fn set_rotation(&mut self, feature: FeatureDescriptor, rotation: &UnitQuaternion<f32>) -> bool {
        let x = rotation * Vector3::x();
        let y = rotation * Vector3::y();
        let axes = [x.x, x.y, x.z, y.x, y.y, y.z];
        let wrote_rotation = self.write(feature.with_type(FeatureType::Rotation), &axes);
        let wrote_forward = self.set_vector(feature.with_type(FeatureType::ForwardVector), &y);
        wrote_rotation || wrote_forward
    }

    pub fn set_transform(&mut self, feature: FeatureDescriptor, transform: &Transform) -> bool {
        let wrote_position = self.set_position(feature, &transform.translation.vector);
        let wrote_rotation = self.set_rotation(feature, &transform.rotation);
        wrote_position || wrote_rotation
    }

    /// Backward difference of translations.
    pub fn set_linear_velocity(
        &mut self,
        feature: FeatureDescriptor,
        transform: &Transform,
        previous: &Transform,
        delta_time: f32,
    ) -> bool {
        let velocity =
            (transform.translation.vector - previous.translation.vector) / delta_time;
        self.set_vector(feature.with_type(FeatureType::LinearVelocity), &velocity)
    }

    /// Average of the backward and forward differences.
    pub fn set_linear_velocity_central(
        &mut self,
        feature: FeatureDescriptor,
        next: &Transform,
        transform: &Transform,
        previous: &Transform,
        delta_time: f32,
    ) -> bool {
        let backward = (transform.translation.vector - previous.translation.vector) / delta_time;
        let forward = (next.translation.vector - transform.translation.vector) / delta_time;
        self.set_vector(
            feature.with_type(FeatureType::LinearVelocity),
            &((backward + forward) * 0.5),
        )
    }

    pub fn set_angular_velocity(
        &mut self,
        feature: FeatureDescriptor,
        transform: &Transform,
        previous: &Transform,
        delta_time: f32,
    ) -> bool {
        let velocity = angular_velocity(&previous.rotation, &transform.rotation, delta_time);
        self.set_vector(feature.with_type(FeatureType::AngularVelocity), &velocity)
    }

    pub fn set_angular_velocity_central(
        &mut self,
        feature: FeatureDescriptor,
        next: &Transform,
        transform: &Transform,
        previous: &Transform,
        delta_time: f32,
    ) -> bool {
        let backward = angular_velocity(&previous.rotation, &transform.rotation, delta_time);
        let forward = angular_velocity(&transform.rotation, &next.rotation, delta_time);
        self.set_vector(
            feature.with_type(FeatureType::AngularVelocity),
            &((backward + forward) * 0.5),
        )
    }

    /// Copies one feature from a builder of the same schema.
    pub fn copy_feature(&mut self, other: &FeatureVectorBuilder, feature_idx: usize) -> bool {
        if !Arc::ptr_eq(&self.schema, &other.schema) {
            return false;
        }
        let Some(feature) = self.schema.layout.features.get(feature_idx).copied() else {
            return false;
        };
        let range = feature.value_offset..feature.value_offset + feature.num_floats();
        self.values[range.clone()].copy_from_slice(&other.values[range]);
        self.mark_added(feature_idx);
        true
    }

    /// Overwrites this vector with every feature `other` has set.
    pub fn merge_replace(&mut self, other: &FeatureVectorBuilder) -> bool {
        if !Arc::ptr_eq(&self.schema, &other.schema) {
            return false;
        }
        for feature_idx in 0..other.features_added.len() {
            if other.features_added[feature_idx] {
                self.copy_feature(other, feature_idx);
            }
        }
        true
    }

    /// Loads pose `pose_idx`: normalized values verbatim, raw values through the inverse
    /// preprocessing transform.
    pub fn copy_from_search_index(&mut self, index: &SearchIndex, pose_idx: usize) -> bool {
        if !Arc::ptr_eq(&self.schema, index.schema()) || pose_idx >= index.num_poses() {
            return false;
        }
        let pose = index.pose_values(pose_idx);
        self.values_normalized.copy_from_slice(pose);
        self.values = index.inverse_normalize(pose);
        for flag in &mut self.features_added {
            *flag = true;
        }
        self.num_features_added = self.features_added.len();
        true
    }

    /// Runs the raw values through the index's forward preprocessing transform.
    pub fn normalize(&mut self, index: &SearchIndex) -> bool {
        if !Arc::ptr_eq(&self.schema, index.schema()) {
            return false;
        }
        self.values_normalized = index.normalize(&self.values);
        true
    }
}

/// `2 · dq/dt · q⁻¹`, imaginary part.
fn angular_velocity(
    previous: &UnitQuaternion<f32>,
    current: &UnitQuaternion<f32>,
    delta_time: f32,
) -> Vector3<f32> {
    let q0 = previous.quaternion();
    let mut q1 = *current.quaternion();
    if q0.coords.dot(&q1.coords) < 0.0 {
        q1 = Quaternion::from(-q1.coords);
    }
    let derivative = Quaternion::from((q1.coords - q0.coords) / delta_time);
    let omega = derivative * q0.conjugate() * 2.0;
    omega.imag()
}

/// Typed view over a raw vector.
#[derive(Clone, Copy, Debug)]
pub struct FeatureVectorReader<'a> {
    layout: &'a FeatureLayout,
    values: &'a [f32],
}

impl<'a> FeatureVectorReader<'a> {
    pub fn new(layout: &'a FeatureLayout, values: &'a [f32]) -> Self {
        Self { layout, values }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.values.len() == self.layout.num_floats
    }

    fn slice(&self, feature: FeatureDescriptor) -> Option<&'a [f32]> {
        if !self.is_valid() {
            return None;
        }
        let feature_idx = self.layout.find(&feature)?;
        let offset = self.layout.features[feature_idx].value_offset;
        self.values.get(offset..offset + feature.num_floats())
    }

    pub fn get_vector(&self, feature: FeatureDescriptor) -> Option<Vector3<f32>> {
        self.slice(feature).map(Vector3::from_column_slice)
    }

    pub fn get_position(&self, feature: FeatureDescriptor) -> Option<Vector3<f32>> {
        self.get_vector(feature.with_type(FeatureType::Position))
    }

    pub fn get_forward_vector(&self, feature: FeatureDescriptor) -> Option<Vector3<f32>> {
        self.get_vector(feature.with_type(FeatureType::ForwardVector))
    }

    pub fn get_linear_velocity(&self, feature: FeatureDescriptor) -> Option<Vector3<f32>> {
        self.get_vector(feature.with_type(FeatureType::LinearVelocity))
    }

    pub fn get_angular_velocity(&self, feature: FeatureDescriptor) -> Option<Vector3<f32>> {
        self.get_vector(feature.with_type(FeatureType::AngularVelocity))
    }

    /// Rotation matrix with columns X, Y and X × Y as stored.
    pub fn get_rotation_matrix(&self, feature: FeatureDescriptor) -> Option<Matrix3<f32>> {
        let data = self.slice(feature.with_type(FeatureType::Rotation))?;
        let x = Vector3::new(data[0], data[1], data[2]);
        let y = Vector3::new(data[3], data[4], data[5]);
        Some(Matrix3::from_columns(&[x, y, x.cross(&y)]))
    }

    /// Rotation re-orthonormalized from the stored axes.
    pub fn get_rotation(&self, feature: FeatureDescriptor) -> Option<UnitQuaternion<f32>> {
        let matrix = self.get_rotation_matrix(feature)?;
        let x = matrix.column(0).normalize();
        let z = x.cross(&matrix.column(1).into_owned()).normalize();
        let y = z.cross(&x);
        if !(x.iter().chain(y.iter()).chain(z.iter()).all(|v| v.is_finite())) {
            return None;
        }
        let rotation = Rotation3::from_basis_unchecked(&[x, y, z]);
        Some(UnitQuaternion::from_rotation_matrix(&rotation))
    }

    pub fn get_transform(&self, feature: FeatureDescriptor) -> Option<Transform> {
        Some(make_transform(
            self.get_position(feature)?,
            self.get_rotation(feature)?,
        ))
    }
}

/// Weighted squared distance `Σ (a − b)² · w`.
pub fn compare_feature_vectors(a: &[f32], b: &[f32], weights: &[f32]) -> f32 {
    debug_assert!(a.len() == b.len() && a.len() == weights.len());
    a.iter()
        .zip(b)
        .zip(weights)
        .map(|((x, y), w)| {
            let d = x - y;
            d * d * w
        })
        .sum()
}

/// Unweighted squared distance.
pub fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{ChannelConfig, TrajectoryChannelConfig};
    use crate::schema::SchemaConfig;
    use crate::skeleton::{Bone, Skeleton};
    use approx::assert_relative_eq;

    fn mk_schema(facing: bool) -> Arc<Schema> {
        let skeleton = Skeleton::new(vec![Bone {
            name: "root".into(),
            parent: None,
            reference: Transform::identity(),
        }])
        .unwrap();
        let config = SchemaConfig {
            channels: vec![ChannelConfig::Trajectory(TrajectoryChannelConfig {
                sample_offsets: vec![0.0, 0.5],
                use_facing_directions: facing,
                ..Default::default()
            })],
            ..Default::default()
        };
        Arc::new(Schema::new(config, Arc::new(skeleton)))
    }

    #[test]
    fn completeness_tracks_features() {
        let schema = mk_schema(true);
        let mut builder = FeatureVectorBuilder::new(&schema);
        assert_eq!(builder.values().len(), 18);
        let feature = FeatureDescriptor::new(0, 0, 0, FeatureType::Position);
        builder.set_position(feature, &Vector3::new(1.0, 2.0, 3.0));
        builder.set_position(feature, &Vector3::new(1.0, 2.0, 3.0));
        assert_eq!(builder.num_features_added(), 1);
        assert!(!builder.is_complete());

        // rotation only lands on the forward vector
        assert!(builder.set_rotation(feature, &UnitQuaternion::identity()));
        assert_eq!(
            builder.reader().get_forward_vector(feature),
            Some(Vector3::y())
        );
        assert!(!builder.set_rotation(FeatureDescriptor::new(0, 0, 5, FeatureType::Rotation), &UnitQuaternion::identity()));
    }

    #[test]
    fn velocities_use_finite_differences() {
        let schema = mk_schema(false);
        let mut builder = FeatureVectorBuilder::new(&schema);
        let feature = FeatureDescriptor::new(0, 0, 1, FeatureType::Position);
        let previous = make_transform(Vector3::new(0.0, 0.0, 0.0), UnitQuaternion::identity());
        let current = make_transform(Vector3::new(0.0, 1.0, 0.0), UnitQuaternion::identity());
        let next = make_transform(Vector3::new(0.0, 3.0, 0.0), UnitQuaternion::identity());
        builder.set_linear_velocity_central(feature, &next, &current, &previous, 0.5);
        assert_relative_eq!(
            builder.reader().get_linear_velocity(feature).unwrap(),
            Vector3::new(0.0, 3.0, 0.0),
            epsilon = 1e-5
        );
    }

    #[test]
    fn angular_velocity_matches_axis_rate() {
        let q0 = UnitQuaternion::identity();
        let q1 = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), 0.01);
        let w = angular_velocity(&q0, &q1, 0.01);
        assert_relative_eq!(w, Vector3::new(0.0, 0.0, 1.0), epsilon = 1e-3);
    }

    #[test]
    fn reader_rebuilds_rotation() {
        let mut layout = FeatureLayout::default();
        layout.add(FeatureDescriptor::new(0, 0, 0, FeatureType::Position));
        layout.add(FeatureDescriptor::new(0, 0, 0, FeatureType::Rotation));
        layout.finalize();
        let rotation = UnitQuaternion::from_euler_angles(0.2, 0.4, -0.3);
        let x = rotation * Vector3::x();
        let y = rotation * Vector3::y();
        let values = [1.0, 2.0, 3.0, x.x, x.y, x.z, y.x, y.y, y.z];
        let reader = FeatureVectorReader::new(&layout, &values);
        let feature = FeatureDescriptor::new(0, 0, 0, FeatureType::Position);
        let transform = reader.get_transform(feature).unwrap();
        assert!(transform.rotation.angle_to(&rotation) < 1e-4);
        assert_eq!(transform.translation.vector, Vector3::new(1.0, 2.0, 3.0));
        assert!(FeatureVectorReader::new(&layout, &values[..4]).get_position(feature).is_none());
    }

    #[test]
    fn weighted_compare() {
        let a = [1.0, 2.0, 3.0];
        let b = [1.0, 0.0, 4.0];
        assert_eq!(compare_feature_vectors(&a, &b, &[1.0, 0.5, 2.0]), 4.0);
        assert_eq!(squared_distance(&a, &b), 5.0);
    }
}
