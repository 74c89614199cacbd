//! Runtime query construction from pose history, a predicted root trajectory and the currently
//! playing pose.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::feature_vector::FeatureVectorBuilder;
use crate::history::PoseHistory;
use crate::index::SearchIndex;
use crate::math::{lerp_rotation, make_transform, Transform};
use crate::schema::Schema;

/// One point of a root trajectory. Times and distances are relative to the present:
/// negative in the past, positive in the future.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrajectorySample {
    pub accumulated_seconds: f32,
    pub accumulated_distance: f32,
    pub transform: Transform,
    pub linear_velocity: Vector3<f32>,
}

impl TrajectorySample {
    /// Translation and velocity extrapolate beyond `[0, 1]`; rotation is clamped.
    fn lerp(&self, other: &Self, alpha: f32) -> Self {
        let translation = self
            .transform
            .translation
            .vector
            .lerp(&other.transform.translation.vector, alpha);
        let rotation = lerp_rotation(
            &self.transform.rotation,
            &other.transform.rotation,
            alpha.clamp(0.0, 1.0),
        );
        Self {
            accumulated_seconds: self.accumulated_seconds
                + (other.accumulated_seconds - self.accumulated_seconds) * alpha,
            accumulated_distance: self.accumulated_distance
                + (other.accumulated_distance - self.accumulated_distance) * alpha,
            transform: make_transform(translation, rotation),
            linear_velocity: self.linear_velocity.lerp(&other.linear_velocity, alpha),
        }
    }
}

/// Root trajectory around the present, ordered by time.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub samples: Vec<TrajectorySample>,
}

impl Trajectory {
    pub fn new(mut samples: Vec<TrajectorySample>) -> Self {
        samples.sort_by(|a, b| a.accumulated_seconds.total_cmp(&b.accumulated_seconds));
        Self { samples }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn sample_at_time(&self, seconds: f32) -> Option<TrajectorySample> {
        self.sample_by(seconds, |sample| sample.accumulated_seconds)
    }

    /// Distance must be monotonic over the samples for the lookup to be meaningful.
    pub fn sample_at_distance(&self, distance: f32) -> Option<TrajectorySample> {
        self.sample_by(distance, |sample| sample.accumulated_distance)
    }

    fn sample_by(
        &self,
        value: f32,
        key: impl Fn(&TrajectorySample) -> f32,
    ) -> Option<TrajectorySample> {
        match self.samples.as_slice() {
            [] => None,
            [only] => Some(*only),
            samples => {
                let next = samples
                    .partition_point(|sample| key(sample) < value)
                    .clamp(1, samples.len() - 1);
                let (a, b) = (&samples[next - 1], &samples[next]);
                let span = key(b) - key(a);
                if span.abs() <= f32::EPSILON {
                    return Some(*b);
                }
                Some(a.lerp(b, (value - key(a)) / span))
            }
        }
    }
}

/// The pose currently playing, used by channels that read future features from the index.
#[derive(Clone, Copy, Debug)]
pub struct CurrentResult<'a> {
    pub index: &'a SearchIndex,
    pub pose_idx: usize,
}

/// Runtime state channels read when building a query.
#[derive(Clone, Copy, Debug)]
pub struct QueryBuildingContext<'a> {
    pub schema: &'a Schema,
    pub history: Option<&'a PoseHistory>,
    pub trajectory: Option<&'a Trajectory>,
    pub current_result: Option<CurrentResult<'a>>,
}

impl<'a> QueryBuildingContext<'a> {
    pub fn new(schema: &'a Schema) -> Self {
        Self {
            schema,
            history: None,
            trajectory: None,
            current_result: None,
        }
    }

    pub fn with_history(mut self, history: &'a PoseHistory) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_trajectory(mut self, trajectory: &'a Trajectory) -> Self {
        self.trajectory = Some(trajectory);
        self
    }

    pub fn with_current_result(mut self, index: &'a SearchIndex, pose_idx: usize) -> Self {
        self.current_result = Some(CurrentResult { index, pose_idx });
        self
    }
}

/// Runs every channel's query builder; true only if the schema is valid, `query` was
/// initialized for it and every channel succeeded.
pub fn build_query(ctx: &QueryBuildingContext<'_>, query: &mut FeatureVectorBuilder) -> bool {
    if !ctx.schema.is_valid() || !query.is_initialized_for_schema(ctx.schema) {
        return false;
    }
    query.reset_features();
    ctx.schema
        .channels()
        .iter()
        .fold(true, |complete, channel| {
            let built = channel.build_query(ctx, query);
            if !built {
                log::debug!("channel '{}' could not build its query features", channel.name());
            }
            complete & built
        })
}

/// Builds a query for `index` and returns it in the index's preprocessed space.
pub fn build_normalized_query(
    ctx: &QueryBuildingContext<'_>,
    index: &SearchIndex,
) -> Option<Vec<f32>> {
    let mut query = FeatureVectorBuilder::new(index.schema());
    let ctx = QueryBuildingContext {
        schema: index.schema().as_ref(),
        ..*ctx
    };
    if !build_query(&ctx, &mut query) || !query.normalize(index) {
        return None;
    }
    Some(query.normalized_values().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::channels::{ChannelConfig, TrajectoryChannelConfig};
    use crate::schema::SchemaConfig;
    use crate::skeleton::{Bone, Skeleton};
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    fn mk_sample(seconds: f32, x: f32) -> TrajectorySample {
        TrajectorySample {
            accumulated_seconds: seconds,
            accumulated_distance: x.abs(),
            transform: make_transform(Vector3::new(x, 0.0, 0.0), UnitQuaternion::identity()),
            linear_velocity: Vector3::new(1.0, 0.0, 0.0),
        }
    }

    fn mk_trajectory() -> Trajectory {
        Trajectory::new(vec![mk_sample(1.0, 1.0), mk_sample(0.0, 0.0), mk_sample(-1.0, -1.0)])
    }

    fn mk_schema() -> Arc<Schema> {
        let skeleton = Skeleton::new(vec![Bone {
            name: "root".into(),
            parent: None,
            reference: Transform::identity(),
        }])
        .unwrap();
        Arc::new(Schema::new(
            SchemaConfig {
                channels: vec![ChannelConfig::Trajectory(TrajectoryChannelConfig {
                    sample_offsets: vec![-0.5, 0.5],
                    use_facing_directions: false,
                    ..Default::default()
                })],
                ..Default::default()
            },
            Arc::new(skeleton),
        ))
    }

    #[test]
    fn trajectory_interpolates_and_extrapolates() {
        let trajectory = mk_trajectory();
        let mid = trajectory.sample_at_time(0.25).unwrap();
        assert_relative_eq!(mid.transform.translation.x, 0.25, epsilon = 1e-6);
        let ahead = trajectory.sample_at_time(2.0).unwrap();
        assert_relative_eq!(ahead.transform.translation.x, 2.0, epsilon = 1e-6);
        let behind = trajectory.sample_at_time(-1.5).unwrap();
        assert_relative_eq!(behind.transform.translation.x, -1.5, epsilon = 1e-6);
        assert!(Trajectory::default().sample_at_time(0.0).is_none());
    }

    #[test]
    fn trajectory_samples_by_distance() {
        let trajectory = Trajectory::new(vec![mk_sample(0.0, 0.0), mk_sample(1.0, 2.0)]);
        let sample = trajectory.sample_at_distance(1.0).unwrap();
        assert_relative_eq!(sample.accumulated_seconds, 0.5, epsilon = 1e-6);
    }

    #[test]
    fn builds_trajectory_query() {
        let schema = mk_schema();
        let trajectory = mk_trajectory();
        let mut query = FeatureVectorBuilder::new(&schema);
        let ctx = QueryBuildingContext::new(&schema).with_trajectory(&trajectory);
        assert!(build_query(&ctx, &mut query));
        assert!(query.is_complete());
        // position x of each subsample, velocities in between
        assert_relative_eq!(query.values()[0], -0.5, epsilon = 1e-6);
        assert_relative_eq!(query.values()[6], 0.5, epsilon = 1e-6);
    }

    #[test]
    fn missing_state_or_foreign_builder_fails() {
        let schema = mk_schema();
        let mut query = FeatureVectorBuilder::new(&schema);
        assert!(!build_query(&QueryBuildingContext::new(&schema), &mut query));

        let other = mk_schema();
        let trajectory = mk_trajectory();
        let ctx = QueryBuildingContext::new(&other).with_trajectory(&trajectory);
        assert!(!build_query(&ctx, &mut query));
    }
}
