//! Asset samplers: pose, root motion and root distance at arbitrary (possibly out of range)
//! times for sequences and blend spaces.

use std::fmt;
use std::sync::Arc;

use nalgebra::Vector2;

use crate::clip::{accumulate_root_motion, annotations_at, Annotation, AnimationClip, BlendSpace};
use crate::config::ExtrapolationParams;
use crate::math::{
    blend_transforms, blend_weighted, extrapolate_root_motion, relative_transform, Transform,
    SMALL_NUMBER,
};
use crate::skeleton::Pose;

/// Rate of the accumulated root distance table.
pub const ROOT_DISTANCE_SAMPLE_RATE: f32 = 60.0;
/// Rate of the precomputed blend space root track.
pub const ROOT_TRANSFORM_SAMPLE_RATE: f32 = 60.0;

pub trait AssetSampler: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn play_length(&self) -> f32;

    fn is_loopable(&self) -> bool;

    fn extract_pose(&self, time: f32) -> Pose;

    /// Root transform relative to the start of the asset; extrapolated outside the clip
    /// unless the asset loops.
    fn extract_root_transform(&self, time: f32) -> Transform;

    fn extract_annotations(&self, time: f32) -> Vec<Annotation>;

    /// Root motion over the whole asset.
    fn total_root_transform(&self) -> Transform;

    fn root_distances(&self) -> &RootDistanceTable;

    fn extrapolation(&self) -> &ExtrapolationParams;

    fn total_root_distance(&self) -> f32 {
        self.root_distances().total()
    }

    fn extract_root_distance(&self, time: f32) -> f32 {
        self.root_distances()
            .distance_at(time, self.play_length(), self.extrapolation())
    }

    fn time_from_root_distance(&self, distance: f32) -> f32 {
        self.root_distances().time_from_distance(distance)
    }
}

/// Monotonic table of accumulated root translation sampled at [`ROOT_DISTANCE_SAMPLE_RATE`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RootDistanceTable {
    distances: Vec<f32>,
    play_length: f32,
}

impl RootDistanceTable {
    pub fn build(play_length: f32, root_at: impl Fn(f32) -> Transform) -> Self {
        let play_length = play_length.max(0.0);
        let num_samples = (play_length * ROOT_DISTANCE_SAMPLE_RATE).ceil() as usize + 1;
        let mut distances = Vec::with_capacity(num_samples);
        let mut accumulated = 0.0f64;
        let mut last = root_at(0.0);
        for idx in 0..num_samples {
            let time = (idx as f32 / ROOT_DISTANCE_SAMPLE_RATE).min(play_length);
            let current = root_at(time);
            accumulated += relative_transform(&current, &last).translation.vector.norm() as f64;
            distances.push(accumulated as f32);
            last = current;
        }
        Self {
            distances,
            play_length,
        }
    }

    #[inline]
    pub fn distances(&self) -> &[f32] {
        &self.distances
    }

    #[inline]
    pub fn total(&self) -> f32 {
        self.distances.last().copied().unwrap_or(0.0)
    }

    /// Inverse of [`Self::distance_at`] within the table; distances past either end clamp.
    pub fn time_from_distance(&self, distance: f32) -> f32 {
        let num = self.distances.len();
        if num < 2 {
            return 0.0;
        }
        let (mut prev, mut next) = (0, 1);
        if distance > 0.0 {
            next = self
                .distances
                .partition_point(|&d| d < distance)
                .min(num - 1)
                .max(1);
            prev = next - 1;
        }
        let (lo, hi) = (self.distances[prev], self.distances[next]);
        let alpha = if hi - lo > SMALL_NUMBER {
            ((distance - lo) / (hi - lo)).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let time = (next as f32 - (1.0 - alpha)) / ROOT_DISTANCE_SAMPLE_RATE;
        time.min(self.play_length)
    }

    /// Accumulated distance at `time`, extended linearly past the clip at the boundary
    /// speed when that speed exceeds the linear threshold.
    pub fn distance_at(&self, time: f32, play_length: f32, params: &ExtrapolationParams) -> f32 {
        let num = self.distances.len();
        if num == 0 {
            return 0.0;
        }
        let clamped = time.clamp(0.0, play_length.max(0.0));
        let extrapolation_time = time - clamped;

        let position = clamped * ROOT_DISTANCE_SAMPLE_RATE;
        let idx = (position.floor() as usize).min(num - 1);
        let next = (idx + 1).min(num - 1);
        let alpha = position - position.floor();
        let mut distance =
            self.distances[idx] + (self.distances[next] - self.distances[idx]) * alpha;

        if extrapolation_time != 0.0 && num >= 2 {
            let edge = if extrapolation_time > 0.0 { num - 1 } else { 1 };
            let mut speed =
                (self.distances[edge] - self.distances[edge - 1]) * ROOT_DISTANCE_SAMPLE_RATE;
            if speed < params.linear_speed_threshold {
                speed = 0.0;
            }
            distance += speed * extrapolation_time;
        }
        distance
    }
}

/// Shared root transform logic: wrap when looping, otherwise extrapolate past either end.
fn extrapolated_root_transform(
    play_length: f32,
    looping: bool,
    time: f32,
    params: &ExtrapolationParams,
    motion: impl Fn(f32, f32, bool) -> Transform,
    motion_from_range: impl Fn(f32, f32) -> Transform,
) -> Transform {
    if looping {
        return motion(0.0, time, true);
    }
    let clamped = time.clamp(0.0, play_length);
    let extrapolation_time = time - clamped;
    let sample_time = params.sample_time.min(play_length);

    if extrapolation_time < -SMALL_NUMBER {
        let sample = motion_from_range(0.0, sample_time);
        return extrapolate_root_motion(sample, 0.0, sample_time, extrapolation_time, params);
    }

    let mut root = motion_from_range(0.0, clamped);
    if extrapolation_time > SMALL_NUMBER {
        let sample_start = play_length - sample_time;
        let sample = motion_from_range(sample_start, play_length);
        root *= extrapolate_root_motion(
            sample,
            sample_start,
            play_length,
            extrapolation_time,
            params,
        );
    }
    root
}

#[derive(Debug)]
pub struct SequenceSampler {
    clip: Arc<dyn AnimationClip>,
    looping: bool,
    extrapolation: ExtrapolationParams,
    root_distances: RootDistanceTable,
    total_root_transform: Transform,
}

impl SequenceSampler {
    pub fn new(clip: Arc<dyn AnimationClip>, looping: bool, extrapolation: ExtrapolationParams) -> Self {
        let play_length = clip.play_length();
        let root_distances =
            RootDistanceTable::build(play_length, |time| clip.root_track_transform(time));
        let total_root_transform = clip.extract_root_motion_from_range(0.0, play_length);
        Self {
            clip,
            looping,
            extrapolation,
            root_distances,
            total_root_transform,
        }
    }
}

impl AssetSampler for SequenceSampler {
    fn name(&self) -> &str {
        self.clip.name()
    }

    fn play_length(&self) -> f32 {
        self.clip.play_length()
    }

    fn is_loopable(&self) -> bool {
        self.looping
    }

    fn extract_pose(&self, time: f32) -> Pose {
        self.clip.extract_pose(time, self.looping)
    }

    fn extract_root_transform(&self, time: f32) -> Transform {
        extrapolated_root_transform(
            self.clip.play_length(),
            self.looping,
            time,
            &self.extrapolation,
            |start, delta, looping| self.clip.extract_root_motion(start, delta, looping),
            |start, end| self.clip.extract_root_motion_from_range(start, end),
        )
    }

    fn extract_annotations(&self, time: f32) -> Vec<Annotation> {
        annotations_at(self.clip.annotations(), time)
    }

    fn total_root_transform(&self) -> Transform {
        self.total_root_transform
    }

    fn root_distances(&self) -> &RootDistanceTable {
        &self.root_distances
    }

    fn extrapolation(&self) -> &ExtrapolationParams {
        &self.extrapolation
    }
}

/// Blend space evaluated at fixed blend parameters. Clips are time-scaled to the
/// weighted play length.
#[derive(Debug)]
pub struct BlendSpaceSampler {
    blend_space: Arc<dyn BlendSpace>,
    parameters: Vector2<f32>,
    looping: bool,
    extrapolation: ExtrapolationParams,
    play_length: f32,
    root_times: Vec<f32>,
    accumulated_root: Vec<Transform>,
    root_distances: RootDistanceTable,
}

impl BlendSpaceSampler {
    pub fn new(
        blend_space: Arc<dyn BlendSpace>,
        parameters: Vector2<f32>,
        looping: bool,
        extrapolation: ExtrapolationParams,
    ) -> Self {
        let play_length = blend_space.play_length(parameters).max(0.0);
        let samples = blend_space.blend_samples(parameters);

        let num_samples = (play_length * ROOT_TRANSFORM_SAMPLE_RATE).ceil() as usize + 1;
        let root_times: Vec<f32> = (0..num_samples)
            .map(|idx| (idx as f32 / ROOT_TRANSFORM_SAMPLE_RATE).min(play_length))
            .collect();
        let mut accumulated_root = Vec::with_capacity(num_samples);
        accumulated_root.push(Transform::identity());
        for idx in 1..num_samples {
            let (previous, current) = (root_times[idx - 1], root_times[idx]);
            let deltas: Vec<(Transform, f32)> = samples
                .iter()
                .map(|sample| {
                    let scale = time_scale(sample.clip.play_length(), play_length);
                    let delta = sample.clip.extract_root_motion(
                        previous * scale,
                        (current - previous) * scale,
                        looping,
                    );
                    (delta, sample.weight)
                })
                .collect();
            let step = blend_weighted(&deltas);
            accumulated_root.push(accumulated_root[idx - 1] * step);
        }

        let mut sampler = Self {
            blend_space,
            parameters,
            looping,
            extrapolation,
            play_length,
            root_times,
            accumulated_root,
            root_distances: RootDistanceTable::default(),
        };
        sampler.root_distances =
            RootDistanceTable::build(play_length, |time| sampler.track_transform(time));
        sampler
    }

    #[inline]
    pub fn parameters(&self) -> Vector2<f32> {
        self.parameters
    }

    fn track_transform(&self, time: f32) -> Transform {
        let num = self.accumulated_root.len();
        let position = (time * ROOT_TRANSFORM_SAMPLE_RATE).max(0.0);
        let idx = (position.floor() as usize).min(num - 1);
        let next = (idx + 1).min(num - 1);
        let span = self.root_times[next] - self.root_times[idx];
        let alpha = if span > SMALL_NUMBER {
            ((time - self.root_times[idx]) / span).clamp(0.0, 1.0)
        } else {
            0.0
        };
        blend_transforms(&self.accumulated_root[idx], &self.accumulated_root[next], alpha)
    }

    fn motion_from_range(&self, start: f32, end: f32) -> Transform {
        relative_transform(&self.track_transform(end), &self.track_transform(start))
    }

    fn motion(&self, start: f32, delta: f32, looping: bool) -> Transform {
        accumulate_root_motion(self.play_length, start, delta, looping, |a, b| {
            self.motion_from_range(a, b)
        })
    }
}

fn time_scale(clip_length: f32, play_length: f32) -> f32 {
    if play_length > SMALL_NUMBER {
        clip_length / play_length
    } else {
        0.0
    }
}

impl AssetSampler for BlendSpaceSampler {
    fn name(&self) -> &str {
        self.blend_space.name()
    }

    fn play_length(&self) -> f32 {
        self.play_length
    }

    fn is_loopable(&self) -> bool {
        self.looping
    }

    fn extract_pose(&self, time: f32) -> Pose {
        let poses: Vec<(Pose, f32)> = self
            .blend_space
            .blend_samples(self.parameters)
            .iter()
            .map(|sample| {
                let scale = time_scale(sample.clip.play_length(), self.play_length);
                (sample.clip.extract_pose(time * scale, self.looping), sample.weight)
            })
            .collect();
        Pose::blend_weighted(&poses)
    }

    fn extract_root_transform(&self, time: f32) -> Transform {
        extrapolated_root_transform(
            self.play_length,
            self.looping,
            time,
            &self.extrapolation,
            |start, delta, looping| self.motion(start, delta, looping),
            |start, end| self.motion_from_range(start, end),
        )
    }

    /// Annotations of the highest weighted clip.
    fn extract_annotations(&self, time: f32) -> Vec<Annotation> {
        let samples = self.blend_space.blend_samples(self.parameters);
        let Some(dominant) = samples
            .iter()
            .max_by(|a, b| a.weight.total_cmp(&b.weight))
        else {
            return Vec::new();
        };
        let scale = time_scale(dominant.clip.play_length(), self.play_length);
        annotations_at(dominant.clip.annotations(), time * scale)
    }

    fn total_root_transform(&self) -> Transform {
        self.accumulated_root
            .last()
            .copied()
            .unwrap_or_else(Transform::identity)
    }

    fn root_distances(&self) -> &RootDistanceTable {
        &self.root_distances
    }

    fn extrapolation(&self) -> &ExtrapolationParams {
        &self.extrapolation
    }
}
