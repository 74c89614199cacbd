//! Animation sources consumed by the indexer: single clips and parametric blend spaces,
//! plus clip-local annotations.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

use crate::math::{blend_transforms, hash_transform, relative_transform, SMALL_NUMBER, Transform};
use crate::skeleton::Pose;

/// Half-width of the window used when querying annotations at a time.
pub const ANNOTATION_QUERY_HALF_WINDOW: f32 = 1.0 / 240.0;

/// Rate at which clips without a frame list are sampled for content hashing.
const CONTENT_HASH_SAMPLE_RATE: f32 = 60.0;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnnotationKind {
    /// Interval is removed from the sampled range.
    ExcludeFromDatabase,
    /// Poses in the interval cannot be selected.
    BlockTransition,
    /// Adds a constant to the cost of poses in the interval.
    ModifyCost { cost_addend: f32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    #[serde(flatten)]
    pub kind: AnnotationKind,
    pub trigger_time: f32,
    pub end_time: f32,
}

impl Annotation {
    #[inline]
    pub fn is_active_at(&self, time: f32) -> bool {
        self.trigger_time <= time && time <= self.end_time
    }

    #[inline]
    pub fn overlaps(&self, start: f32, end: f32) -> bool {
        self.trigger_time <= end && self.end_time >= start
    }
}

/// Annotations overlapping a small window centred on `time` and active at `time`.
pub fn annotations_at(annotations: &[Annotation], time: f32) -> Vec<Annotation> {
    let (start, end) = (
        time - ANNOTATION_QUERY_HALF_WINDOW,
        time + ANNOTATION_QUERY_HALF_WINDOW,
    );
    annotations
        .iter()
        .filter(|annotation| annotation.overlaps(start, end) && annotation.is_active_at(time))
        .copied()
        .collect()
}

fn hash_annotations(annotations: &[Annotation], state: &mut DefaultHasher) {
    annotations.len().hash(state);
    for annotation in annotations {
        match annotation.kind {
            AnnotationKind::ExcludeFromDatabase => 0u8.hash(state),
            AnnotationKind::BlockTransition => 1u8.hash(state),
            AnnotationKind::ModifyCost { cost_addend } => {
                2u8.hash(state);
                cost_addend.to_bits().hash(state);
            }
        }
        annotation.trigger_time.to_bits().hash(state);
        annotation.end_time.to_bits().hash(state);
    }
}

/// Root motion over `[start, start + delta]`, wrapping through the clip when `looping`.
pub fn accumulate_root_motion(
    play_length: f32,
    start: f32,
    delta: f32,
    looping: bool,
    motion_from_range: impl Fn(f32, f32) -> Transform,
) -> Transform {
    if !looping || play_length <= SMALL_NUMBER {
        let end = (start + delta).clamp(0.0, play_length.max(0.0));
        return motion_from_range(start.clamp(0.0, play_length.max(0.0)), end);
    }

    let mut accumulated = Transform::identity();
    let mut current = start.clamp(0.0, play_length);
    let mut remaining = delta;
    while remaining.abs() > SMALL_NUMBER {
        let segment_end = if remaining > 0.0 {
            (current + remaining).min(play_length)
        } else {
            (current + remaining).max(0.0)
        };
        accumulated *= motion_from_range(current, segment_end);
        remaining -= segment_end - current;
        current = segment_end;
        if remaining > SMALL_NUMBER && current >= play_length {
            current = 0.0;
        } else if remaining < -SMALL_NUMBER && current <= 0.0 {
            current = play_length;
        }
    }
    accumulated
}

/// A single animation clip.
pub trait AnimationClip: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn play_length(&self) -> f32;

    /// Local-space pose with the root bone at its root-motion-free transform.
    fn extract_pose(&self, time: f32, looping: bool) -> Pose;

    /// Root track transform at `time` (clamped into the clip).
    fn root_track_transform(&self, time: f32) -> Transform;

    fn annotations(&self) -> &[Annotation] {
        &[]
    }

    fn extract_root_motion_from_range(&self, start: f32, end: f32) -> Transform {
        relative_transform(
            &self.root_track_transform(end),
            &self.root_track_transform(start),
        )
    }

    fn extract_root_motion(&self, start: f32, delta: f32, looping: bool) -> Transform {
        accumulate_root_motion(self.play_length(), start, delta, looping, |a, b| {
            self.extract_root_motion_from_range(a, b)
        })
    }

    /// Feeds everything that shapes sampled poses into `state`. The default samples the
    /// clip at a fixed rate; clips holding their frames should hash them directly.
    fn hash_content(&self, state: &mut DefaultHasher) {
        self.name().hash(state);
        let length = self.play_length();
        length.to_bits().hash(state);
        let num_samples = (length.max(0.0) * CONTENT_HASH_SAMPLE_RATE).ceil() as usize + 1;
        for sample in 0..num_samples {
            let time = (sample as f32 / CONTENT_HASH_SAMPLE_RATE).min(length.max(0.0));
            for local in &self.extract_pose(time, false).local {
                hash_transform(local, state);
            }
            hash_transform(&self.root_track_transform(time), state);
        }
        hash_annotations(self.annotations(), state);
    }
}

/// Clip baked at a fixed frame rate.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BakedClip {
    pub name: String,
    pub frame_rate: f32,
    pub frames: Vec<Pose>,
    /// Root track, one transform per frame.
    pub root_track: Vec<Transform>,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
}

impl BakedClip {
    fn frame_position(&self, time: f32, num_frames: usize, looping: bool) -> (usize, usize, f32) {
        if num_frames < 2 {
            return (0, 0, 0.0);
        }
        let length = self.play_length();
        let time = if looping && length > SMALL_NUMBER {
            time.rem_euclid(length)
        } else {
            time.clamp(0.0, length)
        };
        let position = time * self.frame_rate;
        let frame = (position.floor() as usize).min(num_frames - 1);
        let next = (frame + 1).min(num_frames - 1);
        (frame, next, position - frame as f32)
    }
}

impl AnimationClip for BakedClip {
    fn name(&self) -> &str {
        &self.name
    }

    fn play_length(&self) -> f32 {
        if self.frame_rate <= 0.0 || self.frames.len() < 2 {
            return 0.0;
        }
        (self.frames.len() - 1) as f32 / self.frame_rate
    }

    fn extract_pose(&self, time: f32, looping: bool) -> Pose {
        let (frame, next, alpha) = self.frame_position(time, self.frames.len(), looping);
        match (self.frames.get(frame), self.frames.get(next)) {
            (Some(a), Some(b)) => Pose::blend(a, b, alpha),
            _ => Pose::default(),
        }
    }

    fn root_track_transform(&self, time: f32) -> Transform {
        let (frame, next, alpha) = self.frame_position(time, self.root_track.len(), false);
        match (self.root_track.get(frame), self.root_track.get(next)) {
            (Some(a), Some(b)) => blend_transforms(a, b, alpha),
            _ => Transform::identity(),
        }
    }

    fn annotations(&self) -> &[Annotation] {
        &self.annotations
    }

    fn hash_content(&self, state: &mut DefaultHasher) {
        self.name.hash(state);
        self.frame_rate.to_bits().hash(state);
        self.frames.len().hash(state);
        for frame in &self.frames {
            frame.local.len().hash(state);
            for local in &frame.local {
                hash_transform(local, state);
            }
        }
        self.root_track.len().hash(state);
        for root in &self.root_track {
            hash_transform(root, state);
        }
        hash_annotations(&self.annotations, state);
    }
}

/// One blend space axis.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlendParameter {
    pub min: f32,
    pub max: f32,
    /// Number of grid divisions along the axis.
    pub grid_num: usize,
}

impl Default for BlendParameter {
    fn default() -> Self {
        Self {
            min: 0.0,
            max: 0.0,
            grid_num: 1,
        }
    }
}

#[derive(Clone, Debug)]
pub struct BlendSample {
    pub clip: Arc<dyn AnimationClip>,
    pub weight: f32,
}

/// A parametric blend of clips.
pub trait BlendSpace: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn is_1d(&self) -> bool;

    /// `axis` is 0 (horizontal) or 1 (vertical).
    fn blend_parameter(&self, axis: usize) -> BlendParameter;

    /// Normalized weights for the clips contributing at `parameters`.
    fn blend_samples(&self, parameters: Vector2<f32>) -> Vec<BlendSample>;

    /// Weighted clip length.
    fn play_length(&self, parameters: Vector2<f32>) -> f32 {
        self.blend_samples(parameters)
            .iter()
            .map(|sample| sample.clip.play_length() * sample.weight)
            .sum()
    }

    /// Feeds everything that shapes sampled poses into `state`. The default walks the
    /// parameter grid and hashes the contributing clips with their weights.
    fn hash_content(&self, state: &mut DefaultHasher) {
        self.name().hash(state);
        self.is_1d().hash(state);
        let horizontal = self.blend_parameter(0);
        let vertical = self.blend_parameter(1);
        for axis in [horizontal, vertical] {
            axis.min.to_bits().hash(state);
            axis.max.to_bits().hash(state);
            axis.grid_num.hash(state);
        }
        let at = |axis: BlendParameter, idx: usize| {
            let cells = axis.grid_num.max(1);
            axis.min + (axis.max - axis.min) * idx as f32 / cells as f32
        };
        for h in 0..=horizontal.grid_num.max(1) {
            for v in 0..=vertical.grid_num.max(1) {
                for sample in self.blend_samples(Vector2::new(at(horizontal, h), at(vertical, v))) {
                    sample.weight.to_bits().hash(state);
                    sample.clip.hash_content(state);
                }
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct GridBlendSample {
    pub position: Vector2<f32>,
    pub clip: Arc<dyn AnimationClip>,
}

/// Blend space with clips placed at arbitrary parameter positions, weighted by inverse
/// squared distance.
#[derive(Clone, Debug)]
pub struct GridBlendSpace {
    pub name: String,
    pub horizontal: BlendParameter,
    /// `None` for 1D blend spaces.
    pub vertical: Option<BlendParameter>,
    pub samples: Vec<GridBlendSample>,
}

impl BlendSpace for GridBlendSpace {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_1d(&self) -> bool {
        self.vertical.is_none()
    }

    fn blend_parameter(&self, axis: usize) -> BlendParameter {
        match axis {
            0 => self.horizontal,
            _ => self.vertical.unwrap_or_default(),
        }
    }

    fn hash_content(&self, state: &mut DefaultHasher) {
        self.name.hash(state);
        for axis in [Some(self.horizontal), self.vertical] {
            axis.is_some().hash(state);
            if let Some(axis) = axis {
                axis.min.to_bits().hash(state);
                axis.max.to_bits().hash(state);
                axis.grid_num.hash(state);
            }
        }
        self.samples.len().hash(state);
        for sample in &self.samples {
            sample.position.x.to_bits().hash(state);
            sample.position.y.to_bits().hash(state);
            sample.clip.hash_content(state);
        }
    }

    fn blend_samples(&self, parameters: Vector2<f32>) -> Vec<BlendSample> {
        let parameters = if self.is_1d() {
            Vector2::new(parameters.x, 0.0)
        } else {
            parameters
        };
        let distance = |sample: &GridBlendSample| {
            let mut position = sample.position;
            if self.is_1d() {
                position.y = 0.0;
            }
            (position - parameters).norm_squared()
        };

        if let Some(exact) = self.samples.iter().find(|s| distance(s) <= SMALL_NUMBER) {
            return vec![BlendSample {
                clip: exact.clip.clone(),
                weight: 1.0,
            }];
        }

        let inverse: Vec<f32> = self.samples.iter().map(|s| 1.0 / distance(s)).collect();
        let total: f32 = inverse.iter().sum();
        if total <= SMALL_NUMBER {
            return Vec::new();
        }
        self.samples
            .iter()
            .zip(inverse)
            .map(|(sample, w)| BlendSample {
                clip: sample.clip.clone(),
                weight: w / total,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::make_transform;
    use nalgebra::{UnitQuaternion, Vector3};

    fn mk_clip(name: &str, frames: usize, speed: f32) -> BakedClip {
        let frame_rate = 30.0;
        let root_track = (0..frames)
            .map(|i| {
                make_transform(
                    Vector3::new(0.0, speed * i as f32 / frame_rate, 0.0),
                    UnitQuaternion::identity(),
                )
            })
            .collect();
        BakedClip {
            name: name.into(),
            frame_rate,
            frames: vec![Pose::new(vec![Transform::identity()]); frames],
            root_track,
            annotations: vec![Annotation {
                kind: AnnotationKind::ModifyCost { cost_addend: 2.0 },
                trigger_time: 0.2,
                end_time: 0.4,
            }],
        }
    }

    #[test]
    fn baked_clip_length_and_root_motion() {
        let clip = mk_clip("walk", 31, 2.0);
        assert!((clip.play_length() - 1.0).abs() < 1e-6);
        let motion = clip.extract_root_motion_from_range(0.25, 0.75);
        assert!((motion.translation.vector.y - 1.0).abs() < 1e-4);
    }

    #[test]
    fn looping_root_motion_wraps() {
        let clip = mk_clip("walk", 31, 2.0);
        let motion = clip.extract_root_motion(0.5, 1.0, true);
        assert!((motion.translation.vector.y - 2.0).abs() < 1e-4);
        let clamped = clip.extract_root_motion(0.5, 1.0, false);
        assert!((clamped.translation.vector.y - 1.0).abs() < 1e-4);
        let backwards = clip.extract_root_motion(0.5, -1.0, true);
        assert!((backwards.translation.vector.y + 2.0).abs() < 1e-4);
    }

    #[test]
    fn annotations_respect_interval() {
        let clip = mk_clip("walk", 31, 2.0);
        assert_eq!(annotations_at(clip.annotations(), 0.3).len(), 1);
        assert!(annotations_at(clip.annotations(), 0.5).is_empty());
        let text = serde_json::to_string(&clip.annotations[0]).unwrap();
        assert!(text.contains("modify_cost"));
    }

    #[test]
    fn grid_blend_space_weights_are_normalized() {
        let slow: Arc<dyn AnimationClip> = Arc::new(mk_clip("slow", 31, 1.0));
        let fast: Arc<dyn AnimationClip> = Arc::new(mk_clip("fast", 16, 3.0));
        let space = GridBlendSpace {
            name: "locomotion".into(),
            horizontal: BlendParameter {
                min: 0.0,
                max: 1.0,
                grid_num: 2,
            },
            vertical: None,
            samples: vec![
                GridBlendSample {
                    position: Vector2::new(0.0, 0.0),
                    clip: slow,
                },
                GridBlendSample {
                    position: Vector2::new(1.0, 0.0),
                    clip: fast,
                },
            ],
        };
        let samples = space.blend_samples(Vector2::new(0.5, 3.0));
        let total: f32 = samples.iter().map(|s| s.weight).sum();
        assert!((total - 1.0).abs() < 1e-6);
        assert!((space.play_length(Vector2::new(0.5, 0.0)) - 0.75).abs() < 1e-5);
        assert_eq!(space.blend_samples(Vector2::new(1.0, 0.0)).len(), 1);
    }
}
