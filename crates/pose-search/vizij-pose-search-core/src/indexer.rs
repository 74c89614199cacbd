//! Per-asset indexing: resolves sample times across lead-in, main and follow-up samplers and
//! runs every schema channel over the asset's poses.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::clip::AnnotationKind;
use crate::config::BlockTransitionParams;
use crate::feature_vector::FeatureVectorBuilder;
use crate::index::{PoseFlags, PoseMetadata};
use crate::math::{relative_transform, Transform, SMALL_NUMBER};
use crate::sampler::AssetSampler;
use crate::schema::Schema;
use crate::skeleton::MirrorTable;

/// Root distances at or below this never wrap, even on loopable assets.
const SMALL_ROOT_DISTANCE: f32 = 1.0;

/// Closed time range in seconds. `(0, 0)` selects the whole asset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingRange {
    pub min: f32,
    pub max: f32,
}

impl SamplingRange {
    pub const fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }

    #[inline]
    pub fn is_whole_asset(&self) -> bool {
        self.min == 0.0 && self.max == 0.0
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.max < self.min
    }
}

/// State shared by every indexer of one build.
#[derive(Clone, Debug)]
pub struct SamplingContext {
    pub mirror_table: Option<MirrorTable>,
    /// Step used for finite difference velocities.
    pub finite_delta: f32,
}

impl Default for SamplingContext {
    fn default() -> Self {
        Self {
            mirror_table: None,
            finite_delta: 1.0 / 60.0,
        }
    }
}

impl SamplingContext {
    pub fn mirror_transform(&self, transform: &Transform) -> Transform {
        match &self.mirror_table {
            Some(table) => table.mirror_transform(transform),
            None => *transform,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct IndexingContext<'a> {
    pub schema: &'a Arc<Schema>,
    pub sampling: &'a SamplingContext,
    pub main: &'a dyn AssetSampler,
    pub lead_in: Option<&'a dyn AssetSampler>,
    pub follow_up: Option<&'a dyn AssetSampler>,
    pub mirrored: bool,
    pub requested_range: SamplingRange,
    pub block_transition: BlockTransitionParams,
}

/// Where a (possibly out of range) sample time lands.
#[derive(Clone, Copy, Debug)]
pub struct SampleInfo<'a> {
    pub sampler: &'a dyn AssetSampler,
    /// Time local to `sampler`; outside the clip when `clamped`.
    pub clip_time: f32,
    /// Root transform relative to the start of the main asset.
    pub root_transform: Transform,
    pub root_distance: f32,
    /// The time fell outside a non-wrapping clip and was extrapolated.
    pub clamped: bool,
}

/// Result of resolving an offset against an extent.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct WrappedParam {
    pub wrapped: f32,
    pub num_cycles: u32,
    /// Remainder past the clamped value when wrapping is not allowed.
    pub extrapolation: f32,
}

/// Wraps `value` into `[0, extent]` when `can_wrap`, counting cycles; clamps otherwise and
/// reports what was cut off.
pub fn wrap_or_clamp(value: f32, extent: f32, can_wrap: bool) -> WrappedParam {
    let mut result = WrappedParam {
        wrapped: value,
        ..Default::default()
    };
    if can_wrap && extent > SMALL_NUMBER {
        if value < 0.0 {
            while result.wrapped < 0.0 {
                result.wrapped += extent;
                result.num_cycles += 1;
            }
        } else {
            while result.wrapped > extent {
                result.wrapped -= extent;
                result.num_cycles += 1;
            }
        }
    }
    let clamped = result.wrapped.clamp(0.0, extent.max(0.0));
    if clamped != result.wrapped {
        result.extrapolation = result.wrapped - clamped;
        result.wrapped = clamped;
    }
    result
}

/// Features and metadata produced by one indexer.
#[derive(Clone, Debug, Default)]
pub struct IndexedAsset {
    pub first_indexed_sample: i64,
    pub num_poses: usize,
    /// `num_poses × num_floats`, zeros for incomplete poses.
    pub values: Vec<f32>,
    pub metadata: Vec<PoseMetadata>,
    /// Channels that left at least one pose incomplete, ascending.
    pub invalid_channels: Vec<usize>,
}

impl IndexedAsset {
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.invalid_channels.is_empty()
    }
}

pub struct AssetIndexer<'a> {
    ctx: IndexingContext<'a>,
    first_indexed_sample: i64,
    last_indexed_sample: i64,
}

impl<'a> AssetIndexer<'a> {
    pub fn new(ctx: IndexingContext<'a>) -> Self {
        let rate = ctx.schema.sample_rate() as f32;
        let first_indexed_sample = (ctx.requested_range.min * rate).floor() as i64;
        let last_indexed_sample = ((ctx.requested_range.max * rate).ceil() as i64).max(0);
        Self {
            ctx,
            first_indexed_sample,
            last_indexed_sample,
        }
    }

    #[inline]
    pub fn context(&self) -> &IndexingContext<'a> {
        &self.ctx
    }

    #[inline]
    pub fn schema(&self) -> &Arc<Schema> {
        self.ctx.schema
    }

    #[inline]
    pub fn finite_delta(&self) -> f32 {
        self.ctx.sampling.finite_delta
    }

    #[inline]
    pub fn begin_sample_idx(&self) -> i64 {
        self.first_indexed_sample
    }

    #[inline]
    pub fn end_sample_idx(&self) -> i64 {
        self.last_indexed_sample + 1
    }

    #[inline]
    pub fn num_poses(&self) -> usize {
        (self.end_sample_idx() - self.begin_sample_idx()).max(0) as usize
    }

    /// Sample time of `sample_idx`, never past the end of the main asset.
    pub fn sample_time(&self, sample_idx: i64) -> f32 {
        (sample_idx as f32 * self.ctx.schema.sampling_interval()).min(self.ctx.main.play_length())
    }

    pub fn sample_info(&self, time: f32) -> SampleInfo<'a> {
        let main = self.ctx.main;
        let main_length = main.play_length();
        let main_can_wrap = main.is_loopable();

        let mut initial_transform = Transform::identity();
        let mut initial_distance = 0.0;

        let chained = match (self.ctx.lead_in, self.ctx.follow_up) {
            _ if main_can_wrap => None,
            (Some(lead_in), _) if time < 0.0 => {
                let param = wrap_or_clamp(
                    time + lead_in.play_length(),
                    lead_in.play_length(),
                    lead_in.is_loopable(),
                );
                if param.extrapolation < 0.0 {
                    initial_transform = lead_in.total_root_transform().inverse();
                    initial_distance = -lead_in.total_root_distance();
                }
                Some((lead_in, param))
            }
            (_, Some(follow_up)) if time > main_length => {
                let param = wrap_or_clamp(
                    time - main_length,
                    follow_up.play_length(),
                    follow_up.is_loopable(),
                );
                initial_transform = main.total_root_transform();
                initial_distance = main.total_root_distance();
                Some((follow_up, param))
            }
            _ => None,
        };

        let (sampler, param) = chained.unwrap_or_else(|| {
            let relative = if time < 0.0 && main_can_wrap {
                time + main_length
            } else {
                time
            };
            (main, wrap_or_clamp(relative, main_length, main_can_wrap))
        });

        if param.extrapolation.abs() > SMALL_NUMBER {
            let clip_time = param.wrapped + param.extrapolation;
            return SampleInfo {
                sampler,
                clip_time,
                root_transform: initial_transform * sampler.extract_root_transform(clip_time),
                root_distance: initial_distance + sampler.extract_root_distance(clip_time),
                clamped: true,
            };
        }

        let clip_time = param.wrapped;
        let last_transform = sampler.total_root_transform();
        let last_distance = sampler.total_root_distance();
        let mut remainder_transform = sampler.extract_root_transform(clip_time);
        let mut remainder_distance = sampler.extract_root_distance(clip_time);
        let (cycle_transform, cycle_distance) = if time < 0.0 {
            remainder_transform = relative_transform(&remainder_transform, &last_transform);
            remainder_distance = -(last_distance - remainder_distance);
            (last_transform.inverse(), -last_distance)
        } else {
            (last_transform, last_distance)
        };

        let mut root_transform = initial_transform;
        let mut root_distance = initial_distance;
        for _ in 0..param.num_cycles {
            root_transform *= cycle_transform;
            root_distance += cycle_distance;
        }
        SampleInfo {
            sampler,
            clip_time,
            root_transform: root_transform * remainder_transform,
            root_distance: root_distance + remainder_distance,
            clamped: false,
        }
    }

    /// Sample info with the root expressed relative to `origin`'s root.
    pub fn sample_info_relative(&self, time: f32, origin: &SampleInfo<'_>) -> SampleInfo<'a> {
        let mut sample = self.sample_info(time);
        sample.root_transform = relative_transform(&sample.root_transform, &origin.root_transform);
        sample.root_distance = origin.root_distance - sample.root_distance;
        sample
    }

    /// Time (relative to the main asset) at which the accumulated root distance reaches
    /// `distance`.
    pub fn sample_time_from_distance(&self, distance: f32) -> f32 {
        let can_wrap = |sampler: &dyn AssetSampler| {
            sampler.is_loopable() && sampler.total_root_distance() > SMALL_ROOT_DISTANCE
        };
        let main = self.ctx.main;
        let main_total = main.total_root_distance();
        let main_can_wrap = can_wrap(main);

        match (self.ctx.lead_in, self.ctx.follow_up) {
            _ if main_can_wrap => {}
            (Some(lead_in), _) if distance < 0.0 => {
                let total = lead_in.total_root_distance();
                let param = wrap_or_clamp(distance + total, total, can_wrap(lead_in));
                let clip_time = lead_in.time_from_root_distance(param.wrapped + param.extrapolation);
                let length = lead_in.play_length();
                return -(param.num_cycles as f32 * length + (length - clip_time));
            }
            (_, Some(follow_up)) if distance > main_total => {
                let total = follow_up.total_root_distance();
                let param = wrap_or_clamp(distance - main_total, total, can_wrap(follow_up));
                let clip_time =
                    follow_up.time_from_root_distance(param.wrapped + param.extrapolation);
                return main.play_length()
                    + param.num_cycles as f32 * follow_up.play_length()
                    + clip_time;
            }
            _ => {}
        }

        let relative = if distance < 0.0 && main_can_wrap {
            distance + main_total
        } else {
            distance
        };
        let param = wrap_or_clamp(relative, main_total, main_can_wrap);
        let clip_time = main.time_from_root_distance(param.wrapped + param.extrapolation);
        let length = main.play_length();
        match (main_can_wrap, distance < 0.0) {
            (true, true) => -(param.num_cycles as f32 * length + (length - clip_time)),
            (true, false) => param.num_cycles as f32 * length + clip_time,
            (false, _) => clip_time,
        }
    }

    /// Component space pose of `sample`, rooted at its accumulated root transform.
    pub fn component_pose(&self, sample: &SampleInfo<'_>) -> Vec<Transform> {
        let pose = sample.sampler.extract_pose(sample.clip_time);
        self.ctx
            .schema
            .skeleton()
            .to_component_space(&pose)
            .into_iter()
            .map(|component| sample.root_transform * component)
            .collect()
    }

    /// Bone transform from a component pose, taken from the mirrored bone when indexing the
    /// mirrored copy of the asset.
    pub fn bone_transform(&self, component_pose: &[Transform], bone_idx: usize) -> Transform {
        match (&self.ctx.sampling.mirror_table, self.ctx.mirrored) {
            (Some(table), true) => {
                let source = table.mirror_bone(bone_idx);
                let transform = component_pose
                    .get(source)
                    .copied()
                    .unwrap_or_else(Transform::identity);
                table.mirror_bone_transform(&transform, source, bone_idx)
            }
            _ => component_pose
                .get(bone_idx)
                .copied()
                .unwrap_or_else(Transform::identity),
        }
    }

    pub fn mirror_transform(&self, transform: &Transform) -> Transform {
        if self.ctx.mirrored {
            self.ctx.sampling.mirror_transform(transform)
        } else {
            *transform
        }
    }

    fn pose_metadata(&self, sample_idx: i64) -> PoseMetadata {
        let main = self.ctx.main;
        let time = self.sample_time(sample_idx);
        let range = self.ctx.requested_range;
        let margins = self.ctx.block_transition;

        let mut metadata = PoseMetadata::default();
        if !main.is_loopable()
            && (time < range.min + margins.sequence_start_interval
                || time > range.max - margins.sequence_end_interval)
        {
            metadata.flags.insert(PoseFlags::BLOCK_TRANSITION);
        }
        for annotation in main.extract_annotations(time) {
            match annotation.kind {
                AnnotationKind::BlockTransition => {
                    metadata.flags.insert(PoseFlags::BLOCK_TRANSITION)
                }
                AnnotationKind::ModifyCost { cost_addend } => metadata.cost_addend = cost_addend,
                AnnotationKind::ExcludeFromDatabase => {}
            }
        }
        metadata
    }

    /// Runs every channel over the asset and checks that each pose received every feature.
    pub fn process(&self) -> IndexedAsset {
        let schema = self.ctx.schema;
        let num_floats = schema.layout.num_floats;
        let num_poses = self.num_poses();

        let mut vectors: Vec<FeatureVectorBuilder> =
            (0..num_poses).map(|_| FeatureVectorBuilder::new(schema)).collect();
        for channel in schema.channels() {
            channel.index_asset(self, &mut vectors);
        }

        let mut invalid_channels: Vec<usize> = Vec::new();
        let mut values = vec![0.0; num_floats * num_poses];
        for (pose_idx, vector) in vectors.iter().enumerate() {
            if vector.is_complete() {
                values[pose_idx * num_floats..(pose_idx + 1) * num_floats]
                    .copy_from_slice(vector.values());
                continue;
            }
            for (feature_idx, feature) in schema.layout.features.iter().enumerate() {
                if !vector.is_feature_added(feature_idx)
                    && !invalid_channels.contains(&feature.channel_idx)
                {
                    invalid_channels.push(feature.channel_idx);
                }
            }
        }
        invalid_channels.sort_unstable();

        let metadata = (self.begin_sample_idx()..self.end_sample_idx())
            .map(|sample_idx| self.pose_metadata(sample_idx))
            .collect();

        IndexedAsset {
            first_indexed_sample: self.first_indexed_sample,
            num_poses,
            values,
            metadata,
            invalid_channels,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{ChannelConfig, PoseChannelConfig, TrajectoryChannelConfig};
    use crate::clip::{AnimationClip, BakedClip};
    use crate::math::make_transform;
    use crate::sampler::SequenceSampler;
    use crate::schema::SchemaConfig;
    use crate::skeleton::{Bone, Skeleton};
    use approx::assert_relative_eq;
    use nalgebra::{UnitQuaternion, Vector3};

    fn mk_skeleton() -> Arc<Skeleton> {
        Arc::new(
            Skeleton::new(vec![
                Bone {
                    name: "root".into(),
                    parent: None,
                    reference: Transform::identity(),
                },
                Bone {
                    name: "foot".into(),
                    parent: Some(0),
                    reference: make_transform(Vector3::new(0.2, 0.0, 0.0), UnitQuaternion::identity()),
                },
            ])
            .unwrap(),
        )
    }

    fn mk_sampler(seconds: f32, speed: f32, looping: bool) -> SequenceSampler {
        let frame_rate = 30.0;
        let frames = (seconds * frame_rate).round() as usize + 1;
        let skeleton = mk_skeleton();
        let clip: Arc<dyn AnimationClip> = Arc::new(BakedClip {
            name: "walk".into(),
            frame_rate,
            frames: vec![skeleton.reference_pose(); frames],
            root_track: (0..frames)
                .map(|i| {
                    make_transform(
                        Vector3::new(0.0, speed * i as f32 / frame_rate, 0.0),
                        UnitQuaternion::identity(),
                    )
                })
                .collect(),
            annotations: Vec::new(),
        });
        SequenceSampler::new(clip, looping, Default::default())
    }

    fn mk_schema(channels: Vec<ChannelConfig>) -> Arc<Schema> {
        Arc::new(Schema::new(
            SchemaConfig {
                sample_rate: 10,
                channels,
                ..Default::default()
            },
            mk_skeleton(),
        ))
    }

    fn mk_context<'a>(
        schema: &'a Arc<Schema>,
        sampling: &'a SamplingContext,
        main: &'a dyn AssetSampler,
        range: SamplingRange,
    ) -> IndexingContext<'a> {
        IndexingContext {
            schema,
            sampling,
            main,
            lead_in: None,
            follow_up: None,
            mirrored: false,
            requested_range: range,
            block_transition: BlockTransitionParams::default(),
        }
    }

    #[test]
    fn wrap_or_clamp_loops_or_extrapolates() {
        assert_eq!(
            wrap_or_clamp(2.5, 2.0, true),
            WrappedParam {
                wrapped: 0.5,
                num_cycles: 1,
                extrapolation: 0.0
            }
        );
        assert_eq!(
            wrap_or_clamp(2.5, 2.0, false),
            WrappedParam {
                wrapped: 2.0,
                num_cycles: 0,
                extrapolation: 0.5
            }
        );
        let backwards = wrap_or_clamp(-0.5, 2.0, true);
        assert_eq!(backwards.num_cycles, 1);
        assert_relative_eq!(backwards.wrapped, 1.5);
    }

    #[test]
    fn sample_info_accumulates_cycles_on_loops() {
        let schema = mk_schema(vec![ChannelConfig::Trajectory(Default::default())]);
        let sampling = SamplingContext::default();
        let sampler = mk_sampler(1.0, 2.0, true);
        let indexer = AssetIndexer::new(mk_context(&schema, &sampling, &sampler, SamplingRange::new(0.0, 1.0)));

        let ahead = indexer.sample_info(2.25);
        assert!(!ahead.clamped);
        assert_relative_eq!(ahead.clip_time, 0.25, epsilon = 1e-5);
        assert_relative_eq!(ahead.root_transform.translation.vector.y, 4.5, epsilon = 1e-3);
        assert_relative_eq!(ahead.root_distance, 4.5, epsilon = 1e-3);

        let behind = indexer.sample_info(-0.25);
        assert_relative_eq!(behind.root_transform.translation.vector.y, -0.5, epsilon = 1e-3);
        assert_relative_eq!(behind.root_distance, -0.5, epsilon = 1e-3);
    }

    #[test]
    fn sample_info_chains_follow_up_and_extrapolates_main() {
        let schema = mk_schema(vec![ChannelConfig::Trajectory(Default::default())]);
        let sampling = SamplingContext::default();
        let main = mk_sampler(1.0, 2.0, false);
        let follow_up = mk_sampler(1.0, 4.0, false);
        let mut ctx = mk_context(&schema, &sampling, &main, SamplingRange::new(0.0, 1.0));

        let extrapolated = AssetIndexer::new(ctx).sample_info(1.5);
        assert!(extrapolated.clamped);
        assert_relative_eq!(extrapolated.root_transform.translation.vector.y, 3.0, epsilon = 1e-3);

        ctx.follow_up = Some(&follow_up);
        let chained = AssetIndexer::new(ctx).sample_info(1.5);
        assert!(!chained.clamped);
        assert_eq!(chained.sampler.play_length(), follow_up.play_length());
        assert_relative_eq!(chained.clip_time, 0.5, epsilon = 1e-5);
        assert_relative_eq!(chained.root_transform.translation.vector.y, 4.0, epsilon = 1e-3);
        assert_relative_eq!(chained.root_distance, 4.0, epsilon = 1e-3);
    }

    #[test]
    fn time_from_distance_inverts_root_distance() {
        let schema = mk_schema(vec![ChannelConfig::Trajectory(Default::default())]);
        let sampling = SamplingContext::default();
        let sampler = mk_sampler(1.0, 2.0, true);
        let indexer = AssetIndexer::new(mk_context(&schema, &sampling, &sampler, SamplingRange::new(0.0, 1.0)));
        assert_relative_eq!(indexer.sample_time_from_distance(1.0), 0.5, epsilon = 1e-3);
        assert_relative_eq!(indexer.sample_time_from_distance(5.0), 2.5, epsilon = 1e-3);
        assert_relative_eq!(indexer.sample_time_from_distance(-1.0), -0.5, epsilon = 1e-3);
    }

    #[test]
    fn process_fills_every_pose_and_blocks_clip_end() {
        let schema = mk_schema(vec![
            ChannelConfig::Trajectory(TrajectoryChannelConfig {
                sample_offsets: vec![0.0, 0.3],
                ..Default::default()
            }),
            ChannelConfig::Pose(PoseChannelConfig {
                sampled_bones: vec!["foot".into()],
                ..Default::default()
            }),
        ]);
        let sampling = SamplingContext::default();
        let sampler = mk_sampler(1.0, 2.0, false);
        let indexer = AssetIndexer::new(mk_context(&schema, &sampling, &sampler, SamplingRange::new(0.0, 1.0)));
        let output = indexer.process();

        assert!(output.is_complete());
        assert_eq!(output.num_poses, 11);
        assert_eq!(output.values.len(), 11 * schema.layout.num_floats);
        assert!(!output.metadata[0].is_block_transition());
        assert!(output.metadata[9].is_block_transition());
        assert!(output.metadata[10].is_block_transition());
    }

    #[test]
    fn process_reports_channel_with_unresolved_bone() {
        let schema = mk_schema(vec![
            ChannelConfig::Trajectory(Default::default()),
            ChannelConfig::Pose(PoseChannelConfig {
                sampled_bones: vec!["tail".into()],
                ..Default::default()
            }),
        ]);
        let sampling = SamplingContext::default();
        let sampler = mk_sampler(1.0, 2.0, false);
        let indexer = AssetIndexer::new(mk_context(&schema, &sampling, &sampler, SamplingRange::new(0.0, 0.5)));
        let output = indexer.process();
        assert_eq!(output.invalid_channels, vec![1]);
        assert!(output.values.iter().all(|&v| v == 0.0));
    }
}
