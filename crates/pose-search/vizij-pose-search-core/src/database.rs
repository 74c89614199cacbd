//! Pose search database: configuration, source assets and the enumeration of indexable
//! asset descriptors.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

use crate::clip::{AnimationClip, AnnotationKind, BlendSpace};
use crate::config::{BlockTransitionParams, ExtrapolationParams, PoseSearchMode, SearchSettings};
use crate::error::{PoseSearchError, Result};
use crate::index::{AssetDescriptor, AssetKind};
use crate::math::hash_transform;
use crate::indexer::{SamplingContext, SamplingRange};
use crate::schema::{Schema, SchemaConfig};
use crate::skeleton::{MirrorData, MirrorTable, Skeleton};
use crate::weights::WeightParams;

/// Bumped whenever indexing output changes for identical inputs.
pub const INDEX_BUILDER_VERSION: u32 = 2;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MirrorOption {
    #[default]
    UnmirroredOnly,
    MirroredOnly,
    UnmirroredAndMirrored,
}

impl MirrorOption {
    #[inline]
    pub fn includes_unmirrored(self) -> bool {
        matches!(self, Self::UnmirroredOnly | Self::UnmirroredAndMirrored)
    }

    #[inline]
    pub fn includes_mirrored(self) -> bool {
        matches!(self, Self::MirroredOnly | Self::UnmirroredAndMirrored)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    pub tag: String,
    /// Assets tagged with this group are searched with `weights` in their own partition.
    pub use_group_weights: bool,
    pub weights: WeightParams,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub schema: SchemaConfig,
    pub default_weights: WeightParams,
    pub extrapolation: ExtrapolationParams,
    pub block_transition: BlockTransitionParams,
    /// Added to the cost of poses whose mirroring differs from the requested one.
    pub mirroring_mismatch_cost: f32,
    pub pose_search_mode: PoseSearchMode,
    pub number_of_principal_components: usize,
    pub kdtree_max_leaf_size: usize,
    pub kdtree_query_num_neighbors: usize,
    pub groups: Vec<GroupConfig>,
    pub mirror_data: Option<MirrorData>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            schema: SchemaConfig::default(),
            default_weights: WeightParams::default(),
            extrapolation: ExtrapolationParams::default(),
            block_transition: BlockTransitionParams::default(),
            mirroring_mismatch_cost: 0.0,
            pose_search_mode: PoseSearchMode::PcaKdTree,
            number_of_principal_components: 4,
            kdtree_max_leaf_size: 8,
            kdtree_query_num_neighbors: 100,
            groups: Vec::new(),
            mirror_data: None,
        }
    }
}

impl DatabaseConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// One clip of the database, optionally chained to lead-in and follow-up clips.
#[derive(Clone, Debug)]
pub struct SequenceSource {
    pub clip: Arc<dyn AnimationClip>,
    pub looping: bool,
    /// `(0, 0)` samples the whole clip.
    pub sampling_range: SamplingRange,
    pub lead_in: Option<Arc<dyn AnimationClip>>,
    pub lead_in_looping: bool,
    pub follow_up: Option<Arc<dyn AnimationClip>>,
    pub follow_up_looping: bool,
    pub mirror_option: MirrorOption,
    pub group_tags: Vec<String>,
}

impl SequenceSource {
    pub fn new(clip: Arc<dyn AnimationClip>) -> Self {
        Self {
            clip,
            looping: false,
            sampling_range: SamplingRange::default(),
            lead_in: None,
            lead_in_looping: false,
            follow_up: None,
            follow_up_looping: false,
            mirror_option: MirrorOption::default(),
            group_tags: Vec::new(),
        }
    }

    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    pub fn with_range(mut self, min: f32, max: f32) -> Self {
        self.sampling_range = SamplingRange::new(min, max);
        self
    }

    pub fn with_mirror_option(mut self, mirror_option: MirrorOption) -> Self {
        self.mirror_option = mirror_option;
        self
    }

    pub fn with_group_tag(mut self, tag: impl Into<String>) -> Self {
        self.group_tags.push(tag.into());
        self
    }

    pub fn with_lead_in(mut self, clip: Arc<dyn AnimationClip>, looping: bool) -> Self {
        self.lead_in = Some(clip);
        self.lead_in_looping = looping;
        self
    }

    pub fn with_follow_up(mut self, clip: Arc<dyn AnimationClip>, looping: bool) -> Self {
        self.follow_up = Some(clip);
        self.follow_up_looping = looping;
        self
    }
}

/// A blend space sampled over a grid of blend parameters.
#[derive(Clone, Debug)]
pub struct BlendSpaceSource {
    pub blend_space: Arc<dyn BlendSpace>,
    pub looping: bool,
    pub mirror_option: MirrorOption,
    pub group_tags: Vec<String>,
    /// Sample at the blend space's own grid instead of the sample counts below.
    pub use_grid_for_sampling: bool,
    pub number_of_horizontal_samples: usize,
    pub number_of_vertical_samples: usize,
}

impl BlendSpaceSource {
    pub fn new(blend_space: Arc<dyn BlendSpace>) -> Self {
        Self {
            blend_space,
            looping: false,
            mirror_option: MirrorOption::default(),
            group_tags: Vec::new(),
            use_grid_for_sampling: false,
            number_of_horizontal_samples: 9,
            number_of_vertical_samples: 2,
        }
    }

    /// Blend parameters to sample, horizontal-major.
    pub fn parameter_grid(&self) -> Vec<Vector2<f32>> {
        let horizontal = self.blend_space.blend_parameter(0);
        let vertical = self.blend_space.blend_parameter(1);
        let (num_horizontal, mut num_vertical) = if self.use_grid_for_sampling {
            (horizontal.grid_num + 1, vertical.grid_num + 1)
        } else {
            (
                self.number_of_horizontal_samples.max(1),
                self.number_of_vertical_samples.max(1),
            )
        };
        let (mut vertical_min, mut vertical_max) = (vertical.min, vertical.max);
        if self.blend_space.is_1d() {
            num_vertical = 1;
            vertical_min = 0.0;
            vertical_max = 0.0;
        }

        let axis = |idx: usize, num: usize, min: f32, max: f32| {
            if num > 1 {
                min + (max - min) * idx as f32 / (num - 1) as f32
            } else {
                min
            }
        };
        let mut grid = Vec::with_capacity(num_horizontal * num_vertical);
        for h in 0..num_horizontal {
            for v in 0..num_vertical {
                grid.push(Vector2::new(
                    axis(h, num_horizontal, horizontal.min, horizontal.max),
                    axis(v, num_vertical, vertical_min, vertical_max),
                ));
            }
        }
        grid
    }
}

/// `(0, 0)` selects the whole clip; otherwise the upper bound is clamped to the clip.
pub fn effective_sampling_range(play_length: f32, requested: SamplingRange) -> SamplingRange {
    if requested.is_whole_asset() {
        SamplingRange::new(0.0, play_length)
    } else {
        SamplingRange::new(requested.min, requested.max.min(play_length))
    }
}

/// Parts of `range` not covered by `[cut_min, cut_max]`.
fn range_difference(range: SamplingRange, cut_min: f32, cut_max: f32) -> Vec<SamplingRange> {
    if cut_max < range.min || cut_min > range.max {
        return vec![range];
    }
    let mut parts = Vec::with_capacity(2);
    if range.min < cut_min {
        parts.push(SamplingRange::new(range.min, cut_min));
    }
    if cut_max < range.max {
        parts.push(SamplingRange::new(cut_max, range.max));
    }
    parts
}

/// The effective sampling range of `sequence` minus every excluded annotation interval.
pub fn find_valid_sequence_intervals(sequence: &SequenceSource) -> Vec<SamplingRange> {
    let effective = effective_sampling_range(sequence.clip.play_length(), sequence.sampling_range);
    let mut valid = vec![effective];
    for annotation in sequence.clip.annotations() {
        if annotation.kind != AnnotationKind::ExcludeFromDatabase {
            continue;
        }
        // splitting may grow the list, so walk it from the back
        for range_idx in (0..valid.len()).rev() {
            let range = valid.remove(range_idx);
            valid.extend(range_difference(range, annotation.trigger_time, annotation.end_time));
        }
    }
    valid.sort_by(|a, b| a.min.total_cmp(&b.min));
    valid
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AssetEnumeration {
    /// Sorted by group; pose ranges are assigned when the index is built.
    pub descriptors: Vec<AssetDescriptor>,
    /// `(asset kind, source asset idx, tag)` of tags that matched no group.
    pub bad_group_tags: Vec<(AssetKind, usize, String)>,
}

#[derive(Debug, Clone)]
pub struct PoseSearchDatabase {
    pub config: DatabaseConfig,
    schema: Arc<Schema>,
    pub sequences: Vec<SequenceSource>,
    pub blend_spaces: Vec<BlendSpaceSource>,
}

impl PoseSearchDatabase {
    pub fn new(config: DatabaseConfig, skeleton: Arc<Skeleton>) -> Self {
        let schema = Arc::new(Schema::new(config.schema.clone(), skeleton));
        Self {
            config,
            schema,
            sequences: Vec::new(),
            blend_spaces: Vec::new(),
        }
    }

    pub fn with_sequence(mut self, sequence: SequenceSource) -> Self {
        self.sequences.push(sequence);
        self
    }

    pub fn with_blend_space(mut self, blend_space: BlendSpaceSource) -> Self {
        self.blend_spaces.push(blend_space);
        self
    }

    #[inline]
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Rebuilds the schema after `config.schema` changed.
    pub fn initialize_schema(&mut self) {
        self.schema = Arc::new(Schema::new(
            self.config.schema.clone(),
            self.schema.skeleton().clone(),
        ));
    }

    /// Principal components actually kept, never more than the layout's dimensionality.
    pub fn number_of_principal_components(&self) -> usize {
        self.config
            .number_of_principal_components
            .min(self.schema.layout.num_floats)
    }

    pub fn search_settings(&self) -> SearchSettings {
        SearchSettings {
            mode: self.config.pose_search_mode,
            kdtree_query_num_neighbors: self.config.kdtree_query_num_neighbors,
            mirroring_mismatch_cost: self.config.mirroring_mismatch_cost,
        }
    }

    pub fn sampling_context(&self) -> SamplingContext {
        SamplingContext {
            mirror_table: self
                .config
                .mirror_data
                .as_ref()
                .map(|data| MirrorTable::new(self.schema.skeleton(), data)),
            ..Default::default()
        }
    }

    pub fn is_valid_for_indexing(&self) -> Result<()> {
        self.schema.validate()?;
        if self.sequences.is_empty() && self.blend_spaces.is_empty() {
            return Err(PoseSearchError::NoSources);
        }
        if let Some(sequence_idx) = self
            .sequences
            .iter()
            .position(|sequence| sequence.clip.play_length() <= 0.0)
        {
            return Err(PoseSearchError::MissingClip { sequence_idx });
        }
        if self.config.kdtree_max_leaf_size == 0 {
            return Err(PoseSearchError::InvalidConfig {
                field: "kdtree_max_leaf_size".into(),
                value: "0".into(),
            });
        }
        Ok(())
    }

    /// Hash of everything that influences the built index.
    pub fn content_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        INDEX_BUILDER_VERSION.hash(&mut hasher);
        serde_json::to_string(&self.config)
            .unwrap_or_default()
            .hash(&mut hasher);
        for bone in self.schema.skeleton().bones() {
            bone.name.hash(&mut hasher);
            bone.parent.hash(&mut hasher);
            hash_transform(&bone.reference, &mut hasher);
        }
        for sequence in &self.sequences {
            sequence.clip.hash_content(&mut hasher);
            for chained in [&sequence.lead_in, &sequence.follow_up] {
                chained.is_some().hash(&mut hasher);
                if let Some(clip) = chained {
                    clip.hash_content(&mut hasher);
                }
            }
            (sequence.looping, sequence.lead_in_looping, sequence.follow_up_looping)
                .hash(&mut hasher);
            sequence.sampling_range.min.to_bits().hash(&mut hasher);
            sequence.sampling_range.max.to_bits().hash(&mut hasher);
            sequence.mirror_option.hash(&mut hasher);
            sequence.group_tags.hash(&mut hasher);
        }
        for source in &self.blend_spaces {
            source.blend_space.hash_content(&mut hasher);
            source.looping.hash(&mut hasher);
            source.mirror_option.hash(&mut hasher);
            source.group_tags.hash(&mut hasher);
            source.use_grid_for_sampling.hash(&mut hasher);
            source.number_of_horizontal_samples.hash(&mut hasher);
            source.number_of_vertical_samples.hash(&mut hasher);
        }
        hasher.finish()
    }

    /// Groups `tags` resolve to. Tags without a group are reported through `bad_tags`;
    /// groups that don't use their own weights fold into the ungrouped set.
    pub fn collect_group_indices(
        &self,
        tags: &[String],
        mut bad_tags: impl FnMut(&str),
    ) -> Vec<Option<usize>> {
        let mut indices = Vec::new();
        for tag in tags {
            match self.config.groups.iter().position(|group| &group.tag == tag) {
                None => bad_tags(tag),
                Some(group_idx) if self.config.groups[group_idx].use_group_weights => {
                    if !indices.contains(&Some(group_idx)) {
                        indices.push(Some(group_idx));
                    }
                }
                Some(_) => {}
            }
        }
        if indices.is_empty() {
            indices.push(None);
        }
        indices
    }

    /// One descriptor per (asset, group, valid range or blend parameter, mirror option).
    pub fn enumerate_assets(&self) -> Result<AssetEnumeration> {
        let sampling_interval = self.schema.sampling_interval();
        let mut enumeration = AssetEnumeration::default();
        let mut any_mirrored = false;

        let mut push = |descriptors: &mut Vec<AssetDescriptor>, template: AssetDescriptor, option: MirrorOption| {
            if option.includes_unmirrored() {
                descriptors.push(template.clone());
            }
            if option.includes_mirrored() {
                descriptors.push(AssetDescriptor {
                    mirrored: true,
                    ..template
                });
                any_mirrored = true;
            }
        };

        for (sequence_idx, sequence) in self.sequences.iter().enumerate() {
            let groups = self.collect_group_indices(&sequence.group_tags, |tag| {
                enumeration
                    .bad_group_tags
                    .push((AssetKind::Sequence, sequence_idx, tag.to_string()))
            });
            let ranges = find_valid_sequence_intervals(sequence);
            if ranges.is_empty() {
                log::warn!(
                    "sequence '{}' has no sampling range left after exclusions",
                    sequence.clip.name()
                );
            }
            for group_idx in groups {
                for range in &ranges {
                    let template = AssetDescriptor {
                        kind: AssetKind::Sequence,
                        source_asset_idx: sequence_idx,
                        group_idx,
                        mirrored: false,
                        looping: sequence.looping,
                        sampling_range: *range,
                        sampling_interval,
                        blend_parameters: Vector2::zeros(),
                        first_pose_idx: 0,
                        num_poses: 0,
                    };
                    push(&mut enumeration.descriptors, template, sequence.mirror_option);
                }
            }
        }

        for (blend_space_idx, source) in self.blend_spaces.iter().enumerate() {
            let groups = self.collect_group_indices(&source.group_tags, |tag| {
                enumeration
                    .bad_group_tags
                    .push((AssetKind::BlendSpace, blend_space_idx, tag.to_string()))
            });
            let grid = source.parameter_grid();
            for group_idx in groups {
                for parameters in &grid {
                    let play_length = source.blend_space.play_length(*parameters);
                    let template = AssetDescriptor {
                        kind: AssetKind::BlendSpace,
                        source_asset_idx: blend_space_idx,
                        group_idx,
                        mirrored: false,
                        looping: source.looping,
                        sampling_range: SamplingRange::new(0.0, play_length),
                        sampling_interval,
                        blend_parameters: *parameters,
                        first_pose_idx: 0,
                        num_poses: 0,
                    };
                    push(&mut enumeration.descriptors, template, source.mirror_option);
                }
            }
        }

        if any_mirrored && self.config.mirror_data.is_none() {
            let asset = enumeration
                .descriptors
                .iter()
                .find(|descriptor| descriptor.mirrored)
                .map(|descriptor| self.asset_name(descriptor).to_string())
                .unwrap_or_default();
            log::error!("database requests mirrored asset '{asset}' but has no mirror data");
            return Err(PoseSearchError::MissingMirrorData { asset });
        }

        for (kind, idx, tag) in &enumeration.bad_group_tags {
            log::warn!("{kind:?} {idx} asks for group '{tag}' which does not exist");
        }

        // None sorts first
        enumeration.descriptors.sort_by_key(|descriptor| descriptor.group_idx);
        Ok(enumeration)
    }

    pub fn asset_name(&self, descriptor: &AssetDescriptor) -> &str {
        match descriptor.kind {
            AssetKind::Sequence => self
                .sequences
                .get(descriptor.source_asset_idx)
                .map_or("", |sequence| sequence.clip.name()),
            AssetKind::BlendSpace => self
                .blend_spaces
                .get(descriptor.source_asset_idx)
                .map_or("", |source| source.blend_space.name()),
        }
    }

    /// Group tags of the source asset behind `descriptor`.
    pub fn asset_tags(&self, descriptor: &AssetDescriptor) -> &[String] {
        match descriptor.kind {
            AssetKind::Sequence => self
                .sequences
                .get(descriptor.source_asset_idx)
                .map_or(&[][..], |sequence| sequence.group_tags.as_slice()),
            AssetKind::BlendSpace => self
                .blend_spaces
                .get(descriptor.source_asset_idx)
                .map_or(&[][..], |source| source.group_tags.as_slice()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{ChannelConfig, TrajectoryChannelConfig};
    use crate::clip::{Annotation, BakedClip, BlendParameter, GridBlendSample, GridBlendSpace};
    use crate::math::{make_transform, Transform};
    use crate::skeleton::{Bone, Pose};
    use nalgebra::{UnitQuaternion, Vector3};

    fn mk_skeleton() -> Arc<Skeleton> {
        Arc::new(
            Skeleton::new(vec![Bone {
                name: "root".into(),
                parent: None,
                reference: Transform::identity(),
            }])
            .unwrap(),
        )
    }

    fn mk_clip(name: &str, annotations: Vec<Annotation>) -> Arc<dyn AnimationClip> {
        Arc::new(BakedClip {
            name: name.into(),
            frame_rate: 10.0,
            frames: vec![Pose::new(vec![Transform::identity()]); 21],
            root_track: vec![Transform::identity(); 21],
            annotations,
        })
    }

    fn mk_config() -> DatabaseConfig {
        DatabaseConfig {
            schema: SchemaConfig {
                channels: vec![ChannelConfig::Trajectory(TrajectoryChannelConfig::default())],
                ..Default::default()
            },
            groups: vec![
                GroupConfig {
                    tag: "idle".into(),
                    use_group_weights: true,
                    ..Default::default()
                },
                GroupConfig {
                    tag: "shared".into(),
                    use_group_weights: false,
                    ..Default::default()
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn effective_range_defaults_to_whole_clip() {
        let whole = effective_sampling_range(2.0, SamplingRange::default());
        assert_eq!(whole, SamplingRange::new(0.0, 2.0));
        let clamped = effective_sampling_range(2.0, SamplingRange::new(0.5, 3.0));
        assert_eq!(clamped, SamplingRange::new(0.5, 2.0));
    }

    #[test]
    fn exclusions_split_the_sampled_range() {
        let exclude = |a, b| Annotation {
            kind: AnnotationKind::ExcludeFromDatabase,
            trigger_time: a,
            end_time: b,
        };
        let sequence = SequenceSource::new(mk_clip(
            "walk",
            vec![exclude(0.5, 0.7), exclude(1.2, 1.4), exclude(1.9, 3.0)],
        ));
        let ranges = find_valid_sequence_intervals(&sequence);
        assert_eq!(
            ranges,
            vec![
                SamplingRange::new(0.0, 0.5),
                SamplingRange::new(0.7, 1.2),
                SamplingRange::new(1.4, 1.9),
            ]
        );
    }

    #[test]
    fn enumeration_sorts_by_group_and_reports_bad_tags() {
        let database = PoseSearchDatabase::new(mk_config(), mk_skeleton())
            .with_sequence(SequenceSource::new(mk_clip("idle", vec![])).with_group_tag("idle"))
            .with_sequence(SequenceSource::new(mk_clip("walk", vec![])).with_group_tag("shared"))
            .with_sequence(SequenceSource::new(mk_clip("run", vec![])).with_group_tag("missing"));
        let enumeration = database.enumerate_assets().unwrap();
        let groups: Vec<_> = enumeration.descriptors.iter().map(|d| d.group_idx).collect();
        assert_eq!(groups, vec![None, None, Some(0)]);
        assert_eq!(enumeration.descriptors[0].source_asset_idx, 1);
        assert_eq!(
            enumeration.bad_group_tags,
            vec![(AssetKind::Sequence, 2, "missing".to_string())]
        );
    }

    #[test]
    fn mirrored_assets_require_mirror_data() {
        let mut database = PoseSearchDatabase::new(mk_config(), mk_skeleton()).with_sequence(
            SequenceSource::new(mk_clip("walk", vec![]))
                .with_mirror_option(MirrorOption::UnmirroredAndMirrored),
        );
        assert!(matches!(
            database.enumerate_assets(),
            Err(PoseSearchError::MissingMirrorData { .. })
        ));
        database.config.mirror_data = Some(MirrorData::default());
        let enumeration = database.enumerate_assets().unwrap();
        let mirrored: Vec<_> = enumeration.descriptors.iter().map(|d| d.mirrored).collect();
        assert_eq!(mirrored, vec![false, true]);
    }

    #[test]
    fn blend_space_grid_spans_parameters() {
        let clip = mk_clip("walk", vec![]);
        let space = GridBlendSpace {
            name: "strafe".into(),
            horizontal: BlendParameter {
                min: -1.0,
                max: 1.0,
                grid_num: 4,
            },
            vertical: None,
            samples: vec![GridBlendSample {
                position: Vector2::new(0.0, 0.0),
                clip,
            }],
        };
        let mut source = BlendSpaceSource::new(Arc::new(space));
        source.number_of_horizontal_samples = 3;
        let grid = source.parameter_grid();
        assert_eq!(grid.len(), 3);
        assert_eq!(grid[0], Vector2::new(-1.0, 0.0));
        assert_eq!(grid[2], Vector2::new(1.0, 0.0));
        source.use_grid_for_sampling = true;
        assert_eq!(source.parameter_grid().len(), 5);
    }

    #[test]
    fn validity_and_hash() {
        let empty = PoseSearchDatabase::new(mk_config(), mk_skeleton());
        assert_eq!(empty.is_valid_for_indexing(), Err(PoseSearchError::NoSources));
        let clip = mk_clip("walk", vec![]);
        let a = PoseSearchDatabase::new(mk_config(), mk_skeleton())
            .with_sequence(SequenceSource::new(clip.clone()));
        assert!(a.is_valid_for_indexing().is_ok());
        let mut b = a.clone();
        assert_eq!(a.content_hash(), b.content_hash());
        b.config.mirroring_mismatch_cost = 3.0;
        assert_ne!(a.content_hash(), b.content_hash());
        assert_eq!(a.number_of_principal_components(), 4);
    }

    #[test]
    fn hash_follows_content_not_allocation() {
        let a = PoseSearchDatabase::new(mk_config(), mk_skeleton())
            .with_sequence(SequenceSource::new(mk_clip("walk", vec![])));
        // same frames in a fresh allocation
        let b = PoseSearchDatabase::new(mk_config(), mk_skeleton())
            .with_sequence(SequenceSource::new(mk_clip("walk", vec![])));
        assert_eq!(a.content_hash(), b.content_hash());

        let mut frames = vec![Pose::new(vec![Transform::identity()]); 21];
        frames[10].local[0] = make_transform(Vector3::new(0.0, 0.0, 0.1), UnitQuaternion::identity());
        let edited: Arc<dyn AnimationClip> = Arc::new(BakedClip {
            name: "walk".into(),
            frame_rate: 10.0,
            frames,
            root_track: vec![Transform::identity(); 21],
            annotations: Vec::new(),
        });
        let c = PoseSearchDatabase::new(mk_config(), mk_skeleton())
            .with_sequence(SequenceSource::new(edited));
        assert_ne!(a.content_hash(), c.content_hash());

        let annotated = PoseSearchDatabase::new(mk_config(), mk_skeleton()).with_sequence(
            SequenceSource::new(mk_clip(
                "walk",
                vec![Annotation {
                    kind: AnnotationKind::BlockTransition,
                    trigger_time: 0.5,
                    end_time: 1.0,
                }],
            )),
        );
        assert_ne!(a.content_hash(), annotated.content_hash());
    }

    #[test]
    fn hash_covers_bone_references() {
        let skeleton = Arc::new(
            Skeleton::new(vec![Bone {
                name: "root".into(),
                parent: None,
                reference: make_transform(
                    Vector3::zeros(),
                    UnitQuaternion::from_axis_angle(&Vector3::z_axis(), 0.7),
                ),
            }])
            .unwrap(),
        );
        let clip = mk_clip("walk", vec![]);
        let a = PoseSearchDatabase::new(mk_config(), mk_skeleton())
            .with_sequence(SequenceSource::new(clip.clone()));
        let b = PoseSearchDatabase::new(mk_config(), skeleton)
            .with_sequence(SequenceSource::new(clip));
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn config_loads_from_json() {
        let config = DatabaseConfig::from_json(
            r#"{ "pose_search_mode": "brute_force", "groups": [{ "tag": "idle" }] }"#,
        )
        .unwrap();
        assert_eq!(config.pose_search_mode, PoseSearchMode::BruteForce);
        assert_eq!(config.kdtree_query_num_neighbors, 100);
        assert!(!config.groups[0].use_group_weights);
    }
}
