//! Index build: sampler preparation, parallel asset indexing, merge, preprocessing and
//! per-group acceleration data.

use std::sync::Arc;

use hashbrown::HashMap;
use nalgebra::Vector2;
use rayon::prelude::*;

use crate::clip::{AnimationClip, BlendSpace};
use crate::config::{ExtrapolationParams, PoseSearchMode};
use crate::database::PoseSearchDatabase;
use crate::error::{PoseSearchError, Result};
use crate::index::{AssetDescriptor, AssetKind, GroupSearchIndex, SearchIndex};
use crate::indexer::{AssetIndexer, IndexedAsset, IndexingContext, SamplingContext};
use crate::kdtree::KdTree;
use crate::math::KINDA_SMALL_NUMBER;
use crate::pca::PcaProjection;
use crate::preprocess::preprocess;
use crate::sampler::{AssetSampler, BlendSpaceSampler, SequenceSampler};
use crate::weights::WeightsContext;

/// Neighbours inspected when checking that every indexed point finds itself.
const VALIDATION_NUM_NEIGHBORS: usize = 10;

/// Outcome of a build that always produces an index.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BuildReport {
    /// Channels that failed to write every feature of some pose.
    pub invalid_channels: Vec<usize>,
    pub bad_group_tags: Vec<(AssetKind, usize, String)>,
    pub num_samplers: usize,
    pub num_assets: usize,
    pub num_poses: usize,
    /// Acceleration self-checks that failed (validate mode only).
    pub validation_failures: usize,
}

impl BuildReport {
    #[inline]
    pub fn is_success(&self) -> bool {
        self.invalid_channels.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum SamplerKey {
    Clip(usize),
    BlendSpace(usize, [u32; 2]),
}

fn clip_key(clip: &Arc<dyn AnimationClip>) -> SamplerKey {
    SamplerKey::Clip(Arc::as_ptr(clip) as *const () as usize)
}

fn blend_space_key(blend_space: &Arc<dyn BlendSpace>, parameters: Vector2<f32>) -> SamplerKey {
    SamplerKey::BlendSpace(
        Arc::as_ptr(blend_space) as *const () as usize,
        [parameters.x.to_bits(), parameters.y.to_bits()],
    )
}

enum SamplerJob {
    Sequence {
        clip: Arc<dyn AnimationClip>,
        looping: bool,
    },
    BlendSpace {
        blend_space: Arc<dyn BlendSpace>,
        parameters: Vector2<f32>,
        looping: bool,
    },
}

impl SamplerJob {
    fn run(self, extrapolation: ExtrapolationParams) -> Box<dyn AssetSampler> {
        match self {
            SamplerJob::Sequence { clip, looping } => {
                Box::new(SequenceSampler::new(clip, looping, extrapolation))
            }
            SamplerJob::BlendSpace {
                blend_space,
                parameters,
                looping,
            } => Box::new(BlendSpaceSampler::new(
                blend_space,
                parameters,
                looping,
                extrapolation,
            )),
        }
    }
}

/// Samplers shared by every descriptor referencing the same clip or blend point.
struct SamplerSet {
    samplers: Vec<Box<dyn AssetSampler>>,
    lookup: HashMap<SamplerKey, usize>,
}

impl SamplerSet {
    fn prepare(database: &PoseSearchDatabase, descriptors: &[AssetDescriptor]) -> Self {
        let mut lookup = HashMap::new();
        let mut jobs = Vec::new();
        let mut add = |key: SamplerKey, job: SamplerJob| {
            if !lookup.contains_key(&key) {
                lookup.insert(key, jobs.len());
                jobs.push(job);
            }
        };

        for sequence in &database.sequences {
            let chained = [
                Some((&sequence.clip, sequence.looping)),
                sequence.lead_in.as_ref().map(|clip| (clip, sequence.lead_in_looping)),
                sequence
                    .follow_up
                    .as_ref()
                    .map(|clip| (clip, sequence.follow_up_looping)),
            ];
            for (clip, looping) in chained.into_iter().flatten() {
                add(
                    clip_key(clip),
                    SamplerJob::Sequence {
                        clip: clip.clone(),
                        looping,
                    },
                );
            }
        }
        for descriptor in descriptors.iter().filter(|d| d.is_blend_space()) {
            let Some(source) = database.blend_spaces.get(descriptor.source_asset_idx) else {
                continue;
            };
            add(
                blend_space_key(&source.blend_space, descriptor.blend_parameters),
                SamplerJob::BlendSpace {
                    blend_space: source.blend_space.clone(),
                    parameters: descriptor.blend_parameters,
                    looping: source.looping,
                },
            );
        }

        let extrapolation = database.config.extrapolation;
        let samplers = jobs
            .into_par_iter()
            .map(|job| job.run(extrapolation))
            .collect();
        Self { samplers, lookup }
    }

    fn get(&self, key: SamplerKey) -> Option<&dyn AssetSampler> {
        self.lookup.get(&key).map(|&idx| self.samplers[idx].as_ref())
    }
}

fn index_descriptor(
    database: &PoseSearchDatabase,
    samplers: &SamplerSet,
    sampling: &SamplingContext,
    descriptor: &AssetDescriptor,
) -> Option<IndexedAsset> {
    let (main, lead_in, follow_up) = match descriptor.kind {
        AssetKind::Sequence => {
            let sequence = database.sequences.get(descriptor.source_asset_idx)?;
            let range = descriptor.sampling_range;
            let lead_in = match &sequence.lead_in {
                Some(clip) if range.min == 0.0 => samplers.get(clip_key(clip)),
                _ => None,
            };
            let follow_up = match &sequence.follow_up {
                Some(clip) if range.max == sequence.clip.play_length() => {
                    samplers.get(clip_key(clip))
                }
                _ => None,
            };
            (samplers.get(clip_key(&sequence.clip))?, lead_in, follow_up)
        }
        AssetKind::BlendSpace => {
            let source = database.blend_spaces.get(descriptor.source_asset_idx)?;
            let key = blend_space_key(&source.blend_space, descriptor.blend_parameters);
            (samplers.get(key)?, None, None)
        }
    };

    let indexer = AssetIndexer::new(IndexingContext {
        schema: database.schema(),
        sampling,
        main,
        lead_in,
        follow_up,
        mirrored: descriptor.mirrored,
        requested_range: descriptor.sampling_range,
        block_transition: database.config.block_transition,
    });
    Some(indexer.process())
}

/// Builds the index, failing if any channel could not index every pose.
pub fn build_index(database: &PoseSearchDatabase) -> Result<SearchIndex> {
    let (index, report) = build_index_with_report(database)?;
    if !report.is_success() {
        return Err(PoseSearchError::IncompleteChannels {
            channels: report.invalid_channels,
        });
    }
    Ok(index)
}

/// Builds the index and reports indexing problems instead of failing on them. Structural
/// problems (invalid schema, missing mirror data) still fail.
pub fn build_index_with_report(database: &PoseSearchDatabase) -> Result<(SearchIndex, BuildReport)> {
    if let Err(err) = database.is_valid_for_indexing() {
        log::error!("database is invalid for indexing: {err}");
        return Err(err);
    }
    let schema = database.schema();
    let enumeration = database.enumerate_assets()?;
    let mut descriptors = enumeration.descriptors;

    let samplers = SamplerSet::prepare(database, &descriptors);
    let sampling = database.sampling_context();

    let indexed: Vec<IndexedAsset> = descriptors
        .par_iter()
        .map(|descriptor| {
            index_descriptor(database, &samplers, &sampling, descriptor).unwrap_or_default()
        })
        .collect();

    let mut invalid_channels: Vec<usize> = indexed
        .iter()
        .flat_map(|asset| asset.invalid_channels.iter().copied())
        .collect();
    invalid_channels.sort_unstable();
    invalid_channels.dedup();
    for channel_idx in &invalid_channels {
        let name = schema
            .channels()
            .get(*channel_idx)
            .map_or("?", |channel| channel.name());
        log::error!("feature channel {channel_idx} '{name}' failed to index all features");
    }

    // merge in descriptor order
    let num_floats = schema.layout.num_floats;
    let num_poses: usize = indexed.iter().map(|asset| asset.num_poses).sum();
    let mut values = Vec::with_capacity(num_poses * num_floats);
    let mut pose_metadata = Vec::with_capacity(num_poses);
    let mut group_ranges: Vec<(Option<usize>, usize, usize)> = Vec::new();
    let mut first_pose_idx = 0;
    for (descriptor, asset) in descriptors.iter_mut().zip(&indexed) {
        descriptor.first_pose_idx = first_pose_idx;
        descriptor.num_poses = asset.num_poses;
        values.extend_from_slice(&asset.values);
        pose_metadata.extend_from_slice(&asset.metadata);

        match group_ranges.last_mut() {
            Some((group_idx, _, end)) if *group_idx == descriptor.group_idx => {
                *end += asset.num_poses
            }
            _ => group_ranges.push((
                descriptor.group_idx,
                first_pose_idx,
                first_pose_idx + asset.num_poses,
            )),
        }
        first_pose_idx += asset.num_poses;
    }

    let preprocess_info = preprocess(
        &mut values,
        num_poses,
        &schema.layout,
        schema.effective_preprocessor(),
    );

    let weights = WeightsContext::new(database);
    let num_components = database.number_of_principal_components();
    let mode = database.config.pose_search_mode;
    let leaf_size = database.config.kdtree_max_leaf_size;

    let built: Vec<(GroupSearchIndex, usize)> = group_ranges
        .par_iter()
        .map(|&(group_idx, start, end)| {
            let group_weights = weights
                .group_weights(group_idx)
                .or_else(|| weights.group_weights(None))
                .map(<[f32]>::to_vec)
                .unwrap_or_default();
            let mut group = GroupSearchIndex {
                group_idx,
                start_pose_idx: start,
                end_pose_idx: end,
                weights: group_weights,
                pca: None,
                kdtree: None,
            };
            let mut failures = 0;
            if mode.uses_acceleration() && num_components > 0 {
                let rows = &values[start * num_floats..end * num_floats];
                failures = build_acceleration(&mut group, rows, num_components, leaf_size, mode);
            }
            (group, failures)
        })
        .collect();
    let validation_failures: usize = built.iter().map(|(_, failures)| failures).sum();
    let groups: Vec<GroupSearchIndex> = built.into_iter().map(|(group, _)| group).collect();

    log::debug!(
        "built pose search index: {} samplers, {} assets, {} groups, {} poses",
        samplers.samplers.len(),
        descriptors.len(),
        groups.len(),
        num_poses
    );

    let report = BuildReport {
        invalid_channels,
        bad_group_tags: enumeration.bad_group_tags,
        num_samplers: samplers.samplers.len(),
        num_assets: descriptors.len(),
        num_poses,
        validation_failures,
    };
    let index = SearchIndex {
        schema: schema.clone(),
        num_poses,
        values,
        pose_metadata,
        assets: descriptors,
        groups,
        preprocess_info,
        weights: weights
            .group_weights(None)
            .map(<[f32]>::to_vec)
            .unwrap_or_default(),
        search_settings: database.search_settings(),
        number_of_principal_components: num_components,
        source_hash: database.content_hash(),
    };
    Ok((index, report))
}

/// Fits the group's PCA projection over its weighted rows and builds the k-d tree over the
/// projected points. Returns the number of failed self-checks.
fn build_acceleration(
    group: &mut GroupSearchIndex,
    rows: &[f32],
    num_components: usize,
    leaf_size: usize,
    mode: PoseSearchMode,
) -> usize {
    let num_dimensions = group.weights.len();
    let num_rows = group.num_poses();
    if num_rows == 0 || num_dimensions == 0 {
        return 0;
    }
    let weighted: Vec<f32> = rows
        .chunks(num_dimensions)
        .flat_map(|row| row.iter().zip(&group.weights).map(|(v, w)| v * w))
        .collect();
    let Some((pca, projected)) =
        PcaProjection::fit(&weighted, num_rows, num_dimensions, num_components)
    else {
        return 0;
    };
    let kdtree = KdTree::build(&projected, pca.num_components, leaf_size);

    let mut failures = 0;
    if mode == PoseSearchMode::PcaKdTreeValidate {
        if pca.num_components == num_dimensions {
            failures += weighted
                .chunks(num_dimensions)
                .filter(|row| pca.reconstruction_error(row) >= KINDA_SMALL_NUMBER)
                .count();
        }
        for (point_idx, row) in weighted.chunks(num_dimensions).enumerate() {
            let neighbors = kdtree.knn(&pca.project(row), VALIDATION_NUM_NEIGHBORS);
            // a full result that is still all ties may leave the point itself out
            let saturated = neighbors.len() == VALIDATION_NUM_NEIGHBORS
                && neighbors
                    .last()
                    .is_some_and(|n| n.distance_sqr < KINDA_SMALL_NUMBER);
            let found = saturated
                || neighbors
                    .iter()
                    .any(|n| n.idx == point_idx && n.distance_sqr < KINDA_SMALL_NUMBER);
            if !found {
                failures += 1;
            }
        }
        if failures > 0 {
            log::warn!(
                "group {:?}: {failures} acceleration self-checks failed",
                group.group_idx
            );
        }
    }

    group.pca = Some(pca);
    group.kdtree = Some(kdtree);
    failures
}
