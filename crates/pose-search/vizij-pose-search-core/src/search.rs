//! Nearest pose search over a built index: brute force, PCA + k-d tree candidates with exact
//! re-ranking, and cost breakdowns.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::config::PoseSearchMode;
use crate::error::{PoseSearchError, Result};
use crate::feature_vector::compare_feature_vectors;
use crate::index::{AssetDescriptor, GroupSearchIndex, SearchIndex};
use crate::weights::WeightsContext;

/// Disagreements between accelerated and brute force costs below this are ignored.
const VALIDATION_COST_TOLERANCE: f32 = 1e-4;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MirrorMismatchRequest {
    #[default]
    Indifferent,
    MatchUnmirrored,
    MatchMirrored,
}

impl MirrorMismatchRequest {
    /// Whether a pose of an asset with `mirrored` disagrees with the request.
    #[inline]
    pub fn is_mismatch(self, mirrored: bool) -> bool {
        match self {
            Self::Indifferent => false,
            Self::MatchUnmirrored => mirrored,
            Self::MatchMirrored => !mirrored,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PoseCost {
    pub dissimilarity: f32,
    pub cost_addend: f32,
    pub total_cost: f32,
}

impl Default for PoseCost {
    fn default() -> Self {
        Self {
            dissimilarity: f32::INFINITY,
            cost_addend: 0.0,
            total_cost: f32::INFINITY,
        }
    }
}

impl PoseCost {
    pub fn new(dissimilarity: f32, cost_addend: f32) -> Self {
        Self {
            dissimilarity,
            cost_addend,
            total_cost: dissimilarity + cost_addend,
        }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.total_cost.is_finite()
    }
}

impl PartialOrd for PoseCost {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.total_cost.partial_cmp(&other.total_cost)
    }
}

/// Cost of one pose broken down by dimension and channel.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PoseCostDetails {
    /// `weight[d] · (pose[d] − query[d])²`
    pub cost_vector: Vec<f32>,
    pub channel_costs: Vec<f32>,
    pub notify_cost_addend: f32,
    pub mirror_mismatch_addend: f32,
    pub pose_cost: PoseCost,
}

/// Brute force ground truth attached in compare mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PoseComparison {
    pub pose_idx: Option<usize>,
    pub pose_cost: PoseCost,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub pose_idx: Option<usize>,
    pub pose_cost: PoseCost,
    pub asset_idx: Option<usize>,
    pub asset_time: f32,
    pub ground_truth: Option<PoseComparison>,
}

impl SearchResult {
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.pose_idx.is_some() && self.pose_cost.is_valid()
    }

    fn comparison(&self) -> PoseComparison {
        PoseComparison {
            pose_idx: self.pose_idx,
            pose_cost: self.pose_cost,
        }
    }
}

pub type AssetFilter<'a> = &'a (dyn Fn(&AssetDescriptor) -> bool + Sync);

/// Parameters of one search.
#[derive(Clone, Copy)]
pub struct SearchContext<'a> {
    /// Query already run through the index's preprocessing transform.
    pub query: &'a [f32],
    pub mirror_mismatch_request: MirrorMismatchRequest,
    /// Assets rejected by the filter are never evaluated.
    pub asset_filter: Option<AssetFilter<'a>>,
    /// Overrides the weights stored in the index.
    pub weights: Option<&'a WeightsContext>,
    /// Overrides the index's search mode.
    pub mode: Option<PoseSearchMode>,
}

impl<'a> SearchContext<'a> {
    pub fn new(query: &'a [f32]) -> Self {
        Self {
            query,
            mirror_mismatch_request: MirrorMismatchRequest::Indifferent,
            asset_filter: None,
            weights: None,
            mode: None,
        }
    }

    pub fn with_mirror_request(mut self, request: MirrorMismatchRequest) -> Self {
        self.mirror_mismatch_request = request;
        self
    }

    pub fn with_asset_filter(mut self, filter: AssetFilter<'a>) -> Self {
        self.asset_filter = Some(filter);
        self
    }

    pub fn with_weights(mut self, weights: &'a WeightsContext) -> Self {
        self.weights = Some(weights);
        self
    }

    pub fn with_mode(mut self, mode: PoseSearchMode) -> Self {
        self.mode = Some(mode);
        self
    }

    fn accepts(&self, asset: &AssetDescriptor) -> bool {
        self.asset_filter.map_or(true, |filter| filter(asset))
    }
}

/// Cost evaluator bound to one index and one search.
struct Evaluator<'i, 'c> {
    index: &'i SearchIndex,
    ctx: &'c SearchContext<'c>,
}

impl<'i, 'c> Evaluator<'i, 'c> {
    /// Weights used to score poses of `group_idx`.
    fn weights(&self, group_idx: Option<usize>) -> &[f32] {
        let num_floats = self.index.num_floats();
        if let Some(w) = self
            .ctx
            .weights
            .and_then(|context| context.group_weights(group_idx))
            .filter(|w| w.len() == num_floats)
        {
            return w;
        }
        match self.index.group(group_idx) {
            Some(group) if group.weights.len() == num_floats => &group.weights,
            _ => &self.index.weights,
        }
    }

    fn cost_addend(&self, pose_idx: usize, asset: &AssetDescriptor) -> f32 {
        let notify = self.index.pose_metadata[pose_idx].cost_addend;
        notify + self.mirror_addend(asset)
    }

    fn mirror_addend(&self, asset: &AssetDescriptor) -> f32 {
        if self.ctx.mirror_mismatch_request.is_mismatch(asset.mirrored) {
            self.index.search_settings.mirroring_mismatch_cost
        } else {
            0.0
        }
    }

    fn cost(&self, pose_idx: usize, asset: &AssetDescriptor, weights: &[f32]) -> PoseCost {
        let dissimilarity =
            compare_feature_vectors(self.index.pose_values(pose_idx), self.ctx.query, weights);
        PoseCost::new(dissimilarity, self.cost_addend(pose_idx, asset))
    }

    fn result(&self, pose_idx: usize, pose_cost: PoseCost) -> SearchResult {
        let (asset_idx, asset_time) = match self.index.find_asset_for_pose(pose_idx) {
            Some((asset_idx, asset)) => (Some(asset_idx), self.index.asset_time(pose_idx, asset)),
            None => (None, 0.0),
        };
        SearchResult {
            pose_idx: Some(pose_idx),
            pose_cost,
            asset_idx,
            asset_time,
            ground_truth: None,
        }
    }

    /// Every unblocked pose of every accepted asset of `assets`; ties keep the first pose.
    fn brute_force<'a>(
        &self,
        assets: impl Iterator<Item = &'a AssetDescriptor>,
        best: &mut Option<(usize, PoseCost)>,
    ) {
        for asset in assets {
            if !self.ctx.accepts(asset) {
                continue;
            }
            let weights = self.weights(asset.group_idx);
            for pose_idx in asset.pose_range() {
                if self.index.pose_metadata[pose_idx].is_block_transition() {
                    continue;
                }
                let cost = self.cost(pose_idx, asset, weights);
                if best.map_or(true, |(_, best_cost)| cost.total_cost < best_cost.total_cost) {
                    *best = Some((pose_idx, cost));
                }
            }
        }
    }

    fn accelerated_group(&self, group: &GroupSearchIndex, best: &mut Option<(usize, PoseCost)>) {
        let (Some(pca), Some(kdtree)) = (&group.pca, &group.kdtree) else {
            let assets = self.index.assets.iter().filter(|asset| {
                asset.group_idx == group.group_idx
                    && asset.first_pose_idx >= group.start_pose_idx
                    && asset.first_pose_idx < group.end_pose_idx
            });
            self.brute_force(assets, best);
            return;
        };

        let weighted: Vec<f32> = self
            .ctx
            .query
            .iter()
            .zip(&group.weights)
            .map(|(q, w)| q * w)
            .collect();
        let num_neighbors = self
            .index
            .search_settings
            .kdtree_query_num_neighbors
            .clamp(1, group.num_poses().max(1));
        let weights = self.weights(group.group_idx);

        for neighbor in kdtree.knn(&pca.project(&weighted), num_neighbors) {
            let pose_idx = group.start_pose_idx + neighbor.idx;
            if self.index.pose_metadata[pose_idx].is_block_transition() {
                continue;
            }
            let Some((_, asset)) = self.index.find_asset_for_pose(pose_idx) else {
                continue;
            };
            if !self.ctx.accepts(asset) {
                continue;
            }
            let cost = self.cost(pose_idx, asset, weights);
            if best.map_or(true, |(_, best_cost)| cost.total_cost < best_cost.total_cost) {
                *best = Some((pose_idx, cost));
            }
        }
    }

    fn search_brute_force(&self) -> SearchResult {
        let mut best = None;
        self.brute_force(self.index.assets.iter(), &mut best);
        best.map(|(pose_idx, cost)| self.result(pose_idx, cost))
            .unwrap_or_default()
    }

    fn search_accelerated(&self) -> SearchResult {
        let mut best = None;
        for group in &self.index.groups {
            self.accelerated_group(group, &mut best);
        }
        best.map(|(pose_idx, cost)| self.result(pose_idx, cost))
            .unwrap_or_default()
    }
}

/// Searches `index` for the pose closest to `ctx.query`. Invalid, empty or mismatched
/// inputs give a result without a pose and with infinite cost.
pub fn search(index: &SearchIndex, ctx: &SearchContext<'_>) -> SearchResult {
    match try_search(index, ctx) {
        Ok(result) => result,
        Err(err) => {
            log::debug!("pose search found nothing: {err}");
            SearchResult::default()
        }
    }
}

pub fn try_search(index: &SearchIndex, ctx: &SearchContext<'_>) -> Result<SearchResult> {
    if index.is_empty() {
        return Err(PoseSearchError::EmptyIndex);
    }
    if !index.is_valid() {
        return Err(PoseSearchError::InvalidIndex {
            reason: format!(
                "{} values for {} poses of {} floats",
                index.values.len(),
                index.num_poses(),
                index.num_floats()
            ),
        });
    }
    if ctx.query.len() != index.num_floats() {
        return Err(PoseSearchError::DimensionMismatch {
            expected: index.num_floats(),
            actual: ctx.query.len(),
        });
    }

    let evaluator = Evaluator { index, ctx };
    let mode = ctx.mode.unwrap_or(index.search_settings.mode);
    let result = match mode {
        PoseSearchMode::BruteForce => evaluator.search_brute_force(),
        PoseSearchMode::PcaKdTree => evaluator.search_accelerated(),
        PoseSearchMode::PcaKdTreeValidate => {
            let accelerated = evaluator.search_accelerated();
            let brute_force = evaluator.search_brute_force();
            if accelerated.pose_idx != brute_force.pose_idx
                && (accelerated.pose_cost.total_cost - brute_force.pose_cost.total_cost).abs()
                    > VALIDATION_COST_TOLERANCE
            {
                log::warn!(
                    "accelerated search picked {:?} (cost {}) but brute force picked {:?} (cost {})",
                    accelerated.pose_idx,
                    accelerated.pose_cost.total_cost,
                    brute_force.pose_idx,
                    brute_force.pose_cost.total_cost
                );
            }
            accelerated
        }
        PoseSearchMode::PcaKdTreeCompare => {
            let mut accelerated = evaluator.search_accelerated();
            accelerated.ground_truth = Some(evaluator.search_brute_force().comparison());
            accelerated
        }
    };

    if result.pose_idx.is_none() {
        return Err(PoseSearchError::NotFound);
    }
    Ok(result)
}

/// Full cost breakdown of `pose_idx` against `ctx.query`.
pub fn compare_poses(
    index: &SearchIndex,
    pose_idx: usize,
    ctx: &SearchContext<'_>,
) -> Option<PoseCostDetails> {
    if pose_idx >= index.num_poses() || ctx.query.len() != index.num_floats() {
        return None;
    }
    let (_, asset) = index.find_asset_for_pose(pose_idx)?;
    let evaluator = Evaluator { index, ctx };
    let weights = evaluator.weights(asset.group_idx);

    let cost_vector: Vec<f32> = index
        .pose_values(pose_idx)
        .iter()
        .zip(ctx.query)
        .zip(weights)
        .map(|((p, q), w)| (p - q) * (p - q) * w)
        .collect();

    let schema = index.schema();
    let mut channel_costs = vec![0.0; schema.channels().len()];
    for feature in &schema.layout.features {
        let range = feature.value_offset..feature.value_offset + feature.num_floats();
        channel_costs[feature.channel_idx] += cost_vector[range].iter().sum::<f32>();
    }

    let notify_cost_addend = index.pose_metadata[pose_idx].cost_addend;
    let mirror_mismatch_addend = evaluator.mirror_addend(asset);
    let pose_cost = PoseCost::new(
        cost_vector.iter().sum(),
        notify_cost_addend + mirror_mismatch_addend,
    );
    Some(PoseCostDetails {
        cost_vector,
        channel_costs,
        notify_cost_addend,
        mirror_mismatch_addend,
        pose_cost,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::channels::{ChannelConfig, TrajectoryChannelConfig};
    use crate::config::SearchSettings;
    use crate::index::{AssetKind, PoseFlags, PoseMetadata, PreprocessInfo};
    use crate::indexer::SamplingRange;
    use crate::math::Transform;
    use crate::schema::{Schema, SchemaConfig};
    use crate::skeleton::{Bone, Skeleton};
    use approx::assert_relative_eq;
    use nalgebra::Vector2;

    /// Index of `rows.len()` poses over a single 1-subsample trajectory position feature,
    /// one asset per `assets` entry `(num_poses, mirrored)`.
    fn mk_index(rows: &[[f32; 3]], assets: &[(usize, bool)]) -> SearchIndex {
        let skeleton = Skeleton::new(vec![Bone {
            name: "root".into(),
            parent: None,
            reference: Transform::identity(),
        }])
        .unwrap();
        let schema = Arc::new(Schema::new(
            SchemaConfig {
                channels: vec![ChannelConfig::Trajectory(TrajectoryChannelConfig {
                    sample_offsets: vec![0.0],
                    use_velocities: false,
                    use_facing_directions: false,
                    ..Default::default()
                })],
                ..Default::default()
            },
            Arc::new(skeleton),
        ));
        let mut first_pose_idx = 0;
        let descriptors = assets
            .iter()
            .enumerate()
            .map(|(idx, &(num_poses, mirrored))| {
                let descriptor = AssetDescriptor {
                    kind: AssetKind::Sequence,
                    source_asset_idx: idx,
                    group_idx: None,
                    mirrored,
                    looping: false,
                    sampling_range: SamplingRange::new(0.0, num_poses as f32 * 0.1),
                    sampling_interval: 0.1,
                    blend_parameters: Vector2::zeros(),
                    first_pose_idx,
                    num_poses,
                };
                first_pose_idx += num_poses;
                descriptor
            })
            .collect();
        SearchIndex {
            schema,
            num_poses: rows.len(),
            values: rows.iter().flatten().copied().collect(),
            pose_metadata: vec![PoseMetadata::default(); rows.len()],
            assets: descriptors,
            groups: vec![GroupSearchIndex {
                group_idx: None,
                start_pose_idx: 0,
                end_pose_idx: rows.len(),
                weights: vec![1.0; 3],
                pca: None,
                kdtree: None,
            }],
            preprocess_info: PreprocessInfo::identity(3),
            weights: vec![1.0; 3],
            search_settings: SearchSettings {
                mode: PoseSearchMode::BruteForce,
                kdtree_query_num_neighbors: 4,
                mirroring_mismatch_cost: 5.0,
            },
            number_of_principal_components: 0,
            source_hash: 0,
        }
    }

    #[test]
    fn brute_force_finds_nearest_and_skips_blocked() {
        let mut index = mk_index(
            &[[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [2.0, 0.0, 0.0], [3.0, 0.0, 0.0]],
            &[(2, false), (2, false)],
        );
        let query = [1.9, 0.0, 0.0];
        let result = search(&index, &SearchContext::new(&query));
        assert_eq!(result.pose_idx, Some(2));
        assert_eq!(result.asset_idx, Some(1));
        assert_relative_eq!(result.asset_time, 0.0);
        assert!(result.is_valid());
        assert_relative_eq!(result.pose_cost.dissimilarity, 0.01, epsilon = 1e-5);

        index.pose_metadata[2].flags.insert(PoseFlags::BLOCK_TRANSITION);
        let result = search(&index, &SearchContext::new(&query));
        assert_eq!(result.pose_idx, Some(1));
    }

    #[test]
    fn ties_keep_the_first_pose() {
        let index = mk_index(&[[1.0, 0.0, 0.0], [-1.0, 0.0, 0.0]], &[(2, false)]);
        let result = search(&index, &SearchContext::new(&[0.0, 0.0, 0.0]));
        assert_eq!(result.pose_idx, Some(0));
    }

    #[test]
    fn cost_addends_and_mirror_mismatch() {
        let mut index = mk_index(&[[0.0, 0.0, 0.0], [0.5, 0.0, 0.0]], &[(1, true), (1, false)]);
        index.pose_metadata[1].cost_addend = 0.1;
        let query = [0.0, 0.0, 0.0];

        let result = search(&index, &SearchContext::new(&query));
        assert_eq!(result.pose_idx, Some(0));

        let ctx = SearchContext::new(&query)
            .with_mirror_request(MirrorMismatchRequest::MatchUnmirrored);
        let result = search(&index, &ctx);
        assert_eq!(result.pose_idx, Some(1));
        assert_relative_eq!(result.pose_cost.total_cost, 0.35, epsilon = 1e-5);

        let details = compare_poses(&index, 0, &ctx).unwrap();
        assert_relative_eq!(details.mirror_mismatch_addend, 5.0);
        assert_relative_eq!(details.pose_cost.total_cost, 5.0);
        assert_relative_eq!(
            details.channel_costs.iter().sum::<f32>(),
            details.pose_cost.dissimilarity
        );
    }

    #[test]
    fn filters_reject_assets() {
        let index = mk_index(&[[0.0, 0.0, 0.0], [4.0, 0.0, 0.0]], &[(1, false), (1, false)]);
        let only_second = |asset: &AssetDescriptor| asset.source_asset_idx == 1;
        let query = [0.0, 0.0, 0.0];
        let result = search(&index, &SearchContext::new(&query).with_asset_filter(&only_second));
        assert_eq!(result.pose_idx, Some(1));
        let none = |_: &AssetDescriptor| false;
        let ctx = SearchContext::new(&query).with_asset_filter(&none);
        assert_eq!(try_search(&index, &ctx), Err(PoseSearchError::NotFound));
    }

    #[test]
    fn bad_inputs_give_no_result() {
        let index = mk_index(&[[0.0, 0.0, 0.0]], &[(1, false)]);
        let result = search(&index, &SearchContext::new(&[0.0, 0.0]));
        assert!(!result.is_valid());
        assert_eq!(result.pose_cost.total_cost, f32::INFINITY);
        assert_eq!(
            try_search(&index, &SearchContext::new(&[0.0])),
            Err(PoseSearchError::DimensionMismatch {
                expected: 3,
                actual: 1
            })
        );

        let empty = mk_index(&[], &[]);
        assert_eq!(
            try_search(&empty, &SearchContext::new(&[0.0, 0.0, 0.0])),
            Err(PoseSearchError::EmptyIndex)
        );
    }

    #[test]
    fn unaccelerated_groups_fall_back_to_brute_force() {
        let index = mk_index(&[[0.0, 0.0, 0.0], [1.0, 1.0, 0.0]], &[(2, false)]);
        let query = [0.9, 1.0, 0.0];
        let ctx = SearchContext::new(&query).with_mode(PoseSearchMode::PcaKdTreeCompare);
        let result = search(&index, &ctx);
        assert_eq!(result.pose_idx, Some(1));
        assert_eq!(result.ground_truth.unwrap().pose_idx, Some(1));
    }
}
