//! The built search index: flat pose table, asset descriptors, per-pose metadata, preprocessing
//! transform and per-group acceleration data.

use std::sync::Arc;

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

use crate::config::SearchSettings;
use crate::indexer::SamplingRange;
use crate::kdtree::KdTree;
use crate::pca::PcaProjection;
use crate::schema::Schema;

/// Per-pose flag bits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoseFlags(u8);

impl PoseFlags {
    pub const NONE: PoseFlags = PoseFlags(0);
    /// The pose can never be returned as a search result.
    pub const BLOCK_TRANSITION: PoseFlags = PoseFlags(1 << 0);

    #[inline]
    pub fn contains(self, other: PoseFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn insert(&mut self, other: PoseFlags) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn bits(self) -> u8 {
        self.0
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PoseMetadata {
    pub flags: PoseFlags,
    pub cost_addend: f32,
}

impl PoseMetadata {
    #[inline]
    pub fn is_block_transition(&self) -> bool {
        self.flags.contains(PoseFlags::BLOCK_TRANSITION)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Sequence,
    BlendSpace,
}

/// One indexed sub-range of a source asset, owning a contiguous run of poses.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssetDescriptor {
    pub kind: AssetKind,
    /// Index into the database's sequences or blend spaces, per `kind`.
    pub source_asset_idx: usize,
    pub group_idx: Option<usize>,
    pub mirrored: bool,
    pub looping: bool,
    pub sampling_range: SamplingRange,
    pub sampling_interval: f32,
    pub blend_parameters: Vector2<f32>,
    pub first_pose_idx: usize,
    pub num_poses: usize,
}

impl AssetDescriptor {
    #[inline]
    pub fn pose_range(&self) -> std::ops::Range<usize> {
        self.first_pose_idx..self.first_pose_idx + self.num_poses
    }

    #[inline]
    pub fn contains_pose(&self, pose_idx: usize) -> bool {
        self.pose_range().contains(&pose_idx)
    }

    #[inline]
    pub fn is_blend_space(&self) -> bool {
        self.kind == AssetKind::BlendSpace
    }
}

/// Linear preprocessing transform. Matrices are column-major `N × N`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PreprocessInfo {
    pub num_dimensions: usize,
    pub transformation: Vec<f32>,
    pub inverse_transformation: Vec<f32>,
    pub sample_mean: Vec<f32>,
}

impl PreprocessInfo {
    pub fn identity(num_dimensions: usize) -> Self {
        let mut transformation = vec![0.0; num_dimensions * num_dimensions];
        for d in 0..num_dimensions {
            transformation[d * num_dimensions + d] = 1.0;
        }
        Self {
            num_dimensions,
            inverse_transformation: transformation.clone(),
            transformation,
            sample_mean: vec![0.0; num_dimensions],
        }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        let n = self.num_dimensions;
        self.transformation.len() == n * n
            && self.inverse_transformation.len() == n * n
            && self.sample_mean.len() == n
    }

    /// `T · (x − mean)`
    pub fn forward(&self, values: &[f32]) -> Vec<f32> {
        let n = self.num_dimensions;
        let centered: Vec<f32> = values
            .iter()
            .zip(&self.sample_mean)
            .map(|(v, m)| v - m)
            .collect();
        mat_vec(&self.transformation, n, &centered)
    }

    /// `T⁻¹ · y + mean`
    pub fn inverse(&self, values: &[f32]) -> Vec<f32> {
        let n = self.num_dimensions;
        let mut result = mat_vec(&self.inverse_transformation, n, values);
        for (r, m) in result.iter_mut().zip(&self.sample_mean) {
            *r += m;
        }
        result
    }
}

fn mat_vec(matrix: &[f32], n: usize, vector: &[f32]) -> Vec<f32> {
    let mut result = vec![0.0; n];
    for (col, &v) in vector.iter().enumerate().take(n) {
        if v == 0.0 {
            continue;
        }
        let column = &matrix[col * n..(col + 1) * n];
        for (r, c) in result.iter_mut().zip(column) {
            *r += c * v;
        }
    }
    result
}

/// Per-group search data. `[start_pose_idx, end_pose_idx)` covers the group's poses.
#[derive(Clone, Debug)]
pub struct GroupSearchIndex {
    pub group_idx: Option<usize>,
    pub start_pose_idx: usize,
    pub end_pose_idx: usize,
    /// Per-float weights used by the group.
    pub weights: Vec<f32>,
    pub pca: Option<PcaProjection>,
    /// Built over the group's projected poses; point `i` is pose `start_pose_idx + i`.
    pub kdtree: Option<KdTree>,
}

impl GroupSearchIndex {
    #[inline]
    pub fn num_poses(&self) -> usize {
        self.end_pose_idx - self.start_pose_idx
    }

    #[inline]
    pub fn is_accelerated(&self) -> bool {
        self.pca.is_some() && self.kdtree.is_some()
    }
}

#[derive(Clone, Debug)]
pub struct SearchIndex {
    pub(crate) schema: Arc<Schema>,
    pub num_poses: usize,
    /// Preprocessed pose rows, `num_poses × num_floats`.
    pub values: Vec<f32>,
    pub pose_metadata: Vec<PoseMetadata>,
    /// Sorted by group, then build order; `first_pose_idx` ascends.
    pub assets: Vec<AssetDescriptor>,
    pub groups: Vec<GroupSearchIndex>,
    pub preprocess_info: PreprocessInfo,
    /// Per-float weights for searches that do not name a group.
    pub weights: Vec<f32>,
    pub search_settings: SearchSettings,
    pub number_of_principal_components: usize,
    /// Content hash of the database this index was built from.
    pub source_hash: u64,
}

impl SearchIndex {
    #[inline]
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    #[inline]
    pub fn num_floats(&self) -> usize {
        self.schema.layout.num_floats
    }

    #[inline]
    pub fn num_poses(&self) -> usize {
        self.num_poses
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.num_poses == 0
    }

    pub fn is_valid(&self) -> bool {
        let num_floats = self.num_floats();
        num_floats > 0
            && self.values.len() == self.num_poses * num_floats
            && self.pose_metadata.len() == self.num_poses
            && self.preprocess_info.is_valid()
            && self.preprocess_info.num_dimensions == num_floats
            && self
                .assets
                .iter()
                .all(|asset| asset.first_pose_idx + asset.num_poses <= self.num_poses)
    }

    pub fn pose_values(&self, pose_idx: usize) -> &[f32] {
        let num_floats = self.num_floats();
        &self.values[pose_idx * num_floats..(pose_idx + 1) * num_floats]
    }

    #[inline]
    pub fn normalize(&self, values: &[f32]) -> Vec<f32> {
        self.preprocess_info.forward(values)
    }

    #[inline]
    pub fn inverse_normalize(&self, values: &[f32]) -> Vec<f32> {
        self.preprocess_info.inverse(values)
    }

    /// Descriptor owning `pose_idx`.
    pub fn find_asset_for_pose(&self, pose_idx: usize) -> Option<(usize, &AssetDescriptor)> {
        let position = self
            .assets
            .partition_point(|asset| asset.first_pose_idx <= pose_idx);
        let asset_idx = position.checked_sub(1)?;
        let asset = &self.assets[asset_idx];
        asset.contains_pose(pose_idx).then_some((asset_idx, asset))
    }

    /// Asset time of `pose_idx`; blend spaces report time normalized to `[0, 1]`.
    pub fn asset_time(&self, pose_idx: usize, asset: &AssetDescriptor) -> f32 {
        let local = pose_idx.saturating_sub(asset.first_pose_idx) as f32;
        if asset.is_blend_space() {
            let length = asset.num_poses as f32 * asset.sampling_interval;
            if length > 0.0 {
                return (local * asset.sampling_interval / length).clamp(0.0, 1.0);
            }
            return 0.0;
        }
        asset.sampling_range.min + local * asset.sampling_interval
    }

    /// Pose of `asset` nearest to `time`, wrapping or clamping per the asset's looping flag.
    pub fn pose_index_from_time(&self, time: f32, asset: &AssetDescriptor) -> Option<usize> {
        if asset.num_poses == 0 || asset.sampling_interval <= 0.0 {
            return None;
        }
        let range = asset.sampling_range;
        let length = range.max - range.min;
        let mut relative = time - range.min;
        if asset.looping && length > 0.0 {
            relative = relative.rem_euclid(length);
        }
        let local = (relative / asset.sampling_interval).round();
        let local = local.clamp(0.0, (asset.num_poses - 1) as f32) as usize;
        Some(asset.first_pose_idx + local)
    }

    /// Search data of `group_idx` (`None` is the ungrouped set).
    pub fn group(&self, group_idx: Option<usize>) -> Option<&GroupSearchIndex> {
        self.groups.iter().find(|group| group.group_idx == group_idx)
    }
}
