//! Bone features: root-relative position, rotation and linear velocity of sampled bones.

use serde::{Deserialize, Serialize};

use super::{sorted_offsets, FeatureChannel};
use crate::feature_vector::FeatureVectorBuilder;
use crate::indexer::AssetIndexer;
use crate::layout::{FeatureDescriptor, FeatureType};
use crate::math::relative_transform;
use crate::query::QueryBuildingContext;
use crate::schema::SchemaInitializer;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoseChannelConfig {
    pub sampled_bones: Vec<String>,
    /// Seconds relative to the indexed pose; non-positive offsets can be queried from history.
    pub sample_time_offsets: Vec<f32>,
    pub use_rotations: bool,
    pub use_velocities: bool,
}

impl Default for PoseChannelConfig {
    fn default() -> Self {
        Self {
            sampled_bones: Vec::new(),
            sample_time_offsets: vec![0.0],
            use_rotations: true,
            use_velocities: true,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PoseChannel {
    config: PoseChannelConfig,
    offsets: Vec<f32>,
    channel_idx: usize,
    /// Schema bone reference per sampled bone.
    bone_references: Vec<usize>,
}

impl PoseChannel {
    pub fn new(config: PoseChannelConfig) -> Self {
        let offsets = sorted_offsets(&config.sample_time_offsets);
        Self {
            config,
            offsets,
            channel_idx: 0,
            bone_references: Vec::new(),
        }
    }

    fn descriptor(&self, reference_idx: usize, subsample_idx: usize) -> FeatureDescriptor {
        FeatureDescriptor::new(
            self.channel_idx,
            reference_idx,
            subsample_idx,
            FeatureType::Position,
        )
    }

    /// Copies this channel's features at `subsample_idx` from the currently playing pose.
    fn copy_from_current_result(
        &self,
        ctx: &QueryBuildingContext<'_>,
        subsample_idx: usize,
        query: &mut FeatureVectorBuilder,
    ) -> bool {
        let Some(current) = ctx.current_result else {
            return false;
        };
        let mut playing = FeatureVectorBuilder::new(query.schema());
        if !playing.copy_from_search_index(current.index, current.pose_idx) {
            return false;
        }
        let layout = &query.schema().layout;
        let features: Vec<usize> = layout
            .features_by(Some(self.channel_idx), None)
            .filter(|(_, feature)| feature.subsample_idx == subsample_idx)
            .map(|(idx, _)| idx)
            .collect();
        features
            .into_iter()
            .all(|feature_idx| query.copy_feature(&playing, feature_idx))
    }
}

impl FeatureChannel for PoseChannel {
    fn name(&self) -> &str {
        "pose"
    }

    fn sample_offsets(&self) -> &[f32] {
        &self.offsets
    }

    fn initialize_schema(&mut self, initializer: &mut SchemaInitializer<'_>) {
        self.channel_idx = initializer.channel_idx();
        self.bone_references = self
            .config
            .sampled_bones
            .iter()
            .map(|name| initializer.add_bone_reference(name))
            .collect();

        for subsample_idx in 0..self.offsets.len() {
            for &reference_idx in &self.bone_references {
                let feature = self.descriptor(reference_idx, subsample_idx);
                initializer.add_feature(feature);
                if self.config.use_rotations {
                    initializer.add_feature(feature.with_type(FeatureType::Rotation));
                }
                if self.config.use_velocities {
                    initializer.add_feature(feature.with_type(FeatureType::LinearVelocity));
                }
            }
        }
    }

    fn index_asset(&self, indexer: &AssetIndexer<'_>, vectors: &mut [FeatureVectorBuilder]) {
        let schema = indexer.schema();
        let finite_delta = indexer.finite_delta();

        for sample_idx in indexer.begin_sample_idx()..indexer.end_sample_idx() {
            let vector_idx = (sample_idx - indexer.begin_sample_idx()) as usize;
            let origin_time = indexer.sample_time(sample_idx);
            let origin = indexer.sample_info(origin_time);

            for (subsample_idx, offset) in self.offsets.iter().enumerate() {
                let time = origin_time + offset;
                let current = indexer.component_pose(&indexer.sample_info_relative(time, &origin));
                let previous = indexer.component_pose(
                    &indexer.sample_info_relative(time - finite_delta, &origin),
                );

                for &reference_idx in &self.bone_references {
                    let Some(bone_idx) = schema.bone_index(reference_idx) else {
                        continue;
                    };
                    let transform = indexer.bone_transform(&current, bone_idx);
                    let previous_transform = indexer.bone_transform(&previous, bone_idx);
                    let feature = self.descriptor(reference_idx, subsample_idx);
                    let vector = &mut vectors[vector_idx];
                    vector.set_transform(feature, &transform);
                    vector.set_linear_velocity(
                        feature,
                        &transform,
                        &previous_transform,
                        finite_delta,
                    );
                }
            }
        }
    }

    fn build_query(
        &self,
        ctx: &QueryBuildingContext<'_>,
        query: &mut FeatureVectorBuilder,
    ) -> bool {
        let schema = ctx.schema;
        let skeleton = schema.skeleton();
        let required = schema.bone_indices_with_parents();

        let mut complete = true;
        for (subsample_idx, &offset) in self.offsets.iter().enumerate() {
            if offset > 0.0 {
                complete &= self.copy_from_current_result(ctx, subsample_idx, query);
                continue;
            }
            let Some(history) = ctx.history else {
                return false;
            };
            let (Some(present), Some(sample)) = (
                history.try_sample_pose(0.0, skeleton, required),
                history.try_sample_pose(-offset, skeleton, required),
            ) else {
                return false;
            };

            let root = relative_transform(&sample.root, &present.root);
            let previous_root = relative_transform(&sample.previous_root, &present.root);
            for &reference_idx in &self.bone_references {
                let Some(bone_idx) = schema.bone_index(reference_idx) else {
                    return false;
                };
                let (Some(component), Some(previous_component)) = (
                    sample.component.get(bone_idx),
                    sample.previous_component.get(bone_idx),
                ) else {
                    return false;
                };
                let transform = root * component;
                let previous_transform = previous_root * previous_component;
                let feature = self.descriptor(reference_idx, subsample_idx);
                query.set_transform(feature, &transform);
                query.set_linear_velocity(
                    feature,
                    &transform,
                    &previous_transform,
                    sample.interval,
                );
            }
        }
        complete
    }
}
