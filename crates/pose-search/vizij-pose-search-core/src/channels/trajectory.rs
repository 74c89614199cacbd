//! Root trajectory features sampled in time or in accumulated root distance.

use serde::{Deserialize, Serialize};

use super::{sorted_offsets, FeatureChannel};
use crate::feature_vector::FeatureVectorBuilder;
use crate::indexer::AssetIndexer;
use crate::layout::{FeatureDescriptor, FeatureType};
use crate::math::relative_transform;
use crate::query::QueryBuildingContext;
use crate::schema::{HorizonDomain, SchemaInitializer};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrajectoryChannelConfig {
    pub domain: HorizonDomain,
    /// Seconds or distance units, depending on `domain`.
    pub sample_offsets: Vec<f32>,
    pub use_positions: bool,
    pub use_velocities: bool,
    pub use_facing_directions: bool,
}

impl Default for TrajectoryChannelConfig {
    fn default() -> Self {
        Self {
            domain: HorizonDomain::Time,
            sample_offsets: vec![-0.2, 0.0, 0.4, 0.8],
            use_positions: true,
            use_velocities: true,
            use_facing_directions: true,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TrajectoryChannel {
    config: TrajectoryChannelConfig,
    offsets: Vec<f32>,
    channel_idx: usize,
}

impl TrajectoryChannel {
    pub fn new(config: TrajectoryChannelConfig) -> Self {
        let offsets = sorted_offsets(&config.sample_offsets);
        Self {
            config,
            offsets,
            channel_idx: 0,
        }
    }

    fn descriptor(&self, subsample_idx: usize) -> FeatureDescriptor {
        FeatureDescriptor::new(self.channel_idx, 0, subsample_idx, FeatureType::Position)
    }
}

impl FeatureChannel for TrajectoryChannel {
    fn name(&self) -> &str {
        match self.config.domain {
            HorizonDomain::Time => "trajectory_time",
            HorizonDomain::Distance => "trajectory_distance",
        }
    }

    fn horizon_domain(&self) -> HorizonDomain {
        self.config.domain
    }

    fn sample_offsets(&self) -> &[f32] {
        &self.offsets
    }

    fn initialize_schema(&mut self, initializer: &mut SchemaInitializer<'_>) {
        self.channel_idx = initializer.channel_idx();
        for subsample_idx in 0..self.offsets.len() {
            let feature = self.descriptor(subsample_idx);
            if self.config.use_positions {
                initializer.add_feature(feature);
            }
            if self.config.use_velocities {
                initializer.add_feature(feature.with_type(FeatureType::LinearVelocity));
            }
            if self.config.use_facing_directions {
                initializer.add_feature(feature.with_type(FeatureType::ForwardVector));
            }
        }
    }

    fn index_asset(&self, indexer: &AssetIndexer<'_>, vectors: &mut [FeatureVectorBuilder]) {
        let finite_delta = indexer.finite_delta();

        for sample_idx in indexer.begin_sample_idx()..indexer.end_sample_idx() {
            let vector = &mut vectors[(sample_idx - indexer.begin_sample_idx()) as usize];
            let origin_time = indexer.sample_time(sample_idx);
            let origin = indexer.sample_info(origin_time);

            for (subsample_idx, &offset) in self.offsets.iter().enumerate() {
                let time = match self.config.domain {
                    HorizonDomain::Time => origin_time + offset,
                    HorizonDomain::Distance => {
                        indexer.sample_time_from_distance(origin.root_distance + offset)
                    }
                };
                let sample = indexer.sample_info_relative(time, &origin);
                let previous = indexer.sample_info_relative(time - finite_delta, &origin);
                let transform = indexer.mirror_transform(&sample.root_transform);
                let previous_transform = indexer.mirror_transform(&previous.root_transform);

                let feature = self.descriptor(subsample_idx);
                if self.config.use_positions {
                    vector.set_position(feature, &transform.translation.vector);
                }
                if self.config.use_velocities {
                    vector.set_linear_velocity(
                        feature,
                        &transform,
                        &previous_transform,
                        finite_delta,
                    );
                }
                if self.config.use_facing_directions {
                    vector.set_rotation(feature, &transform.rotation);
                }
            }
        }
    }

    fn build_query(
        &self,
        ctx: &QueryBuildingContext<'_>,
        query: &mut FeatureVectorBuilder,
    ) -> bool {
        let Some(trajectory) = ctx.trajectory else {
            return false;
        };
        let Some(present) = trajectory.sample_at_time(0.0) else {
            return false;
        };
        let to_root = present.transform.rotation.inverse();

        for (subsample_idx, &offset) in self.offsets.iter().enumerate() {
            let sample = match self.config.domain {
                HorizonDomain::Time => trajectory.sample_at_time(offset),
                HorizonDomain::Distance => trajectory.sample_at_distance(offset),
            };
            let Some(sample) = sample else {
                return false;
            };
            let transform = relative_transform(&sample.transform, &present.transform);
            let feature = self.descriptor(subsample_idx);
            if self.config.use_positions {
                query.set_position(feature, &transform.translation.vector);
            }
            if self.config.use_velocities {
                query.set_vector(
                    feature.with_type(FeatureType::LinearVelocity),
                    &(to_root * sample.linear_velocity),
                );
            }
            if self.config.use_facing_directions {
                query.set_rotation(feature, &transform.rotation);
            }
        }
        true
    }
}
