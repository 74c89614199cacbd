//! Feature channels: configured producers of features, used both when indexing assets and
//! when building runtime queries.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::feature_vector::FeatureVectorBuilder;
use crate::indexer::AssetIndexer;
use crate::query::QueryBuildingContext;
use crate::schema::{HorizonDomain, SchemaInitializer};

pub mod pose;
pub mod trajectory;

pub use pose::{PoseChannel, PoseChannelConfig};
pub use trajectory::{TrajectoryChannel, TrajectoryChannelConfig};

pub trait FeatureChannel: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn horizon_domain(&self) -> HorizonDomain {
        HorizonDomain::Time
    }

    /// Ascending sample offsets, one subsample per entry.
    fn sample_offsets(&self) -> &[f32];

    /// Declares this channel's features and bone references.
    fn initialize_schema(&mut self, initializer: &mut SchemaInitializer<'_>);

    /// Writes this channel's features for every pose the indexer covers. `vectors[i]`
    /// belongs to sample `indexer.begin_sample_idx() + i`.
    fn index_asset(&self, indexer: &AssetIndexer<'_>, vectors: &mut [FeatureVectorBuilder]);

    /// Writes this channel's features into `query`; false if the runtime state cannot
    /// supply them.
    fn build_query(&self, ctx: &QueryBuildingContext<'_>, query: &mut FeatureVectorBuilder)
        -> bool;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelConfig {
    Pose(PoseChannelConfig),
    Trajectory(TrajectoryChannelConfig),
}

impl ChannelConfig {
    pub fn build(&self) -> Box<dyn FeatureChannel> {
        match self {
            ChannelConfig::Pose(config) => Box::new(PoseChannel::new(config.clone())),
            ChannelConfig::Trajectory(config) => Box::new(TrajectoryChannel::new(config.clone())),
        }
    }
}

/// Sorts offsets ascending and drops duplicates.
pub(crate) fn sorted_offsets(offsets: &[f32]) -> Vec<f32> {
    let mut sorted: Vec<f32> = offsets.iter().copied().filter(|o| o.is_finite()).collect();
    sorted.sort_by(f32::total_cmp);
    sorted.dedup();
    sorted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_config_is_tagged() {
        let config: ChannelConfig = serde_json::from_str(
            r#"{ "type": "trajectory", "domain": "distance", "sample_offsets": [100.0, 0.0] }"#,
        )
        .unwrap();
        let channel = config.build();
        assert_eq!(channel.horizon_domain(), HorizonDomain::Distance);
        assert_eq!(channel.sample_offsets(), &[0.0, 100.0]);
    }

    #[test]
    fn offsets_are_sorted_and_unique() {
        assert_eq!(sorted_offsets(&[0.2, -0.1, 0.2, f32::NAN]), vec![-0.1, 0.2]);
    }
}
