//! Vizij Pose Search Core (engine-agnostic)
//!
//! Motion-matching building blocks: feature schemas and channels, asset sampling and
//! indexing, preprocessing, PCA + k-d tree acceleration, weighted nearest-pose search and
//! runtime query construction from pose history.

pub mod build;
pub mod channels;
pub mod clip;
pub mod config;
pub mod database;
pub mod error;
pub mod feature_vector;
pub mod history;
pub mod index;
pub mod indexer;
pub mod kdtree;
pub mod layout;
pub mod math;
pub mod pca;
pub mod preprocess;
pub mod publish;
pub mod query;
pub mod sampler;
pub mod schema;
pub mod search;
pub mod skeleton;
pub mod weights;

// Re-exports for consumers
pub use build::{build_index, build_index_with_report, BuildReport};
pub use channels::{
    ChannelConfig, FeatureChannel, PoseChannelConfig, TrajectoryChannelConfig,
};
pub use clip::{AnimationClip, Annotation, AnnotationKind, BakedClip, BlendSpace, GridBlendSpace};
pub use config::{
    BlockTransitionParams, EngineConfig, ExtrapolationParams, PoseSearchMode, SearchSettings,
};
pub use database::{
    BlendSpaceSource, DatabaseConfig, GroupConfig, MirrorOption, PoseSearchDatabase,
    SequenceSource,
};
pub use error::{PoseSearchError, Result};
pub use feature_vector::{compare_feature_vectors, FeatureVectorBuilder, FeatureVectorReader};
pub use history::{PoseHistory, RootUpdateMode};
pub use index::{AssetDescriptor, AssetKind, PoseFlags, PoseMetadata, SearchIndex};
pub use layout::{FeatureDescriptor, FeatureLayout, FeatureType};
pub use math::Transform;
pub use publish::{IndexPublisher, PublishOutcome};
pub use query::{build_normalized_query, build_query, QueryBuildingContext, Trajectory, TrajectorySample};
pub use schema::{DataPreprocessor, HorizonDomain, Schema, SchemaConfig};
pub use search::{
    compare_poses, search, try_search, MirrorMismatchRequest, PoseCost, PoseCostDetails,
    SearchContext, SearchResult,
};
pub use skeleton::{Bone, MirrorData, Pose, Skeleton};
pub use weights::{AlphaBlendOption, WeightParams, WeightsCache, WeightsContext};
