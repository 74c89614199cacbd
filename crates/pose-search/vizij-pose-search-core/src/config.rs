//! Tunables shared by sampling, indexing and search.

use serde::{Deserialize, Serialize};

use crate::history::RootUpdateMode;

/// Thresholds and window used when root motion is extrapolated past a clip boundary.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtrapolationParams {
    /// Below this speed (units/s) extrapolated translation is zero.
    pub linear_speed_threshold: f32,
    /// Below this speed (degrees/s) extrapolated rotation is zero.
    pub angular_speed_threshold: f32,
    /// Window (seconds) at the clip boundary used to measure velocity.
    pub sample_time: f32,
}

impl Default for ExtrapolationParams {
    fn default() -> Self {
        Self {
            linear_speed_threshold: 1.0,
            angular_speed_threshold: 1.0,
            sample_time: 0.05,
        }
    }
}

/// Margins (seconds) at the start/end of non-looping clips whose poses cannot be selected.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockTransitionParams {
    pub sequence_start_interval: f32,
    pub sequence_end_interval: f32,
}

impl Default for BlockTransitionParams {
    fn default() -> Self {
        Self {
            sequence_start_interval: 0.0,
            sequence_end_interval: 0.2,
        }
    }
}

/// Search strategy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoseSearchMode {
    BruteForce,
    /// PCA projection + k-d tree candidates, exact re-ranking.
    #[default]
    PcaKdTree,
    /// Accelerated result, cross-checked against brute force with disagreements logged.
    PcaKdTreeValidate,
    /// Accelerated result with the brute force ground truth attached.
    PcaKdTreeCompare,
}

impl PoseSearchMode {
    #[inline]
    pub fn uses_acceleration(self) -> bool {
        !matches!(self, Self::BruteForce)
    }
}

/// Search knobs captured into every built index.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchSettings {
    pub mode: PoseSearchMode,
    pub kdtree_query_num_neighbors: usize,
    pub mirroring_mismatch_cost: f32,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            mode: PoseSearchMode::default(),
            kdtree_query_num_neighbors: 100,
            mirroring_mismatch_cost: 0.0,
        }
    }
}

/// Runtime configuration for one animated instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of poses retained by the history ring.
    pub history_capacity: usize,
    /// Seconds of history the ring must cover.
    pub history_horizon: f32,
    pub root_update_mode: RootUpdateMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history_capacity: 8,
            history_horizon: 0.5,
            root_update_mode: RootUpdateMode::RootMotionDelta,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let params: ExtrapolationParams =
            serde_json::from_str(r#"{ "sample_time": 0.1 }"#).unwrap();
        assert_eq!(params.linear_speed_threshold, 1.0);
        assert_eq!(params.sample_time, 0.1);

        let mode: PoseSearchMode = serde_json::from_str(r#""pca_kd_tree_validate""#).unwrap();
        assert!(mode.uses_acceleration());
    }
}
