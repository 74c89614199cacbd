//! Per-dimension cost weights derived from channel, horizon and feature type weights.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use serde::{Deserialize, Serialize};

use crate::database::PoseSearchDatabase;
use crate::layout::FeatureType;
use crate::math::{is_nearly_zero, map_range_unclamped};
use crate::schema::Schema;

/// Easing curve used to interpolate sample weights across a horizon.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlphaBlendOption {
    #[default]
    Linear,
    Cubic,
    HermiteCubic,
    Sinusoidal,
    QuadraticInOut,
    CubicInOut,
    QuarticInOut,
    QuinticInOut,
    CircularIn,
    CircularOut,
    CircularInOut,
    ExpIn,
    ExpOut,
    ExpInOut,
}

fn ease_in_out(alpha: f32, exponent: i32) -> f32 {
    if alpha < 0.5 {
        0.5 * (2.0 * alpha).powi(exponent)
    } else {
        0.5 + 0.5 * (1.0 - (1.0 - (2.0 * alpha - 1.0)).powi(exponent))
    }
}

fn circular_in(alpha: f32) -> f32 {
    1.0 - (1.0 - alpha * alpha).max(0.0).sqrt()
}

fn circular_out(alpha: f32) -> f32 {
    let shifted = alpha - 1.0;
    (1.0 - shifted * shifted).max(0.0).sqrt()
}

fn exp_in(alpha: f32) -> f32 {
    if alpha == 0.0 {
        0.0
    } else {
        2f32.powf(10.0 * (alpha - 1.0))
    }
}

fn exp_out(alpha: f32) -> f32 {
    if alpha == 1.0 {
        1.0
    } else {
        1.0 - 2f32.powf(-10.0 * alpha)
    }
}

impl AlphaBlendOption {
    /// Maps `alpha` (clamped to `[0, 1]`) through the curve.
    pub fn apply(self, alpha: f32) -> f32 {
        let a = alpha.clamp(0.0, 1.0);
        let value = match self {
            Self::Linear => a,
            Self::Cubic | Self::HermiteCubic => a * a * (3.0 - 2.0 * a),
            Self::Sinusoidal => ((a * std::f32::consts::PI - std::f32::consts::FRAC_PI_2).sin() + 1.0) / 2.0,
            Self::QuadraticInOut => ease_in_out(a, 2),
            Self::CubicInOut => ease_in_out(a, 3),
            Self::QuarticInOut => ease_in_out(a, 4),
            Self::QuinticInOut => ease_in_out(a, 5),
            Self::CircularIn => circular_in(a),
            Self::CircularOut => circular_out(a),
            Self::CircularInOut => {
                if a < 0.5 {
                    0.5 * circular_in(2.0 * a)
                } else {
                    0.5 + 0.5 * circular_out(2.0 * a - 1.0)
                }
            }
            Self::ExpIn => exp_in(a),
            Self::ExpOut => exp_out(a),
            Self::ExpInOut => {
                if a < 0.5 {
                    0.5 * exp_in(2.0 * a)
                } else {
                    0.5 + 0.5 * exp_out(2.0 * a - 1.0)
                }
            }
        };
        value.clamp(0.0, 1.0)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HorizonWeightParams {
    pub weight: f32,
    /// Interpolate sample weights across the horizon instead of weighting them equally.
    pub interpolate: bool,
    /// Curve input at the first sample; the last sample maps to `1 - initial_value`.
    pub initial_value: f32,
    pub interpolation_method: AlphaBlendOption,
}

impl Default for HorizonWeightParams {
    fn default() -> Self {
        Self {
            weight: 1.0,
            interpolate: false,
            initial_value: 0.1,
            interpolation_method: AlphaBlendOption::Linear,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelWeightParams {
    pub channel_weight: f32,
    pub history_params: HorizonWeightParams,
    pub prediction_params: HorizonWeightParams,
    /// Types missing from the map weigh zero.
    pub type_weights: BTreeMap<FeatureType, f32>,
}

impl Default for ChannelWeightParams {
    fn default() -> Self {
        Self {
            channel_weight: 1.0,
            history_params: HorizonWeightParams::default(),
            prediction_params: HorizonWeightParams::default(),
            type_weights: FeatureType::ALL.iter().map(|ty| (*ty, 1.0)).collect(),
        }
    }
}

/// Weight configuration, one entry per schema channel. Channels without an entry weigh 1
/// with uniform horizons and types.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightParams {
    pub channel_weights: Vec<ChannelWeightParams>,
}

impl WeightParams {
    pub fn channel(&self, channel_idx: usize) -> Option<&ChannelWeightParams> {
        self.channel_weights.get(channel_idx)
    }

    /// All channels at weight 0 except `channel_idx` at 1.
    pub fn single_channel(num_channels: usize, channel_idx: usize) -> Self {
        Self {
            channel_weights: (0..num_channels)
                .map(|idx| ChannelWeightParams {
                    channel_weight: if idx == channel_idx { 1.0 } else { 0.0 },
                    ..Default::default()
                })
                .collect(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FeatureWeights {
    /// One weight per layout feature; sums to 1 when anything contributes.
    pub per_feature: Vec<f32>,
    /// `per_feature` broadcast over each feature's floats.
    pub per_float: Vec<f32>,
}

const HISTORY: usize = 0;
const PREDICTION: usize = 1;

/// Computes the cost weights of every feature in `schema`.
pub fn compute_weights(params: &WeightParams, schema: &Schema) -> FeatureWeights {
    let layout = &schema.layout;
    let num_channels = schema.channels().len();
    let mut per_feature = vec![0.0f32; layout.num_features()];

    let mut channel_weights: Vec<f32> = (0..num_channels)
        .map(|channel_idx| {
            if layout.features_by(Some(channel_idx), None).next().is_none() {
                return 0.0;
            }
            params
                .channel(channel_idx)
                .map_or(1.0, |channel| channel.channel_weight)
        })
        .collect();
    let channel_sum: f32 = channel_weights.iter().sum();
    if !is_nearly_zero(channel_sum) {
        for w in &mut channel_weights {
            *w /= channel_sum;
        }
    }

    for channel_idx in 0..num_channels {
        if is_nearly_zero(channel_weights[channel_idx]) {
            continue;
        }
        let channel = params.channel(channel_idx);
        let offsets = schema.channel_sample_offsets(channel_idx);

        let mut type_weights = [0.0f32; FeatureType::ALL.len()];
        for ty in FeatureType::ALL {
            if layout.channel_has_type(channel_idx, ty) {
                type_weights[ty.index()] = channel.map_or(1.0, |c| {
                    c.type_weights.get(&ty).copied().unwrap_or(0.0)
                });
            }
        }
        let type_sum: f32 = type_weights.iter().sum();
        if is_nearly_zero(type_sum) {
            continue;
        }
        for w in &mut type_weights {
            *w /= type_sum;
        }

        // history is offsets <= 0, prediction the rest
        let split = offsets.partition_point(|&offset| offset <= 0.0);
        let horizons = [0..split, split..offsets.len()];
        let horizon_params = [
            channel.map(|c| &c.history_params),
            channel.map(|c| &c.prediction_params),
        ];

        let mut horizon_weights = [0.0f32; 2];
        for h in [HISTORY, PREDICTION] {
            if !horizons[h].is_empty() {
                horizon_weights[h] = horizon_params[h].map_or(1.0, |p| p.weight);
            }
        }
        let horizon_sum: f32 = horizon_weights.iter().sum();
        if is_nearly_zero(horizon_sum) {
            continue;
        }
        for w in &mut horizon_weights {
            *w /= horizon_sum;
        }

        let mut sample_weights = vec![0.0f32; offsets.len()];
        for h in [HISTORY, PREDICTION] {
            let range = horizons[h].clone();
            if range.is_empty() {
                continue;
            }
            match horizon_params[h] {
                Some(p) if p.interpolate && range.len() > 1 => {
                    let (first, last) = (offsets[range.start], offsets[range.end - 1]);
                    for idx in range.clone() {
                        let alpha = map_range_unclamped(
                            offsets[idx],
                            first,
                            last,
                            p.initial_value,
                            1.0 - p.initial_value,
                        );
                        sample_weights[idx] = p.interpolation_method.apply(alpha);
                    }
                }
                _ => sample_weights[range.clone()].fill(1.0),
            }
            let sum: f32 = sample_weights[range.clone()].iter().sum();
            if !is_nearly_zero(sum) {
                for w in &mut sample_weights[range] {
                    *w /= sum;
                }
            }
        }

        // The horizon size factor treats every feature of a horizon as the same size, which
        // only holds for channels with one feature per subsample.
        let mut horizon_sums = [0.0f32; 2];
        let features: Vec<usize> = layout
            .features_by(Some(channel_idx), None)
            .map(|(idx, _)| idx)
            .collect();
        for &feature_idx in &features {
            let feature = &layout.features[feature_idx];
            let Some(h) = [HISTORY, PREDICTION]
                .into_iter()
                .find(|&h| horizons[h].contains(&feature.subsample_idx))
            else {
                continue;
            };
            let weight = sample_weights[feature.subsample_idx]
                * (horizons[h].len() as f32 * type_weights[feature.feature_type.index()]);
            per_feature[feature_idx] = weight;
            horizon_sums[h] += weight;
        }
        for &feature_idx in &features {
            let feature = &layout.features[feature_idx];
            let Some(h) = [HISTORY, PREDICTION]
                .into_iter()
                .find(|&h| horizons[h].contains(&feature.subsample_idx))
            else {
                continue;
            };
            if !is_nearly_zero(horizon_sums[h]) {
                per_feature[feature_idx] *= horizon_weights[h] / horizon_sums[h];
            }
            per_feature[feature_idx] *= channel_weights[channel_idx];
        }
    }

    let mut per_float = vec![0.0f32; layout.num_floats];
    for (feature, weight) in layout.features.iter().zip(&per_feature) {
        let offset = feature.value_offset;
        per_float[offset..offset + feature.num_floats()].fill(*weight);
    }
    FeatureWeights {
        per_feature,
        per_float,
    }
}

/// Computed default and per-group weights of one database, tagged with the database's
/// content hash.
#[derive(Clone, Debug, Default)]
pub struct WeightsContext {
    source_hash: Option<u64>,
    default_weights: FeatureWeights,
    group_weights: Vec<FeatureWeights>,
}

impl WeightsContext {
    pub fn new(database: &PoseSearchDatabase) -> Self {
        let mut context = Self::default();
        context.update(database);
        context
    }

    /// Recomputes the weights if `database` changed since the last update.
    pub fn update(&mut self, database: &PoseSearchDatabase) -> bool {
        let hash = database.content_hash();
        if self.source_hash == Some(hash) {
            return false;
        }
        let schema = database.schema();
        self.default_weights = compute_weights(&database.config.default_weights, schema);
        self.group_weights = database
            .config
            .groups
            .iter()
            .map(|group| compute_weights(&group.weights, schema))
            .collect();
        self.source_hash = Some(hash);
        log::debug!(
            "weights recomputed for database {hash:#x} ({} groups)",
            self.group_weights.len()
        );
        true
    }

    #[inline]
    pub fn source_hash(&self) -> Option<u64> {
        self.source_hash
    }

    /// Per-float weights of `group_idx`; `None` selects the default weights.
    pub fn group_weights(&self, group_idx: Option<usize>) -> Option<&[f32]> {
        match group_idx {
            None => Some(&self.default_weights.per_float),
            Some(idx) => self.group_weights.get(idx).map(|w| w.per_float.as_slice()),
        }
    }
}

/// Recently used weight contexts keyed by database content hash.
pub struct WeightsCache {
    cache: LruCache<u64, Arc<WeightsContext>>,
}

impl WeightsCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(capacity),
        }
    }

    /// Weights for `database`, computed on a miss.
    pub fn get_or_compute(&mut self, database: &PoseSearchDatabase) -> Arc<WeightsContext> {
        let hash = database.content_hash();
        if let Some(context) = self.cache.get(&hash) {
            return context.clone();
        }
        let context = Arc::new(WeightsContext::new(database));
        self.cache.put(hash, context.clone());
        context
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }
}

impl Default for WeightsCache {
    fn default() -> Self {
        Self::new(4)
    }
}
