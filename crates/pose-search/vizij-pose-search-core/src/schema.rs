//! Feature schema: channel list, resolved layout, bone references and sampling rate.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::channels::{ChannelConfig, FeatureChannel};
use crate::error::{PoseSearchError, Result};
use crate::layout::{FeatureDescriptor, FeatureLayout};
use crate::skeleton::Skeleton;

pub const MIN_SAMPLE_RATE: u32 = 1;
pub const MAX_SAMPLE_RATE: u32 = 60;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataPreprocessor {
    None,
    /// Resolves to [`DataPreprocessor::Normalize`].
    #[default]
    Automatic,
    Normalize,
    Sphere,
}

impl DataPreprocessor {
    #[inline]
    pub fn effective(self) -> Self {
        match self {
            Self::Automatic => Self::Normalize,
            other => other,
        }
    }
}

/// Domain a channel's sample offsets are expressed in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HorizonDomain {
    /// Seconds.
    #[default]
    Time,
    /// Accumulated root distance.
    Distance,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    /// Poses per second, clamped to 1..=60.
    pub sample_rate: u32,
    pub data_preprocessor: DataPreprocessor,
    pub channels: Vec<ChannelConfig>,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            sample_rate: 10,
            data_preprocessor: DataPreprocessor::Automatic,
            channels: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct BoneReference {
    pub name: String,
    /// Skeleton bone, resolved by [`Schema::finalize`].
    pub bone_idx: Option<usize>,
}

/// Passed to each channel while the layout is rebuilt.
pub struct SchemaInitializer<'a> {
    channel_idx: usize,
    layout: &'a mut FeatureLayout,
    bone_references: &'a mut Vec<BoneReference>,
}

impl<'a> SchemaInitializer<'a> {
    #[inline]
    pub fn channel_idx(&self) -> usize {
        self.channel_idx
    }

    pub fn add_feature(&mut self, feature: FeatureDescriptor) {
        self.layout.add(feature);
    }

    /// Returns the schema-level bone reference index for `name`.
    pub fn add_bone_reference(&mut self, name: &str) -> usize {
        if let Some(idx) = self.bone_references.iter().position(|b| b.name == name) {
            return idx;
        }
        self.bone_references.push(BoneReference {
            name: name.to_string(),
            bone_idx: None,
        });
        self.bone_references.len() - 1
    }
}

#[derive(Debug)]
pub struct Schema {
    config: SchemaConfig,
    sample_rate: u32,
    effective_preprocessor: DataPreprocessor,
    channels: Vec<Box<dyn FeatureChannel>>,
    pub layout: FeatureLayout,
    skeleton: Arc<Skeleton>,
    bone_references: Vec<BoneReference>,
    bone_indices_with_parents: Vec<usize>,
}

impl Schema {
    /// Builds the channels described by `config` and finalizes the layout.
    pub fn new(config: SchemaConfig, skeleton: Arc<Skeleton>) -> Self {
        let channels = config.channels.iter().map(ChannelConfig::build).collect();
        let mut schema = Self {
            sample_rate: config.sample_rate.clamp(MIN_SAMPLE_RATE, MAX_SAMPLE_RATE),
            effective_preprocessor: config.data_preprocessor.effective(),
            config,
            channels,
            layout: FeatureLayout::default(),
            skeleton,
            bone_references: Vec::new(),
            bone_indices_with_parents: Vec::new(),
        };
        schema.finalize();
        schema
    }

    /// Rebuilds the layout and bone caches from the channel list.
    pub fn finalize(&mut self) {
        self.layout.reset();
        self.bone_references.clear();

        let mut channels = std::mem::take(&mut self.channels);
        for (channel_idx, channel) in channels.iter_mut().enumerate() {
            let mut initializer = SchemaInitializer {
                channel_idx,
                layout: &mut self.layout,
                bone_references: &mut self.bone_references,
            };
            channel.initialize_schema(&mut initializer);
        }
        self.channels = channels;
        self.layout.finalize();

        for reference in &mut self.bone_references {
            reference.bone_idx = self.skeleton.find_bone(&reference.name);
            if reference.bone_idx.is_none() {
                log::warn!("schema bone '{}' not found in skeleton", reference.name);
            }
        }
        let resolved: Vec<usize> = self
            .bone_references
            .iter()
            .filter_map(|reference| reference.bone_idx)
            .collect();
        self.bone_indices_with_parents = self.skeleton.with_parents(&resolved);
    }

    pub fn is_valid(&self) -> bool {
        self.layout.is_valid(self.channels.len())
            && self.bone_references.iter().all(|b| b.bone_idx.is_some())
    }

    pub fn validate(&self) -> Result<()> {
        if !self.layout.is_valid(self.channels.len()) {
            return Err(PoseSearchError::InvalidSchema {
                reason: format!(
                    "layout has {} floats over {} channels",
                    self.layout.num_floats,
                    self.channels.len()
                ),
            });
        }
        if let Some(missing) = self.bone_references.iter().find(|b| b.bone_idx.is_none()) {
            return Err(PoseSearchError::InvalidSchema {
                reason: format!("bone '{}' is not part of the skeleton", missing.name),
            });
        }
        Ok(())
    }

    #[inline]
    pub fn config(&self) -> &SchemaConfig {
        &self.config
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[inline]
    pub fn sampling_interval(&self) -> f32 {
        1.0 / self.sample_rate as f32
    }

    #[inline]
    pub fn effective_preprocessor(&self) -> DataPreprocessor {
        self.effective_preprocessor
    }

    #[inline]
    pub fn channels(&self) -> &[Box<dyn FeatureChannel>] {
        &self.channels
    }

    #[inline]
    pub fn skeleton(&self) -> &Arc<Skeleton> {
        &self.skeleton
    }

    pub fn bone_references(&self) -> &[BoneReference] {
        &self.bone_references
    }

    /// Skeleton bone for a schema bone reference.
    pub fn bone_index(&self, reference_idx: usize) -> Option<usize> {
        self.bone_references
            .get(reference_idx)
            .and_then(|reference| reference.bone_idx)
    }

    pub fn bone_indices_with_parents(&self) -> &[usize] {
        &self.bone_indices_with_parents
    }

    pub fn channel_sample_offsets(&self, channel_idx: usize) -> &[f32] {
        self.channels
            .get(channel_idx)
            .map(|channel| channel.sample_offsets())
            .unwrap_or(&[])
    }

    /// Hull of the sample offsets of every channel in `domain`.
    pub fn horizon_range(&self, domain: HorizonDomain) -> Option<(f32, f32)> {
        self.channels
            .iter()
            .filter(|channel| channel.horizon_domain() == domain)
            .flat_map(|channel| channel.sample_offsets().iter().copied())
            .fold(None, |range, offset| match range {
                None => Some((offset, offset)),
                Some((lo, hi)) => Some((f32::min(lo, offset), f32::max(hi, offset))),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{PoseChannelConfig, TrajectoryChannelConfig};
    use crate::math::Transform;
    use crate::skeleton::Bone;

    fn mk_skeleton() -> Arc<Skeleton> {
        let bones = ["root", "pelvis", "foot_l"]
            .iter()
            .enumerate()
            .map(|(idx, name)| Bone {
                name: name.to_string(),
                parent: idx.checked_sub(1),
                reference: Transform::identity(),
            })
            .collect();
        Arc::new(Skeleton::new(bones).unwrap())
    }

    fn mk_config() -> SchemaConfig {
        SchemaConfig {
            sample_rate: 120,
            channels: vec![
                ChannelConfig::Trajectory(TrajectoryChannelConfig {
                    domain: HorizonDomain::Time,
                    sample_offsets: vec![0.5, -0.25, 0.0],
                    ..Default::default()
                }),
                ChannelConfig::Pose(PoseChannelConfig {
                    sampled_bones: vec!["foot_l".into()],
                    sample_time_offsets: vec![0.0],
                    ..Default::default()
                }),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn finalize_is_idempotent() {
        let mut schema = Schema::new(mk_config(), mk_skeleton());
        assert!(schema.is_valid());
        let layout = schema.layout.clone();
        schema.finalize();
        assert_eq!(schema.layout, layout);
        assert_eq!(schema.sample_rate(), MAX_SAMPLE_RATE);
        assert_eq!(schema.effective_preprocessor(), DataPreprocessor::Normalize);
        assert_eq!(schema.bone_indices_with_parents(), &[0, 1, 2]);
    }

    #[test]
    fn horizon_range_hulls_offsets() {
        let schema = Schema::new(mk_config(), mk_skeleton());
        assert_eq!(schema.horizon_range(HorizonDomain::Time), Some((-0.25, 0.5)));
        assert_eq!(schema.horizon_range(HorizonDomain::Distance), None);
        assert_eq!(schema.channel_sample_offsets(0), &[-0.25, 0.0, 0.5]);
    }

    #[test]
    fn unknown_bone_invalidates_schema() {
        let mut config = mk_config();
        config.channels[1] = ChannelConfig::Pose(PoseChannelConfig {
            sampled_bones: vec!["tail".into()],
            ..Default::default()
        });
        let schema = Schema::new(config, mk_skeleton());
        assert!(!schema.is_valid());
        assert!(matches!(
            schema.validate(),
            Err(PoseSearchError::InvalidSchema { .. })
        ));
    }

    #[test]
    fn empty_schema_is_invalid() {
        let schema = Schema::new(SchemaConfig::default(), mk_skeleton());
        assert!(!schema.is_valid());
        assert_eq!(schema.sampling_interval(), 0.1);
    }
}
