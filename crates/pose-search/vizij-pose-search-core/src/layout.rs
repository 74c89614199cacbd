//! Feature layout: which features exist in a pose vector and where they live.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FeatureType {
    Position,
    /// Stored as the rotation's X and Y axes.
    Rotation,
    LinearVelocity,
    AngularVelocity,
    ForwardVector,
}

impl FeatureType {
    pub const ALL: [FeatureType; 5] = [
        FeatureType::Position,
        FeatureType::Rotation,
        FeatureType::LinearVelocity,
        FeatureType::AngularVelocity,
        FeatureType::ForwardVector,
    ];

    #[inline]
    pub const fn num_floats(self) -> usize {
        match self {
            FeatureType::Rotation => 6,
            _ => 3,
        }
    }

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// One feature of one channel at one sample offset.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct FeatureDescriptor {
    pub channel_idx: usize,
    pub channel_feature_id: usize,
    pub subsample_idx: usize,
    pub feature_type: FeatureType,
    /// Assigned by [`FeatureLayout::finalize`].
    pub value_offset: usize,
}

impl FeatureDescriptor {
    pub fn new(
        channel_idx: usize,
        channel_feature_id: usize,
        subsample_idx: usize,
        feature_type: FeatureType,
    ) -> Self {
        Self {
            channel_idx,
            channel_feature_id,
            subsample_idx,
            feature_type,
            value_offset: 0,
        }
    }

    /// Same channel, id and subsample with a different type.
    #[inline]
    pub fn with_type(mut self, feature_type: FeatureType) -> Self {
        self.feature_type = feature_type;
        self
    }

    #[inline]
    pub fn num_floats(&self) -> usize {
        self.feature_type.num_floats()
    }
}

impl PartialEq for FeatureDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.channel_idx == other.channel_idx
            && self.channel_feature_id == other.channel_feature_id
            && self.subsample_idx == other.subsample_idx
            && self.feature_type == other.feature_type
    }
}

impl Eq for FeatureDescriptor {}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureLayout {
    pub features: Vec<FeatureDescriptor>,
    pub num_floats: usize,
}

impl FeatureLayout {
    pub fn reset(&mut self) {
        self.features.clear();
        self.num_floats = 0;
    }

    pub fn add(&mut self, feature: FeatureDescriptor) {
        self.features.push(feature);
    }

    /// Assigns offsets in declaration order.
    pub fn finalize(&mut self) {
        let mut offset = 0;
        for feature in &mut self.features {
            feature.value_offset = offset;
            offset += feature.num_floats();
        }
        self.num_floats = offset;
    }

    pub fn is_valid(&self, channel_count: usize) -> bool {
        self.num_floats > 0
            && self
                .features
                .iter()
                .all(|feature| feature.channel_idx < channel_count)
    }

    #[inline]
    pub fn num_features(&self) -> usize {
        self.features.len()
    }

    pub fn find(&self, feature: &FeatureDescriptor) -> Option<usize> {
        self.features.iter().position(|candidate| candidate == feature)
    }

    /// Advances `cursor` to the next feature matching the optional channel and type
    /// filters and returns its index.
    pub fn enumerate_by(
        &self,
        channel_idx: Option<usize>,
        feature_type: Option<FeatureType>,
        cursor: &mut usize,
    ) -> Option<usize> {
        while *cursor < self.features.len() {
            let idx = *cursor;
            *cursor += 1;
            let feature = &self.features[idx];
            if channel_idx.map_or(true, |c| c == feature.channel_idx)
                && feature_type.map_or(true, |t| t == feature.feature_type)
            {
                return Some(idx);
            }
        }
        None
    }

    /// Iterator form of [`Self::enumerate_by`].
    pub fn features_by(
        &self,
        channel_idx: Option<usize>,
        feature_type: Option<FeatureType>,
    ) -> impl Iterator<Item = (usize, &FeatureDescriptor)> + '_ {
        let mut cursor = 0;
        std::iter::from_fn(move || {
            self.enumerate_by(channel_idx, feature_type, &mut cursor)
                .map(|idx| (idx, &self.features[idx]))
        })
    }

    pub fn channel_has_type(&self, channel_idx: usize, feature_type: FeatureType) -> bool {
        self.enumerate_by(Some(channel_idx), Some(feature_type), &mut 0)
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk_layout() -> FeatureLayout {
        let mut layout = FeatureLayout::default();
        layout.add(FeatureDescriptor::new(0, 0, 0, FeatureType::Position));
        layout.add(FeatureDescriptor::new(0, 0, 0, FeatureType::Rotation));
        layout.add(FeatureDescriptor::new(1, 0, 0, FeatureType::LinearVelocity));
        layout.add(FeatureDescriptor::new(1, 0, 1, FeatureType::ForwardVector));
        layout
    }

    #[test]
    fn finalize_assigns_sequential_offsets() {
        let mut layout = mk_layout();
        layout.finalize();
        let offsets: Vec<_> = layout.features.iter().map(|f| f.value_offset).collect();
        assert_eq!(offsets, vec![0, 3, 9, 12]);
        assert_eq!(layout.num_floats, 15);

        let first = layout.clone();
        layout.finalize();
        assert_eq!(layout, first, "finalize must be idempotent");
        assert!(layout.is_valid(2));
        assert!(!layout.is_valid(1));
        assert!(!FeatureLayout::default().is_valid(4));
    }

    #[test]
    fn equality_ignores_offset() {
        let mut a = FeatureDescriptor::new(2, 1, 0, FeatureType::Position);
        let b = a;
        a.value_offset = 42;
        assert_eq!(a, b);
        assert_ne!(a, b.with_type(FeatureType::Rotation));
    }

    #[test]
    fn enumerate_by_filters_channel_and_type() {
        let mut layout = mk_layout();
        layout.finalize();
        let mut cursor = 0;
        let mut found = Vec::new();
        while let Some(idx) = layout.enumerate_by(Some(1), None, &mut cursor) {
            found.push(idx);
        }
        assert_eq!(found, vec![2, 3]);

        let positions: Vec<_> = layout
            .features_by(None, Some(FeatureType::Position))
            .map(|(idx, _)| idx)
            .collect();
        assert_eq!(positions, vec![0]);
        assert!(layout.channel_has_type(0, FeatureType::Rotation));
        assert!(!layout.channel_has_type(1, FeatureType::Rotation));
    }
}
