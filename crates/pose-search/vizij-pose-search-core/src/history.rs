//! Fixed-capacity ring of recent poses, sampled at arbitrary times in the past when building
//! queries.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::error::{PoseSearchError, Result};
use crate::math::{blend_transforms, map_range_unclamped, Transform};
use crate::skeleton::{Pose, Skeleton};

/// How the root transform of each new history entry is obtained.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RootUpdateMode {
    /// Accumulate the root-motion delta extracted from the animation.
    #[default]
    RootMotionDelta,
    /// Take the owner's component transform as is.
    ComponentTransformDelta,
}

#[derive(Clone, Debug, Default, PartialEq)]
struct HistoryEntry {
    pose: Pose,
    root: Transform,
}

/// Component-space pose at some time in the past, plus the pose one sample interval before it.
#[derive(Clone, Debug, PartialEq)]
pub struct HistoryPoseSample {
    pub component: Vec<Transform>,
    pub previous_component: Vec<Transform>,
    pub root: Transform,
    pub previous_root: Transform,
    /// Seconds between the two poses.
    pub interval: f32,
}

#[derive(Clone, Debug)]
pub struct PoseHistory {
    capacity: usize,
    time_horizon: f32,
    root_update_mode: RootUpdateMode,
    /// Ages in seconds, oldest first; the newest knot is always 0.
    knots: VecDeque<f32>,
    entries: VecDeque<HistoryEntry>,
}

impl Default for PoseHistory {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl PoseHistory {
    /// Ring of `capacity` poses (at least 2) covering `time_horizon` seconds.
    pub fn init(capacity: usize, time_horizon: f32) -> Self {
        let capacity = capacity.max(2);
        Self {
            capacity,
            time_horizon: time_horizon.max(0.0),
            root_update_mode: RootUpdateMode::default(),
            knots: VecDeque::with_capacity(capacity),
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::init(config.history_capacity, config.history_horizon)
            .with_root_update_mode(config.root_update_mode)
    }

    pub fn with_root_update_mode(mut self, mode: RootUpdateMode) -> Self {
        self.root_update_mode = mode;
        self
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn time_horizon(&self) -> f32 {
        self.time_horizon
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.knots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.knots.is_empty()
    }

    /// Ages of the retained poses, oldest first.
    pub fn knots(&self) -> impl Iterator<Item = f32> + '_ {
        self.knots.iter().copied()
    }

    /// Spacing the retention policy aims for. One knot is reserved beyond the horizon.
    #[inline]
    pub fn sample_interval(&self) -> f32 {
        self.time_horizon / (self.capacity - 1) as f32
    }

    pub fn clear(&mut self) {
        self.knots.clear();
        self.entries.clear();
    }

    /// Ages every pose by `delta_time` and records `pose` as the newest one.
    ///
    /// `root_motion_delta` is required in [`RootUpdateMode::RootMotionDelta`];
    /// `component_transform` is used in [`RootUpdateMode::ComponentTransformDelta`].
    pub fn update(
        &mut self,
        delta_time: f32,
        pose: &Pose,
        root_motion_delta: Option<&Transform>,
        component_transform: &Transform,
    ) -> Result<()> {
        for knot in &mut self.knots {
            *knot += delta_time;
        }

        if self.knots.len() < self.capacity {
            self.knots.push_back(0.0);
            self.entries.push_back(HistoryEntry::default());
        } else {
            let sample_interval = self.sample_interval();
            let can_evict_oldest = self.knots[1] >= self.time_horizon + sample_interval;
            let should_push_newest = self.knots[self.knots.len() - 2] >= sample_interval;
            if can_evict_oldest && should_push_newest {
                self.knots.pop_front();
                self.knots.push_back(0.0);
                if let Some(recycled) = self.entries.pop_front() {
                    self.entries.push_back(recycled);
                }
            }
        }

        let previous_root = match self.entries.len() {
            len if len > 1 => self.entries[len - 2].root,
            _ => Transform::identity(),
        };
        if let Some(knot) = self.knots.back_mut() {
            *knot = 0.0;
        }
        let Some(newest) = self.entries.back_mut() else {
            return Ok(());
        };
        newest.pose.clone_from(pose);
        newest.root = previous_root;

        match self.root_update_mode {
            RootUpdateMode::RootMotionDelta => match root_motion_delta {
                Some(delta) => newest.root = previous_root * delta,
                None => {
                    log::error!("pose history update without root motion in root motion mode");
                    return Err(PoseSearchError::MissingRootMotion);
                }
            },
            RootUpdateMode::ComponentTransformDelta => newest.root = *component_transform,
        }
        Ok(())
    }

    /// Local pose and root transform `seconds_ago`, interpolated between the bracketing knots.
    /// Only `required_bones` are interpolated; an empty list interpolates every bone.
    pub fn try_sample_local_pose(
        &self,
        seconds_ago: f32,
        required_bones: &[usize],
    ) -> Option<(Pose, Transform)> {
        // knots descend, so this is the first knot no older than the request
        let next_idx = self.knots.partition_point(|&knot| knot > seconds_ago);
        if next_idx == 0 || next_idx >= self.knots.len() {
            return None;
        }
        let prev_idx = next_idx - 1;
        let prev = &self.entries[prev_idx];
        let next = &self.entries[next_idx];
        if prev.pose.num_bones() != next.pose.num_bones()
            || required_bones.len() > prev.pose.num_bones()
        {
            return None;
        }

        let alpha = map_range_unclamped(
            seconds_ago,
            self.knots[prev_idx],
            self.knots[next_idx],
            0.0,
            1.0,
        );
        let pose = if required_bones.is_empty() {
            Pose::blend(&prev.pose, &next.pose, alpha)
        } else {
            let mut local = prev.pose.local.clone();
            for &bone in required_bones {
                if let (Some(out), Some(target)) = (local.get_mut(bone), next.pose.local.get(bone)) {
                    *out = blend_transforms(out, target, alpha);
                }
            }
            Pose::new(local)
        };
        Some((pose, blend_transforms(&prev.root, &next.root, alpha)))
    }

    /// Component-space pose `seconds_ago` and one sample interval before it.
    pub fn try_sample_pose(
        &self,
        seconds_ago: f32,
        skeleton: &Skeleton,
        required_bones: &[usize],
    ) -> Option<HistoryPoseSample> {
        let interval = self.sample_interval();
        let (pose, root) = self.try_sample_local_pose(seconds_ago, required_bones)?;
        let (previous_pose, previous_root) =
            self.try_sample_local_pose(seconds_ago + interval, required_bones)?;
        Some(HistoryPoseSample {
            component: skeleton.to_component_space(&pose),
            previous_component: skeleton.to_component_space(&previous_pose),
            root,
            previous_root,
            interval,
        })
    }
}
