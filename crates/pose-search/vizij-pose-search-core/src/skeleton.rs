//! Bone hierarchy, local-space poses and mirroring tables.

use hashbrown::HashMap;
use nalgebra::UnitQuaternion;
use serde::{Deserialize, Serialize};

use crate::error::{PoseSearchError, Result};
use crate::math::{blend_transforms, mirror_rotation, mirror_vector, make_transform, MirrorAxis, Transform};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bone {
    pub name: String,
    /// Parents always precede their children.
    pub parent: Option<usize>,
    /// Reference (bind) transform relative to the parent.
    pub reference: Transform,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Bone>", into = "Vec<Bone>")]
pub struct Skeleton {
    bones: Vec<Bone>,
    component_reference: Vec<Transform>,
}

impl Skeleton {
    pub fn new(bones: Vec<Bone>) -> Result<Self> {
        if bones.is_empty() {
            return Err(PoseSearchError::InvalidConfig {
                field: "skeleton.bones".into(),
                value: "[]".into(),
            });
        }
        for (idx, bone) in bones.iter().enumerate() {
            if matches!(bone.parent, Some(parent) if parent >= idx) {
                return Err(PoseSearchError::InvalidConfig {
                    field: format!("skeleton.bones[{idx}].parent"),
                    value: format!("{:?}", bone.parent),
                });
            }
        }
        let mut component_reference: Vec<Transform> = Vec::with_capacity(bones.len());
        for bone in &bones {
            let transform = match bone.parent {
                Some(parent) => component_reference[parent] * bone.reference,
                None => bone.reference,
            };
            component_reference.push(transform);
        }
        Ok(Self {
            bones,
            component_reference,
        })
    }

    #[inline]
    pub fn num_bones(&self) -> usize {
        self.bones.len()
    }

    pub fn bones(&self) -> &[Bone] {
        &self.bones
    }

    pub fn find_bone(&self, name: &str) -> Option<usize> {
        self.bones.iter().position(|bone| bone.name == name)
    }

    pub fn parent(&self, bone_idx: usize) -> Option<usize> {
        self.bones.get(bone_idx).and_then(|bone| bone.parent)
    }

    pub fn reference_pose(&self) -> Pose {
        Pose::new(self.bones.iter().map(|bone| bone.reference).collect())
    }

    pub fn component_reference_rotation(&self, bone_idx: usize) -> UnitQuaternion<f32> {
        self.component_reference
            .get(bone_idx)
            .map(|transform| transform.rotation)
            .unwrap_or_else(UnitQuaternion::identity)
    }

    /// Local to component space. Bones missing from `pose` fall back to the reference pose.
    pub fn to_component_space(&self, pose: &Pose) -> Vec<Transform> {
        let mut component: Vec<Transform> = Vec::with_capacity(self.bones.len());
        for (idx, bone) in self.bones.iter().enumerate() {
            let local = pose.local.get(idx).copied().unwrap_or(bone.reference);
            let transform = match bone.parent {
                Some(parent) => component[parent] * local,
                None => local,
            };
            component.push(transform);
        }
        component
    }

    /// Sorted bone set closed under the parent relation. The root is always included.
    pub fn with_parents(&self, bones: &[usize]) -> Vec<usize> {
        let mut included = vec![false; self.bones.len()];
        included[0] = true;
        for &bone in bones {
            let mut current = Some(bone);
            while let Some(idx) = current {
                if idx >= included.len() || included[idx] {
                    break;
                }
                included[idx] = true;
                current = self.bones[idx].parent;
            }
        }
        included
            .iter()
            .enumerate()
            .filter_map(|(idx, &flag)| flag.then_some(idx))
            .collect()
    }
}

impl TryFrom<Vec<Bone>> for Skeleton {
    type Error = PoseSearchError;

    fn try_from(bones: Vec<Bone>) -> Result<Self> {
        Self::new(bones)
    }
}

impl From<Skeleton> for Vec<Bone> {
    fn from(skeleton: Skeleton) -> Self {
        skeleton.bones
    }
}

/// Local-space bone transforms indexed like the skeleton.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub local: Vec<Transform>,
}

impl Pose {
    pub fn new(local: Vec<Transform>) -> Self {
        Self { local }
    }

    #[inline]
    pub fn num_bones(&self) -> usize {
        self.local.len()
    }

    pub fn blend(a: &Pose, b: &Pose, alpha: f32) -> Pose {
        Pose::new(
            a.local
                .iter()
                .zip(&b.local)
                .map(|(ta, tb)| blend_transforms(ta, tb, alpha))
                .collect(),
        )
    }

    /// Weighted blend of several poses with identical bone counts.
    pub fn blend_weighted(poses: &[(Pose, f32)]) -> Pose {
        let Some((first, _)) = poses.first() else {
            return Pose::default();
        };
        let num_bones = first.num_bones();
        let local = (0..num_bones)
            .map(|bone| {
                let samples: Vec<(Transform, f32)> = poses
                    .iter()
                    .filter_map(|(pose, weight)| pose.local.get(bone).map(|t| (*t, *weight)))
                    .collect();
                crate::math::blend_weighted(&samples)
            })
            .collect();
        Pose::new(local)
    }
}

/// Mirror configuration: reflection axis plus left/right bone name pairs.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorData {
    pub axis: MirrorAxis,
    pub bone_pairs: Vec<(String, String)>,
}

/// Resolved mirror data for one skeleton.
#[derive(Clone, Debug)]
pub struct MirrorTable {
    axis: MirrorAxis,
    mirror_bone: Vec<usize>,
    reference_rotations: Vec<UnitQuaternion<f32>>,
}

impl MirrorTable {
    pub fn new(skeleton: &Skeleton, data: &MirrorData) -> Self {
        let names: HashMap<&str, usize> = skeleton
            .bones()
            .iter()
            .enumerate()
            .map(|(idx, bone)| (bone.name.as_str(), idx))
            .collect();
        let mut mirror_bone: Vec<usize> = (0..skeleton.num_bones()).collect();
        for (left, right) in &data.bone_pairs {
            match (names.get(left.as_str()), names.get(right.as_str())) {
                (Some(&l), Some(&r)) => {
                    mirror_bone[l] = r;
                    mirror_bone[r] = l;
                }
                _ => log::warn!("mirror pair ({left}, {right}) does not match the skeleton"),
            }
        }
        let reference_rotations = (0..skeleton.num_bones())
            .map(|idx| skeleton.component_reference_rotation(idx))
            .collect();
        Self {
            axis: data.axis,
            mirror_bone,
            reference_rotations,
        }
    }

    #[inline]
    pub fn axis(&self) -> MirrorAxis {
        self.axis
    }

    #[inline]
    pub fn mirror_bone(&self, bone_idx: usize) -> usize {
        self.mirror_bone.get(bone_idx).copied().unwrap_or(bone_idx)
    }

    /// Mirrors `transform` of `source_bone` into the space of `target_bone`, correcting the
    /// rotation by the mirrored reference so symmetric rest poses map onto each other.
    pub fn mirror_bone_transform(
        &self,
        transform: &Transform,
        source_bone: usize,
        target_bone: usize,
    ) -> Transform {
        let identity = UnitQuaternion::identity();
        let source_ref = self.reference_rotations.get(source_bone).unwrap_or(&identity);
        let target_ref = self.reference_rotations.get(target_bone).unwrap_or(&identity);
        let translation = mirror_vector(&transform.translation.vector, self.axis);
        let rotation = mirror_rotation(&transform.rotation, self.axis)
            * mirror_rotation(source_ref, self.axis).inverse()
            * target_ref;
        make_transform(translation, rotation)
    }

    /// Root-space mirror used for trajectories and root motion.
    #[inline]
    pub fn mirror_transform(&self, transform: &Transform) -> Transform {
        self.mirror_bone_transform(transform, 0, 0)
    }
}
