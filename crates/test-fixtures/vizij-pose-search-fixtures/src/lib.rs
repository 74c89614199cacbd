use std::collections::HashMap;
use std::f32::consts::TAU;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use nalgebra::{UnitQuaternion, Vector2, Vector3};
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use vizij_pose_search_core::clip::{AnimationClip, BlendParameter, GridBlendSample, GridBlendSpace};
use vizij_pose_search_core::math::make_transform;
use vizij_pose_search_core::{
    BakedClip, Bone, DatabaseConfig, MirrorOption, Pose, PoseSearchDatabase, SequenceSource,
    Skeleton, Transform,
};

static MANIFEST: Lazy<Manifest> = Lazy::new(|| {
    let raw = include_str!("../../../../fixtures/manifest.json");
    serde_json::from_str(raw).expect("fixtures manifest should parse")
});

#[derive(Debug, Deserialize)]
struct Manifest {
    databases: HashMap<String, String>,
    skeletons: HashMap<String, String>,
}

fn fixtures_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../../fixtures")
}

fn resolve_path(rel: &str) -> PathBuf {
    fixtures_root().join(rel)
}

fn read_to_string(rel: &str) -> Result<String> {
    let path = resolve_path(rel);
    fs::read_to_string(&path)
        .with_context(|| format!("failed to read fixture at {}", path.display()))
}

fn load_json<T: DeserializeOwned>(rel: &str) -> Result<T> {
    let text = read_to_string(rel)?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse JSON fixture {rel}"))
}

fn lookup<'a>(map: &'a HashMap<String, String>, kind: &str, name: &str) -> Result<&'a String> {
    map.get(name)
        .ok_or_else(|| anyhow!("unknown {kind} fixture '{name}'"))
}

pub mod databases {
    use super::*;

    pub fn keys() -> Vec<String> {
        MANIFEST.databases.keys().cloned().collect()
    }

    pub fn json(name: &str) -> Result<String> {
        let rel = lookup(&MANIFEST.databases, "database", name)?;
        read_to_string(rel)
    }

    pub fn config(name: &str) -> Result<DatabaseConfig> {
        let text = json(name)?;
        DatabaseConfig::from_json(&text)
            .map_err(|err| anyhow!("database fixture '{name}' is invalid: {err}"))
    }

    pub fn path(name: &str) -> Result<PathBuf> {
        let rel = lookup(&MANIFEST.databases, "database", name)?;
        Ok(resolve_path(rel))
    }
}

pub mod skeletons {
    use super::*;

    #[derive(Debug, Deserialize)]
    struct SkeletonFixture {
        bones: Vec<BoneFixture>,
    }

    #[derive(Debug, Deserialize)]
    struct BoneFixture {
        name: String,
        parent: Option<String>,
        offset: [f32; 3],
    }

    pub fn keys() -> Vec<String> {
        MANIFEST.skeletons.keys().cloned().collect()
    }

    /// Bones are listed parents first; references are pure offsets.
    pub fn load(name: &str) -> Result<Skeleton> {
        let rel = lookup(&MANIFEST.skeletons, "skeleton", name)?;
        let fixture: SkeletonFixture = load_json(rel)?;
        let mut bones: Vec<Bone> = Vec::with_capacity(fixture.bones.len());
        for bone in fixture.bones {
            let parent = match &bone.parent {
                Some(parent) => Some(
                    bones
                        .iter()
                        .position(|b| &b.name == parent)
                        .ok_or_else(|| anyhow!("bone '{}' has unknown parent '{parent}'", bone.name))?,
                ),
                None => None,
            };
            bones.push(Bone {
                name: bone.name,
                parent,
                reference: make_transform(Vector3::from(bone.offset), UnitQuaternion::identity()),
            });
        }
        Skeleton::new(bones).map_err(|err| anyhow!("skeleton fixture '{name}' is invalid: {err}"))
    }
}

pub fn mk_biped_skeleton() -> Arc<Skeleton> {
    Arc::new(skeletons::load("biped").expect("biped skeleton fixture should load"))
}

/// Procedural locomotion cycle: legs swing around X at `cadence` steps per second while the
/// root travels forward (+Y) at `speed`, turning around Z at `turn_rate` radians per second.
#[derive(Clone, Debug)]
pub struct LocomotionParams {
    pub name: String,
    pub speed: f32,
    pub turn_rate: f32,
    pub cadence: f32,
    pub duration: f32,
    pub frame_rate: f32,
}

impl LocomotionParams {
    pub fn new(name: &str, speed: f32, turn_rate: f32) -> Self {
        Self {
            name: name.into(),
            speed,
            turn_rate,
            cadence: 1.0 + speed * 0.25,
            duration: 2.0,
            frame_rate: 30.0,
        }
    }

    pub fn duration(mut self, duration: f32) -> Self {
        self.duration = duration;
        self
    }
}

fn root_at(params: &LocomotionParams, t: f32) -> Transform {
    let heading = params.turn_rate * t;
    let position = if params.turn_rate.abs() < 1e-4 {
        Vector3::new(0.0, params.speed * t, 0.0)
    } else {
        let radius = params.speed / params.turn_rate;
        Vector3::new(radius * (heading.cos() - 1.0), radius * heading.sin(), 0.0)
    };
    make_transform(position, UnitQuaternion::from_axis_angle(&Vector3::z_axis(), heading))
}

fn pose_at(skeleton: &Skeleton, params: &LocomotionParams, t: f32) -> Pose {
    let phase = TAU * params.cadence * t;
    let stride = (params.speed * 0.15).min(0.7);
    let mut pose = skeleton.reference_pose();
    for (idx, bone) in skeleton.bones().iter().enumerate() {
        let swing = match bone.name.as_str() {
            "thigh_l" => stride * phase.sin(),
            "thigh_r" => -stride * phase.sin(),
            "hand_l" => -0.5 * stride * phase.sin(),
            "hand_r" => 0.5 * stride * phase.sin(),
            _ => 0.0,
        };
        let mut local = bone.reference;
        local.rotation = UnitQuaternion::from_axis_angle(&Vector3::x_axis(), swing);
        if bone.name == "pelvis" {
            local.translation.vector.z += 0.03 * stride * (2.0 * phase).cos();
        }
        pose.local[idx] = local;
    }
    pose
}

pub fn mk_locomotion_clip(skeleton: &Skeleton, params: &LocomotionParams) -> Arc<dyn AnimationClip> {
    let num_frames = (params.duration * params.frame_rate).round() as usize + 1;
    let times = (0..num_frames).map(|frame| frame as f32 / params.frame_rate);
    Arc::new(BakedClip {
        name: params.name.clone(),
        frame_rate: params.frame_rate,
        frames: times.clone().map(|t| pose_at(skeleton, params, t)).collect(),
        root_track: times.map(|t| root_at(params, t)).collect(),
        annotations: Vec::new(),
    })
}

/// 1D speed blend space between a walk (speed 1) and a run (speed 4).
pub fn mk_speed_blend_space(skeleton: &Skeleton) -> GridBlendSpace {
    let walk = mk_locomotion_clip(skeleton, &LocomotionParams::new("bs_walk", 1.0, 0.0));
    let run = mk_locomotion_clip(skeleton, &LocomotionParams::new("bs_run", 4.0, 0.0));
    GridBlendSpace {
        name: "speed".into(),
        horizontal: BlendParameter {
            min: 1.0,
            max: 4.0,
            grid_num: 3,
        },
        vertical: None,
        samples: vec![
            GridBlendSample {
                position: Vector2::new(1.0, 0.0),
                clip: walk,
            },
            GridBlendSample {
                position: Vector2::new(4.0, 0.0),
                clip: run,
            },
        ],
    }
}

/// Walk, run, left turn (tagged `turns`, mirrored when the config carries mirror data) and
/// idle (tagged `idle`).
pub fn mk_locomotion_database(config: DatabaseConfig) -> PoseSearchDatabase {
    let skeleton = mk_biped_skeleton();
    let clip = |name: &str, speed: f32, turn_rate: f32| {
        mk_locomotion_clip(&skeleton, &LocomotionParams::new(name, speed, turn_rate))
    };
    let turn_mirror = if config.mirror_data.is_some() {
        MirrorOption::UnmirroredAndMirrored
    } else {
        MirrorOption::UnmirroredOnly
    };
    let walk = clip("walk", 1.5, 0.0);
    let run = clip("run", 4.0, 0.0);
    let turn = clip("turn_left", 1.5, 1.2);
    let idle = clip("idle", 0.0, 0.0);
    PoseSearchDatabase::new(config, skeleton.clone())
        .with_sequence(SequenceSource::new(walk).looping(true))
        .with_sequence(SequenceSource::new(run).looping(true))
        .with_sequence(
            SequenceSource::new(turn)
                .with_group_tag("turns")
                .with_mirror_option(turn_mirror),
        )
        .with_sequence(SequenceSource::new(idle).looping(true).with_group_tag("idle"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_entries_resolve() {
        for name in databases::keys() {
            assert!(databases::path(&name).unwrap().exists(), "missing {name}");
            databases::config(&name).unwrap();
        }
        assert!(databases::json("nope").is_err());
        assert_eq!(skeletons::keys(), vec!["biped".to_string()]);
    }

    #[test]
    fn biped_skeleton_loads_with_parents() {
        let skeleton = mk_biped_skeleton();
        let foot = skeleton.find_bone("foot_l").unwrap();
        let thigh = skeleton.find_bone("thigh_l").unwrap();
        assert_eq!(skeleton.parent(foot), Some(thigh));
    }

    #[test]
    fn locomotion_clip_moves_forward() {
        let skeleton = mk_biped_skeleton();
        let clip = mk_locomotion_clip(&skeleton, &LocomotionParams::new("walk", 2.0, 0.0));
        assert!((clip.play_length() - 2.0).abs() < 1e-5);
        let end = clip.root_track_transform(clip.play_length());
        assert!((end.translation.y - 4.0).abs() < 1e-4);
    }
}
