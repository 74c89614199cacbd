//! Single-flight publication of built indices: searches read an `Arc` snapshot while rebuilds
//! are keyed by the database content hash.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::build::build_index;
use crate::database::PoseSearchDatabase;
use crate::error::Result;
use crate::index::SearchIndex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    Published { generation: u64 },
    /// The published index already matches the database.
    UpToDate,
    /// Another caller is building this exact database.
    InFlight,
    /// The database changed while building; the result was dropped.
    Superseded,
}

#[derive(Debug, Default)]
struct Published {
    index: Option<Arc<SearchIndex>>,
    key: Option<u64>,
    generation: u64,
}

#[derive(Debug, Default)]
pub struct IndexPublisher {
    pending_key: Mutex<Option<u64>>,
    published: RwLock<Published>,
}

impl IndexPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the published index.
    pub fn current(&self) -> Option<Arc<SearchIndex>> {
        self.published.read().index.clone()
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.published.read().generation
    }

    pub fn published_key(&self) -> Option<u64> {
        self.published.read().key
    }

    /// True once the index of the most recently requested database is published.
    pub fn is_valid_for_search(&self) -> bool {
        let pending = *self.pending_key.lock();
        let published = self.published.read();
        published.index.is_some() && published.key.is_some() && published.key == pending
    }

    /// Builds and publishes `database` unless an index for its content is already
    /// published or being built. `force` rebuilds even when the published key matches.
    pub fn request_build(
        &self,
        database: &PoseSearchDatabase,
        force: bool,
    ) -> Result<PublishOutcome> {
        let key = database.content_hash();
        {
            let mut pending = self.pending_key.lock();
            if force {
                self.published.write().key = None;
            } else {
                if self.published.read().key == Some(key) {
                    *pending = Some(key);
                    return Ok(PublishOutcome::UpToDate);
                }
                if *pending == Some(key) {
                    return Ok(PublishOutcome::InFlight);
                }
            }
            *pending = Some(key);
        }

        self.finish_build(key, build_index(database))
    }

    /// Publishes `built` under `key` if no newer request replaced it. Build errors are
    /// reported even when the request was superseded.
    fn finish_build(&self, key: u64, built: Result<SearchIndex>) -> Result<PublishOutcome> {
        let mut pending = self.pending_key.lock();
        let index = match built {
            Ok(index) => index,
            Err(err) => {
                log::error!("building index {key:#x} failed: {err}");
                if *pending == Some(key) {
                    *pending = None;
                }
                return Err(err);
            }
        };
        if *pending != Some(key) {
            log::debug!("dropping index {key:#x}: superseded by {:?}", *pending);
            return Ok(PublishOutcome::Superseded);
        }
        let mut published = self.published.write();
        published.index = Some(Arc::new(index));
        published.key = Some(key);
        published.generation += 1;
        log::debug!(
            "published index {key:#x} as generation {}",
            published.generation
        );
        Ok(PublishOutcome::Published {
            generation: published.generation,
        })
    }

    /// Drops the published index.
    pub fn clear(&self) {
        *self.pending_key.lock() = None;
        let mut published = self.published.write();
        published.index = None;
        published.key = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{ChannelConfig, TrajectoryChannelConfig};
    use crate::clip::{AnimationClip, BakedClip};
    use crate::database::{DatabaseConfig, SequenceSource};
    use crate::math::{make_transform, Transform};
    use crate::schema::SchemaConfig;
    use crate::skeleton::{Bone, Pose, Skeleton};
    use nalgebra::{UnitQuaternion, Vector3};

    fn mk_database(speed: f32) -> PoseSearchDatabase {
        mk_database_with_reference(speed, Transform::identity())
    }

    fn mk_database_with_reference(speed: f32, reference: Transform) -> PoseSearchDatabase {
        let skeleton = Arc::new(
            Skeleton::new(vec![Bone {
                name: "root".into(),
                parent: None,
                reference,
            }])
            .unwrap(),
        );
        let clip: Arc<dyn AnimationClip> = Arc::new(BakedClip {
            name: "walk".into(),
            frame_rate: 30.0,
            frames: vec![Pose::new(vec![Transform::identity()]); 31],
            root_track: (0..31)
                .map(|i| {
                    make_transform(
                        Vector3::new(0.0, speed * i as f32 / 30.0, 0.0),
                        UnitQuaternion::identity(),
                    )
                })
                .collect(),
            annotations: Vec::new(),
        });
        let config = DatabaseConfig {
            schema: SchemaConfig {
                channels: vec![ChannelConfig::Trajectory(TrajectoryChannelConfig {
                    sample_offsets: vec![0.0, 0.3],
                    ..Default::default()
                })],
                ..Default::default()
            },
            ..Default::default()
        };
        PoseSearchDatabase::new(config, skeleton).with_sequence(SequenceSource::new(clip))
    }

    #[test]
    fn publishes_once_per_content() {
        let publisher = IndexPublisher::new();
        assert!(publisher.current().is_none());
        assert!(!publisher.is_valid_for_search());

        let database = mk_database(2.0);
        assert_eq!(
            publisher.request_build(&database, false).unwrap(),
            PublishOutcome::Published { generation: 1 }
        );
        assert!(publisher.is_valid_for_search());
        assert_eq!(publisher.published_key(), Some(database.content_hash()));
        assert_eq!(
            publisher.request_build(&database, false).unwrap(),
            PublishOutcome::UpToDate
        );
        assert_eq!(
            publisher.request_build(&database, true).unwrap(),
            PublishOutcome::Published { generation: 2 }
        );
    }

    #[test]
    fn snapshots_survive_republishing() {
        let publisher = IndexPublisher::new();
        let original = mk_database(2.0);
        publisher.request_build(&original, false).unwrap();
        let before = publisher.current().unwrap();

        let changed = mk_database(4.0);
        publisher.request_build(&changed, false).unwrap();
        let after = publisher.current().unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(before.num_poses(), after.num_poses());
        assert_eq!(publisher.generation(), 2);

        publisher.clear();
        assert!(publisher.current().is_none());
        assert!(!publisher.is_valid_for_search());
    }

    #[test]
    fn skeleton_edits_trigger_a_rebuild() {
        let publisher = IndexPublisher::new();
        let original = mk_database(2.0);
        publisher.request_build(&original, false).unwrap();

        let rotated = mk_database_with_reference(
            2.0,
            make_transform(
                Vector3::zeros(),
                UnitQuaternion::from_axis_angle(&Vector3::z_axis(), 0.7),
            ),
        );
        assert_ne!(original.content_hash(), rotated.content_hash());
        assert_eq!(
            publisher.request_build(&rotated, false).unwrap(),
            PublishOutcome::Published { generation: 2 }
        );
        assert_eq!(publisher.published_key(), Some(rotated.content_hash()));

        // same content in fresh allocations
        let reference = rotated.schema().skeleton().bones()[0].reference;
        let rebuilt = mk_database_with_reference(2.0, reference);
        assert_eq!(
            publisher.request_build(&rebuilt, false).unwrap(),
            PublishOutcome::UpToDate
        );
    }

    #[test]
    fn superseded_builds_still_report_errors() {
        let publisher = IndexPublisher::new();
        *publisher.pending_key.lock() = Some(2);

        let failed = publisher.finish_build(1, Err(crate::error::PoseSearchError::NoSources));
        assert_eq!(failed, Err(crate::error::PoseSearchError::NoSources));
        // the newer request is untouched
        assert_eq!(*publisher.pending_key.lock(), Some(2));

        let database = mk_database(2.0);
        let built = build_index(&database);
        assert_eq!(
            publisher.finish_build(1, built).unwrap(),
            PublishOutcome::Superseded
        );
        assert!(publisher.current().is_none());
    }

    #[test]
    fn failed_builds_leave_the_previous_index() {
        let publisher = IndexPublisher::new();
        publisher.request_build(&mk_database(2.0), false).unwrap();

        let mut empty = mk_database(2.0);
        empty.sequences.clear();
        assert!(publisher.request_build(&empty, false).is_err());
        assert!(publisher.current().is_some());
        assert!(!publisher.is_valid_for_search());
    }
}
