//! Error types for pose search indexing and queries.

use serde::{Deserialize, Serialize};

/// Errors surfaced by schema setup, index builds, queries and pose history updates.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum PoseSearchError {
    /// Schema failed validation (empty layout, out of range channel, unresolved bone)
    #[error("Invalid schema: {reason}")]
    InvalidSchema { reason: String },

    /// Mirrored sampling was requested but the database has no mirror data
    #[error("Mirrored asset '{asset}' requested without mirror data")]
    MissingMirrorData { asset: String },

    /// A sequence source references no clip or a zero-length clip
    #[error("Sequence {sequence_idx} has no usable animation clip")]
    MissingClip { sequence_idx: usize },

    /// Database has nothing to index
    #[error("Database has no sequences or blend spaces to index")]
    NoSources,

    /// Configuration value outside its accepted domain
    #[error("Invalid configuration: {field} = {value}")]
    InvalidConfig { field: String, value: String },

    /// Some channels could not populate every pose of some asset
    #[error("Indexing failed for channels {channels:?}")]
    IncompleteChannels { channels: Vec<usize> },

    /// Index is missing or structurally inconsistent
    #[error("Search index is invalid: {reason}")]
    InvalidIndex { reason: String },

    /// Query length does not match the schema layout
    #[error("Query dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Index has no poses
    #[error("Search index is empty")]
    EmptyIndex,

    /// Every candidate was filtered or blocked
    #[error("No pose found")]
    NotFound,

    /// Root motion delta required by the history update mode was not supplied
    #[error("Pose history update is missing root motion data")]
    MissingRootMotion,

    /// History cannot be sampled at the requested time
    #[error("Pose history unavailable at {seconds_ago}s ago")]
    HistoryUnavailable { seconds_ago: f32 },

    /// Serialization error
    #[error("Serialization error: {reason}")]
    Serialization { reason: String },
}

impl PoseSearchError {
    /// Check if this is a recoverable error
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::DimensionMismatch { .. }
                | Self::EmptyIndex
                | Self::NotFound
                | Self::MissingRootMotion
                | Self::HistoryUnavailable { .. }
        )
    }

    /// Get error category for logging
    #[inline]
    pub fn category(&self) -> &'static str {
        match self {
            Self::InvalidSchema { .. }
            | Self::MissingMirrorData { .. }
            | Self::MissingClip { .. }
            | Self::NoSources
            | Self::InvalidConfig { .. } => "config",
            Self::IncompleteChannels { .. } | Self::InvalidIndex { .. } => "indexing",
            Self::DimensionMismatch { .. } | Self::EmptyIndex | Self::NotFound => "query",
            Self::MissingRootMotion | Self::HistoryUnavailable { .. } => "history",
            Self::Serialization { .. } => "serialization",
        }
    }
}

impl From<serde_json::Error> for PoseSearchError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            reason: err.to_string(),
        }
    }
}

pub type Result<T> = core::result::Result<T, PoseSearchError>;
