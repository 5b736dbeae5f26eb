//! Shared types for the curate pipeline: configuration and errors.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::key::{INPUT_HASH_FIELD, STAGE_FIELD};

/// Configuration for the image curation pipeline.
///
/// Every field that can change a stage's output lives here, so every
/// field can take part in cache-key derivation (see [`crate::key`]).
///
/// # Unset fields
///
/// Optional fields whose value is `None` mean "no effect on output".
/// They are omitted when serialized and never enter a cache key, so a
/// config with `min_size: None` hashes exactly like a config that never
/// had the field at all. Equality follows the same rule.
///
/// # Extension fields
///
/// Collaborators that need parameters of their own put them in
/// [`extra`](Self::extra). The map is flattened into the top level on
/// serialization, so those fields participate in cache keys without any
/// change to this struct, including the keys of stages scoped to a field
/// list. An `extra` key must not repeat a built-in field name or a
/// reserved key entry; [`validate`](Self::validate) rejects those.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Target resolution in pixels. Used by selection (closest match),
    /// resizing (shorter side) and face cropping (square edge).
    pub target_size: u32,

    /// Comma-separated glob patterns selecting input files,
    /// e.g. `"*.jpg,*.jpeg,*.png"`.
    pub file_pattern: String,

    /// Separator between the grouping prefix and the rest of a file name.
    pub prefix_separator: String,

    /// JPEG quality (1-100) for re-encoded images.
    pub jpeg_quality: u8,

    /// How much larger than the detected face box the zoom crop is.
    pub zoom_factor: f64,

    /// Maximum embedding distance for two faces to count as neighbours
    /// when clustering identities.
    pub face_tolerance: f64,

    /// Minimum neighbourhood size (including the point itself) for a
    /// face to seed an identity cluster.
    pub min_cluster_size: usize,

    /// Minimum width and height kept by the resolution filter.
    /// `None` falls back to `target_size`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_size: Option<u32>,

    /// Additional collaborator-defined parameters.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl PipelineConfig {
    /// Default target resolution.
    pub const DEFAULT_TARGET_SIZE: u32 = 512;
    /// Default input file patterns.
    pub const DEFAULT_FILE_PATTERN: &str = "*.jpg,*.jpeg,*.png";
    /// Default prefix separator.
    pub const DEFAULT_PREFIX_SEPARATOR: &str = "_";
    /// Default JPEG quality.
    pub const DEFAULT_JPEG_QUALITY: u8 = 95;
    /// Default zoom factor around a detected face.
    pub const DEFAULT_ZOOM_FACTOR: f64 = 2.5;
    /// Default clustering tolerance.
    pub const DEFAULT_FACE_TOLERANCE: f64 = 0.6;
    /// Default minimum cluster size.
    pub const DEFAULT_MIN_CLUSTER_SIZE: usize = 3;

    /// Serialized names of the built-in fields.
    pub const FIELD_NAMES: &[&str] = &[
        "target_size",
        "file_pattern",
        "prefix_separator",
        "jpeg_quality",
        "zoom_factor",
        "face_tolerance",
        "min_cluster_size",
        "min_size",
    ];

    /// The individual glob patterns of [`file_pattern`](Self::file_pattern),
    /// trimmed, with empty entries dropped.
    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.file_pattern
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
    }

    /// The effective minimum size for the resolution filter.
    #[must_use]
    pub fn effective_min_size(&self) -> u32 {
        self.min_size.unwrap_or(self.target_size)
    }

    /// The set fields of this config as a sorted map.
    ///
    /// Fields whose value serializes to `null` are dropped.
    ///
    /// # Errors
    ///
    /// Returns the underlying serialization error if the config (in
    /// practice, an `extra` value) cannot be represented as JSON.
    pub fn fields(&self) -> Result<BTreeMap<String, Value>, serde_json::Error> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map.into_iter().filter(|(_, v)| !v.is_null()).collect()),
            // A struct always serializes to an object.
            _ => Ok(BTreeMap::new()),
        }
    }

    /// Check the invariants the stages rely on.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] naming the first offending
    /// field.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.target_size == 0 {
            return Err(PipelineError::InvalidConfig(
                "target_size must be positive".to_string(),
            ));
        }
        if self.patterns().next().is_none() {
            return Err(PipelineError::InvalidConfig(
                "file_pattern must name at least one pattern".to_string(),
            ));
        }
        if self.prefix_separator.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "prefix_separator must not be empty".to_string(),
            ));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(PipelineError::InvalidConfig(format!(
                "jpeg_quality must be in 1..=100, got {}",
                self.jpeg_quality
            )));
        }
        if !self.zoom_factor.is_finite() || self.zoom_factor <= 0.0 {
            return Err(PipelineError::InvalidConfig(format!(
                "zoom_factor must be finite and positive, got {}",
                self.zoom_factor
            )));
        }
        if !self.face_tolerance.is_finite() || self.face_tolerance < 0.0 {
            return Err(PipelineError::InvalidConfig(format!(
                "face_tolerance must be finite and non-negative, got {}",
                self.face_tolerance
            )));
        }
        if self.min_cluster_size == 0 {
            return Err(PipelineError::InvalidConfig(
                "min_cluster_size must be at least 1".to_string(),
            ));
        }
        let reserved = [STAGE_FIELD, INPUT_HASH_FIELD];
        if let Some(name) = self.extra.keys().find(|name| {
            Self::FIELD_NAMES.contains(&name.as_str()) || reserved.contains(&name.as_str())
        }) {
            return Err(PipelineError::InvalidConfig(format!(
                "extra field `{name}` shadows a built-in field"
            )));
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            target_size: Self::DEFAULT_TARGET_SIZE,
            file_pattern: Self::DEFAULT_FILE_PATTERN.to_string(),
            prefix_separator: Self::DEFAULT_PREFIX_SEPARATOR.to_string(),
            jpeg_quality: Self::DEFAULT_JPEG_QUALITY,
            zoom_factor: Self::DEFAULT_ZOOM_FACTOR,
            face_tolerance: Self::DEFAULT_FACE_TOLERANCE,
            min_cluster_size: Self::DEFAULT_MIN_CLUSTER_SIZE,
            min_size: None,
            extra: BTreeMap::new(),
        }
    }
}

impl PartialEq for PipelineConfig {
    /// Two configs are equal when their set fields are equal; unset
    /// (`None`/`null`) fields are ignored.
    fn eq(&self, other: &Self) -> bool {
        match (self.fields(), other.fields()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

/// Errors raised while fingerprinting a directory.
#[derive(Debug, thiserror::Error)]
pub enum FingerprintError {
    /// The directory could not be listed.
    #[error("failed to list {}: {source}", path.display())]
    ReadDir {
        /// Directory being listed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// An entry could not be stat-ed.
    #[error("failed to stat {}: {source}", path.display())]
    Metadata {
        /// Entry being inspected.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A file could not be read (strict mode only).
    #[error("failed to read {}: {source}", path.display())]
    Read {
        /// File being hashed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The listing could not be serialized for hashing.
    #[error("failed to serialize listing of {}: {source}", path.display())]
    Serialize {
        /// Directory being fingerprinted.
        path: PathBuf,
        /// Underlying serialization error.
        #[source]
        source: serde_json::Error,
    },
}

/// Errors raised while deriving a cache key.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    /// The config could not be serialized.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The config did not serialize to a key/value mapping.
    #[error("configuration must serialize to a JSON object")]
    NotAnObject,
}

/// A cache entry directory exists but cannot be used.
#[derive(Debug, thiserror::Error)]
pub enum CacheDirectoryError {
    /// An I/O operation on the entry failed.
    #[error("{} is unusable: {source}", path.display())]
    Io {
        /// Path of the entry (or its staging directory).
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The entry path exists but is not a directory.
    #[error("{} exists but is not a directory", path.display())]
    NotADirectory {
        /// Path of the entry.
        path: PathBuf,
    },
}

/// Errors raised by a stage transform.
#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    /// An input could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Read {
        /// File or directory being read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// An output could not be written.
    #[error("failed to write {}: {source}", path.display())]
    Write {
        /// File being written.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// An output image could not be encoded.
    #[error("failed to encode {}: {source}", path.display())]
    Encode {
        /// File being written.
        path: PathBuf,
        /// Underlying codec error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The configuration is unusable for this transform.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An external collaborator (face detector, encoder, ...) failed.
    #[error("{collaborator} failed on {}: {source}", path.display())]
    Collaborator {
        /// Which collaborator failed.
        collaborator: &'static str,
        /// File being processed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Errors that abort a pipeline run.
///
/// Every stage-level variant names the stage, and the key once it is
/// known, so a failure can be traced to its cache entry.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The pipeline root input directory does not exist.
    #[error("input directory does not exist: {}", path.display())]
    InputNotFound {
        /// The missing directory.
        path: PathBuf,
    },

    /// Pipeline configuration is invalid.
    #[error("invalid pipeline configuration: {0}")]
    InvalidConfig(String),

    /// The stage graph is malformed.
    #[error("invalid pipeline graph: {0}")]
    InvalidGraph(String),

    /// A stage's input directory could not be fingerprinted.
    #[error("stage `{stage}`: {source}")]
    Fingerprint {
        /// Stage being resolved.
        stage: String,
        /// Underlying fingerprint error.
        #[source]
        source: FingerprintError,
    },

    /// A stage's cache key could not be derived.
    #[error("stage `{stage}`: {source}")]
    Key {
        /// Stage being resolved.
        stage: String,
        /// Underlying key error.
        #[source]
        source: KeyError,
    },

    /// A stage's cache directory is unusable.
    #[error("stage `{stage}` ({key}): cache directory {source}")]
    CacheDirectory {
        /// Stage being resolved.
        stage: String,
        /// Cache entry name (`{stage}_{hash}`).
        key: String,
        /// Underlying directory error.
        #[source]
        source: CacheDirectoryError,
    },

    /// A stage's transform failed during recomputation.
    #[error("stage `{stage}` ({key}): {source}")]
    Transform {
        /// Stage being recomputed.
        stage: String,
        /// Cache entry name (`{stage}_{hash}`).
        key: String,
        /// Underlying transform error.
        #[source]
        source: TransformError,
    },
}

impl PipelineError {
    /// The stage this error belongs to, if any.
    #[must_use]
    pub fn stage(&self) -> Option<&str> {
        match self {
            Self::Fingerprint { stage, .. }
            | Self::Key { stage, .. }
            | Self::CacheDirectory { stage, .. }
            | Self::Transform { stage, .. } => Some(stage),
            Self::InputNotFound { .. } | Self::InvalidConfig(_) | Self::InvalidGraph(_) => None,
        }
    }
}
