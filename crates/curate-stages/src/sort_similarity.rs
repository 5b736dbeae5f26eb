//! Rank images by how closely their faces match a reference set.
//!
//! Every image is copied with its score as a three-digit name prefix
//! (`087_alice_01.jpg`), so a plain directory listing sorts from least to
//! most similar. The score of one face is `1 - d` for the smallest
//! distance `d` to any reference embedding; an image scores its best
//! face, and images without faces score `000`.
//!
//! The reference embeddings are not part of [`PipelineConfig`]. Callers
//! that swap reference sets between runs record the set's identity in
//! `PipelineConfig::extra` (for example `similarity_reference`) so the
//! change reaches this stage's cache key.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use curate_pipeline::{
    ConfigScope, PipelineConfig, StageTransform, TransformError, TransformMetrics,
};
use rayon::prelude::*;

use crate::detect::{FaceEncoder, FaceEncoding, encode_faces};
use crate::files::{copy_renamed, image_files, open_image, process_each};
use crate::identify::distance;

/// Best similarity of any of `faces` to any of `references`, never below 0.
#[must_use]
pub fn best_similarity(faces: &[FaceEncoding], references: &[FaceEncoding]) -> f64 {
    faces
        .iter()
        .filter_map(|face| {
            references
                .iter()
                .map(|reference| distance(face, reference))
                .reduce(f64::min)
        })
        .map(|d| 1.0 - d)
        .fold(0.0, f64::max)
}

/// Similarity in `0..=1` as a whole percentage, rounded down.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
#[must_use]
pub fn similarity_score(similarity: f64) -> u32 {
    (similarity.clamp(0.0, 1.0) * 100.0).floor() as u32
}

/// The sort-by-similarity stage.
pub struct SortSimilarity {
    encoder: Arc<dyn FaceEncoder>,
    references: Vec<FaceEncoding>,
}

impl SortSimilarity {
    /// A stage ranking against `references`.
    ///
    /// # Errors
    ///
    /// Returns [`TransformError::InvalidConfig`] if `references` is empty
    /// or its embeddings differ in length.
    pub fn new(
        encoder: Arc<dyn FaceEncoder>,
        references: Vec<FaceEncoding>,
    ) -> Result<Self, TransformError> {
        let Some(first) = references.first() else {
            return Err(TransformError::InvalidConfig(
                "no reference face encodings".to_string(),
            ));
        };
        if references.iter().any(|r| r.len() != first.len()) {
            return Err(TransformError::InvalidConfig(
                "reference face encodings differ in length".to_string(),
            ));
        }
        Ok(Self {
            encoder,
            references,
        })
    }

    /// A stage ranking against the first face of every image in
    /// `reference_dir`. Images without a face are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`TransformError::Read`] if the directory cannot be
    /// listed, [`TransformError::Collaborator`] if the encoder fails, and
    /// [`TransformError::InvalidConfig`] if no reference face is found.
    pub fn from_reference_dir(
        encoder: Arc<dyn FaceEncoder>,
        reference_dir: &Path,
    ) -> Result<Self, TransformError> {
        let files = image_files(reference_dir)?;
        let references = files
            .par_iter()
            .map(|path| -> Result<Option<FaceEncoding>, TransformError> {
                let Some(img) = open_image(path) else {
                    return Ok(None);
                };
                let first = encode_faces(encoder.as_ref(), &img, path)?.into_iter().next();
                if first.is_none() {
                    tracing::warn!(file = %path.display(), "no face in reference image");
                }
                Ok(first)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let references: Vec<FaceEncoding> = references.into_iter().flatten().collect();
        tracing::info!(
            dir = %reference_dir.display(),
            references = references.len(),
            "loaded reference faces"
        );
        if references.is_empty() {
            return Err(TransformError::InvalidConfig(format!(
                "no reference faces found in {}",
                reference_dir.display()
            )));
        }
        Self::new(encoder, references)
    }

    /// Number of reference embeddings.
    #[must_use]
    pub fn reference_count(&self) -> usize {
        self.references.len()
    }
}

impl fmt::Debug for SortSimilarity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SortSimilarity")
            .field("encoder", &self.encoder.name())
            .field("references", &self.references.len())
            .finish()
    }
}

impl StageTransform for SortSimilarity {
    fn config_scope(&self) -> ConfigScope {
        ConfigScope::Fields(&[])
    }

    fn run(
        &self,
        input: &Path,
        output: &Path,
        _config: &PipelineConfig,
    ) -> Result<TransformMetrics, TransformError> {
        let expected_len = self.references.first().map_or(0, Vec::len);
        let files = image_files(input)?;
        let metrics = process_each(&files, |path| {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                return Ok(false);
            };
            let Some(img) = open_image(path) else {
                return Ok(false);
            };
            let faces = encode_faces(self.encoder.as_ref(), &img, path)?;
            if let Some(face) = faces.iter().find(|f| f.len() != expected_len) {
                return Err(TransformError::Collaborator {
                    collaborator: self.encoder.name(),
                    path: path.to_path_buf(),
                    source: format!(
                        "embedding has {} values, references have {expected_len}",
                        face.len()
                    )
                    .into(),
                });
            }
            if faces.is_empty() {
                tracing::debug!(file = %path.display(), "no faces found, scoring 0");
            }
            let score = similarity_score(best_similarity(&faces, &self.references));
            copy_renamed(path, output, &format!("{score:03}_{name}"))?;
            Ok(true)
        })?;
        tracing::info!(
            ranked = metrics.files_written,
            of = metrics.files_read,
            "similarity sort complete"
        );
        Ok(metrics)
    }
}
