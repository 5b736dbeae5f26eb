//! Keep the images of whoever appears most often.
//!
//! Every image with exactly one encodable face contributes its face
//! embedding. The embeddings are clustered with DBSCAN (`eps =
//! face_tolerance`, `min_samples = min_cluster_size`, Euclidean
//! distance) and the images in the largest cluster are copied. Faces
//! that belong to no cluster are outliers and dropped.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use curate_pipeline::{ConfigScope, PipelineConfig, StageTransform, TransformError, TransformMetrics};
use rayon::prelude::*;

use crate::detect::{FaceEncoder, FaceEncoding, encode_faces};
use crate::files::{copy_into, image_files, open_image};

/// Euclidean distance between two embeddings of equal length.
pub(crate) fn distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}

/// Density-based clustering.
///
/// Two points are neighbours when their distance is at most `eps`; every
/// point is its own neighbour. A point with at least `min_samples`
/// neighbours is a core point. Clusters grow from core points in index
/// order, so a border point reachable from two clusters joins the one
/// found first. Returns one label per point; `None` marks noise.
#[must_use]
pub fn dbscan(points: &[FaceEncoding], eps: f64, min_samples: usize) -> Vec<Option<usize>> {
    let neighbourhoods: Vec<Vec<usize>> = points
        .par_iter()
        .map(|p| {
            points
                .iter()
                .enumerate()
                .filter(|(_, q)| distance(p, q) <= eps)
                .map(|(j, _)| j)
                .collect()
        })
        .collect();
    let is_core: Vec<bool> = neighbourhoods
        .iter()
        .map(|n| n.len() >= min_samples)
        .collect();

    let mut labels = vec![None; points.len()];
    let mut next_label = 0;
    let mut stack = Vec::new();
    for seed in 0..points.len() {
        if labels[seed].is_some() || !is_core[seed] {
            continue;
        }
        labels[seed] = Some(next_label);
        stack.push(seed);
        while let Some(point) = stack.pop() {
            for &neighbour in &neighbourhoods[point] {
                if labels[neighbour].is_none() {
                    labels[neighbour] = Some(next_label);
                    if is_core[neighbour] {
                        stack.push(neighbour);
                    }
                }
            }
        }
        next_label += 1;
    }
    labels
}

/// The most common cluster label. Ties go to the lowest label.
#[must_use]
pub fn majority_label(labels: &[Option<usize>]) -> Option<usize> {
    let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
    for label in labels.iter().flatten() {
        *counts.entry(*label).or_default() += 1;
    }
    counts
        .into_iter()
        .rev()
        .max_by_key(|&(_, count)| count)
        .map(|(label, _)| label)
}

/// The identify stage.
pub struct Identify {
    encoder: Arc<dyn FaceEncoder>,
}

impl Identify {
    /// Configuration fields this stage depends on.
    pub const FIELDS: &'static [&'static str] = &["face_tolerance", "min_cluster_size"];

    /// An identify stage using `encoder`.
    pub fn new(encoder: Arc<dyn FaceEncoder>) -> Self {
        Self { encoder }
    }

    /// `(path, embedding)` for every image with exactly one face, in file
    /// order.
    fn encode_all(&self, files: &[PathBuf]) -> Result<Vec<(PathBuf, FaceEncoding)>, TransformError> {
        let encoded = files
            .par_iter()
            .map(|path| -> Result<Option<(PathBuf, FaceEncoding)>, TransformError> {
                let Some(img) = open_image(path) else {
                    return Ok(None);
                };
                let mut encodings = encode_faces(self.encoder.as_ref(), &img, path)?;
                if encodings.len() == 1 {
                    Ok(encodings.pop().map(|e| (path.clone(), e)))
                } else {
                    Ok(None)
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        let encoded: Vec<_> = encoded.into_iter().flatten().collect();

        if let Some((first_path, first)) = encoded.first()
            && let Some((path, _)) = encoded.iter().find(|(_, e)| e.len() != first.len())
        {
            return Err(TransformError::Collaborator {
                collaborator: self.encoder.name(),
                path: path.clone(),
                source: format!(
                    "embedding length differs from {} ({} values)",
                    first_path.display(),
                    first.len()
                )
                .into(),
            });
        }
        Ok(encoded)
    }
}

impl fmt::Debug for Identify {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identify")
            .field("encoder", &self.encoder.name())
            .finish()
    }
}

impl StageTransform for Identify {
    fn config_scope(&self) -> ConfigScope {
        ConfigScope::Fields(Self::FIELDS)
    }

    fn run(
        &self,
        input: &Path,
        output: &Path,
        config: &PipelineConfig,
    ) -> Result<TransformMetrics, TransformError> {
        let files = image_files(input)?;
        let encoded = self.encode_all(&files)?;
        let mut metrics = TransformMetrics {
            files_read: files.len(),
            files_written: 0,
        };
        if encoded.is_empty() {
            tracing::warn!(dir = %input.display(), "no images with exactly one encodable face");
            return Ok(metrics);
        }

        let embeddings: Vec<FaceEncoding> = encoded.iter().map(|(_, e)| e.clone()).collect();
        let labels = dbscan(&embeddings, config.face_tolerance, config.min_cluster_size);
        let Some(majority) = majority_label(&labels) else {
            tracing::warn!(
                faces = encoded.len(),
                tolerance = config.face_tolerance,
                min_cluster_size = config.min_cluster_size,
                "no identity clusters found"
            );
            return Ok(metrics);
        };

        for ((path, _), label) in encoded.iter().zip(&labels) {
            if *label == Some(majority) {
                copy_into(path, output)?;
                metrics.files_written += 1;
            }
        }
        tracing::info!(
            kept = metrics.files_written,
            outliers = encoded.len() - metrics.files_written,
            "identity clustering complete"
        );
        Ok(metrics)
    }
}
