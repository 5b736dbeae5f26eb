//! Face detection and encoding collaborators.
//!
//! Detection and recognition models are external to this crate. Stages
//! that need them take a [`FaceDetector`] or [`FaceEncoder`] and treat it
//! as an opaque function of the decoded image. A detector that changes
//! its results for the same image (a different model, different
//! thresholds) should record that in `PipelineConfig::extra` so the
//! change reaches cache keys of stages keyed on every field.

use std::error::Error;
use std::path::Path;
use std::sync::Arc;

use curate_pipeline::TransformError;
use image::DynamicImage;

/// Error type returned by collaborators.
pub type CollaboratorError = Box<dyn Error + Send + Sync>;

/// A detected face, in pixel coordinates of the image it was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaceBox {
    /// Left edge.
    pub x: u32,
    /// Top edge.
    pub y: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl FaceBox {
    /// Centre point, rounded down.
    #[must_use]
    pub const fn center(&self) -> (u32, u32) {
        (self.x + self.width / 2, self.y + self.height / 2)
    }
}

/// Mean centre of `faces`, or `None` when there are none.
// Means of u32 values always fit in u32.
#[allow(clippy::cast_possible_truncation)]
#[must_use]
pub fn mean_center(faces: &[FaceBox]) -> Option<(u32, u32)> {
    if faces.is_empty() {
        return None;
    }
    let n = faces.len() as u64;
    let (sx, sy) = faces.iter().fold((0u64, 0u64), |(sx, sy), face| {
        let (cx, cy) = face.center();
        (sx + u64::from(cx), sy + u64::from(cy))
    });
    Some(((sx / n) as u32, (sy / n) as u32))
}

/// Finds faces in an image.
pub trait FaceDetector: Send + Sync {
    /// Short name used in error messages.
    fn name(&self) -> &'static str {
        "face detector"
    }

    /// Every face found in `image`.
    ///
    /// # Errors
    ///
    /// Returns an error if the detector itself fails. Finding no faces is
    /// not an error.
    fn detect(&self, image: &DynamicImage) -> Result<Vec<FaceBox>, CollaboratorError>;
}

/// A face embedding. Distances between embeddings of the same person are
/// small.
pub type FaceEncoding = Vec<f64>;

/// Computes one embedding per face found in an image.
pub trait FaceEncoder: Send + Sync {
    /// Short name used in error messages.
    fn name(&self) -> &'static str {
        "face encoder"
    }

    /// One embedding per face in `image`.
    ///
    /// # Errors
    ///
    /// Returns an error if the encoder itself fails.
    fn encode(&self, image: &DynamicImage) -> Result<Vec<FaceEncoding>, CollaboratorError>;
}

impl<T: FaceDetector + ?Sized> FaceDetector for Arc<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn detect(&self, image: &DynamicImage) -> Result<Vec<FaceBox>, CollaboratorError> {
        (**self).detect(image)
    }
}

impl<T: FaceEncoder + ?Sized> FaceEncoder for Arc<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn encode(&self, image: &DynamicImage) -> Result<Vec<FaceEncoding>, CollaboratorError> {
        (**self).encode(image)
    }
}

/// Run `detector` on the image at `path`.
pub(crate) fn detect_faces(
    detector: &dyn FaceDetector,
    image: &DynamicImage,
    path: &Path,
) -> Result<Vec<FaceBox>, TransformError> {
    detector
        .detect(image)
        .map_err(|source| TransformError::Collaborator {
            collaborator: detector.name(),
            path: path.to_path_buf(),
            source,
        })
}

/// Run `encoder` on the image at `path`.
pub(crate) fn encode_faces(
    encoder: &dyn FaceEncoder,
    image: &DynamicImage,
    path: &Path,
) -> Result<Vec<FaceEncoding>, TransformError> {
    encoder
        .encode(image)
        .map_err(|source| TransformError::Collaborator {
            collaborator: encoder.name(),
            path: path.to_path_buf(),
            source,
        })
}

/// A detector that never finds a face.
///
/// With it, face cropping falls back to the image centre.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFaceDetector;

impl FaceDetector for NoFaceDetector {
    fn name(&self) -> &'static str {
        "no-op face detector"
    }

    fn detect(&self, _image: &DynamicImage) -> Result<Vec<FaceBox>, CollaboratorError> {
        Ok(Vec::new())
    }
}
