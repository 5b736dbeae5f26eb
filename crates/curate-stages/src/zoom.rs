//! Zoom in on the single face in each image.
//!
//! Images with no face or several faces are dropped. For the rest the
//! face box is grown by `zoom_factor` around its centre, clamped to the
//! image, and cropped out at native resolution. The crop may come out
//! smaller than `target_size`; a resolution filter downstream catches
//! those.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use curate_pipeline::{ConfigScope, PipelineConfig, StageTransform, TransformError, TransformMetrics};

use crate::detect::{FaceBox, FaceDetector, detect_faces};
use crate::face_crop::{CropWindow, crop_window};
use crate::files::{image_files, open_image, process_each, save_into};

/// `len * factor`, rounded down, at least 1 pixel.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn scale_len(len: u32, factor: f64) -> u32 {
    let scaled = (f64::from(len) * factor).floor();
    if scaled >= f64::from(u32::MAX) {
        u32::MAX
    } else {
        (scaled as u32).max(1)
    }
}

/// The window covering `face` grown by `factor`, clamped to the image.
#[must_use]
pub fn zoom_window(image_width: u32, image_height: u32, face: &FaceBox, factor: f64) -> CropWindow {
    crop_window(
        image_width,
        image_height,
        face.center(),
        scale_len(face.width, factor),
        scale_len(face.height, factor),
    )
}

/// The zoom stage.
pub struct Zoom {
    detector: Arc<dyn FaceDetector>,
}

impl Zoom {
    /// Configuration fields this stage depends on.
    pub const FIELDS: &'static [&'static str] = &["zoom_factor", "jpeg_quality"];

    /// A zoom stage using `detector`.
    pub fn new(detector: Arc<dyn FaceDetector>) -> Self {
        Self { detector }
    }
}

impl fmt::Debug for Zoom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Zoom")
            .field("detector", &self.detector.name())
            .finish()
    }
}

impl StageTransform for Zoom {
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
        let metrics = process_each(&files, |path| {
            let Some(img) = open_image(path) else {
                return Ok(false);
            };
            let faces = detect_faces(self.detector.as_ref(), &img, path)?;
            let [face] = faces.as_slice() else {
                tracing::debug!(file = %path.display(), faces = faces.len(), "skipping, need exactly one face");
                return Ok(false);
            };
            let window = zoom_window(img.width(), img.height(), face, config.zoom_factor);
            let zoomed = img.crop_imm(window.x, window.y, window.width, window.height);
            save_into(&zoomed, path, output, config.jpeg_quality)?;
            Ok(true)
        })?;
        tracing::info!(zoomed = metrics.files_written, of = metrics.files_read, "zoom complete");
        Ok(metrics)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::detect::fakes::{FacesByWidth, face};

    #[test]
    fn window_grows_around_face_centre() {
        let w = zoom_window(400, 400, &face(180, 180, 40, 40), 2.5);
        assert_eq!(
            w,
            CropWindow {
                x: 150,
                y: 150,
                width: 100,
                height: 100
            }
        );
    }

    #[test]
    fn window_is_clamped_to_image() {
        let w = zoom_window(100, 80, &face(0, 0, 40, 40), 3.0);
        assert_eq!((w.x, w.y, w.width, w.height), (0, 0, 100, 80));
    }

    #[test]
    fn scale_len_is_at_least_one_pixel() {
        assert_eq!(scale_len(1, 0.1), 1);
    }

    #[test]
    fn scale_len_rounds_down() {
        assert_eq!(scale_len(10, 1.25), 12);
        assert_eq!(scale_len(33, 1.5), 49);
    }

    #[test]
    fn crops_only_single_face_images() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        image::RgbImage::new(200, 100)
            .save(input.path().join("one.png"))
            .unwrap();
        image::RgbImage::new(201, 100)
            .save(input.path().join("two.png"))
            .unwrap();

        let detector = FacesByWidth(HashMap::from([
            (200, vec![face(90, 40, 20, 20)]),
            (201, vec![face(10, 10, 20, 20), face(100, 10, 20, 20)]),
        ]));
        let config = PipelineConfig {
            zoom_factor: 2.0,
            ..PipelineConfig::default()
        };
        let metrics = Zoom::new(Arc::new(detector))
            .run(input.path(), output.path(), &config)
            .unwrap();

        assert_eq!(metrics.files_written, 1);
        assert_eq!(
            image::image_dimensions(output.path().join("one.png")).unwrap(),
            (40, 40)
        );
        assert!(!output.path().join("two.png").exists());
    }
}
