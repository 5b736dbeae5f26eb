//! Square crop around the faces in each image.
//!
//! The crop is centred on the mean centre of every detected face, or on
//! the image centre when none is found, then shifted to stay inside the
//! image and scaled to exactly `target_size x target_size`.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use curate_pipeline::{ConfigScope, PipelineConfig, StageTransform, TransformError, TransformMetrics};
use image::imageops::FilterType;

use crate::detect::{FaceDetector, detect_faces, mean_center};
use crate::files::{image_files, open_image, process_each, save_into};

/// A crop rectangle in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropWindow {
    /// Left edge.
    pub x: u32,
    /// Top edge.
    pub y: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

/// Start and extent of a `size`-long window centred on `center`, shifted
/// to fit inside `0..len`. Shrinks to `len` when the axis is shorter.
const fn fit_axis(len: u32, center: u32, size: u32) -> (u32, u32) {
    if size >= len {
        return (0, len);
    }
    let start = center.saturating_sub(size / 2);
    let max_start = len - size;
    let start = if start > max_start { max_start } else { start };
    (start, size)
}

/// A `width x height` window centred on `center`, clamped to an image of
/// `image_width x image_height`.
#[must_use]
pub const fn crop_window(
    image_width: u32,
    image_height: u32,
    center: (u32, u32),
    width: u32,
    height: u32,
) -> CropWindow {
    let (x, width) = fit_axis(image_width, center.0, width);
    let (y, height) = fit_axis(image_height, center.1, height);
    CropWindow {
        x,
        y,
        width,
        height,
    }
}

/// The face-crop stage.
pub struct FaceCrop {
    detector: Arc<dyn FaceDetector>,
}

impl FaceCrop {
    /// Configuration fields this stage depends on.
    pub const FIELDS: &'static [&'static str] = &["target_size", "jpeg_quality"];

    /// A face-crop stage using `detector`.
    pub fn new(detector: Arc<dyn FaceDetector>) -> Self {
        Self { detector }
    }
}

impl fmt::Debug for FaceCrop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaceCrop")
            .field("detector", &self.detector.name())
            .finish()
    }
}

impl StageTransform for FaceCrop {
    fn config_scope(&self) -> ConfigScope {
        ConfigScope::Fields(Self::FIELDS)
    }

    fn run(
        &self,
        input: &Path,
        output: &Path,
        config: &PipelineConfig,
    ) -> Result<TransformMetrics, TransformError> {
        let size = config.target_size;
        let files = image_files(input)?;
        let metrics = process_each(&files, |path| {
            let Some(img) = open_image(path) else {
                return Ok(false);
            };
            let faces = detect_faces(self.detector.as_ref(), &img, path)?;
            let center = mean_center(&faces).unwrap_or((img.width() / 2, img.height() / 2));
            if faces.is_empty() {
                tracing::debug!(file = %path.display(), "no faces detected, using image centre");
            }
            let window = crop_window(img.width(), img.height(), center, size, size);
            let cropped = img
                .crop_imm(window.x, window.y, window.width, window.height)
                .resize_exact(size, size, FilterType::Triangle);
            save_into(&cropped, path, output, config.jpeg_quality)?;
            Ok(true)
        })?;
        tracing::info!(cropped = metrics.files_written, of = metrics.files_read, "face crop complete");
        Ok(metrics)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;
    use std::fs;

    use super::*;
    use crate::detect::NoFaceDetector;
    use crate::detect::fakes::{Broken, FacesByWidth, face};

    #[test]
    fn window_is_centred_when_it_fits() {
        let w = crop_window(200, 100, (100, 50), 40, 40);
        assert_eq!(
            w,
            CropWindow {
                x: 80,
                y: 30,
                width: 40,
                height: 40
            }
        );
    }

    #[test]
    fn window_is_shifted_inside_edges() {
        assert_eq!(crop_window(200, 100, (5, 5), 40, 40).x, 0);
        assert_eq!(crop_window(200, 100, (5, 5), 40, 40).y, 0);
        let far = crop_window(200, 100, (199, 99), 40, 40);
        assert_eq!((far.x, far.y), (160, 60));
    }

    #[test]
    fn window_shrinks_on_small_images() {
        let w = crop_window(30, 100, (15, 50), 40, 40);
        assert_eq!((w.x, w.width), (0, 30));
        assert_eq!((w.y, w.height), (30, 40));
    }

    #[test]
    fn odd_sizes_stay_centred() {
        let w = crop_window(1000, 1000, (500, 500), 5, 5);
        assert_eq!((w.x, w.width), (498, 5));
    }

    fn write_split_image(dir: &Path, name: &str, w: u32, h: u32) {
        // Left half black, right half white.
        image::RgbImage::from_fn(w, h, |x, _| {
            if x < w / 2 {
                image::Rgb([0, 0, 0])
            } else {
                image::Rgb([255, 255, 255])
            }
        })
        .save(dir.join(name))
        .unwrap();
    }

    #[test]
    fn crops_to_target_square_around_face() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        write_split_image(input.path(), "a.png", 200, 100);

        // A face well inside the white half.
        let detector = FacesByWidth(HashMap::from([(200, vec![face(150, 40, 20, 20)])]));
        let stage = FaceCrop::new(Arc::new(detector));
        let config = PipelineConfig {
            target_size: 32,
            ..PipelineConfig::default()
        };
        let metrics = stage.run(input.path(), output.path(), &config).unwrap();
        assert_eq!(metrics.files_written, 1);

        let out = image::open(output.path().join("a.png")).unwrap().to_rgb8();
        assert_eq!(out.dimensions(), (32, 32));
        assert!(out.pixels().all(|p| p.0 == [255, 255, 255]));
    }

    #[test]
    fn falls_back_to_image_centre() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        write_split_image(input.path(), "a.png", 200, 100);

        let stage = FaceCrop::new(Arc::new(NoFaceDetector));
        let config = PipelineConfig {
            target_size: 64,
            ..PipelineConfig::default()
        };
        stage.run(input.path(), output.path(), &config).unwrap();

        let out = image::open(output.path().join("a.png")).unwrap().to_rgb8();
        assert_eq!(out.dimensions(), (64, 64));
        // The centred crop spans both halves.
        assert_eq!(out.get_pixel(0, 32).0, [0, 0, 0]);
        assert_eq!(out.get_pixel(63, 32).0, [255, 255, 255]);
    }

    #[test]
    fn detector_failure_fails_the_stage() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        write_split_image(input.path(), "a.png", 20, 20);
        fs::write(input.path().join("b.png"), b"unreadable").unwrap();

        let stage = FaceCrop::new(Arc::new(Broken));
        let result = stage.run(input.path(), output.path(), &PipelineConfig::default());
        assert!(matches!(result, Err(TransformError::Collaborator { .. })));
    }
}
