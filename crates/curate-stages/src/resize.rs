//! Scale images so their shorter side equals `target_size`.

use std::path::Path;

use curate_pipeline::{ConfigScope, PipelineConfig, StageTransform, TransformError, TransformMetrics};
use image::imageops::FilterType;

use crate::files::{image_files, open_image, process_each, save_into};

/// Dimensions after scaling the shorter side of `width x height` to
/// `target`, keeping the aspect ratio. The longer side is rounded down.
#[must_use]
pub fn scaled_dimensions(width: u32, height: u32, target: u32) -> (u32, u32) {
    let scale = |long: u32, short: u32| -> u32 {
        let scaled = u64::from(long) * u64::from(target) / u64::from(short.max(1));
        u32::try_from(scaled).unwrap_or(u32::MAX)
    };
    if width < height {
        (target, scale(height, width))
    } else {
        (scale(width, height), target)
    }
}

/// The resize stage.
#[derive(Debug, Clone, Copy, Default)]
pub struct Resize;

impl Resize {
    /// Configuration fields this stage depends on.
    pub const FIELDS: &'static [&'static str] = &["target_size", "jpeg_quality"];
}

impl StageTransform for Resize {
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
            let (w, h) = scaled_dimensions(img.width(), img.height(), config.target_size);
            let resized = img.resize_exact(w, h, FilterType::Lanczos3);
            save_into(&resized, path, output, config.jpeg_quality)?;
            Ok(true)
        })?;
        tracing::info!(
            resized = metrics.files_written,
            of = metrics.files_read,
            target = config.target_size,
            "resize complete"
        );
        Ok(metrics)
    }
}
