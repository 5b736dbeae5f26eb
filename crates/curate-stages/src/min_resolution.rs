//! Drop images smaller than a minimum size on either side.

use std::path::Path;

use curate_pipeline::{ConfigScope, PipelineConfig, StageTransform, TransformError, TransformMetrics};

use crate::files::{copy_into, dimensions, image_files, process_each};

/// The minimum-resolution filter. Images at least `min_size` pixels wide
/// and high (falling back to `target_size`) are copied unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct MinResolution;

impl MinResolution {
    /// Configuration fields this stage depends on.
    pub const FIELDS: &'static [&'static str] = &["min_size", "target_size"];
}

impl StageTransform for MinResolution {
    fn config_scope(&self) -> ConfigScope {
        ConfigScope::Fields(Self::FIELDS)
    }

    fn run(
        &self,
        input: &Path,
        output: &Path,
        config: &PipelineConfig,
    ) -> Result<TransformMetrics, TransformError> {
        let min = config.effective_min_size();
        let files = image_files(input)?;
        let metrics = process_each(&files, |path| match dimensions(path) {
            Some((w, h)) if w >= min && h >= min => {
                copy_into(path, output)?;
                Ok(true)
            }
            _ => Ok(false),
        })?;
        tracing::info!(
            kept = metrics.files_written,
            of = metrics.files_read,
            min_size = min,
            "resolution filter complete"
        );
        Ok(metrics)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn fixture() -> tempfile::TempDir {
        let input = tempfile::tempdir().unwrap();
        for (name, w, h) in [("big.png", 64, 64), ("wide.png", 64, 20), ("tiny.png", 8, 8)] {
            image::RgbImage::new(w, h).save(input.path().join(name)).unwrap();
        }
        input
    }

    #[test]
    fn uses_min_size_when_set() {
        let input = fixture();
        let output = tempfile::tempdir().unwrap();
        let config = PipelineConfig {
            target_size: 1000,
            min_size: Some(16),
            ..PipelineConfig::default()
        };
        let metrics = MinResolution.run(input.path(), output.path(), &config).unwrap();
        assert_eq!(metrics.files_written, 2);
        assert!(output.path().join("big.png").is_file());
        assert!(output.path().join("wide.png").is_file());
    }

    #[test]
    fn falls_back_to_target_size() {
        let input = fixture();
        let output = tempfile::tempdir().unwrap();
        let config = PipelineConfig {
            target_size: 64,
            ..PipelineConfig::default()
        };
        let metrics = MinResolution.run(input.path(), output.path(), &config).unwrap();
        assert_eq!(metrics.files_read, 3);
        assert_eq!(metrics.files_written, 1);
        assert!(output.path().join("big.png").is_file());
    }
}
