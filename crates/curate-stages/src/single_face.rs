//! Keep only images showing exactly one face.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use curate_pipeline::{ConfigScope, PipelineConfig, StageTransform, TransformError, TransformMetrics};

use crate::detect::{FaceDetector, detect_faces};
use crate::files::{copy_into, image_files, open_image, process_each};

/// The single-face filter stage. Matching images are copied unchanged.
pub struct SingleFace {
    detector: Arc<dyn FaceDetector>,
}

impl SingleFace {
    /// A filter using `detector`.
    pub fn new(detector: Arc<dyn FaceDetector>) -> Self {
        Self { detector }
    }
}

impl fmt::Debug for SingleFace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleFace")
            .field("detector", &self.detector.name())
            .finish()
    }
}

impl StageTransform for SingleFace {
    fn config_scope(&self) -> ConfigScope {
        ConfigScope::Fields(&[])
    }

    fn run(
        &self,
        input: &Path,
        output: &Path,
        _config: &PipelineConfig,
    ) -> Result<TransformMetrics, TransformError> {
        let files = image_files(input)?;
        let metrics = process_each(&files, |path| {
            let Some(img) = open_image(path) else {
                return Ok(false);
            };
            if detect_faces(self.detector.as_ref(), &img, path)?.len() != 1 {
                return Ok(false);
            }
            copy_into(path, output)?;
            Ok(true)
        })?;
        tracing::info!(
            kept = metrics.files_written,
            of = metrics.files_read,
            "single-face filter complete"
        );
        Ok(metrics)
    }
}
