//! Ready-made stage chains.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use curate_pipeline::{PipelineError, PipelineGraph};

use crate::detect::{FaceDetector, FaceEncoder};
use crate::{FaceCrop, Identify, MinResolution, Resize, Select, SingleFace, Zoom};

/// A named stage chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Preset {
    /// select -> resize -> face_crop
    #[default]
    Basic,
    /// select -> resize -> face_crop -> single_face -> identify
    Standard,
    /// select -> resize -> face_crop -> single_face -> zoom ->
    /// min_resolution -> identify
    Zoom,
}

impl Preset {
    /// All presets.
    pub const ALL: [Self; 3] = [Self::Basic, Self::Standard, Self::Zoom];

    /// Stage names in execution order.
    #[must_use]
    pub const fn stage_names(self) -> &'static [&'static str] {
        match self {
            Self::Basic => &["select", "resize", "face_crop"],
            Self::Standard => &["select", "resize", "face_crop", "single_face", "identify"],
            Self::Zoom => &[
                "select",
                "resize",
                "face_crop",
                "single_face",
                "zoom",
                "min_resolution",
                "identify",
            ],
        }
    }

    /// Whether the chain ends in identity clustering.
    #[must_use]
    pub const fn needs_encoder(self) -> bool {
        !matches!(self, Self::Basic)
    }

    /// Build the stage graph.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidGraph`] if the preset needs a face
    /// encoder and none is given.
    pub fn build(
        self,
        detector: Arc<dyn FaceDetector>,
        encoder: Option<Arc<dyn FaceEncoder>>,
    ) -> Result<PipelineGraph, PipelineError> {
        let mut graph = PipelineGraph::new();
        graph
            .then("select", Select)?
            .then("resize", Resize)?
            .then("face_crop", FaceCrop::new(Arc::clone(&detector)))?;
        if self == Self::Basic {
            return Ok(graph);
        }

        let Some(encoder) = encoder else {
            return Err(PipelineError::InvalidGraph(format!(
                "preset `{self}` needs a face encoder"
            )));
        };
        graph.then("single_face", SingleFace::new(Arc::clone(&detector)))?;
        if self == Self::Zoom {
            graph
                .then("zoom", Zoom::new(detector))?
                .then("min_resolution", MinResolution)?;
        }
        graph.then("identify", Identify::new(encoder))?;
        Ok(graph)
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Basic => f.write_str("basic"),
            Self::Standard => f.write_str("standard"),
            Self::Zoom => f.write_str("zoom"),
        }
    }
}

impl FromStr for Preset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.to_string().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown preset `{s}` (expected basic, standard, or zoom)"))
    }
}
