//! Pick the best-resolution image from each group of related files.
//!
//! Files are grouped by the part of their name before the first
//! `prefix_separator` (`alice_01.jpg` and `alice_02_hd.png` share the
//! group `alice`). From each group the image closest to `target_size` is
//! copied, preferring images at least as large as the target on both
//! sides so later stages never have to upscale.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use curate_pipeline::{ConfigScope, PipelineConfig, StageTransform, TransformError, TransformMetrics};
use rayon::prelude::*;

use crate::files::{FileMatcher, copy_into, dimensions, list_files, prefix_of};

/// How well an image's size fits the target.
///
/// Orders best-first: images covering the target beat those that don't,
/// then smaller distance wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ResolutionScore {
    /// `false` when both sides are at least the target.
    below_target: bool,
    /// `|width - target| + |height - target|`.
    distance: u64,
}

impl ResolutionScore {
    /// Score a `width x height` image against `target`.
    #[must_use]
    pub fn new(width: u32, height: u32, target: u32) -> Self {
        Self {
            below_target: width < target || height < target,
            distance: u64::from(width.abs_diff(target)) + u64::from(height.abs_diff(target)),
        }
    }

    /// Whether both sides are at least the target.
    #[must_use]
    pub const fn covers_target(&self) -> bool {
        !self.below_target
    }

    /// Distance from the target.
    #[must_use]
    pub const fn distance(&self) -> u64 {
        self.distance
    }
}

/// The best candidate, by [`ResolutionScore`]. Ties go to the first.
#[must_use]
pub fn best_candidate<'a>(candidates: &'a [(PathBuf, (u32, u32))], target: u32) -> Option<&'a Path> {
    candidates
        .iter()
        .min_by_key(|(_, (w, h))| ResolutionScore::new(*w, *h, target))
        .map(|(path, _)| path.as_path())
}

/// The select stage.
#[derive(Debug, Clone, Copy, Default)]
pub struct Select;

impl Select {
    /// Configuration fields this stage depends on.
    pub const FIELDS: &'static [&'static str] = &["file_pattern", "prefix_separator", "target_size"];
}

impl StageTransform for Select {
    fn config_scope(&self) -> ConfigScope {
        ConfigScope::Fields(Self::FIELDS)
    }

    fn run(
        &self,
        input: &Path,
        output: &Path,
        config: &PipelineConfig,
    ) -> Result<TransformMetrics, TransformError> {
        let matcher = FileMatcher::from_config(config)?;
        let files = list_files(input, |name| matcher.is_match(name))?;

        let sized: Vec<(PathBuf, (u32, u32))> = files
            .par_iter()
            .filter_map(|path| dimensions(path).map(|dims| (path.clone(), dims)))
            .collect();

        let mut groups: BTreeMap<String, Vec<(PathBuf, (u32, u32))>> = BTreeMap::new();
        for (path, dims) in sized {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let prefix = prefix_of(&name, &config.prefix_separator).to_string();
            groups.entry(prefix).or_default().push((path, dims));
        }

        let mut written = 0;
        for (prefix, candidates) in &groups {
            if let Some(best) = best_candidate(candidates, config.target_size) {
                tracing::debug!(group = %prefix, chosen = %best.display(), "selected image");
                copy_into(best, output)?;
                written += 1;
            }
        }

        tracing::info!(
            matched = files.len(),
            groups = groups.len(),
            selected = written,
            "selection complete"
        );
        Ok(TransformMetrics {
            files_read: files.len(),
            files_written: written,
        })
    }
}
