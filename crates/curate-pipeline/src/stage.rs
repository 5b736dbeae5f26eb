//! Stage transforms and per-stage run state.
//!
//! A [`StageTransform`] is the external computation behind one pipeline
//! step. It reads files from its input directory, writes files into its
//! output directory, and touches nothing else. The engine decides whether
//! to call it at all.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::fingerprint::Fingerprint;
use crate::key::{ConfigScope, StageKey};
use crate::types::{PipelineConfig, TransformError};

/// Counts reported by a transform after populating its output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformMetrics {
    /// Input files the transform considered.
    pub files_read: usize,
    /// Files written to the output directory.
    pub files_written: usize,
}

/// The computation behind one pipeline stage.
///
/// Implementations must only read from `input` and only write to
/// `output`. They may parallelize per-file work internally, but must have
/// finished writing before returning.
pub trait StageTransform: Send + Sync {
    /// The configuration fields this stage's output depends on.
    ///
    /// Defaults to [`ConfigScope::All`], so any field added to
    /// [`PipelineConfig`] automatically invalidates this stage's cache.
    fn config_scope(&self) -> ConfigScope {
        ConfigScope::All
    }

    /// Populate `output` from `input`.
    ///
    /// # Errors
    ///
    /// Returns [`TransformError`] if the stage cannot complete. The
    /// engine discards whatever was written and aborts the run.
    fn run(
        &self,
        input: &Path,
        output: &Path,
        config: &PipelineConfig,
    ) -> Result<TransformMetrics, TransformError>;
}

impl<F> StageTransform for F
where
    F: Fn(&Path, &Path, &PipelineConfig) -> Result<TransformMetrics, TransformError> + Send + Sync,
{
    fn run(
        &self,
        input: &Path,
        output: &Path,
        config: &PipelineConfig,
    ) -> Result<TransformMetrics, TransformError> {
        self(input, output, config)
    }
}

/// Narrow a transform's [`ConfigScope`] without changing what it does.
///
/// Handy for closures, which always report [`ConfigScope::All`].
pub struct Scoped<T> {
    inner: T,
    scope: ConfigScope,
}

impl<T: StageTransform> Scoped<T> {
    /// Wrap `inner`, keying it only on `fields`.
    pub const fn new(inner: T, fields: &'static [&'static str]) -> Self {
        Self {
            inner,
            scope: ConfigScope::Fields(fields),
        }
    }
}

impl<T: StageTransform> StageTransform for Scoped<T> {
    fn config_scope(&self) -> ConfigScope {
        self.scope
    }

    fn run(
        &self,
        input: &Path,
        output: &Path,
        config: &PipelineConfig,
    ) -> Result<TransformMetrics, TransformError> {
        self.inner.run(input, output, config)
    }
}

/// Where a stage is in a single pipeline run.
///
/// ```text
/// Pending ──► CacheHit ────► Done(Reused)
///    └──────► Recomputing ─► Done(Recomputed)
/// ```
///
/// No stage re-enters `Pending` within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageState {
    /// Not yet resolved.
    Pending,
    /// Resolved to a reusable cache entry.
    CacheHit,
    /// Transform is running (or failed while running).
    Recomputing,
    /// Output directory is final and readable by downstream stages.
    Done(StageOutcome),
}

/// How a finished stage obtained its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageOutcome {
    /// The cached entry was reused; the transform did not run.
    Reused,
    /// The transform ran and its output was committed.
    Recomputed,
}

impl StageState {
    /// Whether moving from `self` to `next` is a legal transition.
    #[must_use]
    pub const fn can_become(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::CacheHit | Self::Recomputing)
                | (Self::CacheHit, Self::Done(StageOutcome::Reused))
                | (Self::Recomputing, Self::Done(StageOutcome::Recomputed))
        )
    }

    /// Whether the stage has finished.
    #[must_use]
    pub const fn is_done(self) -> bool {
        matches!(self, Self::Done(_))
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::CacheHit => f.write_str("cache hit"),
            Self::Recomputing => f.write_str("recomputing"),
            Self::Done(StageOutcome::Reused) => f.write_str("reused"),
            Self::Done(StageOutcome::Recomputed) => f.write_str("recomputed"),
        }
    }
}

/// Everything the engine learned about one stage during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageRecord {
    /// Stage name.
    pub name: String,
    /// Final state reached in this run.
    pub state: StageState,
    /// Directory the stage read from, once known.
    pub input_dir: Option<PathBuf>,
    /// Cache key, once derived.
    pub key: Option<StageKey>,
    /// Fingerprint of the input, once computed.
    pub input_fingerprint: Option<Fingerprint>,
    /// Published output directory, once the stage is done.
    pub output_dir: Option<PathBuf>,
    /// Whether an upstream recompute forced this stage to recompute
    /// despite a usable cache entry.
    pub invalidated: bool,
    /// Transform counts, when the transform ran successfully.
    pub metrics: Option<TransformMetrics>,
    /// Wall-clock time spent on this stage.
    pub duration: Duration,
}

impl StageRecord {
    /// A record for a stage that has not started.
    #[must_use]
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: StageState::Pending,
            input_dir: None,
            key: None,
            input_fingerprint: None,
            output_dir: None,
            invalidated: false,
            metrics: None,
            duration: Duration::ZERO,
        }
    }

    /// Move to `next`, which must be a legal transition.
    pub(crate) fn advance(&mut self, next: StageState) {
        debug_assert!(
            self.state.can_become(next),
            "illegal stage transition for `{}`: {} -> {next}",
            self.name,
            self.state
        );
        self.state = next;
    }

    /// Whether the stage finished by reusing its cache entry.
    #[must_use]
    pub fn reused(&self) -> bool {
        self.state == StageState::Done(StageOutcome::Reused)
    }

    /// Whether the stage finished by running its transform.
    #[must_use]
    pub fn recomputed(&self) -> bool {
        self.state == StageState::Done(StageOutcome::Recomputed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const ALL_STATES: [StageState; 5] = [
        StageState::Pending,
        StageState::CacheHit,
        StageState::Recomputing,
        StageState::Done(StageOutcome::Reused),
        StageState::Done(StageOutcome::Recomputed),
    ];

    #[test]
    fn legal_transitions() {
        use StageState::{CacheHit, Done, Pending, Recomputing};
        assert!(Pending.can_become(CacheHit));
        assert!(Pending.can_become(Recomputing));
        assert!(CacheHit.can_become(Done(StageOutcome::Reused)));
        assert!(Recomputing.can_become(Done(StageOutcome::Recomputed)));
    }

    #[test]
    fn nothing_returns_to_pending() {
        for state in ALL_STATES {
            assert!(!state.can_become(StageState::Pending), "{state} -> pending");
        }
    }

    #[test]
    fn done_is_terminal() {
        for done in ALL_STATES.into_iter().filter(|s| s.is_done()) {
            for next in ALL_STATES {
                assert!(!done.can_become(next), "{done} -> {next}");
            }
        }
    }

    #[test]
    fn outcomes_match_their_path() {
        assert!(!StageState::CacheHit.can_become(StageState::Done(StageOutcome::Recomputed)));
        assert!(!StageState::Recomputing.can_become(StageState::Done(StageOutcome::Reused)));
        assert!(!StageState::CacheHit.can_become(StageState::Recomputing));
    }

    #[test]
    fn closures_are_transforms_with_full_scope() {
        let transform = |_: &Path, _: &Path, _: &PipelineConfig| {
            Ok::<_, TransformError>(TransformMetrics::default())
        };
        assert_eq!(transform.config_scope(), ConfigScope::All);
        let dir = tempfile::tempdir().unwrap();
        let metrics = transform
            .run(dir.path(), dir.path(), &PipelineConfig::default())
            .unwrap();
        assert_eq!(metrics, TransformMetrics::default());
    }

    #[test]
    fn scoped_narrows_the_scope() {
        let transform = Scoped::new(
            |_: &Path, _: &Path, _: &PipelineConfig| {
                Ok::<_, TransformError>(TransformMetrics::default())
            },
            &["target_size"],
        );
        assert_eq!(
            transform.config_scope(),
            ConfigScope::Fields(&["target_size"])
        );
    }

    #[test]
    fn record_helpers() {
        let mut record = StageRecord::pending("resize");
        assert!(!record.reused());
        record.advance(StageState::Recomputing);
        record.advance(StageState::Done(StageOutcome::Recomputed));
        assert!(record.recomputed());
        assert!(!record.reused());
    }
}
