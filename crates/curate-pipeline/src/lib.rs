//! curate-pipeline: Incremental staged execution over directories.
//!
//! A pipeline is a chain of stages, each turning an input directory into
//! an output directory through an external [`StageTransform`]. Outputs
//! are cached on disk under `{base}/processed/{stage}_{hash}/`, keyed by
//! stage name, the configuration the stage consumes, and a fingerprint
//! of the stage's input:
//!
//! fingerprint -> cache key -> reuse-or-recompute -> cascade downstream
//!
//! A rerun with unchanged inputs and configuration reuses every stage
//! and calls no transform. Once a stage recomputes, every later stage in
//! the run recomputes too.
//!
//! This crate knows nothing about images. The built-in image stages live
//! in `curate-stages`.

pub mod cache;
pub mod diagnostics;
pub mod fingerprint;
pub mod graph;
pub mod key;
pub mod stage;
pub mod types;

pub use cache::{CacheError, CacheStore, PendingOutput, Resolution, resolve};
pub use diagnostics::{Clock, RunDiagnostics, StageDiagnostics, SystemClock};
pub use fingerprint::{Fingerprint, FingerprintMode, fingerprint, fingerprint_with};
pub use graph::{PipelineGraph, PipelineRun, StageInput};
pub use key::{ConfigScope, ConfigSnapshot, StageKey, derive_key};
pub use stage::{Scoped, StageOutcome, StageRecord, StageState, StageTransform, TransformMetrics};
pub use types::{
    CacheDirectoryError, FingerprintError, KeyError, PipelineConfig, PipelineError, TransformError,
};
