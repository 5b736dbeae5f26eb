//! The on-disk stage cache.
//!
//! Every distinct `(stage, config, input)` combination ever computed owns
//! one directory under `{base}/processed/`:
//!
//! ```text
//! {base}/processed/{stage}_{hash}/
//! ```
//!
//! Presence plus non-emptiness of that directory is the only persisted
//! cache signal; there is no manifest. Entries are never deleted by the
//! engine.
//!
//! # Publication
//!
//! A recomputing stage never writes into its entry directly. It writes
//! into a hidden staging directory next to the entry (see
//! [`PendingOutput`]) that is renamed over the entry only after the
//! transform succeeds. A failed or interrupted transform therefore never
//! leaves a partially populated entry that a later run would mistake for
//! a cache hit.
//!
//! # Concurrency
//!
//! The store assumes a single writer. Two processes resolving the same
//! entry at the same time may race on its creation; there is no locking.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::fingerprint::{Fingerprint, FingerprintMode, fingerprint_with};
use crate::key::{StageKey, derive_key};
use crate::types::{CacheDirectoryError, FingerprintError, KeyError, PipelineError};

/// Name of the cache root directory inside the base directory.
pub const PROCESSED_DIR: &str = "processed";

/// Suffix of staging directories.
const STAGING_SUFFIX: &str = ".partial";

/// Errors from resolving or publishing a cache entry.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The input directory could not be fingerprinted.
    #[error(transparent)]
    Fingerprint(#[from] FingerprintError),

    /// The cache key could not be derived.
    #[error(transparent)]
    Key(#[from] KeyError),

    /// The entry directory is unusable.
    #[error("{key}: {source}")]
    Directory {
        /// Key of the entry.
        key: StageKey,
        /// Underlying directory error.
        #[source]
        source: CacheDirectoryError,
    },
}

impl CacheError {
    /// Attach the stage name, producing the run-level error.
    #[must_use]
    pub fn for_stage(self, stage: &str) -> PipelineError {
        let stage = stage.to_string();
        match self {
            Self::Fingerprint(source) => PipelineError::Fingerprint { stage, source },
            Self::Key(source) => PipelineError::Key { stage, source },
            Self::Directory { key, source } => PipelineError::CacheDirectory {
                stage,
                key: key.dir_name(),
                source,
            },
        }
    }
}

/// Outcome of resolving a stage against the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// The entry directory for this stage's key.
    pub output_dir: PathBuf,
    /// `true` when the entry is populated and its input is unchanged.
    pub reused: bool,
    /// The derived key.
    pub key: StageKey,
    /// Fingerprint of the input directory the key was derived from.
    pub input_fingerprint: Fingerprint,
}

/// A cache root, `{base}/processed`, injected into pipeline runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStore {
    root: PathBuf,
    mode: FingerprintMode,
}

impl CacheStore {
    /// A store rooted at `{base_dir}/processed`, fingerprinting by name
    /// and size.
    #[must_use]
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            root: base_dir.as_ref().join(PROCESSED_DIR),
            mode: FingerprintMode::default(),
        }
    }

    /// Use `mode` when fingerprinting stage inputs.
    #[must_use]
    pub const fn with_fingerprint_mode(mut self, mode: FingerprintMode) -> Self {
        self.mode = mode;
        self
    }

    /// The cache root directory (`{base}/processed`).
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The fingerprint mode used for stage inputs.
    #[must_use]
    pub const fn fingerprint_mode(&self) -> FingerprintMode {
        self.mode
    }

    /// Path of the entry directory for `key`.
    #[must_use]
    pub fn entry_path(&self, key: &StageKey) -> PathBuf {
        self.root.join(key.dir_name())
    }

    /// Decide whether `stage_name` run with `config` on `input_dir` can
    /// reuse a cached output.
    ///
    /// On a hit the returned entry is populated and `reused` is `true`.
    /// On a miss the entry is (re)created empty and `reused` is `false`.
    /// A populated entry whose input changed between fingerprinting and
    /// the existence check is treated as a miss and cleared.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Fingerprint`] if the input cannot be listed,
    /// [`CacheError::Key`] if `config` cannot be serialized, and
    /// [`CacheError::Directory`] if the entry exists but is unusable.
    pub fn resolve<C>(
        &self,
        stage_name: &str,
        config: &C,
        input_dir: &Path,
    ) -> Result<Resolution, CacheError>
    where
        C: Serialize + ?Sized,
    {
        let input_fingerprint = fingerprint_with(input_dir, self.mode)?;
        let key = derive_key(stage_name, config, &input_fingerprint)?;
        let candidate = self.entry_path(&key);
        let dir_error = |source| CacheError::Directory {
            key: key.clone(),
            source,
        };

        if is_populated(&candidate).map_err(dir_error)? {
            let current = fingerprint_with(input_dir, self.mode)?;
            if current == input_fingerprint {
                tracing::info!(stage = stage_name, entry = %key, "using cached output");
                return Ok(Resolution {
                    output_dir: candidate,
                    reused: true,
                    key,
                    input_fingerprint,
                });
            }
            tracing::info!(stage = stage_name, entry = %key, "input changed, invalidating cache entry");
        } else {
            tracing::info!(stage = stage_name, entry = %key, "creating new cache entry");
        }

        recreate_dir(&candidate).map_err(dir_error)?;
        Ok(Resolution {
            output_dir: candidate,
            reused: false,
            key,
            input_fingerprint,
        })
    }

    /// Open a staging directory for recomputing `resolution`'s entry.
    ///
    /// Any leftover staging directory from an interrupted run is cleared
    /// first.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Directory`] if the staging directory cannot
    /// be created.
    pub fn begin(&self, resolution: &Resolution) -> Result<PendingOutput, CacheError> {
        let staging = self
            .root
            .join(format!(".{}{STAGING_SUFFIX}", resolution.key.dir_name()));
        recreate_dir(&staging).map_err(|source| CacheError::Directory {
            key: resolution.key.clone(),
            source,
        })?;
        Ok(PendingOutput {
            staging,
            target: resolution.output_dir.clone(),
            key: resolution.key.clone(),
            committed: false,
        })
    }
}

/// Resolve a stage against the store rooted at `{base_dir}/processed`.
///
/// Shorthand for [`CacheStore::new`] followed by [`CacheStore::resolve`].
///
/// # Errors
///
/// See [`CacheStore::resolve`].
pub fn resolve<C>(
    base_dir: &Path,
    stage_name: &str,
    config: &C,
    input_dir: &Path,
) -> Result<Resolution, CacheError>
where
    C: Serialize + ?Sized,
{
    CacheStore::new(base_dir).resolve(stage_name, config, input_dir)
}

/// Output being written for a recomputed stage.
///
/// The transform writes into [`path`](Self::path). [`commit`](Self::commit)
/// replaces the entry with the staged contents. Dropping without
/// committing removes the staging directory and leaves the entry as it
/// was.
#[derive(Debug)]
#[must_use = "staged output is discarded unless committed"]
pub struct PendingOutput {
    staging: PathBuf,
    target: PathBuf,
    key: StageKey,
    committed: bool,
}

impl PendingOutput {
    /// Directory the transform should write into.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.staging
    }

    /// Publish the staged output as the cache entry.
    ///
    /// Returns the entry directory.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Directory`] if the old entry cannot be
    /// removed or the staging directory cannot be renamed.
    pub fn commit(mut self) -> Result<PathBuf, CacheError> {
        let key = self.key.clone();
        let dir_error = |source| CacheError::Directory {
            key: key.clone(),
            source,
        };

        remove_dir_if_present(&self.target).map_err(dir_error)?;
        fs::rename(&self.staging, &self.target)
            .map_err(|source| CacheDirectoryError::Io {
                path: self.target.clone(),
                source,
            })
            .map_err(dir_error)?;
        self.committed = true;
        tracing::debug!(entry = %self.key, "committed stage output");
        Ok(self.target.clone())
    }
}

impl Drop for PendingOutput {
    fn drop(&mut self) {
        if !self.committed
            && let Err(e) = fs::remove_dir_all(&self.staging)
            && e.kind() != io::ErrorKind::NotFound
        {
            tracing::warn!(
                staging = %self.staging.display(),
                error = %e,
                "failed to remove staging directory"
            );
        }
    }
}

/// Whether `path` is an existing directory with at least one entry.
fn is_populated(path: &Path) -> Result<bool, CacheDirectoryError> {
    let io_error = |source| CacheDirectoryError::Io {
        path: path.to_path_buf(),
        source,
    };
    match fs::metadata(path) {
        Ok(metadata) if metadata.is_dir() => {
            let mut entries = fs::read_dir(path).map_err(io_error)?;
            Ok(entries.next().transpose().map_err(io_error)?.is_some())
        }
        Ok(_) => Err(CacheDirectoryError::NotADirectory {
            path: path.to_path_buf(),
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(io_error(e)),
    }
}

/// Remove `path` if it exists, then create it empty (with parents).
fn recreate_dir(path: &Path) -> Result<(), CacheDirectoryError> {
    remove_dir_if_present(path)?;
    fs::create_dir_all(path).map_err(|source| CacheDirectoryError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Remove the directory at `path`, tolerating its absence.
fn remove_dir_if_present(path: &Path) -> Result<(), CacheDirectoryError> {
    match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => {
            fs::remove_dir_all(path).map_err(|source| CacheDirectoryError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
        Ok(_) => Err(CacheDirectoryError::NotADirectory {
            path: path.to_path_buf(),
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(CacheDirectoryError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::PipelineConfig;

    fn input_with(files: &[(&str, usize)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (name, size) in files {
            fs::write(dir.path().join(name), vec![0u8; *size]).unwrap();
        }
        dir
    }

    fn populate(dir: &Path) {
        fs::write(dir.join("out.jpg"), b"out").unwrap();
    }

    #[test]
    fn first_resolve_is_a_miss_and_creates_the_entry() {
        let base = tempfile::tempdir().unwrap();
        let input = input_with(&[("a.jpg", 10)]);
        let store = CacheStore::new(base.path());

        let res = store
            .resolve("resize", &PipelineConfig::default(), input.path())
            .unwrap();
        assert!(!res.reused);
        assert!(res.output_dir.is_dir());
        assert_eq!(
            res.output_dir,
            base.path().join("processed").join(res.key.dir_name())
        );
        assert_eq!(fs::read_dir(&res.output_dir).unwrap().count(), 0);
    }

    #[test]
    fn populated_entry_is_reused() {
        let base = tempfile::tempdir().unwrap();
        let input = input_with(&[("a.jpg", 10)]);
        let store = CacheStore::new(base.path());
        let config = PipelineConfig::default();

        let first = store.resolve("resize", &config, input.path()).unwrap();
        populate(&first.output_dir);

        let second = store.resolve("resize", &config, input.path()).unwrap();
        assert!(second.reused);
        assert_eq!(first.output_dir, second.output_dir);
        assert!(second.output_dir.join("out.jpg").exists());
    }

    #[test]
    fn empty_entry_is_not_reused() {
        let base = tempfile::tempdir().unwrap();
        let input = input_with(&[("a.jpg", 10)]);
        let store = CacheStore::new(base.path());
        let config = PipelineConfig::default();

        store.resolve("resize", &config, input.path()).unwrap();
        let second = store.resolve("resize", &config, input.path()).unwrap();
        assert!(!second.reused);
    }

    #[test]
    fn changed_input_resolves_to_a_new_entry() {
        let base = tempfile::tempdir().unwrap();
        let input = input_with(&[("a.jpg", 10)]);
        let store = CacheStore::new(base.path());
        let config = PipelineConfig::default();

        let first = store.resolve("resize", &config, input.path()).unwrap();
        populate(&first.output_dir);

        fs::write(input.path().join("b.jpg"), [0u8; 3]).unwrap();
        let second = store.resolve("resize", &config, input.path()).unwrap();
        assert!(!second.reused);
        assert_ne!(first.output_dir, second.output_dir);
        // The old entry is left in place.
        assert!(first.output_dir.join("out.jpg").exists());
    }

    #[test]
    fn different_stages_never_share_an_entry() {
        let base = tempfile::tempdir().unwrap();
        let input = input_with(&[("a.jpg", 10)]);
        let store = CacheStore::new(base.path());
        let config = PipelineConfig::default();

        let a = store.resolve("resize", &config, input.path()).unwrap();
        let b = store.resolve("select", &config, input.path()).unwrap();
        assert_eq!(a.input_fingerprint, b.input_fingerprint);
        assert_ne!(a.output_dir, b.output_dir);
    }

    #[test]
    fn entry_that_is_a_file_is_an_error() {
        let base = tempfile::tempdir().unwrap();
        let input = input_with(&[("a.jpg", 10)]);
        let store = CacheStore::new(base.path());
        let config = PipelineConfig::default();

        let first = store.resolve("resize", &config, input.path()).unwrap();
        fs::remove_dir(&first.output_dir).unwrap();
        fs::write(&first.output_dir, b"not a directory").unwrap();

        let result = store.resolve("resize", &config, input.path());
        assert!(matches!(
            result,
            Err(CacheError::Directory {
                source: CacheDirectoryError::NotADirectory { .. },
                ..
            })
        ));
    }

    #[test]
    fn missing_input_is_a_fingerprint_error() {
        let base = tempfile::tempdir().unwrap();
        let store = CacheStore::new(base.path());
        let result = store.resolve(
            "resize",
            &PipelineConfig::default(),
            &base.path().join("missing"),
        );
        let err = result.unwrap_err();
        assert!(matches!(err, CacheError::Fingerprint(_)));
        assert!(matches!(
            err.for_stage("resize"),
            PipelineError::Fingerprint { ref stage, .. } if stage == "resize"
        ));
    }

    #[test]
    fn strict_mode_notices_same_size_edits() {
        let base = tempfile::tempdir().unwrap();
        let input = input_with(&[]);
        fs::write(input.path().join("a.jpg"), b"aaaa").unwrap();
        let store = CacheStore::new(base.path()).with_fingerprint_mode(FingerprintMode::Content);
        let config = PipelineConfig::default();

        let first = store.resolve("resize", &config, input.path()).unwrap();
        populate(&first.output_dir);
        fs::write(input.path().join("a.jpg"), b"bbbb").unwrap();

        let second = store.resolve("resize", &config, input.path()).unwrap();
        assert!(!second.reused);
        assert_ne!(first.key, second.key);
    }

    #[test]
    fn commit_publishes_staged_output() {
        let base = tempfile::tempdir().unwrap();
        let input = input_with(&[("a.jpg", 10)]);
        let store = CacheStore::new(base.path());
        let res = store
            .resolve("resize", &PipelineConfig::default(), input.path())
            .unwrap();

        let pending = store.begin(&res).unwrap();
        assert_ne!(pending.path(), res.output_dir);
        populate(pending.path());
        // Nothing is visible in the entry before commit.
        assert_eq!(fs::read_dir(&res.output_dir).unwrap().count(), 0);

        let published = pending.commit().unwrap();
        assert_eq!(published, res.output_dir);
        assert!(published.join("out.jpg").exists());
    }

    #[test]
    fn dropped_output_leaves_no_trace() {
        let base = tempfile::tempdir().unwrap();
        let input = input_with(&[("a.jpg", 10)]);
        let store = CacheStore::new(base.path());
        let res = store
            .resolve("resize", &PipelineConfig::default(), input.path())
            .unwrap();

        let pending = store.begin(&res).unwrap();
        let staging = pending.path().to_path_buf();
        populate(&staging);
        drop(pending);

        assert!(!staging.exists());
        assert_eq!(fs::read_dir(&res.output_dir).unwrap().count(), 0);
    }

    #[test]
    fn commit_replaces_a_stale_entry() {
        let base = tempfile::tempdir().unwrap();
        let input = input_with(&[("a.jpg", 10)]);
        let store = CacheStore::new(base.path());
        let config = PipelineConfig::default();

        let res = store.resolve("resize", &config, input.path()).unwrap();
        fs::write(res.output_dir.join("stale.jpg"), b"old").unwrap();

        let pending = store.begin(&res).unwrap();
        populate(pending.path());
        let published = pending.commit().unwrap();
        assert!(!published.join("stale.jpg").exists());
        assert!(published.join("out.jpg").exists());
    }

    #[test]
    fn free_resolve_uses_processed_under_base() {
        let base = tempfile::tempdir().unwrap();
        let input = input_with(&[("a.jpg", 10)]);
        let res = resolve(base.path(), "resize", &PipelineConfig::default(), input.path()).unwrap();
        assert!(res.output_dir.starts_with(base.path().join(PROCESSED_DIR)));
    }
}
