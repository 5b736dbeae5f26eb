//! Directory fingerprints: a cheap proxy for "did this input change?".
//!
//! The default [`FingerprintMode::NameSize`] digest covers the sorted
//! `(file name, byte size)` pairs of every regular file directly inside a
//! directory. It never reads file contents, so it is fast, but an
//! in-place edit that keeps a file's size is invisible to it. Callers
//! that need byte-level change detection opt into
//! [`FingerprintMode::Content`], which streams every file through
//! SHA-256.
//!
//! Fingerprinting only reads the directory. It is safe to run alongside
//! other read-only listings, but must not run on a directory a transform
//! is still writing.

use std::ffi::OsStr;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::FingerprintError;

/// Number of hex characters kept from a SHA-256 digest.
pub const DIGEST_LEN: usize = 8;

/// How a directory's contents are summarized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FingerprintMode {
    /// File names and sizes only. Same-size content edits go undetected.
    #[default]
    NameSize,
    /// File names, sizes, and a SHA-256 of every file's bytes.
    Content,
}

impl fmt::Display for FingerprintMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NameSize => f.write_str("name+size"),
            Self::Content => f.write_str("content"),
        }
    }
}

/// Short, fixed-width digest of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// The digest as lowercase hex.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A file name as it enters the digest.
///
/// UTF-8 names serialize as JSON strings. Any other name serializes as
/// its raw bytes, a JSON array, so distinct names never collapse into the
/// same entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(untagged)]
enum FileName {
    Utf8(String),
    Bytes(Vec<u8>),
}

impl FileName {
    fn new(name: &OsStr) -> Self {
        match name.to_str() {
            Some(utf8) => Self::Utf8(utf8.to_string()),
            None => Self::Bytes(name.as_encoded_bytes().to_vec()),
        }
    }
}

/// First [`DIGEST_LEN`] hex characters of the SHA-256 of `bytes`.
pub(crate) fn short_digest(bytes: &[u8]) -> String {
    let mut hex = format!("{:x}", Sha256::digest(bytes));
    hex.truncate(DIGEST_LEN);
    hex
}

/// Fingerprint `dir` from its file names and sizes.
///
/// # Errors
///
/// Returns [`FingerprintError`] if the directory cannot be listed or an
/// entry cannot be stat-ed.
pub fn fingerprint(dir: &Path) -> Result<Fingerprint, FingerprintError> {
    fingerprint_with(dir, FingerprintMode::NameSize)
}

/// Fingerprint `dir` using the given mode.
///
/// Only regular files directly inside `dir` count. Symlinks are followed
/// and dangling ones skipped; subdirectories are ignored. Entries are
/// sorted by name before hashing, so enumeration order never matters.
///
/// # Errors
///
/// Returns [`FingerprintError`] if the directory cannot be listed, an
/// entry cannot be stat-ed, or (in [`FingerprintMode::Content`]) a file
/// cannot be read.
pub fn fingerprint_with(dir: &Path, mode: FingerprintMode) -> Result<Fingerprint, FingerprintError> {
    let mut files = list_files(dir)?;
    files.sort();

    let serialized = match mode {
        FingerprintMode::NameSize => {
            let listing: Vec<_> = files.iter().map(|(name, size, _)| (name, size)).collect();
            serde_json::to_vec(&listing)
        }
        FingerprintMode::Content => {
            let hashed = files
                .into_iter()
                .map(|(name, size, path)| {
                    let digest = hash_file(&path)?;
                    Ok((name, size, digest))
                })
                .collect::<Result<Vec<_>, FingerprintError>>()?;
            serde_json::to_vec(&hashed)
        }
    }
    .map_err(|source| FingerprintError::Serialize {
        path: dir.to_path_buf(),
        source,
    })?;

    let digest = Fingerprint(short_digest(&serialized));
    tracing::debug!(dir = %dir.display(), %mode, fingerprint = %digest, "fingerprinted directory");
    Ok(digest)
}

/// `(name, size, path)` for every regular file directly inside `dir`.
fn list_files(dir: &Path) -> Result<Vec<(FileName, u64, PathBuf)>, FingerprintError> {
    let entries = fs::read_dir(dir).map_err(|source| FingerprintError::ReadDir {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| FingerprintError::ReadDir {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        let metadata = match fs::metadata(&path) {
            Ok(metadata) => metadata,
            // Dangling symlink, or removed since the listing.
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(source) => return Err(FingerprintError::Metadata { path, source }),
        };
        if metadata.is_file() {
            files.push((FileName::new(&entry.file_name()), metadata.len(), path));
        }
    }
    Ok(files)
}

/// Full SHA-256 hex digest of a file's bytes, streamed.
fn hash_file(path: &Path) -> Result<String, FingerprintError> {
    let read_error = |source| FingerprintError::Read {
        path: path.to_path_buf(),
        source,
    };
    let mut file = fs::File::open(path).map_err(read_error)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher).map_err(read_error)?;
    Ok(format!("{:x}", hasher.finalize()))
}
