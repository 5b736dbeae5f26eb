//! File selection, image loading, and image saving shared by every stage.
//!
//! Stages only see regular files directly inside their input directory.
//! Images that cannot be decoded are skipped with a warning rather than
//! failing the stage; failures writing the output directory are errors.

use std::fs;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use curate_pipeline::{PipelineConfig, TransformError, TransformMetrics};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat};
use rayon::prelude::*;

/// Case-insensitive file name matcher built from `file_pattern`.
#[derive(Debug, Clone)]
pub struct FileMatcher {
    set: GlobSet,
}

impl FileMatcher {
    /// Compile `patterns`.
    ///
    /// # Errors
    ///
    /// Returns [`TransformError::InvalidConfig`] if a pattern is not a
    /// valid glob.
    pub fn new<'a>(patterns: impl IntoIterator<Item = &'a str>) -> Result<Self, TransformError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let glob = GlobBuilder::new(pattern)
                .case_insensitive(true)
                .literal_separator(true)
                .build()
                .map_err(|e| TransformError::InvalidConfig(format!("pattern '{pattern}': {e}")))?;
            builder.add(glob);
        }
        let set = builder
            .build()
            .map_err(|e| TransformError::InvalidConfig(format!("failed to build glob set: {e}")))?;
        Ok(Self { set })
    }

    /// The matcher for `config.file_pattern`.
    ///
    /// # Errors
    ///
    /// See [`FileMatcher::new`].
    pub fn from_config(config: &PipelineConfig) -> Result<Self, TransformError> {
        Self::new(config.patterns())
    }

    /// Whether a bare file name matches any pattern.
    #[must_use]
    pub fn is_match(&self, file_name: &str) -> bool {
        self.set.is_match(file_name)
    }
}

/// Regular files directly inside `dir` whose name satisfies `keep`,
/// sorted by name.
///
/// # Errors
///
/// Returns [`TransformError::Read`] if the directory cannot be listed.
pub fn list_files(dir: &Path, keep: impl Fn(&str) -> bool) -> Result<Vec<PathBuf>, TransformError> {
    let read_error = |source| TransformError::Read {
        path: dir.to_path_buf(),
        source,
    };
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(read_error)? {
        let path = entry.map_err(read_error)?.path();
        if !path.is_file() {
            continue;
        }
        if path.file_name().and_then(|n| n.to_str()).is_some_and(&keep) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Regular files in `dir` whose extension names a decodable image format.
///
/// # Errors
///
/// Returns [`TransformError::Read`] if the directory cannot be listed.
pub fn image_files(dir: &Path) -> Result<Vec<PathBuf>, TransformError> {
    list_files(dir, |name| {
        ImageFormat::from_path(name).is_ok_and(|format| format.reading_enabled())
    })
}

/// Text before the first `separator` in `file_name`, or the whole name
/// when the separator does not occur.
#[must_use]
pub fn prefix_of<'a>(file_name: &'a str, separator: &str) -> &'a str {
    file_name.split(separator).next().unwrap_or(file_name)
}

/// Decode an image, or log and return `None` if it cannot be read.
#[must_use]
pub fn open_image(path: &Path) -> Option<DynamicImage> {
    match image::open(path) {
        Ok(img) => Some(img),
        Err(e) => {
            tracing::warn!(file = %path.display(), error = %e, "skipping unreadable image");
            None
        }
    }
}

/// Read only the dimensions of an image, or log and return `None`.
#[must_use]
pub fn dimensions(path: &Path) -> Option<(u32, u32)> {
    match image::image_dimensions(path) {
        Ok(dims) => Some(dims),
        Err(e) => {
            tracing::warn!(file = %path.display(), error = %e, "skipping unreadable image");
            None
        }
    }
}

/// Destination for `source` inside `output_dir`, keeping its file name.
fn destination(source: &Path, output_dir: &Path) -> Result<PathBuf, TransformError> {
    let name = source.file_name().ok_or_else(|| {
        TransformError::InvalidConfig(format!("{} has no file name", source.display()))
    })?;
    Ok(output_dir.join(name))
}

/// Copy `source` into `output_dir` under its own name.
///
/// # Errors
///
/// Returns [`TransformError::Write`] if the copy fails.
pub fn copy_into(source: &Path, output_dir: &Path) -> Result<PathBuf, TransformError> {
    let target = destination(source, output_dir)?;
    fs::copy(source, &target).map_err(|source| TransformError::Write {
        path: target.clone(),
        source,
    })?;
    Ok(target)
}

/// Copy `source` into `output_dir` as `file_name`.
///
/// # Errors
///
/// Returns [`TransformError::Write`] if the copy fails.
pub fn copy_renamed(
    source: &Path,
    output_dir: &Path,
    file_name: &str,
) -> Result<PathBuf, TransformError> {
    let target = output_dir.join(file_name);
    fs::copy(source, &target).map_err(|source| TransformError::Write {
        path: target.clone(),
        source,
    })?;
    Ok(target)
}

/// Save `img` into `output_dir` under the file name of `source`.
///
/// The format follows the file extension. JPEG output is encoded at
/// `jpeg_quality` and loses any alpha channel.
///
/// # Errors
///
/// Returns [`TransformError::Write`] if the file cannot be created and
/// [`TransformError::Encode`] if encoding fails.
pub fn save_into(
    img: &DynamicImage,
    source: &Path,
    output_dir: &Path,
    jpeg_quality: u8,
) -> Result<PathBuf, TransformError> {
    let target = destination(source, output_dir)?;
    let encode_error = |e: image::ImageError| TransformError::Encode {
        path: target.clone(),
        source: Box::new(e),
    };

    match ImageFormat::from_path(&target) {
        Ok(ImageFormat::Jpeg) => {
            let file = fs::File::create(&target).map_err(|source| TransformError::Write {
                path: target.clone(),
                source,
            })?;
            let encoder = JpegEncoder::new_with_quality(BufWriter::new(file), jpeg_quality);
            DynamicImage::ImageRgb8(img.to_rgb8())
                .write_with_encoder(encoder)
                .map_err(encode_error)?;
        }
        _ => img.save(&target).map_err(encode_error)?,
    }
    Ok(target)
}

/// Run `process` on every file in parallel.
///
/// `process` returns whether it wrote an output. The first error aborts
/// the whole batch.
pub(crate) fn process_each<F>(files: &[PathBuf], process: F) -> Result<TransformMetrics, TransformError>
where
    F: Fn(&Path) -> Result<bool, TransformError> + Send + Sync,
{
    let written = files
        .par_iter()
        .map(|path| process(path))
        .collect::<Result<Vec<bool>, _>>()?;
    Ok(TransformMetrics {
        files_read: files.len(),
        files_written: written.into_iter().filter(|&w| w).count(),
    })
}
