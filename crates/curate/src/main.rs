//! curate: run the image curation pipeline over a directory.
//!
//! Selects the best image per filename-prefix group, resizes it, and
//! crops it to a square. Every stage's output is cached under
//! `{cache_base}/processed/`, so a rerun with unchanged inputs and
//! settings reuses everything, and a changed setting only recomputes the
//! stages it affects.
//!
//! # Usage
//!
//! ```text
//! cargo run --release --bin curate -- [OPTIONS] <INPUT_DIR>
//! ```

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use curate_pipeline::{CacheStore, FingerprintMode, PipelineConfig};
use curate_stages::{NoFaceDetector, Preset};

/// Incremental, cache-aware image curation.
///
/// Runs select -> resize -> face_crop over INPUT_DIR and prints a
/// per-stage report showing which stages were reused from the cache.
#[derive(Parser)]
#[command(name = "curate", version)]
struct Cli {
    /// Directory of source images.
    input_dir: PathBuf,

    /// Target resolution in pixels.
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_TARGET_SIZE, value_parser = clap::builder::RangedU64ValueParser::<u32>::new().range(1..))]
    target_size: u32,

    /// Comma-separated glob patterns selecting input files.
    #[arg(long, default_value = PipelineConfig::DEFAULT_FILE_PATTERN)]
    file_pattern: String,

    /// Separator between the grouping prefix and the rest of a file name.
    #[arg(long, default_value = PipelineConfig::DEFAULT_PREFIX_SEPARATOR)]
    prefix_separator: String,

    /// JPEG quality (1-100) for re-encoded images.
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_JPEG_QUALITY, value_parser = clap::value_parser!(u8).range(1..=100))]
    jpeg_quality: u8,

    /// Full pipeline config as a JSON string.
    ///
    /// When provided, the individual config flags are ignored. Unknown
    /// keys are kept and take part in cache keys.
    #[arg(long)]
    config_json: Option<String>,

    /// Directory holding `processed/`. Defaults to the parent of
    /// INPUT_DIR.
    #[arg(long)]
    cache_base: Option<PathBuf>,

    /// Hash file contents, not just names and sizes, when deciding
    /// whether a stage's input changed.
    #[arg(long)]
    strict_fingerprint: bool,

    /// Output diagnostics as JSON instead of the human-readable report.
    #[arg(long)]
    json: bool,

    /// Enable debug logging.
    #[arg(short, long)]
    verbose: bool,
}

/// Build a [`PipelineConfig`] from CLI arguments.
///
/// If `--config-json` is provided, the JSON is parsed directly and the
/// individual flags are ignored.
fn config_from_cli(cli: &Cli) -> Result<PipelineConfig, String> {
    if let Some(ref json) = cli.config_json {
        return serde_json::from_str(json).map_err(|e| format!("Error parsing --config-json: {e}"));
    }

    Ok(PipelineConfig {
        target_size: cli.target_size,
        file_pattern: cli.file_pattern.clone(),
        prefix_separator: cli.prefix_separator.clone(),
        jpeg_quality: cli.jpeg_quality,
        ..PipelineConfig::default()
    })
}

/// The cache base: `--cache-base`, or the input directory's parent.
fn cache_base(cli: &Cli) -> PathBuf {
    if let Some(ref base) = cli.cache_base {
        return base.clone();
    }
    match cli.input_dir.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn setup_logging(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("curate=debug,curate_pipeline=debug,curate_stages=debug")
        } else {
            EnvFilter::new("curate=info,curate_pipeline=info,curate_stages=warn")
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let config = match config_from_cli(&cli) {
        Ok(c) => c,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::FAILURE;
        }
    };

    let mode = if cli.strict_fingerprint {
        FingerprintMode::Content
    } else {
        FingerprintMode::NameSize
    };
    let store = CacheStore::new(cache_base(&cli)).with_fingerprint_mode(mode);

    let graph = match Preset::Basic.build(Arc::new(NoFaceDetector), None) {
        Ok(g) => g,
        Err(e) => {
            eprintln!("Pipeline error: {e}");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(
        input = %cli.input_dir.display(),
        cache = %store.root().display(),
        fingerprint = %mode,
        "starting run"
    );
    let run = graph.run(&store, &cli.input_dir, &config);
    let diagnostics = run.diagnostics();

    if cli.json {
        match serde_json::to_string_pretty(&diagnostics) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("Error serializing diagnostics: {e}");
                return ExitCode::FAILURE;
            }
        }
    } else {
        println!("{}", diagnostics.report());
    }

    match run.into_result() {
        Ok(output) => {
            print_output(&output, cli.json);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Pipeline error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Point the user at the final stage's directory.
fn print_output(output: &Path, json: bool) {
    if json {
        eprintln!("Output: {}", output.display());
    } else {
        println!("Output: {}", output.display());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn flags_build_config() {
        let cli = Cli::parse_from([
            "curate",
            "photos",
            "--target-size",
            "256",
            "--jpeg-quality",
            "80",
            "--file-pattern",
            "*.png",
        ]);
        let config = config_from_cli(&cli).unwrap();
        assert_eq!(config.target_size, 256);
        assert_eq!(config.jpeg_quality, 80);
        assert_eq!(config.file_pattern, "*.png");
        assert_eq!(config.prefix_separator, "_");
    }

    #[test]
    fn config_json_overrides_flags() {
        let cli = Cli::parse_from([
            "curate",
            "photos",
            "--target-size",
            "256",
            "--config-json",
            r#"{"target_size": 128, "detector_model": "hog"}"#,
        ]);
        let config = config_from_cli(&cli).unwrap();
        assert_eq!(config.target_size, 128);
        assert!(config.extra.contains_key("detector_model"));
    }

    #[test]
    fn bad_config_json_is_reported() {
        let cli = Cli::parse_from(["curate", "photos", "--config-json", "{"]);
        assert!(config_from_cli(&cli).unwrap_err().contains("--config-json"));
    }

    #[test]
    fn cache_base_defaults_to_input_parent() {
        let cli = Cli::parse_from(["curate", "/data/shoot/photos"]);
        assert_eq!(cache_base(&cli), PathBuf::from("/data/shoot"));

        let cli = Cli::parse_from(["curate", "photos"]);
        assert_eq!(cache_base(&cli), PathBuf::from("."));

        let cli = Cli::parse_from(["curate", "photos", "--cache-base", "/tmp/c"]);
        assert_eq!(cache_base(&cli), PathBuf::from("/tmp/c"));
    }

    #[test]
    fn quality_out_of_range_is_rejected() {
        assert!(Cli::try_parse_from(["curate", "photos", "--jpeg-quality", "0"]).is_err());
        assert!(Cli::try_parse_from(["curate", "photos", "--target-size", "0"]).is_err());
    }
}
