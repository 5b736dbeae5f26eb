//! Run diagnostics: per-stage cache decisions, timings, and counts.
//!
//! Every pipeline run records a [`StageRecord`](crate::StageRecord) per
//! stage. [`RunDiagnostics`] is the serializable view of those records,
//! intended for reports (`--json`) and for tuning how often stages
//! actually recompute.
//!
//! Durations are serialized as fractional seconds (`f64`) for JSON
//! compatibility, since `std::time::Duration` does not implement serde
//! traits.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::stage::{StageRecord, StageState, TransformMetrics};

/// Source of time for measuring stage durations.
///
/// Injected into runs so tests can use a deterministic clock.
pub trait Clock {
    /// Opaque point in time.
    type Instant;

    /// The current instant.
    fn now(&self) -> Self::Instant;

    /// Time elapsed since `since`.
    fn elapsed(&self, since: &Self::Instant) -> Duration;
}

/// [`Clock`] implementation backed by [`std::time::Instant`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    type Instant = Instant;

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn elapsed(&self, since: &Instant) -> Duration {
        since.elapsed()
    }
}

/// Serde support for `std::time::Duration` as fractional seconds.
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Serialize a `Duration` as fractional seconds (`f64`).
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    /// Deserialize a `Duration` from fractional seconds (`f64`).
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(
                "duration seconds must be finite, non-negative, and representable as a Duration",
            )
        })
    }
}

/// Diagnostics collected from a single pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunDiagnostics {
    /// One entry per stage, in execution order.
    pub stages: Vec<StageDiagnostics>,
    /// Total wall-clock duration of the run (seconds).
    #[serde(with = "duration_serde")]
    pub total_duration: Duration,
    /// The error that aborted the run, if any.
    pub error: Option<String>,
}

/// Diagnostics for a single stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDiagnostics {
    /// Stage name.
    pub name: String,
    /// Final state reached.
    pub state: StageState,
    /// Cache entry name (`{stage}_{hash}`), once derived.
    pub entry: Option<String>,
    /// Input fingerprint, once computed.
    pub input_fingerprint: Option<String>,
    /// Published output directory.
    pub output_dir: Option<PathBuf>,
    /// Whether an upstream recompute forced this stage to recompute.
    pub invalidated: bool,
    /// Transform counts, when the transform ran.
    pub metrics: Option<TransformMetrics>,
    /// Wall-clock duration of this stage (seconds).
    #[serde(with = "duration_serde")]
    pub duration: Duration,
}

impl From<&StageRecord> for StageDiagnostics {
    fn from(record: &StageRecord) -> Self {
        Self {
            name: record.name.clone(),
            state: record.state,
            entry: record.key.as_ref().map(ToString::to_string),
            input_fingerprint: record.input_fingerprint.as_ref().map(ToString::to_string),
            output_dir: record.output_dir.clone(),
            invalidated: record.invalidated,
            metrics: record.metrics,
            duration: record.duration,
        }
    }
}

impl RunDiagnostics {
    /// Number of stages whose cache entry was reused.
    #[must_use]
    pub fn reused_count(&self) -> usize {
        self.stages
            .iter()
            .filter(|s| s.state == StageState::Done(crate::StageOutcome::Reused))
            .count()
    }

    /// Number of stages whose transform ran to completion.
    #[must_use]
    pub fn recomputed_count(&self) -> usize {
        self.stages
            .iter()
            .filter(|s| s.state == StageState::Done(crate::StageOutcome::Recomputed))
            .count()
    }

    /// Format diagnostics as a human-readable report.
    #[must_use]
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!("Pipeline Run Report\n{}", "=".repeat(60)));
        lines.push(format!(
            "Total duration: {:.3}ms  |  reused: {}  recomputed: {}",
            duration_ms(self.total_duration),
            self.reused_count(),
            self.recomputed_count(),
        ));
        lines.push(String::new());

        lines.push(format!(
            "{:<16} {:<12} {:>10}  {:<24} {}",
            "Stage", "State", "Duration", "Entry", "Details"
        ));
        lines.push("-".repeat(80));

        for stage in &self.stages {
            let entry = stage.entry.as_deref().unwrap_or("-");
            lines.push(format!(
                "{:<16} {:<12} {:>8.3}ms  {entry:<24} {}",
                stage.name,
                stage.state.to_string(),
                duration_ms(stage.duration),
                format_details(stage),
            ));
        }

        if let Some(ref error) = self.error {
            lines.push(String::new());
            lines.push(format!("Aborted: {error}"));
        }

        lines.join("\n")
    }
}

/// Convert a `Duration` to milliseconds as `f64`.
fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Compact detail string for one stage.
fn format_details(stage: &StageDiagnostics) -> String {
    let mut parts = Vec::new();
    if let Some(ref fp) = stage.input_fingerprint {
        parts.push(format!("input={fp}"));
    }
    if let Some(metrics) = stage.metrics {
        parts.push(format!(
            "{} read -> {} written",
            metrics.files_read, metrics.files_written
        ));
    }
    if stage.invalidated {
        parts.push("(invalidated upstream)".to_string());
    }
    parts.join(" ")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::StageOutcome;

    fn stage(name: &str, state: StageState) -> StageDiagnostics {
        StageDiagnostics {
            name: name.to_string(),
            state,
            entry: Some(format!("{name}_0123abcd")),
            input_fingerprint: Some("deadbeef".to_string()),
            output_dir: None,
            invalidated: false,
            metrics: None,
            duration: Duration::from_millis(5),
        }
    }

    #[test]
    fn duration_ms_converts_correctly() {
        let d = Duration::from_millis(1234);
        assert!((duration_ms(d) - 1234.0).abs() < 0.01);
    }

    #[test]
    fn counts_by_outcome() {
        let diag = RunDiagnostics {
            stages: vec![
                stage("select", StageState::Done(StageOutcome::Reused)),
                stage("resize", StageState::Done(StageOutcome::Recomputed)),
                stage("face_crop", StageState::Done(StageOutcome::Recomputed)),
                stage("identify", StageState::Pending),
            ],
            total_duration: Duration::from_millis(20),
            error: None,
        };
        assert_eq!(diag.reused_count(), 1);
        assert_eq!(diag.recomputed_count(), 2);
    }

    #[test]
    fn report_lists_stages_and_error() {
        let mut resize = stage("resize", StageState::Recomputing);
        resize.metrics = Some(TransformMetrics {
            files_read: 3,
            files_written: 2,
        });
        resize.invalidated = true;
        let diag = RunDiagnostics {
            stages: vec![stage("select", StageState::Done(StageOutcome::Reused)), resize],
            total_duration: Duration::from_millis(10),
            error: Some("stage `resize` failed".to_string()),
        };

        let report = diag.report();
        assert!(report.contains("Pipeline Run Report"));
        assert!(report.contains("select_0123abcd"));
        assert!(report.contains("3 read -> 2 written"));
        assert!(report.contains("(invalidated upstream)"));
        assert!(report.contains("Aborted: stage `resize` failed"));
    }

    #[test]
    fn serializes_durations_as_seconds() {
        let diag = RunDiagnostics {
            stages: vec![stage("select", StageState::Done(StageOutcome::Reused))],
            total_duration: Duration::from_millis(1500),
            error: None,
        };
        let json = serde_json::to_value(&diag).unwrap();
        assert!((json["total_duration"].as_f64().unwrap() - 1.5).abs() < 1e-9);
        let back: RunDiagnostics = serde_json::from_value(json).unwrap();
        assert_eq!(back, diag);
    }
}
