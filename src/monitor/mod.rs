//! Per-frame performance monitor and session reports.
//!
//! Usage follows a bracket per prediction:
//!
//! ```no_run
//! # use edge_lora::{AdaptiveClassifier, PerformanceMonitor, LogFormat, Result};
//! # fn run(classifier: &AdaptiveClassifier, image: &image::DynamicImage) -> Result<()> {
//! let mut monitor = PerformanceMonitor::new("rain_eval", "results/logs", LogFormat::Strict);
//! monitor.start_frame();
//! let result = classifier.predict(image)?;
//! monitor.end_frame(Some(3), &result)?;
//! let paths = monitor.save_report()?;
//! # Ok(())
//! # }
//! ```

pub mod memory;
pub mod metrics;
pub mod record;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::device::DeviceContext;
use crate::error::{EdgeError, Result};
use crate::inference::InferenceResult;
#[cfg(feature = "cuda")]
pub use memory::CudaMemory;
pub use memory::{probe_for, MemoryProbe, NullMemory, ProcessMemory};
pub use metrics::{ClassMetrics, ConfusionMatrix, SessionReport};
pub use record::InferenceRecord;
use record::{BasicRow, StrictRow};

/// CSV layout and artifact set written by [`PerformanceMonitor::save_report`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Raw log only
    #[default]
    Basic,
    /// Raw log with probabilities plus per-class, confusion and summary files
    Strict,
}

/// Files written by one [`PerformanceMonitor::save_report`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportPaths {
    /// Raw per-frame CSV
    pub log: PathBuf,
    /// Per-class precision/recall/F1 CSV (strict only)
    pub per_class: Option<PathBuf>,
    /// Confusion matrix CSV (strict only)
    pub confusion: Option<PathBuf>,
    /// JSON summary (strict only)
    pub summary: Option<PathBuf>,
}

/// Accumulates one [`InferenceRecord`] per bracketed prediction.
pub struct PerformanceMonitor {
    experiment: String,
    output_dir: PathBuf,
    format: LogFormat,
    probe: Box<dyn MemoryProbe>,
    frame_start: Option<Instant>,
    records: Vec<InferenceRecord>,
}

impl PerformanceMonitor {
    /// Monitor sampling process memory.
    pub fn new(
        experiment: impl Into<String>,
        output_dir: impl Into<PathBuf>,
        format: LogFormat,
    ) -> Self {
        Self {
            experiment: experiment.into(),
            output_dir: output_dir.into(),
            format,
            probe: Box::new(ProcessMemory),
            frame_start: None,
            records: Vec::new(),
        }
    }

    /// Monitor sampling the memory of the backend selected by `ctx`.
    pub fn for_device(
        experiment: impl Into<String>,
        output_dir: impl Into<PathBuf>,
        format: LogFormat,
        ctx: &DeviceContext,
    ) -> Self {
        let mut monitor = Self::new(experiment, output_dir, format);
        monitor.probe = probe_for(ctx);
        info!(source = monitor.probe.source(), "memory probe selected");
        monitor
    }

    /// What the memory column measures.
    #[must_use]
    pub fn memory_source(&self) -> &'static str {
        self.probe.source()
    }

    /// Replace the memory probe.
    #[must_use]
    pub fn with_memory_probe(mut self, probe: impl MemoryProbe + 'static) -> Self {
        self.probe = Box::new(probe);
        self
    }

    /// Experiment name.
    #[must_use]
    pub fn experiment(&self) -> &str {
        &self.experiment
    }

    /// Mark the start of a frame and reset the peak memory counter.
    pub fn start_frame(&mut self) {
        self.probe.reset_peak();
        self.frame_start = Some(Instant::now());
    }

    /// Close the current frame and append its record.
    ///
    /// # Errors
    /// Returns [`EdgeError::FrameNotStarted`] if no frame is open.
    pub fn end_frame(
        &mut self,
        ground_truth: Option<usize>,
        result: &InferenceResult,
    ) -> Result<&InferenceRecord> {
        let start = self.frame_start.take().ok_or(EdgeError::FrameNotStarted)?;
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
        let memory_mb = self.probe.peak_mb();
        self.records.push(InferenceRecord::new(
            &self.experiment,
            ground_truth,
            result,
            latency_ms,
            memory_mb,
        ));
        let index = self.records.len() - 1;
        Ok(&self.records[index])
    }

    /// All records so far.
    #[must_use]
    pub fn records(&self) -> &[InferenceRecord] {
        &self.records
    }

    /// Aggregate the records without side effects.
    #[must_use]
    pub fn report(&self) -> SessionReport {
        SessionReport::from_records(&self.experiment, &self.records)
    }

    /// Write the session artifacts to the output directory and return their paths.
    ///
    /// Files share the stem `{experiment}_{YYYYmmdd_HHMM}`.
    ///
    /// # Errors
    /// Returns an error if the directory or any file cannot be written.
    pub fn save_report(&self) -> Result<ReportPaths> {
        fs::create_dir_all(&self.output_dir)?;
        let stem = format!("{}_{}", self.experiment, Local::now().format("%Y%m%d_%H%M"));
        let log = self.output_dir.join(format!("{stem}.csv"));
        self.write_log(&log)?;

        let report = self.report();
        let mut paths = ReportPaths {
            log,
            per_class: None,
            confusion: None,
            summary: None,
        };

        if self.format == LogFormat::Strict {
            let per_class = self.output_dir.join(format!("{stem}_per_class.csv"));
            write_per_class(&per_class, &report.per_class)?;
            let confusion = self.output_dir.join(format!("{stem}_confusion.csv"));
            write_confusion(&confusion, &report.confusion)?;
            let summary = self.output_dir.join(format!("{stem}_summary.json"));
            fs::write(&summary, serde_json::to_string_pretty(&report)?)?;

            paths.per_class = Some(per_class);
            paths.confusion = Some(confusion);
            paths.summary = Some(summary);
        }

        info!(
            experiment = %self.experiment,
            frames = report.frames,
            mean_latency_ms = report.mean_latency_ms,
            accuracy = ?report.accuracy,
            mean_entropy = report.mean_entropy,
            path = %paths.log.display(),
            "session report saved"
        );
        Ok(paths)
    }

    fn write_log(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        match self.format {
            LogFormat::Basic => {
                for record in &self.records {
                    writer.serialize(BasicRow::from(record))?;
                }
            }
            LogFormat::Strict => {
                for record in &self.records {
                    writer.serialize(StrictRow::from(record))?;
                }
            }
        }
        writer.flush()?;
        Ok(())
    }
}

fn write_per_class(path: &Path, metrics: &[ClassMetrics]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["class", "precision", "recall", "f1", "support"])?;
    for m in metrics {
        writer.write_record([
            m.class.to_string(),
            format!("{:.4}", m.precision),
            format!("{:.4}", m.recall),
            format!("{:.4}", m.f1),
            m.support.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

fn write_confusion(path: &Path, matrix: &ConfusionMatrix) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    let header = std::iter::once("true\\pred".to_string())
        .chain(matrix.labels.iter().map(ToString::to_string));
    writer.write_record(header)?;
    for (label, row) in matrix.labels.iter().zip(&matrix.counts) {
        let fields = std::iter::once(label.to_string()).chain(row.iter().map(ToString::to_string));
        writer.write_record(fields)?;
    }
    writer.flush()?;
    Ok(())
}
