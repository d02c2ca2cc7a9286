//! Metric stream sinks.
//!
//! Every training step produces one [`StepMetrics`]. The loop hands it to a
//! [`MetricWriter`]; by default that is a [`MultiWriter`] fanning out to a
//! JSONL file in the work directory and to `tracing`.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use crate::error::Result;
use crate::metrics::StepMetrics;

/// File name of the metric stream inside the work directory.
pub const METRICS_FILE: &str = "metrics.jsonl";

/// Destination for per-step scalars.
pub trait MetricWriter {
    /// Record the scalars of one step.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying sink fails.
    fn write_scalars(&mut self, metrics: &StepMetrics) -> Result<()>;

    /// Flush buffered records.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying sink fails.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// One line of `metrics.jsonl`. Non-finite values serialize as `null`.
#[derive(Serialize)]
struct MetricLine<'a> {
    step: u64,
    timestamp: String,
    #[serde(flatten)]
    scalars: BTreeMap<&'a str, f64>,
}

/// Appends one JSON object per step to a file.
#[derive(Debug)]
pub struct JsonlWriter {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlWriter {
    /// Open `path` for appending, creating it if needed. A resumed run keeps
    /// the lines written before the restart.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    /// Path of the file being written.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetricWriter for JsonlWriter {
    fn write_scalars(&mut self, metrics: &StepMetrics) -> Result<()> {
        let line = MetricLine {
            step: metrics.step,
            timestamp: chrono::Utc::now().to_rfc3339(),
            scalars: metrics.scalars().into_iter().collect(),
        };
        serde_json::to_writer(&mut self.writer, &line)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Emits every `log_every`-th step as a `debug!` event.
#[derive(Debug, Clone, Copy)]
pub struct TracingWriter {
    log_every: u64,
}

impl TracingWriter {
    /// `log_every == 0` disables logging.
    #[must_use]
    pub const fn new(log_every: u64) -> Self {
        Self { log_every }
    }
}

impl MetricWriter for TracingWriter {
    fn write_scalars(&mut self, metrics: &StepMetrics) -> Result<()> {
        if self.log_every == 0 || metrics.step % self.log_every != 0 {
            return Ok(());
        }
        debug!(
            step = metrics.step,
            cosine_similarity = metrics.subspace.cosine_similarity,
            feature_norm = metrics.subspace.feature_norm,
            eigengame_subspace_distance = metrics.subspace.eigengame_subspace_distance,
            alignment = metrics.subspace.alignment.name(),
            alignment_value = metrics.subspace.alignment.value(),
            grad_norm = metrics.grad_norm,
            reconstruction_objective = metrics.reconstruction_objective,
            "step metrics"
        );
        Ok(())
    }
}

/// Keeps every record; used by tests and library callers that want the
/// learning curve without touching disk.
#[derive(Debug, Clone, Default)]
pub struct MemoryWriter {
    /// Records in write order.
    pub records: Vec<StepMetrics>,
}

impl MetricWriter for MemoryWriter {
    fn write_scalars(&mut self, metrics: &StepMetrics) -> Result<()> {
        self.records.push(*metrics);
        Ok(())
    }
}

/// Forwards to several writers in order.
#[derive(Default)]
pub struct MultiWriter {
    writers: Vec<Box<dyn MetricWriter>>,
}

impl MultiWriter {
    /// Empty fan-out.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a writer.
    #[must_use]
    pub fn with(mut self, writer: impl MetricWriter + 'static) -> Self {
        self.writers.push(Box::new(writer));
        self
    }

    /// Number of writers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.writers.len()
    }

    /// Whether no writer is attached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.writers.is_empty()
    }
}

impl MetricWriter for MultiWriter {
    fn write_scalars(&mut self, metrics: &StepMetrics) -> Result<()> {
        for writer in &mut self.writers {
            writer.write_scalars(metrics)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        for writer in &mut self.writers {
            writer.flush()?;
        }
        Ok(())
    }
}

/// JSONL file in `workdir` plus tracing output.
///
/// # Errors
///
/// Returns an error if the metrics file cannot be opened.
pub fn create_default_writer(workdir: &Path, log_every: u64) -> Result<MultiWriter> {
    Ok(MultiWriter::new()
        .with(JsonlWriter::create(workdir.join(METRICS_FILE))?)
        .with(TracingWriter::new(log_every)))
}
