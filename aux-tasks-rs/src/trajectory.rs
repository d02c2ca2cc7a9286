//! Recording of Φ snapshots over a run.
//!
//! Index 0 is the pre-training Φ, then one snapshot per step. A full run of
//! 200k steps on a 10×1 problem is small, but larger problems are not, so
//! the default is to stream snapshots to `phis.jsonl` rather than hold them.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::config::TrajectoryMode;
use crate::error::Result;

/// Artifact name for in-memory trajectories.
pub const TRAJECTORY_FILE: &str = "phis.json";

/// Artifact name for streamed trajectories.
pub const TRAJECTORY_STREAM_FILE: &str = "phis.jsonl";

/// Φ snapshots of one run, in step order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    /// Step of the first snapshot.
    pub initial_step: u64,
    /// Snapshots, one per step starting at `initial_step`.
    pub snapshots: Vec<DMatrix<f64>>,
}

impl Trajectory {
    /// Empty trajectory starting at `initial_step`.
    #[must_use]
    pub fn new(initial_step: u64) -> Self {
        Self {
            initial_step,
            snapshots: Vec::new(),
        }
    }

    /// Number of snapshots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    /// Whether nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// `(snapshots, S, d)`, or `None` when empty.
    #[must_use]
    pub fn shape(&self) -> Option<(usize, usize, usize)> {
        self.snapshots
            .first()
            .map(|phi| (self.snapshots.len(), phi.nrows(), phi.ncols()))
    }

    /// Snapshot taken at `step`.
    #[must_use]
    pub fn at_step(&self, step: u64) -> Option<&DMatrix<f64>> {
        let offset = step.checked_sub(self.initial_step)?;
        self.snapshots.get(usize::try_from(offset).ok()?)
    }

    /// Write as a single JSON document.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer(BufWriter::new(file), self)?;
        Ok(())
    }

    /// Read a document written by [`Trajectory::save`]. Fails on snapshots
    /// containing non-finite values, which JSON stores as `null`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }
}

#[derive(Serialize)]
struct SnapshotLine<'a> {
    step: u64,
    phi: &'a DMatrix<f64>,
}

/// Sink for snapshots chosen by [`TrajectoryMode`].
#[derive(Debug)]
pub enum TrajectoryRecorder {
    /// Keep every snapshot.
    Memory(Trajectory),
    /// Append each snapshot as one JSON line.
    Stream {
        /// Destination file.
        path: PathBuf,
        /// Buffered handle.
        writer: BufWriter<File>,
    },
    /// Drop snapshots.
    Off,
}

impl TrajectoryRecorder {
    /// Recorder for `mode`; streaming appends to `phis.jsonl` in `workdir`.
    ///
    /// Lines an earlier run wrote for `initial_step` or later are dropped
    /// first, so a resumed stream holds each step exactly once.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream file cannot be rewritten or opened.
    pub fn create(mode: TrajectoryMode, workdir: &Path, initial_step: u64) -> Result<Self> {
        match mode {
            TrajectoryMode::Memory => Ok(Self::Memory(Trajectory::new(initial_step))),
            TrajectoryMode::Stream => {
                let path = workdir.join(TRAJECTORY_STREAM_FILE);
                truncate_stream(&path, initial_step)?;
                let file = OpenOptions::new().create(true).append(true).open(&path)?;
                Ok(Self::Stream {
                    path,
                    writer: BufWriter::new(file),
                })
            }
            TrajectoryMode::Off => Ok(Self::Off),
        }
    }

    /// File the stream recorder appends to.
    #[must_use]
    pub fn stream_path(&self) -> Option<&Path> {
        match self {
            Self::Stream { path, .. } => Some(path),
            Self::Memory(_) | Self::Off => None,
        }
    }

    /// In-memory recorder, no filesystem involved.
    #[must_use]
    pub fn memory(initial_step: u64) -> Self {
        Self::Memory(Trajectory::new(initial_step))
    }

    /// Record Φ at `step`.
    ///
    /// # Errors
    ///
    /// Returns an error if streaming to disk fails.
    pub fn record(&mut self, step: u64, phi: &DMatrix<f64>) -> Result<()> {
        match self {
            Self::Memory(trajectory) => trajectory.snapshots.push(phi.clone()),
            Self::Stream { writer, .. } => {
                serde_json::to_writer(&mut *writer, &SnapshotLine { step, phi })?;
                writer.write_all(b"\n")?;
            }
            Self::Off => {}
        }
        Ok(())
    }

    /// Flush the stream and hand back the in-memory trajectory, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if flushing fails.
    pub fn finish(self) -> Result<Option<Trajectory>> {
        match self {
            Self::Memory(trajectory) => Ok(Some(trajectory)),
            Self::Stream { mut writer, .. } => {
                writer.flush()?;
                Ok(None)
            }
            Self::Off => Ok(None),
        }
    }
}

#[derive(Deserialize)]
struct StreamedStep {
    step: u64,
}

/// Keep only the lines of `path` recorded before `from_step`.
fn truncate_stream(path: &Path, from_step: u64) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let staging = path.with_extension("jsonl.tmp");
    {
        let reader = BufReader::new(File::open(path)?);
        let mut writer = BufWriter::new(File::create(&staging)?);
        for line in reader.lines() {
            let line = line?;
            // A torn last line from an interrupted run does not parse.
            let Ok(entry) = serde_json::from_str::<StreamedStep>(&line) else {
                continue;
            };
            if entry.step < from_step {
                writer.write_all(line.as_bytes())?;
                writer.write_all(b"\n")?;
            }
        }
        writer.flush()?;
    }
    fs::rename(&staging, path)?;
    Ok(())
}
