//! Checkpoint persistence of the feature matrix.
//!
//! A checkpoint holds exactly `(step, Φ)`. Explicit weights, the running
//! feature-norm estimate and the key stream are not stored, so a resumed
//! run continues from the right Φ but does not replay the same draws.
//!
//! # Layout
//!
//! ```text
//! <workdir>/checkpoints/
//!     checkpoint_step_00005000.json
//!     checkpoint_step_00010000.json
//!     checkpoint_step_00015000.json
//! ```
//!
//! Only the newest `keep_last_n` files are kept.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{AuxTasksError, Result};

/// Current checkpoint format version.
const CHECKPOINT_VERSION: u32 = 1;

const FILE_PREFIX: &str = "checkpoint_step_";

/// Name of the checkpoint directory inside the work directory.
pub const CHECKPOINT_DIR: &str = "checkpoints";

/// Column-major matrix whose non-finite entries are stored as `null`.
///
/// JSON has no NaN; a diverged Φ must still round-trip, so entries go
/// through `Option` and come back as NaN.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredMatrix {
    nrows: usize,
    ncols: usize,
    values: Vec<Option<f64>>,
}

impl StoredMatrix {
    fn from_matrix(matrix: &DMatrix<f64>) -> Self {
        Self {
            nrows: matrix.nrows(),
            ncols: matrix.ncols(),
            values: matrix
                .iter()
                .map(|&v| if v.is_finite() { Some(v) } else { None })
                .collect(),
        }
    }

    fn into_matrix(self) -> Result<DMatrix<f64>> {
        if self.values.len() != self.nrows * self.ncols {
            return Err(AuxTasksError::Checkpoint(format!(
                "matrix has {} values, expected {}x{}",
                self.values.len(),
                self.nrows,
                self.ncols
            )));
        }
        Ok(DMatrix::from_iterator(
            self.nrows,
            self.ncols,
            self.values.into_iter().map(|v| v.unwrap_or(f64::NAN)),
        ))
    }
}

/// Metadata about a checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Wall-clock timestamp (RFC 3339 format).
    pub timestamp: String,
    /// Crate version that wrote the file.
    pub writer_version: String,
}

impl CheckpointMetadata {
    /// Metadata stamped with the current time.
    #[must_use]
    pub fn new() -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            writer_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl Default for CheckpointMetadata {
    fn default() -> Self {
        Self::new()
    }
}

/// On-disk checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhiCheckpoint {
    /// Checkpoint format version for compatibility checking.
    pub version: u32,
    /// Training step at which Φ was saved.
    pub step: u64,
    phi: StoredMatrix,
    /// Metadata about the checkpoint.
    pub metadata: CheckpointMetadata,
}

impl PhiCheckpoint {
    /// Checkpoint of `phi` at `step`.
    #[must_use]
    pub fn new(step: u64, phi: &DMatrix<f64>) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            step,
            phi: StoredMatrix::from_matrix(phi),
            metadata: CheckpointMetadata::new(),
        }
    }

    /// Decode the stored feature matrix.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored shape and values disagree.
    pub fn phi(&self) -> Result<DMatrix<f64>> {
        self.phi.clone().into_matrix()
    }

    /// Saves the checkpoint to a file.
    ///
    /// # Errors
    ///
    /// Returns an error if file creation or serialization fails.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path.as_ref()).map_err(|e| {
            AuxTasksError::Checkpoint(format!("Failed to create checkpoint file: {e}"))
        })?;
        serde_json::to_writer(BufWriter::new(file), self)?;
        Ok(())
    }

    /// Loads a checkpoint from a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file doesn't exist, is corrupted, or has an
    /// incompatible version.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref()).map_err(|e| {
            AuxTasksError::Checkpoint(format!("Failed to open checkpoint file: {e}"))
        })?;
        let checkpoint: Self = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            AuxTasksError::Checkpoint(format!("Failed to deserialize checkpoint: {e}"))
        })?;

        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(AuxTasksError::Checkpoint(format!(
                "Incompatible checkpoint version: {} (expected {})",
                checkpoint.version, CHECKPOINT_VERSION
            )));
        }

        Ok(checkpoint)
    }
}

/// Receives `(step, Φ)` from the training loop.
pub trait CheckpointSink {
    /// Whether `step` is a save point.
    fn should_save(&self, step: u64) -> bool;

    /// Persist Φ at `step`.
    ///
    /// # Errors
    ///
    /// Returns an error if persisting fails.
    fn save(&mut self, step: u64, phi: &DMatrix<f64>) -> Result<()>;
}

/// Directory of rotating checkpoints.
#[derive(Debug)]
pub struct CheckpointStore {
    checkpoint_dir: PathBuf,
    save_interval: u64,
    keep_last_n: usize,
    /// Sorted by step, oldest first.
    checkpoints: Vec<PathBuf>,
}

impl CheckpointStore {
    /// Open (and create) `checkpoint_dir`, picking up existing checkpoints.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or read.
    pub fn new(
        checkpoint_dir: impl AsRef<Path>,
        save_interval: u64,
        keep_last_n: usize,
    ) -> Result<Self> {
        let checkpoint_dir = checkpoint_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&checkpoint_dir).map_err(|e| {
            AuxTasksError::Checkpoint(format!("Failed to create checkpoint directory: {e}"))
        })?;
        let checkpoints = Self::scan_checkpoints(&checkpoint_dir)?;

        Ok(Self {
            checkpoint_dir,
            save_interval,
            keep_last_n,
            checkpoints,
        })
    }

    /// Store under `<workdir>/checkpoints`.
    ///
    /// # Errors
    ///
    /// See [`CheckpointStore::new`].
    pub fn in_workdir(workdir: &Path, save_interval: u64, keep_last_n: usize) -> Result<Self> {
        Self::new(workdir.join(CHECKPOINT_DIR), save_interval, keep_last_n)
    }

    /// Loads the most recent checkpoint, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if loading fails.
    pub fn load_latest(&self) -> Result<Option<PhiCheckpoint>> {
        self.checkpoints
            .last()
            .map(PhiCheckpoint::load)
            .transpose()
    }

    /// Returns the path to the most recent checkpoint.
    #[must_use]
    pub fn latest_checkpoint_path(&self) -> Option<&Path> {
        self.checkpoints.last().map(PathBuf::as_path)
    }

    /// Number of checkpoints on disk.
    #[must_use]
    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    /// Whether the store holds no checkpoint.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }

    /// Resume from the latest checkpoint, or save `initial_phi` as step 0
    /// and start from it.
    ///
    /// # Errors
    ///
    /// Returns an error if loading or saving fails, or if the stored Φ has a
    /// different shape than `initial_phi`.
    pub fn restore_or_initialize(
        &mut self,
        initial_phi: &DMatrix<f64>,
    ) -> Result<(u64, DMatrix<f64>)> {
        let Some(checkpoint) = self.load_latest()? else {
            self.save(0, initial_phi)?;
            return Ok((0, initial_phi.clone()));
        };

        let phi = checkpoint.phi()?;
        if phi.shape() != initial_phi.shape() {
            return Err(AuxTasksError::Checkpoint(format!(
                "checkpoint holds a {}x{} feature matrix, run expects {}x{}",
                phi.nrows(),
                phi.ncols(),
                initial_phi.nrows(),
                initial_phi.ncols()
            )));
        }
        info!(step = checkpoint.step, "restored checkpoint");
        Ok((checkpoint.step, phi))
    }

    fn step_of(path: &Path) -> Option<u64> {
        path.file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.strip_prefix(FILE_PREFIX))
            .and_then(|s| s.parse::<u64>().ok())
    }

    /// Scans directory for existing checkpoints.
    fn scan_checkpoints(dir: &Path) -> Result<Vec<PathBuf>> {
        let entries = std::fs::read_dir(dir).map_err(|e| {
            AuxTasksError::Checkpoint(format!("Failed to read checkpoint directory: {e}"))
        })?;

        let mut checkpoints = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) == Some("json")
                && Self::step_of(&path).is_some()
            {
                checkpoints.push(path);
            }
        }

        checkpoints.sort_by_key(|path| Self::step_of(path).unwrap_or(0));
        Ok(checkpoints)
    }

    /// Rotates old checkpoints to keep only the last N.
    fn rotate_checkpoints(&mut self) -> Result<()> {
        while self.checkpoints.len() > self.keep_last_n {
            let old_checkpoint = self.checkpoints.remove(0);
            std::fs::remove_file(&old_checkpoint).map_err(|e| {
                AuxTasksError::Checkpoint(format!("Failed to delete old checkpoint: {e}"))
            })?;
        }
        Ok(())
    }
}

impl CheckpointSink for CheckpointStore {
    fn should_save(&self, step: u64) -> bool {
        self.save_interval > 0 && step > 0 && step % self.save_interval == 0
    }

    fn save(&mut self, step: u64, phi: &DMatrix<f64>) -> Result<()> {
        let path = self
            .checkpoint_dir
            .join(format!("{FILE_PREFIX}{step:08}.json"));
        PhiCheckpoint::new(step, phi).save(&path)?;
        info!(step, path = %path.display(), "saved checkpoint");

        if !self.checkpoints.contains(&path) {
            self.checkpoints.push(path);
        }
        self.rotate_checkpoints()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn phi(fill: f64) -> DMatrix<f64> {
        DMatrix::from_fn(4, 2, |i, j| fill + (i * 2 + j) as f64)
    }

    fn stored_steps(store: &CheckpointStore) -> Vec<u64> {
        store
            .checkpoints
            .iter()
            .filter_map(|p| CheckpointStore::step_of(p))
            .collect()
    }

    #[test]
    fn test_checkpoint_save_load_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("test_checkpoint.json");

        PhiCheckpoint::new(42, &phi(0.5)).save(&path).unwrap();
        let loaded = PhiCheckpoint::load(&path).unwrap();

        assert_eq!(loaded.version, CHECKPOINT_VERSION);
        assert_eq!(loaded.step, 42);
        assert_eq!(loaded.phi().unwrap(), phi(0.5));
        assert!(chrono::DateTime::parse_from_rfc3339(&loaded.metadata.timestamp).is_ok());
    }

    #[test]
    fn test_checkpoint_keeps_nan() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nan.json");
        let mut diverged = phi(0.0);
        diverged[(1, 1)] = f64::NAN;

        PhiCheckpoint::new(7, &diverged).save(&path).unwrap();
        let restored = PhiCheckpoint::load(&path).unwrap().phi().unwrap();

        assert!(restored[(1, 1)].is_nan());
        assert_eq!(restored[(0, 0)], diverged[(0, 0)]);
    }

    #[test]
    fn test_checkpoint_rejects_wrong_version() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("old.json");
        let mut checkpoint = PhiCheckpoint::new(1, &phi(0.0));
        checkpoint.version = CHECKPOINT_VERSION + 1;
        checkpoint.save(&path).unwrap();

        let err = PhiCheckpoint::load(&path).unwrap_err();
        assert!(err.to_string().contains("Incompatible checkpoint version"));
    }

    #[test]
    fn test_store_rotation() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = CheckpointStore::new(temp_dir.path(), 100, 2).unwrap();

        for step in [100, 200, 300] {
            store.save(step, &phi(step as f64)).unwrap();
        }

        assert_eq!(stored_steps(&store), vec![200, 300]);
        assert!(!temp_dir.path().join("checkpoint_step_00000100.json").exists());
    }

    #[test]
    fn test_store_should_save() {
        let temp_dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp_dir.path(), 100, 3).unwrap();

        assert!(!store.should_save(0));
        assert!(!store.should_save(50));
        assert!(store.should_save(100));
        assert!(!store.should_save(150));
        assert!(store.should_save(200));
    }

    #[test]
    fn test_store_zero_interval_never_saves() {
        let temp_dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(temp_dir.path(), 0, 3).unwrap();
        assert!(!store.should_save(100));
    }

    #[test]
    fn test_store_rescans_directory() {
        let temp_dir = TempDir::new().unwrap();
        {
            let mut store = CheckpointStore::new(temp_dir.path(), 10, 5).unwrap();
            for step in [30, 10, 20] {
                store.save(step, &phi(0.0)).unwrap();
            }
        }
        let store = CheckpointStore::new(temp_dir.path(), 10, 5).unwrap();
        assert_eq!(stored_steps(&store), vec![10, 20, 30]);
        assert_eq!(store.load_latest().unwrap().unwrap().step, 30);
    }

    #[test]
    fn test_restore_or_initialize_fresh() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = CheckpointStore::in_workdir(temp_dir.path(), 10, 3).unwrap();
        assert!(store.load_latest().unwrap().is_none());

        let (step, restored) = store.restore_or_initialize(&phi(1.0)).unwrap();

        assert_eq!(step, 0);
        assert_eq!(restored, phi(1.0));
        assert_eq!(store.len(), 1);
        assert!(temp_dir
            .path()
            .join(CHECKPOINT_DIR)
            .join("checkpoint_step_00000000.json")
            .exists());
    }

    #[test]
    fn test_restore_or_initialize_resumes_latest() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = CheckpointStore::new(temp_dir.path(), 10, 3).unwrap();
        store.save(10, &phi(2.0)).unwrap();
        store.save(20, &phi(3.0)).unwrap();

        let (step, restored) = store.restore_or_initialize(&phi(0.0)).unwrap();

        assert_eq!(step, 20);
        assert_eq!(restored, phi(3.0));
    }

    #[test]
    fn test_restore_rejects_shape_change() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = CheckpointStore::new(temp_dir.path(), 10, 3).unwrap();
        store.save(10, &phi(2.0)).unwrap();

        let result = store.restore_or_initialize(&DMatrix::zeros(4, 3));
        assert!(matches!(result, Err(AuxTasksError::Checkpoint(_))));
    }

    #[test]
    fn test_saving_same_step_twice_keeps_file() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = CheckpointStore::new(temp_dir.path(), 10, 1).unwrap();
        store.save(10, &phi(0.0)).unwrap();
        store.save(10, &phi(1.0)).unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.load_latest().unwrap().unwrap().phi().unwrap(), phi(1.0));
    }
}
