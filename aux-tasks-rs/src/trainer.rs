//! Training loop and run orchestration.
//!
//! [`train`] is the loop itself and touches no files on its own; every side
//! effect goes through [`TrainHooks`]. [`Trainer`] wires it to a work
//! directory: problem generation, checkpoint restore, metric files and the
//! trajectory artifact.

use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};
use nalgebra::DMatrix;
use tracing::{info, warn};

use crate::checkpoint::{CheckpointSink, CheckpointStore};
use crate::config::SyntheticConfig;
use crate::error::Result;
use crate::estimates::max_feature_norm;
use crate::metrics::{compute_metrics, compute_optimal_subspace, StepMetrics};
use crate::psi::{reconstruction_objective, SyntheticProblem};
use crate::rng::{normal_matrix, PrngKey};
use crate::step::{train_step, StepParams, StepState};
use crate::trajectory::{Trajectory, TrajectoryRecorder, TRAJECTORY_FILE};
use crate::writer::{create_default_writer, MetricWriter};

/// Side effects of the loop.
pub struct TrainHooks<'a> {
    /// Receives the scalars of every step.
    pub writer: &'a mut dyn MetricWriter,
    /// Receives `(step, Φ)` at save points; `None` disables checkpointing.
    pub checkpoints: Option<&'a mut dyn CheckpointSink>,
    /// Receives Φ before training and after every step.
    pub trajectory: TrajectoryRecorder,
    /// Draw a progress bar on stderr.
    pub show_progress: bool,
}

/// Result of a run.
#[derive(Debug, Clone)]
pub struct TrainOutcome {
    /// Φ after the last step.
    pub phi: DMatrix<f64>,
    /// Last step performed (the restored step if nothing was left to do).
    pub final_step: u64,
    /// All snapshots, when recording in memory.
    pub trajectory: Option<Trajectory>,
    /// Scalars of the last step, if any step ran.
    pub final_metrics: Option<StepMetrics>,
}

fn progress_bar(config: &SyntheticConfig, initial_step: u64, visible: bool) -> Result<ProgressBar> {
    if !visible {
        return Ok(ProgressBar::hidden());
    }
    let pb = ProgressBar::new(config.num_epochs);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>7}/{len:7} {msg}",
            )?
            .progress_chars("#>-"),
    );
    pb.set_position(initial_step);
    Ok(pb)
}

/// Run steps `initial_step + 1 ..= config.num_epochs` from `phi`.
///
/// The explicit weights are drawn standard normal from a key split off
/// `key`; the feature-norm estimate starts at the max row norm of `phi`
/// when enabled. Per step: [`train_step`], then the subspace metrics of the
/// new Φ, the gradient norm and the reconstruction objective go to the
/// writer, Φ goes to the trajectory, and at save points Φ goes to the
/// checkpoint sink.
///
/// Non-finite values never stop the loop; the first occurrence is logged.
///
/// # Errors
///
/// Returns an error if a hook fails.
pub fn train(
    config: &SyntheticConfig,
    psi: &DMatrix<f64>,
    phi: DMatrix<f64>,
    initial_step: u64,
    optimal_subspace: &DMatrix<f64>,
    key: PrngKey,
    hooks: TrainHooks<'_>,
) -> Result<TrainOutcome> {
    let TrainHooks {
        writer,
        mut checkpoints,
        mut trajectory,
        show_progress,
    } = hooks;
    let params = StepParams::from(config);

    let (key, weights_key) = key.split();
    let mut state = StepState {
        explicit_weights: normal_matrix(weights_key, config.feature_dim, config.num_tasks),
        estimated_feature_norm: config
            .estimate_feature_norm
            .then(|| max_feature_norm(&phi)),
        phi,
        key,
    };

    trajectory.record(initial_step, &state.phi)?;

    let pb = progress_bar(config, initial_step, show_progress)?;
    let mut final_metrics = None;
    let mut warned_non_finite = false;

    for step in initial_step + 1..=config.num_epochs {
        let output = train_step(&params, psi, state);
        state = output.state;

        let metrics = StepMetrics {
            step,
            subspace: compute_metrics(&state.phi, optimal_subspace),
            grad_norm: output.gradient.norm(),
            reconstruction_objective: reconstruction_objective(&state.phi, psi),
        };
        if !warned_non_finite && metrics.has_non_finite() {
            warn!(step, method = %config.method, "non-finite metrics, training continues");
            warned_non_finite = true;
        }

        writer.write_scalars(&metrics)?;
        trajectory.record(step, &state.phi)?;

        if let Some(sink) = checkpoints.as_deref_mut() {
            if sink.should_save(step) {
                sink.save(step, &state.phi)?;
            }
        }

        pb.set_message(format!("cos {:.4}", metrics.subspace.cosine_similarity));
        pb.inc(1);
        final_metrics = Some(metrics);
    }

    pb.finish_with_message("Training complete");
    writer.flush()?;

    Ok(TrainOutcome {
        phi: state.phi,
        final_step: config.num_epochs.max(initial_step),
        trajectory: trajectory.finish()?,
        final_metrics,
    })
}

/// Runs one configuration inside a work directory.
///
/// ```no_run
/// use aux_tasks_rs::{SyntheticConfig, Trainer};
///
/// # fn main() -> aux_tasks_rs::Result<()> {
/// let config = SyntheticConfig::from_preset("lissa")?;
/// let outcome = Trainer::new(config, "runs/lissa")?.run()?;
/// println!("stopped at step {}", outcome.final_step);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Trainer {
    config: SyntheticConfig,
    workdir: PathBuf,
    show_progress: bool,
}

impl Trainer {
    /// Validate `config` and create `workdir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the directory
    /// cannot be created.
    pub fn new(config: SyntheticConfig, workdir: impl AsRef<Path>) -> Result<Self> {
        config.validate()?;
        let workdir = workdir.as_ref().to_path_buf();
        std::fs::create_dir_all(&workdir)?;
        Ok(Self {
            config,
            workdir,
            show_progress: true,
        })
    }

    /// Toggle the progress bar (on by default).
    #[must_use]
    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    /// Configuration of this run.
    #[must_use]
    pub fn config(&self) -> &SyntheticConfig {
        &self.config
    }

    /// Work directory of this run.
    #[must_use]
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Generate the problem, restore or initialize Φ, train, and write the
    /// artifacts.
    ///
    /// # Errors
    ///
    /// Returns an error if the optimal subspace cannot be computed, or on
    /// any checkpoint, metric or trajectory I/O failure.
    pub fn run(&self) -> Result<TrainOutcome> {
        let config = &self.config;
        info!("Starting training");
        info!("  Method: {}", config.method);
        info!(
            "  Problem: S={} T={} d={}",
            config.num_states, config.num_tasks, config.feature_dim
        );
        info!("  Epochs: {}", config.num_epochs);
        info!("  Workdir: {}", self.workdir.display());

        config.to_file(self.workdir.join("config.yaml"))?;

        let problem = SyntheticProblem::generate(config)?;
        let mut store = CheckpointStore::in_workdir(
            &self.workdir,
            config.checkpoint_every,
            config.keep_checkpoints,
        )?;
        let (initial_step, phi) = store.restore_or_initialize(&problem.phi)?;
        if initial_step > 0 {
            info!("Resuming from step {}", initial_step);
        }

        let optimal_subspace = compute_optimal_subspace(&problem.psi, config.feature_dim)?;

        let mut writer = create_default_writer(&self.workdir, config.log_every)?;
        let trajectory = TrajectoryRecorder::create(config.trajectory, &self.workdir, initial_step)?;
        let stream_path = trajectory.stream_path().map(Path::to_path_buf);

        let outcome = train(
            config,
            &problem.psi,
            phi,
            initial_step,
            &optimal_subspace,
            problem.key,
            TrainHooks {
                writer: &mut writer,
                checkpoints: Some(&mut store),
                trajectory,
                show_progress: self.show_progress,
            },
        )?;

        if outcome.final_step > initial_step {
            store.save(outcome.final_step, &outcome.phi)?;
        }
        if let Some(trajectory) = &outcome.trajectory {
            let path = self.workdir.join(TRAJECTORY_FILE);
            trajectory.save(&path)?;
            info!("Saved {} snapshots to {}", trajectory.len(), path.display());
        }
        if let Some(path) = &stream_path {
            info!("Streamed snapshots to {}", path.display());
        }

        match &outcome.final_metrics {
            Some(metrics) => info!(
                "Finished at step {}: cosine_similarity={:.4} {}={:.4}",
                outcome.final_step,
                metrics.subspace.cosine_similarity,
                metrics.subspace.alignment.name(),
                metrics.subspace.alignment.value()
            ),
            None => info!("Nothing to do: already at step {}", outcome.final_step),
        }

        Ok(outcome)
    }
}
