//! # aux-tasks-rs
//!
//! Stochastic learning of the top-`d` left singular subspace of a target
//! matrix Ψ (`S × T`, states by auxiliary tasks).
//!
//! A feature matrix Φ (`S × d`) is trained by SGD on the least-squares
//! reconstruction of Ψ. Each step needs the optimal weight vector of one
//! sampled task, which involves the inverse feature covariance. The crate
//! compares ways of getting it:
//!
//! - **explicit** - a separate weight matrix trained alongside Φ
//! - **oracle** - exact inverse covariance from all states
//! - **naive** - inverse of a sampled covariance, one shared draw
//! - **naive++** - two independent naive draws
//! - **lissa** - two independent LISSA series estimates
//!
//! ## Quick Start (CLI)
//!
//! ```bash
//! # Write a config for one method
//! aux-tasks init lissa.yaml --preset lissa
//!
//! # Validate configuration
//! aux-tasks validate lissa.yaml
//!
//! # Train; re-running the same command resumes from the last checkpoint
//! aux-tasks train lissa.yaml --workdir runs/lissa
//! ```
//!
//! ## Quick Start (Library)
//!
//! ```no_run
//! use aux_tasks_rs::{SyntheticConfig, Trainer};
//!
//! # fn main() -> aux_tasks_rs::Result<()> {
//! let config = SyntheticConfig::from_file("config.yaml")?;
//! let outcome = Trainer::new(config, "runs/example")?.run()?;
//! println!("final step: {}", outcome.final_step);
//! # Ok(())
//! # }
//! ```
//!
//! ## Building Custom Configurations
//!
//! ```rust
//! use aux_tasks_rs::{Method, SyntheticConfig};
//! use aux_tasks_rs::config::{RescalePsi, TrajectoryMode};
//!
//! let config = SyntheticConfig {
//!     method: Method::NaivePlusPlus,
//!     num_states: 50,
//!     num_tasks: 20,
//!     feature_dim: 3,
//!     rescale_psi: RescalePsi::Exp,
//!     trajectory: TrajectoryMode::Off,
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod estimates;
pub mod metrics;
pub mod psi;
pub mod rng;
pub mod step;
pub mod trainer;
pub mod trajectory;
pub mod writer;

pub use config::{Method, SyntheticConfig};
pub use error::{AuxTasksError, Result};
pub use metrics::{Alignment, StepMetrics, SubspaceMetrics};
pub use rng::PrngKey;
pub use step::{solve_weights, train_step, StepOutput, StepParams, StepState};
pub use trainer::{train, TrainHooks, TrainOutcome, Trainer};
pub use trajectory::Trajectory;
