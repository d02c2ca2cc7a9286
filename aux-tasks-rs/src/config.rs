//! Configuration parsing and validation.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{AuxTasksError, Result};

/// Configuration of one synthetic subspace-learning run.
///
/// The configuration is read once at start-up and passed by value into the
/// trainer; nothing mutates it afterwards. Every field has a default, so a
/// YAML file only needs to list what differs from the reference run.
///
/// # Example
///
/// ```rust
/// use aux_tasks_rs::{Method, SyntheticConfig};
///
/// # fn main() -> aux_tasks_rs::Result<()> {
/// let yaml = "method: lissa\nS: 20\nT: 50\nd: 3\nkappa: 0.5\n";
/// let config: SyntheticConfig = serde_yaml::from_str(yaml)?;
/// config.validate()?;
///
/// assert_eq!(config.method, Method::Lissa);
/// assert_eq!(config.num_states, 20);
/// assert_eq!(config.main_batch_size, 32);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyntheticConfig {
    /// How the weight vectors of a step are obtained.
    pub method: Method,

    /// Optimizer applied to the feature matrix.
    pub optimizer: Optimizer,

    /// Number of gradient steps (not passes over the data).
    pub num_epochs: u64,

    /// Optional spectrum rewrite applied to the target matrix.
    pub rescale_psi: RescalePsi,

    /// Number of states (rows of Φ and Ψ).
    #[serde(alias = "S")]
    pub num_states: usize,

    /// Number of auxiliary tasks (columns of Ψ).
    #[serde(alias = "T")]
    pub num_tasks: usize,

    /// Feature dimension (columns of Φ).
    #[serde(alias = "d")]
    pub feature_dim: usize,

    /// Track a running average of the max feature norm for LISSA.
    pub estimate_feature_norm: bool,

    /// LISSA damping.
    pub kappa: f64,

    /// States sampled per inverse-covariance estimate (the `J` parameter).
    pub covariance_batch_size: usize,

    /// States updated per step.
    pub main_batch_size: usize,

    /// States sampled per weight vector.
    pub weight_batch_size: usize,

    /// Seed of the run key.
    pub seed: u64,

    /// SGD step size.
    #[serde(alias = "lr")]
    pub learning_rate: f64,

    /// Save a checkpoint every N steps (0 disables periodic saves).
    pub checkpoint_every: u64,

    /// Number of checkpoints kept on disk.
    pub keep_checkpoints: usize,

    /// Log the metric set every N steps.
    pub log_every: u64,

    /// How Φ snapshots are recorded during training.
    pub trajectory: TrajectoryMode,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            method: Method::Explicit,
            optimizer: Optimizer::Sgd,
            num_epochs: 200_000,
            rescale_psi: RescalePsi::None,
            num_states: 10,
            num_tasks: 10,
            feature_dim: 1,
            estimate_feature_norm: true,
            kappa: 0.9,
            covariance_batch_size: 32,
            main_batch_size: 32,
            weight_batch_size: 32,
            seed: 4_753_849,
            learning_rate: 0.01,
            checkpoint_every: 5_000,
            keep_checkpoints: 3,
            log_every: 1_000,
            trajectory: TrajectoryMode::Stream,
        }
    }
}

/// Weight-vector method used by the training step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    /// Weights are a learned parameter with their own gradient.
    #[default]
    #[serde(rename = "explicit")]
    Explicit,
    /// Exact pseudo-inverse of the full Gram matrix, all states.
    #[serde(rename = "oracle")]
    Oracle,
    /// One sampled Gram inverse shared by both weight vectors.
    #[serde(rename = "naive")]
    Naive,
    /// Two independent sampled Gram inverses.
    #[serde(rename = "naive++")]
    NaivePlusPlus,
    /// Two independent Neumann-series estimates.
    #[serde(rename = "lissa")]
    Lissa,
}

impl Method {
    /// All methods, in the order they are usually compared.
    pub const ALL: [Method; 5] = [
        Method::Explicit,
        Method::Oracle,
        Method::Naive,
        Method::NaivePlusPlus,
        Method::Lissa,
    ];

    /// Name used in config files and on the command line.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Method::Explicit => "explicit",
            Method::Oracle => "oracle",
            Method::Naive => "naive",
            Method::NaivePlusPlus => "naive++",
            Method::Lissa => "lissa",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = AuxTasksError;

    fn from_str(s: &str) -> Result<Self> {
        Method::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| AuxTasksError::Config(format!("Unknown method: {s}")))
    }
}

/// Optimizer for the feature matrix. Only plain SGD exists; any other value
/// in a config file is rejected while parsing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Optimizer {
    /// Stochastic gradient descent.
    #[default]
    Sgd,
}

/// Spectrum rewrite applied to the random target matrix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RescalePsi {
    /// Keep the Gaussian spectrum.
    #[default]
    #[serde(rename = "", alias = "none")]
    None,
    /// Linearly decaying singular values.
    #[serde(rename = "linear")]
    Linear,
    /// Exponentially decaying singular values.
    #[serde(rename = "exp")]
    Exp,
}

/// How snapshots of Φ are kept during a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrajectoryMode {
    /// Keep every snapshot in memory and write one artifact at the end.
    Memory,
    /// Append each snapshot to a JSON-lines artifact as it is produced.
    #[default]
    Stream,
    /// Do not record snapshots.
    Off,
}

impl SyntheticConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a valid config,
    /// including unknown `method` or `optimizer` values.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create a configuration from a preset.
    ///
    /// Each method name is a preset: the reference run with that method.
    ///
    /// ```rust
    /// use aux_tasks_rs::{Method, SyntheticConfig};
    ///
    /// # fn main() -> aux_tasks_rs::Result<()> {
    /// let config = SyntheticConfig::from_preset("naive++")?;
    /// assert_eq!(config.method, Method::NaivePlusPlus);
    /// assert!(SyntheticConfig::from_preset("adam").is_err());
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`AuxTasksError::Config`] for an unknown preset.
    pub fn from_preset(preset: &str) -> Result<Self> {
        let method: Method = preset
            .parse()
            .map_err(|_| AuxTasksError::Config(format!("Unknown preset: {preset}")))?;
        Ok(Self {
            method,
            ..Self::default()
        })
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`AuxTasksError::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.num_states == 0 {
            return Err(AuxTasksError::Config("num_states must be > 0".into()));
        }
        if self.num_tasks == 0 {
            return Err(AuxTasksError::Config("num_tasks must be > 0".into()));
        }
        if self.feature_dim == 0 {
            return Err(AuxTasksError::Config("feature_dim must be > 0".into()));
        }
        if self.feature_dim > self.num_states {
            return Err(AuxTasksError::Config(format!(
                "feature_dim ({}) must not exceed num_states ({})",
                self.feature_dim, self.num_states
            )));
        }
        if self.num_epochs == 0 {
            return Err(AuxTasksError::Config("num_epochs must be > 0".into()));
        }
        for (name, size) in [
            ("covariance_batch_size", self.covariance_batch_size),
            ("main_batch_size", self.main_batch_size),
            ("weight_batch_size", self.weight_batch_size),
        ] {
            if size == 0 {
                return Err(AuxTasksError::Config(format!("{name} must be > 0")));
            }
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(AuxTasksError::Config(
                "learning_rate must be finite and > 0".into(),
            ));
        }
        if !(self.kappa.is_finite() && self.kappa > 0.0) {
            return Err(AuxTasksError::Config("kappa must be finite and > 0".into()));
        }
        if self.keep_checkpoints == 0 {
            return Err(AuxTasksError::Config("keep_checkpoints must be > 0".into()));
        }
        Ok(())
    }
}
