//! One stochastic training step.
//!
//! [`train_step`] is a pure transition: it consumes the previous
//! [`StepState`] and returns the next one together with the raw gradient.
//! All randomness comes from the key carried in the state.
//!
//! # Double sampling
//!
//! The gradient multiplies a residual computed with `weight_1` by
//! `weight_2`. When both weights come from the same noisy estimate the
//! product is biased, so `naive++` and `lissa` draw two independent
//! covariance estimates and two independent sets of weight states. `naive`
//! deliberately shares one estimate and one draw, and `oracle` has no noise
//! to begin with.

use nalgebra::{DMatrix, DVector};

use crate::config::{Method, SyntheticConfig};
use crate::estimates::{
    lissa_inverse_covariance, max_feature_norm, naive_inverse_covariance,
    oracle_inverse_covariance,
};
use crate::rng::{draw_states, PrngKey};

/// Rate of the running max-feature-norm average.
pub const FEATURE_NORM_RATE: f64 = 0.01;

/// Hyper-parameters of a step; fixed for the whole run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepParams {
    /// SGD step size.
    pub learning_rate: f64,
    /// Weight-vector method.
    pub method: Method,
    /// LISSA damping.
    pub kappa: f64,
    /// States per covariance estimate (`J`).
    pub covariance_batch_size: usize,
    /// Source states updated per step.
    pub main_batch_size: usize,
    /// States per weight vector.
    pub weight_batch_size: usize,
    /// Maintain the running max-feature-norm estimate (LISSA only).
    pub estimate_feature_norm: bool,
}

impl From<&SyntheticConfig> for StepParams {
    fn from(config: &SyntheticConfig) -> Self {
        Self {
            learning_rate: config.learning_rate,
            method: config.method,
            kappa: config.kappa,
            covariance_batch_size: config.covariance_batch_size,
            main_batch_size: config.main_batch_size,
            weight_batch_size: config.weight_batch_size,
            estimate_feature_norm: config.estimate_feature_norm,
        }
    }
}

/// Variables threaded from one step to the next.
#[derive(Debug, Clone, PartialEq)]
pub struct StepState {
    /// Feature matrix Φ, `S × d`.
    pub phi: DMatrix<f64>,
    /// Weight matrix of the explicit method, `d × T`.
    pub explicit_weights: DMatrix<f64>,
    /// Running estimate of the max feature norm; `None` when disabled.
    pub estimated_feature_norm: Option<f64>,
    /// Generator state for the next draw.
    pub key: PrngKey,
}

/// Result of [`train_step`].
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// State for the next step.
    pub state: StepState,
    /// Raw gradient applied to the sampled rows, `main_batch_size × d`.
    /// Only used for diagnostics.
    pub gradient: DMatrix<f64>,
}

/// The two weight vectors of a step.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightPair {
    /// Used to compute the residual.
    pub first: DVector<f64>,
    /// Broadcast across the batch to form the gradient.
    pub second: DVector<f64>,
}

impl WeightPair {
    fn shared(weight: DVector<f64>) -> Self {
        Self {
            first: weight.clone(),
            second: weight,
        }
    }
}

/// Monte-Carlo estimate of the least-squares weights of task `task`:
/// `C · Φ[states]ᵗ · Ψ[states, task] / |states|`.
fn weight_estimate(
    covariance: &DMatrix<f64>,
    phi: &DMatrix<f64>,
    psi: &DMatrix<f64>,
    weight_states: &[usize],
    task: usize,
) -> DVector<f64> {
    let features = phi.select_rows(weight_states.iter());
    let targets = DVector::from_iterator(
        weight_states.len(),
        weight_states.iter().map(|&state| psi[(state, task)]),
    );
    covariance * features.transpose() * targets / weight_states.len() as f64
}

/// Compute the two weight vectors for `task`, dispatched on the method.
///
/// `feature_norm` is the prior handed to LISSA; `None` makes LISSA use the
/// true max row norm of Φ.
#[must_use]
pub fn solve_weights(
    params: &StepParams,
    phi: &DMatrix<f64>,
    psi: &DMatrix<f64>,
    explicit_weights: &DMatrix<f64>,
    task: usize,
    feature_norm: Option<f64>,
    key: PrngKey,
) -> (WeightPair, PrngKey) {
    let num_states = phi.nrows();
    let j = params.covariance_batch_size;

    match params.method {
        Method::Explicit => {
            let weight = explicit_weights.column(task).into_owned();
            (WeightPair::shared(weight), key)
        }
        Method::Oracle => {
            let covariance = oracle_inverse_covariance(phi);
            let all_states: Vec<usize> = (0..num_states).collect();
            let weight = weight_estimate(&covariance, phi, psi, &all_states, task);
            (WeightPair::shared(weight), key)
        }
        Method::Naive => {
            let (covariance, key) = naive_inverse_covariance(phi, key, j);
            let (weight_states, key) = draw_states(num_states, params.weight_batch_size, key);
            let weight = weight_estimate(&covariance, phi, psi, &weight_states, task);
            (WeightPair::shared(weight), key)
        }
        Method::NaivePlusPlus => {
            let (covariance_1, key) = naive_inverse_covariance(phi, key, j);
            let (covariance_2, key) = naive_inverse_covariance(phi, key, j);
            let (weight_states_1, key) = draw_states(num_states, params.weight_batch_size, key);
            let (weight_states_2, key) = draw_states(num_states, params.weight_batch_size, key);
            let pair = WeightPair {
                first: weight_estimate(&covariance_1, phi, psi, &weight_states_1, task),
                second: weight_estimate(&covariance_2, phi, psi, &weight_states_2, task),
            };
            (pair, key)
        }
        Method::Lissa => {
            let (covariance_1, key) =
                lissa_inverse_covariance(phi, key, j, params.kappa, feature_norm);
            let (covariance_2, key) =
                lissa_inverse_covariance(phi, key, j, params.kappa, feature_norm);
            // Two separate weight-state draws; sharing them would correlate
            // the weights again.
            let (weight_states_1, key) = draw_states(num_states, params.weight_batch_size, key);
            let (weight_states_2, key) = draw_states(num_states, params.weight_batch_size, key);
            let pair = WeightPair {
                first: weight_estimate(&covariance_1, phi, psi, &weight_states_1, task),
                second: weight_estimate(&covariance_2, phi, psi, &weight_states_2, task),
            };
            (pair, key)
        }
    }
}

/// Perform one SGD step on Φ.
///
/// 1. Draw `main_batch_size` source states and exactly one task.
/// 2. For LISSA with norm estimation, move the running max-norm estimate
///    towards the max norm of the sampled rows, before any weights are
///    solved.
/// 3. Solve the two weight vectors ([`solve_weights`]).
/// 4. Residual per source state: `Φ[s] · weight_1 − Ψ[s, task]`.
/// 5. Gradient row for each source state: its residual times `weight_2`.
/// 6. `Φ[sources] −= lr · gradient`. New rows are computed from the rows as
///    they were before the step; a state drawn twice gets the last write.
/// 7. Explicit method only: `W[:, task] −= lr · Φ[sources]ᵗ · residual`,
///    using the updated rows.
///
/// Rows of Φ and columns of `W` that were not sampled are left untouched.
/// Nothing is checked: a singular covariance estimate puts NaN into Φ and
/// it stays there.
#[must_use]
pub fn train_step(params: &StepParams, psi: &DMatrix<f64>, state: StepState) -> StepOutput {
    let StepState {
        mut phi,
        mut explicit_weights,
        mut estimated_feature_norm,
        key,
    } = state;
    let (num_states, d) = phi.shape();
    let num_tasks = psi.ncols();
    let batch = params.main_batch_size;

    let (source_states, key) = draw_states(num_states, batch, key);
    let (tasks, key) = draw_states(num_tasks, 1, key);
    let task = tasks[0];

    let source_features = phi.select_rows(source_states.iter());

    if params.method == Method::Lissa && params.estimate_feature_norm {
        let max_norm = max_feature_norm(&source_features);
        estimated_feature_norm =
            estimated_feature_norm.map(|norm| norm + FEATURE_NORM_RATE * (max_norm - norm));
    }

    let prior_norm = if params.estimate_feature_norm {
        estimated_feature_norm
    } else {
        None
    };
    let (weights, key) = solve_weights(
        params,
        &phi,
        psi,
        &explicit_weights,
        task,
        prior_norm,
        key,
    );

    let targets = DVector::from_iterator(
        batch,
        source_states.iter().map(|&state| psi[(state, task)]),
    );
    let estimated_error = &source_features * &weights.first - targets;

    // Same weight vector for the whole batch, scaled by each row's error.
    let gradient = DMatrix::from_fn(batch, d, |row, col| {
        estimated_error[row] * weights.second[col]
    });

    let updated = &source_features - &gradient * params.learning_rate;
    for (row, &state) in source_states.iter().enumerate() {
        phi.row_mut(state).copy_from(&updated.row(row));
    }

    if params.method == Method::Explicit {
        let updated_features = phi.select_rows(source_states.iter());
        let weight_gradient = updated_features.transpose() * &estimated_error;
        let mut column = explicit_weights.column_mut(task);
        column -= weight_gradient * params.learning_rate;
    }

    StepOutput {
        state: StepState {
            phi,
            explicit_weights,
            estimated_feature_norm,
            key,
        },
        gradient,
    }
}
