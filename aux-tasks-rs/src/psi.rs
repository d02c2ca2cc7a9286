//! Synthetic problem generation: the target matrix Ψ, the initial features,
//! spectrum rescaling, and the reconstruction objective.

use nalgebra::{DMatrix, DVector};

use crate::config::{RescalePsi, SyntheticConfig};
use crate::error::{AuxTasksError, Result};
use crate::estimates::{pseudo_inverse, MAX_SVD_ITERATIONS};
use crate::rng::{normal_matrix, PrngKey};

/// Ψ, the initial Φ, and the key left for training.
#[derive(Debug, Clone)]
pub struct SyntheticProblem {
    /// Target matrix, `S × T`.
    pub psi: DMatrix<f64>,
    /// Initial feature matrix, `S × d`.
    pub phi: DMatrix<f64>,
    /// Key handed to the training loop.
    pub key: PrngKey,
}

impl SyntheticProblem {
    /// Draw a problem from the seed in `config`.
    ///
    /// The root key is split three ways: one key for training, one for Ψ and
    /// one for Φ. Ψ is then rescaled according to `config.rescale_psi`.
    ///
    /// # Errors
    ///
    /// Returns an error if rescaling fails.
    pub fn generate(config: &SyntheticConfig) -> Result<Self> {
        let (key, psi_key, phi_key) = PrngKey::new(config.seed).split3();
        let psi = normal_matrix(psi_key, config.num_states, config.num_tasks);
        let psi = rescale(&psi, config.rescale_psi)?;
        let phi = normal_matrix(phi_key, config.num_states, config.feature_dim);
        Ok(Self { psi, phi, key })
    }
}

/// Apply a spectrum rewrite to Ψ.
///
/// # Errors
///
/// Returns [`AuxTasksError::Numerical`] if the SVD of Ψ does not converge.
pub fn rescale(psi: &DMatrix<f64>, mode: RescalePsi) -> Result<DMatrix<f64>> {
    match mode {
        RescalePsi::None => Ok(psi.clone()),
        RescalePsi::Linear => generate_psi_linear(psi),
        RescalePsi::Exp => generate_psi_exp(psi),
    }
}

/// Keep the singular vectors of Ψ; replace the `k`-th largest of its `r`
/// singular values by `(r − k) / r`.
///
/// # Errors
///
/// Returns [`AuxTasksError::Numerical`] if the SVD of Ψ does not converge.
pub fn generate_psi_linear(psi: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    with_spectrum(psi, |rank, k| (rank - k) as f64 / rank as f64)
}

/// Keep the singular vectors of Ψ; replace the `k`-th largest singular value
/// by `e^{-k}`.
///
/// # Errors
///
/// Returns [`AuxTasksError::Numerical`] if the SVD of Ψ does not converge.
pub fn generate_psi_exp(psi: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    with_spectrum(psi, |_, k| (-(k as f64)).exp())
}

fn with_spectrum(
    psi: &DMatrix<f64>,
    spectrum: impl Fn(usize, usize) -> f64,
) -> Result<DMatrix<f64>> {
    let svd = psi
        .clone()
        .try_svd(true, true, f64::EPSILON, MAX_SVD_ITERATIONS)
        .ok_or_else(|| AuxTasksError::Numerical("SVD of Ψ did not converge".into()))?;
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Err(AuxTasksError::Numerical(
            "SVD of Ψ returned no singular vectors".into(),
        ));
    };

    let rank = svd.singular_values.len();
    let mut order: Vec<usize> = (0..rank).collect();
    order.sort_by(|&a, &b| svd.singular_values[b].total_cmp(&svd.singular_values[a]));

    let mut values = DVector::<f64>::zeros(rank);
    for (k, &index) in order.iter().enumerate() {
        values[index] = spectrum(rank, k);
    }

    Ok(u * DMatrix::from_diagonal(&values) * v_t)
}

/// Mean squared residual of the best linear reconstruction of Ψ from Φ:
/// `‖Φ Φ⁺ Ψ − Ψ‖²_F / (S · T)`.
///
/// NaN if the pseudo-inverse of Φ cannot be computed.
#[must_use]
pub fn reconstruction_objective(phi: &DMatrix<f64>, psi: &DMatrix<f64>) -> f64 {
    let Some(phi_pinv) = pseudo_inverse(phi) else {
        return f64::NAN;
    };
    let weights = phi_pinv * psi;
    let residual = phi * weights - psi;
    residual.norm_squared() / psi.len() as f64
}
