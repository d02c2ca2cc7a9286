//! Estimators of the inverse feature covariance `(ΦᵗΦ / S)⁻¹`.
//!
//! | Estimator | Samples | Randomness | Bias |
//! |---|---|---|---|
//! | [`oracle_inverse_covariance`] | all states | none | exact |
//! | [`naive_inverse_covariance`] | `J` states | one draw | biased for finite `J` |
//! | [`lissa_inverse_covariance`] | `J` states | one draw | unbiased as `J → ∞` |
//!
//! "naive++" is not a separate estimator: the training step calls
//! [`naive_inverse_covariance`] twice with independently advanced keys.
//!
//! None of these report failure. A singular sample covariance yields a
//! NaN-filled estimate which then flows into the feature matrix.

use nalgebra::DMatrix;

use crate::rng::{draw_states, PrngKey};

/// Relative cutoff for singular values treated as zero by the pseudo-inverse.
const PINV_RCOND: f64 = 1e-15;

/// Iteration cap for SVDs; a non-converging decomposition means non-finite
/// input.
pub(crate) const MAX_SVD_ITERATIONS: usize = 10_000;

/// Largest Euclidean norm among the rows of `features`.
///
/// NaN rows propagate: once a NaN norm is seen the result is NaN.
#[must_use]
pub fn max_feature_norm(features: &DMatrix<f64>) -> f64 {
    features.row_iter().map(|row| row.norm()).fold(0.0, |max, norm| {
        if norm.is_nan() || norm > max {
            norm
        } else {
            max
        }
    })
}

/// Moore-Penrose pseudo-inverse, `None` if the SVD does not converge.
pub(crate) fn pseudo_inverse(matrix: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    let svd = matrix
        .clone()
        .try_svd(true, true, f64::EPSILON, MAX_SVD_ITERATIONS)?;
    let cutoff = PINV_RCOND * svd.singular_values.max();
    svd.pseudo_inverse(cutoff).ok()
}

fn nan_matrix(dim: usize) -> DMatrix<f64> {
    DMatrix::from_element(dim, dim, f64::NAN)
}

/// Exact inverse covariance: `pinv(ΦᵗΦ) · S`.
///
/// Uses every state and consumes no randomness.
#[must_use]
pub fn oracle_inverse_covariance(phi: &DMatrix<f64>) -> DMatrix<f64> {
    let gram = phi.transpose() * phi;
    match pseudo_inverse(&gram) {
        Some(inverse) => inverse * phi.nrows() as f64,
        None => nan_matrix(phi.ncols()),
    }
}

/// Invert the empirical covariance of `num_samples` sampled rows of Φ.
///
/// Averaging then inverting is not unbiased, but the estimate is consistent
/// as `num_samples` grows.
#[must_use]
pub fn naive_inverse_covariance(
    phi: &DMatrix<f64>,
    key: PrngKey,
    num_samples: usize,
) -> (DMatrix<f64>, PrngKey) {
    let (states, key) = draw_states(phi.nrows(), num_samples, key);
    let features = phi.select_rows(states.iter());
    let covariance = features.transpose() * &features / num_samples as f64;
    let estimate = covariance
        .try_inverse()
        .unwrap_or_else(|| nan_matrix(phi.ncols()));
    (estimate, key)
}

/// LISSA estimate of the inverse covariance.
///
/// With `η = κ / n²`, where `n` is `feature_norm` or, if `None`, the max row
/// norm of Φ, the recursion over `num_samples` sampled rows is
///
/// ```text
/// X₀ = I
/// Xⱼ = I + (I − η φⱼ φⱼᵗ) Xⱼ₋₁
/// ```
///
/// and the estimate is `η X_J`. Each update is rank one; no matrix is ever
/// inverted. `κ < 1` keeps `I − η φφᵗ` a contraction as long as `n` bounds
/// the sampled norms.
#[must_use]
pub fn lissa_inverse_covariance(
    phi: &DMatrix<f64>,
    key: PrngKey,
    num_samples: usize,
    kappa: f64,
    feature_norm: Option<f64>,
) -> (DMatrix<f64>, PrngKey) {
    let d = phi.ncols();
    let feature_norm = feature_norm.unwrap_or_else(|| max_feature_norm(phi));
    let step_size = kappa / (feature_norm * feature_norm);

    let (states, key) = draw_states(phi.nrows(), num_samples, key);

    let identity = DMatrix::<f64>::identity(d, d);
    let mut estimate = identity.clone();
    for &state in &states {
        let feature = phi.row(state);
        let projected = &feature * &estimate;
        estimate = &identity + &estimate - feature.transpose() * projected * step_size;
    }

    (estimate * step_size, key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Rows chosen so that `ΦᵗΦ = 3 I`.
    fn well_conditioned_phi() -> DMatrix<f64> {
        DMatrix::from_row_slice(4, 2, &[1.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0, -1.0])
    }

    fn relative_error(estimate: &DMatrix<f64>, truth: &DMatrix<f64>) -> f64 {
        (estimate - truth).norm() / truth.norm()
    }

    #[test]
    fn test_max_feature_norm() {
        let features = DMatrix::from_row_slice(3, 2, &[3.0, 4.0, 1.0, 0.0, 0.0, -6.0]);
        assert_relative_eq!(max_feature_norm(&features), 6.0);
    }

    #[test]
    fn test_max_feature_norm_propagates_nan() {
        let features = DMatrix::from_row_slice(3, 1, &[1.0, f64::NAN, 2.0]);
        assert!(max_feature_norm(&features).is_nan());
    }

    #[test]
    fn test_oracle_is_scaled_gram_inverse() {
        let phi = well_conditioned_phi();
        let oracle = oracle_inverse_covariance(&phi);
        assert_relative_eq!(
            oracle,
            DMatrix::identity(2, 2) * (4.0 / 3.0),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_oracle_handles_rank_deficiency() {
        // Second feature is a copy of the first: pinv stays finite.
        let phi = DMatrix::from_row_slice(3, 2, &[1.0, 1.0, 2.0, 2.0, -1.0, -1.0]);
        let oracle = oracle_inverse_covariance(&phi);
        assert!(oracle.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_naive_advances_key_and_is_reproducible() {
        let phi = well_conditioned_phi();
        let key = PrngKey::new(9);
        let (a, key_a) = naive_inverse_covariance(&phi, key, 16);
        let (b, key_b) = naive_inverse_covariance(&phi, key, 16);
        assert_eq!(a, b);
        assert_eq!(key_a, key_b);
        assert_ne!(key_a, key);
    }

    #[test]
    fn test_naive_is_consistent() {
        let phi = well_conditioned_phi();
        let truth = oracle_inverse_covariance(&phi);
        let (estimate, _) = naive_inverse_covariance(&phi, PrngKey::new(21), 20_000);
        assert!(relative_error(&estimate, &truth) < 0.1);
    }

    #[test]
    fn test_naive_singular_sample_is_nan() {
        // The second feature is identically zero, so every sample Gram
        // matrix is singular.
        let phi = DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 2.0, 0.0, 3.0, 0.0]);
        let (estimate, _) = naive_inverse_covariance(&phi, PrngKey::new(2), 8);
        assert!(estimate.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn test_lissa_scalar_closed_form() {
        // One state with feature 2: η = κ/4 and the recursion is a
        // geometric series in (1 − κ).
        let phi = DMatrix::from_element(1, 1, 2.0);
        let kappa = 0.5;
        let num_samples = 10;
        let (estimate, _) =
            lissa_inverse_covariance(&phi, PrngKey::new(0), num_samples, kappa, None);
        let expected = (1.0 - (1.0 - kappa).powi(num_samples as i32 + 1)) / 4.0;
        assert_relative_eq!(estimate[(0, 0)], expected, epsilon = 1e-15);
    }

    #[test]
    fn test_lissa_uses_supplied_norm() {
        let phi = DMatrix::from_element(1, 1, 2.0);
        let (with_true_norm, _) =
            lissa_inverse_covariance(&phi, PrngKey::new(0), 5, 0.5, Some(2.0));
        let (default_norm, _) = lissa_inverse_covariance(&phi, PrngKey::new(0), 5, 0.5, None);
        let (larger_norm, _) = lissa_inverse_covariance(&phi, PrngKey::new(0), 5, 0.5, Some(4.0));
        assert_eq!(with_true_norm, default_norm);
        assert_ne!(with_true_norm, larger_norm);
    }

    #[test]
    fn test_lissa_is_unbiased_in_the_limit() {
        let phi = well_conditioned_phi();
        let truth = oracle_inverse_covariance(&phi);

        let mut key = PrngKey::new(1234);
        let mut mean = DMatrix::<f64>::zeros(2, 2);
        let trials = 400;
        for _ in 0..trials {
            let (estimate, next) = lissa_inverse_covariance(&phi, key, 200, 0.5, None);
            mean += estimate / f64::from(trials);
            key = next;
        }
        assert!(relative_error(&mean, &truth) < 0.1);
    }
}
