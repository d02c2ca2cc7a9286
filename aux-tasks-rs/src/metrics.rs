//! Subspace-recovery diagnostics.
//!
//! Every function here is a pure function of the learned feature matrix and
//! the ground-truth subspace. Linear-algebra failures never escape: a
//! singular system or a non-converging decomposition is reported as a NaN
//! value and training carries on.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::error::{AuxTasksError, Result};
use crate::estimates::MAX_SVD_ITERATIONS;

/// Singular values are rounded to this many decimals before `arccos`, so
/// values a hair above 1 do not produce NaN angles.
const ANGLE_DECIMALS: i32 = 6;

/// Top-`d` left singular vectors of Ψ, ordered by decreasing singular value.
///
/// Computed once before training; the result is the ground truth for every
/// other function in this module. `d` may exceed the number of tasks: the
/// thin basis is then completed to an orthonormal basis of all `S` states,
/// so the extra columns span part of the left null space of Ψ.
///
/// # Errors
///
/// Returns [`AuxTasksError::Numerical`] if the SVD does not converge or `d`
/// exceeds the number of states.
pub fn compute_optimal_subspace(psi: &DMatrix<f64>, d: usize) -> Result<DMatrix<f64>> {
    let num_states = psi.nrows();
    if d > num_states {
        return Err(AuxTasksError::Numerical(format!(
            "target matrix has {num_states} left singular vectors, {d} requested"
        )));
    }
    let svd = psi
        .clone()
        .try_svd(true, false, f64::EPSILON, MAX_SVD_ITERATIONS)
        .ok_or_else(|| {
            AuxTasksError::Numerical("SVD of the target matrix did not converge".into())
        })?;
    let left = svd
        .u
        .ok_or_else(|| AuxTasksError::Numerical("SVD returned no left vectors".into()))?;

    let singular_values = &svd.singular_values;
    let mut order: Vec<usize> = (0..singular_values.len()).collect();
    order.sort_by(|&a, &b| singular_values[b].total_cmp(&singular_values[a]));
    let thin = left.select_columns(order.iter());
    let thin_cols = thin.ncols();
    if d <= thin_cols {
        return Ok(thin.columns(0, d).into_owned());
    }

    // Q of [U | I] starts with ±U; its remaining columns complete the basis.
    let mut stacked = DMatrix::<f64>::zeros(num_states, thin_cols + num_states);
    stacked.columns_mut(0, thin_cols).copy_from(&thin);
    stacked.columns_mut(thin_cols, num_states).fill_with_identity();
    let completion = stacked.qr().q();

    let mut basis = DMatrix::<f64>::zeros(num_states, d);
    basis.columns_mut(0, thin_cols).copy_from(&thin);
    basis
        .columns_mut(thin_cols, d - thin_cols)
        .copy_from(&completion.columns(thin_cols, d - thin_cols));
    Ok(basis)
}

/// Norm of the projection of `y2` onto the column space of `y1`.
///
/// Solves the normal equations `(Y1ᵗY1) w = Y1ᵗY2`; NaN if they are
/// singular. When `y2` is an orthonormal basis the value is the root of the
/// summed squared cosines of the principal angles.
#[must_use]
pub fn compute_cosine_similarity(y1: &DMatrix<f64>, y2: &DMatrix<f64>) -> f64 {
    let gram = y1.transpose() * y1;
    let rhs = y1.transpose() * y2;
    match gram.lu().solve(&rhs) {
        Some(weights) => (y1 * weights).norm(),
        None => f64::NAN,
    }
}

/// `|Y1ᵗY2| / (‖Y1‖ ‖Y2‖)` for single-column matrices.
#[must_use]
pub fn compute_normalized_dot_product(y1: &DMatrix<f64>, y2: &DMatrix<f64>) -> f64 {
    y1.dot(y2).abs() / (y1.norm() * y2.norm())
}

/// Grassmann distance between the column spaces of `y1` and `y2`: the norm
/// of the principal angles.
#[must_use]
pub fn compute_grassman_distance(y1: &DMatrix<f64>, y2: &DMatrix<f64>) -> f64 {
    let q1 = y1.clone().qr().q();
    let q2 = y2.clone().qr().q();
    let overlap = q1.transpose() * q2;

    let Some(svd) = overlap.try_svd(false, false, f64::EPSILON, MAX_SVD_ITERATIONS) else {
        return f64::NAN;
    };
    svd.singular_values
        .iter()
        .map(|&sigma| round_to_decimals(sigma, ANGLE_DECIMALS).acos().powi(2))
        .sum::<f64>()
        .sqrt()
}

fn round_to_decimals(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

/// Subspace distance from the EigenGame paper:
/// `1 − trace(U*U*ᵗ · P_Φ) / d`, with `P_Φ` the projector onto the left
/// singular vectors of Φ.
///
/// NaN if Φ is not finite or its SVD does not converge.
#[must_use]
pub fn eigengame_subspace_distance(phi: &DMatrix<f64>, optimal_subspace: &DMatrix<f64>) -> f64 {
    if phi.iter().any(|v| !v.is_finite()) {
        return f64::NAN;
    }
    let d = phi.ncols();
    let Some(svd) = phi
        .clone()
        .try_svd(true, false, f64::EPSILON, MAX_SVD_ITERATIONS)
    else {
        return f64::NAN;
    };
    let Some(left) = svd.u else {
        return f64::NAN;
    };

    // trace(U Uᵗ Q Qᵗ) = ‖Uᵗ Q‖²_F, without forming the S × S projectors.
    let overlap = optimal_subspace.transpose() * left;
    1.0 - overlap.norm_squared() / d as f64
}

/// Subspace alignment measure; which one applies depends on the feature
/// dimension.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Alignment {
    /// `d > 1`: norm of the principal angles.
    GrassmanDistance(f64),
    /// `d == 1`: absolute normalized dot product.
    DotProduct(f64),
}

impl Alignment {
    /// Metric name in the scalar stream.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Alignment::GrassmanDistance(_) => "grassman_distance",
            Alignment::DotProduct(_) => "dot_product",
        }
    }

    /// Metric value.
    #[must_use]
    pub fn value(&self) -> f64 {
        match *self {
            Alignment::GrassmanDistance(v) | Alignment::DotProduct(v) => v,
        }
    }
}

/// Learning-curve metrics of a feature matrix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SubspaceMetrics {
    /// Norm of the optimal subspace projected onto span(Φ).
    pub cosine_similarity: f64,
    /// `‖Φ‖_F / S`.
    pub feature_norm: f64,
    /// See [`eigengame_subspace_distance`].
    pub eigengame_subspace_distance: f64,
    /// Grassmann distance or dot product, by feature dimension.
    pub alignment: Alignment,
}

/// Compute every subspace metric of Φ against the optimal subspace.
#[must_use]
pub fn compute_metrics(phi: &DMatrix<f64>, optimal_subspace: &DMatrix<f64>) -> SubspaceMetrics {
    let alignment = if phi.ncols() > 1 {
        Alignment::GrassmanDistance(compute_grassman_distance(phi, optimal_subspace))
    } else {
        Alignment::DotProduct(compute_normalized_dot_product(phi, optimal_subspace))
    };

    SubspaceMetrics {
        cosine_similarity: compute_cosine_similarity(phi, optimal_subspace),
        feature_norm: phi.norm() / phi.nrows() as f64,
        eigengame_subspace_distance: eigengame_subspace_distance(phi, optimal_subspace),
        alignment,
    }
}

/// The scalar set emitted for one training step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepMetrics {
    /// Training step.
    pub step: u64,
    /// Subspace diagnostics of the updated Φ.
    pub subspace: SubspaceMetrics,
    /// Frobenius norm of the raw step gradient.
    pub grad_norm: f64,
    /// See [`crate::psi::reconstruction_objective`].
    pub reconstruction_objective: f64,
}

impl StepMetrics {
    /// Flatten into `(name, value)` pairs, in a fixed order.
    #[must_use]
    pub fn scalars(&self) -> [(&'static str, f64); 6] {
        [
            ("cosine_similarity", self.subspace.cosine_similarity),
            ("feature_norm", self.subspace.feature_norm),
            (
                "eigengame_subspace_distance",
                self.subspace.eigengame_subspace_distance,
            ),
            (self.subspace.alignment.name(), self.subspace.alignment.value()),
            ("grad_norm", self.grad_norm),
            ("reconstruction_objective", self.reconstruction_objective),
        ]
    }

    /// Whether any scalar is NaN or infinite.
    #[must_use]
    pub fn has_non_finite(&self) -> bool {
        self.scalars().iter().any(|(_, v)| !v.is_finite())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::{normal_matrix, PrngKey};
    use approx::assert_relative_eq;

    fn orthonormal_basis(y: &DMatrix<f64>) -> DMatrix<f64> {
        y.clone().qr().q()
    }

    #[test]
    fn test_optimal_subspace_orders_by_singular_value() {
        let psi = DMatrix::from_diagonal(&nalgebra::DVector::from_vec(vec![1.0, 5.0, 3.0]));
        let top1 = compute_optimal_subspace(&psi, 1).unwrap();
        assert_relative_eq!(top1[(1, 0)].abs(), 1.0, epsilon = 1e-12);

        let top2 = compute_optimal_subspace(&psi, 2).unwrap();
        assert_relative_eq!(top2[(1, 0)].abs(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(top2[(2, 1)].abs(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(top2.row(0).norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_optimal_subspace_is_orthonormal() {
        let psi = normal_matrix(PrngKey::new(1), 12, 8);
        let u = compute_optimal_subspace(&psi, 3).unwrap();
        assert_eq!(u.shape(), (12, 3));
        assert_relative_eq!(
            u.transpose() * &u,
            DMatrix::<f64>::identity(3, 3),
            epsilon = 1e-10
        );
    }

    #[test]
    fn test_optimal_subspace_rejects_more_columns_than_states() {
        let psi = normal_matrix(PrngKey::new(1), 4, 2);
        assert!(compute_optimal_subspace(&psi, 5).is_err());
    }

    #[test]
    fn test_optimal_subspace_wider_than_task_count() {
        let psi = normal_matrix(PrngKey::new(11), 20, 5);
        let thin = compute_optimal_subspace(&psi, 5).unwrap();

        let full = compute_optimal_subspace(&psi, 8).unwrap();

        assert_eq!(full.shape(), (20, 8));
        assert_relative_eq!(
            full.transpose() * &full,
            DMatrix::identity(8, 8),
            epsilon = 1e-10
        );
        assert_relative_eq!(full.columns(0, 5).into_owned(), thin, epsilon = 1e-12);
        // Extra columns are orthogonal to every column of Ψ.
        assert_relative_eq!(
            full.columns(5, 3).transpose() * &psi,
            DMatrix::zeros(3, 5),
            epsilon = 1e-10
        );
    }

    #[test]
    fn test_optimal_subspace_all_states() {
        let psi = normal_matrix(PrngKey::new(12), 6, 2);
        let full = compute_optimal_subspace(&psi, 6).unwrap();
        assert_relative_eq!(
            full.transpose() * &full,
            DMatrix::identity(6, 6),
            epsilon = 1e-10
        );
    }

    #[test]
    fn test_self_subspace_metrics() {
        let phi = normal_matrix(PrngKey::new(2), 10, 3);
        let basis = orthonormal_basis(&phi);

        assert_relative_eq!(
            eigengame_subspace_distance(&phi, &basis),
            0.0,
            epsilon = 1e-10
        );
        assert_relative_eq!(
            compute_cosine_similarity(&phi, &phi),
            phi.norm(),
            epsilon = 1e-10
        );
        assert_relative_eq!(
            compute_cosine_similarity(&phi, &basis),
            3f64.sqrt(),
            epsilon = 1e-10
        );
    }

    #[test]
    fn test_orthogonal_subspace_distance_is_one() {
        let mut phi = DMatrix::<f64>::zeros(4, 1);
        phi[(0, 0)] = 2.0;
        let mut optimal = DMatrix::<f64>::zeros(4, 1);
        optimal[(3, 0)] = 1.0;

        assert_relative_eq!(eigengame_subspace_distance(&phi, &optimal), 1.0);
        assert_relative_eq!(compute_normalized_dot_product(&phi, &optimal), 0.0);
        assert_relative_eq!(compute_cosine_similarity(&phi, &optimal), 0.0);
    }

    #[test]
    fn test_grassman_identical_subspaces() {
        let y = normal_matrix(PrngKey::new(3), 8, 3);
        assert_eq!(compute_grassman_distance(&y, &y), 0.0);

        // Same span, different basis.
        let mixing = DMatrix::from_row_slice(3, 3, &[2.0, 1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 3.0]);
        assert_eq!(compute_grassman_distance(&y, &(&y * mixing)), 0.0);
    }

    #[test]
    fn test_grassman_is_symmetric() {
        let y1 = normal_matrix(PrngKey::new(4), 9, 2);
        let y2 = normal_matrix(PrngKey::new(5), 9, 2);
        let forward = compute_grassman_distance(&y1, &y2);
        let backward = compute_grassman_distance(&y2, &y1);
        assert!(forward > 0.0);
        assert_relative_eq!(forward, backward, epsilon = 1e-9);
    }

    #[test]
    fn test_grassman_orthogonal_planes() {
        let mut y1 = DMatrix::<f64>::zeros(4, 2);
        y1[(0, 0)] = 1.0;
        y1[(1, 1)] = 1.0;
        let mut y2 = DMatrix::<f64>::zeros(4, 2);
        y2[(2, 0)] = 1.0;
        y2[(3, 1)] = 1.0;
        let half_pi = std::f64::consts::FRAC_PI_2;
        assert_relative_eq!(
            compute_grassman_distance(&y1, &y2),
            (2.0 * half_pi * half_pi).sqrt(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_singular_phi_gives_nan_cosine() {
        let phi = DMatrix::<f64>::zeros(5, 2);
        let optimal = normal_matrix(PrngKey::new(6), 5, 2);
        assert!(compute_cosine_similarity(&phi, &optimal).is_nan());
    }

    #[test]
    fn test_non_finite_phi_gives_nan_eigengame() {
        let mut phi = normal_matrix(PrngKey::new(7), 5, 2);
        phi[(2, 1)] = f64::INFINITY;
        let optimal = normal_matrix(PrngKey::new(8), 5, 2);
        assert!(eigengame_subspace_distance(&phi, &optimal).is_nan());
    }

    #[test]
    fn test_compute_metrics_alignment_by_dimension() {
        let psi = normal_matrix(PrngKey::new(9), 10, 10);

        let phi1 = normal_matrix(PrngKey::new(10), 10, 1);
        let metrics = compute_metrics(&phi1, &compute_optimal_subspace(&psi, 1).unwrap());
        assert!(matches!(metrics.alignment, Alignment::DotProduct(_)));
        assert_relative_eq!(metrics.feature_norm, phi1.norm() / 10.0);

        let phi3 = normal_matrix(PrngKey::new(11), 10, 3);
        let metrics = compute_metrics(&phi3, &compute_optimal_subspace(&psi, 3).unwrap());
        assert!(matches!(metrics.alignment, Alignment::GrassmanDistance(_)));
    }

    #[test]
    fn test_step_metrics_scalars() {
        let metrics = StepMetrics {
            step: 3,
            subspace: SubspaceMetrics {
                cosine_similarity: 0.5,
                feature_norm: 0.1,
                eigengame_subspace_distance: 0.75,
                alignment: Alignment::DotProduct(0.5),
            },
            grad_norm: 2.0,
            reconstruction_objective: f64::NAN,
        };
        let names: Vec<_> = metrics.scalars().iter().map(|(n, _)| *n).collect();
        assert_eq!(
            names,
            [
                "cosine_similarity",
                "feature_norm",
                "eigengame_subspace_distance",
                "dot_product",
                "grad_norm",
                "reconstruction_objective"
            ]
        );
        assert!(metrics.has_non_finite());
    }
}
