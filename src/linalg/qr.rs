use std::collections::BTreeMap;

use faer::linalg::solvers::SolveLstsqCore;
use faer::sparse::linalg::solvers;
use faer::sparse::{SparseColMat, Triplet};
use faer::{Conj, Mat};
use nalgebra::DVector;

use super::{LinAlgError, LinAlgResult, SparseLinearSolver, check_finite, from_faer};
use crate::core::linear::LinearSystem;

/// Sparse QR least squares directly on the whitened Jacobian.
///
/// Damping is applied by stacking `√λ I` under `J` with zero right-hand side,
/// so the normal equations are never formed.
#[derive(Debug, Clone, Default)]
pub struct SparseQRSolver;

impl SparseQRSolver {
    pub fn new() -> Self {
        Self
    }

    fn solve_least_squares(&self, system: &LinearSystem, lambda: f64) -> LinAlgResult<DVector<f64>> {
        let n = system.cols();
        let m = system.rows();
        let extra = if lambda > 0.0 { n } else { 0 };
        if m + extra < n {
            return Err(LinAlgError::FactorizationFailed(format!(
                "underdetermined system: {m} rows for {n} unknowns"
            )));
        }

        let mut entries: BTreeMap<(usize, usize), f64> = BTreeMap::new();
        for (row, col, value) in system.jacobian_triplets() {
            *entries.entry((row, col)).or_insert(0.0) += value;
        }
        let sqrt_lambda = lambda.max(0.0).sqrt();
        for i in 0..extra {
            entries.insert((m + i, i), sqrt_lambda);
        }

        let triplets: Vec<Triplet<usize, usize, f64>> = entries
            .iter()
            .map(|(&(row, col), &value)| Triplet::new(row, col, value))
            .collect();
        let jacobian = SparseColMat::<usize, f64>::try_new_from_triplets(m + extra, n, &triplets)
            .map_err(|e| LinAlgError::InvalidStructure(format!("{e:?}")))?;

        let rhs_values = system.stacked_rhs();
        let mut rhs = Mat::<f64>::zeros(m + extra, 1);
        for i in 0..m {
            rhs[(i, 0)] = rhs_values[i];
        }

        let symbolic = solvers::SymbolicQr::try_new(jacobian.symbolic())
            .map_err(|e| LinAlgError::FactorizationFailed(format!("{e:?}")))?;
        let qr = solvers::Qr::try_new_with_symbolic(symbolic, jacobian.as_ref())
            .map_err(|e| LinAlgError::FactorizationFailed(format!("{e:?}")))?;
        qr.solve_lstsq_in_place_with_conj(Conj::No, rhs.as_mut());
        check_finite(from_faer(&rhs, n))
    }
}

impl SparseLinearSolver for SparseQRSolver {
    fn solve_normal_equation(&mut self, system: &LinearSystem) -> LinAlgResult<DVector<f64>> {
        self.solve_least_squares(system, 0.0)
    }

    fn solve_augmented_equation(
        &mut self,
        system: &LinearSystem,
        lambda: f64,
    ) -> LinAlgResult<DVector<f64>> {
        self.solve_least_squares(system, lambda)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::linear::{JacobianFactor, Ordering};
    use crate::core::variable::Key;
    use nalgebra::{DMatrix, dvector};

    #[test]
    fn test_underdetermined_system_fails() {
        let factors = vec![
            JacobianFactor::new(vec![Key::conf(0)], vec![DMatrix::identity(1, 2)], dvector![1.0])
                .unwrap(),
        ];
        let system = LinearSystem::new(factors, Ordering::new([(Key::conf(0), 2)]));
        assert!(SparseQRSolver::new().solve_normal_equation(&system).is_err());
        let step = SparseQRSolver::new()
            .solve_augmented_equation(&system, 1.0)
            .unwrap();
        assert!((step - dvector![0.5, 0.0]).norm() < 1e-12);
    }

    #[test]
    fn test_overdetermined_system_matches_normal_equations() {
        let factors = vec![
            JacobianFactor::new(vec![Key::conf(0)], vec![DMatrix::identity(2, 2)], dvector![1.0, 2.0])
                .unwrap(),
            JacobianFactor::new(
                vec![Key::conf(0)],
                vec![DMatrix::from_row_slice(1, 2, &[1.0, 1.0])],
                dvector![0.0],
            )
            .unwrap(),
        ];
        let system = LinearSystem::new(factors, Ordering::new([(Key::conf(0), 2)]));
        let step = SparseQRSolver::new().solve_normal_equation(&system).unwrap();

        // JᵀJ = [[2, 1], [1, 2]], Jᵀb = [1, 2]
        let expected = dvector![0.0, 1.0];
        assert!((step - expected).norm() < 1e-10);
    }
}
