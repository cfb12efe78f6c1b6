//! Sparse linear solvers for the Gauss-Newton subproblem.
//!
//! Each solver takes the linearized [`LinearSystem`] `‖J h − b‖²` and returns
//! the step `h` solving `(JᵀJ + λI) h = Jᵀb` (λ = 0 for the plain normal
//! equations). Factorizations are done with faer; conversions to and from
//! nalgebra vectors happen at this boundary.

use nalgebra::DVector;
use thiserror::Error;

use crate::core::linear::LinearSystem;

pub mod cholesky;
pub mod qr;

pub use cholesky::SparseCholeskySolver;
pub use qr::SparseQRSolver;

/// Errors raised by the linear solvers
#[derive(Debug, Clone, Error)]
pub enum LinAlgError {
    /// Numerical factorization failed (matrix singular or indefinite)
    #[error("Factorization failed: {0}")]
    FactorizationFailed(String),

    /// Matrix could not be assembled
    #[error("Invalid matrix structure: {0}")]
    InvalidStructure(String),
}

pub type LinAlgResult<T> = Result<T, LinAlgError>;

/// Which sparse factorization solves the linear subproblem
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinearSolverType {
    /// Cholesky on the normal equations `JᵀJ`
    #[default]
    SparseCholesky,
    /// QR on the stacked Jacobian
    SparseQR,
}

/// Common interface of the sparse solvers
pub trait SparseLinearSolver: Send {
    /// Solve `JᵀJ h = Jᵀb`
    fn solve_normal_equation(&mut self, system: &LinearSystem) -> LinAlgResult<DVector<f64>>;

    /// Solve the damped system `(JᵀJ + λI) h = Jᵀb`
    fn solve_augmented_equation(
        &mut self,
        system: &LinearSystem,
        lambda: f64,
    ) -> LinAlgResult<DVector<f64>>;
}

/// Instantiate the solver selected by `solver_type`
pub fn create_linear_solver(solver_type: LinearSolverType) -> Box<dyn SparseLinearSolver> {
    match solver_type {
        LinearSolverType::SparseCholesky => Box::new(SparseCholeskySolver::new()),
        LinearSolverType::SparseQR => Box::new(SparseQRSolver::new()),
    }
}

/// Reject solutions polluted by near-singular pivots
pub(crate) fn check_finite(step: DVector<f64>) -> LinAlgResult<DVector<f64>> {
    if step.iter().all(|v| v.is_finite()) {
        Ok(step)
    } else {
        Err(LinAlgError::FactorizationFailed(
            "solution contains non-finite entries".to_string(),
        ))
    }
}

pub(crate) fn to_faer(vector: &DVector<f64>) -> faer::Mat<f64> {
    faer::Mat::from_fn(vector.len(), 1, |i, _| vector[i])
}

pub(crate) fn from_faer(matrix: &faer::Mat<f64>, rows: usize) -> DVector<f64> {
    DVector::from_fn(rows, |i, _| matrix[(i, 0)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::linear::{JacobianFactor, Ordering};
    use crate::core::variable::Key;
    use nalgebra::{DMatrix, dmatrix, dvector};

    /// Overdetermined system over two 2-dimensional keys
    pub(crate) fn sample_system() -> LinearSystem {
        let factors = vec![
            JacobianFactor::new(
                vec![Key::conf(0)],
                vec![dmatrix![2.0, 0.0; 0.0, 1.0]],
                dvector![1.0, -1.0],
            )
            .unwrap(),
            JacobianFactor::new(
                vec![Key::conf(0), Key::conf(1)],
                vec![dmatrix![-1.0, 0.5; 0.0, -1.0], dmatrix![1.0, 0.0; 0.3, 1.0]],
                dvector![0.5, 0.2],
            )
            .unwrap(),
            JacobianFactor::new(
                vec![Key::conf(1)],
                vec![dmatrix![1.0, 1.0; 0.0, 3.0]],
                dvector![0.1, 0.4],
            )
            .unwrap(),
        ];
        let ordering = Ordering::new([(Key::conf(0), 2), (Key::conf(1), 2)]);
        LinearSystem::new(factors, ordering)
    }

    /// Dense reference solution of `(JᵀJ + λI) h = Jᵀb`
    pub(crate) fn dense_solution(system: &LinearSystem, lambda: f64) -> DVector<f64> {
        let mut j = DMatrix::zeros(system.rows(), system.cols());
        for (r, c, v) in system.jacobian_triplets() {
            j[(r, c)] += v;
        }
        let n = system.cols();
        let h = j.transpose() * &j + DMatrix::identity(n, n) * lambda;
        let g = j.transpose() * system.stacked_rhs();
        h.cholesky().unwrap().solve(&g)
    }

    #[test]
    fn test_solvers_agree_with_dense_reference() {
        let system = sample_system();
        for solver_type in [LinearSolverType::SparseCholesky, LinearSolverType::SparseQR] {
            let mut solver = create_linear_solver(solver_type);
            let step = solver.solve_normal_equation(&system).unwrap();
            assert!((step - dense_solution(&system, 0.0)).norm() < 1e-9, "{solver_type:?}");

            let damped = solver.solve_augmented_equation(&system, 0.7).unwrap();
            assert!((damped - dense_solution(&system, 0.7)).norm() < 1e-9, "{solver_type:?}");
        }
    }

    #[test]
    fn test_rank_deficient_system_fails() {
        // conf(1) never appears with a non-zero block
        let factors = vec![
            JacobianFactor::new(
                vec![Key::conf(0), Key::conf(1)],
                vec![DMatrix::identity(2, 2), DMatrix::zeros(2, 2)],
                dvector![1.0, 1.0],
            )
            .unwrap(),
        ];
        let ordering = Ordering::new([(Key::conf(0), 2), (Key::conf(1), 2)]);
        let system = LinearSystem::new(factors, ordering);

        let mut solver = SparseCholeskySolver::new();
        assert!(matches!(
            solver.solve_normal_equation(&system),
            Err(LinAlgError::FactorizationFailed(_))
        ));
        // Damping makes it solvable.
        let step = solver.solve_augmented_equation(&system, 1.0).unwrap();
        assert!((step - dvector![0.5, 0.5, 0.0, 0.0]).norm() < 1e-12);
    }

    #[test]
    fn test_default_solver_type() {
        assert_eq!(LinearSolverType::default(), LinearSolverType::SparseCholesky);
    }
}
