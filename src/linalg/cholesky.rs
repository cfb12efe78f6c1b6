use std::collections::BTreeMap;

use faer::Side;
use faer::linalg::solvers::Solve;
use faer::sparse::linalg::solvers;
use faer::sparse::{SparseColMat, Triplet};
use nalgebra::DVector;

use super::{LinAlgError, LinAlgResult, SparseLinearSolver, check_finite, from_faer, to_faer};
use crate::core::linear::LinearSystem;

/// Sparse Cholesky (LLᵀ) on the normal equations.
///
/// The symbolic factorization is cached and reused while the sparsity
/// pattern of `JᵀJ` stays the same, which holds across the iterations of one
/// optimization since numerically zero blocks are still stored.
#[derive(Debug, Clone, Default)]
pub struct SparseCholeskySolver {
    symbolic_pattern: Option<(Vec<(usize, usize)>, solvers::SymbolicLlt<usize>)>,
}

impl SparseCholeskySolver {
    pub fn new() -> Self {
        Self::default()
    }

    fn solve_with_damping(
        &mut self,
        system: &LinearSystem,
        lambda: f64,
    ) -> LinAlgResult<DVector<f64>> {
        let n = system.cols();
        let (mut entries, gradient) = system.normal_equations();
        if lambda > 0.0 {
            for i in 0..n {
                *entries.entry((i, i)).or_insert(0.0) += lambda;
            }
        }

        let hessian = assemble(n, &entries)?;
        let pattern: Vec<(usize, usize)> = entries.keys().copied().collect();

        let reuse = matches!(&self.symbolic_pattern, Some((cached, _)) if *cached == pattern);
        if !reuse {
            let symbolic = solvers::SymbolicLlt::try_new(hessian.symbolic(), Side::Lower)
                .map_err(|e| LinAlgError::FactorizationFailed(format!("{e:?}")))?;
            self.symbolic_pattern = Some((pattern, symbolic));
        }
        let symbolic = match &self.symbolic_pattern {
            Some((_, symbolic)) => symbolic.clone(),
            None => {
                return Err(LinAlgError::FactorizationFailed(
                    "missing symbolic factorization".to_string(),
                ));
            }
        };

        let cholesky = solvers::Llt::try_new_with_symbolic(symbolic, hessian.as_ref(), Side::Lower)
            .map_err(|e| {
                LinAlgError::FactorizationFailed(format!("normal equations not positive definite: {e:?}"))
            })?;
        let solution = cholesky.solve(to_faer(&gradient));
        check_finite(from_faer(&solution, n))
    }
}

/// Build a symmetric sparse matrix from accumulated `(row, col)` entries
fn assemble(n: usize, entries: &BTreeMap<(usize, usize), f64>) -> LinAlgResult<SparseColMat<usize, f64>> {
    let triplets: Vec<Triplet<usize, usize, f64>> = entries
        .iter()
        .map(|(&(row, col), &value)| Triplet::new(row, col, value))
        .collect();
    SparseColMat::try_new_from_triplets(n, n, &triplets)
        .map_err(|e| LinAlgError::InvalidStructure(format!("{e:?}")))
}

impl SparseLinearSolver for SparseCholeskySolver {
    fn solve_normal_equation(&mut self, system: &LinearSystem) -> LinAlgResult<DVector<f64>> {
        self.solve_with_damping(system, 0.0)
    }

    fn solve_augmented_equation(
        &mut self,
        system: &LinearSystem,
        lambda: f64,
    ) -> LinAlgResult<DVector<f64>> {
        self.solve_with_damping(system, lambda)
    }
}
