//! Gaussian noise models used to whiten factor residuals.
//!
//! A factor error is `0.5 * ‖W r‖²` where `W` is the square-root information
//! matrix of the noise model. Whitening both the residual and the Jacobian
//! blocks turns every factor into an ordinary least-squares term.

use nalgebra::{DMatrix, DVector};

use crate::error::{PlannerError, PlannerResult};

/// Noise model of a factor
#[derive(Debug, Clone, PartialEq)]
pub enum NoiseModel {
    /// Diagonal covariance `σ² I`
    Isotropic { dim: usize, sigma: f64 },
    /// Full covariance, stored as its square-root information matrix `L⁻¹` (`Σ = L Lᵀ`)
    Gaussian { sqrt_information: DMatrix<f64> },
}

impl NoiseModel {
    /// Isotropic model with standard deviation `sigma` on each of `dim` rows
    pub fn isotropic(dim: usize, sigma: f64) -> PlannerResult<Self> {
        if !(sigma > 0.0 && sigma.is_finite()) {
            return Err(PlannerError::InvalidInput(format!(
                "noise sigma must be positive and finite, got {sigma}"
            )));
        }
        Ok(NoiseModel::Isotropic { dim, sigma })
    }

    /// Gaussian model from a symmetric positive definite covariance
    pub fn from_covariance(covariance: &DMatrix<f64>) -> PlannerResult<Self> {
        if !covariance.is_square() {
            return Err(PlannerError::InvalidInput(format!(
                "covariance must be square, got {}x{}",
                covariance.nrows(),
                covariance.ncols()
            )));
        }
        let n = covariance.nrows();
        let cholesky = covariance.clone().cholesky().ok_or_else(|| {
            PlannerError::InvalidInput("covariance is not positive definite".to_string())
        })?;
        let sqrt_information = cholesky
            .l()
            .solve_lower_triangular(&DMatrix::identity(n, n))
            .ok_or_else(|| {
                PlannerError::InvalidInput("covariance factor is not invertible".to_string())
            })?;
        Ok(NoiseModel::Gaussian { sqrt_information })
    }

    /// Number of residual rows this model whitens
    pub fn dim(&self) -> usize {
        match self {
            NoiseModel::Isotropic { dim, .. } => *dim,
            NoiseModel::Gaussian { sqrt_information } => sqrt_information.nrows(),
        }
    }

    pub fn whiten(&self, residual: &DVector<f64>) -> DVector<f64> {
        match self {
            NoiseModel::Isotropic { sigma, .. } => residual / *sigma,
            NoiseModel::Gaussian { sqrt_information } => sqrt_information * residual,
        }
    }

    pub fn whiten_matrix(&self, block: &DMatrix<f64>) -> DMatrix<f64> {
        match self {
            NoiseModel::Isotropic { sigma, .. } => block / *sigma,
            NoiseModel::Gaussian { sqrt_information } => sqrt_information * block,
        }
    }

    /// `0.5 * ‖W r‖²`
    pub fn error(&self, residual: &DVector<f64>) -> f64 {
        0.5 * self.whiten(residual).norm_squared()
    }
}
