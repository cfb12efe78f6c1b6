//! Factor implementations for trajectory factor graphs
//!
//! Every factor evaluates a raw residual together with one Jacobian block per
//! connected variable, and carries the noise model used to whiten both.
//!
//! # Module Structure
//!
//! - `prior`: unary prior on a configuration or velocity
//! - `gp_prior`: constant-velocity Gaussian-process prior and the GP interpolation model
//! - `obstacle`: hinge obstacle cost at a knot or at a GP-interpolated time

use std::fmt;

use nalgebra::{DMatrix, DVector};

use crate::core::linear::JacobianFactor;
use crate::core::noise::NoiseModel;
use crate::core::variable::{Key, Values};
use crate::error::PlannerResult;

pub mod gp_prior;
pub mod obstacle;
pub mod prior;

pub use gp_prior::{GaussianProcessInterpolator, GaussianProcessModel, GaussianProcessPriorFactor};
pub use obstacle::{InterpolatedObstacleFactor, ObstacleCost, ObstacleFactor};
pub use prior::PriorFactor;

/// Interface shared by all nonlinear factors
///
/// Implementors provide the raw residual and its Jacobian blocks; whitening,
/// error evaluation and linearization are derived from the noise model.
pub trait NonlinearFactor: fmt::Debug + Send + Sync {
    /// Variables this factor connects, in Jacobian block order
    fn keys(&self) -> &[Key];

    fn noise_model(&self) -> &NoiseModel;

    /// Raw residual and one Jacobian block per key
    fn evaluate(&self, values: &Values) -> PlannerResult<(DVector<f64>, Vec<DMatrix<f64>>)>;

    /// Residual dimension
    fn dim(&self) -> usize {
        self.noise_model().dim()
    }

    /// Unwhitened residual
    fn residual(&self, values: &Values) -> PlannerResult<DVector<f64>> {
        self.evaluate(values).map(|(residual, _)| residual)
    }

    /// `0.5 * ‖W r‖²`
    fn error(&self, values: &Values) -> PlannerResult<f64> {
        let residual = self.residual(values)?;
        Ok(self.noise_model().error(&residual))
    }

    /// Whitened linearization `‖Σ A_j δ_j − b‖²` with `b = −W r`
    fn linearize(&self, values: &Values) -> PlannerResult<JacobianFactor> {
        let (residual, jacobians) = self.evaluate(values)?;
        let noise = self.noise_model();
        let blocks = jacobians.iter().map(|j| noise.whiten_matrix(j)).collect();
        let rhs = -noise.whiten(&residual);
        JacobianFactor::new(self.keys().to_vec(), blocks, rhs)
    }
}

/// Closed set of factor kinds a trajectory graph can hold
#[derive(Debug, Clone)]
pub enum Factor {
    Prior(PriorFactor),
    GaussianProcessPrior(GaussianProcessPriorFactor),
    ObstacleCost(ObstacleFactor),
    InterpolatedObstacleCost(InterpolatedObstacleFactor),
}

impl Factor {
    fn inner(&self) -> &dyn NonlinearFactor {
        match self {
            Factor::Prior(f) => f,
            Factor::GaussianProcessPrior(f) => f,
            Factor::ObstacleCost(f) => f,
            Factor::InterpolatedObstacleCost(f) => f,
        }
    }

    /// Whether this factor penalizes collisions
    pub fn is_obstacle(&self) -> bool {
        matches!(
            self,
            Factor::ObstacleCost(_) | Factor::InterpolatedObstacleCost(_)
        )
    }

    /// The pinned key if this factor is a prior
    pub fn prior_key(&self) -> Option<Key> {
        match self {
            Factor::Prior(f) => Some(f.key()),
            _ => None,
        }
    }
}

impl NonlinearFactor for Factor {
    fn keys(&self) -> &[Key] {
        self.inner().keys()
    }

    fn noise_model(&self) -> &NoiseModel {
        self.inner().noise_model()
    }

    fn evaluate(&self, values: &Values) -> PlannerResult<(DVector<f64>, Vec<DMatrix<f64>>)> {
        self.inner().evaluate(values)
    }
}

impl fmt::Display for Factor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Factor::Prior(_) => "Prior",
            Factor::GaussianProcessPrior(_) => "GaussianProcessPrior",
            Factor::ObstacleCost(_) => "ObstacleCost",
            Factor::InterpolatedObstacleCost(_) => "InterpolatedObstacleCost",
        };
        let keys: Vec<String> = self.keys().iter().map(Key::to_string).collect();
        write!(f, "{name}({})", keys.join(", "))
    }
}

impl From<PriorFactor> for Factor {
    fn from(factor: PriorFactor) -> Self {
        Factor::Prior(factor)
    }
}

impl From<GaussianProcessPriorFactor> for Factor {
    fn from(factor: GaussianProcessPriorFactor) -> Self {
        Factor::GaussianProcessPrior(factor)
    }
}

impl From<ObstacleFactor> for Factor {
    fn from(factor: ObstacleFactor) -> Self {
        Factor::ObstacleCost(factor)
    }
}

impl From<InterpolatedObstacleFactor> for Factor {
    fn from(factor: InterpolatedObstacleFactor) -> Self {
        Factor::InterpolatedObstacleCost(factor)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use nalgebra::dvector;

    /// Compare analytic Jacobian blocks against central differences.
    pub(crate) fn assert_jacobians_match(factor: &dyn NonlinearFactor, values: &Values) {
        let h = 1e-6;
        let (_, analytic) = factor.evaluate(values).unwrap();
        assert_eq!(analytic.len(), factor.keys().len());

        for (block, key) in analytic.iter().zip(factor.keys()) {
            let base = values.at(key).unwrap().clone();
            for k in 0..base.len() {
                let mut plus = values.clone();
                let mut minus = values.clone();
                let mut step = DVector::zeros(base.len());
                step[k] = h;
                plus.update(*key, &base + &step).unwrap();
                minus.update(*key, &base - &step).unwrap();

                let numerical = (factor.residual(&plus).unwrap() - factor.residual(&minus).unwrap())
                    / (2.0 * h);
                let column = block.column(k);
                let scale = 1.0 + numerical.amax();
                assert!(
                    (column - &numerical).amax() < 1e-4 * scale,
                    "Jacobian of {key} column {k}: analytic {column:?}, numerical {numerical:?}"
                );
            }
        }
    }

    #[test]
    fn test_factor_enum_delegates() {
        let factor: Factor = PriorFactor::isotropic(Key::conf(4), dvector![1.0, 1.0], 0.1)
            .unwrap()
            .into();
        assert_eq!(factor.keys(), &[Key::conf(4)]);
        assert_eq!(factor.dim(), 2);
        assert_eq!(factor.prior_key(), Some(Key::conf(4)));
        assert!(!factor.is_obstacle());
        assert_eq!(factor.to_string(), "Prior(x4)");
    }

    #[test]
    fn test_linearize_whitens_blocks() {
        let factor: Factor = PriorFactor::isotropic(Key::vel(1), dvector![0.0, 0.0], 0.5)
            .unwrap()
            .into();
        let values: Values = [(Key::vel(1), dvector![1.0, -1.0])].into_iter().collect();
        let linear = factor.linearize(&values).unwrap();
        assert_eq!(linear.block(0), &(DMatrix::<f64>::identity(2, 2) * 2.0));
        assert_eq!(linear.rhs(), &dvector![-2.0, 2.0]);
    }
}
