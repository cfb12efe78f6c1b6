//! Prior factor pulling a single variable toward a target value

use nalgebra::{DMatrix, DVector};

use crate::core::noise::NoiseModel;
use crate::core::variable::{Key, Values};
use crate::error::{PlannerError, PlannerResult};
use crate::factors::NonlinearFactor;

/// `r = value − target`, `J = I`
#[derive(Debug, Clone)]
pub struct PriorFactor {
    key: [Key; 1],
    target: DVector<f64>,
    noise: NoiseModel,
}

impl PriorFactor {
    pub fn new(key: Key, target: DVector<f64>, noise: NoiseModel) -> PlannerResult<Self> {
        if noise.dim() != target.len() {
            return Err(PlannerError::InvalidInput(format!(
                "prior on {key} has a {}-dimensional target but a {}-dimensional noise model",
                target.len(),
                noise.dim()
            )));
        }
        Ok(Self {
            key: [key],
            target,
            noise,
        })
    }

    /// Isotropic prior with standard deviation `sigma`
    pub fn isotropic(key: Key, target: DVector<f64>, sigma: f64) -> PlannerResult<Self> {
        let noise = NoiseModel::isotropic(target.len(), sigma)?;
        Self::new(key, target, noise)
    }

    pub fn key(&self) -> Key {
        self.key[0]
    }

    pub fn target(&self) -> &DVector<f64> {
        &self.target
    }
}

impl NonlinearFactor for PriorFactor {
    fn keys(&self) -> &[Key] {
        &self.key
    }

    fn noise_model(&self) -> &NoiseModel {
        &self.noise
    }

    fn evaluate(&self, values: &Values) -> PlannerResult<(DVector<f64>, Vec<DMatrix<f64>>)> {
        let value = values.at(&self.key[0])?;
        if value.len() != self.target.len() {
            return Err(PlannerError::InvalidInput(format!(
                "prior on {} expects dimension {}, value has {}",
                self.key[0],
                self.target.len(),
                value.len()
            )));
        }
        let n = value.len();
        Ok((value - &self.target, vec![DMatrix::identity(n, n)]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::dvector;

    #[test]
    fn test_prior_residual() {
        let factor = PriorFactor::isotropic(Key::conf(0), dvector![1.0, 2.0], 0.5).unwrap();
        let values: Values = [(Key::conf(0), dvector![1.5, 1.0])].into_iter().collect();
        let (residual, jacobians) = factor.evaluate(&values).unwrap();
        assert_eq!(residual, dvector![0.5, -1.0]);
        assert_eq!(jacobians[0], DMatrix::<f64>::identity(2, 2));
        assert!((factor.error(&values).unwrap() - 0.5 * (1.0 + 4.0)).abs() < 1e-12);
    }

    #[test]
    fn test_linearized_rhs_is_negative_whitened_residual() {
        let factor = PriorFactor::isotropic(Key::vel(2), dvector![0.0], 0.1).unwrap();
        let values: Values = [(Key::vel(2), dvector![0.3])].into_iter().collect();
        let linear = factor.linearize(&values).unwrap();
        assert!((linear.rhs()[0] + 3.0).abs() < 1e-12);
        assert!((linear.block(0)[(0, 0)] - 10.0).abs() < 1e-12);
    }

    #[test]
    fn test_dimension_mismatch() {
        let noise = NoiseModel::isotropic(3, 1.0).unwrap();
        assert!(PriorFactor::new(Key::conf(0), dvector![0.0, 0.0], noise).is_err());
    }
}
