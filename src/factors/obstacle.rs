//! Obstacle-avoidance factors
//!
//! Every body sphere contributes one hinge residual
//! `r = max(0, ε + radius − d(c))`, where `d` is the signed distance at the
//! sphere centre `c`. An inactive hinge has a zero residual and a zero
//! Jacobian row; an active one has the row `−∇d(c)ᵀ J_c(q)`.

use std::sync::Arc;

use nalgebra::{DMatrix, DVector};

use crate::core::noise::NoiseModel;
use crate::core::variable::{Key, Values};
use crate::error::{PlannerError, PlannerResult};
use crate::factors::NonlinearFactor;
use crate::factors::gp_prior::{GaussianProcessInterpolator, GaussianProcessModel};
use crate::kinematics::PlanarArm;
use crate::sdf::PlanarSdf;

/// Shared obstacle cost evaluation: arm geometry, field and safety margin
#[derive(Debug, Clone)]
pub struct ObstacleCost {
    arm: Arc<PlanarArm>,
    sdf: Arc<PlanarSdf>,
    epsilon: f64,
}

impl ObstacleCost {
    pub fn new(arm: Arc<PlanarArm>, sdf: Arc<PlanarSdf>, epsilon: f64) -> PlannerResult<Self> {
        if !(epsilon > 0.0 && epsilon.is_finite()) {
            return Err(PlannerError::InvalidInput(format!(
                "obstacle safety distance must be positive, got {epsilon}"
            )));
        }
        Ok(Self { arm, sdf, epsilon })
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn arm(&self) -> &PlanarArm {
        &self.arm
    }

    /// Number of residual rows (one per body sphere)
    pub fn dim(&self) -> usize {
        self.arm.spheres().len()
    }

    /// Hinge residuals and their `spheres x dof` Jacobian at configuration `q`
    pub fn evaluate(&self, q: &DVector<f64>) -> PlannerResult<(DVector<f64>, DMatrix<f64>)> {
        let (centers, center_jacobians) = self.arm.sphere_centers(q)?;
        let spheres = self.arm.spheres();

        let mut residual = DVector::zeros(spheres.len());
        let mut jacobian = DMatrix::zeros(spheres.len(), self.arm.dof());
        for (i, sphere) in spheres.iter().enumerate() {
            let (distance, gradient) = self.sdf.distance_and_gradient(&centers[i])?;
            let margin = self.epsilon + sphere.radius;
            if distance >= margin {
                continue;
            }
            residual[i] = margin - distance;
            let row = -(gradient.transpose() * &center_jacobians[i]);
            jacobian.row_mut(i).copy_from(&row);
        }
        Ok((residual, jacobian))
    }
}

/// Obstacle cost at one knot configuration
#[derive(Debug, Clone)]
pub struct ObstacleFactor {
    key: [Key; 1],
    cost: ObstacleCost,
    noise: NoiseModel,
}

impl ObstacleFactor {
    pub fn new(
        key: Key,
        arm: Arc<PlanarArm>,
        sdf: Arc<PlanarSdf>,
        cost_sigma: f64,
        epsilon: f64,
    ) -> PlannerResult<Self> {
        let cost = ObstacleCost::new(arm, sdf, epsilon)?;
        let noise = NoiseModel::isotropic(cost.dim(), cost_sigma)?;
        Ok(Self {
            key: [key],
            cost,
            noise,
        })
    }

    pub fn cost(&self) -> &ObstacleCost {
        &self.cost
    }
}

impl NonlinearFactor for ObstacleFactor {
    fn keys(&self) -> &[Key] {
        &self.key
    }

    fn noise_model(&self) -> &NoiseModel {
        &self.noise
    }

    fn evaluate(&self, values: &Values) -> PlannerResult<(DVector<f64>, Vec<DMatrix<f64>>)> {
        let q = values.at(&self.key[0])?;
        let (residual, jacobian) = self.cost.evaluate(q)?;
        Ok((residual, vec![jacobian]))
    }
}

/// Obstacle cost at a GP-interpolated configuration between two knots
#[derive(Debug, Clone)]
pub struct InterpolatedObstacleFactor {
    keys: [Key; 4],
    cost: ObstacleCost,
    interpolator: GaussianProcessInterpolator,
    tau: f64,
    noise: NoiseModel,
}

impl InterpolatedObstacleFactor {
    /// Factor on `(x1, v1, x2, v2)` checking the configuration at `tau ∈ (0, delta_t)`
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        x1: Key,
        v1: Key,
        x2: Key,
        v2: Key,
        arm: Arc<PlanarArm>,
        sdf: Arc<PlanarSdf>,
        cost_sigma: f64,
        epsilon: f64,
        model: &GaussianProcessModel,
        delta_t: f64,
        tau: f64,
    ) -> PlannerResult<Self> {
        if !(tau > 0.0 && tau < delta_t) {
            return Err(PlannerError::InvalidInput(format!(
                "interpolation time {tau} must lie strictly inside (0, {delta_t})"
            )));
        }
        let cost = ObstacleCost::new(arm, sdf, epsilon)?;
        let noise = NoiseModel::isotropic(cost.dim(), cost_sigma)?;
        Ok(Self {
            keys: [x1, v1, x2, v2],
            interpolator: GaussianProcessInterpolator::new(model, delta_t, tau)?,
            cost,
            tau,
            noise,
        })
    }

    pub fn tau(&self) -> f64 {
        self.tau
    }

    pub fn cost(&self) -> &ObstacleCost {
        &self.cost
    }
}

impl NonlinearFactor for InterpolatedObstacleFactor {
    fn keys(&self) -> &[Key] {
        &self.keys
    }

    fn noise_model(&self) -> &NoiseModel {
        &self.noise
    }

    fn evaluate(&self, values: &Values) -> PlannerResult<(DVector<f64>, Vec<DMatrix<f64>>)> {
        let x1 = values.at(&self.keys[0])?;
        let v1 = values.at(&self.keys[1])?;
        let x2 = values.at(&self.keys[2])?;
        let v2 = values.at(&self.keys[3])?;
        let d = self.interpolator.dof();
        if [x1, v1, x2, v2].iter().any(|v| v.len() != d) {
            return Err(PlannerError::InvalidInput(format!(
                "interpolated obstacle cost between {} and {} expects {d}-dimensional states",
                self.keys[0], self.keys[2]
            )));
        }

        let (q, _) = self.interpolator.interpolate(x1, v1, x2, v2);
        let (residual, jacobian) = self.cost.evaluate(&q)?;
        let blocks: Vec<DMatrix<f64>> = self
            .interpolator
            .configuration_jacobians()
            .iter()
            .map(|chain| &jacobian * chain)
            .collect();
        Ok((residual, blocks))
    }
}
