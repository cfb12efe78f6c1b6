//! Constant-velocity Gaussian-process prior
//!
//! The state of a knot is `s = [x; v]` (configuration and velocity). Under
//! white noise on acceleration with power spectral density `Qc` the state
//! transition over `τ` is
//!
//! ```text
//! Φ(τ) = [ I  τI ]        Q(τ) = [ τ³/3 Qc  τ²/2 Qc ]
//!        [ 0   I ]               [ τ²/2 Qc    τ Qc  ]
//! ```
//!
//! and the posterior mean between two knots `Δt` apart is
//! `s(τ) = Λ(τ) s₁ + Ψ(τ) s₂` with `Ψ = Q(τ) Φ(Δt−τ)ᵀ Q(Δt)⁻¹` and
//! `Λ = Φ(τ) − Ψ Φ(Δt)`.

use nalgebra::{DMatrix, DVector};

use crate::core::noise::NoiseModel;
use crate::core::variable::{Key, Values};
use crate::error::{PlannerError, PlannerResult};
use crate::factors::NonlinearFactor;

/// `[[a·M, b·M], [c·M, d·M]]`
fn block_2x2(m: &DMatrix<f64>, a: f64, b: f64, c: f64, d: f64) -> DMatrix<f64> {
    let n = m.nrows();
    let mut result = DMatrix::zeros(2 * n, 2 * n);
    result.view_mut((0, 0), (n, n)).copy_from(&(m * a));
    result.view_mut((0, n), (n, n)).copy_from(&(m * b));
    result.view_mut((n, 0), (n, n)).copy_from(&(m * c));
    result.view_mut((n, n), (n, n)).copy_from(&(m * d));
    result
}

/// White-noise-on-acceleration motion model shared by GP factors and interpolation
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianProcessModel {
    qc: DMatrix<f64>,
    qc_inv: DMatrix<f64>,
}

impl GaussianProcessModel {
    /// `qc` must be symmetric positive definite
    pub fn new(qc: DMatrix<f64>) -> PlannerResult<Self> {
        if !qc.is_square() || qc.nrows() == 0 {
            return Err(PlannerError::InvalidInput(format!(
                "Qc must be a non-empty square matrix, got {}x{}",
                qc.nrows(),
                qc.ncols()
            )));
        }
        let qc_inv = qc
            .clone()
            .cholesky()
            .ok_or_else(|| PlannerError::InvalidInput("Qc is not positive definite".to_string()))?
            .inverse();
        Ok(Self { qc, qc_inv })
    }

    /// Isotropic `Qc = σ² I`
    pub fn isotropic(dof: usize, qc: f64) -> PlannerResult<Self> {
        Self::new(DMatrix::identity(dof, dof) * qc)
    }

    pub fn dof(&self) -> usize {
        self.qc.nrows()
    }

    pub fn qc(&self) -> &DMatrix<f64> {
        &self.qc
    }

    /// State transition `Φ(τ)`
    pub fn phi(&self, tau: f64) -> DMatrix<f64> {
        let identity = DMatrix::identity(self.dof(), self.dof());
        block_2x2(&identity, 1.0, tau, 0.0, 1.0)
    }

    /// Process covariance `Q(τ)`
    pub fn q(&self, tau: f64) -> DMatrix<f64> {
        block_2x2(
            &self.qc,
            tau.powi(3) / 3.0,
            tau.powi(2) / 2.0,
            tau.powi(2) / 2.0,
            tau,
        )
    }

    /// Closed-form `Q(τ)⁻¹`
    pub fn q_inv(&self, tau: f64) -> DMatrix<f64> {
        block_2x2(
            &self.qc_inv,
            12.0 / tau.powi(3),
            -6.0 / tau.powi(2),
            -6.0 / tau.powi(2),
            4.0 / tau,
        )
    }

    /// Interpolation weight on the later knot, `Ψ(τ)`
    pub fn psi(&self, delta_t: f64, tau: f64) -> DMatrix<f64> {
        self.q(tau) * self.phi(delta_t - tau).transpose() * self.q_inv(delta_t)
    }

    /// Interpolation weight on the earlier knot, `Λ(τ)`
    pub fn lambda(&self, delta_t: f64, tau: f64) -> DMatrix<f64> {
        self.phi(tau) - self.psi(delta_t, tau) * self.phi(delta_t)
    }

    /// Noise model of one GP prior interval
    pub fn interval_noise(&self, delta_t: f64) -> PlannerResult<NoiseModel> {
        NoiseModel::from_covariance(&self.q(delta_t))
    }
}

/// Precomputed `Λ`, `Ψ` for one interpolation time
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianProcessInterpolator {
    dof: usize,
    lambda: DMatrix<f64>,
    psi: DMatrix<f64>,
}

impl GaussianProcessInterpolator {
    pub fn new(model: &GaussianProcessModel, delta_t: f64, tau: f64) -> PlannerResult<Self> {
        if !(delta_t > 0.0 && delta_t.is_finite()) {
            return Err(PlannerError::InvalidInput(format!(
                "interval length must be positive, got {delta_t}"
            )));
        }
        if !(0.0..=delta_t).contains(&tau) {
            return Err(PlannerError::InvalidInput(format!(
                "interpolation time {tau} outside [0, {delta_t}]"
            )));
        }
        Ok(Self {
            dof: model.dof(),
            lambda: model.lambda(delta_t, tau),
            psi: model.psi(delta_t, tau),
        })
    }

    pub fn dof(&self) -> usize {
        self.dof
    }

    pub fn lambda(&self) -> &DMatrix<f64> {
        &self.lambda
    }

    pub fn psi(&self) -> &DMatrix<f64> {
        &self.psi
    }

    /// Interpolated configuration and velocity
    pub fn interpolate(
        &self,
        x1: &DVector<f64>,
        v1: &DVector<f64>,
        x2: &DVector<f64>,
        v2: &DVector<f64>,
    ) -> (DVector<f64>, DVector<f64>) {
        let d = self.dof;
        let x = self.lambda.view((0, 0), (d, d)) * x1
            + self.lambda.view((0, d), (d, d)) * v1
            + self.psi.view((0, 0), (d, d)) * x2
            + self.psi.view((0, d), (d, d)) * v2;
        let v = self.lambda.view((d, 0), (d, d)) * x1
            + self.lambda.view((d, d), (d, d)) * v1
            + self.psi.view((d, 0), (d, d)) * x2
            + self.psi.view((d, d), (d, d)) * v2;
        (x, v)
    }

    /// Jacobians of the interpolated configuration with respect to
    /// `x1, v1, x2, v2`, each `dof x dof`
    pub fn configuration_jacobians(&self) -> [DMatrix<f64>; 4] {
        let d = self.dof;
        [
            self.lambda.view((0, 0), (d, d)).into_owned(),
            self.lambda.view((0, d), (d, d)).into_owned(),
            self.psi.view((0, 0), (d, d)).into_owned(),
            self.psi.view((0, d), (d, d)).into_owned(),
        ]
    }
}

/// Constant-velocity prior between two consecutive knots
#[derive(Debug, Clone)]
pub struct GaussianProcessPriorFactor {
    keys: [Key; 4],
    delta_t: f64,
    dof: usize,
    noise: NoiseModel,
}

impl GaussianProcessPriorFactor {
    /// Prior on `(x1, v1) → (x2, v2)` over an interval of `delta_t`
    pub fn new(
        x1: Key,
        v1: Key,
        x2: Key,
        v2: Key,
        delta_t: f64,
        model: &GaussianProcessModel,
    ) -> PlannerResult<Self> {
        if !(delta_t > 0.0 && delta_t.is_finite()) {
            return Err(PlannerError::InvalidInput(format!(
                "GP prior interval must be positive, got {delta_t}"
            )));
        }
        Ok(Self {
            keys: [x1, v1, x2, v2],
            delta_t,
            dof: model.dof(),
            noise: model.interval_noise(delta_t)?,
        })
    }

    pub fn delta_t(&self) -> f64 {
        self.delta_t
    }
}

impl NonlinearFactor for GaussianProcessPriorFactor {
    fn keys(&self) -> &[Key] {
        &self.keys
    }

    fn noise_model(&self) -> &NoiseModel {
        &self.noise
    }

    fn evaluate(&self, values: &Values) -> PlannerResult<(DVector<f64>, Vec<DMatrix<f64>>)> {
        let d = self.dof;
        let [x1, v1, x2, v2] = self.keys.map(|key| values.at(&key));
        let (x1, v1, x2, v2) = (x1?, v1?, x2?, v2?);
        if [x1, v1, x2, v2].iter().any(|v| v.len() != d) {
            return Err(PlannerError::InvalidInput(format!(
                "GP prior between {} and {} expects {d}-dimensional states",
                self.keys[0], self.keys[2]
            )));
        }

        let mut residual = DVector::zeros(2 * d);
        residual
            .rows_mut(0, d)
            .copy_from(&(x2 - x1 - v1 * self.delta_t));
        residual.rows_mut(d, d).copy_from(&(v2 - v1));

        let identity = DMatrix::<f64>::identity(d, d);
        let zero = DMatrix::<f64>::zeros(d, d);
        let stack = |top: &DMatrix<f64>, bottom: &DMatrix<f64>| {
            let mut block = DMatrix::zeros(2 * d, d);
            block.view_mut((0, 0), (d, d)).copy_from(top);
            block.view_mut((d, 0), (d, d)).copy_from(bottom);
            block
        };

        let jacobians = vec![
            stack(&-&identity, &zero),
            stack(&(-&identity * self.delta_t), &-&identity),
            stack(&identity, &zero),
            stack(&zero, &identity),
        ];
        Ok((residual, jacobians))
    }
}
