//! Dog Leg optimization algorithm implementation.
//!
//! The Dog Leg algorithm is a trust region method that combines the Gauss-Newton
//! direction with the steepest descent direction to find an optimal step within
//! a trust region.

use std::time::Instant;

use nalgebra::DVector;
use tracing::debug;

use crate::core::graph::FactorGraph;
use crate::core::linear::LinearSystem;
use crate::core::variable::Values;
use crate::error::PlannerResult;
use crate::linalg::create_linear_solver;
use crate::optimizer::{
    ConvergenceInfo, OptimizationStatus, OptimizerConfig, Solver, SolverResult, apply_step,
};

/// Dog Leg solver for nonlinear least squares optimization.
pub struct DogLeg {
    config: OptimizerConfig,
    trust_region_radius: f64,
    trust_region_min: f64,
    trust_region_max: f64,
    trust_region_increase_factor: f64,
    trust_region_decrease_factor: f64,
}

impl DogLeg {
    /// Create a new Dog Leg solver with default configuration.
    pub fn new() -> Self {
        Self::with_config(OptimizerConfig::default())
    }

    /// Create a new Dog Leg solver with the given configuration.
    pub fn with_config(config: OptimizerConfig) -> Self {
        Self {
            config,
            trust_region_radius: 1.0,
            trust_region_min: 1e-12,
            trust_region_max: 1e12,
            trust_region_increase_factor: 2.0,
            trust_region_decrease_factor: 0.5,
        }
    }

    /// Set the initial trust region radius.
    pub fn with_trust_region_radius(mut self, radius: f64) -> Self {
        self.trust_region_radius = radius;
        self
    }

    /// Set the trust region radius bounds.
    pub fn with_trust_region_bounds(mut self, min: f64, max: f64) -> Self {
        self.trust_region_min = min;
        self.trust_region_max = max;
        self
    }

    /// Set the trust region adjustment factors.
    pub fn with_trust_region_factors(mut self, increase: f64, decrease: f64) -> Self {
        self.trust_region_increase_factor = increase;
        self.trust_region_decrease_factor = decrease;
        self
    }

    /// Update trust region radius based on step quality
    fn update_trust_region(&mut self, rho: f64, step_norm: f64) {
        if rho > 0.75 {
            // Good step, increase trust region
            self.trust_region_radius = (self.trust_region_radius
                * self.trust_region_increase_factor)
                .min(self.trust_region_max);
        } else if rho < 0.25 {
            // Poor step, decrease trust region
            self.trust_region_radius =
                (step_norm * self.trust_region_decrease_factor).max(self.trust_region_min);
        }
        // For 0.25 <= rho <= 0.75, keep trust region unchanged
    }

    /// Powell's dog leg step inside the current radius.
    ///
    /// `gradient` is the steepest descent direction `Jᵀb`.
    fn dog_leg_step(
        &self,
        system: &LinearSystem,
        gauss_newton: &DVector<f64>,
        gradient: &DVector<f64>,
    ) -> DVector<f64> {
        let radius = self.trust_region_radius;
        let gn_norm = gauss_newton.norm();
        if gn_norm <= radius {
            return gauss_newton.clone();
        }

        let gradient_norm_sq = gradient.norm_squared();
        let curvature = system.jacobian_norm_squared(gradient);
        if gradient_norm_sq == 0.0 || curvature <= 0.0 {
            return gauss_newton * (radius / gn_norm);
        }

        // Cauchy point along the gradient
        let steepest = gradient * (gradient_norm_sq / curvature);
        let steepest_norm = steepest.norm();
        if steepest_norm >= radius {
            return gradient * (radius / gradient_norm_sq.sqrt());
        }

        // Walk from the Cauchy point toward the Gauss-Newton point until the boundary
        let leg = gauss_newton - &steepest;
        let a = leg.norm_squared();
        let b = 2.0 * steepest.dot(&leg);
        let c = steepest_norm * steepest_norm - radius * radius;
        let beta = (-b + (b * b - 4.0 * a * c).max(0.0).sqrt()) / (2.0 * a);
        steepest + leg * beta
    }
}

impl Default for DogLeg {
    fn default() -> Self {
        Self::new()
    }
}

impl Solver for DogLeg {
    fn minimize(
        &mut self,
        graph: &FactorGraph,
        initial: &Values,
    ) -> PlannerResult<SolverResult<Values>> {
        let start_time = Instant::now();
        let mut linear_solver = create_linear_solver(self.config.linear_solver_type);

        let mut values = initial.clone();
        let initial_error = graph.error(&values)?;
        let mut error = initial_error;
        let mut info = ConvergenceInfo {
            cost_evaluations: 1,
            ..Default::default()
        };
        let mut iterations = 0;

        let status = 'outer: loop {
            if error <= self.config.absolute_error_tolerance {
                break OptimizationStatus::Converged;
            }
            if iterations >= self.config.max_iterations {
                break OptimizationStatus::MaxIterationsReached;
            }
            if self.config.timed_out(start_time) {
                break OptimizationStatus::Timeout;
            }

            let system = graph.linearize(&values)?;
            info.jacobian_evaluations += 1;
            let gradient = system.jtb();
            info.final_gradient_norm = gradient.norm();
            let gauss_newton = linear_solver.solve_normal_equation(&system)?;
            iterations += 1;

            if gauss_newton.norm() < self.config.parameter_tolerance {
                info.final_parameter_update_norm = gauss_newton.norm();
                break OptimizationStatus::ParameterToleranceReached;
            }

            // Shrink the region around this linearization until a step decreases the error
            loop {
                let step = self.dog_leg_step(&system, &gauss_newton, &gradient);
                let step_norm = step.norm();
                info.final_parameter_update_norm = step_norm;

                let candidate = apply_step(&values, &system, &step)?;
                let new_error = graph.error(&candidate)?;
                info.cost_evaluations += 1;

                let actual = error - new_error;
                let predicted = system.model_decrease(&step);
                let rho = if predicted.abs() < 1e-15 {
                    if actual > 0.0 { 1.0 } else { 0.0 }
                } else {
                    actual / predicted
                };
                self.update_trust_region(rho, step_norm);

                debug!(
                    iteration = iterations,
                    error,
                    new_error,
                    step_norm,
                    rho,
                    radius = self.trust_region_radius,
                    "Dog Leg iteration"
                );

                if self.config.change_negligible(error, new_error) {
                    break 'outer OptimizationStatus::Converged;
                }
                if actual > 0.0 {
                    values = candidate;
                    error = new_error;
                    break;
                }
                if self.trust_region_radius <= self.trust_region_min {
                    break 'outer OptimizationStatus::Failed(
                        "trust region collapsed without decreasing the error".to_string(),
                    );
                }
            }
        };

        let elapsed = start_time.elapsed();
        debug!(
            %status,
            iterations,
            initial_error,
            final_error = error,
            radius = self.trust_region_radius,
            "Dog Leg finished"
        );
        Ok(SolverResult {
            values,
            status,
            initial_error,
            final_error: error,
            iterations,
            elapsed,
            convergence_info: Some(info),
        })
    }
}
