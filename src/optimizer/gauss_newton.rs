//! Gauss-Newton optimization algorithm implementation
//!
//! The Gauss-Newton algorithm is an iterative method for solving non-linear least squares problems.
//! It approximates the Hessian using only first-order derivatives.

use std::time::Instant;

use tracing::debug;

use crate::core::graph::FactorGraph;
use crate::core::variable::Values;
use crate::error::PlannerResult;
use crate::linalg::create_linear_solver;
use crate::optimizer::{
    ConvergenceInfo, OptimizationStatus, OptimizerConfig, Solver, SolverResult, apply_step,
};

/// Gauss-Newton solver for nonlinear least squares optimization.
pub struct GaussNewton {
    config: OptimizerConfig,
}

impl GaussNewton {
    /// Create a new Gauss-Newton solver with default configuration.
    pub fn new() -> Self {
        Self::with_config(OptimizerConfig::default())
    }

    /// Create a new Gauss-Newton solver with the given configuration.
    pub fn with_config(config: OptimizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }
}

impl Default for GaussNewton {
    fn default() -> Self {
        Self::new()
    }
}

impl Solver for GaussNewton {
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

        let status = loop {
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
            info.final_gradient_norm = system.jtb().norm();

            let step = linear_solver.solve_normal_equation(&system)?;
            let step_norm = step.norm();
            info.final_parameter_update_norm = step_norm;
            iterations += 1;

            if step_norm < self.config.parameter_tolerance {
                break OptimizationStatus::ParameterToleranceReached;
            }

            let candidate = apply_step(&values, &system, &step)?;
            let new_error = graph.error(&candidate)?;
            info.cost_evaluations += 1;

            debug!(
                iteration = iterations,
                error,
                new_error,
                step_norm,
                "Gauss-Newton iteration"
            );

            if self.config.diverged(error, new_error) {
                break OptimizationStatus::Failed(format!(
                    "error increased from {error:.6e} to {new_error:.6e}"
                ));
            }
            let negligible = self.config.improvement_negligible(error, new_error);
            if new_error < error {
                values = candidate;
                error = new_error;
            }
            if negligible {
                break OptimizationStatus::Converged;
            }
        };

        let elapsed = start_time.elapsed();
        debug!(
            %status,
            iterations,
            initial_error,
            final_error = error,
            ?elapsed,
            "Gauss-Newton finished"
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
