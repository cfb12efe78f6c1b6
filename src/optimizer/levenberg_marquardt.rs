//! Levenberg-Marquardt algorithm implementation.
//!
//! The Levenberg-Marquardt algorithm is a popular optimization method for
//! nonlinear least squares problems. It interpolates between the Gauss-Newton
//! algorithm and gradient descent by adding a damping parameter.
//!
//! Besides being selectable on its own, it is the fallback [`super::optimize`]
//! uses when an undamped step cannot be computed: the damped system
//! `JᵀJ + λI` stays positive definite even when some variable is left
//! unconstrained by the graph.

use std::fmt;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::core::graph::FactorGraph;
use crate::core::variable::Values;
use crate::error::{PlannerError, PlannerResult};
use crate::linalg::create_linear_solver;
use crate::optimizer::{
    ConvergenceInfo, OptimizationStatus, OptimizerConfig, Solver, SolverResult, apply_step,
};

/// Summary statistics for the Levenberg-Marquardt optimization process.
#[derive(Debug, Clone)]
pub struct LevenbergMarquardtSummary {
    /// Initial cost value
    pub initial_cost: f64,
    /// Final cost value
    pub final_cost: f64,
    /// Total number of iterations performed
    pub iterations: usize,
    /// Number of successful steps (cost decreased)
    pub successful_steps: usize,
    /// Number of unsuccessful steps (cost increased, damping increased)
    pub unsuccessful_steps: usize,
    /// Final damping parameter value
    pub final_damping: f64,
    /// Total time elapsed
    pub total_time: Duration,
}

impl fmt::Display for LevenbergMarquardtSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Levenberg-Marquardt Optimization Summary ===")?;
        writeln!(f, "Initial cost:              {:.6e}", self.initial_cost)?;
        writeln!(f, "Final cost:                {:.6e}", self.final_cost)?;
        writeln!(
            f,
            "Cost reduction:            {:.6e} ({:.2}%)",
            self.initial_cost - self.final_cost,
            100.0 * (self.initial_cost - self.final_cost) / self.initial_cost.max(1e-12)
        )?;
        writeln!(f, "Total iterations:          {}", self.iterations)?;
        writeln!(
            f,
            "Successful steps:          {} ({:.1}%)",
            self.successful_steps,
            100.0 * self.successful_steps as f64 / self.iterations.max(1) as f64
        )?;
        writeln!(
            f,
            "Unsuccessful steps:        {} ({:.1}%)",
            self.unsuccessful_steps,
            100.0 * self.unsuccessful_steps as f64 / self.iterations.max(1) as f64
        )?;
        writeln!(f, "Final damping parameter:   {:.6e}", self.final_damping)?;
        write!(f, "Total time:                {:?}", self.total_time)
    }
}

/// Levenberg-Marquardt solver for nonlinear least squares optimization.
pub struct LevenbergMarquardt {
    config: OptimizerConfig,
    damping: f64,
    damping_min: f64,
    damping_max: f64,
    damping_increase_factor: f64,
    damping_decrease_factor: f64,
    min_step_quality: f64,
    good_step_quality: f64,
    last_summary: Option<LevenbergMarquardtSummary>,
}

impl LevenbergMarquardt {
    /// Create a new Levenberg-Marquardt solver with default configuration.
    pub fn new() -> Self {
        Self::with_config(OptimizerConfig::default())
    }

    /// Create a new Levenberg-Marquardt solver with the given configuration.
    pub fn with_config(config: OptimizerConfig) -> Self {
        Self {
            config,
            damping: 1e-3,
            damping_min: 1e-12,
            damping_max: 1e12,
            damping_increase_factor: 10.0,
            damping_decrease_factor: 0.3,
            min_step_quality: 0.0,
            good_step_quality: 0.75,
            last_summary: None,
        }
    }

    /// Set the initial damping parameter.
    pub fn with_damping(mut self, damping: f64) -> Self {
        self.damping = damping;
        self
    }

    /// Set the damping parameter bounds.
    pub fn with_damping_bounds(mut self, min: f64, max: f64) -> Self {
        self.damping_min = min;
        self.damping_max = max;
        self
    }

    /// Set the damping adjustment factors.
    pub fn with_damping_factors(mut self, increase: f64, decrease: f64) -> Self {
        self.damping_increase_factor = increase;
        self.damping_decrease_factor = decrease;
        self
    }

    /// Summary of the last [`Solver::minimize`] call
    pub fn summary(&self) -> Option<&LevenbergMarquardtSummary> {
        self.last_summary.as_ref()
    }

    /// Update damping parameter based on step quality
    fn update_damping(&mut self, rho: f64) -> bool {
        if rho > self.good_step_quality {
            // Good step, decrease damping
            self.damping = (self.damping * self.damping_decrease_factor).max(self.damping_min);
            true
        } else if rho <= self.min_step_quality {
            // Poor step, increase damping
            self.increase_damping();
            false
        } else {
            // Acceptable step, keep damping unchanged
            true
        }
    }

    fn increase_damping(&mut self) {
        self.damping = (self.damping * self.damping_increase_factor).min(self.damping_max);
    }

    fn damping_saturated(&self) -> bool {
        self.damping >= self.damping_max
    }

    /// Compute step quality ratio (actual vs predicted reduction)
    fn compute_step_quality(&self, current_cost: f64, new_cost: f64, predicted_reduction: f64) -> f64 {
        let actual_reduction = current_cost - new_cost;
        if predicted_reduction.abs() < 1e-15 {
            if actual_reduction > 0.0 { 1.0 } else { 0.0 }
        } else {
            actual_reduction / predicted_reduction
        }
    }
}

impl Default for LevenbergMarquardt {
    fn default() -> Self {
        Self::new()
    }
}

impl Solver for LevenbergMarquardt {
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
        let mut successful_steps = 0;
        let mut unsuccessful_steps = 0;

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
            info.final_gradient_norm = system.jtb().norm();
            iterations += 1;

            // Raise the damping around this linearization until a step is accepted
            loop {
                let step = match linear_solver.solve_augmented_equation(&system, self.damping) {
                    Ok(step) => step,
                    Err(err) => {
                        if self.damping_saturated() {
                            return Err(PlannerError::SingularSystem(format!(
                                "damping saturated at {:.1e}: {err}",
                                self.damping
                            )));
                        }
                        self.increase_damping();
                        continue;
                    }
                };
                let step_norm = step.norm();
                info.final_parameter_update_norm = step_norm;
                if step_norm < self.config.parameter_tolerance {
                    break 'outer OptimizationStatus::ParameterToleranceReached;
                }

                let candidate = apply_step(&values, &system, &step)?;
                let new_error = graph.error(&candidate)?;
                info.cost_evaluations += 1;

                let predicted = system.model_decrease(&step);
                let rho = self.compute_step_quality(error, new_error, predicted);
                let negligible = self.config.change_negligible(error, new_error);
                let accepted = self.update_damping(rho);

                debug!(
                    iteration = iterations,
                    error,
                    new_error,
                    step_norm,
                    rho,
                    damping = self.damping,
                    accepted,
                    "Levenberg-Marquardt iteration"
                );

                if negligible {
                    break 'outer OptimizationStatus::Converged;
                }
                if accepted && new_error < error {
                    values = candidate;
                    error = new_error;
                    successful_steps += 1;
                    break;
                }
                unsuccessful_steps += 1;
                if self.damping_saturated() {
                    break 'outer OptimizationStatus::Failed(
                        "damping saturated without decreasing the error".to_string(),
                    );
                }
            }
        };

        let elapsed = start_time.elapsed();
        let summary = LevenbergMarquardtSummary {
            initial_cost: initial_error,
            final_cost: error,
            iterations,
            successful_steps,
            unsuccessful_steps,
            final_damping: self.damping,
            total_time: elapsed,
        };
        debug!(%status, "\n{summary}");
        self.last_summary = Some(summary);

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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::variable::Key;
    use crate::optimizer::tests::{linear_chain, rank_deficient_graph};

    #[test]
    fn test_damping_configuration() {
        let solver = LevenbergMarquardt::new()
            .with_damping(1e-6)
            .with_damping_bounds(1e-15, 1e15)
            .with_damping_factors(5.0, 0.5);

        assert_eq!(solver.damping, 1e-6);
        assert_eq!(solver.damping_min, 1e-15);
        assert_eq!(solver.damping_max, 1e15);
        assert_eq!(solver.damping_increase_factor, 5.0);
        assert_eq!(solver.damping_decrease_factor, 0.5);
    }

    #[test]
    fn test_damping_update() {
        let mut solver = LevenbergMarquardt::new().with_damping(1.0);
        assert!(solver.update_damping(0.9));
        assert!((solver.damping - 0.3).abs() < 1e-15);
        assert!(solver.update_damping(0.5));
        assert!((solver.damping - 0.3).abs() < 1e-15);
        assert!(!solver.update_damping(-1.0));
        assert!((solver.damping - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_damping_is_bounded() {
        let mut solver = LevenbergMarquardt::new()
            .with_damping(1.0)
            .with_damping_bounds(0.5, 100.0);
        for _ in 0..5 {
            solver.update_damping(-1.0);
        }
        assert_eq!(solver.damping, 100.0);
        assert!(solver.damping_saturated());
        for _ in 0..10 {
            solver.update_damping(1.0);
        }
        assert_eq!(solver.damping, 0.5);
    }

    #[test]
    fn test_solves_linear_chain() {
        let (graph, values) = linear_chain();
        let mut solver = LevenbergMarquardt::new();
        let result = solver.minimize(&graph, &values).unwrap();
        assert!(result.status.is_converged(), "{}", result.status);
        let x1 = result.values.at(&Key::conf(1)).unwrap()[0];
        assert!((x1 - 0.5).abs() < 1e-3);

        let summary = solver.summary().unwrap();
        assert!(summary.successful_steps >= 1);
        assert!(summary.to_string().contains("Levenberg-Marquardt"));
    }

    #[test]
    fn test_handles_unconstrained_variable() {
        let (graph, values) = rank_deficient_graph();
        let result = LevenbergMarquardt::new().minimize(&graph, &values).unwrap();
        assert!(result.status.is_converged(), "{}", result.status);
        assert!(result.final_error < 1e-4);
    }
}
