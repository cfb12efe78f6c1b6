//! Batch nonlinear least-squares optimizers for factor graphs.
//!
//! This module provides the iterative solvers used for batch trajectory
//! optimization:
//! - Gauss-Newton algorithm
//! - Dog Leg algorithm (Powell's trust region)
//! - Levenberg-Marquardt algorithm
//!
//! [`optimize`] runs the configured algorithm and retries with
//! Levenberg-Marquardt damping when Gauss-Newton or Dog Leg hit a singular
//! linear system.

use std::fmt;
use std::time::{Duration, Instant};

use nalgebra::DVector;
use tracing::warn;

use crate::core::graph::FactorGraph;
use crate::core::linear::LinearSystem;
use crate::core::variable::Values;
use crate::error::{PlannerError, PlannerResult};
use crate::linalg::LinearSolverType;

pub mod dog_leg;
pub mod gauss_newton;
pub mod levenberg_marquardt;

pub use dog_leg::DogLeg;
pub use gauss_newton::GaussNewton;
pub use levenberg_marquardt::LevenbergMarquardt;

/// Type of optimization algorithm to use
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerType {
    /// Gauss-Newton algorithm (fast convergence, may be unstable)
    #[default]
    GaussNewton,
    /// Dog Leg algorithm (trust region method)
    DogLeg,
    /// Levenberg-Marquardt algorithm (robust, adaptive damping)
    LevenbergMarquardt,
}

impl fmt::Display for OptimizerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerType::LevenbergMarquardt => write!(f, "Levenberg-Marquardt"),
            OptimizerType::GaussNewton => write!(f, "Gauss-Newton"),
            OptimizerType::DogLeg => write!(f, "Dog Leg"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Type of optimizer algorithm to use
    pub optimizer_type: OptimizerType,
    /// Type of linear solver for the linear systems
    pub linear_solver_type: LinearSolverType,
    /// Maximum number of iterations
    pub max_iterations: usize,
    /// Stop when the error decreases by less than this fraction
    pub relative_error_tolerance: f64,
    /// Stop when the error, or its decrease, falls below this value
    pub absolute_error_tolerance: f64,
    /// Stop (without applying it) when the step norm falls below this value
    pub parameter_tolerance: f64,
    /// Timeout duration
    pub timeout: Option<Duration>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            optimizer_type: OptimizerType::default(),
            linear_solver_type: LinearSolverType::default(),
            max_iterations: 100,
            relative_error_tolerance: 1e-5,
            absolute_error_tolerance: 1e-10,
            parameter_tolerance: 1e-8,
            timeout: None,
        }
    }
}

impl OptimizerConfig {
    /// Create a new solver configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the optimizer algorithm type
    pub fn with_optimizer_type(mut self, optimizer_type: OptimizerType) -> Self {
        self.optimizer_type = optimizer_type;
        self
    }

    /// Set the linear solver type
    pub fn with_linear_solver_type(mut self, linear_solver_type: LinearSolverType) -> Self {
        self.linear_solver_type = linear_solver_type;
        self
    }

    /// Set the maximum number of iterations
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_relative_error_tolerance(mut self, tolerance: f64) -> Self {
        self.relative_error_tolerance = tolerance;
        self
    }

    pub fn with_absolute_error_tolerance(mut self, tolerance: f64) -> Self {
        self.absolute_error_tolerance = tolerance;
        self
    }

    /// Set the parameter tolerance
    pub fn with_parameter_tolerance(mut self, parameter_tolerance: f64) -> Self {
        self.parameter_tolerance = parameter_tolerance;
        self
    }

    /// Set the timeout duration
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Reject non-positive tolerances and an empty iteration budget
    pub fn validate(&self) -> PlannerResult<()> {
        if self.max_iterations == 0 {
            return Err(PlannerError::InvalidInput(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("relative_error_tolerance", self.relative_error_tolerance),
            ("absolute_error_tolerance", self.absolute_error_tolerance),
            ("parameter_tolerance", self.parameter_tolerance),
        ] {
            if value.is_nan() || value < 0.0 {
                return Err(PlannerError::InvalidInput(format!(
                    "{name} must be non-negative, got {value}"
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn timed_out(&self, start: Instant) -> bool {
        self.timeout.is_some_and(|timeout| start.elapsed() >= timeout)
    }

    fn error_tolerance(&self, error: f64) -> f64 {
        self.absolute_error_tolerance
            .max(self.relative_error_tolerance * error)
    }

    /// Whether moving from `error` to `new_error` is too small an improvement to be worth a step
    pub(crate) fn improvement_negligible(&self, error: f64, new_error: f64) -> bool {
        error - new_error <= self.error_tolerance(error)
    }

    /// Whether `new_error` lies within tolerance of `error` in either direction
    pub(crate) fn change_negligible(&self, error: f64, new_error: f64) -> bool {
        (error - new_error).abs() <= self.error_tolerance(error)
    }

    /// Whether `new_error` exceeds `error` by more than the tolerance
    pub(crate) fn diverged(&self, error: f64, new_error: f64) -> bool {
        new_error - error > self.error_tolerance(error)
    }
}

impl fmt::Display for OptimizerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "OptimizerConfig {{ optimizer_type: {}, linear_solver_type: {:?}, max_iterations: {}, relative_error_tolerance: {}, absolute_error_tolerance: {}, parameter_tolerance: {}, timeout: {:?} }}",
            self.optimizer_type,
            self.linear_solver_type,
            self.max_iterations,
            self.relative_error_tolerance,
            self.absolute_error_tolerance,
            self.parameter_tolerance,
            self.timeout,
        )
    }
}

/// Detailed convergence information.
#[derive(Debug, Clone, Default)]
pub struct ConvergenceInfo {
    /// Final gradient norm `‖Jᵀb‖`
    pub final_gradient_norm: f64,
    /// Final parameter update norm
    pub final_parameter_update_norm: f64,
    /// Cost function evaluation count
    pub cost_evaluations: usize,
    /// Jacobian evaluation count
    pub jacobian_evaluations: usize,
}

impl fmt::Display for ConvergenceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Final gradient norm: {:.2e}, Final parameter update norm: {:.2e}, Cost evaluations: {}, Jacobian evaluations: {}",
            self.final_gradient_norm,
            self.final_parameter_update_norm,
            self.cost_evaluations,
            self.jacobian_evaluations
        )
    }
}

/// Status of an optimization process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptimizationStatus {
    /// Error stopped decreasing by more than the tolerances
    Converged,
    /// Step became smaller than the parameter tolerance
    ParameterToleranceReached,
    /// Maximum number of iterations reached
    MaxIterationsReached,
    /// Timeout reached
    Timeout,
    /// Iterations diverged
    Failed(String),
}

impl OptimizationStatus {
    pub fn is_converged(&self) -> bool {
        matches!(
            self,
            OptimizationStatus::Converged | OptimizationStatus::ParameterToleranceReached
        )
    }
}

impl fmt::Display for OptimizationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizationStatus::Converged => write!(f, "Converged"),
            OptimizationStatus::ParameterToleranceReached => {
                write!(f, "Parameter tolerance reached")
            }
            OptimizationStatus::MaxIterationsReached => write!(f, "Maximum iterations reached"),
            OptimizationStatus::Timeout => write!(f, "Timeout"),
            OptimizationStatus::Failed(msg) => write!(f, "Failed: {msg}"),
        }
    }
}

/// Result of a solver execution.
#[derive(Debug, Clone)]
pub struct SolverResult<T> {
    /// Final variable values
    pub values: T,
    /// Final optimization status
    pub status: OptimizationStatus,
    /// Initial error value
    pub initial_error: f64,
    /// Final error value
    pub final_error: f64,
    /// Number of iterations performed
    pub iterations: usize,
    /// Total time elapsed
    pub elapsed: Duration,
    /// Convergence statistics
    pub convergence_info: Option<ConvergenceInfo>,
}

impl<T> SolverResult<T> {
    /// Turn a non-converged result into `NonConvergence`
    pub fn into_converged(self) -> PlannerResult<Self> {
        if self.status.is_converged() {
            Ok(self)
        } else {
            Err(PlannerError::NonConvergence {
                iterations: self.iterations,
                final_error: self.final_error,
            })
        }
    }
}

/// Core trait for batch optimization solvers.
pub trait Solver {
    /// Minimize the graph error starting from `initial`
    fn minimize(
        &mut self,
        graph: &FactorGraph,
        initial: &Values,
    ) -> PlannerResult<SolverResult<Values>>;
}

/// Apply a stacked step to the values it was computed for
pub(crate) fn apply_step(
    values: &Values,
    system: &LinearSystem,
    step: &DVector<f64>,
) -> PlannerResult<Values> {
    values.retract(&system.ordering().split(step))
}

/// Run the configured optimizer, retrying with Levenberg-Marquardt when
/// Gauss-Newton or Dog Leg fail on a singular system or diverge.
pub fn optimize(
    graph: &FactorGraph,
    initial: &Values,
    config: &OptimizerConfig,
) -> PlannerResult<SolverResult<Values>> {
    config.validate()?;
    let first = match config.optimizer_type {
        OptimizerType::GaussNewton => GaussNewton::with_config(config.clone()).minimize(graph, initial),
        OptimizerType::DogLeg => DogLeg::with_config(config.clone()).minimize(graph, initial),
        OptimizerType::LevenbergMarquardt => {
            return LevenbergMarquardt::with_config(config.clone()).minimize(graph, initial);
        }
    };

    let reason = match &first {
        Err(PlannerError::SingularSystem(msg)) => msg.clone(),
        Ok(result) => match &result.status {
            OptimizationStatus::Failed(msg) => msg.clone(),
            _ => return first,
        },
        Err(_) => return first,
    };

    warn!(
        optimizer = %config.optimizer_type,
        reason = %reason,
        "retrying with Levenberg-Marquardt damping"
    );
    LevenbergMarquardt::with_config(config.clone()).minimize(graph, initial)
}
