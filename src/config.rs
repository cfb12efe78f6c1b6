//! Planner configuration
//!
//! [`PlannerConfig`] gathers the trajectory, obstacle and noise settings of a
//! planning problem together with the batch and incremental optimizer
//! settings. It is validated once before any graph is built.

use std::fmt;

use nalgebra::DMatrix;

use crate::error::{PlannerError, PlannerResult};
use crate::incremental::IncrementalConfig;
use crate::optimizer::OptimizerConfig;

/// Which knots to hold fixed when replanning from a mid-trajectory index
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplanPolicy {
    /// Pin only the configuration and velocity at the replan index
    #[default]
    FixCurrentState,
    /// Pin every knot from the start up to and including the replan index
    FixExecutedPrefix,
}

impl fmt::Display for ReplanPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplanPolicy::FixCurrentState => write!(f, "fix current state"),
            ReplanPolicy::FixExecutedPrefix => write!(f, "fix executed prefix"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Duration of the whole trajectory in seconds
    pub total_time_sec: f64,
    /// Number of intervals between knots
    pub total_time_steps: usize,
    /// Number of obstacle checks over the whole trajectory, knots included
    pub total_check_steps: usize,
    /// Add GP-interpolated obstacle factors between knots
    pub use_gp_interpolation: bool,
    /// Standard deviation of the obstacle cost
    pub cost_sigma: f64,
    /// Safety distance kept from obstacles
    pub epsilon_dist: f64,
    /// Power spectral density of the constant-velocity prior
    pub qc: DMatrix<f64>,
    /// Standard deviation of the start/goal configuration priors
    pub pose_fix_sigma: f64,
    /// Standard deviation of the start/goal velocity priors
    pub vel_fix_sigma: f64,
    pub optimizer: OptimizerConfig,
    pub incremental: IncrementalConfig,
    pub replan_policy: ReplanPolicy,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self::new(2)
    }
}

impl PlannerConfig {
    /// Defaults for an arm with `dof` joints
    pub fn new(dof: usize) -> Self {
        Self {
            total_time_sec: 5.0,
            total_time_steps: 10,
            total_check_steps: 50,
            use_gp_interpolation: true,
            cost_sigma: 0.1,
            epsilon_dist: 0.1,
            qc: DMatrix::identity(dof, dof),
            pose_fix_sigma: 1e-4,
            vel_fix_sigma: 1e-4,
            optimizer: OptimizerConfig::default(),
            incremental: IncrementalConfig::default(),
            replan_policy: ReplanPolicy::default(),
        }
    }

    pub fn with_total_time(mut self, seconds: f64) -> Self {
        self.total_time_sec = seconds;
        self
    }

    pub fn with_total_time_steps(mut self, steps: usize) -> Self {
        self.total_time_steps = steps;
        self
    }

    pub fn with_total_check_steps(mut self, steps: usize) -> Self {
        self.total_check_steps = steps;
        self
    }

    pub fn with_gp_interpolation(mut self, enabled: bool) -> Self {
        self.use_gp_interpolation = enabled;
        self
    }

    pub fn with_cost_sigma(mut self, sigma: f64) -> Self {
        self.cost_sigma = sigma;
        self
    }

    pub fn with_epsilon_dist(mut self, epsilon: f64) -> Self {
        self.epsilon_dist = epsilon;
        self
    }

    pub fn with_qc(mut self, qc: DMatrix<f64>) -> Self {
        self.qc = qc;
        self
    }

    pub fn with_fix_sigmas(mut self, pose: f64, vel: f64) -> Self {
        self.pose_fix_sigma = pose;
        self.vel_fix_sigma = vel;
        self
    }

    pub fn with_optimizer(mut self, optimizer: OptimizerConfig) -> Self {
        self.optimizer = optimizer;
        self
    }

    pub fn with_incremental(mut self, incremental: IncrementalConfig) -> Self {
        self.incremental = incremental;
        self
    }

    pub fn with_replan_policy(mut self, policy: ReplanPolicy) -> Self {
        self.replan_policy = policy;
        self
    }

    /// Degrees of freedom implied by `qc`
    pub fn dof(&self) -> usize {
        self.qc.nrows()
    }

    /// Time between consecutive knots
    pub fn delta_t(&self) -> f64 {
        self.total_time_sec / self.total_time_steps as f64
    }

    /// Interpolated obstacle checks per interval
    pub fn check_inter(&self) -> usize {
        (self.total_check_steps / self.total_time_steps.max(1)).saturating_sub(1)
    }

    pub fn validate(&self) -> PlannerResult<()> {
        if !(self.total_time_sec > 0.0 && self.total_time_sec.is_finite()) {
            return Err(PlannerError::InvalidInput(format!(
                "total_time_sec must be positive, got {}",
                self.total_time_sec
            )));
        }
        if self.total_time_steps == 0 {
            return Err(PlannerError::InvalidInput(
                "total_time_steps must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("cost_sigma", self.cost_sigma),
            ("epsilon_dist", self.epsilon_dist),
            ("pose_fix_sigma", self.pose_fix_sigma),
            ("vel_fix_sigma", self.vel_fix_sigma),
        ] {
            if !(value > 0.0 && value.is_finite()) {
                return Err(PlannerError::InvalidInput(format!(
                    "{name} must be positive, got {value}"
                )));
            }
        }
        if self.qc.nrows() == 0 || !self.qc.is_square() {
            return Err(PlannerError::InvalidInput(format!(
                "qc must be a non-empty square matrix, got {}x{}",
                self.qc.nrows(),
                self.qc.ncols()
            )));
        }
        self.optimizer.validate()?;
        self.incremental.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_two_link_demo() {
        let config = PlannerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.dof(), 2);
        assert!((config.delta_t() - 0.5).abs() < 1e-15);
        assert_eq!(config.check_inter(), 4);
        assert_eq!(config.replan_policy, ReplanPolicy::FixCurrentState);
    }

    #[test]
    fn test_check_inter_without_extra_checks() {
        let config = PlannerConfig::default().with_total_check_steps(10);
        assert_eq!(config.check_inter(), 0);
        let config = PlannerConfig::default().with_total_check_steps(3);
        assert_eq!(config.check_inter(), 0);
    }

    #[test]
    fn test_degenerate_obstacle_settings_are_rejected() {
        assert!(PlannerConfig::default().with_epsilon_dist(0.0).validate().is_err());
        assert!(PlannerConfig::default().with_cost_sigma(-1.0).validate().is_err());
        assert!(PlannerConfig::default().with_total_time_steps(0).validate().is_err());
        assert!(
            PlannerConfig::default()
                .with_qc(DMatrix::zeros(2, 3))
                .validate()
                .is_err()
        );
    }
}
