//! Error types for the gpmp-planner library
//!
//! This module provides the main error and result types used throughout the library.
//! All errors use the `thiserror` crate for automatic trait implementations.

use crate::linalg::LinAlgError;
use thiserror::Error;

/// Main result type used throughout the gpmp-planner library
pub type PlannerResult<T> = Result<T, PlannerError>;

/// Main error type for the gpmp-planner library
#[derive(Debug, Clone, Error)]
pub enum PlannerError {
    /// Signed-distance query outside the grid extent
    #[error("Query point ({x:.4}, {y:.4}) is outside the signed distance field")]
    OutOfBounds { x: f64, y: f64 },

    /// Linear solve failed during optimization
    #[error("Singular system: {0}")]
    SingularSystem(String),

    /// Graph edit referencing a nonexistent variable or factor
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Iteration budget exhausted without meeting tolerance
    #[error("No convergence after {iterations} iterations (final error {final_error:.6e})")]
    NonConvergence { iterations: usize, final_error: f64 },

    /// Invalid input parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<LinAlgError> for PlannerError {
    fn from(err: LinAlgError) -> Self {
        PlannerError::SingularSystem(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_planner_error_display() {
        let error = PlannerError::SingularSystem("Matrix is singular".to_string());
        assert_eq!(error.to_string(), "Singular system: Matrix is singular");
    }

    #[test]
    fn test_out_of_bounds_display() {
        let error = PlannerError::OutOfBounds { x: -1.5, y: 0.25 };
        assert!(error.to_string().contains("(-1.5000, 0.2500)"));
    }

    #[test]
    fn test_planner_error_from_linalg() {
        let error = PlannerError::from(LinAlgError::FactorizationFailed(
            "not positive definite".to_string(),
        ));

        match error {
            PlannerError::SingularSystem(msg) => assert!(msg.contains("not positive definite")),
            _ => panic!("Expected SingularSystem error"),
        }
    }

    #[test]
    fn test_planner_result_err() {
        let result: PlannerResult<i32> = Err(PlannerError::InvalidState("x3".to_string()));
        assert!(result.is_err());
    }
}
