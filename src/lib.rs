//! # GPMP Planner
//!
//! Gaussian-process motion planning for planar revolute arms, built on a
//! nonlinear least-squares factor graph.
//!
//! ## Features
//!
//! - **Signed Distance Fields**: bilinear distance and gradient queries on a 2D grid, built from occupancy maps
//! - **Arm Kinematics**: forward kinematics and Jacobians of planar revolute chains with collision spheres
//! - **Trajectory Factors**: priors, constant-velocity GP priors and hinge obstacle costs, at knots or GP-interpolated times
//! - **Batch Optimization**: Gauss-Newton, Dog Leg and Levenberg-Marquardt over sparse Cholesky or QR backends
//! - **Incremental Replanning**: Bayes-tree partial re-elimination after adding, removing or pinning factors
//! - **GP Interpolation**: lazy dense sampling of optimized trajectories
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use gpmp_planner::{OccupancyGrid, PlanarArm, PlanarSdf, PlannerConfig, Trajectory};
//! use gpmp_planner::planner::batch_trajectory_optimize;
//! use nalgebra::dvector;
//!
//! # fn main() -> Result<(), gpmp_planner::PlannerError> {
//! let sdf = Arc::new(PlanarSdf::from_provider(&OccupancyGrid::one_obstacle())?);
//! let arm = Arc::new(PlanarArm::simple_two_links());
//! let config = PlannerConfig::default();
//!
//! let (start, goal, zero) = (dvector![0.0, 0.0], dvector![1.57, 0.0], dvector![0.0, 0.0]);
//! let init = Trajectory::straight_line(&start, &goal, config.total_time_steps, config.total_time_sec)?;
//! let result = batch_trajectory_optimize(
//!     arm, sdf, &start, &zero, &goal, &zero, &init.to_values(), &config,
//! )?;
//! println!("{}", result.status);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod factors;
pub mod incremental;
pub mod kinematics;
pub mod linalg;
pub mod logger;
pub mod optimizer;
pub mod planner;
pub mod sdf;
pub mod trajectory;

// Re-export core types
pub use config::{PlannerConfig, ReplanPolicy};
pub use crate::core::{FactorGraph, FactorId, Key, NoiseModel, Values};
pub use error::{PlannerError, PlannerResult};

// Re-export factor types
pub use factors::{
    Factor, GaussianProcessModel, GaussianProcessPriorFactor, InterpolatedObstacleFactor,
    NonlinearFactor, ObstacleFactor, PriorFactor,
};

pub use incremental::{IncrementalConfig, IncrementalOptimizer, UpdateResult};
pub use kinematics::{BodySphere, PlanarArm};

// Re-export linear algebra types
pub use linalg::{LinearSolverType, SparseCholeskySolver, SparseLinearSolver, SparseQRSolver};

// Re-export logger
pub use logger::{init_logger, init_logger_with_level};

// Re-export optimizer types
pub use optimizer::{
    DogLeg, GaussNewton, LevenbergMarquardt, OptimizationStatus, OptimizerConfig, OptimizerType,
    Solver, SolverResult, optimize,
};

pub use planner::{IncrementalTrajOptimizer, batch_trajectory_optimize, build_trajectory_graph};
pub use sdf::{DatasetProvider, OccupancyGrid, PlanarSdf};
pub use trajectory::{InterpolatedTrajectory, Trajectory, TrajectorySample, interpolate};
