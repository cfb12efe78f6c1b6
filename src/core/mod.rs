//! Core factor-graph data structures
//!
//! - `variable`: keys and value containers
//! - `noise`: Gaussian noise models
//! - `linear`: whitened Jacobian factors and the batch linear system
//! - `graph`: the nonlinear factor graph

pub mod graph;
pub mod linear;
pub mod noise;
pub mod variable;

pub use graph::{FactorGraph, FactorId};
pub use linear::{JacobianFactor, LinearSystem, Ordering};
pub use noise::NoiseModel;
pub use variable::{Key, Values, VariableKind, VectorValues};
