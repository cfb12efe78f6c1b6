//! Trajectory-level planning API
//!
//! Builds the factor graph of a planar-arm trajectory (boundary priors, GP
//! smoothness priors and obstacle costs), solves it in batch, and keeps an
//! incremental replanning session on top of [`IncrementalOptimizer`].

use std::sync::Arc;

use nalgebra::DVector;
use tracing::{debug, info};

use crate::config::{PlannerConfig, ReplanPolicy};
use crate::core::graph::{FactorGraph, FactorId};
use crate::core::variable::{Key, Values};
use crate::error::{PlannerError, PlannerResult};
use crate::factors::{
    Factor, GaussianProcessModel, GaussianProcessPriorFactor, InterpolatedObstacleFactor,
    NonlinearFactor, ObstacleFactor, PriorFactor,
};
use crate::incremental::{IncrementalOptimizer, UpdateResult};
use crate::kinematics::PlanarArm;
use crate::optimizer::{SolverResult, optimize};
use crate::sdf::PlanarSdf;
use crate::trajectory::Trajectory;

/// Factory for the factors of one trajectory problem
#[derive(Debug, Clone)]
struct TrajectoryFactors {
    arm: Arc<PlanarArm>,
    sdf: Arc<PlanarSdf>,
    config: PlannerConfig,
    model: GaussianProcessModel,
}

impl TrajectoryFactors {
    fn new(arm: Arc<PlanarArm>, sdf: Arc<PlanarSdf>, config: PlannerConfig) -> PlannerResult<Self> {
        config.validate()?;
        if arm.dof() != config.dof() {
            return Err(PlannerError::InvalidInput(format!(
                "arm has {} joints but qc is {}x{}",
                arm.dof(),
                config.dof(),
                config.dof()
            )));
        }
        let model = GaussianProcessModel::new(config.qc.clone())?;
        Ok(Self {
            arm,
            sdf,
            config,
            model,
        })
    }

    fn steps(&self) -> usize {
        self.config.total_time_steps
    }

    fn check_dim(&self, name: &str, value: &DVector<f64>) -> PlannerResult<()> {
        if value.len() != self.arm.dof() {
            return Err(PlannerError::InvalidInput(format!(
                "{name} has dimension {}, arm has {} joints",
                value.len(),
                self.arm.dof()
            )));
        }
        Ok(())
    }

    /// Configuration and velocity priors at knot `index`
    fn state_priors(
        &self,
        index: usize,
        conf: &DVector<f64>,
        vel: &DVector<f64>,
    ) -> PlannerResult<[Factor; 2]> {
        self.check_dim("configuration", conf)?;
        self.check_dim("velocity", vel)?;
        Ok([
            PriorFactor::isotropic(Key::conf(index), conf.clone(), self.config.pose_fix_sigma)?
                .into(),
            PriorFactor::isotropic(Key::vel(index), vel.clone(), self.config.vel_fix_sigma)?.into(),
        ])
    }

    fn knot_obstacle(&self, index: usize) -> PlannerResult<Factor> {
        Ok(ObstacleFactor::new(
            Key::conf(index),
            Arc::clone(&self.arm),
            Arc::clone(&self.sdf),
            self.config.cost_sigma,
            self.config.epsilon_dist,
        )?
        .into())
    }

    /// GP prior over interval `index → index + 1` plus its interpolated obstacle checks
    fn interval(&self, index: usize) -> PlannerResult<Vec<Factor>> {
        let delta_t = self.config.delta_t();
        let (x1, v1) = (Key::conf(index), Key::vel(index));
        let (x2, v2) = (Key::conf(index + 1), Key::vel(index + 1));

        let mut factors: Vec<Factor> =
            vec![GaussianProcessPriorFactor::new(x1, v1, x2, v2, delta_t, &self.model)?.into()];
        if self.config.use_gp_interpolation {
            let check_inter = self.config.check_inter();
            for j in 0..check_inter {
                let tau = (j + 1) as f64 * delta_t / (check_inter + 1) as f64;
                factors.push(
                    InterpolatedObstacleFactor::new(
                        x1,
                        v1,
                        x2,
                        v2,
                        Arc::clone(&self.arm),
                        Arc::clone(&self.sdf),
                        self.config.cost_sigma,
                        self.config.epsilon_dist,
                        &self.model,
                        delta_t,
                        tau,
                    )?
                    .into(),
                );
            }
        }
        Ok(factors)
    }

    /// Every factor except the goal priors, in time order
    fn body(&self, start_conf: &DVector<f64>, start_vel: &DVector<f64>) -> PlannerResult<Vec<Factor>> {
        let mut factors: Vec<Factor> = self.state_priors(0, start_conf, start_vel)?.into();
        for i in 0..=self.steps() {
            factors.push(self.knot_obstacle(i)?);
            if i > 0 {
                factors.extend(self.interval(i - 1)?);
            }
        }
        Ok(factors)
    }
}

/// Factor graph of a trajectory from `(start_conf, start_vel)` to
/// `(goal_conf, goal_vel)` over `config.total_time_steps` intervals.
///
/// Holds start and goal priors, an obstacle factor at every knot, a GP prior
/// per interval and, with `use_gp_interpolation`, `check_inter` interpolated
/// obstacle factors per interval.
pub fn build_trajectory_graph(
    arm: Arc<PlanarArm>,
    sdf: Arc<PlanarSdf>,
    start_conf: &DVector<f64>,
    start_vel: &DVector<f64>,
    goal_conf: &DVector<f64>,
    goal_vel: &DVector<f64>,
    config: &PlannerConfig,
) -> PlannerResult<FactorGraph> {
    let builder = TrajectoryFactors::new(arm, sdf, config.clone())?;
    let mut graph = FactorGraph::new();
    for factor in builder.body(start_conf, start_vel)? {
        graph.add_factor(factor);
    }
    for factor in builder.state_priors(builder.steps(), goal_conf, goal_vel)? {
        graph.add_factor(factor);
    }
    debug!(factors = graph.len(), steps = builder.steps(), "built trajectory graph");
    Ok(graph)
}

/// Optimize a whole trajectory from `init_values` with the configured batch optimizer
#[allow(clippy::too_many_arguments)]
pub fn batch_trajectory_optimize(
    arm: Arc<PlanarArm>,
    sdf: Arc<PlanarSdf>,
    start_conf: &DVector<f64>,
    start_vel: &DVector<f64>,
    goal_conf: &DVector<f64>,
    goal_vel: &DVector<f64>,
    init_values: &Values,
    config: &PlannerConfig,
) -> PlannerResult<SolverResult<Values>> {
    let graph = build_trajectory_graph(arm, sdf, start_conf, start_vel, goal_conf, goal_vel, config)?;
    graph.validate(init_values)?;
    let result = optimize(&graph, init_values, &config.optimizer)?;
    info!(
        status = %result.status,
        iterations = result.iterations,
        initial_error = result.initial_error,
        final_error = result.final_error,
        "batch trajectory optimization finished"
    );
    Ok(result)
}

/// Largest unwhitened obstacle residual of `graph` at `values`; zero when every
/// body sphere keeps the safety distance.
pub fn max_obstacle_cost(graph: &FactorGraph, values: &Values) -> PlannerResult<f64> {
    graph
        .iter()
        .filter(|(_, factor)| factor.is_obstacle())
        .try_fold(0.0_f64, |largest, (_, factor)| {
            let residual = factor.residual(values)?;
            Ok(largest.max(residual.amax()))
        })
}

/// Incremental replanning session for one trajectory.
///
/// Edits (`init_factor_graph`, `fix_config_and_vel`, `change_goal_config_and_vel`)
/// are staged and take effect on the next [`Self::update`].
#[derive(Debug, Clone)]
pub struct IncrementalTrajOptimizer {
    factors: TrajectoryFactors,
    isam: IncrementalOptimizer,
    pending_factors: Vec<Factor>,
    pending_goal: Option<[Factor; 2]>,
    pending_removals: Vec<FactorId>,
    goal_ids: Vec<FactorId>,
}

impl IncrementalTrajOptimizer {
    pub fn new(arm: Arc<PlanarArm>, sdf: Arc<PlanarSdf>, config: PlannerConfig) -> PlannerResult<Self> {
        let isam = IncrementalOptimizer::new(config.incremental.clone())?;
        Ok(Self {
            factors: TrajectoryFactors::new(arm, sdf, config)?,
            isam,
            pending_factors: Vec::new(),
            pending_goal: None,
            pending_removals: Vec::new(),
            goal_ids: Vec::new(),
        })
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.factors.config
    }

    /// Underlying incremental optimizer
    pub fn optimizer(&self) -> &IncrementalOptimizer {
        &self.isam
    }

    /// Stage the full trajectory graph
    pub fn init_factor_graph(
        &mut self,
        start_conf: &DVector<f64>,
        start_vel: &DVector<f64>,
        goal_conf: &DVector<f64>,
        goal_vel: &DVector<f64>,
    ) -> PlannerResult<()> {
        if !self.isam.graph().is_empty() || !self.pending_factors.is_empty() {
            return Err(PlannerError::InvalidState(
                "factor graph is already initialized".to_string(),
            ));
        }
        let body = self.factors.body(start_conf, start_vel)?;
        let goal = self
            .factors
            .state_priors(self.factors.steps(), goal_conf, goal_vel)?;
        self.pending_factors = body;
        self.pending_goal = Some(goal);
        Ok(())
    }

    /// Initial guesses for the trajectory variables
    pub fn init_values(&mut self, values: &Values) -> PlannerResult<()> {
        self.isam.insert_values(values)
    }

    /// Apply the staged edits.
    ///
    /// On failure nothing is applied and the staged edits are kept.
    pub fn update(&mut self) -> PlannerResult<UpdateResult> {
        let mut new_factors = self.pending_factors.clone();
        let goal_added = self.pending_goal.is_some();
        if let Some(goal) = &self.pending_goal {
            new_factors.extend(goal.iter().cloned());
        }

        let result = self.isam.update(new_factors, &self.pending_removals)?;

        if goal_added {
            let count = result.new_factor_ids.len();
            self.goal_ids = result.new_factor_ids[count - 2..].to_vec();
        }
        self.pending_factors.clear();
        self.pending_goal = None;
        self.pending_removals.clear();
        Ok(result)
    }

    /// Hold the state at knot `index` from the next update on.
    ///
    /// With [`ReplanPolicy::FixExecutedPrefix`] every earlier knot is also held
    /// at its current estimate.
    pub fn fix_config_and_vel(
        &mut self,
        index: usize,
        conf: &DVector<f64>,
        vel: &DVector<f64>,
    ) -> PlannerResult<()> {
        if index > self.factors.steps() {
            return Err(PlannerError::InvalidState(format!(
                "cannot fix knot {index} of a {}-step trajectory",
                self.factors.steps()
            )));
        }
        self.factors.check_dim("configuration", conf)?;
        self.factors.check_dim("velocity", vel)?;

        if self.factors.config.replan_policy == ReplanPolicy::FixExecutedPrefix {
            let current = self.isam.estimate()?;
            for i in 0..index {
                self.fix_knot(i, current.at(&Key::conf(i))?.clone(), current.at(&Key::vel(i))?.clone())?;
            }
        }
        self.fix_knot(index, conf.clone(), vel.clone())
    }

    fn fix_knot(&mut self, index: usize, conf: DVector<f64>, vel: DVector<f64>) -> PlannerResult<()> {
        let config = &self.factors.config;
        let (pose_sigma, vel_sigma) = (config.pose_fix_sigma, config.vel_fix_sigma);
        self.isam
            .fix_variable_with_sigma(Key::conf(index), conf, pose_sigma)?;
        self.isam.fix_variable_with_sigma(Key::vel(index), vel, vel_sigma)
    }

    /// Replace the goal priors from the next update on
    pub fn change_goal_config_and_vel(
        &mut self,
        conf: &DVector<f64>,
        vel: &DVector<f64>,
    ) -> PlannerResult<()> {
        let goal = self
            .factors
            .state_priors(self.factors.steps(), conf, vel)?;
        if self.pending_goal.is_none() {
            if self.goal_ids.is_empty() {
                return Err(PlannerError::InvalidState(
                    "no goal to change before init_factor_graph".to_string(),
                ));
            }
            self.pending_removals.append(&mut self.goal_ids);
        }
        self.pending_goal = Some(goal);
        Ok(())
    }

    /// Current estimate of every trajectory variable
    pub fn values(&self) -> PlannerResult<Values> {
        self.isam.estimate()
    }

    pub fn trajectory(&self) -> PlannerResult<Trajectory> {
        Trajectory::from_values(
            &self.values()?,
            self.factors.steps(),
            self.factors.config.delta_t(),
        )
    }
}
