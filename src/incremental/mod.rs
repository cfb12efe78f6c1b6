//! Incremental smoothing over a growing or edited trajectory graph.
//!
//! [`IncrementalOptimizer`] keeps a linearization point `θ`, the current
//! solution `δ` of the linearized problem and a [`BayesTree`] of the
//! eliminated system. An update only relinearizes the factors it has to and
//! only re-eliminates the cliques holding affected variables together with
//! their ancestors; untouched subtrees are re-attached with their cached
//! marginals. The estimate is `θ + δ`.
//!
//! Updates are transactional: all work happens on a copy of the state that
//! replaces the current one only when the update succeeds.

use std::collections::{BTreeMap, BTreeSet};

use nalgebra::DVector;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::core::graph::{FactorGraph, FactorId};
use crate::core::linear::JacobianFactor;
use crate::core::variable::{Key, Values, VectorValues};
use crate::error::{PlannerError, PlannerResult};
use crate::factors::{Factor, NonlinearFactor, PriorFactor};

pub mod bayes_tree;

pub use bayes_tree::{BayesTree, Clique, CliqueId, GaussianConditional};

#[derive(Debug, Clone)]
pub struct IncrementalConfig {
    /// Relinearize a variable once `‖δ‖∞` exceeds this
    pub relinearize_threshold: f64,
    /// Stop descending into a subtree when no separator delta moved by more than this
    pub wildfire_threshold: f64,
    /// Standard deviation of the prior that holds a fixed variable
    pub fix_sigma: f64,
    /// Upper bound on the relinearize-and-update rounds of [`IncrementalOptimizer::optimize`]
    pub max_optimize_iterations: usize,
    /// [`IncrementalOptimizer::optimize`] stops once `‖δ‖∞` falls below this
    pub optimize_tolerance: f64,
}

impl Default for IncrementalConfig {
    fn default() -> Self {
        Self {
            relinearize_threshold: 0.1,
            wildfire_threshold: 1e-3,
            fix_sigma: 1e-4,
            max_optimize_iterations: 20,
            optimize_tolerance: 1e-6,
        }
    }
}

impl IncrementalConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_relinearize_threshold(mut self, threshold: f64) -> Self {
        self.relinearize_threshold = threshold;
        self
    }

    pub fn with_wildfire_threshold(mut self, threshold: f64) -> Self {
        self.wildfire_threshold = threshold;
        self
    }

    pub fn with_fix_sigma(mut self, sigma: f64) -> Self {
        self.fix_sigma = sigma;
        self
    }

    pub fn with_max_optimize_iterations(mut self, iterations: usize) -> Self {
        self.max_optimize_iterations = iterations;
        self
    }

    pub fn with_optimize_tolerance(mut self, tolerance: f64) -> Self {
        self.optimize_tolerance = tolerance;
        self
    }

    pub fn validate(&self) -> PlannerResult<()> {
        for (name, value) in [
            ("relinearize_threshold", self.relinearize_threshold),
            ("wildfire_threshold", self.wildfire_threshold),
            ("optimize_tolerance", self.optimize_tolerance),
        ] {
            if value.is_nan() || value < 0.0 {
                return Err(PlannerError::InvalidInput(format!(
                    "{name} must be non-negative, got {value}"
                )));
            }
        }
        if self.fix_sigma.is_nan() || self.fix_sigma <= 0.0 {
            return Err(PlannerError::InvalidInput(format!(
                "fix_sigma must be positive, got {}",
                self.fix_sigma
            )));
        }
        Ok(())
    }
}

/// Statistics of one incremental update
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateResult {
    /// Cliques built by re-elimination
    pub cliques_recomputed: usize,
    /// Cliques in the tree after the update
    pub cliques_total: usize,
    pub factors_relinearized: usize,
    pub variables_relinearized: usize,
    /// Cliques whose conditionals were solved during back-substitution
    pub cliques_back_substituted: usize,
    /// Ids assigned to the new factors, in the order they were given
    pub new_factor_ids: Vec<FactorId>,
}

#[derive(Debug, Clone, Default)]
struct State {
    graph: FactorGraph,
    theta: Values,
    delta: VectorValues,
    linear: BTreeMap<FactorId, JacobianFactor>,
    tree: BayesTree,
}

#[derive(Debug, Clone, Default)]
pub struct IncrementalOptimizer {
    config: IncrementalConfig,
    state: State,
    staged_fixes: BTreeMap<Key, (DVector<f64>, f64)>,
}

impl IncrementalOptimizer {
    pub fn new(config: IncrementalConfig) -> PlannerResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            ..Default::default()
        })
    }

    pub fn config(&self) -> &IncrementalConfig {
        &self.config
    }

    pub fn graph(&self) -> &FactorGraph {
        &self.state.graph
    }

    pub fn bayes_tree(&self) -> &BayesTree {
        &self.state.tree
    }

    /// Current linearization point
    pub fn linearization_point(&self) -> &Values {
        &self.state.theta
    }

    /// Add initial guesses for new variables. Existing keys are rejected.
    pub fn insert_values(&mut self, values: &Values) -> PlannerResult<()> {
        self.state.theta.insert_all(values)
    }

    /// Hold `key` at `value` from the next update on.
    ///
    /// The variable is set to `value`, its delta is forced to zero and a prior
    /// with `fix_sigma` pins it, so no later update moves it.
    pub fn fix_variable(&mut self, key: Key, value: DVector<f64>) -> PlannerResult<()> {
        self.fix_variable_with_sigma(key, value, self.config.fix_sigma)
    }

    /// [`Self::fix_variable`] with an explicit standard deviation for the pinning prior
    pub fn fix_variable_with_sigma(
        &mut self,
        key: Key,
        value: DVector<f64>,
        sigma: f64,
    ) -> PlannerResult<()> {
        if !(sigma > 0.0 && sigma.is_finite()) {
            return Err(PlannerError::InvalidInput(format!(
                "fix sigma must be positive, got {sigma}"
            )));
        }
        let dim = self
            .state
            .theta
            .dim(&key)
            .map_err(|_| PlannerError::InvalidState(format!("cannot fix unknown variable {key}")))?;
        if value.len() != dim {
            return Err(PlannerError::InvalidInput(format!(
                "fixed value for {key} has dimension {}, expected {dim}",
                value.len()
            )));
        }
        self.staged_fixes.insert(key, (value, sigma));
        Ok(())
    }

    /// Current estimate `θ + δ`
    pub fn estimate(&self) -> PlannerResult<Values> {
        self.state.theta.retract(&self.state.delta)
    }

    /// Add `new_factors`, remove `removed_factors`, apply staged fixes and
    /// refresh the estimate.
    pub fn update(
        &mut self,
        new_factors: Vec<Factor>,
        removed_factors: &[FactorId],
    ) -> PlannerResult<UpdateResult> {
        self.validate_edits(&new_factors, removed_factors)?;

        let mut state = self.state.clone();
        let result = state.apply(
            &self.config,
            new_factors,
            removed_factors,
            &self.staged_fixes,
            self.config.relinearize_threshold,
        )?;

        self.state = state;
        self.staged_fixes.clear();
        info!(
            recomputed = result.cliques_recomputed,
            total = result.cliques_total,
            relinearized_factors = result.factors_relinearized,
            relinearized_variables = result.variables_relinearized,
            back_substituted = result.cliques_back_substituted,
            "incremental update"
        );
        Ok(result)
    }

    /// Relinearize every variable with a non-negligible delta and update,
    /// until the largest delta falls below `optimize_tolerance`.
    pub fn optimize(&mut self) -> PlannerResult<Values> {
        for round in 0..self.config.max_optimize_iterations {
            let largest = self.largest_delta();
            if largest < self.config.optimize_tolerance {
                debug!(round, largest, "incremental estimate settled");
                break;
            }
            let mut state = self.state.clone();
            state.apply(
                &self.config,
                Vec::new(),
                &[],
                &BTreeMap::new(),
                self.config.optimize_tolerance,
            )?;
            self.state = state;
        }
        self.estimate()
    }

    fn largest_delta(&self) -> f64 {
        self.state
            .delta
            .values()
            .map(|d| d.amax())
            .fold(0.0, f64::max)
    }

    /// Reject edits that reference factors or variables that do not exist
    fn validate_edits(&self, new_factors: &[Factor], removed: &[FactorId]) -> PlannerResult<()> {
        let mut seen = BTreeSet::new();
        for id in removed {
            if !self.state.graph.contains(*id) {
                return Err(PlannerError::InvalidState(format!(
                    "cannot remove unknown factor {id}"
                )));
            }
            if !seen.insert(*id) {
                return Err(PlannerError::InvalidState(format!(
                    "factor {id} removed twice"
                )));
            }
        }
        for factor in new_factors {
            if let Some(key) = factor.keys().iter().find(|k| !self.state.theta.contains(k)) {
                return Err(PlannerError::InvalidState(format!(
                    "{factor} references unknown variable {key}"
                )));
            }
        }
        Ok(())
    }
}

impl State {
    fn apply(
        &mut self,
        config: &IncrementalConfig,
        new_factors: Vec<Factor>,
        removed_factors: &[FactorId],
        fixes: &BTreeMap<Key, (DVector<f64>, f64)>,
        relinearize_threshold: f64,
    ) -> PlannerResult<UpdateResult> {
        let mut marked: BTreeSet<Key> = BTreeSet::new();
        let mut to_linearize: BTreeSet<FactorId> = BTreeSet::new();

        for id in removed_factors {
            let factor = self.graph.remove_factor(*id)?;
            self.linear.remove(id);
            marked.extend(factor.keys().iter().copied());
        }

        let mut result = UpdateResult::default();
        for factor in new_factors {
            marked.extend(factor.keys().iter().copied());
            let id = self.graph.add_factor(factor);
            to_linearize.insert(id);
            result.new_factor_ids.push(id);
        }

        // A fixed variable jumps to its value and becomes a constant everywhere
        // except in the prior that holds it.
        let mut moved: BTreeSet<Key> = BTreeSet::new();
        for (key, (value, sigma)) in fixes {
            if let Some(previous) = self.graph.unpin(key) {
                self.graph.remove_factor(previous)?;
                self.linear.remove(&previous);
            }
            self.theta.update(*key, value.clone())?;
            self.delta.insert(*key, DVector::zeros(value.len()));
            let prior = PriorFactor::isotropic(*key, value.clone(), *sigma)?;
            let id = self.graph.add_factor(prior);
            self.graph.pin(*key, id)?;
            to_linearize.insert(id);
            moved.insert(*key);
        }

        // Fluid relinearization
        let relinearized: Vec<(Key, DVector<f64>)> = self
            .delta
            .iter()
            .filter(|(key, d)| !self.graph.is_pinned(key) && d.amax() > relinearize_threshold)
            .map(|(key, d)| (*key, d.clone()))
            .collect();
        for (key, d) in &relinearized {
            let value = self.theta.at(key)? + d;
            self.theta.update(*key, value)?;
            self.delta.insert(*key, DVector::zeros(d.len()));
            moved.insert(*key);
        }
        result.variables_relinearized = relinearized.len();

        if !moved.is_empty() {
            to_linearize.extend(self.graph.factors_touching(&moved));
        }
        let ids: Vec<FactorId> = to_linearize.into_iter().collect();
        let linearized = ids
            .par_iter()
            .map(|id| self.graph.linearize_factor(*id, &self.theta).map(|f| (*id, f)))
            .collect::<PlannerResult<Vec<_>>>()?;
        result.factors_relinearized = linearized.len();
        for (id, factor) in linearized {
            marked.extend(factor.keys().iter().copied());
            self.linear.insert(id, factor);
        }

        let mut detached = self.tree.detach_top(&marked);
        detached.keys.extend(marked.iter().copied());

        // Variables left without any factor drop out of the problem.
        let constrained = self.graph.keys();
        detached.keys.retain(|key| constrained.contains(key));
        self.delta.retain(|key, _| constrained.contains(key));

        let top_factors: Vec<JacobianFactor> = self
            .linear
            .values()
            .filter(|f| f.keys().iter().all(|k| detached.keys.contains(k)))
            .cloned()
            .collect();
        let top = self
            .tree
            .eliminate_top(&detached.keys, top_factors, &detached.orphans)?;

        for key in &detached.keys {
            if !self.delta.contains_key(key) {
                let dim = self.theta.dim(key)?;
                self.delta.insert(*key, DVector::zeros(dim));
            }
        }
        let pinned = self.graph.pinned_keys();
        result.cliques_back_substituted = self.tree.back_substitute(
            &top,
            &mut self.delta,
            &pinned,
            config.wildfire_threshold,
        )?;

        result.cliques_recomputed = top.len();
        result.cliques_total = self.tree.len();
        debug!(
            marked = marked.len(),
            orphans = detached.orphans.len(),
            removed_cliques = detached.removed,
            "re-eliminated top of the Bayes tree"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factors::{GaussianProcessModel, GaussianProcessPriorFactor};
    use crate::optimizer::{OptimizerConfig, optimize};
    use nalgebra::dvector;

    const STEPS: usize = 6;

    fn chain(steps: usize) -> (Vec<Factor>, Values) {
        let model = GaussianProcessModel::isotropic(1, 1.0).unwrap();
        let mut factors: Vec<Factor> = vec![
            PriorFactor::isotropic(Key::conf(0), dvector![0.0], 1e-3).unwrap().into(),
            PriorFactor::isotropic(Key::vel(0), dvector![0.0], 1e-3).unwrap().into(),
            PriorFactor::isotropic(Key::conf(steps), dvector![1.0], 1e-3).unwrap().into(),
            PriorFactor::isotropic(Key::vel(steps), dvector![0.0], 1e-3).unwrap().into(),
        ];
        for i in 0..steps {
            factors.push(
                GaussianProcessPriorFactor::new(
                    Key::conf(i),
                    Key::vel(i),
                    Key::conf(i + 1),
                    Key::vel(i + 1),
                    0.5,
                    &model,
                )
                .unwrap()
                .into(),
            );
        }
        let values = (0..=steps)
            .flat_map(|i| [(Key::conf(i), dvector![0.0]), (Key::vel(i), dvector![0.0])])
            .collect();
        (factors, values)
    }

    fn first_update() -> (IncrementalOptimizer, UpdateResult) {
        let (factors, values) = chain(STEPS);
        let mut isam = IncrementalOptimizer::new(IncrementalConfig::default()).unwrap();
        isam.insert_values(&values).unwrap();
        let result = isam.update(factors, &[]).unwrap();
        (isam, result)
    }

    /// Optimizer whose deltas have been folded into the linearization point
    fn initialized() -> (IncrementalOptimizer, UpdateResult) {
        let (mut isam, result) = first_update();
        isam.optimize().unwrap();
        (isam, result)
    }

    fn batch_solution(factors: Vec<Factor>, values: &Values) -> Values {
        let mut graph = FactorGraph::new();
        for factor in factors {
            graph.add_factor(factor);
        }
        optimize(&graph, values, &OptimizerConfig::default())
            .unwrap()
            .values
    }

    fn assert_close(a: &Values, b: &Values, tolerance: f64) {
        for (key, value) in b.iter() {
            let other = a.at(key).unwrap();
            assert!((other - value).amax() < tolerance, "{key}: {other} vs {value}");
        }
    }

    #[test]
    fn test_first_update_matches_batch() {
        let (isam, result) = first_update();
        assert_eq!(result.new_factor_ids.len(), 4 + STEPS);
        assert_eq!(result.cliques_recomputed, result.cliques_total);
        assert_eq!(result.cliques_total, STEPS);

        let (factors, values) = chain(STEPS);
        assert_close(&isam.estimate().unwrap(), &batch_solution(factors, &values), 1e-6);
    }

    #[test]
    fn test_goal_change_only_touches_the_end() {
        let (mut isam, first) = initialized();
        let goal_conf = first.new_factor_ids[2];
        let goal_vel = first.new_factor_ids[3];
        let new_goal: Vec<Factor> = vec![
            PriorFactor::isotropic(Key::conf(STEPS), dvector![2.0], 1e-3).unwrap().into(),
            PriorFactor::isotropic(Key::vel(STEPS), dvector![0.0], 1e-3).unwrap().into(),
        ];
        let result = isam.update(new_goal, &[goal_conf, goal_vel]).unwrap();
        assert_eq!(result.cliques_recomputed, 1);
        assert!(result.cliques_recomputed < result.cliques_total);

        let goal = isam.estimate().unwrap().at(&Key::conf(STEPS)).unwrap()[0];
        assert!((goal - 2.0).abs() < 1e-3);
    }

    #[test]
    fn test_fixed_variable_never_moves() {
        let (mut isam, first) = initialized();
        let fixed = isam.estimate().unwrap().at(&Key::conf(3)).unwrap().clone();
        isam.fix_variable(Key::conf(3), fixed.clone()).unwrap();
        isam.fix_variable(Key::vel(3), dvector![0.7]).unwrap();

        let new_goal: Vec<Factor> =
            vec![PriorFactor::isotropic(Key::conf(STEPS), dvector![-1.0], 1e-3).unwrap().into()];
        isam.update(new_goal, &[first.new_factor_ids[2]]).unwrap();

        let estimate = isam.estimate().unwrap();
        assert_eq!(estimate.at(&Key::conf(3)).unwrap(), &fixed);
        assert_eq!(estimate.at(&Key::vel(3)).unwrap(), &dvector![0.7]);
        assert!(isam.graph().is_pinned(&Key::conf(3)));

        // Further updates keep the value exactly
        isam.update(Vec::new(), &[]).unwrap();
        isam.optimize().unwrap();
        let estimate = isam.estimate().unwrap();
        assert_eq!(estimate.at(&Key::conf(3)).unwrap(), &fixed);
        assert_eq!(estimate.at(&Key::vel(3)).unwrap(), &dvector![0.7]);
    }

    #[test]
    fn test_bogus_factor_id_leaves_estimate_untouched() {
        let (mut isam, _) = initialized();
        let before = isam.estimate().unwrap();
        let extra: Vec<Factor> =
            vec![PriorFactor::isotropic(Key::conf(2), dvector![5.0], 1e-3).unwrap().into()];
        assert!(matches!(
            isam.update(extra, &[FactorId(999)]),
            Err(PlannerError::InvalidState(_))
        ));
        assert_eq!(isam.estimate().unwrap(), before);
        assert_eq!(isam.graph().len(), 4 + STEPS);
    }

    #[test]
    fn test_unknown_variable_is_rejected() {
        let (mut isam, _) = initialized();
        let stray: Vec<Factor> =
            vec![PriorFactor::isotropic(Key::conf(STEPS + 1), dvector![0.0], 1.0).unwrap().into()];
        assert!(matches!(isam.update(stray, &[]), Err(PlannerError::InvalidState(_))));
        assert!(matches!(
            isam.fix_variable(Key::vel(STEPS + 1), dvector![0.0]),
            Err(PlannerError::InvalidState(_))
        ));
        assert!(matches!(
            isam.insert_values(&[(Key::conf(0), dvector![0.0])].into_iter().collect()),
            Err(PlannerError::InvalidState(_))
        ));
    }

    #[test]
    fn test_singular_update_is_rolled_back() {
        let (mut isam, first) = initialized();
        let before = isam.estimate().unwrap();
        // Without start and goal priors the chain has two free directions.
        let result = isam.update(Vec::new(), &first.new_factor_ids[0..4]);
        assert!(matches!(result, Err(PlannerError::SingularSystem(_))));
        assert_eq!(isam.estimate().unwrap(), before);
        assert_eq!(isam.graph().len(), 4 + STEPS);
    }

    #[test]
    fn test_optimize_settles_deltas() {
        let (isam, _) = initialized();
        assert!(isam.largest_delta() < isam.config().optimize_tolerance);
        let (factors, values) = chain(STEPS);
        assert_close(&isam.estimate().unwrap(), &batch_solution(factors, &values), 1e-6);
    }

    #[test]
    fn test_config_validation() {
        assert!(IncrementalConfig::default().validate().is_ok());
        assert!(IncrementalConfig::new().with_fix_sigma(0.0).validate().is_err());
        assert!(
            IncrementalOptimizer::new(IncrementalConfig::new().with_wildfire_threshold(-1.0))
                .is_err()
        );
    }
}
