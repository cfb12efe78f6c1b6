//! Bayes tree over the linearized trajectory graph.
//!
//! Cliques live in an arena (`Vec<Option<Clique>>` plus a free list) and refer
//! to each other by [`CliqueId`], so detaching the top of the tree and
//! re-attaching orphaned subtrees never moves a clique in memory. Each clique
//! stores the Gaussian conditional `R δ_F + S δ_S = d` over its frontal keys
//! and the marginal factor on its separator that it passed to its parent; the
//! marginal is reused verbatim when the clique survives as an orphan.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use nalgebra::{DMatrix, DVector};

use crate::core::linear::JacobianFactor;
use crate::core::variable::{Key, VectorValues};
use crate::error::{PlannerError, PlannerResult};

/// Relative size below which a pivot of `R` counts as zero
const PIVOT_TOLERANCE: f64 = 1e-9;

/// Arena index of a clique
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CliqueId(pub usize);

impl fmt::Display for CliqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C{}", self.0)
    }
}

/// `R δ_F + S δ_S = d` with `R` upper triangular
#[derive(Debug, Clone)]
pub struct GaussianConditional {
    frontals: Vec<(Key, usize)>,
    separator: Vec<(Key, usize)>,
    r: DMatrix<f64>,
    s: DMatrix<f64>,
    d: DVector<f64>,
}

impl GaussianConditional {
    pub fn r(&self) -> &DMatrix<f64> {
        &self.r
    }

    pub fn s(&self) -> &DMatrix<f64> {
        &self.s
    }

    pub fn d(&self) -> &DVector<f64> {
        &self.d
    }

    /// Solve for the frontal deltas given the separator deltas in `delta`
    pub fn solve(&self, delta: &VectorValues) -> PlannerResult<Vec<(Key, DVector<f64>)>> {
        let mut rhs = self.d.clone();
        let mut offset = 0;
        for (key, dim) in &self.separator {
            let value = delta.get(key).ok_or_else(|| {
                PlannerError::InvalidState(format!("separator variable {key} has no delta"))
            })?;
            rhs -= self.s.columns(offset, *dim) * value;
            offset += dim;
        }

        let solution = self.r.solve_upper_triangular(&rhs).ok_or_else(|| {
            PlannerError::SingularSystem("conditional has a zero pivot".to_string())
        })?;

        let mut result = Vec::with_capacity(self.frontals.len());
        let mut offset = 0;
        for (key, dim) in &self.frontals {
            result.push((*key, solution.rows(offset, *dim).into_owned()));
            offset += dim;
        }
        Ok(result)
    }
}

#[derive(Debug, Clone)]
pub struct Clique {
    frontals: Vec<Key>,
    separator: Vec<Key>,
    conditional: GaussianConditional,
    marginal: Option<JacobianFactor>,
    parent: Option<CliqueId>,
    children: Vec<CliqueId>,
}

impl Clique {
    pub fn frontals(&self) -> &[Key] {
        &self.frontals
    }

    pub fn separator(&self) -> &[Key] {
        &self.separator
    }

    pub fn conditional(&self) -> &GaussianConditional {
        &self.conditional
    }

    /// Factor on the separator summarizing this clique's subtree
    pub fn marginal(&self) -> Option<&JacobianFactor> {
        self.marginal.as_ref()
    }

    pub fn parent(&self) -> Option<CliqueId> {
        self.parent
    }

    pub fn children(&self) -> &[CliqueId] {
        &self.children
    }
}

/// Result of detaching the part of the tree affected by an update
#[derive(Debug, Clone, Default)]
pub struct DetachedTop {
    /// Frontal keys of the removed cliques
    pub keys: BTreeSet<Key>,
    /// Surviving subtrees whose parent was removed
    pub orphans: Vec<CliqueId>,
    /// Number of cliques removed
    pub removed: usize,
}

/// Shape of a clique before its numeric elimination
struct CliquePlan {
    frontals: Vec<Key>,
    separator: Vec<Key>,
    parent: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct BayesTree {
    cliques: Vec<Option<Clique>>,
    free: Vec<usize>,
    key_to_clique: BTreeMap<Key, CliqueId>,
    roots: Vec<CliqueId>,
}

impl BayesTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live cliques
    pub fn len(&self) -> usize {
        self.cliques.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clique(&self, id: CliqueId) -> Option<&Clique> {
        self.cliques.get(id.0).and_then(|c| c.as_ref())
    }

    /// Clique holding `key` as a frontal variable
    pub fn clique_of(&self, key: &Key) -> Option<CliqueId> {
        self.key_to_clique.get(key).copied()
    }

    pub fn roots(&self) -> &[CliqueId] {
        &self.roots
    }

    pub fn contains_key(&self, key: &Key) -> bool {
        self.key_to_clique.contains_key(key)
    }

    /// Live cliques in arena order
    pub fn iter(&self) -> impl Iterator<Item = (CliqueId, &Clique)> {
        self.cliques
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.as_ref().map(|c| (CliqueId(i), c)))
    }

    fn clique_mut(&mut self, id: CliqueId) -> PlannerResult<&mut Clique> {
        self.cliques
            .get_mut(id.0)
            .and_then(|c| c.as_mut())
            .ok_or_else(|| PlannerError::InvalidState(format!("clique {id} does not exist")))
    }

    fn allocate(&mut self, clique: Clique) -> CliqueId {
        let frontals = clique.frontals.clone();
        let id = match self.free.pop() {
            Some(slot) => {
                self.cliques[slot] = Some(clique);
                CliqueId(slot)
            }
            None => {
                self.cliques.push(Some(clique));
                CliqueId(self.cliques.len() - 1)
            }
        };
        for key in frontals {
            self.key_to_clique.insert(key, id);
        }
        id
    }

    /// Remove every clique holding a marked key, together with its ancestors.
    ///
    /// Children of removed cliques that are not removed themselves become
    /// orphans: they stay in the arena with no parent until
    /// [`BayesTree::eliminate_top`] re-attaches them.
    pub fn detach_top(&mut self, marked: &BTreeSet<Key>) -> DetachedTop {
        let mut removed: BTreeSet<CliqueId> = BTreeSet::new();
        for key in marked {
            let mut current = self.clique_of(key);
            while let Some(id) = current {
                if !removed.insert(id) {
                    break;
                }
                current = self.clique(id).and_then(|c| c.parent);
            }
        }

        let mut detached = DetachedTop {
            removed: removed.len(),
            ..Default::default()
        };
        for id in &removed {
            let Some(clique) = self.cliques[id.0].take() else {
                continue;
            };
            self.free.push(id.0);
            for key in &clique.frontals {
                self.key_to_clique.remove(key);
                detached.keys.insert(*key);
            }
            detached
                .orphans
                .extend(clique.children.iter().filter(|c| !removed.contains(c)));
        }
        for orphan in &detached.orphans {
            if let Some(Some(clique)) = self.cliques.get_mut(orphan.0) {
                clique.parent = None;
            }
        }
        self.roots.retain(|r| !removed.contains(r));
        detached
    }

    /// Eliminate `keys` (in key order) from `factors` plus the cached marginals
    /// of `orphans`, build the new top cliques and re-attach the orphans.
    ///
    /// Returns the new cliques, parents after children.
    pub fn eliminate_top(
        &mut self,
        keys: &BTreeSet<Key>,
        factors: Vec<JacobianFactor>,
        orphans: &[CliqueId],
    ) -> PlannerResult<Vec<CliqueId>> {
        let mut factors = factors;
        for orphan in orphans {
            let clique = self
                .clique(*orphan)
                .ok_or_else(|| PlannerError::InvalidState(format!("orphan {orphan} does not exist")))?;
            if let Some(marginal) = &clique.marginal {
                factors.push(marginal.clone());
            }
        }

        let mut dims: BTreeMap<Key, usize> = BTreeMap::new();
        for factor in &factors {
            for (key, block) in factor.keys().iter().zip(factor.blocks()) {
                if !keys.contains(key) {
                    return Err(PlannerError::InvalidState(format!(
                        "factor on {key} reaches outside the eliminated variables"
                    )));
                }
                dims.insert(*key, block.ncols());
            }
        }

        let separators = symbolic_elimination(keys, &factors)?;
        let plans = build_cliques(keys, &separators)?;

        // Factors go to the clique of their earliest key; a clique's marginal
        // goes to its parent.
        let plan_of: BTreeMap<Key, usize> = plans
            .iter()
            .enumerate()
            .flat_map(|(i, p)| p.frontals.iter().map(move |k| (*k, i)))
            .collect();
        let mut assigned: Vec<Vec<JacobianFactor>> = vec![Vec::new(); plans.len()];
        for factor in factors {
            let Some(first) = factor.keys().iter().min() else {
                continue;
            };
            let Some(&plan) = plan_of.get(first) else {
                return Err(PlannerError::InvalidState(format!("variable {first} was not eliminated")));
            };
            assigned[plan].push(factor);
        }

        // Plans come sorted by first frontal, so every child precedes its parent.
        let mut ids: Vec<CliqueId> = Vec::with_capacity(plans.len());
        for (i, plan) in plans.iter().enumerate() {
            let gathered = std::mem::take(&mut assigned[i]);
            let (conditional, marginal) = eliminate_clique(plan, &gathered, &dims)?;
            if let (Some(parent), Some(marginal)) = (plan.parent, &marginal) {
                assigned[parent].push(marginal.clone());
            }
            let id = self.allocate(Clique {
                frontals: plan.frontals.clone(),
                separator: plan.separator.clone(),
                conditional,
                marginal,
                parent: None,
                children: Vec::new(),
            });
            ids.push(id);
        }

        for (i, plan) in plans.iter().enumerate() {
            match plan.parent {
                Some(parent) => {
                    let (child, parent) = (ids[i], ids[parent]);
                    self.clique_mut(child)?.parent = Some(parent);
                    self.clique_mut(parent)?.children.push(child);
                }
                None => self.roots.push(ids[i]),
            }
        }

        for orphan in orphans {
            let first = self
                .clique(*orphan)
                .and_then(|c| c.separator.first().copied())
                .ok_or_else(|| PlannerError::InvalidState(format!("orphan {orphan} has no separator")))?;
            let parent = self.clique_of(&first).ok_or_else(|| {
                PlannerError::InvalidState(format!("no clique holds separator variable {first}"))
            })?;
            self.clique_mut(*orphan)?.parent = Some(parent);
            self.clique_mut(parent)?.children.push(*orphan);
        }

        Ok(ids)
    }

    /// Solve the new `top` cliques root-first, then descend into the subtrees
    /// below them only where a separator delta moved by more than `wildfire`.
    /// Pinned keys are held at zero. Returns the number of cliques solved.
    pub fn back_substitute(
        &self,
        top: &[CliqueId],
        delta: &mut VectorValues,
        pinned: &BTreeSet<Key>,
        wildfire: f64,
    ) -> PlannerResult<usize> {
        let previous = delta.clone();
        let top_set: BTreeSet<CliqueId> = top.iter().copied().collect();
        let mut solved = 0;

        let solve = |id: CliqueId, delta: &mut VectorValues| -> PlannerResult<()> {
            let clique = self
                .clique(id)
                .ok_or_else(|| PlannerError::InvalidState(format!("clique {id} does not exist")))?;
            for (key, value) in clique.conditional.solve(delta)? {
                let value = if pinned.contains(&key) {
                    DVector::zeros(value.len())
                } else {
                    value
                };
                delta.insert(key, value);
            }
            Ok(())
        };

        let mut stack: Vec<CliqueId> = Vec::new();
        for id in top.iter().rev() {
            solve(*id, delta)?;
            solved += 1;
            if let Some(clique) = self.clique(*id) {
                stack.extend(clique.children.iter().filter(|c| !top_set.contains(c)));
            }
        }

        while let Some(id) = stack.pop() {
            let Some(clique) = self.clique(id) else {
                continue;
            };
            let moved = clique.separator.iter().any(|key| {
                match (delta.get(key), previous.get(key)) {
                    (Some(new), Some(old)) => (new - old).amax() > wildfire,
                    _ => true,
                }
            });
            if !moved {
                continue;
            }
            solve(id, delta)?;
            solved += 1;
            stack.extend(clique.children.iter().copied());
        }
        Ok(solved)
    }
}

/// Separator of every key under elimination in key order
fn symbolic_elimination(
    keys: &BTreeSet<Key>,
    factors: &[JacobianFactor],
) -> PlannerResult<BTreeMap<Key, BTreeSet<Key>>> {
    let mut pending: Vec<BTreeSet<Key>> = factors
        .iter()
        .map(|f| f.keys().iter().copied().collect())
        .collect();
    let mut separators = BTreeMap::new();

    for key in keys {
        let (involved, rest): (Vec<_>, Vec<_>) =
            pending.into_iter().partition(|set| set.contains(key));
        if involved.is_empty() {
            return Err(PlannerError::SingularSystem(format!(
                "variable {key} is not constrained by any factor"
            )));
        }
        pending = rest;
        let mut separator: BTreeSet<Key> = involved.into_iter().flatten().collect();
        separator.remove(key);
        if !separator.is_empty() {
            pending.push(separator.clone());
        }
        separators.insert(*key, separator);
    }
    Ok(separators)
}

/// Group keys into supernodal cliques, root first, then return them sorted by
/// first frontal with parent indices into the returned vector.
fn build_cliques(
    keys: &BTreeSet<Key>,
    separators: &BTreeMap<Key, BTreeSet<Key>>,
) -> PlannerResult<Vec<CliquePlan>> {
    let mut plans: Vec<CliquePlan> = Vec::new();
    let mut plan_of: BTreeMap<Key, usize> = BTreeMap::new();

    for key in keys.iter().rev() {
        let separator = separators
            .get(key)
            .ok_or_else(|| PlannerError::InvalidState(format!("variable {key} was not eliminated")))?;
        let Some(first) = separator.first() else {
            plan_of.insert(*key, plans.len());
            plans.push(CliquePlan {
                frontals: vec![*key],
                separator: Vec::new(),
                parent: None,
            });
            continue;
        };
        let parent = *plan_of
            .get(first)
            .ok_or_else(|| PlannerError::InvalidState(format!("variable {first} was not eliminated")))?;
        let parent_separator = separators.get(first).cloned().unwrap_or_default();
        let merges = plans[parent].frontals.first() == Some(first)
            && separator.len() == parent_separator.len() + 1
            && parent_separator.is_subset(separator);
        if merges {
            plans[parent].frontals.insert(0, *key);
            plan_of.insert(*key, parent);
        } else {
            plan_of.insert(*key, plans.len());
            plans.push(CliquePlan {
                frontals: vec![*key],
                separator: separator.iter().copied().collect(),
                parent: Some(parent),
            });
        }
    }

    // Re-index so that children come before parents
    let mut order: Vec<usize> = (0..plans.len()).collect();
    order.sort_by_key(|&i| plans[i].frontals[0]);
    let mut position = vec![0; plans.len()];
    for (new, &old) in order.iter().enumerate() {
        position[old] = new;
    }
    let mut slots: Vec<Option<CliquePlan>> = plans.into_iter().map(Some).collect();
    let mut sorted = Vec::with_capacity(slots.len());
    for &old in &order {
        if let Some(mut plan) = slots[old].take() {
            plan.parent = plan.parent.map(|p| position[p]);
            sorted.push(plan);
        }
    }
    Ok(sorted)
}

/// Dense QR of the factors gathered at one clique, producing its conditional
/// and the marginal factor on its separator.
fn eliminate_clique(
    plan: &CliquePlan,
    factors: &[JacobianFactor],
    dims: &BTreeMap<Key, usize>,
) -> PlannerResult<(GaussianConditional, Option<JacobianFactor>)> {
    let mut columns: BTreeMap<Key, (usize, usize)> = BTreeMap::new();
    let mut layout = |keys: &[Key], offset: &mut usize| -> PlannerResult<Vec<(Key, usize)>> {
        keys.iter()
            .map(|key| {
                let dim = *dims.get(key).ok_or_else(|| {
                    PlannerError::InvalidState(format!("variable {key} has unknown dimension"))
                })?;
                columns.insert(*key, (*offset, dim));
                *offset += dim;
                Ok((*key, dim))
            })
            .collect()
    };
    let mut n = 0;
    let frontals = layout(&plan.frontals, &mut n)?;
    let frontal_dim = n;
    let separator = layout(&plan.separator, &mut n)?;

    let m: usize = factors.iter().map(|f| f.rows()).sum();
    if m < frontal_dim {
        return Err(PlannerError::SingularSystem(format!(
            "clique on {} has {m} rows for {frontal_dim} unknowns",
            plan.frontals[0]
        )));
    }

    let mut augmented = DMatrix::zeros(m, n + 1);
    let mut row = 0;
    for factor in factors {
        let rows = factor.rows();
        for (key, block) in factor.keys().iter().zip(factor.blocks()) {
            let (col, dim) = columns.get(key).copied().ok_or_else(|| {
                PlannerError::InvalidState(format!("factor on {key} assigned to the wrong clique"))
            })?;
            let mut target = augmented.view_mut((row, col), (rows, dim));
            target += block;
        }
        augmented.view_mut((row, n), (rows, 1)).copy_from(factor.rhs());
        row += rows;
    }

    let upper = augmented.qr().r();
    let scale = (0..frontal_dim)
        .map(|i| upper[(i, i)].abs())
        .fold(1.0_f64, f64::max);
    if let Some(i) = (0..frontal_dim).find(|&i| upper[(i, i)].abs() <= PIVOT_TOLERANCE * scale) {
        let key = frontals
            .iter()
            .scan(0, |offset, (key, dim)| {
                *offset += dim;
                Some((*key, *offset))
            })
            .find(|(_, end)| i < *end)
            .map(|(key, _)| key)
            .unwrap_or(plan.frontals[0]);
        return Err(PlannerError::SingularSystem(format!(
            "variable {key} is not fully constrained"
        )));
    }

    let conditional = GaussianConditional {
        r: upper.view((0, 0), (frontal_dim, frontal_dim)).into_owned(),
        s: upper.view((0, frontal_dim), (frontal_dim, n - frontal_dim)).into_owned(),
        d: upper.view((0, n), (frontal_dim, 1)).column(0).into_owned(),
        frontals,
        separator: separator.clone(),
    };

    let marginal_rows = m.min(n).saturating_sub(frontal_dim);
    let marginal = if separator.is_empty() || marginal_rows == 0 {
        None
    } else {
        let mut blocks = Vec::with_capacity(separator.len());
        let mut col = frontal_dim;
        for (_, dim) in &separator {
            blocks.push(upper.view((frontal_dim, col), (marginal_rows, *dim)).into_owned());
            col += dim;
        }
        let rhs = upper.view((frontal_dim, n), (marginal_rows, 1)).column(0).into_owned();
        let keys = separator.iter().map(|(key, _)| *key).collect();
        Some(JacobianFactor::new(keys, blocks, rhs)?)
    };

    Ok((conditional, marginal))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::linear::{LinearSystem, Ordering};
    use nalgebra::{dmatrix, dvector};

    /// Chain over `x0 v0 .. x3 v3` shaped like a 1-dof trajectory graph
    fn chain_factors() -> Vec<JacobianFactor> {
        let mut factors = vec![
            JacobianFactor::new(vec![Key::conf(0)], vec![dmatrix![10.0]], dvector![0.5]).unwrap(),
            JacobianFactor::new(vec![Key::vel(0)], vec![dmatrix![10.0]], dvector![-0.2]).unwrap(),
            JacobianFactor::new(vec![Key::conf(3)], vec![dmatrix![10.0]], dvector![3.0]).unwrap(),
        ];
        for i in 0..3 {
            factors.push(
                JacobianFactor::new(
                    vec![Key::conf(i), Key::vel(i), Key::conf(i + 1), Key::vel(i + 1)],
                    vec![
                        dmatrix![-1.0; 0.0],
                        dmatrix![-0.5; -1.0],
                        dmatrix![1.0; 0.0],
                        dmatrix![0.0; 1.0],
                    ],
                    dvector![0.1 * i as f64, -0.3],
                )
                .unwrap(),
            );
        }
        factors
    }

    fn chain_keys() -> BTreeSet<Key> {
        (0..4).flat_map(|i| [Key::conf(i), Key::vel(i)]).collect()
    }

    fn dense_solution(factors: &[JacobianFactor]) -> VectorValues {
        let ordering = Ordering::new(chain_keys().into_iter().map(|k| (k, 1)));
        let system = LinearSystem::new(factors.to_vec(), ordering.clone());
        let mut j = DMatrix::zeros(system.rows(), system.cols());
        for (r, c, v) in system.jacobian_triplets() {
            j[(r, c)] += v;
        }
        let h = j.transpose() * &j;
        let step = h.cholesky().unwrap().solve(&(j.transpose() * system.stacked_rhs()));
        ordering.split(&step)
    }

    fn solve_all(tree: &mut BayesTree, factors: Vec<JacobianFactor>) -> VectorValues {
        let top = tree.eliminate_top(&chain_keys(), factors, &[]).unwrap();
        let mut delta = VectorValues::new();
        tree.back_substitute(&top, &mut delta, &BTreeSet::new(), 0.0)
            .unwrap();
        delta
    }

    #[test]
    fn test_chain_forms_one_clique_per_time_step() {
        let mut tree = BayesTree::new();
        solve_all(&mut tree, chain_factors());
        // The last two steps share the root clique: nothing follows them.
        assert_eq!(tree.len(), 3);
        for i in 0..2 {
            let id = tree.clique_of(&Key::conf(i)).unwrap();
            assert_eq!(tree.clique_of(&Key::vel(i)), Some(id));
            let clique = tree.clique(id).unwrap();
            assert_eq!(clique.frontals(), &[Key::conf(i), Key::vel(i)]);
            assert_eq!(clique.separator(), &[Key::conf(i + 1), Key::vel(i + 1)]);
        }
        assert_eq!(tree.roots().len(), 1);
        let root = tree.clique(tree.roots()[0]).unwrap();
        assert_eq!(
            root.frontals(),
            &[Key::conf(2), Key::vel(2), Key::conf(3), Key::vel(3)]
        );
        assert!(root.separator().is_empty());
        assert!(root.marginal().is_none());
    }

    #[test]
    fn test_back_substitution_matches_dense_solve() {
        let mut tree = BayesTree::new();
        let delta = solve_all(&mut tree, chain_factors());
        let expected = dense_solution(&chain_factors());
        for (key, value) in &expected {
            assert!((&delta[key] - value).norm() < 1e-9, "{key}");
        }
    }

    #[test]
    fn test_detach_removes_ancestors_and_keeps_orphans() {
        let mut tree = BayesTree::new();
        solve_all(&mut tree, chain_factors());
        let bottom = tree.clique_of(&Key::conf(0)).unwrap();

        let detached = tree.detach_top(&[Key::vel(1)].into_iter().collect());
        assert_eq!(detached.removed, 2);
        assert_eq!(detached.orphans, vec![bottom]);
        assert_eq!(
            detached.keys,
            (1..4).flat_map(|i| [Key::conf(i), Key::vel(i)]).collect()
        );
        assert_eq!(tree.len(), 1);
        assert!(tree.roots().is_empty());
        assert!(tree.clique(bottom).unwrap().parent().is_none());
    }

    #[test]
    fn test_partial_re_elimination_matches_full_solve() {
        let mut tree = BayesTree::new();
        let mut delta = solve_all(&mut tree, chain_factors());

        // Replace the prior on x3 and re-eliminate only the affected top
        let mut factors = chain_factors();
        factors[2] = JacobianFactor::new(vec![Key::conf(3)], vec![dmatrix![10.0]], dvector![-1.0]).unwrap();
        let detached = tree.detach_top(&[Key::conf(3)].into_iter().collect());
        assert_eq!(detached.removed, 1);
        let top_factors: Vec<JacobianFactor> = factors
            .iter()
            .filter(|f| f.keys().iter().all(|k| detached.keys.contains(k)))
            .cloned()
            .collect();
        let top = tree
            .eliminate_top(&detached.keys, top_factors, &detached.orphans)
            .unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(tree.len(), 3);

        let solved = tree
            .back_substitute(&top, &mut delta, &BTreeSet::new(), 0.0)
            .unwrap();
        assert_eq!(solved, 3);
        let expected = dense_solution(&factors);
        for (key, value) in &expected {
            assert!((&delta[key] - value).norm() < 1e-9, "{key}");
        }
    }

    #[test]
    fn test_wildfire_stops_at_unchanged_separators() {
        let mut tree = BayesTree::new();
        let mut delta = solve_all(&mut tree, chain_factors());
        let top = vec![tree.roots()[0]];
        let solved = tree
            .back_substitute(&top, &mut delta, &BTreeSet::new(), 1e-6)
            .unwrap();
        assert_eq!(solved, 1);
    }

    #[test]
    fn test_unconstrained_variable_is_singular() {
        let factors = vec![
            JacobianFactor::new(
                vec![Key::conf(0), Key::vel(0)],
                vec![dmatrix![1.0], dmatrix![0.0]],
                dvector![1.0],
            )
            .unwrap(),
            JacobianFactor::new(vec![Key::conf(0)], vec![dmatrix![1.0]], dvector![1.0]).unwrap(),
        ];
        let keys: BTreeSet<Key> = [Key::conf(0), Key::vel(0)].into_iter().collect();
        let mut tree = BayesTree::new();
        assert!(matches!(
            tree.eliminate_top(&keys, factors, &[]),
            Err(PlannerError::SingularSystem(_))
        ));
    }

    #[test]
    fn test_pinned_keys_keep_zero_delta() {
        let mut tree = BayesTree::new();
        let top = tree.eliminate_top(&chain_keys(), chain_factors(), &[]).unwrap();
        let mut delta = VectorValues::new();
        let pinned: BTreeSet<Key> = [Key::conf(1)].into_iter().collect();
        tree.back_substitute(&top, &mut delta, &pinned, 0.0).unwrap();
        assert_eq!(delta[&Key::conf(1)], dvector![0.0]);
    }
}
