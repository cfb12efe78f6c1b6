//! Nonlinear factor graph over trajectory variables
//!
//! Factors are stored under monotonically increasing [`FactorId`]s that are
//! never reused, so incremental edits can refer to factors by id across
//! updates. A key can be *pinned* by one prior factor: the key then behaves as
//! a constant in every other factor's linearization.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use rayon::prelude::*;
use tracing::debug;

use crate::core::linear::{JacobianFactor, LinearSystem, Ordering};
use crate::core::variable::{Key, Values};
use crate::error::{PlannerError, PlannerResult};
use crate::factors::{Factor, NonlinearFactor};

/// Stable identifier of a factor inside a [`FactorGraph`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FactorId(pub usize);

impl fmt::Display for FactorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f{}", self.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct FactorGraph {
    factors: BTreeMap<FactorId, Factor>,
    next_id: usize,
    pinned: HashMap<Key, FactorId>,
}

impl FactorGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a factor and return its id
    pub fn add_factor(&mut self, factor: impl Into<Factor>) -> FactorId {
        let id = FactorId(self.next_id);
        self.next_id += 1;
        self.factors.insert(id, factor.into());
        id
    }

    /// Remove a factor. Unpins any key the factor was pinning.
    pub fn remove_factor(&mut self, id: FactorId) -> PlannerResult<Factor> {
        let factor = self
            .factors
            .remove(&id)
            .ok_or_else(|| PlannerError::InvalidState(format!("factor {id} does not exist")))?;
        self.pinned.retain(|_, pinning| *pinning != id);
        Ok(factor)
    }

    pub fn factor(&self, id: FactorId) -> Option<&Factor> {
        self.factors.get(&id)
    }

    pub fn contains(&self, id: FactorId) -> bool {
        self.factors.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.factors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (FactorId, &Factor)> {
        self.factors.iter().map(|(id, f)| (*id, f))
    }

    /// Every key referenced by at least one factor, in elimination order
    pub fn keys(&self) -> BTreeSet<Key> {
        self.factors
            .values()
            .flat_map(|f| f.keys().iter().copied())
            .collect()
    }

    /// Ids of the factors that reference any of `keys`
    pub fn factors_touching(&self, keys: &BTreeSet<Key>) -> Vec<FactorId> {
        self.factors
            .iter()
            .filter(|(_, f)| f.keys().iter().any(|k| keys.contains(k)))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Make `key` a constant, held by the prior factor `factor_id`
    pub fn pin(&mut self, key: Key, factor_id: FactorId) -> PlannerResult<()> {
        match self.factors.get(&factor_id) {
            Some(factor) if factor.prior_key() == Some(key) => {
                self.pinned.insert(key, factor_id);
                Ok(())
            }
            Some(factor) => Err(PlannerError::InvalidInput(format!(
                "{factor} cannot pin {key}: only a prior on that key can"
            ))),
            None => Err(PlannerError::InvalidState(format!(
                "factor {factor_id} does not exist"
            ))),
        }
    }

    pub fn unpin(&mut self, key: &Key) -> Option<FactorId> {
        self.pinned.remove(key)
    }

    pub fn is_pinned(&self, key: &Key) -> bool {
        self.pinned.contains_key(key)
    }

    /// Prior factor currently pinning `key`
    pub fn pinning_factor(&self, key: &Key) -> Option<FactorId> {
        self.pinned.get(key).copied()
    }

    pub fn pinned_keys(&self) -> BTreeSet<Key> {
        self.pinned.keys().copied().collect()
    }

    /// Check that every referenced key has a value
    pub fn validate(&self, values: &Values) -> PlannerResult<()> {
        for (id, factor) in &self.factors {
            if let Some(key) = factor.keys().iter().find(|k| !values.contains(k)) {
                return Err(PlannerError::InvalidState(format!(
                    "factor {id} references missing variable {key}"
                )));
            }
        }
        Ok(())
    }

    /// Total error `Σ 0.5 ‖W r‖²`
    pub fn error(&self, values: &Values) -> PlannerResult<f64> {
        self.validate(values)?;
        // Summed in id order so repeated evaluations are bit-identical.
        let errors = self
            .factors
            .par_iter()
            .map(|(_, factor)| factor.error(values))
            .collect::<PlannerResult<Vec<f64>>>()?;
        Ok(errors.iter().sum())
    }

    /// Linearize one factor, treating pinned keys as constants
    pub fn linearize_factor(&self, id: FactorId, values: &Values) -> PlannerResult<JacobianFactor> {
        let factor = self
            .factors
            .get(&id)
            .ok_or_else(|| PlannerError::InvalidState(format!("factor {id} does not exist")))?;
        self.linearize_with_pins(id, factor, values)
    }

    fn linearize_with_pins(
        &self,
        id: FactorId,
        factor: &Factor,
        values: &Values,
    ) -> PlannerResult<JacobianFactor> {
        let mut linear = factor.linearize(values)?;
        for key in factor.keys() {
            match self.pinned.get(key) {
                Some(pinning) if *pinning != id => linear.zero_block(key),
                _ => {}
            }
        }
        Ok(linear)
    }

    /// Linearize the whole graph around `values` with keys in elimination order
    pub fn linearize(&self, values: &Values) -> PlannerResult<LinearSystem> {
        self.validate(values)?;

        let keys = self.keys();
        let mut layout = Vec::with_capacity(keys.len());
        for key in keys {
            layout.push((key, values.dim(&key)?));
        }
        let ordering = Ordering::new(layout);

        let entries: Vec<(&FactorId, &Factor)> = self.factors.iter().collect();
        let linear = entries
            .par_iter()
            .map(|(id, factor)| self.linearize_with_pins(**id, factor, values))
            .collect::<PlannerResult<Vec<_>>>()?;

        debug!(
            factors = linear.len(),
            variables = ordering.keys().len(),
            "linearized factor graph"
        );
        Ok(LinearSystem::new(linear, ordering))
    }
}
