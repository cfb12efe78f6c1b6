//! Variable keys and value containers for trajectory factor graphs.
//!
//! Every variable in a trajectory graph is either the configuration or the
//! velocity of a knot point, identified by its time index. Keys sort by time
//! index first and configuration before velocity, which is the elimination
//! ordering used by the incremental optimizer.

use std::collections::BTreeMap;
use std::fmt;

use nalgebra::DVector;

use crate::error::{PlannerError, PlannerResult};

/// Semantic tag of a variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum VariableKind {
    /// Joint configuration `x`
    Configuration,
    /// Joint velocity `v`
    Velocity,
}

impl VariableKind {
    /// Single-character symbol used when printing keys
    pub fn symbol(&self) -> char {
        match self {
            VariableKind::Configuration => 'x',
            VariableKind::Velocity => 'v',
        }
    }
}

/// Unique variable identifier: type tag plus time index
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key {
    /// Knot index along the trajectory
    pub index: usize,
    /// Configuration or velocity
    pub kind: VariableKind,
}

impl Key {
    pub fn new(kind: VariableKind, index: usize) -> Self {
        Self { index, kind }
    }

    /// Configuration key `x{index}`
    pub fn conf(index: usize) -> Self {
        Self::new(VariableKind::Configuration, index)
    }

    /// Velocity key `v{index}`
    pub fn vel(index: usize) -> Self {
        Self::new(VariableKind::Velocity, index)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind.symbol(), self.index)
    }
}

/// Per-key tangent vectors (all variables are Euclidean)
pub type VectorValues = BTreeMap<Key, DVector<f64>>;

/// Ordered mapping from variable key to its current value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Values {
    values: BTreeMap<Key, DVector<f64>>,
}

impl Values {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new variable. Fails if the key is already present.
    pub fn insert(&mut self, key: Key, value: DVector<f64>) -> PlannerResult<()> {
        if self.values.contains_key(&key) {
            return Err(PlannerError::InvalidState(format!(
                "variable {key} already exists"
            )));
        }
        self.values.insert(key, value);
        Ok(())
    }

    /// Replace the value of an existing variable, keeping its dimension.
    pub fn update(&mut self, key: Key, value: DVector<f64>) -> PlannerResult<()> {
        match self.values.get_mut(&key) {
            Some(current) if current.len() == value.len() => {
                *current = value;
                Ok(())
            }
            Some(current) => Err(PlannerError::InvalidInput(format!(
                "variable {key} has dimension {}, got {}",
                current.len(),
                value.len()
            ))),
            None => Err(PlannerError::InvalidState(format!(
                "variable {key} does not exist"
            ))),
        }
    }

    /// Value of `key`, or `InvalidState` if it was never inserted
    pub fn at(&self, key: &Key) -> PlannerResult<&DVector<f64>> {
        self.values
            .get(key)
            .ok_or_else(|| PlannerError::InvalidState(format!("variable {key} does not exist")))
    }

    pub fn get(&self, key: &Key) -> Option<&DVector<f64>> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.values.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Key, &DVector<f64>)> {
        self.values.iter()
    }

    /// Dimension of the variable stored under `key`
    pub fn dim(&self, key: &Key) -> PlannerResult<usize> {
        self.at(key).map(|v| v.len())
    }

    /// Apply a per-key update `x ← x + δ`. Keys absent from `delta` are kept.
    pub fn retract(&self, delta: &VectorValues) -> PlannerResult<Values> {
        let mut result = self.clone();
        for (key, step) in delta {
            let value = result
                .values
                .get_mut(key)
                .ok_or_else(|| PlannerError::InvalidState(format!("variable {key} does not exist")))?;
            if value.len() != step.len() {
                return Err(PlannerError::InvalidInput(format!(
                    "update for {key} has dimension {}, expected {}",
                    step.len(),
                    value.len()
                )));
            }
            *value += step;
        }
        Ok(result)
    }

    /// Merge `other` into `self`, failing on any duplicate key before mutating.
    pub fn insert_all(&mut self, other: &Values) -> PlannerResult<()> {
        if let Some(key) = other.keys().find(|k| self.contains(k)) {
            return Err(PlannerError::InvalidState(format!(
                "variable {key} already exists"
            )));
        }
        for (key, value) in other.iter() {
            self.values.insert(*key, value.clone());
        }
        Ok(())
    }
}

impl FromIterator<(Key, DVector<f64>)> for Values {
    fn from_iter<T: IntoIterator<Item = (Key, DVector<f64>)>>(iter: T) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for Values {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Values with {} variables:", self.values.len())?;
        for (key, value) in &self.values {
            let entries: Vec<String> = value.iter().map(|v| format!("{v:.6}")).collect();
            writeln!(f, "  {key}: [{}]", entries.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::dvector;

    #[test]
    fn test_key_ordering_is_time_major() {
        let mut keys = vec![Key::vel(1), Key::conf(2), Key::vel(0), Key::conf(1), Key::conf(0)];
        keys.sort();
        assert_eq!(
            keys,
            vec![Key::conf(0), Key::vel(0), Key::conf(1), Key::vel(1), Key::conf(2)]
        );
    }

    #[test]
    fn test_key_display() {
        assert_eq!(Key::conf(5).to_string(), "x5");
        assert_eq!(Key::vel(12).to_string(), "v12");
    }

    #[test]
    fn test_insert_duplicate_fails() {
        let mut values = Values::new();
        values.insert(Key::conf(0), dvector![0.0, 0.0]).unwrap();
        assert!(matches!(
            values.insert(Key::conf(0), dvector![1.0, 1.0]),
            Err(PlannerError::InvalidState(_))
        ));
        assert_eq!(values.at(&Key::conf(0)).unwrap(), &dvector![0.0, 0.0]);
    }

    #[test]
    fn test_update_missing_key_fails() {
        let mut values = Values::new();
        assert!(matches!(
            values.update(Key::vel(3), dvector![1.0]),
            Err(PlannerError::InvalidState(_))
        ));
    }

    #[test]
    fn test_retract_adds_delta() {
        let mut values = Values::new();
        values.insert(Key::conf(0), dvector![1.0, 2.0]).unwrap();
        values.insert(Key::vel(0), dvector![0.5, 0.5]).unwrap();

        let mut delta = VectorValues::new();
        delta.insert(Key::conf(0), dvector![0.25, -0.5]);

        let result = values.retract(&delta).unwrap();
        assert_eq!(result.at(&Key::conf(0)).unwrap(), &dvector![1.25, 1.5]);
        assert_eq!(result.at(&Key::vel(0)).unwrap(), &dvector![0.5, 0.5]);
    }

    #[test]
    fn test_insert_all_is_atomic() {
        let mut values: Values = [(Key::conf(0), dvector![0.0])].into_iter().collect();
        let other: Values = [(Key::conf(1), dvector![1.0]), (Key::conf(0), dvector![2.0])]
            .into_iter()
            .collect();

        assert!(values.insert_all(&other).is_err());
        assert_eq!(values.len(), 1);
    }
}
