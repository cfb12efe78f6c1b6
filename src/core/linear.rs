//! Linearized (Gaussian) factors and the assembled batch linear system.
//!
//! A [`JacobianFactor`] stores the whitened linearization of one nonlinear
//! factor, `‖Σ_j A_j δ_j − b‖²` with `b = −W r`. The batch optimizers work on a
//! [`LinearSystem`], which pairs a list of Jacobian factors with a column
//! ordering over the variables.

use std::collections::{BTreeMap, HashMap};

use nalgebra::{DMatrix, DVector};

use crate::core::variable::{Key, VectorValues};
use crate::error::{PlannerError, PlannerResult};

/// Whitened linear factor over a set of keys
#[derive(Debug, Clone, PartialEq)]
pub struct JacobianFactor {
    keys: Vec<Key>,
    blocks: Vec<DMatrix<f64>>,
    rhs: DVector<f64>,
}

impl JacobianFactor {
    /// Build a factor; every block must have `rhs.len()` rows.
    pub fn new(keys: Vec<Key>, blocks: Vec<DMatrix<f64>>, rhs: DVector<f64>) -> PlannerResult<Self> {
        if keys.len() != blocks.len() {
            return Err(PlannerError::InvalidInput(format!(
                "{} keys but {} Jacobian blocks",
                keys.len(),
                blocks.len()
            )));
        }
        if let Some((key, block)) = keys
            .iter()
            .zip(&blocks)
            .find(|(_, block)| block.nrows() != rhs.len())
        {
            return Err(PlannerError::InvalidInput(format!(
                "Jacobian block for {key} has {} rows, expected {}",
                block.nrows(),
                rhs.len()
            )));
        }
        Ok(Self { keys, blocks, rhs })
    }

    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    pub fn blocks(&self) -> &[DMatrix<f64>] {
        &self.blocks
    }

    pub fn block(&self, position: usize) -> &DMatrix<f64> {
        &self.blocks[position]
    }

    pub fn rhs(&self) -> &DVector<f64> {
        &self.rhs
    }

    pub fn rows(&self) -> usize {
        self.rhs.len()
    }

    /// Zero the Jacobian block of `key`, turning it into a constant for this factor.
    pub fn zero_block(&mut self, key: &Key) {
        for (k, block) in self.keys.iter().zip(self.blocks.iter_mut()) {
            if k == key {
                block.fill(0.0);
            }
        }
    }

    /// `Σ_j A_j δ_j` for the given per-key deltas (missing keys count as zero)
    pub fn multiply(&self, delta: &VectorValues) -> DVector<f64> {
        let mut result = DVector::zeros(self.rows());
        for (key, block) in self.keys.iter().zip(&self.blocks) {
            if let Some(d) = delta.get(key) {
                result += block * d;
            }
        }
        result
    }

    /// `0.5 * ‖A δ − b‖²`
    pub fn error(&self, delta: &VectorValues) -> f64 {
        0.5 * (self.multiply(delta) - &self.rhs).norm_squared()
    }
}

/// Column layout of the batch system: each key owns a contiguous range
#[derive(Debug, Clone, Default)]
pub struct Ordering {
    keys: Vec<Key>,
    offsets: HashMap<Key, (usize, usize)>,
    dimension: usize,
}

impl Ordering {
    /// Lay out `keys` in the given order with their dimensions
    pub fn new(keys_and_dims: impl IntoIterator<Item = (Key, usize)>) -> Self {
        let mut ordering = Ordering::default();
        for (key, dim) in keys_and_dims {
            ordering.offsets.insert(key, (ordering.dimension, dim));
            ordering.keys.push(key);
            ordering.dimension += dim;
        }
        ordering
    }

    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    /// `(column offset, dimension)` of `key`
    pub fn slot(&self, key: &Key) -> Option<(usize, usize)> {
        self.offsets.get(key).copied()
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Split a stacked vector into per-key pieces
    pub fn split(&self, stacked: &DVector<f64>) -> VectorValues {
        self.keys
            .iter()
            .map(|key| {
                let (offset, dim) = self.offsets[key];
                (*key, stacked.rows(offset, dim).into_owned())
            })
            .collect()
    }

    /// Stack per-key pieces into one vector (missing keys are zero)
    pub fn stack(&self, values: &VectorValues) -> DVector<f64> {
        let mut stacked = DVector::zeros(self.dimension);
        for (key, value) in values {
            if let Some((offset, dim)) = self.slot(key) {
                stacked.rows_mut(offset, dim).copy_from(value);
            }
        }
        stacked
    }
}

/// Linearized graph with a column ordering, the input of every batch step
#[derive(Debug, Clone)]
pub struct LinearSystem {
    factors: Vec<JacobianFactor>,
    ordering: Ordering,
    rows: usize,
}

impl LinearSystem {
    pub fn new(factors: Vec<JacobianFactor>, ordering: Ordering) -> Self {
        let rows = factors.iter().map(JacobianFactor::rows).sum();
        Self {
            factors,
            ordering,
            rows,
        }
    }

    pub fn factors(&self) -> &[JacobianFactor] {
        &self.factors
    }

    pub fn ordering(&self) -> &Ordering {
        &self.ordering
    }

    /// Total number of whitened residual rows
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Total number of unknowns
    pub fn cols(&self) -> usize {
        self.ordering.dimension()
    }

    /// Current nonlinear error `0.5 * ‖b‖²`
    pub fn error(&self) -> f64 {
        self.factors
            .iter()
            .map(|f| 0.5 * f.rhs().norm_squared())
            .sum()
    }

    /// Coordinate entries of the stacked Jacobian `J` (row, col, value)
    pub fn jacobian_triplets(&self) -> Vec<(usize, usize, f64)> {
        let mut triplets = Vec::new();
        let mut row_offset = 0;
        for factor in &self.factors {
            for (key, block) in factor.keys().iter().zip(factor.blocks()) {
                if let Some((col_offset, _)) = self.ordering.slot(key) {
                    for c in 0..block.ncols() {
                        for r in 0..block.nrows() {
                            triplets.push((row_offset + r, col_offset + c, block[(r, c)]));
                        }
                    }
                }
            }
            row_offset += factor.rows();
        }
        triplets
    }

    /// Stacked right-hand side `b`
    pub fn stacked_rhs(&self) -> DVector<f64> {
        let mut rhs = DVector::zeros(self.rows);
        let mut row_offset = 0;
        for factor in &self.factors {
            rhs.rows_mut(row_offset, factor.rows()).copy_from(factor.rhs());
            row_offset += factor.rows();
        }
        rhs
    }

    /// Upper and lower entries of `JᵀJ` accumulated per block, plus `Jᵀb`.
    ///
    /// Every block pair of a factor contributes, including numerically zero
    /// ones, so the sparsity pattern only depends on the graph structure.
    pub fn normal_equations(&self) -> (BTreeMap<(usize, usize), f64>, DVector<f64>) {
        let mut hessian: BTreeMap<(usize, usize), f64> = BTreeMap::new();
        let mut gradient = DVector::zeros(self.cols());

        for factor in &self.factors {
            let slots: Vec<Option<(usize, usize)>> = factor
                .keys()
                .iter()
                .map(|key| self.ordering.slot(key))
                .collect();

            for (i, block_i) in factor.blocks().iter().enumerate() {
                let Some((col_i, dim_i)) = slots[i] else {
                    continue;
                };
                let atb = block_i.transpose() * factor.rhs();
                let mut segment = gradient.rows_mut(col_i, dim_i);
                segment += atb;

                for (j, block_j) in factor.blocks().iter().enumerate() {
                    let Some((col_j, _)) = slots[j] else {
                        continue;
                    };
                    let product = block_i.transpose() * block_j;
                    for c in 0..product.ncols() {
                        for r in 0..product.nrows() {
                            *hessian.entry((col_i + r, col_j + c)).or_insert(0.0) +=
                                product[(r, c)];
                        }
                    }
                }
            }
        }

        (hessian, gradient)
    }

    /// `Jᵀ b` (the negative gradient of the error)
    pub fn jtb(&self) -> DVector<f64> {
        let mut result = DVector::zeros(self.cols());
        for factor in &self.factors {
            for (key, block) in factor.keys().iter().zip(factor.blocks()) {
                if let Some((offset, dim)) = self.ordering.slot(key) {
                    let mut segment = result.rows_mut(offset, dim);
                    segment += block.transpose() * factor.rhs();
                }
            }
        }
        result
    }

    /// `‖J h‖²` for a stacked step `h`
    pub fn jacobian_norm_squared(&self, step: &DVector<f64>) -> f64 {
        let split = self.ordering.split(step);
        self.factors
            .iter()
            .map(|f| f.multiply(&split).norm_squared())
            .sum()
    }

    /// Linear model decrease `L(0) − L(h) = hᵀJᵀb − 0.5‖Jh‖²`
    pub fn model_decrease(&self, step: &DVector<f64>) -> f64 {
        step.dot(&self.jtb()) - 0.5 * self.jacobian_norm_squared(step)
    }
}
