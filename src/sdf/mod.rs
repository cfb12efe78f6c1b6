//! Planar signed distance field
//!
//! A [`PlanarSdf`] stores signed distances on a regular grid. Row index maps
//! to the y axis and column index to the x axis. Queries between cells are
//! bilinearly interpolated; queries outside the grid are rejected rather than
//! extrapolated.

use nalgebra::{DMatrix, Vector2};

use crate::error::{PlannerError, PlannerResult};

pub mod dataset;

pub use dataset::{DatasetProvider, OccupancyGrid};

/// Immutable signed distance field on a regular 2D grid
#[derive(Debug, Clone)]
pub struct PlanarSdf {
    origin: Vector2<f64>,
    cell_size: f64,
    field: DMatrix<f64>,
}

impl PlanarSdf {
    /// Create a field from its origin (world position of cell (0, 0)), cell size
    /// and a `rows x cols` matrix of signed distances.
    pub fn new(origin: Vector2<f64>, cell_size: f64, field: DMatrix<f64>) -> PlannerResult<Self> {
        if !(cell_size > 0.0 && cell_size.is_finite()) {
            return Err(PlannerError::InvalidInput(format!(
                "cell size must be positive, got {cell_size}"
            )));
        }
        if field.nrows() < 2 || field.ncols() < 2 {
            return Err(PlannerError::InvalidInput(format!(
                "signed distance field needs at least 2x2 cells, got {}x{}",
                field.nrows(),
                field.ncols()
            )));
        }
        if field.iter().any(|d| !d.is_finite()) {
            return Err(PlannerError::InvalidInput(
                "signed distance field contains non-finite values".to_string(),
            ));
        }
        Ok(Self {
            origin,
            cell_size,
            field,
        })
    }

    /// Build the field from a dataset provider.
    pub fn from_provider(provider: &dyn DatasetProvider) -> PlannerResult<Self> {
        let field = provider.sdf_grid();
        if field.nrows() != provider.rows() || field.ncols() != provider.cols() {
            return Err(PlannerError::InvalidInput(format!(
                "dataset reports {}x{} cells but its grid is {}x{}",
                provider.rows(),
                provider.cols(),
                field.nrows(),
                field.ncols()
            )));
        }
        Self::new(
            Vector2::new(provider.origin_x(), provider.origin_y()),
            provider.cell_size(),
            field,
        )
    }

    pub fn origin(&self) -> &Vector2<f64> {
        &self.origin
    }

    pub fn cell_size(&self) -> f64 {
        self.cell_size
    }

    pub fn rows(&self) -> usize {
        self.field.nrows()
    }

    pub fn cols(&self) -> usize {
        self.field.ncols()
    }

    pub fn field(&self) -> &DMatrix<f64> {
        &self.field
    }

    /// Signed distance at `point`
    pub fn distance(&self, point: &Vector2<f64>) -> PlannerResult<f64> {
        self.distance_and_gradient(point).map(|(d, _)| d)
    }

    /// Signed distance and its gradient (∂d/∂x, ∂d/∂y) at `point`
    pub fn distance_and_gradient(&self, point: &Vector2<f64>) -> PlannerResult<(f64, Vector2<f64>)> {
        let col = (point.x - self.origin.x) / self.cell_size;
        let row = (point.y - self.origin.y) / self.cell_size;

        let max_col = (self.cols() - 1) as f64;
        let max_row = (self.rows() - 1) as f64;
        if !(0.0..=max_col).contains(&col) || !(0.0..=max_row).contains(&row) {
            return Err(PlannerError::OutOfBounds {
                x: point.x,
                y: point.y,
            });
        }

        // The upper edge belongs to the last full cell.
        let lc = (col.floor() as usize).min(self.cols() - 2);
        let lr = (row.floor() as usize).min(self.rows() - 2);
        let (hc, hr) = (lc + 1, lr + 1);
        let fc = col - lc as f64;
        let fr = row - lr as f64;

        let f = &self.field;
        let (ll, lh, hl, hh) = (f[(lr, lc)], f[(lr, hc)], f[(hr, lc)], f[(hr, hc)]);

        let distance = (1.0 - fr) * (1.0 - fc) * ll
            + (1.0 - fr) * fc * lh
            + fr * (1.0 - fc) * hl
            + fr * fc * hh;

        let d_col = (1.0 - fr) * (lh - ll) + fr * (hh - hl);
        let d_row = (1.0 - fc) * (hl - ll) + fc * (hh - lh);

        Ok((
            distance,
            Vector2::new(d_col / self.cell_size, d_row / self.cell_size),
        ))
    }
}
