//! Occupancy-grid datasets and their signed distance transform
//!
//! The signed field is `dist(occupied) − dist(free)` in world units: positive
//! outside obstacles, negative inside. Distances come from an exact Euclidean
//! distance transform (Felzenszwalb and Huttenlocher, separable 1D passes).

use nalgebra::{DMatrix, Vector2};

use crate::error::{PlannerError, PlannerResult};

/// Value used for the whole field when the grid has no obstacle (or no free cell)
const EMPTY_FIELD_DISTANCE: f64 = 1000.0;

/// Large finite stand-in for "no feature" inside the 1D transform
const FAR: f64 = 1e20;

/// Source of a planar signed distance grid
pub trait DatasetProvider {
    fn rows(&self) -> usize;
    fn cols(&self) -> usize;
    fn cell_size(&self) -> f64;
    fn origin_x(&self) -> f64;
    fn origin_y(&self) -> f64;
    /// Signed distances, `rows x cols`, row index along y
    fn sdf_grid(&self) -> DMatrix<f64>;
}

/// Binary occupancy map that can generate its own signed distance field
#[derive(Debug, Clone)]
pub struct OccupancyGrid {
    rows: usize,
    cols: usize,
    cell_size: f64,
    origin: Vector2<f64>,
    occupied: Vec<bool>,
}

impl OccupancyGrid {
    /// Empty map of `rows x cols` cells
    pub fn new(rows: usize, cols: usize, cell_size: f64, origin: Vector2<f64>) -> PlannerResult<Self> {
        if rows < 2 || cols < 2 {
            return Err(PlannerError::InvalidInput(format!(
                "occupancy grid needs at least 2x2 cells, got {rows}x{cols}"
            )));
        }
        if !(cell_size > 0.0 && cell_size.is_finite()) {
            return Err(PlannerError::InvalidInput(format!(
                "cell size must be positive, got {cell_size}"
            )));
        }
        Ok(Self {
            rows,
            cols,
            cell_size,
            origin,
            occupied: vec![false; rows * cols],
        })
    }

    /// The single-box map used by the two-link arm demos: 300x300 cells of
    /// 1 cm with origin (-1, -1) and one 60x80-cell box centred at cell (190, 160).
    pub fn one_obstacle() -> Self {
        let mut grid = Self {
            rows: 300,
            cols: 300,
            cell_size: 0.01,
            origin: Vector2::new(-1.0, -1.0),
            occupied: vec![false; 300 * 300],
        };
        grid.add_box(190, 160, 60, 80);
        grid
    }

    pub fn is_occupied(&self, row: usize, col: usize) -> bool {
        row < self.rows && col < self.cols && self.occupied[row * self.cols + col]
    }

    pub fn set_occupied(&mut self, row: usize, col: usize) {
        if row < self.rows && col < self.cols {
            self.occupied[row * self.cols + col] = true;
        }
    }

    /// Mark a `height x width` block of cells centred at (`center_row`, `center_col`).
    /// Parts falling outside the map are clipped.
    pub fn add_box(&mut self, center_row: usize, center_col: usize, height: usize, width: usize) {
        let half_rows = height / 2;
        let half_cols = width / 2;
        let row_end = (center_row + half_rows).min(self.rows - 1);
        let col_end = (center_col + half_cols).min(self.cols - 1);
        for row in center_row.saturating_sub(half_rows)..=row_end {
            for col in center_col.saturating_sub(half_cols)..=col_end {
                self.set_occupied(row, col);
            }
        }
    }

    /// Mark every cell whose centre lies within `radius` of `center` (world units).
    pub fn add_circle(&mut self, center: Vector2<f64>, radius: f64) {
        for row in 0..self.rows {
            for col in 0..self.cols {
                let cell = self.cell_position(row, col);
                if (cell - center).norm() <= radius {
                    self.occupied[row * self.cols + col] = true;
                }
            }
        }
    }

    /// World position of a cell
    pub fn cell_position(&self, row: usize, col: usize) -> Vector2<f64> {
        Vector2::new(
            self.origin.x + col as f64 * self.cell_size,
            self.origin.y + row as f64 * self.cell_size,
        )
    }

    /// Signed distance field of the current map, in world units
    pub fn signed_distance_field(&self) -> DMatrix<f64> {
        let occupied_count = self.occupied.iter().filter(|&&o| o).count();
        if occupied_count == 0 {
            return DMatrix::from_element(self.rows, self.cols, EMPTY_FIELD_DISTANCE);
        }
        if occupied_count == self.occupied.len() {
            return DMatrix::from_element(self.rows, self.cols, -EMPTY_FIELD_DISTANCE);
        }

        let to_obstacle = euclidean_distance_transform(self.rows, self.cols, |r, c| {
            self.occupied[r * self.cols + c]
        });
        let to_free = euclidean_distance_transform(self.rows, self.cols, |r, c| {
            !self.occupied[r * self.cols + c]
        });
        (to_obstacle - to_free) * self.cell_size
    }
}

impl DatasetProvider for OccupancyGrid {
    fn rows(&self) -> usize {
        self.rows
    }

    fn cols(&self) -> usize {
        self.cols
    }

    fn cell_size(&self) -> f64 {
        self.cell_size
    }

    fn origin_x(&self) -> f64 {
        self.origin.x
    }

    fn origin_y(&self) -> f64 {
        self.origin.y
    }

    fn sdf_grid(&self) -> DMatrix<f64> {
        self.signed_distance_field()
    }
}

/// Distance in cells from every cell to the nearest cell where `is_feature` holds
fn euclidean_distance_transform(
    rows: usize,
    cols: usize,
    is_feature: impl Fn(usize, usize) -> bool,
) -> DMatrix<f64> {
    let mut squared =
        DMatrix::from_fn(rows, cols, |r, c| if is_feature(r, c) { 0.0 } else { FAR });

    let mut buffer = vec![0.0; rows.max(cols)];
    for c in 0..cols {
        for r in 0..rows {
            buffer[r] = squared[(r, c)];
        }
        let transformed = squared_distance_1d(&buffer[..rows]);
        for r in 0..rows {
            squared[(r, c)] = transformed[r];
        }
    }
    for r in 0..rows {
        for c in 0..cols {
            buffer[c] = squared[(r, c)];
        }
        let transformed = squared_distance_1d(&buffer[..cols]);
        for c in 0..cols {
            squared[(r, c)] = transformed[c];
        }
    }

    squared.map(f64::sqrt)
}

/// Lower envelope of parabolas rooted at each sample
fn squared_distance_1d(f: &[f64]) -> Vec<f64> {
    let n = f.len();
    let mut distances = vec![0.0; n];
    if n == 0 {
        return distances;
    }

    let mut vertices = vec![0usize; n];
    let mut boundaries = vec![0.0f64; n + 1];
    let mut k = 0usize;
    boundaries[0] = f64::NEG_INFINITY;
    boundaries[1] = f64::INFINITY;

    let intersection = |q: usize, p: usize| {
        let (qf, pf) = (q as f64, p as f64);
        ((f[q] + qf * qf) - (f[p] + pf * pf)) / (2.0 * qf - 2.0 * pf)
    };

    for q in 1..n {
        let mut s = intersection(q, vertices[k]);
        while s <= boundaries[k] {
            k -= 1;
            s = intersection(q, vertices[k]);
        }
        k += 1;
        vertices[k] = q;
        boundaries[k] = s;
        boundaries[k + 1] = f64::INFINITY;
    }

    k = 0;
    for (q, distance) in distances.iter_mut().enumerate() {
        while boundaries[k + 1] < q as f64 {
            k += 1;
        }
        let offset = q as f64 - vertices[k] as f64;
        *distance = offset * offset + f[vertices[k]];
    }
    distances
}
