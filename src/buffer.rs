//! Result storage owned by the orchestrator.
//!
//! [`Grid`] is a dense `[step][cell]` array; [`OutputBuffer`] holds one grid
//! per output variable (`[variable][step][cell]`). Both are preallocated for
//! the full protocol and truncated when the run stops early.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::{PackError, Result};

/// Dense row-major `[step][cell]` array.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl Grid {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    /// Build from equal-length rows.
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self> {
        let cols = rows.first().map_or(0, Vec::len);
        if let Some(bad) = rows.iter().position(|r| r.len() != cols) {
            return Err(PackError::Config(format!(
                "row {bad} has {} values, expected {cols}",
                rows[bad].len()
            )));
        }
        Ok(Self {
            rows: rows.len(),
            cols,
            data: rows.concat(),
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.cols + col]
    }

    pub fn row(&self, row: usize) -> &[f64] {
        &self.data[row * self.cols..(row + 1) * self.cols]
    }

    pub fn row_mut(&mut self, row: usize) -> &mut [f64] {
        &mut self.data[row * self.cols..(row + 1) * self.cols]
    }

    /// One cell's time series.
    pub fn column(&self, col: usize) -> Vec<f64> {
        (0..self.rows).map(|r| self.get(r, col)).collect()
    }

    /// Keep the first `rows` rows.
    pub fn truncate(&mut self, rows: usize) {
        if rows < self.rows {
            self.rows = rows;
            self.data.truncate(rows * self.cols);
        }
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }
}

/// Latest outputs of one worker, `[variable][cell]` over its own cells.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellOutputs {
    n_vars: usize,
    n_cells: usize,
    values: Vec<f64>,
}

impl CellOutputs {
    pub fn zeros(n_vars: usize, n_cells: usize) -> Self {
        Self {
            n_vars,
            n_cells,
            values: vec![0.0; n_vars * n_cells],
        }
    }

    pub fn n_vars(&self) -> usize {
        self.n_vars
    }

    pub fn n_cells(&self) -> usize {
        self.n_cells
    }

    pub fn get(&self, var: usize, cell: usize) -> f64 {
        self.values[var * self.n_cells + cell]
    }

    pub fn variable(&self, var: usize) -> &[f64] {
        &self.values[var * self.n_cells..(var + 1) * self.n_cells]
    }

    pub fn variable_mut(&mut self, var: usize) -> &mut [f64] {
        &mut self.values[var * self.n_cells..(var + 1) * self.n_cells]
    }
}

/// `[variable][step][cell]` store for every requested output variable.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputBuffer {
    names: Vec<String>,
    grids: Vec<Grid>,
}

impl OutputBuffer {
    pub fn new(names: Vec<String>, steps: usize, cells: usize) -> Self {
        let grids = names.iter().map(|_| Grid::zeros(steps, cells)).collect();
        Self { names, grids }
    }

    pub fn variable(&self, var: usize) -> &Grid {
        &self.grids[var]
    }

    /// Copy one worker's outputs into `cells` of row `step`.
    pub fn write_cells(
        &mut self,
        step: usize,
        cells: Range<usize>,
        outputs: &CellOutputs,
    ) -> Result<()> {
        if outputs.n_vars() != self.grids.len() || outputs.n_cells() != cells.len() {
            return Err(PackError::Config(format!(
                "worker output shape {}x{} does not match {} variables x {} cells",
                outputs.n_vars(),
                outputs.n_cells(),
                self.grids.len(),
                cells.len()
            )));
        }
        for (var, grid) in self.grids.iter_mut().enumerate() {
            if step >= grid.rows() || cells.end > grid.cols() {
                return Err(PackError::Config(format!(
                    "output write at step {step}, cells {cells:?} is out of bounds"
                )));
            }
            grid.row_mut(step)[cells.clone()].copy_from_slice(outputs.variable(var));
        }
        Ok(())
    }

    pub fn truncate(&mut self, steps: usize) {
        for grid in &mut self.grids {
            grid.truncate(steps);
        }
    }

    pub fn into_series(self) -> Vec<(String, Grid)> {
        self.names.into_iter().zip(self.grids).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_cells_places_slice() {
        let mut buffer = OutputBuffer::new(vec!["a".into(), "b".into()], 3, 4);
        let mut out = CellOutputs::zeros(2, 2);
        out.variable_mut(0).copy_from_slice(&[1.0, 2.0]);
        out.variable_mut(1).copy_from_slice(&[3.0, 4.0]);
        buffer.write_cells(1, 2..4, &out).unwrap();
        assert_eq!(buffer.variable(0).row(1), &[0.0, 0.0, 1.0, 2.0]);
        assert_eq!(buffer.variable(1).row(1), &[0.0, 0.0, 3.0, 4.0]);
        assert!(buffer.variable(0).row(0).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_write_cells_shape_mismatch() {
        let mut buffer = OutputBuffer::new(vec!["a".into()], 2, 4);
        let out = CellOutputs::zeros(1, 3);
        assert!(buffer.write_cells(0, 0..2, &out).is_err());
        assert!(buffer.write_cells(5, 0..3, &out).is_err());
    }

    #[test]
    fn test_from_rows_rejects_ragged_input() {
        let grid = Grid::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        assert_eq!(grid.row(1), &[3.0, 4.0]);
        assert!(matches!(
            Grid::from_rows(&[vec![1.0, 2.0], vec![3.0]]),
            Err(PackError::Config(_))
        ));
        assert_eq!(Grid::from_rows(&[]).unwrap().rows(), 0);
    }

    #[test]
    fn test_truncate_drops_rows() {
        let mut grid = Grid::zeros(10, 2);
        grid.row_mut(6).copy_from_slice(&[1.0, 2.0]);
        grid.truncate(7);
        assert_eq!(grid.rows(), 7);
        assert_eq!(grid.as_slice().len(), 14);
        assert_eq!(grid.column(1)[6], 2.0);
    }
}
