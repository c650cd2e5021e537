//! Compressed Sparse Row (CSR) matrix for the pack MNA system.
//!
//! Pack netlists are large but very sparse (each cell touches at most three
//! nodes), so the circuit solver stamps into triplets and compresses once per
//! solve.

/// Real-valued sparse matrix in Compressed Sparse Row format.
#[derive(Debug, Clone)]
pub struct CsrMatrix {
    pub nrows: usize,
    pub ncols: usize,
    /// Non-zero values, stored row by row.
    pub values: Vec<f64>,
    /// Column index for each non-zero value.
    pub col_indices: Vec<usize>,
    /// `row_pointers[i]..row_pointers[i + 1]` spans row i.
    pub row_pointers: Vec<usize>,
}

impl CsrMatrix {
    pub fn new(nrows: usize, ncols: usize) -> Self {
        Self {
            nrows,
            ncols,
            values: Vec::new(),
            col_indices: Vec::new(),
            row_pointers: vec![0; nrows + 1],
        }
    }

    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Build from (row, col, value) triplets. Duplicates are summed, which is
    /// what MNA stamping relies on.
    pub fn from_triplets(nrows: usize, ncols: usize, triplets: &[(usize, usize, f64)]) -> Self {
        if triplets.is_empty() {
            return Self::new(nrows, ncols);
        }

        let mut order: Vec<usize> = (0..triplets.len()).collect();
        order.sort_by_key(|&i| (triplets[i].0, triplets[i].1));

        let mut values = Vec::with_capacity(triplets.len());
        let mut col_indices = Vec::with_capacity(triplets.len());
        let mut row_pointers = vec![0usize; nrows + 1];

        let (mut cur_row, mut cur_col, mut cur_val) = triplets[order[0]];
        for &idx in &order[1..] {
            let (row, col, val) = triplets[idx];
            if row == cur_row && col == cur_col {
                cur_val += val;
                continue;
            }
            values.push(cur_val);
            col_indices.push(cur_col);
            row_pointers[cur_row + 1] += 1;
            (cur_row, cur_col, cur_val) = (row, col, val);
        }
        values.push(cur_val);
        col_indices.push(cur_col);
        row_pointers[cur_row + 1] += 1;

        for i in 1..=nrows {
            row_pointers[i] += row_pointers[i - 1];
        }

        Self {
            nrows,
            ncols,
            values,
            col_indices,
            row_pointers,
        }
    }

    /// Iterate the stored entries as (row, col, value).
    pub fn entries(&self) -> impl Iterator<Item = (usize, usize, f64)> + '_ {
        (0..self.nrows).flat_map(move |row| {
            (self.row_pointers[row]..self.row_pointers[row + 1])
                .map(move |idx| (row, self.col_indices[idx], self.values[idx]))
        })
    }

    /// y = A * x
    pub fn spmv(&self, x: &[f64]) -> Vec<f64> {
        assert_eq!(x.len(), self.ncols, "spmv dimension mismatch");
        let mut y = vec![0.0; self.nrows];
        for (row, col, val) in self.entries() {
            y[row] += val * x[col];
        }
        y
    }

    /// Dense copy, row-major. Small matrices only.
    pub fn to_dense(&self) -> Vec<Vec<f64>> {
        let mut dense = vec![vec![0.0; self.ncols]; self.nrows];
        for (row, col, val) in self.entries() {
            dense[row][col] = val;
        }
        dense
    }
}
