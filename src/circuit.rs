//! Linear circuit solve for the pack netlist.
//!
//! Modified nodal analysis with node 0 as reference. For n non-ground nodes
//! and m voltage sources the (n+m) x (n+m) system is
//!
//! ```text
//! [ G  B ] [ v ]   [ i ]
//! [ B' 0 ] [ j ] = [ e ]
//! ```
//!
//! - **Resistor** R between nodes a,b: G(a,a) += 1/R, G(b,b) += 1/R,
//!   G(a,b) -= 1/R, G(b,a) -= 1/R
//! - **Voltage source** k from node1 (+) to node2: B(node1,k) = 1,
//!   B(node2,k) = -1, e(k) = value
//! - **Current source** I from node1 to node2: i(node1) -= I, i(node2) += I
//!
//! `j(k)` is the current entering the positive terminal of source k, so a
//! discharging cell has negative `j`.

use faer::prelude::*;
use faer::sparse::{SparseColMat, Triplet};

use crate::error::{PackError, Result};
use crate::netlist::{ElementKind, Netlist};
use crate::sparse::CsrMatrix;

/// Relative residual above which a solution is rejected as ill-conditioned.
const RESIDUAL_TOL: f64 = 1e-8;

#[derive(Debug, Clone, PartialEq)]
pub struct CircuitSolution {
    /// Voltage per node id; index 0 is ground.
    pub node_voltages: Vec<f64>,
    /// Current entering the positive terminal of each voltage source, in
    /// netlist order.
    pub source_currents: Vec<f64>,
}

impl CircuitSolution {
    /// Per-cell applied current, positive on discharge.
    pub fn cell_currents(&self) -> Vec<f64> {
        self.source_currents.iter().map(|j| -j).collect()
    }

    pub fn voltage(&self, node: usize) -> f64 {
        self.node_voltages.get(node).copied().unwrap_or(0.0)
    }
}

/// Assembled MNA system for one netlist state.
#[derive(Debug)]
pub struct MnaSystem {
    pub matrix: CsrMatrix,
    pub rhs: Vec<f64>,
    pub n_nodes: usize,
    pub n_sources: usize,
}

/// Stamp the netlist into an MNA system.
pub fn assemble(netlist: &Netlist) -> Result<MnaSystem> {
    let n_nodes = netlist.node_count().saturating_sub(1);
    let n_sources = netlist
        .elements
        .iter()
        .filter(|e| e.kind == ElementKind::VoltageSource)
        .count();
    let size = n_nodes + n_sources;

    let mut triplets: Vec<(usize, usize, f64)> = Vec::with_capacity(4 * netlist.elements.len());
    let mut rhs = vec![0.0; size];
    let index = |node: usize| node.checked_sub(1);

    let mut source_k = 0usize;
    for e in &netlist.elements {
        if !e.value.is_finite() {
            return Err(PackError::Circuit(format!(
                "element {} has non-finite value {}",
                e.desc, e.value
            )));
        }
        match e.kind {
            ElementKind::Resistor | ElementKind::InternalResistance => {
                if e.value == 0.0 {
                    return Err(PackError::Circuit(format!(
                        "resistor {} has zero resistance",
                        e.desc
                    )));
                }
                let g = 1.0 / e.value;
                let (a, b) = (index(e.node1), index(e.node2));
                if let Some(a) = a {
                    triplets.push((a, a, g));
                }
                if let Some(b) = b {
                    triplets.push((b, b, g));
                }
                if let (Some(a), Some(b)) = (a, b) {
                    triplets.push((a, b, -g));
                    triplets.push((b, a, -g));
                }
            }
            ElementKind::VoltageSource => {
                let row = n_nodes + source_k;
                if let Some(a) = index(e.node1) {
                    triplets.push((a, row, 1.0));
                    triplets.push((row, a, 1.0));
                }
                if let Some(b) = index(e.node2) {
                    triplets.push((b, row, -1.0));
                    triplets.push((row, b, -1.0));
                }
                rhs[row] = e.value;
                source_k += 1;
            }
            ElementKind::CurrentSource => {
                if let Some(a) = index(e.node1) {
                    rhs[a] -= e.value;
                }
                if let Some(b) = index(e.node2) {
                    rhs[b] += e.value;
                }
            }
        }
    }

    Ok(MnaSystem {
        matrix: CsrMatrix::from_triplets(size, size, &triplets),
        rhs,
        n_nodes,
        n_sources,
    })
}

/// Solve the netlist for node voltages and voltage-source currents.
pub fn solve_circuit(netlist: &Netlist) -> Result<CircuitSolution> {
    let system = assemble(netlist)?;
    let x = solve_sparse_lu(&system.matrix, &system.rhs)?;
    check_residual(&system, &x)?;

    let mut node_voltages = Vec::with_capacity(system.n_nodes + 1);
    node_voltages.push(0.0);
    node_voltages.extend_from_slice(&x[..system.n_nodes]);
    let source_currents = x[system.n_nodes..].to_vec();

    Ok(CircuitSolution {
        node_voltages,
        source_currents,
    })
}

fn solve_sparse_lu(a: &CsrMatrix, b: &[f64]) -> Result<Vec<f64>> {
    let n = a.nrows;
    if a.ncols != n || b.len() != n {
        return Err(PackError::Circuit(format!(
            "dimension mismatch: matrix is {}x{}, rhs length is {}",
            a.nrows,
            a.ncols,
            b.len()
        )));
    }
    if n == 0 {
        return Ok(Vec::new());
    }

    let triplets: Vec<Triplet<usize, usize, f64>> = a
        .entries()
        .map(|(row, col, val)| Triplet::new(row, col, val))
        .collect();

    let a_sp = SparseColMat::<usize, f64>::try_new_from_triplets(n, n, &triplets)
        .map_err(|e| PackError::Circuit(format!("sparse matrix build failed: {e:?}")))?;

    let lu = a_sp
        .sp_lu()
        .map_err(|e| PackError::Circuit(format!("sparse LU factorization failed: {e:?}")))?;

    let rhs = faer::Mat::<f64>::from_fn(n, 1, |i, _| b[i]);
    let x = lu.solve(rhs);

    let mut out = vec![0.0; n];
    for (i, slot) in out.iter_mut().enumerate() {
        let xi = x[(i, 0)];
        if !xi.is_finite() {
            return Err(PackError::Circuit(
                "circuit solve produced NaN/Inf (floating node or singular netlist?)".into(),
            ));
        }
        *slot = xi;
    }
    Ok(out)
}

fn check_residual(system: &MnaSystem, x: &[f64]) -> Result<()> {
    let ax = system.matrix.spmv(x);
    let inf_norm = |v: &[f64]| v.iter().fold(0.0f64, |m, a| m.max(a.abs()));
    let a_norm = (0..system.matrix.nrows)
        .map(|row| {
            (system.matrix.row_pointers[row]..system.matrix.row_pointers[row + 1])
                .map(|idx| system.matrix.values[idx].abs())
                .sum::<f64>()
        })
        .fold(0.0f64, f64::max);
    let residual: Vec<f64> = ax.iter().zip(&system.rhs).map(|(l, r)| l - r).collect();
    let scale = a_norm * inf_norm(x) + inf_norm(&system.rhs);
    if inf_norm(&residual) > RESIDUAL_TOL * scale.max(1.0) {
        return Err(PackError::Circuit(format!(
            "circuit solve residual {:.3e} exceeds tolerance (singular netlist?)",
            inf_norm(&residual)
        )));
    }
    Ok(())
}
