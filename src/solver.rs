//! Pack solver: the co-simulation step loop.
//!
//! Each step the cells are advanced under the currents of the last circuit
//! solve, their terminal voltage and OCV are folded back into the netlist as
//! source values and internal resistances, and the circuit is solved again
//! for the next step's currents.
//!
//! ```text
//! Idle -> Initializing -> Stepping -> Finalizing -> Done
//!              \______________\___________\______-> Failed
//! ```

use std::sync::Arc;
use std::time::Instant;

use crate::buffer::{Grid, OutputBuffer};
use crate::cell::{output_variable_names, CellModelFactory, FiredEvent, ModelSpec};
use crate::circuit::solve_circuit;
use crate::error::{PackError, Result};
use crate::netlist::{Netlist, NetlistMap};
use crate::parameters::ParameterValues;
use crate::pool::{PoolSetup, WorkerPool};
use crate::protocol::Protocol;
use crate::stats::SolveStats;

pub const TIME: &str = "Time [s]";
pub const PACK_CURRENT: &str = "Pack current [A]";
pub const PACK_TERMINAL_VOLTAGE: &str = "Pack terminal voltage [V]";
pub const CELL_CURRENT: &str = "Cell current [A]";

/// Below this applied current (A) the resistance estimate is meaningless.
pub const CURRENT_THRESHOLD: f64 = 1e-6;
/// Internal resistance (Ohm) used for cells carrying no current.
pub const RESISTANCE_FLOOR: f64 = 1e-12;

pub const DEFAULT_HTC: f64 = 10.0;
pub const DEFAULT_INITIAL_SOC: f64 = 0.5;

/// Internal resistance seen by the circuit for one cell.
pub fn internal_resistance(ocv: f64, terminal_voltage: f64, current: f64) -> f64 {
    if current.abs() < CURRENT_THRESHOLD {
        RESISTANCE_FLOOR
    } else {
        (ocv - terminal_voltage) / current
    }
}

/// One heat transfer coefficient per cell. A single value applies to every
/// cell.
pub fn broadcast_htc(htc: &[f64], cell_count: usize) -> Result<Vec<f64>> {
    match htc {
        [h] => Ok(vec![*h; cell_count]),
        h if h.len() == cell_count => Ok(h.to_vec()),
        h => Err(PackError::Config(format!(
            "{} heat transfer coefficients given for {cell_count} cells",
            h.len()
        ))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveState {
    Idle,
    Initializing,
    Stepping,
    Finalizing,
    Done,
    Failed,
}

/// Why the step loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// Every protocol step ran.
    Completed,
    /// Some cells fell below the lower voltage cut-off at `step`.
    LowerCutoff { step: usize, cells: Vec<usize> },
    /// Some cells rose above the upper voltage cut-off at `step`.
    UpperCutoff { step: usize, cells: Vec<usize> },
    /// A failure stopped the loop before `step` was recorded.
    Aborted { step: usize },
}

/// A named result series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Series<'a> {
    /// One value per step.
    Scalar(&'a [f64]),
    /// `[step][cell]`.
    PerCell(&'a Grid),
}

/// Result of a pack solve. Every series holds one row per completed step.
#[derive(Debug, Clone)]
pub struct PackSolution {
    pub time: Vec<f64>,
    pub pack_current: Vec<f64>,
    pub pack_terminal_voltage: Vec<f64>,
    pub cell_current: Grid,
    /// Requested output variables, terminal voltage and measured OCV first.
    pub variables: Vec<(String, Grid)>,
    /// Cell events by step, with pack-wide cell indices.
    pub events: Vec<(usize, FiredEvent)>,
    pub termination: Termination,
    pub stats: SolveStats,
}

impl PackSolution {
    pub fn steps(&self) -> usize {
        self.time.len()
    }

    pub fn keys(&self) -> Vec<&str> {
        let mut keys = vec![TIME, PACK_CURRENT, PACK_TERMINAL_VOLTAGE, CELL_CURRENT];
        keys.extend(self.variables.iter().map(|(name, _)| name.as_str()));
        keys
    }

    pub fn get(&self, key: &str) -> Option<Series<'_>> {
        match key {
            TIME => Some(Series::Scalar(&self.time)),
            PACK_CURRENT => Some(Series::Scalar(&self.pack_current)),
            PACK_TERMINAL_VOLTAGE => Some(Series::Scalar(&self.pack_terminal_voltage)),
            CELL_CURRENT => Some(Series::PerCell(&self.cell_current)),
            name => self.variable(name).map(Series::PerCell),
        }
    }

    pub fn variable(&self, name: &str) -> Option<&Grid> {
        self.variables.iter().find(|(n, _)| n == name).map(|(_, grid)| grid)
    }
}

/// Everything one pack solve needs.
#[derive(Clone)]
pub struct PackProblem {
    pub netlist: Netlist,
    pub parameters: ParameterValues,
    pub protocol: Protocol,
    /// One value for every cell, or one per cell.
    pub htc: Vec<f64>,
    /// Extra output variables beyond terminal voltage and measured OCV.
    pub output_variables: Vec<String>,
    pub initial_soc: f64,
    /// `None` uses the lumped cell model.
    pub factory: Option<Arc<dyn CellModelFactory>>,
}

impl std::fmt::Debug for PackProblem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackProblem")
            .field("elements", &self.netlist.elements.len())
            .field("steps", &self.protocol.len())
            .field("period", &self.protocol.period)
            .field("htc", &self.htc)
            .field("output_variables", &self.output_variables)
            .field("initial_soc", &self.initial_soc)
            .field("custom_factory", &self.factory.is_some())
            .finish()
    }
}

impl PackProblem {
    pub fn new(netlist: Netlist, parameters: ParameterValues, protocol: Protocol) -> Self {
        Self {
            netlist,
            parameters,
            protocol,
            htc: vec![DEFAULT_HTC],
            output_variables: Vec::new(),
            initial_soc: DEFAULT_INITIAL_SOC,
            factory: None,
        }
    }

    pub fn with_htc(mut self, htc: Vec<f64>) -> Self {
        self.htc = htc;
        self
    }

    pub fn with_output_variables<S: Into<String>>(
        mut self,
        names: impl IntoIterator<Item = S>,
    ) -> Self {
        self.output_variables = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_initial_soc(mut self, soc: f64) -> Self {
        self.initial_soc = soc;
        self
    }

    pub fn with_factory(mut self, factory: Arc<dyn CellModelFactory>) -> Self {
        self.factory = Some(factory);
        self
    }
}

/// Orchestrator-owned state of one solve.
struct Run {
    netlist: Netlist,
    map: NetlistMap,
    setpoints: Vec<f64>,
    dt: f64,
    lower_cutoff: f64,
    upper_cutoff: f64,
    outputs: OutputBuffer,
    cell_current: Grid,
    time: Vec<f64>,
    pack_terminal_voltage: Vec<f64>,
    events: Vec<(usize, FiredEvent)>,
    stats: SolveStats,
}

/// Drives a worker pool through a pack solve.
pub struct PackSolver {
    pool: Box<dyn WorkerPool>,
    workers: usize,
    state: SolveState,
}

impl PackSolver {
    pub fn new(pool: Box<dyn WorkerPool>, workers: usize) -> Self {
        Self {
            pool,
            workers,
            state: SolveState::Idle,
        }
    }

    pub fn state(&self) -> SolveState {
        self.state
    }

    pub fn backend(&self) -> &'static str {
        self.pool.name()
    }

    /// Run `problem` to completion or cut-off.
    ///
    /// Failures before stepping return the error as is. Failures while
    /// stepping return [`PackError::SolveFailed`] carrying every step
    /// recorded so far. Workers are released on every path.
    pub fn solve(&mut self, problem: &PackProblem) -> Result<PackSolution> {
        let backend = self.pool.name();
        let _span = tracing::info_span!("pack_solve", backend, workers = self.workers).entered();
        self.state = SolveState::Initializing;
        let setup_start = Instant::now();
        let mut run = match self.initialize(problem) {
            Ok(run) => run,
            Err(e) => {
                self.state = SolveState::Failed;
                self.pool.teardown();
                return Err(e);
            }
        };
        run.stats.setup = setup_start.elapsed();

        self.state = SolveState::Stepping;
        tracing::info!(
            steps = run.setpoints.len(),
            cells = run.map.cell_count(),
            "starting step solve"
        );
        let stepping_start = Instant::now();
        let mut termination = Termination::Completed;
        for step in 0..run.setpoints.len() {
            match self.advance(&mut run, step) {
                Ok(None) => {}
                Ok(Some(stop)) => {
                    termination = stop;
                    break;
                }
                Err(e) => {
                    run.stats.stepping = stepping_start.elapsed();
                    tracing::error!(step, error = %e, "step failed; aborting solve");
                    let partial = self.finalize(run, Termination::Aborted { step });
                    self.state = SolveState::Failed;
                    return Err(PackError::SolveFailed {
                        step,
                        source: Box::new(e),
                        partial: Box::new(partial),
                    });
                }
            }
        }
        run.stats.stepping = stepping_start.elapsed();
        tracing::info!("step solve finished");

        let solution = self.finalize(run, termination);
        self.state = SolveState::Done;
        Ok(solution)
    }

    fn initialize(&mut self, problem: &PackProblem) -> Result<Run> {
        let map = problem.netlist.map()?;
        let cells = map.cell_count();
        let (lower_cutoff, upper_cutoff) = problem.parameters.voltage_cutoffs()?;
        let protocol = &problem.protocol;
        if protocol.is_empty() {
            return Err(PackError::Config("protocol has no steps".into()));
        }
        if !(protocol.period.is_finite() && protocol.period > 0.0) {
            return Err(PackError::Config(format!(
                "protocol period must be positive, got {}",
                protocol.period
            )));
        }
        let htc = broadcast_htc(&problem.htc, cells)?;
        let variable_names = output_variable_names(&problem.output_variables);

        // Cells start from the circuit solved under the first setpoint.
        let mut netlist = problem.netlist.clone();
        netlist.fill_values(&map.current_sources, protocol.currents[0]);
        let initial = solve_circuit(&netlist)?;
        let initial_current = initial.cell_currents();
        let mut cell_current = Grid::zeros(protocol.len(), cells);
        cell_current.row_mut(0).copy_from_slice(&initial_current);

        let workers = self.pool.partition(cells, self.workers, &htc)?.map.worker_count();
        self.pool.spawn_workers(&PoolSetup {
            model: ModelSpec {
                factory: problem.factory.clone(),
                parameters: Arc::new(problem.parameters.clone()),
                dt: protocol.period,
                variable_names: variable_names.clone().into(),
                initial_soc: problem.initial_soc,
            },
            initial_current,
        })?;
        tracing::info!(cells, workers, variables = variable_names.len(), "workers ready");

        Ok(Run {
            netlist,
            map,
            setpoints: protocol.currents.clone(),
            dt: protocol.period,
            lower_cutoff,
            upper_cutoff,
            outputs: OutputBuffer::new(variable_names, protocol.len(), cells),
            cell_current,
            time: Vec::with_capacity(protocol.len()),
            pack_terminal_voltage: Vec::with_capacity(protocol.len()),
            events: Vec::new(),
            stats: SolveStats {
                workers,
                cells,
                ..SolveStats::default()
            },
        })
    }

    /// Run step `step`. Returns the termination reason when a cut-off was
    /// breached.
    fn advance(&mut self, run: &mut Run, step: usize) -> Result<Option<Termination>> {
        let n_steps = run.setpoints.len();

        let t = Instant::now();
        let inputs = self.pool.build_inputs(run.cell_current.row(step))?;
        let fired = self.pool.step_all(&inputs)?;
        run.stats.worker_step += t.elapsed();
        if fired {
            run.stats.events_triggered += 1;
            let events = self.pool.fired_events().iter().cloned();
            run.events.extend(events.map(|event| (step, event)));
        }

        let t = Instant::now();
        self.pool.collect_outputs(&mut run.outputs, step)?;
        run.stats.collect += t.elapsed();

        let voltage = run.outputs.variable(0).row(step);
        let ocv = run.outputs.variable(1).row(step);
        let resistance: Vec<f64> = ocv
            .iter()
            .zip(voltage)
            .zip(run.cell_current.row(step))
            .map(|((&ocv, &v), &i)| internal_resistance(ocv, v, i))
            .collect();
        run.netlist.set_values(&run.map.voltage_sources, ocv);
        run.netlist.set_values(&run.map.internal_resistances, &resistance);
        run.netlist
            .fill_values(&run.map.current_sources, run.setpoints[(step + 1).min(n_steps - 1)]);

        let t = Instant::now();
        let solution = solve_circuit(&run.netlist)?;
        run.stats.circuit_solve += t.elapsed();

        run.time.push((step + 1) as f64 * run.dt);
        run.pack_terminal_voltage.push(solution.voltage(run.map.terminal_node));
        if step + 1 < n_steps {
            run.cell_current.row_mut(step + 1).copy_from_slice(&solution.cell_currents());
        }
        run.stats.steps_completed = step + 1;
        tracing::debug!(step, fired, "step complete");

        let voltage = run.outputs.variable(0).row(step);
        let (lower, upper) = (run.lower_cutoff, run.upper_cutoff);
        let below: Vec<usize> = (0..voltage.len()).filter(|&c| voltage[c] < lower).collect();
        if !below.is_empty() {
            tracing::info!(step, cells = ?below, cutoff = lower, "low voltage limit reached");
            return Ok(Some(Termination::LowerCutoff { step, cells: below }));
        }
        let above: Vec<usize> = (0..voltage.len()).filter(|&c| voltage[c] > upper).collect();
        if !above.is_empty() {
            tracing::info!(step, cells = ?above, cutoff = upper, "high voltage limit reached");
            return Ok(Some(Termination::UpperCutoff { step, cells: above }));
        }
        Ok(None)
    }

    /// Truncate to the completed steps, release the workers and assemble the
    /// result series.
    fn finalize(&mut self, run: Run, termination: Termination) -> PackSolution {
        self.state = SolveState::Finalizing;
        let Run {
            setpoints,
            mut outputs,
            mut cell_current,
            time,
            pack_terminal_voltage,
            events,
            mut stats,
            ..
        } = run;

        let t = Instant::now();
        self.pool.teardown();
        stats.teardown = t.elapsed();

        let completed = stats.steps_completed;
        outputs.truncate(completed);
        cell_current.truncate(completed);

        tracing::info!(
            "Total stepping time {:.3}s, time per step {:.3}s",
            stats.stepping.as_secs_f64(),
            stats.time_per_step().as_secs_f64()
        );

        PackSolution {
            time,
            pack_current: setpoints[..completed].to_vec(),
            pack_terminal_voltage,
            cell_current,
            variables: outputs.into_series(),
            events,
            termination,
            stats,
        }
    }
}

impl Drop for PackSolver {
    fn drop(&mut self) {
        self.pool.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_resistance_derivation() {
        assert!((internal_resistance(3.7, 3.6, 2.0) - 0.05).abs() < 1e-15);
        assert!((internal_resistance(3.7, 3.8, -2.0) - 0.05).abs() < 1e-15);
        assert_eq!(internal_resistance(3.7, 3.6, 0.0), RESISTANCE_FLOOR);
        assert_eq!(internal_resistance(3.7, 3.6, 9e-7), RESISTANCE_FLOOR);
        assert_eq!(internal_resistance(3.7, 3.6, -9e-7), RESISTANCE_FLOOR);
        assert!((internal_resistance(3.7, 3.6, 1e-6) - 1e5).abs() < 1e-6);
    }

    #[test]
    fn test_broadcast_htc() {
        assert_eq!(broadcast_htc(&[5.0], 3).unwrap(), vec![5.0; 3]);
        assert_eq!(broadcast_htc(&[1.0, 2.0], 2).unwrap(), vec![1.0, 2.0]);
        assert!(broadcast_htc(&[1.0, 2.0], 3).is_err());
        assert!(broadcast_htc(&[], 3).is_err());
    }

    #[test]
    fn test_solution_keys_and_lookup() {
        let solution = PackSolution {
            time: vec![1.0, 2.0],
            pack_current: vec![5.0, 5.0],
            pack_terminal_voltage: vec![3.6, 3.5],
            cell_current: Grid::zeros(2, 3),
            variables: vec![("Terminal voltage [V]".into(), Grid::zeros(2, 3))],
            events: Vec::new(),
            termination: Termination::Completed,
            stats: SolveStats::default(),
        };
        assert_eq!(solution.steps(), 2);
        assert_eq!(solution.keys()[4], "Terminal voltage [V]");
        assert!(matches!(solution.get(TIME), Some(Series::Scalar(t)) if t == [1.0, 2.0]));
        assert!(matches!(
            solution.get("Terminal voltage [V]"),
            Some(Series::PerCell(g)) if g.cols() == 3
        ));
        assert!(solution.get("State of charge").is_none());
    }
}
