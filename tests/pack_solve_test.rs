//! End-to-end tests for the pack co-simulation loop.

use std::sync::Arc;

use approx::assert_abs_diff_eq;
use packsim::buffer::{Grid, OutputBuffer};
use packsim::cell::model::{MEASURED_OCV, TERMINAL_VOLTAGE};
use packsim::cell::{
    default_parameters, output_variable_names, CellInputs, CellModel, FiredEvent, ModelSpec,
};
use packsim::error::{PackError, Result};
use packsim::netlist::setup_circuit;
use packsim::parameters::{ParameterValues, LOWER_CUTOFF};
use packsim::pool::{build_pool, Backend, LocalPool, PoolSetup, ProcessPool, WorkerPool};
use packsim::protocol::{generate_protocol, parse_step, Experiment, Protocol};
use packsim::solver::{
    PackProblem, PackSolution, PackSolver, SolveState, Termination, CELL_CURRENT,
};

/// Helper: `parallel`p`series`s pack with the default lumped cells.
fn pack_problem(parallel: usize, series: usize, protocol: Protocol) -> PackProblem {
    let netlist = setup_circuit(parallel, series, 1e-4, 1e-2, 2e-2, 3.7, 0.0).expect("netlist");
    PackProblem::new(netlist, default_parameters(), protocol)
}

/// Helper: empty pool. Process workers run the packsim binary, since a test
/// executable cannot serve as one.
fn pool(backend: Backend) -> Box<dyn WorkerPool> {
    match backend {
        Backend::Process => {
            Box::new(ProcessPool::new(None).with_program(env!("CARGO_BIN_EXE_packsim")))
        }
        other => build_pool(other, None),
    }
}

fn solve(backend: Backend, workers: usize, problem: &PackProblem) -> Result<PackSolution> {
    let mut solver = PackSolver::new(pool(backend), workers);
    solver.solve(problem)
}

fn assert_grids_close(a: &Grid, b: &Grid) {
    assert_eq!((a.rows(), a.cols()), (b.rows(), b.cols()));
    for (x, y) in a.as_slice().iter().zip(b.as_slice()) {
        assert_abs_diff_eq!(x, y, epsilon = 1e-12);
    }
}

/// Cell with a constant OCV whose behaviour is scripted by step count.
struct ScriptedCell {
    steps: usize,
    current: f64,
    /// OCV collapses once this many steps have run past it.
    drop_after: Option<usize>,
    /// Step call (0-based) that reports an integration failure.
    fail_at: Option<usize>,
}

impl ScriptedCell {
    fn ocv(&self) -> f64 {
        match self.drop_after {
            Some(n) if self.steps > n => 2.0,
            _ => 3.7,
        }
    }
}

impl CellModel for ScriptedCell {
    fn step(&mut self, inputs: &CellInputs, _dt: f64) -> Result<()> {
        if self.fail_at == Some(self.steps) {
            return Err(PackError::Integration("solver diverged".into()));
        }
        self.steps += 1;
        self.current = inputs.current;
        Ok(())
    }

    fn variable_index(&self, name: &str) -> Option<usize> {
        [TERMINAL_VOLTAGE, MEASURED_OCV].iter().position(|v| *v == name)
    }

    fn evaluate(&self, index: usize) -> f64 {
        match index {
            0 => self.ocv() - self.current * 0.05,
            _ => self.ocv(),
        }
    }

    fn event_names(&self) -> Vec<String> {
        Vec::new()
    }

    fn events(&self) -> Vec<f64> {
        Vec::new()
    }
}

fn scripted_problem(drop_after: Option<usize>, fail_at: Option<usize>) -> PackProblem {
    let netlist = setup_circuit(2, 2, 1e-4, 1e-2, 5e-2, 3.7, 0.0).expect("netlist");
    let factory = move |_: &ParameterValues,
                        _: f64,
                        inputs: &CellInputs|
          -> Result<Box<dyn CellModel>> {
        Ok(Box::new(ScriptedCell {
            steps: 0,
            current: inputs.current,
            drop_after,
            fail_at,
        }))
    };
    PackProblem::new(netlist, default_parameters(), Protocol::constant(1.0, 10, 1.0))
        .with_factory(Arc::new(factory))
}

// ── Full solves ───────────────────────────────────────────────────

#[test]
fn test_discharge_completes_and_balances_currents() {
    let experiment =
        Experiment::new(10.0, vec![parse_step("Discharge at 8 A for 100 s").unwrap()]).unwrap();
    let problem = pack_problem(2, 2, generate_protocol(&experiment).unwrap())
        .with_output_variables(["State of charge"]);
    let solution = solve(Backend::Local, 1, &problem).unwrap();

    assert_eq!(solution.termination, Termination::Completed);
    assert_eq!(solution.steps(), 10);
    assert_abs_diff_eq!(solution.time[9], 100.0, epsilon = 1e-12);
    assert_eq!(solution.pack_current, vec![8.0; 10]);
    assert_eq!(solution.cell_current.rows(), 10);

    // Each series group carries the full pack current.
    for step in 0..10 {
        let row = solution.cell_current.row(step);
        assert_abs_diff_eq!(row[0] + row[1], 8.0, epsilon = 1e-6);
        assert_abs_diff_eq!(row[2] + row[3], 8.0, epsilon = 1e-6);
    }

    let soc = solution.variable("State of charge").unwrap();
    assert!(soc.get(9, 0) < soc.get(0, 0));
    assert!(soc.get(0, 0) < 0.5);

    let v_pack = &solution.pack_terminal_voltage;
    assert_eq!(v_pack.len(), 10);
    assert!(v_pack.iter().all(|&v| v > 5.0 && v < 8.4));
    assert!(v_pack[9] < v_pack[0]);
}

#[test]
fn test_single_cell_current_follows_protocol() {
    let protocol = Protocol {
        period: 5.0,
        currents: vec![2.0, 2.0, -1.0, 0.5, 3.0],
    };
    let solution = solve(Backend::Local, 1, &pack_problem(1, 1, protocol.clone())).unwrap();
    assert_eq!(solution.steps(), 5);
    for step in 0..5 {
        assert_abs_diff_eq!(
            solution.cell_current.get(step, 0),
            protocol.currents[step],
            epsilon = 1e-9
        );
    }
}

#[test]
fn test_upper_cutoff_stops_charge() {
    let problem = pack_problem(2, 1, Protocol::constant(-40.0, 10, 10.0)).with_initial_soc(0.99);
    let solution = solve(Backend::Threaded, 2, &problem).unwrap();
    assert_eq!(
        solution.termination,
        Termination::UpperCutoff {
            step: 0,
            cells: vec![0, 1]
        }
    );
    assert_eq!(solution.steps(), 1);
}

#[test]
fn test_cutoff_step_reports_cell_events() {
    // Light load arms the detectors, then a heavy pulse crosses the cut-off.
    let protocol = Protocol {
        period: 10.0,
        currents: vec![2.0, 2.0, 40.0, 40.0],
    };
    let mut problem = pack_problem(2, 1, protocol);
    problem.parameters = default_parameters().with(LOWER_CUTOFF, 3.6);

    for backend in [Backend::Threaded, Backend::Process] {
        let solution = solve(backend, 2, &problem).unwrap();
        assert_eq!(
            solution.termination,
            Termination::LowerCutoff {
                step: 2,
                cells: vec![0, 1]
            },
            "{backend}"
        );
        let minimum = |cell| FiredEvent {
            name: "Minimum voltage [V]".into(),
            cells: vec![cell],
        };
        assert_eq!(solution.events, vec![(2, minimum(0)), (2, minimum(1))], "{backend}");
        assert_eq!(solution.stats.events_triggered, 1);
    }
}

// ── Termination and failure ───────────────────────────────────────

#[test]
fn test_lower_cutoff_truncates_buffers() {
    let problem = scripted_problem(Some(6), None);
    let solution = solve(Backend::Local, 1, &problem).unwrap();

    assert_eq!(
        solution.termination,
        Termination::LowerCutoff {
            step: 6,
            cells: vec![0, 1, 2, 3]
        }
    );
    assert_eq!(solution.steps(), 7);
    assert_eq!(solution.pack_current.len(), 7);
    assert_eq!(solution.pack_terminal_voltage.len(), 7);
    assert_eq!(solution.cell_current.rows(), 7);
    for (_, grid) in &solution.variables {
        assert_eq!(grid.rows(), 7);
    }
    let voltage = solution.variable(TERMINAL_VOLTAGE).unwrap();
    assert!(voltage.row(5).iter().all(|&v| v > 3.0));
    assert!(voltage.row(6).iter().all(|&v| v < 2.5));
}

#[test]
fn test_integration_failure_returns_partial_results() {
    for (backend, workers) in [(Backend::Local, 1), (Backend::Threaded, 2), (Backend::Actor, 2)] {
        let mut solver = PackSolver::new(pool(backend), workers);
        let err = solver.solve(&scripted_problem(None, Some(3))).unwrap_err();
        assert_eq!(solver.state(), SolveState::Failed);
        match err {
            PackError::SolveFailed { step, source, partial } => {
                assert_eq!(step, 3);
                assert!(matches!(*source, PackError::Worker { .. }), "{source}");
                assert!(source.to_string().contains("solver diverged"));
                assert_eq!(partial.steps(), 3);
                assert_eq!(partial.termination, Termination::Aborted { step: 3 });
                assert_eq!(partial.variables[0].1.rows(), 3);
            }
            other => panic!("{backend}: unexpected error {other}"),
        }
    }
}

#[test]
fn test_configuration_errors_fail_before_stepping() {
    let problem = pack_problem(2, 2, Protocol::constant(1.0, 4, 1.0));

    let mut solver = PackSolver::new(build_pool(Backend::Threaded, None), 5);
    assert!(matches!(solver.solve(&problem), Err(PackError::Config(_))));
    assert_eq!(solver.state(), SolveState::Failed);

    let unknown = problem.clone().with_output_variables(["Electrolyte concentration [mol.m-3]"]);
    let err = solve(Backend::Actor, 2, &unknown).unwrap_err();
    assert!(matches!(err, PackError::Worker { .. }), "{err}");

    let bad_htc = problem.clone().with_htc(vec![1.0, 2.0]);
    assert!(matches!(solve(Backend::Local, 1, &bad_htc), Err(PackError::Config(_))));

    let inverted = PackProblem {
        parameters: default_parameters().with(LOWER_CUTOFF, 5.0),
        ..problem
    };
    assert!(matches!(solve(Backend::Local, 1, &inverted), Err(PackError::Config(_))));
}

#[test]
fn test_process_backend_rejects_custom_model() {
    let mut solver = PackSolver::new(pool(Backend::Process), 2);
    let err = solver.solve(&scripted_problem(None, None)).unwrap_err();
    assert!(matches!(err, PackError::Config(ref m) if m.contains("custom")), "{err}");
    assert_eq!(solver.state(), SolveState::Failed);
}

// ── Backends ──────────────────────────────────────────────────────

#[test]
fn test_backends_agree() {
    let experiment = Experiment::new(
        10.0,
        vec![
            parse_step("Discharge at 20 A for 2 minutes").unwrap(),
            parse_step("Rest for 1 minute").unwrap(),
            parse_step("Charge at 10 A for 1 minute").unwrap(),
        ],
    )
    .unwrap();
    let htc: Vec<f64> = (0..8).map(|i| 5.0 + i as f64).collect();
    let problem = pack_problem(4, 2, generate_protocol(&experiment).unwrap())
        .with_htc(htc)
        .with_output_variables(["Volume-averaged cell temperature [K]", "State of charge"]);

    let reference = solve(Backend::Local, 1, &problem).unwrap();
    assert_eq!(reference.steps(), 24);

    for (backend, workers) in [
        (Backend::Local, 3),
        (Backend::Threaded, 3),
        (Backend::Actor, 4),
        (Backend::Actor, 8),
        (Backend::Process, 2),
        (Backend::Process, 3),
    ] {
        let other = solve(backend, workers, &problem).unwrap();
        assert_eq!(other.keys(), reference.keys());
        assert_eq!(other.termination, reference.termination);
        assert_eq!(other.time, reference.time);
        for (a, b) in other.pack_terminal_voltage.iter().zip(&reference.pack_terminal_voltage) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        }
        assert_grids_close(&other.cell_current, &reference.cell_current);
        for ((name, a), (_, b)) in other.variables.iter().zip(&reference.variables) {
            assert!(a.rows() == b.rows(), "{backend}/{workers}: {name}");
            assert_grids_close(a, b);
        }
    }
}

#[test]
fn test_repeated_solves_are_identical() {
    let problem = pack_problem(3, 2, Protocol::constant(6.0, 15, 10.0))
        .with_htc(vec![8.0, 9.0, 10.0, 11.0, 12.0, 13.0]);
    let mut solver = PackSolver::new(build_pool(Backend::Threaded, None), 2);
    let first = solver.solve(&problem).unwrap();
    assert_eq!(solver.state(), SolveState::Done);
    let second = solver.solve(&problem).unwrap();

    assert_eq!(first.time, second.time);
    assert_eq!(first.pack_current, second.pack_current);
    assert_eq!(first.pack_terminal_voltage, second.pack_terminal_voltage);
    assert_eq!(first.cell_current, second.cell_current);
    assert_eq!(first.variables, second.variables);
    assert!(first.get(CELL_CURRENT).is_some());
}

#[test]
fn test_single_worker_step_and_collect() {
    let mut pool = LocalPool::new();
    pool.partition(4, 1, &[10.0; 4]).unwrap();
    let names = output_variable_names::<&str>(&[]);
    pool.spawn_workers(&PoolSetup {
        model: ModelSpec {
            factory: None,
            parameters: Arc::new(default_parameters()),
            dt: 10.0,
            variable_names: names.clone().into(),
            initial_soc: 0.5,
        },
        initial_current: vec![1.0; 4],
    })
    .unwrap();

    let inputs = pool.build_inputs(&[1.0, 2.0, 3.0, 4.0]).unwrap();
    pool.step_all(&inputs).unwrap();
    let mut buffer = OutputBuffer::new(names, 5, 4);
    pool.collect_outputs(&mut buffer, 0).unwrap();

    for var in 0..2 {
        let grid = buffer.variable(var);
        assert!(grid.row(0).iter().all(|&v| v != 0.0));
        for step in 1..5 {
            assert!(grid.row(step).iter().all(|&v| v == 0.0));
        }
    }
    pool.teardown();
}
