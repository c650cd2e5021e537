//! Run configuration through to a solved pack, as the CLI does it.

use std::path::PathBuf;

use approx::assert_abs_diff_eq;
use packsim::config::RunConfig;
use packsim::netlist;
use packsim::output;
use packsim::solver::{SolveState, Termination, PACK_TERMINAL_VOLTAGE};

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("packsim-{}-{}", name, std::process::id()));
    std::fs::create_dir_all(&dir).expect("create scratch dir");
    dir
}

#[test]
fn test_netlist_file_roundtrip_and_solve() {
    let dir = scratch_dir("netlist");
    let pack = netlist::setup_circuit(2, 3, 1e-4, 1e-2, 3e-2, 3.7, 0.0).unwrap();
    let mut file = std::fs::File::create(dir.join("pack.cir")).unwrap();
    netlist::write(&pack, &mut file).unwrap();

    let config_text = r#"
[solver]
backend = "actor"
workers = 3
output_variables = ["State of charge", "Current [A]"]
step_timeout_secs = 30.0

[experiment]
period = 30.0
steps = ["Discharge at 6 A for 5 minutes"]

[circuit]
netlist = "pack.cir"
"#;
    std::fs::write(dir.join("run.toml"), config_text).unwrap();

    let config = RunConfig::load(&dir.join("run.toml")).unwrap();
    let loaded = config.netlist(&dir).unwrap();
    assert_eq!(loaded.elements.len(), pack.elements.len());
    assert_eq!(loaded.map().unwrap(), pack.map().unwrap());

    let problem = config.problem(loaded, &dir).unwrap();
    let mut solver = config.build_solver();
    assert_eq!(solver.backend(), "actor");
    let solution = solver.solve(&problem).unwrap();
    assert_eq!(solver.state(), SolveState::Done);
    assert_eq!(solution.termination, Termination::Completed);
    assert_eq!(solution.steps(), 10);

    // The model's own current output matches what the circuit applied.
    let applied = solution.variable("Current [A]").unwrap();
    for step in 0..solution.steps() {
        for cell in 0..6 {
            assert_abs_diff_eq!(
                applied.get(step, cell),
                solution.cell_current.get(step, cell),
                epsilon = 1e-12
            );
        }
    }

    let mut csv = Vec::new();
    output::write_csv(&solution, &mut csv).unwrap();
    let text = String::from_utf8(csv).unwrap();
    assert_eq!(text.lines().count(), 11);
    let header = text.lines().next().unwrap();
    assert!(header.contains(PACK_TERMINAL_VOLTAGE));
    assert!(header.contains("State of charge[5]"));

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_pack_topology_config() {
    let config = RunConfig::from_toml(
        r#"
[solver]
backend = "local"
workers = 2
htc = 20.0

[parameters]
"Lower voltage cut-off [V]" = 3.65

[experiment]
period = 10.0
steps = ["Discharge at 40 A for 10 minutes"]

[circuit]
parallel = 2
series = 1
internal_resistance = 0.02
"#,
    )
    .unwrap();
    let here = PathBuf::from(".");
    let netlist = config.netlist(&here).unwrap();
    let problem = config.problem(netlist, &here).unwrap();
    assert_eq!(problem.protocol.len(), 60);

    let solution = config.build_solver().solve(&problem).unwrap();
    match solution.termination {
        Termination::LowerCutoff { step, ref cells } => {
            assert!(step < 59);
            assert!(!cells.is_empty());
            assert_eq!(solution.steps(), step + 1);
        }
        ref other => panic!("expected lower cut-off, got {other:?}"),
    }
}

#[test]
fn test_unsupported_experiment_step() {
    let config = RunConfig::from_toml(
        r#"
[experiment]
period = 10.0
steps = ["Hold at 4.2 V for 10 minutes"]

[circuit]
parallel = 1
series = 1
"#,
    )
    .unwrap();
    let here = PathBuf::from(".");
    let netlist = config.netlist(&here).unwrap();
    assert!(config.problem(netlist, &here).is_err());
}

#[test]
fn test_drive_cycle_profile_solve() {
    let dir = scratch_dir("profile");
    // Ramp to 8 A over a minute, hold, then a short charge pulse.
    std::fs::write(
        dir.join("cycle.csv"),
        "Time [s],Current [A]\n0,0\n60,8\n120,8\n130,-4\n150,-4\n",
    )
    .unwrap();
    std::fs::write(
        dir.join("run.toml"),
        r#"
[solver]
backend = "threaded"
workers = 2

[experiment]
period = 10.0
profile = "cycle.csv"

[circuit]
parallel = 2
series = 2
"#,
    )
    .unwrap();

    let config = RunConfig::load(&dir.join("run.toml")).unwrap();
    let problem = config.problem(config.netlist(&dir).unwrap(), &dir).unwrap();
    assert_eq!(problem.protocol.len(), 15);
    assert_abs_diff_eq!(problem.protocol.currents[3], 4.0, epsilon = 1e-12);
    assert_abs_diff_eq!(problem.protocol.currents[13], -4.0, epsilon = 1e-12);

    let solution = config.build_solver().solve(&problem).unwrap();
    assert_eq!(solution.termination, Termination::Completed);
    assert_eq!(solution.steps(), 15);
    // Two parallel strings share the pack current.
    let cell_sum = solution.cell_current.get(6, 0) + solution.cell_current.get(6, 1);
    assert_abs_diff_eq!(cell_sum, 8.0, epsilon = 1e-6);

    std::fs::remove_dir_all(&dir).ok();
}
