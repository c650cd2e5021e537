use clap::{Parser, Subcommand};
use packsim::config::RunConfig;
use packsim::error::PackError;
use packsim::netlist;
use packsim::output;
use packsim::pool::process;
use std::io;
use std::path::{Path, PathBuf};

/// Battery pack co-simulation: circuit solve coupled to per-cell models
#[derive(Parser)]
#[command(
    name = "packsim",
    version,
    args_conflicts_with_subcommands = true,
    subcommand_negates_reqs = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// TOML run configuration
    #[arg(required = true)]
    config: Option<PathBuf>,

    /// Netlist file to use instead of the configured circuit
    #[arg(long)]
    netlist: Option<PathBuf>,

    /// Write the pack netlist to this path before solving
    #[arg(long)]
    write_netlist: Option<PathBuf>,

    /// Print performance stats to stderr
    #[arg(long)]
    stats: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Serve one cell worker over stdin/stdout for the process backend
    #[command(name = process::WORKER_COMMAND, hide = true)]
    Worker,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Some(Command::Worker) = cli.command {
        let stdout = io::BufWriter::new(io::stdout().lock());
        if let Err(e) = process::serve(io::stdin().lock(), stdout) {
            eprintln!("Worker error: {}", e);
            std::process::exit(1);
        }
        return;
    }

    let config_path = cli.config.unwrap_or_else(|| {
        eprintln!("Missing run configuration");
        std::process::exit(2);
    });
    let config = RunConfig::load(&config_path).unwrap_or_else(|e| {
        eprintln!("Error reading {}: {}", config_path.display(), e);
        std::process::exit(1);
    });
    let base_dir = config_path.parent().unwrap_or(Path::new("."));

    let pack = match &cli.netlist {
        Some(path) => std::fs::read_to_string(path)
            .map_err(PackError::from)
            .and_then(|text| netlist::parse(&text)),
        None => config.netlist(base_dir),
    }
    .unwrap_or_else(|e| {
        eprintln!("Netlist error: {}", e);
        std::process::exit(1);
    });

    if let Some(path) = &cli.write_netlist {
        let written = std::fs::File::create(path)
            .map_err(PackError::from)
            .and_then(|mut file| netlist::write(&pack, &mut file));
        if let Err(e) = written {
            eprintln!("Error writing {}: {}", path.display(), e);
            std::process::exit(1);
        }
    }

    let problem = config.problem(pack, base_dir).unwrap_or_else(|e| {
        eprintln!("Experiment error: {}", e);
        std::process::exit(1);
    });

    let mut solver = config.build_solver();
    let solution = match solver.solve(&problem) {
        Ok(solution) => solution,
        Err(PackError::SolveFailed { step, source, partial }) => {
            eprintln!("Solve failed at step {}: {}", step, source);
            eprintln!("Writing {} completed steps", partial.steps());
            *partial
        }
        Err(e) => {
            eprintln!("Solve error: {}", e);
            std::process::exit(1);
        }
    };
    let failed = solver.state() == packsim::solver::SolveState::Failed;

    let mut stdout = io::stdout();
    output::write_csv(&solution, &mut stdout).unwrap_or_else(|e| {
        eprintln!("Output error: {}", e);
        std::process::exit(1);
    });

    if cli.stats {
        solution.stats.display();
    }
    if failed {
        std::process::exit(1);
    }
}
